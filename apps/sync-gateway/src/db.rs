use anyhow::{Context, Result};
use deadpool_postgres::{Manager, ManagerConfig, Object, Pool, PoolError, RecyclingMethod};
use tokio_postgres::NoTls;

const SCHEMA_SQL: &str = r#"
CREATE SCHEMA IF NOT EXISTS sync_gateway;

CREATE TABLE IF NOT EXISTS sync_gateway.clients (
  client_id     VARCHAR(10) PRIMARY KEY,
  access_token  VARCHAR(64) NOT NULL,
  db_name       TEXT NOT NULL,
  db_user       TEXT NOT NULL,
  db_password   TEXT NOT NULL,
  name          TEXT NOT NULL,
  address       TEXT NOT NULL,
  phone         TEXT NOT NULL,
  username      TEXT NOT NULL,
  password      TEXT NOT NULL,
  created_at    TIMESTAMPTZ NOT NULL,
  updated_at    TIMESTAMPTZ NOT NULL
);

CREATE TABLE IF NOT EXISTS sync_gateway.master_rows (
  client_id   VARCHAR(10) NOT NULL REFERENCES sync_gateway.clients (client_id),
  code        VARCHAR(64) NOT NULL,
  name        VARCHAR(255),
  address     VARCHAR(255),
  place       VARCHAR(255),
  super_code  VARCHAR(255),
  PRIMARY KEY (client_id, code)
);

CREATE TABLE IF NOT EXISTS sync_gateway.credential_rows (
  client_id  VARCHAR(10) NOT NULL REFERENCES sync_gateway.clients (client_id),
  user_id    VARCHAR(64) NOT NULL,
  pass       VARCHAR(255) NOT NULL,
  PRIMARY KEY (client_id, user_id)
);

CREATE TABLE IF NOT EXISTS sync_gateway.sync_logs (
  id            BIGSERIAL PRIMARY KEY,
  client_id     VARCHAR(10) NOT NULL REFERENCES sync_gateway.clients (client_id),
  logged_at     TIMESTAMPTZ NOT NULL DEFAULT now(),
  record_count  BIGINT NOT NULL,
  status        VARCHAR(16) NOT NULL CHECK (status IN ('SUCCESS', 'PARTIAL', 'FAILED')),
  message       TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS sync_logs_client_idx
  ON sync_gateway.sync_logs (client_id, id DESC);

CREATE TABLE IF NOT EXISTS sync_gateway.admins (
  admin_id                TEXT PRIMARY KEY,
  username                TEXT NOT NULL UNIQUE,
  password_hash           TEXT NOT NULL,
  salt                    TEXT NOT NULL,
  current_session_sha256  TEXT
);
"#;

/// Pooled PostgreSQL access. A checkout hands out an idle connection, opening
/// a new one up to `max_size`; closed connections are replaced on recycle.
#[derive(Clone)]
pub struct GatewayDb {
    pool: Pool,
}

impl GatewayDb {
    pub async fn connect(database_url: &str, connections: usize) -> Result<Self> {
        let pg_config = database_url
            .parse::<tokio_postgres::Config>()
            .context("parse postgres connection url")?;
        let manager = Manager::from_config(
            pg_config,
            NoTls,
            ManagerConfig {
                recycling_method: RecyclingMethod::Fast,
            },
        );
        let pool = Pool::builder(manager)
            .max_size(connections.max(1))
            .build()
            .context("build postgres pool")?;

        // Fail at startup rather than on the first request.
        drop(pool.get().await.context("connect to postgres")?);
        tracing::info!(max_size = connections.max(1), "sync gateway postgres pool ready");
        Ok(Self { pool })
    }

    pub async fn client(&self) -> Result<Object, PoolError> {
        self.pool.get().await
    }

    pub async fn ensure_schema(&self) -> Result<()> {
        self.client()
            .await
            .context("check out connection for schema")?
            .batch_execute(SCHEMA_SQL)
            .await
            .context("apply sync gateway schema")?;
        Ok(())
    }
}
