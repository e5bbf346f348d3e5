use std::{sync::Arc, time::Duration};

use axum::{
    Extension, Json, Router,
    extract::{DefaultBodyLimit, Path, Query, State, rejection::JsonRejection},
    http::{HeaderValue, Method, StatusCode, header},
    middleware,
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower::ServiceBuilder;
use tower_http::{
    compression::CompressionLayer,
    cors::{AllowOrigin, Any, CorsLayer},
    limit::RequestBodyLimitLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use crate::{
    audit::{AuditError, AuditLog, LogFilter},
    config::Config,
    credentials::{CredentialGenerator, RandomCredentials},
    registry::{ClientRegistry, RegistryError},
    session::{AdminIdentity, SessionError, SessionVerifier},
    store::GatewayStore,
    sync::{LogReport, SyncEngine, SyncError, SyncSummary, SyncUpload},
    types::{ClientConfigBundle, ClientFields, ClientSummary, IssuedCredentials, SyncLogEntry},
};

mod gates;

use gates::{SessionToken, ThrottleState};

pub const SESSION_COOKIE_NAME: &str = "admin_session";

#[derive(Clone)]
pub struct AppState {
    config: Config,
    store: Arc<dyn GatewayStore>,
    store_driver: &'static str,
    registry: Arc<ClientRegistry>,
    sessions: Arc<SessionVerifier>,
    sync: Arc<SyncEngine>,
    audit: Arc<AuditLog>,
    throttle: ThrottleState,
    started_at: DateTime<Utc>,
}

impl AppState {
    #[must_use]
    pub fn new(config: Config, store: Arc<dyn GatewayStore>, store_driver: &'static str) -> Self {
        Self::with_generator(config, store, store_driver, Arc::new(RandomCredentials))
    }

    #[must_use]
    pub fn with_generator(
        config: Config,
        store: Arc<dyn GatewayStore>,
        store_driver: &'static str,
        generator: Arc<dyn CredentialGenerator>,
    ) -> Self {
        let audit = AuditLog::new(store.clone());
        Self {
            registry: Arc::new(ClientRegistry::new(
                store.clone(),
                generator,
                config.public_api_url.clone(),
            )),
            sessions: Arc::new(SessionVerifier::new(
                store.clone(),
                &config.session_signing_key,
                config.session_ttl_seconds,
            )),
            sync: Arc::new(SyncEngine::new(store.clone(), audit.clone())),
            audit: Arc::new(audit),
            throttle: ThrottleState::default(),
            started_at: Utc::now(),
            store,
            store_driver,
            config,
        }
    }

    #[must_use]
    pub fn sessions(&self) -> Arc<SessionVerifier> {
        self.sessions.clone()
    }
}

pub fn build_router(state: AppState) -> Router {
    let login = Router::new()
        .route("/admin/login", post(admin_login))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            gates::login_throttle_gate,
        ));

    let admin = Router::new()
        .route("/admin/logout", post(admin_logout))
        .route("/admin/me", get(admin_me))
        .route("/admin/list-users", get(list_clients))
        .route("/admin/add-users", post(create_client))
        .route("/admin/update-users/:client_id", put(update_client))
        .route("/admin/delete-users/:client_id", delete(delete_client))
        .route("/admin/users/:client_id/config", get(client_config))
        .route("/admin/logs", get(list_logs))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            gates::admin_session_gate,
        ));

    let sync = Router::new()
        .route("/sync/data", post(sync_data))
        .route("/sync/log", post(sync_log))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            gates::sync_throttle_gate,
        ));

    let cors = cors_layer(&state.config.cors_allowed_origins);
    let timeout = Duration::from_secs(state.config.request_timeout_seconds);
    let max_body_bytes = state.config.max_body_bytes;

    Router::new()
        .route("/healthz", get(health))
        .route("/readyz", get(readiness))
        .merge(login)
        .merge(admin)
        .merge(sync)
        .with_state(state)
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(max_body_bytes))
        .layer(TimeoutLayer::new(timeout))
        .layer(CompressionLayer::new())
        .layer(cors)
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                .layer(PropagateRequestIdLayer::x_request_id())
                .layer(TraceLayer::new_for_http()),
        )
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    if allowed_origins.is_empty() {
        return CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
    }
    let origins = allowed_origins
        .iter()
        .filter_map(|origin| HeaderValue::from_str(origin).ok())
        .collect::<Vec<_>>();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_credentials(true)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    service: String,
    build_sha: String,
    uptime_seconds: i64,
    store: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ReadinessResponse {
    status: &'static str,
    store: &'static str,
    store_ready: bool,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let uptime_seconds = (Utc::now() - state.started_at).num_seconds();
    Json(HealthResponse {
        status: "ok",
        service: state.config.service_name,
        build_sha: state.config.build_sha,
        uptime_seconds,
        store: state.store_driver,
    })
}

async fn readiness(State(state): State<AppState>) -> impl IntoResponse {
    let store_ready = match state.store.ping().await {
        Ok(()) => true,
        Err(error) => {
            tracing::warn!(reason = %error, "readiness probe failed");
            false
        }
    };
    let status = if store_ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(ReadinessResponse {
            status: if store_ready { "ready" } else { "not_ready" },
            store: state.store_driver,
            store_ready,
        }),
    )
}

#[derive(Debug, Default, Deserialize)]
struct LoginBody {
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LoginResponse {
    admin: AdminIdentity,
    expires_at: DateTime<Utc>,
}

async fn admin_login(
    State(state): State<AppState>,
    body: Result<Json<LoginBody>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(body) = body.map_err(ApiError::from_json_rejection)?;
    if body.username.trim().is_empty() || body.password.is_empty() {
        return Err(ApiError::InvalidRequest(
            "username and password are required".to_string(),
        ));
    }

    let session = state
        .sessions
        .login(&body.username, &body.password)
        .await
        .map_err(ApiError::from_session)?;
    let cookie = session_cookie(
        &session.token,
        state.sessions.ttl_seconds(),
        state.config.session_cookie_secure,
    );
    let expires_at = session.identity.expires_at;
    let mut response = Json(LoginResponse {
        admin: session.identity,
        expires_at,
    })
    .into_response();
    append_set_cookie_header(&mut response, &cookie)?;
    Ok(response)
}

async fn admin_logout(
    State(state): State<AppState>,
    Extension(token): Extension<SessionToken>,
) -> Result<Response, ApiError> {
    state
        .sessions
        .logout(&token.0)
        .await
        .map_err(ApiError::from_session)?;
    let mut response = Json(json!({ "success": true })).into_response();
    append_set_cookie_header(&mut response, &clear_cookie(SESSION_COOKIE_NAME))?;
    Ok(response)
}

async fn admin_me(Extension(identity): Extension<AdminIdentity>) -> Json<AdminIdentity> {
    Json(identity)
}

#[derive(Debug, Serialize)]
struct ClientListResponse {
    clients: Vec<ClientSummary>,
}

async fn list_clients(State(state): State<AppState>) -> Result<Json<ClientListResponse>, ApiError> {
    let clients = state
        .registry
        .list_clients()
        .await
        .map_err(ApiError::from_registry)?;
    Ok(Json(ClientListResponse { clients }))
}

async fn create_client(
    State(state): State<AppState>,
    Extension(identity): Extension<AdminIdentity>,
    body: Result<Json<ClientFields>, JsonRejection>,
) -> Result<(StatusCode, Json<IssuedCredentials>), ApiError> {
    let Json(fields) = body.map_err(ApiError::from_json_rejection)?;
    let issued = state
        .registry
        .create_client(fields)
        .await
        .map_err(ApiError::from_registry)?;
    tracing::info!(admin_id = %identity.admin_id, client_id = %issued.client_id, "admin created client");
    Ok((StatusCode::CREATED, Json(issued)))
}

async fn update_client(
    State(state): State<AppState>,
    Extension(identity): Extension<AdminIdentity>,
    Path(client_id): Path<String>,
    body: Result<Json<ClientFields>, JsonRejection>,
) -> Result<Json<IssuedCredentials>, ApiError> {
    let Json(fields) = body.map_err(ApiError::from_json_rejection)?;
    let issued = state
        .registry
        .update_client(&client_id, fields)
        .await
        .map_err(ApiError::from_registry)?;
    tracing::info!(admin_id = %identity.admin_id, client_id = %issued.client_id, "admin updated client");
    Ok(Json(issued))
}

async fn delete_client(
    State(state): State<AppState>,
    Extension(identity): Extension<AdminIdentity>,
    Path(client_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state
        .registry
        .delete_client(&client_id)
        .await
        .map_err(ApiError::from_registry)?;
    tracing::info!(admin_id = %identity.admin_id, client_id = %client_id, "admin deleted client");
    Ok(Json(json!({ "success": true })))
}

async fn client_config(
    State(state): State<AppState>,
    Path(client_id): Path<String>,
) -> Result<Json<ClientConfigBundle>, ApiError> {
    let bundle = state
        .registry
        .client_config(&client_id)
        .await
        .map_err(ApiError::from_registry)?;
    Ok(Json(bundle))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LogsQuery {
    #[serde(default)]
    client_id: Option<String>,
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
struct LogListResponse {
    logs: Vec<SyncLogEntry>,
}

async fn list_logs(
    State(state): State<AppState>,
    Query(query): Query<LogsQuery>,
) -> Result<Json<LogListResponse>, ApiError> {
    let logs = state
        .audit
        .list(&LogFilter {
            client_id: query.client_id,
            limit: query.limit,
        })
        .await
        .map_err(ApiError::from_audit)?;
    Ok(Json(LogListResponse { logs }))
}

async fn sync_data(
    State(state): State<AppState>,
    body: Result<Json<SyncUpload>, JsonRejection>,
) -> Result<Json<SyncSummary>, ApiError> {
    let Json(upload) = body.map_err(ApiError::from_json_rejection)?;
    let summary = state
        .sync
        .sync_data(upload)
        .await
        .map_err(ApiError::from_sync)?;
    Ok(Json(summary))
}

async fn sync_log(
    State(state): State<AppState>,
    body: Result<Json<LogReport>, JsonRejection>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let Json(report) = body.map_err(ApiError::from_json_rejection)?;
    let entry = state
        .sync
        .record_log(report)
        .await
        .map_err(ApiError::from_sync)?;
    Ok(Json(json!({ "success": true, "id": entry.id })))
}

fn session_cookie(token: &str, max_age_seconds: u64, secure: bool) -> String {
    let secure = if secure { "; Secure" } else { "" };
    format!(
        "{SESSION_COOKIE_NAME}={token}; Path=/; HttpOnly; SameSite=Lax; Max-Age={max_age_seconds}{secure}"
    )
}

fn clear_cookie(name: &str) -> String {
    format!("{name}=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0")
}

fn append_set_cookie_header(response: &mut Response, cookie: &str) -> Result<(), ApiError> {
    let value = HeaderValue::from_str(cookie)
        .map_err(|error| ApiError::Internal(format!("invalid cookie header: {error}")))?;
    response.headers_mut().append(header::SET_COOKIE, value);
    Ok(())
}

#[derive(Debug)]
enum ApiError {
    InvalidRequest(String),
    Unauthorized,
    Unauthenticated,
    SessionInvalidated,
    InvalidCredentials,
    NotFound(String),
    IdentifierCollision,
    RateLimited { retry_after_seconds: i64 },
    SyncFailed,
    Internal(String),
}

impl ApiError {
    fn from_json_rejection(rejection: JsonRejection) -> Self {
        Self::InvalidRequest(rejection.body_text())
    }

    fn from_registry(error: RegistryError) -> Self {
        match error {
            RegistryError::Validation(message) => Self::InvalidRequest(message),
            RegistryError::NotFound => Self::NotFound("client not found".to_string()),
            RegistryError::IdentifierCollision => Self::IdentifierCollision,
            RegistryError::Storage(message) => Self::Internal(message),
        }
    }

    fn from_session(error: SessionError) -> Self {
        match error {
            SessionError::InvalidCredentials => Self::InvalidCredentials,
            SessionError::Unauthenticated => Self::Unauthenticated,
            SessionError::SessionInvalidated => Self::SessionInvalidated,
            SessionError::Storage(message) => Self::Internal(message),
        }
    }

    fn from_sync(error: SyncError) -> Self {
        match error {
            SyncError::BadRequest(message) => Self::InvalidRequest(message),
            SyncError::Unauthorized => Self::Unauthorized,
            SyncError::Internal(_) => Self::SyncFailed,
        }
    }

    fn from_audit(error: AuditError) -> Self {
        match error {
            AuditError::UnknownClient(message) => Self::NotFound(message),
            AuditError::Storage(message) => Self::Internal(message),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            Self::InvalidRequest(message) => (
                StatusCode::BAD_REQUEST,
                Json(json!({
                    "error": "invalid_request",
                    "message": message,
                })),
            )
                .into_response(),
            Self::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                Json(json!({
                    "error": "unauthorized",
                    "message": "client id and access token do not match",
                })),
            )
                .into_response(),
            Self::Unauthenticated => (
                StatusCode::UNAUTHORIZED,
                Json(json!({
                    "error": "unauthenticated",
                    "message": "admin session required",
                })),
            )
                .into_response(),
            Self::SessionInvalidated => (
                StatusCode::UNAUTHORIZED,
                Json(json!({
                    "error": "session_invalidated",
                    "message": "admin session has been revoked",
                })),
            )
                .into_response(),
            Self::InvalidCredentials => (
                StatusCode::UNAUTHORIZED,
                Json(json!({
                    "error": "invalid_credentials",
                    "message": "invalid username or password",
                })),
            )
                .into_response(),
            Self::NotFound(message) => (
                StatusCode::NOT_FOUND,
                Json(json!({
                    "error": "not_found",
                    "message": message,
                })),
            )
                .into_response(),
            Self::IdentifierCollision => (
                StatusCode::CONFLICT,
                Json(json!({
                    "error": "identifier_collision",
                    "message": "generated client id already exists; retry the request",
                })),
            )
                .into_response(),
            Self::RateLimited {
                retry_after_seconds,
            } => {
                let mut response = (
                    StatusCode::TOO_MANY_REQUESTS,
                    Json(json!({
                        "error": "rate_limited",
                        "message": "too many requests",
                        "retry_after_seconds": retry_after_seconds,
                    })),
                )
                    .into_response();
                if let Ok(value) = HeaderValue::from_str(&retry_after_seconds.to_string()) {
                    response.headers_mut().insert(header::RETRY_AFTER, value);
                }
                response
            }
            Self::SyncFailed => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({
                    "error": "internal_error",
                    "message": "Sync failed: internal error",
                    "success": false,
                    "status": "FAILED",
                })),
            )
                .into_response(),
            Self::Internal(message) => {
                tracing::error!(reason = %message, "request failed with internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({
                        "error": "internal_error",
                        "message": "internal server error",
                    })),
                )
                    .into_response()
            }
        }
    }
}
