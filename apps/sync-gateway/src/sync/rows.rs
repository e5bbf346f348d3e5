use serde::Serialize;
use serde_json::{Map, Value};

use crate::types::{CredentialRow, DestinationRow, MasterRow};

/// Logical row fields and the key spellings accepted for each, in priority
/// order. Matching is ASCII case-insensitive; the first alias with a
/// non-empty value wins.
const ID_ALIASES: &[&str] = &["ID", "id"];
const PASS_ALIASES: &[&str] = &["PASS", "pass"];
const CODE_ALIASES: &[&str] = &["CODE", "code"];
const NAME_ALIASES: &[&str] = &["NAME", "name"];
const ADDRESS_ALIASES: &[&str] = &["ADDRESS", "address"];
const PLACE_ALIASES: &[&str] = &["PLACE", "place", "BRANCH", "branch"];
const SUPER_CODE_ALIASES: &[&str] = &["SUPERCODE", "super_code", "SUPER_CODE"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClassifiedRow {
    Credential(CredentialRow),
    Master(MasterRow),
    Skipped(SkipReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    NotAnObject,
    MissingCode,
}

impl ClassifiedRow {
    #[must_use]
    pub fn into_destination(self) -> Option<DestinationRow> {
        match self {
            Self::Credential(row) => Some(DestinationRow::Credential(row)),
            Self::Master(row) => Some(DestinationRow::Master(row)),
            Self::Skipped(_) => None,
        }
    }
}

/// Decides which destination table a raw uploaded row belongs to.
///
/// A row carrying both a non-empty `id` and `pass` is a credential row. Any
/// other object is a master row candidate and needs a non-empty `code`.
#[must_use]
pub fn classify_row(raw: &Value) -> ClassifiedRow {
    let Value::Object(fields) = raw else {
        return ClassifiedRow::Skipped(SkipReason::NotAnObject);
    };

    if let (Some(user_id), Some(pass)) = (
        lookup(fields, ID_ALIASES),
        lookup_verbatim(fields, PASS_ALIASES),
    ) {
        return ClassifiedRow::Credential(CredentialRow { user_id, pass });
    }

    let Some(code) = lookup(fields, CODE_ALIASES) else {
        return ClassifiedRow::Skipped(SkipReason::MissingCode);
    };
    ClassifiedRow::Master(MasterRow {
        code,
        name: lookup(fields, NAME_ALIASES),
        address: lookup(fields, ADDRESS_ALIASES),
        place: lookup(fields, PLACE_ALIASES),
        super_code: lookup(fields, SUPER_CODE_ALIASES),
    })
}

fn lookup(fields: &Map<String, Value>, aliases: &[&str]) -> Option<String> {
    find_alias(fields, aliases, |value| scalar_text(value, true))
}

/// Same matching as [`lookup`], but a string value is returned untrimmed.
/// Credentials are stored as given.
fn lookup_verbatim(fields: &Map<String, Value>, aliases: &[&str]) -> Option<String> {
    find_alias(fields, aliases, |value| scalar_text(value, false))
}

fn find_alias(
    fields: &Map<String, Value>,
    aliases: &[&str],
    read: impl Fn(&Value) -> Option<String>,
) -> Option<String> {
    aliases.iter().find_map(|alias| {
        fields
            .iter()
            .filter(|(key, _)| key.eq_ignore_ascii_case(alias))
            .find_map(|(_, value)| read(value))
    })
}

/// Numbers and booleans use their canonical JSON text. Null, blank strings,
/// arrays and objects are absent.
fn scalar_text(value: &Value, trim: bool) -> Option<String> {
    let text = match value {
        Value::String(text) if text.trim().is_empty() => return None,
        Value::String(text) if trim => text.trim().to_string(),
        Value::String(text) => text.clone(),
        Value::Number(number) => number.to_string(),
        Value::Bool(flag) => flag.to_string(),
        Value::Null | Value::Array(_) | Value::Object(_) => return None,
    };
    Some(text)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{ClassifiedRow, SkipReason, classify_row};
    use crate::types::{CredentialRow, MasterRow};

    #[test]
    fn id_and_pass_make_a_credential_row() {
        assert_eq!(
            classify_row(&json!({"ID": "u1", "PASS": "p1", "CODE": "ignored"})),
            ClassifiedRow::Credential(CredentialRow {
                user_id: "u1".to_string(),
                pass: "p1".to_string(),
            })
        );
        assert_eq!(
            classify_row(&json!({"Id": 42, "pAsS": "x"})),
            ClassifiedRow::Credential(CredentialRow {
                user_id: "42".to_string(),
                pass: "x".to_string(),
            })
        );
    }

    #[test]
    fn master_rows_resolve_aliases_in_priority_order() {
        let row = classify_row(&json!({
            "code": " C1 ",
            "Name": "Acme",
            "branch": "North",
            "SUPER_CODE": "C0",
            "address": null,
        }));
        assert_eq!(
            row,
            ClassifiedRow::Master(MasterRow {
                code: "C1".to_string(),
                name: Some("Acme".to_string()),
                address: None,
                place: Some("North".to_string()),
                super_code: Some("C0".to_string()),
            })
        );

        let row = classify_row(&json!({"CODE": "C2", "PLACE": "", "BRANCH": "South"}));
        let ClassifiedRow::Master(master) = row else {
            panic!("expected master row");
        };
        assert_eq!(master.place.as_deref(), Some("South"));
    }

    #[test]
    fn credential_value_keeps_surrounding_whitespace() {
        assert_eq!(
            classify_row(&json!({"ID": " u1 ", "PASS": "  p1 "})),
            ClassifiedRow::Credential(CredentialRow {
                user_id: "u1".to_string(),
                pass: "  p1 ".to_string(),
            })
        );
    }

    #[test]
    fn id_without_pass_falls_back_to_master_classification() {
        let row = classify_row(&json!({"ID": "u1", "PASS": "  ", "CODE": "C9"}));
        assert!(matches!(row, ClassifiedRow::Master(ref master) if master.code == "C9"));
    }

    #[test]
    fn rows_without_usable_keys_are_skipped() {
        assert_eq!(
            classify_row(&json!({"ID": "u1", "NAME": "orphan"})),
            ClassifiedRow::Skipped(SkipReason::MissingCode)
        );
        assert_eq!(
            classify_row(&json!({"CODE": null})),
            ClassifiedRow::Skipped(SkipReason::MissingCode)
        );
        assert_eq!(
            classify_row(&json!("C1")),
            ClassifiedRow::Skipped(SkipReason::NotAnObject)
        );
    }
}
