//! Request field checks. Failures collect into a list so a client sees every
//! problem with a body at once.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use serde_json::Value;

/// Format shared by feature names and project ids.
pub const KEY_FORMAT: &str = r"^[0-9a-zA-Z.\-]+$";

static KEY_PATTERN: LazyLock<Regex> = LazyLock::new(|| Regex::new(KEY_FORMAT).expect("key format is a valid regex"));

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FieldError {
    pub param: String,
    pub msg: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

impl FieldError {
    pub fn new(param: &str, msg: impl Into<String>, value: Option<Value>) -> Self {
        Self {
            param: param.to_string(),
            msg: msg.into(),
            value,
        }
    }
}

pub fn is_valid_key(value: &str) -> bool {
    KEY_PATTERN.is_match(value)
}

/// Non-empty string field `param`, or a "`label` is required" error.
pub fn required<'a>(body: &'a Value, param: &str, label: &str, errors: &mut Vec<FieldError>) -> Option<&'a str> {
    let value = body.get(param).and_then(Value::as_str).filter(|s| !s.is_empty());
    if value.is_none() {
        errors.push(FieldError::new(param, format!("{label} is required"), body.get(param).cloned()));
    }
    value
}

/// Required field that must also match [`KEY_FORMAT`]. A missing field
/// reports both problems.
pub fn required_key<'a>(body: &'a Value, param: &str, label: &str, errors: &mut Vec<FieldError>) -> Option<&'a str> {
    let value = required(body, param, label, errors);
    if !value.is_some_and(is_valid_key) {
        errors.push(FieldError::new(
            param,
            format!("{label} must match format {KEY_FORMAT}"),
            body.get(param).cloned(),
        ));
        return None;
    }
    value
}

/// Legacy single `strategy` and `strategies` cannot both be given.
pub fn single_strategy_form(body: &Value, errors: &mut Vec<FieldError>) {
    if body.get("strategy").is_some() && body.get("strategies").is_some() {
        errors.push(FieldError::new(
            "strategies",
            r#"Cannot use both "strategy" and "strategies"."#,
            None,
        ));
    }
}
