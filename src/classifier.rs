//! Maps decoded API responses onto the closed [`SyncError`] taxonomy.
//!
//! Classification is pure: it never fails, and a payload that carries an
//! error marker the rules don't recognise still becomes
//! [`SyncError::TransientServer`] rather than passing as success.

use std::time::Duration;

use serde_json::Value;

use crate::errors::{Result, SyncError};

/// Invalid or expired OAuth session.
const AUTH_CODES: &[i64] = &[102, 190];

/// Application, user, page and ad-account level throttling.
const THROTTLE_CODES: &[i64] = &[4, 17, 32, 613];
const BUSINESS_THROTTLE_CODES: std::ops::RangeInclusive<i64> = 80_000..=80_014;
const THROTTLE_SUBCODES: &[i64] = &[2_446_079];

/// "Ads creative post was created by an app that is in development mode".
const DEV_MODE_SUBCODES: &[i64] = &[1_885_183];

const DEV_MODE_REMEDIATION: &str =
    "Switch the app to Live mode in the Meta developer dashboard, then retry.";

/// Classify a decoded response body on its own, ignoring transport status.
pub fn classify(body: Value) -> Result<Value> {
    match body.get("error") {
        None | Some(Value::Null) => Ok(body),
        Some(marker) => Err(classify_marker(marker, None, None)),
    }
}

/// Classify a response using its HTTP status as a fallback when the body
/// itself carries no error marker.
pub fn classify_response(status: u16, body: Value, retry_after: Option<Duration>) -> Result<Value> {
    match body.get("error") {
        None | Some(Value::Null) => {}
        Some(marker) => return Err(classify_marker(marker, Some(status), retry_after)),
    }

    if (200..300).contains(&status) {
        return Ok(body);
    }

    let message = match &body {
        Value::String(s) if !s.is_empty() => s.clone(),
        _ => format!("HTTP {status}"),
    };

    Err(match status {
        401 => SyncError::AuthExpired { message },
        429 => SyncError::RateLimited {
            message,
            retry_after,
        },
        _ => SyncError::TransientServer {
            message,
            status: Some(status),
            code: None,
        },
    })
}

fn classify_marker(marker: &Value, status: Option<u16>, retry_after: Option<Duration>) -> SyncError {
    let obj = match marker {
        Value::Object(obj) => obj,
        // Plain `{"error": "..."}` bodies from the media-generation API.
        Value::String(message) => return classify_plain(message.clone(), status, retry_after),
        other => {
            return SyncError::TransientServer {
                message: other.to_string(),
                status,
                code: None,
            }
        }
    };

    let code = obj.get("code").and_then(as_i64);
    let subcode = obj.get("error_subcode").and_then(as_i64);
    let message = obj
        .get("message")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .unwrap_or("unknown error")
        .to_string();

    if code.is_some_and(|c| AUTH_CODES.contains(&c)) {
        return SyncError::AuthExpired { message };
    }

    let throttled = code
        .is_some_and(|c| THROTTLE_CODES.contains(&c) || BUSINESS_THROTTLE_CODES.contains(&c))
        || subcode.is_some_and(|s| THROTTLE_SUBCODES.contains(&s));
    if throttled {
        return SyncError::RateLimited {
            message: user_text(obj).unwrap_or(message),
            retry_after,
        };
    }

    if let Some(user_msg) = user_text(obj) {
        return SyncError::Validation {
            message: user_msg,
            field: blamed_field(obj.get("error_data")),
        };
    }

    let dev_mode = subcode.is_some_and(|s| DEV_MODE_SUBCODES.contains(&s))
        || message.to_ascii_lowercase().contains("development mode");
    if dev_mode {
        return SyncError::Configuration {
            message,
            remediation: DEV_MODE_REMEDIATION.to_string(),
        };
    }

    SyncError::TransientServer {
        message,
        status,
        code,
    }
}

fn classify_plain(message: String, status: Option<u16>, retry_after: Option<Duration>) -> SyncError {
    match status {
        Some(401) | Some(403) => SyncError::AuthExpired { message },
        Some(429) => SyncError::RateLimited {
            message,
            retry_after,
        },
        Some(400..=499) => SyncError::Validation {
            message,
            field: None,
        },
        _ => SyncError::TransientServer {
            message,
            status,
            code: None,
        },
    }
}

fn user_text(obj: &serde_json::Map<String, Value>) -> Option<String> {
    obj.get("error_user_msg")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// `error_data` is sometimes a JSON object and sometimes a JSON-encoded string.
fn blamed_field(error_data: Option<&Value>) -> Option<String> {
    let data = match error_data? {
        Value::String(s) => serde_json::from_str::<Value>(s).ok()?,
        other => other.clone(),
    };

    if let Some(field) = data.get("blame_field").and_then(Value::as_str) {
        return Some(field.to_string());
    }

    data.get("blame_field_specs")?
        .get(0)?
        .get(0)?
        .as_str()
        .map(str::to_string)
}

fn as_i64(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn expired_token_is_auth_expired() {
        let err = classify(json!({"error": {"code": 190}})).unwrap_err();
        assert!(matches!(err, SyncError::AuthExpired { .. }));
    }

    #[test]
    fn ads_management_throttle_is_rate_limited() {
        let err = classify(json!({"error": {"code": 80004}})).unwrap_err();
        assert!(matches!(err, SyncError::RateLimited { .. }));
    }

    #[test]
    fn user_message_becomes_validation_error() {
        let err = classify(json!({"error": {"error_user_msg": "bad image"}})).unwrap_err();
        match err {
            SyncError::Validation { message, field } => {
                assert_eq!(message, "bad image");
                assert_eq!(field, None);
            }
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn auth_wins_over_user_message() {
        let err = classify(json!({
            "error": {"code": 190, "error_user_msg": "Please log in again"}
        }))
        .unwrap_err();
        assert!(err.is_auth_expired());
    }

    #[test]
    fn blame_field_is_extracted_from_encoded_error_data() {
        let err = classify(json!({
            "error": {
                "code": 100,
                "error_user_msg": "Budget is too low",
                "error_data": "{\"blame_field_specs\":[[\"daily_budget\"]]}"
            }
        }))
        .unwrap_err();
        match err {
            SyncError::Validation { field, .. } => assert_eq!(field.as_deref(), Some("daily_budget")),
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn development_mode_is_configuration_error() {
        let err = classify(json!({
            "error": {"code": 100, "error_subcode": 1885183, "message": "Invalid parameter"}
        }))
        .unwrap_err();
        assert!(matches!(err, SyncError::Configuration { .. }));
    }

    #[test]
    fn unknown_marker_is_transient_not_success() {
        let err = classify(json!({"error": {"code": 1, "message": "An unknown error occurred"}}))
            .unwrap_err();
        assert!(err.is_transient());

        let err = classify(json!({"error": true})).unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn body_without_marker_passes_through() {
        let body = json!({"id": "123", "name": "Spring sale"});
        assert_eq!(classify(body.clone()).unwrap(), body);
    }

    #[test]
    fn status_fallback_applies_without_marker() {
        let err = classify_response(429, json!({}), Some(Duration::from_secs(60))).unwrap_err();
        assert!(matches!(
            err,
            SyncError::RateLimited { retry_after: Some(d), .. } if d == Duration::from_secs(60)
        ));

        let err = classify_response(503, Value::String("upstream down".into()), None).unwrap_err();
        assert!(matches!(err, SyncError::TransientServer { status: Some(503), .. }));
    }

    #[test]
    fn plain_string_error_uses_status() {
        let err = classify_response(400, json!({"error": "prompt is empty"}), None).unwrap_err();
        assert!(matches!(err, SyncError::Validation { ref message, .. } if message == "prompt is empty"));

        let err = classify_response(401, json!({"error": "invalid key"}), None).unwrap_err();
        assert!(err.is_auth_expired());
    }
}
