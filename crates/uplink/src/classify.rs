//! Maps transport failures onto the closed [`ErrorCategory`] taxonomy.
//!
//! Classification happens exactly once, at the boundary where a failure is
//! first observed (the HTTP pipeline or a WebSocket connection). Callers
//! upstream only ever see [`AppError`] and use [`is_retryable`] to decide
//! whether to try again.

use http::StatusCode;
use serde_json::{Value, json};

use crate::error::{AppError, ErrorCategory, TransportError};

pub const CODE_TIMEOUT: &str = "TIMEOUT";
pub const CODE_NETWORK: &str = "NETWORK_ERROR";
pub const CODE_UNAUTHORIZED: &str = "UNAUTHORIZED";
pub const CODE_FORBIDDEN: &str = "FORBIDDEN";
pub const CODE_NOT_FOUND: &str = "NOT_FOUND";
pub const CODE_RATE_LIMIT: &str = "RATE_LIMIT";
pub const CODE_VALIDATION: &str = "VALIDATION_ERROR";
pub const CODE_SERVICE_UNAVAILABLE: &str = "SERVICE_UNAVAILABLE";
pub const CODE_SERVER_ERROR: &str = "SERVER_ERROR";
pub const CODE_UNKNOWN: &str = "UNKNOWN_ERROR";

pub const CODE_WS_TIMEOUT: &str = "WEBSOCKET_TIMEOUT";
pub const CODE_WS_DISCONNECTED: &str = "WEBSOCKET_DISCONNECTED";
pub const CODE_WS_CONNECTION_FAILED: &str = "WEBSOCKET_CONNECTION_FAILED";
pub const CODE_WS_ERROR: &str = "WEBSOCKET_ERROR";

/// Classify a failure raised by the HTTP pipeline.
pub fn classify_http_error(error: &TransportError) -> AppError {
    match error {
        TransportError::Timeout { duration } => AppError::new(
            ErrorCategory::Network,
            CODE_TIMEOUT,
            "The request timed out. Please try again.",
        )
        .with_details(json!({ "timeoutMs": duration.as_millis() as u64 })),
        TransportError::Http(e) if e.is_timeout() => AppError::new(
            ErrorCategory::Network,
            CODE_TIMEOUT,
            "The request timed out. Please try again.",
        )
        .with_details(json!({ "error": e.to_string() })),
        TransportError::Api {
            status,
            body,
            retry_after,
        } => classify_status(*status, body, retry_after.as_deref()),
        TransportError::Http(e) => match e.status() {
            Some(status) => classify_status(status, "", None),
            None => network_error(error),
        },
        TransportError::WebSocket { .. } | TransportError::ConnectionClosed { .. } => {
            network_error(error)
        }
        TransportError::Auth { message } => {
            AppError::authentication(CODE_UNAUTHORIZED, message.clone())
        }
        _ => AppError::new(
            ErrorCategory::Unknown,
            CODE_UNKNOWN,
            "An unexpected error occurred.",
        )
        .with_details(json!({ "error": error.to_string() })),
    }
}

fn network_error(error: &TransportError) -> AppError {
    AppError::new(
        ErrorCategory::Network,
        CODE_NETWORK,
        "Unable to reach the server. Please check your connection.",
    )
    .with_details(json!({ "error": error.to_string() }))
}

fn classify_status(status: StatusCode, body: &str, retry_after: Option<&str>) -> AppError {
    let code = status.as_u16();
    let details = json!({
        "status": code,
        "body": parse_body(body),
    });

    let error = match code {
        401 => AppError::new(
            ErrorCategory::Authentication,
            CODE_UNAUTHORIZED,
            "Your session has expired. Please log in again.",
        ),
        403 => AppError::new(
            ErrorCategory::Authentication,
            CODE_FORBIDDEN,
            "You do not have permission to perform this action.",
        ),
        404 => AppError::new(
            ErrorCategory::Api,
            CODE_NOT_FOUND,
            "The requested resource was not found.",
        ),
        429 => {
            let message = match retry_after.map(str::trim).filter(|v| !v.is_empty()) {
                Some(seconds) => {
                    format!("Too many requests. Please try again in {seconds} seconds.")
                }
                None => "Too many requests. Please try again later.".to_string(),
            };
            AppError::new(ErrorCategory::Api, CODE_RATE_LIMIT, message)
        }
        400..=499 => AppError::new(
            ErrorCategory::Validation,
            CODE_VALIDATION,
            server_message(body).unwrap_or_else(|| "The request was invalid.".to_string()),
        ),
        502..=504 => AppError::new(
            ErrorCategory::Api,
            CODE_SERVICE_UNAVAILABLE,
            "The service is temporarily unavailable. Please try again shortly.",
        ),
        500.. => AppError::new(
            ErrorCategory::Api,
            CODE_SERVER_ERROR,
            "The server encountered an error. Please try again later.",
        ),
        _ => AppError::new(
            ErrorCategory::Unknown,
            CODE_UNKNOWN,
            "An unexpected error occurred.",
        ),
    };

    error.with_status(code).with_details(details)
}

fn parse_body(body: &str) -> Value {
    if body.is_empty() {
        return Value::Null;
    }
    serde_json::from_str(body).unwrap_or_else(|_| Value::String(body.to_string()))
}

/// Pull a `message` field out of a JSON error body.
fn server_message(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    value
        .get("message")
        .and_then(Value::as_str)
        .filter(|m| !m.is_empty())
        .map(str::to_string)
}

/// Classify a failure raised by a WebSocket connection.
///
/// Structured variants are matched first. Free-form messages fall back to
/// keyword matching in priority order: timeout, disconnect, connect.
pub fn classify_stream_error(error: &TransportError) -> AppError {
    let details = json!({ "error": error.to_string() });

    let code = match error {
        TransportError::Timeout { .. } => CODE_WS_TIMEOUT,
        TransportError::ConnectionClosed { .. } => CODE_WS_DISCONNECTED,
        TransportError::Http(_) => CODE_WS_CONNECTION_FAILED,
        other => {
            let text = other.to_string().to_lowercase();
            if text.contains("timeout") || text.contains("timed out") {
                CODE_WS_TIMEOUT
            } else if text.contains("disconnect") {
                CODE_WS_DISCONNECTED
            } else if text.contains("connect") {
                CODE_WS_CONNECTION_FAILED
            } else {
                CODE_WS_ERROR
            }
        }
    };

    let message = match code {
        CODE_WS_TIMEOUT => "The live connection timed out.",
        CODE_WS_DISCONNECTED => "The live connection was lost. Reconnecting…",
        CODE_WS_CONNECTION_FAILED => "Unable to open a live connection to the server.",
        _ => "A live connection error occurred.",
    };

    AppError::websocket(code, message).with_details(details)
}

/// Whether a caller may reasonably try the failed operation again.
pub fn is_retryable(error: &AppError) -> bool {
    if error.code == CODE_RATE_LIMIT {
        return false;
    }
    if matches!(
        error.category,
        ErrorCategory::Authentication | ErrorCategory::Validation
    ) {
        return false;
    }
    if let Some(status) = error.status_code {
        if (400..500).contains(&status) {
            return false;
        }
        if status >= 500 {
            return true;
        }
    }
    if matches!(
        error.category,
        ErrorCategory::Network | ErrorCategory::WebSocket
    ) {
        return true;
    }
    error.code.contains("TIMEOUT")
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn api(status: u16, body: &str, retry_after: Option<&str>) -> TransportError {
        TransportError::Api {
            status: StatusCode::from_u16(status).unwrap(),
            body: body.to_string(),
            retry_after: retry_after.map(str::to_string),
        }
    }

    #[test]
    fn test_rate_limit_with_retry_after() {
        let err = classify_http_error(&api(429, "", Some("60")));

        assert!(err.message.contains("60 seconds"));
        assert_eq!(err.category, ErrorCategory::Api);
        assert_eq!(err.code, CODE_RATE_LIMIT);
        assert_eq!(err.status_code, Some(429));
        assert!(!is_retryable(&err));
    }

    #[test]
    fn test_rate_limit_without_retry_after() {
        let err = classify_http_error(&api(429, "", None));
        assert!(err.message.contains("later"));
    }

    #[test]
    fn test_status_precedence() {
        let cases = [
            (401, ErrorCategory::Authentication, CODE_UNAUTHORIZED),
            (403, ErrorCategory::Authentication, CODE_FORBIDDEN),
            (404, ErrorCategory::Api, CODE_NOT_FOUND),
            (422, ErrorCategory::Validation, CODE_VALIDATION),
            (502, ErrorCategory::Api, CODE_SERVICE_UNAVAILABLE),
            (503, ErrorCategory::Api, CODE_SERVICE_UNAVAILABLE),
            (504, ErrorCategory::Api, CODE_SERVICE_UNAVAILABLE),
            (500, ErrorCategory::Api, CODE_SERVER_ERROR),
            (600, ErrorCategory::Api, CODE_SERVER_ERROR),
            (999, ErrorCategory::Api, CODE_SERVER_ERROR),
            (302, ErrorCategory::Unknown, CODE_UNKNOWN),
        ];

        for (status, category, code) in cases {
            let err = classify_http_error(&api(status, "", None));
            assert_eq!(err.category, category, "status {status}");
            assert_eq!(err.code, code, "status {status}");
        }
    }

    #[test]
    fn test_validation_uses_server_message() {
        let err = classify_http_error(&api(400, r#"{"message":"Email is required"}"#, None));
        assert_eq!(err.message, "Email is required");
        assert_eq!(err.details["body"]["message"], "Email is required");
    }

    #[test]
    fn test_timeout_is_network_and_retryable() {
        let err = classify_http_error(&TransportError::timeout(Duration::from_secs(30)));
        assert_eq!(err.category, ErrorCategory::Network);
        assert_eq!(err.code, CODE_TIMEOUT);
        assert!(is_retryable(&err));
    }

    #[test]
    fn test_retryability() {
        assert!(is_retryable(&classify_http_error(&api(500, "", None))));
        assert!(is_retryable(&classify_http_error(&api(503, "", None))));
        assert!(!is_retryable(&classify_http_error(&api(401, "", None))));
        assert!(!is_retryable(&classify_http_error(&api(404, "", None))));
        assert!(!is_retryable(&classify_http_error(&api(422, "", None))));

        let unknown = AppError::new(ErrorCategory::Unknown, CODE_UNKNOWN, "?");
        assert!(!is_retryable(&unknown));

        let custom_timeout = AppError::new(ErrorCategory::Api, "UPSTREAM_TIMEOUT", "slow");
        assert!(is_retryable(&custom_timeout));
    }

    #[test]
    fn test_stream_classification() {
        let err = classify_stream_error(&TransportError::timeout(Duration::from_secs(10)));
        assert_eq!(err.code, CODE_WS_TIMEOUT);

        let err = classify_stream_error(&TransportError::connection_closed(Some(1006)));
        assert_eq!(err.code, CODE_WS_DISCONNECTED);

        let err = classify_stream_error(&TransportError::websocket("peer disconnected"));
        assert_eq!(err.code, CODE_WS_DISCONNECTED);

        let err = classify_stream_error(&TransportError::websocket("Connection refused"));
        assert_eq!(err.code, CODE_WS_CONNECTION_FAILED);

        let err = classify_stream_error(&TransportError::websocket("bad frame"));
        assert_eq!(err.code, CODE_WS_ERROR);
        assert_eq!(err.category, ErrorCategory::WebSocket);
        assert!(is_retryable(&err));
    }
}
