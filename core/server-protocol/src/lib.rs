//! IPC protocol types for engine-host-server.
//!
//! This crate is shared by the server and its clients to prevent schema drift.
//! Requests address a command by `collection` and `function`, the same way the
//! server's command registry names them. The server remains the authority on
//! validation; clients reuse these types to build well-formed requests.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_REQUEST_BYTES: usize = 1024 * 1024; // 1MB

/// Collection holding the lifecycle commands.
pub const SYSTEM_COLLECTION: &str = "System";
/// Zero-argument command that latches an immediate shutdown (no handshake).
pub const SHUTDOWN_FUNCTION: &str = "Shutdown";
pub const GET_HEALTH_FUNCTION: &str = "GetHealth";
/// Diagnostics-only command that raises a fatal engine condition. Registered
/// only when the server's config allows it.
pub const INDUCE_FAULT_FUNCTION: &str = "InduceFault";

pub const ERROR_PROTOCOL_MISMATCH: &str = "protocol_mismatch";
pub const ERROR_UNKNOWN_COMMAND: &str = "unknown_command";
pub const ERROR_INVALID_ARGS: &str = "invalid_args";
pub const ERROR_INVALID_JSON: &str = "invalid_json";
pub const ERROR_REQUEST_TOO_LARGE: &str = "request_too_large";
pub const ERROR_SHUTTING_DOWN: &str = "shutting_down";

/// Status code returned as the first value of command results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum StatusCode {
    Ok = 0,
    Error = 1,
}

impl StatusCode {
    pub fn as_value(self) -> Value {
        Value::from(self as u64)
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Request {
    pub protocol_version: u32,
    pub collection: String,
    pub function: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub args: Vec<Value>,
}

impl Request {
    pub fn new(collection: &str, function: &str) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            collection: collection.to_string(),
            function: function.to_string(),
            id: None,
            args: Vec::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn shutdown() -> Self {
        Self::new(SYSTEM_COLLECTION, SHUTDOWN_FUNCTION)
    }

    pub fn get_health() -> Self {
        Self::new(SYSTEM_COLLECTION, GET_HEALTH_FUNCTION)
    }

    pub fn induce_fault(message: &str) -> Self {
        let mut request = Self::new(SYSTEM_COLLECTION, INDUCE_FAULT_FUNCTION);
        request.args.push(Value::from(message));
        request
    }

    /// Fully-qualified command name, e.g. `System.Shutdown`.
    pub fn command_name(&self) -> String {
        format!("{}.{}", self.collection, self.function)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl Response {
    pub fn ok(id: Option<String>, data: Value) -> Self {
        Self {
            ok: true,
            id,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(id: Option<String>, code: &str, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(ErrorInfo::new(code, message)),
        }
    }

    pub fn error_with_info(id: Option<String>, error: ErrorInfo) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(error),
        }
    }

    /// Leading status code of a command result, if the data carries one.
    pub fn status_code(&self) -> Option<u64> {
        self.data
            .as_ref()
            .and_then(|data| data.as_array())
            .and_then(|values| values.first())
            .and_then(|value| value.as_u64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shutdown_request_names_system_command() {
        let request = Request::shutdown().with_id("req-1");
        assert_eq!(request.command_name(), "System.Shutdown");
        assert!(request.args.is_empty());
        assert_eq!(request.protocol_version, PROTOCOL_VERSION);
    }

    #[test]
    fn induce_fault_carries_message_argument() {
        let request = Request::induce_fault("engine fault 42");
        assert_eq!(request.command_name(), "System.InduceFault");
        assert_eq!(request.args, vec![Value::from("engine fault 42")]);
    }

    #[test]
    fn request_args_default_to_empty() {
        let request: Request = serde_json::from_str(
            r#"{"protocol_version":1,"collection":"System","function":"GetHealth"}"#,
        )
        .expect("parse request");
        assert!(request.args.is_empty());
        assert!(request.id.is_none());
    }

    #[test]
    fn rejects_unknown_request_fields() {
        let parsed = serde_json::from_str::<Request>(
            r#"{"protocol_version":1,"collection":"System","function":"Shutdown","extra":true}"#,
        );
        assert!(parsed.is_err());
    }

    #[test]
    fn status_code_reads_first_result_value() {
        let response = Response::ok(None, serde_json::json!([StatusCode::Ok.as_value()]));
        assert_eq!(response.status_code(), Some(0));

        let response = Response::error(None, ERROR_UNKNOWN_COMMAND, "nope");
        assert_eq!(response.status_code(), None);
    }

    #[test]
    fn error_response_omits_data() {
        let response = Response::error(Some("x".to_string()), ERROR_INVALID_ARGS, "bad");
        let encoded = serde_json::to_value(&response).expect("serialize");
        assert!(encoded.get("data").is_none());
        assert_eq!(encoded["error"]["code"], "invalid_args");
    }
}
