use crate::core::TideError;
use serde::{Deserialize, Serialize};

/// StreamableHTTP request envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Command to execute (e.g., "kv.set", "getop")
    pub command: String,
    /// Unique request identifier
    #[serde(default)]
    pub request_id: String,
    /// Command payload
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// StreamableHTTP response envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    /// Whether the operation succeeded
    pub success: bool,
    /// Matching request identifier
    pub request_id: String,
    /// Response payload (if successful)
    pub payload: Option<serde_json::Value>,
    /// Error message (if failed)
    pub error: Option<String>,
}

impl Request {
    /// Create a new request
    pub fn new(command: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            command: command.into(),
            request_id: uuid::Uuid::new_v4().to_string(),
            payload,
        }
    }

    /// Required string field
    pub fn str_field(&self, name: &str) -> Result<&str, TideError> {
        self.payload
            .get(name)
            .and_then(|v| v.as_str())
            .ok_or_else(|| TideError::InvalidRequest(format!("Missing '{}' field", name)))
    }

    /// Required integer field; numeric strings are accepted
    pub fn i64_field(&self, name: &str) -> Result<i64, TideError> {
        self.opt_i64_field(name)?
            .ok_or_else(|| TideError::InvalidRequest(format!("Missing '{}' field", name)))
    }

    /// Optional integer field; numeric strings are accepted
    pub fn opt_i64_field(&self, name: &str) -> Result<Option<i64>, TideError> {
        match self.payload.get(name) {
            None | Some(serde_json::Value::Null) => Ok(None),
            Some(serde_json::Value::Number(n)) => n.as_i64().map(Some).ok_or_else(|| {
                TideError::InvalidValue(format!("'{}' is not an integer", name))
            }),
            Some(serde_json::Value::String(s)) => s
                .trim()
                .parse::<i64>()
                .map(Some)
                .map_err(|_| TideError::InvalidValue(format!("'{}' is not an integer", name))),
            Some(_) => Err(TideError::InvalidValue(format!(
                "'{}' is not an integer",
                name
            ))),
        }
    }
}

impl Response {
    /// Create a successful response
    pub fn success(request_id: String, payload: serde_json::Value) -> Self {
        Self {
            success: true,
            request_id,
            payload: Some(payload),
            error: None,
        }
    }

    /// Create an error response
    pub fn error(request_id: String, error: impl Into<String>) -> Self {
        Self {
            success: false,
            request_id,
            payload: None,
            error: Some(error.into()),
        }
    }
}
