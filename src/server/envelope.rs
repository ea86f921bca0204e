//! The `{code, success, message, response}` wrapper every route returns.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::inference::coordinator::CoordinatorError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    pub code: u16,
    pub success: bool,
    pub message: String,
    pub response: Value,
}

impl Envelope {
    pub fn ok(message: impl Into<String>, response: impl Serialize) -> Self {
        Self::with_code(200, message, response)
    }

    pub fn with_code(code: u16, message: impl Into<String>, response: impl Serialize) -> Self {
        match serde_json::to_value(response) {
            Ok(response) => Self {
                code,
                success: (200..300).contains(&code),
                message: message.into(),
                response,
            },
            Err(e) => Self::error(500, format!("Failed to serialize response: {e}")),
        }
    }

    /// A failure; `response` is always an empty object.
    pub fn error(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            success: false,
            message: message.into(),
            response: json!({}),
        }
    }
}

impl From<CoordinatorError> for Envelope {
    fn from(e: CoordinatorError) -> Self {
        Self::error(e.status_code(), e.to_string())
    }
}

impl IntoResponse for Envelope {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self)).into_response()
    }
}
