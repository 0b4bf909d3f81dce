//! OCPP-J message framing
//!
//! The OCPP-J (JSON over WebSocket) transport envelope, shared by the
//! charger-facing protocol and the admin API:
//!
//! - **Call**       `[2, "<uniqueId>", "<action>", {<payload>}]`
//! - **CallResult** `[3, "<uniqueId>", {<payload>}]`
//! - **CallError**  `[4, "<uniqueId>", "<errorCode>", "<errorDescription>", {<errorDetails>}]`

use serde_json::Value;
use thiserror::Error;

const MSG_TYPE_CALL: u64 = 2;
const MSG_TYPE_CALL_RESULT: u64 = 3;
const MSG_TYPE_CALL_ERROR: u64 = 4;

/// A parsed OCPP-J frame.
#[derive(Debug, Clone)]
pub enum Frame {
    Call {
        unique_id: String,
        action: String,
        payload: Value,
    },
    CallResult {
        unique_id: String,
        payload: Value,
    },
    CallError {
        unique_id: String,
        error_code: String,
        error_description: String,
        error_details: Value,
    },
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("invalid JSON: {0}")]
    InvalidJson(String),
    #[error("frame is not a JSON array")]
    NotAnArray,
    #[error("message type missing or not a number")]
    InvalidMessageType,
    #[error("unknown message type {0}")]
    UnknownMessageType(u64),
    #[error("expected at least {expected} elements, got {got}")]
    MissingElements { expected: usize, got: usize },
    #[error("{0} must be a string")]
    NotAString(&'static str),
}

impl Frame {
    /// Parse raw JSON text into a frame.
    pub fn parse(text: &str) -> Result<Self, FrameError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| FrameError::InvalidJson(e.to_string()))?;
        let arr = value.as_array().ok_or(FrameError::NotAnArray)?;

        let msg_type = arr
            .first()
            .and_then(Value::as_u64)
            .ok_or(FrameError::InvalidMessageType)?;

        let need = |n: usize| {
            if arr.len() < n {
                Err(FrameError::MissingElements {
                    expected: n,
                    got: arr.len(),
                })
            } else {
                Ok(())
            }
        };
        let string_at = |i: usize, what: &'static str| {
            arr[i]
                .as_str()
                .map(str::to_owned)
                .ok_or(FrameError::NotAString(what))
        };

        match msg_type {
            MSG_TYPE_CALL => {
                need(4)?;
                Ok(Self::Call {
                    unique_id: string_at(1, "uniqueId")?,
                    action: string_at(2, "action")?,
                    payload: arr[3].clone(),
                })
            }
            MSG_TYPE_CALL_RESULT => {
                need(3)?;
                Ok(Self::CallResult {
                    unique_id: string_at(1, "uniqueId")?,
                    payload: arr[2].clone(),
                })
            }
            MSG_TYPE_CALL_ERROR => {
                need(4)?;
                Ok(Self::CallError {
                    unique_id: string_at(1, "uniqueId")?,
                    error_code: arr[2].as_str().unwrap_or("InternalError").to_string(),
                    error_description: arr[3].as_str().unwrap_or_default().to_string(),
                    error_details: arr.get(4).cloned().unwrap_or_else(|| Value::Object(Default::default())),
                })
            }
            other => Err(FrameError::UnknownMessageType(other)),
        }
    }

    /// Serialize this frame back to JSON text.
    pub fn serialize(&self) -> String {
        let arr = match self {
            Self::Call {
                unique_id,
                action,
                payload,
            } => serde_json::json!([MSG_TYPE_CALL, unique_id, action, payload]),
            Self::CallResult { unique_id, payload } => {
                serde_json::json!([MSG_TYPE_CALL_RESULT, unique_id, payload])
            }
            Self::CallError {
                unique_id,
                error_code,
                error_description,
                error_details,
            } => serde_json::json!([
                MSG_TYPE_CALL_ERROR,
                unique_id,
                error_code,
                error_description,
                error_details
            ]),
        };
        arr.to_string()
    }

    pub fn unique_id(&self) -> &str {
        match self {
            Self::Call { unique_id, .. }
            | Self::CallResult { unique_id, .. }
            | Self::CallError { unique_id, .. } => unique_id,
        }
    }

    /// Build a `CallResult` reply for a given call id.
    pub fn result(unique_id: impl Into<String>, payload: Value) -> Self {
        Self::CallResult {
            unique_id: unique_id.into(),
            payload,
        }
    }

    /// Build a `CallError` reply for a given call id.
    pub fn error(
        unique_id: impl Into<String>,
        error_code: impl Into<String>,
        error_description: impl Into<String>,
    ) -> Self {
        Self::CallError {
            unique_id: unique_id.into(),
            error_code: error_code.into(),
            error_description: error_description.into(),
            error_details: Value::Object(Default::default()),
        }
    }
}
