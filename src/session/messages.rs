use serde::{de, Deserialize, Deserializer, Serialize};
use serde_json::Number;

/// The only error text a client ever sees for a recoverable failure.
pub const GENERIC_ERROR: &str = "Failed to process request";

/// Text of the acknowledgment sent once a session may use the shell.
pub const CONNECTED_MESSAGE: &str = "Connected to terminal";

/// Client → server envelope.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    Auth { token: String },
    Input { data: String },
    /// Signed so that negative sizes reach validation instead of failing to
    /// deserialize; either way the client gets the generic error.
    Resize {
        #[serde(deserialize_with = "integral")]
        cols: i64,
        #[serde(deserialize_with = "integral")]
        rows: i64,
    },
}

/// Accept any JSON number with an integer value, so `80.0` reads as `80`.
fn integral<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    let number = Number::deserialize(deserializer)?;
    if let Some(n) = number.as_i64() {
        return Ok(n);
    }
    match number.as_f64() {
        Some(f) if f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64 => Ok(f as i64),
        _ => Err(de::Error::custom(format!("{number} is not an integer"))),
    }
}

/// Message kinds the router recognises, by `type` discriminator.
pub const KNOWN_TYPES: &[&str] = &["auth", "input", "resize"];

/// Server → client envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    Connected { message: String },
    Output { data: String },
    Exit { code: i32 },
    Error { message: String },
}

impl ServerMessage {
    pub fn connected() -> Self {
        ServerMessage::Connected {
            message: CONNECTED_MESSAGE.to_string(),
        }
    }

    pub fn generic_error() -> Self {
        ServerMessage::Error {
            message: GENERIC_ERROR.to_string(),
        }
    }

    pub fn to_json(&self) -> String {
        // Only string and integer fields: serialization cannot fail.
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(r#"{{"type":"error","message":"{GENERIC_ERROR}"}}"#)
        })
    }
}
