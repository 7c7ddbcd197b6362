use serde_json::Value;
use thiserror::Error;

/// Faults detected before a handler is ever invoked. Both are answered with
/// HTTP 400 and a plain-text body.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid request: {reason}")]
    MalformedRequest { reason: String },

    #[error("Unknown RPC call '{method}'")]
    UnknownMethod { method: String },
}

impl ProtocolError {
    pub fn malformed(reason: impl ToString) -> Self {
        Self::MalformedRequest {
            reason: reason.to_string(),
        }
    }
}

/// Structural problems with a decoded envelope.
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("message is not a JSON object")]
    NotAnObject,

    #[error("missing field `{0}`")]
    MissingField(&'static str),

    #[error("invalid field `{0}`")]
    InvalidField(&'static str),

    #[error("response carries both a result and an error")]
    ResultAndError,
}

/// Everything a client-side call can fail with. Failures are returned as
/// values; nothing here is ever raised as a panic.
#[derive(Debug, Error)]
pub enum CallError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("socket error: {0}")]
    Socket(anyhow::Error),

    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),

    #[error("{status} {body}")]
    Status { status: u16, body: String },

    #[error("codec error: {0}")]
    Codec(anyhow::Error),

    #[error("invalid response: {0}")]
    InvalidResponse(#[from] MessageError),

    #[error("remote error: {0}")]
    Remote(Value),

    #[error("connection closed before a response arrived")]
    NoResponse,

    #[error("connection closed")]
    Closed,

    #[error("request timed out")]
    Timeout,
}

impl CallError {
    /// The error value sent by the remote handler, if that is what this is.
    pub fn remote(&self) -> Option<&Value> {
        match self {
            CallError::Remote(value) => Some(value),
            _ => None,
        }
    }

    /// HTTP status of a rejected exchange.
    pub fn status(&self) -> Option<u16> {
        match self {
            CallError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid endpoint url: {0}")]
    Url(#[from] url::ParseError),
}
