use axum::http::StatusCode;
use serde_json::{json, Value};
use thiserror::Error;

/// Relay error taxonomy.
///
/// `Capacity` and `AuthExpired` are the two classes the retry engine acts
/// on; everything else either propagates to the caller or is retried under
/// the full-retry policy.
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("capacity exhausted: {message}")]
    Capacity {
        message: String,
        reset_after_ms: Option<u64>,
    },

    #[error("upstream auth expired: {0}")]
    AuthExpired(String),

    #[error("client error (HTTP {status}): {message}")]
    Client { status: u16, message: String },

    #[error("upstream error: {message}")]
    Upstream {
        status: Option<u16>,
        message: String,
    },

    #[error("prompt blocked by upstream: {0}")]
    Blocked(String),

    #[error("request aborted by client")]
    Aborted,

    #[error("account pool: {0}")]
    Pool(String),

    #[error("transform error: {0}")]
    Transform(String),

    #[error("oauth error: {0}")]
    OAuth(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type RelayResult<T> = Result<T, RelayError>;

impl RelayError {
    pub fn is_capacity(&self) -> bool {
        matches!(self, RelayError::Capacity { .. })
    }

    pub fn reset_after_ms(&self) -> Option<u64> {
        match self {
            RelayError::Capacity { reset_after_ms, .. } => *reset_after_ms,
            _ => None,
        }
    }

    /// Whether the account-switch layer of the retry engine may try again.
    /// Client mistakes and structural blocks never benefit from rotation.
    pub fn can_retry(&self) -> bool {
        match self {
            RelayError::Capacity { .. } => true,
            RelayError::AuthExpired(_) => true,
            RelayError::Upstream { .. } => true,
            RelayError::Network(_) => true,
            _ => false,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            RelayError::Capacity { .. } => StatusCode::TOO_MANY_REQUESTS,
            RelayError::AuthExpired(_) => StatusCode::UNAUTHORIZED,
            RelayError::Client { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_REQUEST)
            }
            RelayError::Blocked(_) => StatusCode::BAD_REQUEST,
            RelayError::Pool(_) => StatusCode::SERVICE_UNAVAILABLE,
            RelayError::Transform(_) => StatusCode::BAD_REQUEST,
            RelayError::Aborted => StatusCode::BAD_REQUEST,
            _ => StatusCode::BAD_GATEWAY,
        }
    }

    /// OpenAI error body: `{error:{message,type,code}}`.
    pub fn to_openai_body(&self) -> Value {
        let (err_type, code) = match self {
            RelayError::Capacity { .. } => ("rate_limit_error", "rate_limit_exceeded"),
            RelayError::AuthExpired(_) => ("authentication_error", "invalid_api_key"),
            RelayError::Client { .. } | RelayError::Transform(_) => {
                ("invalid_request_error", "invalid_request")
            }
            RelayError::Blocked(_) => ("invalid_request_error", "content_blocked"),
            _ => ("api_error", "upstream_error"),
        };
        json!({
            "error": {
                "message": self.to_string(),
                "type": err_type,
                "code": code,
            }
        })
    }

    /// Anthropic error body: `{type:"error",error:{type,message}}`.
    pub fn to_anthropic_body(&self) -> Value {
        let err_type = match self {
            RelayError::Capacity { .. } => "overloaded_error",
            RelayError::AuthExpired(_) => "authentication_error",
            RelayError::Client { .. } | RelayError::Transform(_) | RelayError::Blocked(_) => {
                "invalid_request_error"
            }
            RelayError::Pool(_) => "overloaded_error",
            _ => "api_error",
        };
        json!({
            "type": "error",
            "error": {
                "type": err_type,
                "message": self.to_string(),
            }
        })
    }
}
