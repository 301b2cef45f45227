use std::error::Error as StdError;
use std::time::Duration;

use http::StatusCode;
use thiserror::Error;

/// Boxed error used for streamed bodies.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("dial tcp {target}: {source}")]
    Dial {
        target: String,
        #[source]
        source: std::io::Error,
    },

    #[error("dial tcp {0}: i/o timeout after {1:?}")]
    DialTimeout(String, Duration),

    #[error("Hijacking not supported")]
    UpgradeUnsupported,

    #[error("{}", chain(.0))]
    Origin(#[from] hyper_util::client::legacy::Error),

    #[error("{0}")]
    BadRequest(String),
}

impl ProxyError {
    /// Status code sent to the client when this error ends a request.
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::Dial { .. } | ProxyError::DialTimeout(..) | ProxyError::Origin(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ProxyError::UpgradeUnsupported => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyError::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;

/// `err` followed by each of its causes, separated by `: `.
fn chain(err: &dyn StdError) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
