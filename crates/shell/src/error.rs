//! Error taxonomy for the device-communication core. Nothing here is fatal:
//! connection failures surface as `ConnectionState::Failed`, field-level
//! parse failures are absorbed by the codec, and publish failures are
//! returned to the caller.

use std::time::Duration;

use rumqttc::{ConnectReturnCode, ConnectionError, StateError};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectError {
    #[error("broker unreachable: {0}")]
    Unreachable(String),
    #[error("credentials rejected: {0}")]
    AuthRejected(String),
    #[error("tls handshake failed: {0}")]
    TlsFailed(String),
    #[error("connection refused: {0}")]
    Protocol(String),
}

impl From<&ConnectionError> for ConnectError {
    fn from(err: &ConnectionError) -> Self {
        match err {
            ConnectionError::ConnectionRefused(code) => match code {
                ConnectReturnCode::BadUserNamePassword | ConnectReturnCode::NotAuthorized => {
                    Self::AuthRejected(format!("{code:?}"))
                }
                other => Self::Protocol(format!("{other:?}")),
            },
            ConnectionError::Tls(e) => Self::TlsFailed(e.to_string()),
            ConnectionError::Io(e) => Self::Unreachable(e.to_string()),
            // an accepted session whose socket went away
            ConnectionError::MqttState(StateError::Io(e)) => Self::Unreachable(e.to_string()),
            ConnectionError::NetworkTimeout
            | ConnectionError::FlushTimeout
            | ConnectionError::RequestsDone => Self::Unreachable(err.to_string()),
            other => Self::Protocol(other.to_string()),
        }
    }
}

/// Whole-payload decode failure. Individual malformed sensor fields never
/// produce this; they are dropped from the reading instead.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("payload on {topic} is not valid utf-8")]
    NotUtf8 { topic: String },
    #[error("payload on {topic} is not valid json: {reason}")]
    Malformed { topic: String, reason: String },
    #[error("payload on {topic} is not a json object")]
    NotAnObject { topic: String },
    #[error("unknown command {token:?} on {topic}")]
    UnknownCommand { topic: String, token: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PublishError {
    #[error("not connected to broker")]
    NotConnected,
    #[error("invalid input ({}): {detail}", .fields.join(", "))]
    InvalidInput {
        fields: Vec<&'static str>,
        detail: String,
    },
    #[error("broker rejected publish: {0}")]
    TransportRejected(String),
    #[error("no acknowledgement within {0:?}")]
    Timeout(Duration),
}

impl PublishError {
    pub(crate) fn invalid(field: &'static str, detail: impl Into<String>) -> Self {
        Self::InvalidInput {
            fields: vec![field],
            detail: detail.into(),
        }
    }
}

/// An established session dropped without `disconnect()` being called.
/// Logged and answered with a reconnect; never surfaced as fatal.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection lost: {0}")]
    ConnectionLost(#[from] ConnectionError),
}
