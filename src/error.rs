use thiserror::Error;

use crate::audio_sink::AudioError;
use crate::capture::CaptureError;
use crate::codec::CodecError;
use crate::config::ConfigError;
use crate::transport::TransportError;

pub type Result<T> = std::result::Result<T, ClientError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClientError {
    #[error("Microphone unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Audio output error: {0}")]
    AudioOutput(String),

    #[error("WebSocket connection timeout")]
    ConnectTimeout,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    #[error("Server error: {0}")]
    Remote(String),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Connection failed after {attempts} reconnection attempts: {last_error}")]
    ReconnectExhausted { attempts: u32, last_error: String },

    #[error("Session stopped before it became active")]
    StoppedBeforeActive,

    #[error("Audio decode error: {0}")]
    Decode(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Session already finished; create a new client for a new conversation")]
    SessionFinished,

    #[error("Session already in progress")]
    AlreadyConnected,
}

impl ClientError {
    /// Whether automatic reconnection may be attempted after this error.
    ///
    /// Timeouts and socket-level failures are transient; device, remote and
    /// protocol errors need new user action or a fixed server.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClientError::ConnectTimeout
                | ClientError::Transport(_)
                | ClientError::ConnectionClosed(_)
        )
    }
}

impl From<CaptureError> for ClientError {
    fn from(err: CaptureError) -> Self {
        ClientError::DeviceUnavailable(err.to_string())
    }
}

impl From<AudioError> for ClientError {
    fn from(err: AudioError) -> Self {
        ClientError::AudioOutput(err.to_string())
    }
}

impl From<CodecError> for ClientError {
    fn from(err: CodecError) -> Self {
        ClientError::Decode(err.to_string())
    }
}

impl From<ConfigError> for ClientError {
    fn from(err: ConfigError) -> Self {
        ClientError::Config(err.to_string())
    }
}

impl From<TransportError> for ClientError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Closed { code, reason } => {
                ClientError::ConnectionClosed(format!("{} {}", code, reason).trim().to_string())
            }
            other => ClientError::Transport(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_policy() {
        assert!(ClientError::ConnectTimeout.is_retryable());
        assert!(ClientError::Transport("reset".into()).is_retryable());
        assert!(ClientError::ConnectionClosed("1006".into()).is_retryable());

        assert!(!ClientError::DeviceUnavailable("denied".into()).is_retryable());
        assert!(!ClientError::Remote("bad agent".into()).is_retryable());
        assert!(!ClientError::ProtocolViolation("early config".into()).is_retryable());
    }

    #[test]
    fn test_transport_close_conversion() {
        let err: ClientError = TransportError::Closed {
            code: 1006,
            reason: String::new(),
        }
        .into();
        assert_eq!(err, ClientError::ConnectionClosed("1006".into()));
    }
}
