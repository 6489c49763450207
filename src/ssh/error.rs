//! SSH Error types

use std::io;

use thiserror::Error;

/// Errors surfaced by sessions, channels and the wire engine.
///
/// `Clone` so that a single transport failure can be handed to every channel
/// and every waiter torn down with the session.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SshError {
    #[error("Connection timed out: {0}")]
    Timeout(String),

    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Host key rejected: {0}")]
    HostKeyRejected(String),

    #[error("Host key mismatch: {0}")]
    HostKeyMismatch(String),

    #[error("Negotiation failed: {0}")]
    NegotiationFailure(String),

    #[error("Request denied: {0}")]
    RequestDenied(String),

    #[error("Identity parse failure: {0}")]
    IdentityParseFailure(String),

    #[error("SSH protocol error: {0}")]
    ProtocolError(String),

    #[error("Channel error: {0}")]
    ChannelError(String),

    #[error("Channel closed by remote")]
    ChannelClosedByRemote,

    #[error("Invalid stage: {0}")]
    InvalidStage(String),

    #[error("Disconnected")]
    Disconnected,

    #[error("IO error: {0}")]
    Io(String),
}

impl SshError {
    /// Whether this error means the transport itself is gone.
    pub fn is_transport_fatal(&self) -> bool {
        matches!(
            self,
            SshError::Timeout(_)
                | SshError::ConnectionRefused(_)
                | SshError::ConnectionFailed(_)
                | SshError::ProtocolError(_)
                | SshError::Disconnected
                | SshError::Io(_)
        )
    }
}

impl From<io::Error> for SshError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut => SshError::Timeout(err.to_string()),
            io::ErrorKind::ConnectionRefused => SshError::ConnectionRefused(err.to_string()),
            _ => SshError::Io(err.to_string()),
        }
    }
}

impl From<russh::Error> for SshError {
    fn from(err: russh::Error) -> Self {
        match err {
            russh::Error::IO(e) => SshError::from(e),
            russh::Error::Disconnect => SshError::Disconnected,
            other => {
                let message = other.to_string();
                if message.contains("No common") {
                    SshError::NegotiationFailure(message)
                } else {
                    SshError::ProtocolError(message)
                }
            }
        }
    }
}

impl From<russh::keys::Error> for SshError {
    fn from(err: russh::keys::Error) -> Self {
        SshError::IdentityParseFailure(err.to_string())
    }
}
