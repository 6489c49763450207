//! SFTP error types

use thiserror::Error;

use crate::ssh::SshError;

/// SFTP status codes (`SSH_FX_*`)
pub mod status {
    pub const OK: u32 = 0;
    pub const EOF: u32 = 1;
    pub const NO_SUCH_FILE: u32 = 2;
    pub const PERMISSION_DENIED: u32 = 3;
    pub const FAILURE: u32 = 4;
    pub const BAD_MESSAGE: u32 = 5;
    pub const NO_CONNECTION: u32 = 6;
    pub const CONNECTION_LOST: u32 = 7;
    pub const OP_UNSUPPORTED: u32 = 8;
    pub const FILE_ALREADY_EXISTS: u32 = 11;
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SftpError {
    #[error("No such file: {0}")]
    NoSuchFile(String),

    #[error("File already exists: {0}")]
    FileAlreadyExists(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("SFTP failure: {0}")]
    Failure(String),

    #[error("End of file")]
    Eof,

    #[error("Bad message: {0}")]
    BadMessage(String),

    #[error("No connection")]
    NoConnection,

    #[error("Connection lost")]
    ConnectionLost,

    #[error("Operation unsupported: {0}")]
    OpUnsupported(String),

    #[error("SFTP status {code}: {message}")]
    Status { code: u32, message: String },

    #[error("Handle or channel is not open")]
    NotOpen,

    #[error("SFTP protocol error: {0}")]
    Protocol(String),

    #[error("Session error: {0}")]
    Session(#[from] SshError),
}

impl SftpError {
    /// Map a non-OK status reply onto its error kind
    pub fn from_status(code: u32, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            status::EOF => SftpError::Eof,
            status::NO_SUCH_FILE => SftpError::NoSuchFile(message),
            status::PERMISSION_DENIED => SftpError::PermissionDenied(message),
            status::FAILURE => SftpError::Failure(message),
            status::BAD_MESSAGE => SftpError::BadMessage(message),
            status::NO_CONNECTION => SftpError::NoConnection,
            status::CONNECTION_LOST => SftpError::ConnectionLost,
            status::OP_UNSUPPORTED => SftpError::OpUnsupported(message),
            status::FILE_ALREADY_EXISTS => SftpError::FileAlreadyExists(message),
            code => SftpError::Status { code, message },
        }
    }
}

/// A write that stopped part way through
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Write failed after {written} bytes: {error}")]
pub struct PartialWrite {
    /// Bytes the server accepted before the failure
    pub written: usize,
    pub error: SftpError,
}
