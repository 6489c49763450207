//! SFTP version 3 client
//!
//! Runs over a session channel started with `Session::open_sftp_channel`.

pub(crate) mod channel;
pub mod error;
pub(crate) mod file;
pub mod packet;
pub mod path_utils;
pub mod types;

pub use channel::SftpChannel;
pub use error::{PartialWrite, SftpError};
pub use file::{ReadHandlers, SftpDirectory, SftpFile};
pub use types::*;
