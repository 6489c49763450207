//! sshmux - client-side SSH session engine
//!
//! One `Session` owns one SSH transport and multiplexes interactive shells,
//! direct TCP tunnels, remote-forwarded connections and SFTP over it.

pub mod channel;
pub mod forwarding;
pub mod logging;
pub mod sftp;
pub mod ssh;

#[cfg(test)]
mod testing;

pub use channel::{Channel, ChannelKind, ChannelStage, ForwardOrigin};
pub use forwarding::{ForwardListener, ListenRequest};
pub use sftp::{SftpChannel, SftpDirectory, SftpError, SftpFile};
pub use ssh::{
    AuthDecision, AuthMethod, ChannelDelegate, HostKey, KeyPair, Session, SessionConfig,
    SessionDelegate, SessionOptions, SessionStage, SshError,
};
