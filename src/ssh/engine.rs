//! Wire engine boundary
//!
//! The wire engine performs the SSH protocol work (key exchange, encryption,
//! framing, raw channel I/O). The session core calls it only from the
//! session thread, one call at a time. Channel ids are allocated by the core
//! and handed to the engine, which reports everything keyed by those ids.

use std::time::{Duration, Instant};

use super::auth::KbiRequest;
use super::config::SessionOptions;
use super::error::SshError;
use super::host_key::HostKey;
use super::key_pair::KeyPair;
use super::queue::ReadinessNotifier;

/// Session-local channel identifier
pub type ChannelId = u32;

/// Identifier of a forwarded connection offered by the engine
pub type ConnectionId = u64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub host: String,
    pub port: u16,
    pub username: String,
}

/// Algorithms agreed during key exchange. An engine that cannot observe a
/// category leaves it `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Negotiated {
    pub kex: Option<String>,
    pub cipher: Option<String>,
    pub mac: Option<String>,
    pub host_key: Option<String>,
}

/// Result of a completed handshake
#[derive(Debug, Clone)]
pub struct Handshake {
    pub server_banner: Option<String>,
    pub negotiated: Negotiated,
    pub host_key: HostKey,
    /// Underlying socket descriptor, when the platform exposes one
    pub fd: Option<i32>,
}

pub enum AuthAttempt<'a> {
    None,
    Password(&'a str),
    PublicKey(&'a KeyPair),
    KeyboardInteractiveStart,
    KeyboardInteractiveRespond(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthReply {
    Success,
    /// Rejected; `methods` are the names the server will still accept
    Failure {
        methods: Vec<String>,
        partial_success: bool,
    },
    /// Keyboard-interactive wants answers
    InfoRequest(KbiRequest),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenRequest {
    DirectTcpip {
        host: String,
        port: u16,
        originator_host: String,
        originator_port: u16,
    },
    Shell {
        term: String,
        columns: u32,
        rows: u32,
    },
    Subsystem(String),
}

/// Events reported by `WireEngine::poll_events`, in delivery order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// SSH_MSG_USERAUTH_BANNER text received during authentication
    AuthBanner(String),
    ChannelOpened(ChannelId),
    ChannelOpenFailed {
        id: ChannelId,
        error: SshError,
    },
    Data {
        id: ChannelId,
        data: bytes::Bytes,
    },
    ExtendedData {
        id: ChannelId,
        data: bytes::Bytes,
    },
    /// More of the channel's window is available for writing
    WindowAdjusted(ChannelId),
    Eof(ChannelId),
    Closed(ChannelId),
    PtyResized {
        id: ChannelId,
        columns: u32,
        rows: u32,
        result: Result<(), SshError>,
    },
    ListenBound {
        token: u32,
        bound_port: u16,
    },
    ListenFailed {
        token: u32,
        error: SshError,
    },
    ForwardedConnection {
        connection: ConnectionId,
        listen_host: String,
        listen_port: u16,
        originator_host: String,
        originator_port: u16,
    },
    Disconnected {
        error: Option<SshError>,
    },
}

/// SSH protocol implementation driven by a session.
///
/// All methods are called from the session thread only. Blocking calls
/// (`connect`, `authenticate`) must honour their own timeouts; everything
/// channel related returns immediately and reports completion through
/// `poll_events`, waking the session through the notifier handed to `connect`.
pub trait WireEngine: Send {
    fn connect(
        &mut self,
        target: &Target,
        options: &SessionOptions,
        deadline: Instant,
        notifier: ReadinessNotifier,
    ) -> Result<Handshake, SshError>;

    fn authenticate(&mut self, username: &str, attempt: AuthAttempt<'_>)
        -> Result<AuthReply, SshError>;

    fn open_channel(&mut self, id: ChannelId, request: OpenRequest) -> Result<(), SshError>;

    /// Bind a forwarded connection to a session channel id
    fn accept_forwarded(&mut self, connection: ConnectionId, id: ChannelId) -> Result<(), SshError>;

    fn reject_forwarded(&mut self, connection: ConnectionId);

    /// Bytes the channel can take right now
    fn window(&self, id: ChannelId) -> usize;

    /// Write up to `window(id)` bytes; returns how many were accepted
    fn write(&mut self, id: ChannelId, data: &[u8]) -> Result<usize, SshError>;

    fn send_eof(&mut self, id: ChannelId) -> Result<(), SshError>;

    fn close_channel(&mut self, id: ChannelId) -> Result<(), SshError>;

    fn resize_pty(&mut self, id: ChannelId, columns: u32, rows: u32) -> Result<(), SshError>;

    fn request_listen(&mut self, token: u32, host: &str, port: u16) -> Result<(), SshError>;

    fn cancel_listen(&mut self, token: u32) -> Result<(), SshError>;

    /// Drain pending events, waiting at most `wait` for the first one
    fn poll_events(&mut self, wait: Duration) -> Vec<EngineEvent>;

    fn disconnect(&mut self);
}
