//! Caller-supplied capability interfaces
//!
//! Sessions and channels hold delegates as `Weak` references: the caller owns
//! them, and a delegate that has been dropped simply stops receiving
//! notifications. Every method runs on the session's own thread, so calling
//! back into the session from a notification executes inline.

use crate::channel::Channel;

use super::auth::{AuthDecision, AuthMethod, KbiRequest};
use super::engine::Negotiated;
use super::error::SshError;
use super::host_key::HostKey;
use super::session::Session;

pub trait SessionDelegate: Send + Sync {
    /// Decide whether the server's host key is trusted. Rejecting aborts the
    /// connection before authentication.
    fn should_trust_host_key(&self, session: &Session, host_key: &HostKey) -> bool;

    /// Pick one of `methods` and drive it through `Session::authenticate_with_*`.
    ///
    /// `partial_success` is set when a previous method succeeded but the
    /// server requires more.
    fn authenticate(
        &self,
        session: &Session,
        methods: &[AuthMethod],
        partial_success: bool,
    ) -> AuthDecision;

    /// Answer a keyboard-interactive round. `None` cancels the attempt.
    fn keyboard_interactive(&self, _session: &Session, _request: &KbiRequest) -> Option<Vec<String>> {
        None
    }

    fn did_receive_server_banner(&self, _session: &Session, _banner: &str) {}

    fn did_negotiate(&self, _session: &Session, _negotiated: &Negotiated) {}

    /// Text the server asked to show before login (SSH_MSG_USERAUTH_BANNER).
    /// Arrives before `did_authenticate` of the attempt it came with.
    fn did_receive_issue_banner(&self, _session: &Session, _banner: &str) {}

    fn did_authenticate(&self, _session: &Session) {}

    /// `error` is `None` only for caller-initiated disconnects.
    fn did_disconnect(&self, _session: &Session, _error: Option<&SshError>) {}

    /// A connection arrived on a forward listener with no pending
    /// `open_forward_channel` claim. Call `Channel::set_delegate` to receive
    /// its data.
    fn did_open_forward_channel(&self, _session: &Session, _channel: &Channel) {}
}

pub trait ChannelDelegate: Send + Sync {
    fn did_open(&self, _channel: &Channel) {}

    fn did_read_stdout(&self, _channel: &Channel, _data: &[u8]) {}

    fn did_read_stderr(&self, _channel: &Channel, _data: &[u8]) {}

    /// Fired once per `write_data` call, after all of its bytes were accepted.
    fn did_write_data(&self, _channel: &Channel, _written: usize) {}

    fn did_receive_eof(&self, _channel: &Channel) {}

    /// `error` is `None` when the close was requested by the caller. An open
    /// request the server refused also ends here, carrying the refusal.
    fn did_close(&self, _channel: &Channel, _error: Option<&SshError>) {}

    /// Fired when a resize is acknowledged (or refused). `columns` and `rows`
    /// are the values now in effect.
    fn did_change_pty_size(
        &self,
        _channel: &Channel,
        _columns: u32,
        _rows: u32,
        _error: Option<&SshError>,
    ) {
    }
}
