//! Public session handle
//!
//! A `Session` is a cheap, cloneable handle. Every operation is forwarded to
//! the session thread: from any other thread it is queued and awaited, from
//! the session thread itself (inside a delegate notification) it runs in
//! place.

use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::sync::oneshot;
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::channel::{Channel, ChannelKind};
use crate::forwarding::remote::ListenRequest;
use crate::sftp::SftpChannel;

use super::auth::AuthMethod;
use super::config::SessionConfig;
use super::core::{Context, SessionCore};
use super::delegate::{ChannelDelegate, SessionDelegate};
use super::engine::{AuthAttempt, Negotiated, OpenRequest, Target, WireEngine};
use super::error::SshError;
use super::key_pair::KeyPair;
use super::queue::{current_context, enter_context, leave_context, QueueItem, ReadinessNotifier};
use super::russh_engine::RusshEngine;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Originator reported for direct-tcpip channels
const DIRECT_ORIGINATOR: (&str, u16) = ("127.0.0.1", 0);

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum SessionStage {
    Unknown = 0,
    #[default]
    NotConnected,
    Connecting,
    PreAuthenticate,
    Authenticating,
    Authenticated,
    Disconnected,
}

impl SessionStage {
    pub fn is_connected(self) -> bool {
        self == SessionStage::Authenticated
    }

    pub fn is_disconnected(self) -> bool {
        matches!(
            self,
            SessionStage::Unknown | SessionStage::NotConnected | SessionStage::Disconnected
        )
    }

    pub(crate) fn has_transport(self) -> bool {
        matches!(
            self,
            SessionStage::Connecting
                | SessionStage::PreAuthenticate
                | SessionStage::Authenticating
                | SessionStage::Authenticated
        )
    }
}

/// Values readable from any thread without a round trip
#[derive(Debug, Clone, Default)]
pub(crate) struct SessionSnapshot {
    pub(crate) stage: SessionStage,
    pub(crate) fd: Option<i32>,
    pub(crate) server_banner: Option<String>,
    pub(crate) issue_banner: Option<String>,
    pub(crate) negotiated: Negotiated,
    pub(crate) last_error: Option<SshError>,
}

pub(crate) struct SessionInner {
    id: u64,
    target: Target,
    default_timeout: Duration,
    tx: UnboundedSender<QueueItem>,
    snapshot: Arc<RwLock<SessionSnapshot>>,
}

impl SessionInner {
    /// Run `f` on the session thread and wait for its result
    pub(crate) fn run_sync<R, F>(&self, f: F) -> Result<R, SshError>
    where
        R: Send + 'static,
        F: FnOnce(&Context) -> R + Send + 'static,
    {
        if let Some(ctx) = current_context(self.id) {
            return Ok(f(&ctx));
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(QueueItem::Task(Box::new(move |ctx: &Context| {
                let _ = reply_tx.send(f(ctx));
            })))
            .map_err(|_| SshError::Disconnected)?;
        reply_rx.blocking_recv().map_err(|_| SshError::Disconnected)
    }

    /// Run `f` on the session thread without waiting for it
    pub(crate) fn run_async<F>(&self, f: F) -> Result<(), SshError>
    where
        F: FnOnce(&Context) + Send + 'static,
    {
        if let Some(ctx) = current_context(self.id) {
            f(&ctx);
            return Ok(());
        }
        self.post(f)
    }

    /// Queue `f` behind whatever the session thread is doing, even when
    /// called from that thread.
    pub(crate) fn post<F>(&self, f: F) -> Result<(), SshError>
    where
        F: FnOnce(&Context) + Send + 'static,
    {
        self.tx
            .send(QueueItem::Task(Box::new(f)))
            .map_err(|_| SshError::Disconnected)
    }

    /// Wait for a reply produced by the session thread
    pub(crate) fn wait_for<T>(&self, rx: oneshot::Receiver<T>) -> Result<T, SshError> {
        match current_context(self.id) {
            Some(ctx) => ctx.pump_until(rx),
            None => rx.blocking_recv().map_err(|_| SshError::Disconnected),
        }
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        debug!("Dropping last handle for session {}", self.id);
        let _ = self.tx.send(QueueItem::Shutdown);
    }
}

/// An SSH client session
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Create a session that speaks SSH over TCP. Nothing is sent until
    /// `connect`.
    pub fn new(config: SessionConfig, delegate: Weak<dyn SessionDelegate>) -> Result<Self, SshError> {
        let engine = RusshEngine::new()?;
        Self::with_engine(config, delegate, Box::new(engine))
    }

    /// Create a session over a caller-provided wire engine
    pub fn with_engine(
        config: SessionConfig,
        delegate: Weak<dyn SessionDelegate>,
        engine: Box<dyn WireEngine>,
    ) -> Result<Self, SshError> {
        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        let target = Target {
            host: config.host,
            port: config.port,
            username: config.username,
        };
        let (tx, rx) = mpsc::unbounded_channel();
        let notifier = ReadinessNotifier::new(&tx);
        let snapshot = Arc::new(RwLock::new(SessionSnapshot::default()));
        let inner = Arc::new(SessionInner {
            id,
            target: target.clone(),
            default_timeout: Duration::from_secs(config.options.connect_timeout_secs),
            tx,
            snapshot: snapshot.clone(),
        });

        let core = SessionCore::new(
            id,
            target,
            config.options,
            engine,
            delegate,
            Arc::downgrade(&inner),
            snapshot,
            notifier,
        );
        std::thread::Builder::new()
            .name(format!("sshmux-session-{}", id))
            .spawn(move || {
                let ctx = Rc::new(Context::new(core));
                enter_context(ctx.clone());
                ctx.run(rx);
                leave_context();
            })?;

        info!("Created session {}", id);
        Ok(Self { inner })
    }

    pub(crate) fn from_inner(inner: Arc<SessionInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn downgrade(&self) -> Weak<SessionInner> {
        Arc::downgrade(&self.inner)
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn host(&self) -> &str {
        &self.inner.target.host
    }

    pub fn port(&self) -> u16 {
        self.inner.target.port
    }

    pub fn username(&self) -> &str {
        &self.inner.target.username
    }

    pub fn stage(&self) -> SessionStage {
        self.inner.snapshot.read().stage
    }

    pub fn is_connected(&self) -> bool {
        self.stage().is_connected()
    }

    pub fn is_disconnected(&self) -> bool {
        self.stage().is_disconnected()
    }

    /// Socket descriptor of the transport, once connected
    pub fn fd(&self) -> Option<i32> {
        self.inner.snapshot.read().fd
    }

    /// The server's identification line, e.g. `SSH-2.0-OpenSSH_9.6`. The
    /// russh engine peeks it off the socket before key exchange, so it stays
    /// `None` when the server is slow to send it.
    pub fn server_banner(&self) -> Option<String> {
        self.inner.snapshot.read().server_banner.clone()
    }

    /// Last SSH_MSG_USERAUTH_BANNER text, if the server sent one
    pub fn issue_banner(&self) -> Option<String> {
        self.inner.snapshot.read().issue_banner.clone()
    }

    pub fn negotiated(&self) -> Negotiated {
        self.inner.snapshot.read().negotiated.clone()
    }

    /// Negotiated MAC. russh does not report it, so under the russh engine
    /// this is only set when `SessionOptions::mac_algorithms` names exactly
    /// one algorithm.
    pub fn hmac(&self) -> Option<String> {
        self.inner.snapshot.read().negotiated.mac.clone()
    }

    /// Negotiated cipher. Under the russh engine only known when
    /// `SessionOptions::cipher_algorithms` names exactly one.
    pub fn cipher(&self) -> Option<String> {
        self.inner.snapshot.read().negotiated.cipher.clone()
    }

    /// Negotiated key exchange. Under the russh engine only known when
    /// `SessionOptions::kex_algorithms` names exactly one.
    pub fn kex_algorithm(&self) -> Option<String> {
        self.inner.snapshot.read().negotiated.kex.clone()
    }

    pub fn host_key_algorithm(&self) -> Option<String> {
        self.inner.snapshot.read().negotiated.host_key.clone()
    }

    /// The error that ended the session, if it ended with one
    pub fn last_error(&self) -> Option<SshError> {
        self.inner.snapshot.read().last_error.clone()
    }

    /// Channels that have not finished closing
    pub fn channel_count(&self) -> usize {
        self.inner
            .run_sync(|ctx| ctx.with_core(|core| core.channel_count()))
            .unwrap_or(0)
    }

    /// Connect, verify the host key and authenticate.
    ///
    /// `timeout` bounds the transport handshake and defaults to the session
    /// options' connect timeout.
    pub fn connect(&self, timeout: Option<Duration>) -> Result<(), SshError> {
        let timeout = timeout.unwrap_or(self.inner.default_timeout);
        self.inner.run_sync(move |ctx| ctx.connect(timeout))?
    }

    /// Close every channel and the transport. Calling it again does nothing.
    pub fn disconnect(&self) -> Result<(), SshError> {
        match self
            .inner
            .run_sync(|ctx| ctx.with_core(|core| core.teardown(None, true)))
        {
            Ok(()) | Err(SshError::Disconnected) => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub fn authenticate_with_password(&self, password: &str) -> Result<(), SshError> {
        let password = Zeroizing::new(password.to_string());
        self.inner.run_sync(move |ctx| {
            ctx.with_core(|core| {
                core.attempt_auth(AuthMethod::Password, AuthAttempt::Password(password.as_str()))
            })
        })??;
        Ok(())
    }

    pub fn authenticate_with_key_pair(&self, key_pair: &KeyPair) -> Result<(), SshError> {
        let key_pair = key_pair.clone();
        self.inner.run_sync(move |ctx| {
            ctx.with_core(|core| {
                core.attempt_auth(AuthMethod::PublicKey, AuthAttempt::PublicKey(&key_pair))
            })
        })??;
        Ok(())
    }

    /// Run keyboard-interactive, answering prompts through
    /// `SessionDelegate::keyboard_interactive`.
    pub fn authenticate_with_keyboard_interactive(&self) -> Result<(), SshError> {
        self.inner
            .run_sync(|ctx| ctx.authenticate_keyboard_interactive())?
    }

    /// Open a direct-tcpip channel to `host:port` as seen from the server
    pub fn open_direct_channel(
        &self,
        host: &str,
        port: u16,
        delegate: Weak<dyn ChannelDelegate>,
    ) -> Result<Channel, SshError> {
        let kind = ChannelKind::DirectTcpip {
            target_host: host.to_string(),
            target_port: port,
        };
        let request = OpenRequest::DirectTcpip {
            host: host.to_string(),
            port,
            originator_host: DIRECT_ORIGINATOR.0.to_string(),
            originator_port: DIRECT_ORIGINATOR.1,
        };
        self.open_channel(kind, Some(request), delegate)
    }

    /// Open an interactive shell with a pseudo-terminal
    pub fn open_shell_channel(
        &self,
        term: &str,
        columns: u32,
        rows: u32,
        delegate: Weak<dyn ChannelDelegate>,
    ) -> Result<Channel, SshError> {
        let kind = ChannelKind::Shell {
            term: term.to_string(),
        };
        let request = OpenRequest::Shell {
            term: term.to_string(),
            columns,
            rows,
        };
        self.open_channel(kind, Some(request), delegate)
    }

    /// Start the SFTP subsystem. The channel reports `did_open` once the
    /// server has answered the version handshake.
    pub fn open_sftp_channel(&self, delegate: Weak<dyn ChannelDelegate>) -> Result<SftpChannel, SshError> {
        let request = OpenRequest::Subsystem("sftp".to_string());
        let channel = self.open_channel(ChannelKind::Sftp, Some(request), delegate)?;
        Ok(SftpChannel::new(channel))
    }

    /// Claim the next connection arriving on any forward listener
    pub fn open_forward_channel(&self, delegate: Weak<dyn ChannelDelegate>) -> Result<Channel, SshError> {
        self.open_channel(ChannelKind::Forward, None, delegate)
    }

    /// Ask the server to listen on `host:port` and forward connections here.
    /// Port 0 lets the server choose.
    pub fn request_listening_on_address(&self, host: &str, port: u16) -> Result<ListenRequest, SshError> {
        let host = host.to_string();
        let rx = self
            .inner
            .run_sync(move |ctx| ctx.with_core(|core| core.request_listen(host, port)))??;
        Ok(ListenRequest::new(self.downgrade(), rx))
    }

    fn open_channel(
        &self,
        kind: ChannelKind,
        request: Option<OpenRequest>,
        delegate: Weak<dyn ChannelDelegate>,
    ) -> Result<Channel, SshError> {
        self.inner
            .run_sync(move |ctx| ctx.with_core(|core| core.open_channel(kind, request, delegate)))?
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("target", &self.inner.target)
            .field("stage", &self.stage())
            .finish()
    }
}
