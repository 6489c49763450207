//! Test fixtures: a loopback wire engine with a scripted server side, and
//! delegates that record what they are told.

pub(crate) mod sftp_server;

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};

use crate::channel::Channel;
use crate::sftp::SftpChannel;
use crate::ssh::auth::{AuthDecision, AuthMethod, KbiPrompt, KbiRequest};
use crate::ssh::config::{SessionConfig, SessionOptions};
use crate::ssh::delegate::{ChannelDelegate, SessionDelegate};
use crate::ssh::engine::{
    AuthAttempt, AuthReply, ChannelId, ConnectionId, EngineEvent, Handshake, Negotiated,
    OpenRequest, Target, WireEngine,
};
use crate::ssh::host_key::{HostKey, HostKeyType};
use crate::ssh::queue::ReadinessNotifier;
use crate::ssh::{Session, SshError};

use sftp_server::SftpServer;

pub(crate) const PASSWORD: &str = "secret";
/// Connecting here waits out the whole deadline
pub(crate) const UNREACHABLE_HOST: &str = "10.255.255.1";
pub(crate) const REFUSING_HOST: &str = "refused.invalid";
/// Direct channels to this host are refused by the server
pub(crate) const DENIED_HOST: &str = "denied.example";
/// Direct channels to this host echo on stderr
pub(crate) const STDERR_HOST: &str = "stderr.example";
/// Listening on this port is refused
pub(crate) const BUSY_PORT: u16 = 22;

pub(crate) const HOST_KEY: &str = "AAAAC3NzaC1lZDI1NTE5AAAAIENqyrs+ld8H3fu7xebmZZgCBkCiRTem7SkLeGma2NTf";

const DEFAULT_WINDOW: usize = 16 * 1024;
const WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub(crate) struct LoopbackConfig {
    pub(crate) methods: Vec<String>,
    pub(crate) accept_none: bool,
    /// A correct password only earns partial success; keyboard-interactive
    /// must follow
    pub(crate) second_factor: bool,
    pub(crate) window: usize,
    /// Sent as a userauth banner ahead of the first authentication reply
    pub(crate) issue_banner: Option<String>,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            methods: vec!["password".to_string(), "keyboard-interactive".to_string()],
            accept_none: false,
            second_factor: false,
            window: DEFAULT_WINDOW,
            issue_banner: None,
        }
    }
}

enum Peer {
    Echo { stderr: bool },
    Shell,
    Sftp(Box<SftpServer>),
}

struct PeerChannel {
    peer: Peer,
    window: usize,
}

struct LoopbackState {
    config: LoopbackConfig,
    events: VecDeque<EngineEvent>,
    notifier: Option<ReadinessNotifier>,
    connected: bool,
    allowed: Vec<String>,
    password_accepted: bool,
    channels: HashMap<ChannelId, PeerChannel>,
    listeners: HashMap<u32, (String, u16)>,
    offered: HashMap<ConnectionId, u16>,
    rejected: Vec<ConnectionId>,
    next_connection: ConnectionId,
    disconnects: usize,
}

impl LoopbackState {
    fn push(&mut self, event: EngineEvent) {
        self.events.push_back(event);
        if let Some(notifier) = &self.notifier {
            notifier.notify();
        }
    }

    fn failure(&self) -> AuthReply {
        AuthReply::Failure {
            methods: self.allowed.clone(),
            partial_success: false,
        }
    }
}

/// Engine half handed to the session
pub(crate) struct LoopbackEngine {
    state: Arc<Mutex<LoopbackState>>,
}

/// Server half kept by the test
#[derive(Clone)]
pub(crate) struct LoopbackRemote {
    state: Arc<Mutex<LoopbackState>>,
}

pub(crate) fn loopback(config: LoopbackConfig) -> (LoopbackEngine, LoopbackRemote) {
    let state = Arc::new(Mutex::new(LoopbackState {
        allowed: config.methods.clone(),
        config,
        events: VecDeque::new(),
        notifier: None,
        connected: false,
        password_accepted: false,
        channels: HashMap::new(),
        listeners: HashMap::new(),
        offered: HashMap::new(),
        rejected: Vec::new(),
        next_connection: 1,
        disconnects: 0,
    }));
    (
        LoopbackEngine {
            state: state.clone(),
        },
        LoopbackRemote { state },
    )
}

impl WireEngine for LoopbackEngine {
    fn connect(
        &mut self,
        target: &Target,
        options: &SessionOptions,
        deadline: Instant,
        notifier: ReadinessNotifier,
    ) -> Result<Handshake, SshError> {
        match target.host.as_str() {
            UNREACHABLE_HOST => {
                std::thread::sleep(deadline.saturating_duration_since(Instant::now()));
                return Err(SshError::Timeout(format!("{} did not answer", target.host)));
            }
            REFUSING_HOST => {
                return Err(SshError::ConnectionRefused(format!("{}:{}", target.host, target.port)))
            }
            _ => {}
        }
        let mut state = self.state.lock();
        state.notifier = Some(notifier);
        state.connected = true;
        let cipher = options
            .cipher_algorithms
            .as_ref()
            .and_then(|list| list.first().cloned())
            .unwrap_or_else(|| "aes256-ctr".to_string());
        Ok(Handshake {
            server_banner: Some("SSH-2.0-Loopback_1.0".to_string()),
            negotiated: Negotiated {
                kex: Some("curve25519-sha256".to_string()),
                cipher: Some(cipher),
                mac: Some("hmac-sha2-256".to_string()),
                host_key: Some("ssh-ed25519".to_string()),
            },
            host_key: HostKey::from_base64(HOST_KEY, HostKeyType::Ed25519)?,
            fd: None,
        })
    }

    fn authenticate(&mut self, _username: &str, attempt: AuthAttempt<'_>) -> Result<AuthReply, SshError> {
        let mut state = self.state.lock();
        if !state.connected {
            return Err(SshError::Disconnected);
        }
        if let Some(banner) = state.config.issue_banner.take() {
            state.push(EngineEvent::AuthBanner(banner));
        }
        let reply = match attempt {
            AuthAttempt::None if state.config.accept_none => AuthReply::Success,
            AuthAttempt::None | AuthAttempt::PublicKey(_) => state.failure(),
            AuthAttempt::Password(password) if password == PASSWORD => {
                if state.config.second_factor && !state.password_accepted {
                    state.password_accepted = true;
                    state.allowed = vec!["keyboard-interactive".to_string()];
                    AuthReply::Failure {
                        methods: state.allowed.clone(),
                        partial_success: true,
                    }
                } else {
                    AuthReply::Success
                }
            }
            AuthAttempt::Password(_) => state.failure(),
            AuthAttempt::KeyboardInteractiveStart => AuthReply::InfoRequest(KbiRequest {
                name: String::new(),
                instructions: "Second factor".to_string(),
                prompts: vec![KbiPrompt {
                    prompt: "Verification code: ".to_string(),
                    echo: false,
                }],
            }),
            AuthAttempt::KeyboardInteractiveRespond(responses) => {
                if responses == [PASSWORD] {
                    AuthReply::Success
                } else {
                    state.failure()
                }
            }
        };
        Ok(reply)
    }

    fn open_channel(&mut self, id: ChannelId, request: OpenRequest) -> Result<(), SshError> {
        let mut state = self.state.lock();
        if !state.connected {
            return Err(SshError::Disconnected);
        }
        let peer = match request {
            OpenRequest::DirectTcpip { host, .. } if host == DENIED_HOST => {
                state.push(EngineEvent::ChannelOpenFailed {
                    id,
                    error: SshError::ChannelError("administratively prohibited".to_string()),
                });
                return Ok(());
            }
            OpenRequest::DirectTcpip { host, .. } => Peer::Echo {
                stderr: host == STDERR_HOST,
            },
            OpenRequest::Shell { .. } => Peer::Shell,
            OpenRequest::Subsystem(name) if name == "sftp" => Peer::Sftp(Box::new(SftpServer::new())),
            OpenRequest::Subsystem(name) => {
                state.push(EngineEvent::ChannelOpenFailed {
                    id,
                    error: SshError::ChannelError(format!("unknown subsystem {}", name)),
                });
                return Ok(());
            }
        };
        let window = state.config.window;
        state.channels.insert(id, PeerChannel { peer, window });
        state.push(EngineEvent::ChannelOpened(id));
        Ok(())
    }

    fn accept_forwarded(&mut self, connection: ConnectionId, id: ChannelId) -> Result<(), SshError> {
        let mut state = self.state.lock();
        state
            .offered
            .remove(&connection)
            .ok_or_else(|| SshError::ChannelError(format!("no connection {}", connection)))?;
        let window = state.config.window;
        state.channels.insert(
            id,
            PeerChannel {
                peer: Peer::Echo { stderr: false },
                window,
            },
        );
        Ok(())
    }

    fn reject_forwarded(&mut self, connection: ConnectionId) {
        let mut state = self.state.lock();
        state.offered.remove(&connection);
        state.rejected.push(connection);
    }

    fn window(&self, id: ChannelId) -> usize {
        self.state
            .lock()
            .channels
            .get(&id)
            .map(|c| c.window)
            .unwrap_or(0)
    }

    fn write(&mut self, id: ChannelId, data: &[u8]) -> Result<usize, SshError> {
        let mut state = self.state.lock();
        let channel = state
            .channels
            .get_mut(&id)
            .ok_or_else(|| SshError::ChannelError(format!("no channel {}", id)))?;
        let len = data.len().min(channel.window);
        channel.window -= len;
        let accepted = &data[..len];
        let replies: Vec<EngineEvent> = match &mut channel.peer {
            Peer::Echo { stderr: true } => vec![EngineEvent::ExtendedData {
                id,
                data: Bytes::copy_from_slice(accepted),
            }],
            Peer::Echo { stderr: false } | Peer::Shell => vec![EngineEvent::Data {
                id,
                data: Bytes::copy_from_slice(accepted),
            }],
            Peer::Sftp(server) => server
                .feed(accepted)
                .into_iter()
                .map(|data| EngineEvent::Data { id, data })
                .collect(),
        };
        for event in replies {
            state.push(event);
        }
        Ok(len)
    }

    fn send_eof(&mut self, id: ChannelId) -> Result<(), SshError> {
        let mut state = self.state.lock();
        if matches!(state.channels.get(&id), Some(PeerChannel { peer: Peer::Echo { .. }, .. })) {
            state.push(EngineEvent::Eof(id));
        }
        Ok(())
    }

    fn close_channel(&mut self, id: ChannelId) -> Result<(), SshError> {
        let mut state = self.state.lock();
        if state.channels.remove(&id).is_some() {
            state.push(EngineEvent::Closed(id));
        }
        Ok(())
    }

    fn resize_pty(&mut self, id: ChannelId, columns: u32, rows: u32) -> Result<(), SshError> {
        let mut state = self.state.lock();
        if !matches!(state.channels.get(&id), Some(PeerChannel { peer: Peer::Shell, .. })) {
            return Err(SshError::ChannelError(format!("channel {} has no pty", id)));
        }
        let result = if columns == 0 || rows == 0 {
            Err(SshError::ChannelError("invalid terminal size".to_string()))
        } else {
            Ok(())
        };
        state.push(EngineEvent::PtyResized {
            id,
            columns,
            rows,
            result,
        });
        Ok(())
    }

    fn request_listen(&mut self, token: u32, host: &str, port: u16) -> Result<(), SshError> {
        let mut state = self.state.lock();
        if !state.connected {
            return Err(SshError::Disconnected);
        }
        if port == BUSY_PORT {
            state.push(EngineEvent::ListenFailed {
                token,
                error: SshError::RequestDenied(format!("{}:{} is in use", host, port)),
            });
            return Ok(());
        }
        let bound_port = if port == 0 { 40000 + token as u16 } else { port };
        state.listeners.insert(token, (host.to_string(), bound_port));
        state.push(EngineEvent::ListenBound { token, bound_port });
        Ok(())
    }

    fn cancel_listen(&mut self, token: u32) -> Result<(), SshError> {
        self.state.lock().listeners.remove(&token);
        Ok(())
    }

    fn poll_events(&mut self, wait: Duration) -> Vec<EngineEvent> {
        {
            let state = self.state.lock();
            let drained = state.channels.values().any(|c| c.window < state.config.window);
            if state.events.is_empty() && !drained && !wait.is_zero() {
                drop(state);
                std::thread::sleep(wait.min(Duration::from_millis(5)));
            }
        }
        let mut state = self.state.lock();
        let limit = state.config.window;
        let mut events: Vec<EngineEvent> = state.events.drain(..).collect();
        // The far end has consumed whatever it was sent.
        for (id, channel) in state.channels.iter_mut() {
            if channel.window < limit {
                channel.window = limit;
                events.push(EngineEvent::WindowAdjusted(*id));
            }
        }
        events
    }

    fn disconnect(&mut self) {
        let mut state = self.state.lock();
        state.connected = false;
        state.channels.clear();
        state.listeners.clear();
        state.offered.clear();
        state.notifier = None;
        state.disconnects += 1;
    }
}

impl LoopbackRemote {
    /// A client connects to a listener the server holds on `port`
    pub(crate) fn connect_to_listener(&self, port: u16) -> ConnectionId {
        let mut state = self.state.lock();
        let connection = state.next_connection;
        state.next_connection += 1;
        let listen_host = state
            .listeners
            .values()
            .find(|(_, bound)| *bound == port)
            .map(|(host, _)| host.clone())
            .unwrap_or_else(|| "0.0.0.0".to_string());
        state.offered.insert(connection, port);
        state.push(EngineEvent::ForwardedConnection {
            connection,
            listen_host,
            listen_port: port,
            originator_host: "192.0.2.7".to_string(),
            originator_port: 51000,
        });
        connection
    }

    /// Unsolicited output from the server on a channel
    pub(crate) fn send(&self, id: ChannelId, data: &[u8]) {
        self.state.lock().push(EngineEvent::Data {
            id,
            data: Bytes::copy_from_slice(data),
        });
    }

    /// The server closes a channel on its own
    pub(crate) fn close_channel(&self, id: ChannelId) {
        let mut state = self.state.lock();
        if state.channels.remove(&id).is_some() {
            state.push(EngineEvent::Closed(id));
        }
    }

    /// The TCP connection dies under the session
    pub(crate) fn drop_transport(&self) {
        self.state.lock().push(EngineEvent::Disconnected {
            error: Some(SshError::ConnectionFailed("connection reset by peer".to_string())),
        });
    }

    pub(crate) fn listener_count(&self) -> usize {
        self.state.lock().listeners.len()
    }

    pub(crate) fn rejected(&self) -> Vec<ConnectionId> {
        self.state.lock().rejected.clone()
    }

    pub(crate) fn disconnects(&self) -> usize {
        self.state.lock().disconnects
    }
}

/// Block until `predicate` holds for the guarded value or the wait runs out
fn wait_on<T>(lock: &Mutex<T>, cv: &Condvar, predicate: impl Fn(&T) -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    let mut guard = lock.lock();
    while !predicate(&guard) {
        if cv.wait_until(&mut guard, deadline).timed_out() {
            return predicate(&guard);
        }
    }
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AuthPlan {
    /// Password while it is offered, keyboard-interactive afterwards
    Adaptive,
    /// Always try this password
    Password(&'static str),
    KeyboardInteractive,
    GiveUp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SessionEvent {
    Banner(String),
    Negotiated(Negotiated),
    IssueBanner(String),
    Authenticated,
    Disconnected(Option<SshError>),
    ForwardChannel(ChannelId),
}

pub(crate) struct RecordingSession {
    trust: bool,
    plan: AuthPlan,
    kbi_answer: Option<&'static str>,
    /// Delegate for channels announced through `did_open_forward_channel`
    forward_delegate: Mutex<Option<Arc<RecordingChannel>>>,
    forwarded: Mutex<Vec<Channel>>,
    events: Mutex<Vec<SessionEvent>>,
    changed: Condvar,
}

impl RecordingSession {
    pub(crate) fn new(plan: AuthPlan) -> Arc<Self> {
        Arc::new(Self {
            plan,
            ..Self::base()
        })
    }

    pub(crate) fn distrusting() -> Arc<Self> {
        Arc::new(Self {
            trust: false,
            ..Self::base()
        })
    }

    pub(crate) fn cancelling_kbi(plan: AuthPlan) -> Arc<Self> {
        Arc::new(Self {
            plan,
            kbi_answer: None,
            ..Self::base()
        })
    }

    fn base() -> Self {
        Self {
            trust: true,
            plan: AuthPlan::Adaptive,
            kbi_answer: Some(PASSWORD),
            forward_delegate: Mutex::new(None),
            forwarded: Mutex::new(Vec::new()),
            events: Mutex::new(Vec::new()),
            changed: Condvar::new(),
        }
    }

    pub(crate) fn adopt_forwards(&self, delegate: Arc<RecordingChannel>) {
        *self.forward_delegate.lock() = Some(delegate);
    }

    /// Channels announced through `did_open_forward_channel`
    pub(crate) fn forwarded(&self) -> Vec<Channel> {
        self.forwarded.lock().clone()
    }

    fn record(&self, event: SessionEvent) {
        self.events.lock().push(event);
        self.changed.notify_all();
    }

    pub(crate) fn events(&self) -> Vec<SessionEvent> {
        self.events.lock().clone()
    }

    pub(crate) fn disconnects(&self) -> Vec<Option<SshError>> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                SessionEvent::Disconnected(error) => Some(error.clone()),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn wait_for(&self, predicate: impl Fn(&[SessionEvent]) -> bool) -> bool {
        wait_on(&self.events, &self.changed, |events| predicate(events))
    }
}

impl SessionDelegate for RecordingSession {
    fn should_trust_host_key(&self, _session: &Session, host_key: &HostKey) -> bool {
        self.trust && host_key.to_base64() == HOST_KEY
    }

    fn authenticate(&self, session: &Session, methods: &[AuthMethod], partial_success: bool) -> AuthDecision {
        let result = match self.plan {
            AuthPlan::GiveUp => return AuthDecision::Unsupported,
            AuthPlan::Password(password) => session.authenticate_with_password(password),
            AuthPlan::KeyboardInteractive => session.authenticate_with_keyboard_interactive(),
            AuthPlan::Adaptive => {
                if methods.contains(&AuthMethod::Password) && !partial_success {
                    session.authenticate_with_password(PASSWORD)
                } else if methods.contains(&AuthMethod::KeyboardInteractive) {
                    session.authenticate_with_keyboard_interactive()
                } else {
                    return AuthDecision::Unsupported;
                }
            }
        };
        match result {
            Ok(()) | Err(SshError::RequestDenied(_)) => AuthDecision::Handled,
            Err(e) => AuthDecision::Failed(e),
        }
    }

    fn keyboard_interactive(&self, _session: &Session, request: &KbiRequest) -> Option<Vec<String>> {
        self.kbi_answer
            .map(|answer| request.prompts.iter().map(|_| answer.to_string()).collect())
    }

    fn did_receive_server_banner(&self, _session: &Session, banner: &str) {
        self.record(SessionEvent::Banner(banner.to_string()));
    }

    fn did_negotiate(&self, _session: &Session, negotiated: &Negotiated) {
        self.record(SessionEvent::Negotiated(negotiated.clone()));
    }

    fn did_receive_issue_banner(&self, _session: &Session, banner: &str) {
        self.record(SessionEvent::IssueBanner(banner.to_string()));
    }

    fn did_authenticate(&self, _session: &Session) {
        self.record(SessionEvent::Authenticated);
    }

    fn did_disconnect(&self, _session: &Session, error: Option<&SshError>) {
        self.record(SessionEvent::Disconnected(error.cloned()));
    }

    fn did_open_forward_channel(&self, _session: &Session, channel: &Channel) {
        if let Some(delegate) = self.forward_delegate.lock().clone() {
            let weak: Weak<dyn ChannelDelegate> = Arc::downgrade(&delegate) as Weak<dyn ChannelDelegate>;
            let _ = channel.set_delegate(weak);
        }
        self.forwarded.lock().push(channel.clone());
        self.record(SessionEvent::ForwardChannel(channel.id()));
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct ChannelLog {
    pub(crate) opened: bool,
    pub(crate) stdout: Vec<u8>,
    pub(crate) stderr: Vec<u8>,
    pub(crate) written: Vec<usize>,
    pub(crate) eof: bool,
    /// Set once `did_close` fired, with its error
    pub(crate) closed: Option<Option<SshError>>,
    pub(crate) close_count: usize,
    pub(crate) sizes: Vec<(u32, u32, Option<SshError>)>,
}

#[derive(Default)]
pub(crate) struct RecordingChannel {
    log: Mutex<ChannelLog>,
    changed: Condvar,
}

impl RecordingChannel {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn weak(self: &Arc<Self>) -> Weak<dyn ChannelDelegate> {
        Arc::downgrade(self) as Weak<dyn ChannelDelegate>
    }

    fn update(&self, f: impl FnOnce(&mut ChannelLog)) {
        f(&mut self.log.lock());
        self.changed.notify_all();
    }

    pub(crate) fn log(&self) -> ChannelLog {
        self.log.lock().clone()
    }

    pub(crate) fn wait_for(&self, predicate: impl Fn(&ChannelLog) -> bool) -> bool {
        wait_on(&self.log, &self.changed, predicate)
    }
}

impl ChannelDelegate for RecordingChannel {
    fn did_open(&self, _channel: &Channel) {
        self.update(|log| log.opened = true);
    }

    fn did_read_stdout(&self, _channel: &Channel, data: &[u8]) {
        self.update(|log| log.stdout.extend_from_slice(data));
    }

    fn did_read_stderr(&self, _channel: &Channel, data: &[u8]) {
        self.update(|log| log.stderr.extend_from_slice(data));
    }

    fn did_write_data(&self, _channel: &Channel, written: usize) {
        self.update(|log| log.written.push(written));
    }

    fn did_receive_eof(&self, _channel: &Channel) {
        self.update(|log| log.eof = true);
    }

    fn did_close(&self, _channel: &Channel, error: Option<&SshError>) {
        self.update(|log| {
            log.closed = Some(error.cloned());
            log.close_count += 1;
        });
    }

    fn did_change_pty_size(&self, _channel: &Channel, columns: u32, rows: u32, error: Option<&SshError>) {
        self.update(|log| log.sizes.push((columns, rows, error.cloned())));
    }
}

/// Build a session over a fresh loopback engine without connecting it
pub(crate) fn session_with(
    host: &str,
    config: LoopbackConfig,
    delegate: &Arc<RecordingSession>,
) -> (Session, LoopbackRemote) {
    let (engine, remote) = loopback(config);
    let weak: Weak<dyn SessionDelegate> = Arc::downgrade(delegate) as Weak<dyn SessionDelegate>;
    let session = Session::with_engine(SessionConfig::new(host, 22, "test"), weak, Box::new(engine))
        .expect("session thread");
    (session, remote)
}

/// A session that has already connected and authenticated
pub(crate) fn connected_session() -> (Session, LoopbackRemote, Arc<RecordingSession>) {
    connected_session_with(LoopbackConfig::default())
}

pub(crate) fn connected_session_with(
    config: LoopbackConfig,
) -> (Session, LoopbackRemote, Arc<RecordingSession>) {
    let delegate = RecordingSession::new(AuthPlan::Adaptive);
    let (session, remote) = session_with("loopback.test", config, &delegate);
    session.connect(Some(WAIT)).expect("connect");
    (session, remote, delegate)
}

/// An authenticated session with an SFTP channel past its handshake
pub(crate) fn connected_sftp() -> (Session, SftpChannel, Arc<RecordingChannel>) {
    let (session, _remote, _delegate) = connected_session();
    let recorder = RecordingChannel::new();
    let sftp = session.open_sftp_channel(recorder.weak()).expect("sftp channel");
    assert!(recorder.wait_for(|log| log.opened));
    (session, sftp, recorder)
}
