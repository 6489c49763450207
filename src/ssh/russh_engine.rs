//! Wire engine backed by russh
//!
//! russh is async, the session core is not. The engine owns a small tokio
//! runtime: blocking calls (`connect`, `authenticate`) run with `block_on`
//! on the session thread, while every open channel gets a pump task that
//! moves data between russh and a shared event queue. Pushing an event
//! wakes the session through its `ReadinessNotifier`.

use std::borrow::Cow;
use std::collections::{HashMap, VecDeque};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use russh::client::{self, DisconnectReason, Msg};
use russh::keys::{Algorithm, PublicKey};
use russh::{Channel, ChannelMsg};
use tokio::net::TcpStream;
use tokio::runtime::Runtime;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

use super::config::SessionOptions;
use super::engine::{
    AuthAttempt, AuthReply, ChannelId, ConnectionId, EngineEvent, Handshake, Negotiated,
    OpenRequest, Target, WireEngine,
};
use super::error::SshError;
use super::handle_owner::{spawn_handle_owner_task, Credential, HandleController};
use super::host_key::HostKey;
use super::queue::ReadinessNotifier;

/// Bytes a channel may have in flight before writes are held back
const CHANNEL_WINDOW: usize = 256 * 1024;

/// How long connect waits for the server identification line before
/// starting key exchange without it
const SERVER_ID_WAIT: Duration = Duration::from_secs(1);

static NEXT_ENGINE_ID: AtomicU64 = AtomicU64::new(1);

/// State shared between the engine and its async tasks
struct EngineShared {
    events: Mutex<VecDeque<EngineEvent>>,
    ready: Condvar,
    notifier: Mutex<Option<ReadinessNotifier>>,
    host_key: Mutex<Option<PublicKey>>,
    incoming: Mutex<HashMap<ConnectionId, Channel<Msg>>>,
    next_connection: AtomicU64,
}

impl EngineShared {
    fn push(&self, event: EngineEvent) {
        self.events.lock().push_back(event);
        self.ready.notify_one();
        if let Some(notifier) = self.notifier.lock().as_ref() {
            notifier.notify();
        }
    }
}

enum ChannelCommand {
    Data(Bytes),
    Eof,
    Close,
    Resize { columns: u32, rows: u32 },
}

struct ChannelLink {
    cmd_tx: mpsc::UnboundedSender<ChannelCommand>,
    in_flight: Arc<AtomicUsize>,
}

/// Client handler for russh callbacks
struct EngineHandler {
    shared: Arc<EngineShared>,
}

impl client::Handler for EngineHandler {
    type Error = SshError;

    /// Trust is decided by the session delegate once the handshake is
    /// done; here the key is only captured.
    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        *self.shared.host_key.lock() = Some(server_public_key.clone());
        Ok(true)
    }

    async fn auth_banner(&mut self, banner: &str, _session: &mut client::Session) -> Result<(), Self::Error> {
        debug!("Server sent a {} byte authentication banner", banner.len());
        self.shared.push(EngineEvent::AuthBanner(banner.to_string()));
        Ok(())
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<client::Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        info!(
            "Server opened forwarded-tcpip channel: {}:{} from {}:{}",
            connected_address, connected_port, originator_address, originator_port
        );
        let connection = self.shared.next_connection.fetch_add(1, Ordering::Relaxed);
        self.shared.incoming.lock().insert(connection, channel);
        self.shared.push(EngineEvent::ForwardedConnection {
            connection,
            listen_host: connected_address.to_string(),
            listen_port: connected_port as u16,
            originator_host: originator_address.to_string(),
            originator_port: originator_port as u16,
        });
        Ok(())
    }

    async fn disconnected(&mut self, reason: DisconnectReason<Self::Error>) -> Result<(), Self::Error> {
        let error = match reason {
            DisconnectReason::ReceivedDisconnect(_) => {
                info!("Server sent disconnect");
                None
            }
            DisconnectReason::Error(e) => {
                warn!("Transport failed: {}", e);
                Some(e)
            }
        };
        self.shared.push(EngineEvent::Disconnected { error });
        Ok(())
    }
}

pub struct RusshEngine {
    id: u64,
    runtime: Option<Runtime>,
    shared: Arc<EngineShared>,
    controller: Option<HandleController>,
    channels: HashMap<ChannelId, ChannelLink>,
    listeners: Arc<Mutex<HashMap<u32, (String, u32)>>>,
    auth_timeout: Duration,
}

impl RusshEngine {
    pub fn new() -> Result<Self, SshError> {
        let id = NEXT_ENGINE_ID.fetch_add(1, Ordering::Relaxed);
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name(format!("sshmux-engine-{}", id))
            .enable_all()
            .build()?;
        Ok(Self {
            id,
            runtime: Some(runtime),
            shared: Arc::new(EngineShared {
                events: Mutex::new(VecDeque::new()),
                ready: Condvar::new(),
                notifier: Mutex::new(None),
                host_key: Mutex::new(None),
                incoming: Mutex::new(HashMap::new()),
                next_connection: AtomicU64::new(1),
            }),
            controller: None,
            channels: HashMap::new(),
            listeners: Arc::new(Mutex::new(HashMap::new())),
            auth_timeout: Duration::from_secs(SessionOptions::default().connect_timeout_secs),
        })
    }

    fn runtime(&self) -> Result<&Runtime, SshError> {
        self.runtime.as_ref().ok_or(SshError::Disconnected)
    }

    fn controller(&self) -> Result<HandleController, SshError> {
        self.controller.clone().ok_or(SshError::Disconnected)
    }

    fn link(&self, id: ChannelId) -> Result<&ChannelLink, SshError> {
        self.channels
            .get(&id)
            .ok_or_else(|| SshError::ChannelError(format!("Channel {} is not open", id)))
    }

    fn send_command(&self, id: ChannelId, command: ChannelCommand) -> Result<(), SshError> {
        self.link(id)?
            .cmd_tx
            .send(command)
            .map_err(|_| SshError::ChannelError(format!("Channel {} is closed", id)))
    }

    /// Start the pump for an established channel
    fn attach(&mut self, id: ChannelId, channel: Channel<Msg>) -> Result<(), SshError> {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let shared = self.shared.clone();
        let pump_in_flight = in_flight.clone();
        self.runtime()?
            .spawn(run_channel_pump(id, channel, cmd_rx, pump_in_flight, shared));
        self.channels.insert(id, ChannelLink { cmd_tx, in_flight });
        Ok(())
    }
}

fn unsupported(category: &str, name: &str) -> SshError {
    SshError::NegotiationFailure(format!("Unsupported {} algorithm: {}", category, name))
}

fn build_client_config(options: &SessionOptions) -> Result<client::Config, SshError> {
    let mut preferred = russh::Preferred::default();
    if let Some(names) = &options.kex_algorithms {
        let kex = names
            .iter()
            .map(|n| russh::kex::Name::try_from(n.as_str()).map_err(|_| unsupported("kex", n)))
            .collect::<Result<Vec<_>, _>>()?;
        preferred.kex = Cow::Owned(kex);
    }
    if let Some(names) = &options.host_key_algorithms {
        let keys = names
            .iter()
            .map(|n| Algorithm::from_str(n).map_err(|_| unsupported("host key", n)))
            .collect::<Result<Vec<_>, _>>()?;
        preferred.key = Cow::Owned(keys);
    }
    if let Some(names) = &options.cipher_algorithms {
        let ciphers = names
            .iter()
            .map(|n| russh::cipher::Name::try_from(n.as_str()).map_err(|_| unsupported("cipher", n)))
            .collect::<Result<Vec<_>, _>>()?;
        preferred.cipher = Cow::Owned(ciphers);
    }
    if let Some(names) = &options.mac_algorithms {
        let macs = names
            .iter()
            .map(|n| russh::mac::Name::try_from(n.as_str()).map_err(|_| unsupported("mac", n)))
            .collect::<Result<Vec<_>, _>>()?;
        preferred.mac = Cow::Owned(macs);
    }
    let compression: &[&str] = if options.compression {
        &["zlib@openssh.com", "zlib", "none"]
    } else {
        &["none"]
    };
    preferred.compression = Cow::Owned(
        compression
            .iter()
            .map(|n| {
                russh::compression::Name::try_from(*n).map_err(|_| unsupported("compression", n))
            })
            .collect::<Result<Vec<_>, _>>()?,
    );

    let mut config = client::Config {
        inactivity_timeout: None,
        keepalive_interval: Some(Duration::from_secs(30)),
        keepalive_max: 3,
        preferred,
        ..Default::default()
    };
    if let Some(banner) = &options.client_banner {
        config.client_id = russh::SshId::Standard(banner.clone());
    }
    Ok(config)
}

#[cfg(unix)]
/// The `SSH-` identification line in `buf`, without its line ending.
/// Lines before it are allowed and skipped.
fn parse_server_id(buf: &[u8]) -> Option<String> {
    let mut rest = buf;
    while let Some(end) = rest.iter().position(|b| *b == b'\n') {
        let line = &rest[..end];
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.starts_with(b"SSH-") {
            return Some(String::from_utf8_lossy(line).into_owned());
        }
        rest = &rest[end + 1..];
    }
    None
}

/// russh keeps the server identification to itself, so read it off the
/// socket without consuming it.
async fn peek_server_id(stream: &TcpStream, deadline: tokio::time::Instant) -> Option<String> {
    let deadline = deadline.min(tokio::time::Instant::now() + SERVER_ID_WAIT);
    let mut buf = [0u8; 1024];
    loop {
        let n = match tokio::time::timeout_at(deadline, stream.peek(&mut buf)).await {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => {
                debug!("Peeking server identification failed: {}", e);
                return None;
            }
            Err(_) => return None,
        };
        if n == 0 {
            return None;
        }
        if let Some(id) = parse_server_id(&buf[..n]) {
            return Some(id);
        }
        if n == buf.len() || tokio::time::Instant::now() >= deadline {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// The one algorithm a category can settle on when the caller pinned it
fn pinned(algorithms: &Option<Vec<String>>) -> Option<String> {
    match algorithms.as_deref() {
        Some([only]) => Some(only.clone()),
        _ => None,
    }
}

fn raw_fd(stream: &TcpStream) -> Option<i32> {
    use std::os::unix::io::AsRawFd;
    Some(stream.as_raw_fd())
}

#[cfg(not(unix))]
fn raw_fd(_stream: &TcpStream) -> Option<i32> {
    None
}

async fn open_remote_channel(
    controller: HandleController,
    request: OpenRequest,
) -> Result<Channel<Msg>, SshError> {
    match request {
        OpenRequest::DirectTcpip {
            host,
            port,
            originator_host,
            originator_port,
        } => {
            controller
                .open_direct_tcpip(&host, port as u32, &originator_host, originator_port as u32)
                .await
        }
        OpenRequest::Shell { term, columns, rows } => {
            let channel = controller.open_session_channel().await?;
            channel
                .request_pty(false, &term, columns, rows, 0, 0, &[])
                .await
                .map_err(|e| SshError::ChannelError(format!("PTY request failed: {}", e)))?;
            channel
                .request_shell(false)
                .await
                .map_err(|e| SshError::ChannelError(format!("Shell request failed: {}", e)))?;
            Ok(channel)
        }
        OpenRequest::Subsystem(name) => {
            let channel = controller.open_session_channel().await?;
            channel
                .request_subsystem(true, &name)
                .await
                .map_err(|e| SshError::ChannelError(format!("Subsystem {} failed: {}", name, e)))?;
            Ok(channel)
        }
    }
}

async fn run_channel_pump(
    id: ChannelId,
    mut channel: Channel<Msg>,
    mut cmd_rx: mpsc::UnboundedReceiver<ChannelCommand>,
    in_flight: Arc<AtomicUsize>,
    shared: Arc<EngineShared>,
) {
    debug!("Channel pump started for channel {}", id);

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(ChannelCommand::Data(data)) => {
                        let result = channel.data(&data[..]).await;
                        in_flight.fetch_sub(data.len(), Ordering::AcqRel);
                        if let Err(e) = result {
                            error!("Failed to send data on channel {}: {}", id, e);
                            shared.push(EngineEvent::Closed(id));
                            break;
                        }
                        shared.push(EngineEvent::WindowAdjusted(id));
                    }
                    Some(ChannelCommand::Eof) => {
                        if let Err(e) = channel.eof().await {
                            debug!("EOF on channel {} failed: {}", id, e);
                        }
                    }
                    Some(ChannelCommand::Close) => {
                        if let Err(e) = channel.close().await {
                            debug!("Close on channel {} failed: {}", id, e);
                        }
                    }
                    Some(ChannelCommand::Resize { columns, rows }) => {
                        let result = channel
                            .window_change(columns, rows, 0, 0)
                            .await
                            .map_err(|e| SshError::ChannelError(format!("Resize failed: {}", e)));
                        shared.push(EngineEvent::PtyResized { id, columns, rows, result });
                    }
                    None => {
                        // Engine went away
                        let _ = channel.close().await;
                        break;
                    }
                }
            }

            msg = channel.wait() => {
                match msg {
                    Some(ChannelMsg::Data { data }) => {
                        shared.push(EngineEvent::Data { id, data: Bytes::copy_from_slice(&data) });
                    }
                    Some(ChannelMsg::ExtendedData { data, ext }) => {
                        if ext == 1 {
                            shared.push(EngineEvent::ExtendedData { id, data: Bytes::copy_from_slice(&data) });
                        }
                    }
                    Some(ChannelMsg::Eof) => {
                        shared.push(EngineEvent::Eof(id));
                    }
                    Some(ChannelMsg::ExitStatus { exit_status }) => {
                        debug!("Channel {} exit status {}", id, exit_status);
                    }
                    Some(ChannelMsg::Close) | None => {
                        shared.push(EngineEvent::Closed(id));
                        break;
                    }
                    Some(_) => {}
                }
            }
        }
    }

    debug!("Channel pump terminated for channel {}", id);
}

impl WireEngine for RusshEngine {
    fn connect(
        &mut self,
        target: &Target,
        options: &SessionOptions,
        deadline: Instant,
        notifier: ReadinessNotifier,
    ) -> Result<Handshake, SshError> {
        let config = Arc::new(build_client_config(options)?);
        *self.shared.notifier.lock() = Some(notifier);
        self.auth_timeout = Duration::from_secs(options.connect_timeout_secs);

        let host = target.host.clone();
        let port = target.port;
        let handler = EngineHandler {
            shared: self.shared.clone(),
        };
        let deadline = tokio::time::Instant::from_std(deadline);

        let runtime = self.runtime()?;
        let (handle, fd, server_banner) = runtime.block_on(async move {
            let stream = tokio::time::timeout_at(deadline, TcpStream::connect((host.as_str(), port)))
                .await
                .map_err(|_| SshError::Timeout(format!("Connecting to {}:{} timed out", host, port)))??;
            if let Err(e) = stream.set_nodelay(true) {
                warn!("Failed to set TCP_NODELAY: {}", e);
            }
            let fd = raw_fd(&stream);
            let server_id = peek_server_id(&stream, deadline).await;
            let handle = tokio::time::timeout_at(deadline, client::connect_stream(config, stream, handler))
                .await
                .map_err(|_| SshError::Timeout(format!("SSH handshake with {}:{} timed out", host, port)))??;
            Ok::<_, SshError>((handle, fd, server_id))
        })?;

        let key = self
            .shared
            .host_key
            .lock()
            .take()
            .ok_or_else(|| SshError::ProtocolError("Server presented no host key".to_string()))?;
        let blob = key
            .to_bytes()
            .map_err(|e| SshError::HostKeyMismatch(e.to_string()))?;
        let host_key = HostKey::from_blob(blob)?;

        let controller = {
            let _guard = runtime.enter();
            spawn_handle_owner_task(handle, self.id)
        };
        self.controller = Some(controller);

        // russh does not report the negotiated kex, cipher or MAC; they are
        // only known when the options leave a single choice.
        Ok(Handshake {
            server_banner,
            negotiated: Negotiated {
                kex: pinned(&options.kex_algorithms),
                cipher: pinned(&options.cipher_algorithms),
                mac: pinned(&options.mac_algorithms),
                host_key: Some(host_key.algorithm().to_string()),
            },
            host_key,
            fd,
        })
    }

    fn authenticate(&mut self, username: &str, attempt: AuthAttempt<'_>) -> Result<AuthReply, SshError> {
        let controller = self.controller()?;
        let credential = match attempt {
            AuthAttempt::None => Credential::None,
            AuthAttempt::Password(password) => {
                Credential::Password(Zeroizing::new(password.to_string()))
            }
            AuthAttempt::PublicKey(key_pair) => Credential::PublicKey {
                key: key_pair.private_key(),
                hash: key_pair
                    .is_rsa()
                    .then_some(russh::keys::ssh_key::HashAlg::Sha256),
            },
            AuthAttempt::KeyboardInteractiveStart => Credential::KeyboardInteractiveStart,
            AuthAttempt::KeyboardInteractiveRespond(responses) => {
                Credential::KeyboardInteractiveRespond(responses)
            }
        };
        let timeout = self.auth_timeout;
        self.runtime()?.block_on(async move {
            tokio::time::timeout(timeout, controller.authenticate(username, credential))
                .await
                .map_err(|_| SshError::Timeout("Authentication timed out".to_string()))?
        })
    }

    fn open_channel(&mut self, id: ChannelId, request: OpenRequest) -> Result<(), SshError> {
        let controller = self.controller()?;
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let shared = self.shared.clone();
        let pump_in_flight = in_flight.clone();

        self.runtime()?.spawn(async move {
            match open_remote_channel(controller, request).await {
                Ok(channel) => {
                    shared.push(EngineEvent::ChannelOpened(id));
                    run_channel_pump(id, channel, cmd_rx, pump_in_flight, shared).await;
                }
                Err(error) => shared.push(EngineEvent::ChannelOpenFailed { id, error }),
            }
        });
        self.channels.insert(id, ChannelLink { cmd_tx, in_flight });
        Ok(())
    }

    fn accept_forwarded(&mut self, connection: ConnectionId, id: ChannelId) -> Result<(), SshError> {
        let channel = self
            .shared
            .incoming
            .lock()
            .remove(&connection)
            .ok_or_else(|| SshError::ChannelError(format!("Forwarded connection {} is gone", connection)))?;
        self.attach(id, channel)
    }

    fn reject_forwarded(&mut self, connection: ConnectionId) {
        let channel = self.shared.incoming.lock().remove(&connection);
        if let (Some(channel), Some(runtime)) = (channel, self.runtime.as_ref()) {
            runtime.spawn(async move {
                let _ = channel.close().await;
            });
        }
    }

    fn window(&self, id: ChannelId) -> usize {
        self.channels
            .get(&id)
            .map(|link| CHANNEL_WINDOW.saturating_sub(link.in_flight.load(Ordering::Acquire)))
            .unwrap_or(0)
    }

    fn write(&mut self, id: ChannelId, data: &[u8]) -> Result<usize, SshError> {
        let link = self.link(id)?;
        let len = data.len().min(CHANNEL_WINDOW.saturating_sub(link.in_flight.load(Ordering::Acquire)));
        if len == 0 {
            return Ok(0);
        }
        link.in_flight.fetch_add(len, Ordering::AcqRel);
        if link
            .cmd_tx
            .send(ChannelCommand::Data(Bytes::copy_from_slice(&data[..len])))
            .is_err()
        {
            link.in_flight.fetch_sub(len, Ordering::AcqRel);
            return Err(SshError::ChannelError(format!("Channel {} is closed", id)));
        }
        Ok(len)
    }

    fn send_eof(&mut self, id: ChannelId) -> Result<(), SshError> {
        self.send_command(id, ChannelCommand::Eof)
    }

    fn close_channel(&mut self, id: ChannelId) -> Result<(), SshError> {
        let result = self.send_command(id, ChannelCommand::Close);
        if result.is_err() {
            // Pump already finished and reported the close.
            self.channels.remove(&id);
            return Ok(());
        }
        result
    }

    fn resize_pty(&mut self, id: ChannelId, columns: u32, rows: u32) -> Result<(), SshError> {
        self.send_command(id, ChannelCommand::Resize { columns, rows })
    }

    fn request_listen(&mut self, token: u32, host: &str, port: u16) -> Result<(), SshError> {
        let controller = self.controller()?;
        let shared = self.shared.clone();
        let listeners = self.listeners.clone();
        let host = host.to_string();

        self.runtime()?.spawn(async move {
            match controller.tcpip_forward(&host, port as u32).await {
                Ok(bound) => {
                    let bound = if bound == 0 { port as u32 } else { bound };
                    listeners.lock().insert(token, (host, bound));
                    shared.push(EngineEvent::ListenBound {
                        token,
                        bound_port: bound as u16,
                    });
                }
                Err(error) => shared.push(EngineEvent::ListenFailed { token, error }),
            }
        });
        Ok(())
    }

    fn cancel_listen(&mut self, token: u32) -> Result<(), SshError> {
        let Some((host, port)) = self.listeners.lock().remove(&token) else {
            return Ok(());
        };
        let controller = self.controller()?;
        self.runtime()?.spawn(async move {
            if let Err(e) = controller.cancel_tcpip_forward(&host, port).await {
                warn!("Failed to cancel remote forward {}:{}: {}", host, port, e);
            }
        });
        Ok(())
    }

    fn poll_events(&mut self, wait: Duration) -> Vec<EngineEvent> {
        let mut events = self.shared.events.lock();
        if events.is_empty() && !wait.is_zero() {
            self.shared.ready.wait_for(&mut events, wait);
        }
        let drained: Vec<EngineEvent> = events.drain(..).collect();
        drop(events);

        for event in &drained {
            if let EngineEvent::Closed(id) | EngineEvent::ChannelOpenFailed { id, .. } = event {
                self.channels.remove(id);
            }
        }
        drained
    }

    fn disconnect(&mut self) {
        self.channels.clear();
        self.shared.incoming.lock().clear();
        self.listeners.lock().clear();
        if let (Some(controller), Some(runtime)) = (self.controller.take(), self.runtime.as_ref()) {
            info!("Disconnecting wire engine {}", self.id);
            let _ = runtime.block_on(tokio::time::timeout(
                Duration::from_secs(5),
                controller.disconnect(),
            ));
        }
        *self.shared.notifier.lock() = None;
    }
}

impl Drop for RusshEngine {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}
