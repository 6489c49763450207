//! Remote port forwarding
//!
//! The server listens on our behalf (`tcpip-forward`) and offers each
//! accepted connection back as a forwarded channel. Connections are matched
//! to listeners by bound port, then handed to the oldest pending
//! `open_forward_channel` claim, or announced through
//! `SessionDelegate::did_open_forward_channel` when nobody is waiting.

use std::future::Future;
use std::pin::Pin;
use std::sync::Weak;
use std::task::{Context as TaskContext, Poll};

use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::channel::state::{no_delegate, ChannelState};
use crate::channel::{ChannelKind, ChannelStage, ForwardOrigin};
use crate::sftp::SftpError;
use crate::ssh::core::{Notice, SessionCore};
use crate::ssh::engine::ConnectionId;
use crate::ssh::session::SessionInner;
use crate::ssh::SshError;

type ListenReply = oneshot::Sender<Result<ForwardListener, SshError>>;

pub(crate) struct ListenerState {
    host: String,
    requested_port: u16,
    bound_port: Option<u16>,
    pub(crate) reply: Option<ListenReply>,
}

/// An active listener on the server
#[derive(Clone)]
pub struct ForwardListener {
    session: Weak<SessionInner>,
    token: u32,
    host: String,
    requested_port: u16,
    bound_port: u16,
}

impl ForwardListener {
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port passed to `request_listening_on_address`
    pub fn requested_port(&self) -> u16 {
        self.requested_port
    }

    /// Port the server actually listens on
    pub fn bound_port(&self) -> u16 {
        self.bound_port
    }

    /// Stop listening. Channels already accepted stay open.
    pub fn close(&self) -> Result<(), SshError> {
        let Some(session) = self.session.upgrade() else {
            return Ok(());
        };
        let token = self.token;
        match session.run_sync(move |ctx| ctx.with_core(|core| core.cancel_listener(token))) {
            Ok(result) => result,
            Err(SshError::Disconnected) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl std::fmt::Debug for ForwardListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForwardListener")
            .field("host", &self.host)
            .field("requested_port", &self.requested_port)
            .field("bound_port", &self.bound_port)
            .finish()
    }
}

/// Completion of `Session::request_listening_on_address`.
///
/// Either block with `wait` or `.await` it.
pub struct ListenRequest {
    session: Weak<SessionInner>,
    rx: oneshot::Receiver<Result<ForwardListener, SshError>>,
}

impl ListenRequest {
    pub(crate) fn new(
        session: Weak<SessionInner>,
        rx: oneshot::Receiver<Result<ForwardListener, SshError>>,
    ) -> Self {
        Self { session, rx }
    }

    pub fn wait(self) -> Result<ForwardListener, SshError> {
        let session = self.session.upgrade().ok_or(SshError::Disconnected)?;
        session.wait_for(self.rx)?
    }
}

impl Future for ListenRequest {
    type Output = Result<ForwardListener, SshError>;

    fn poll(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().rx)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(SshError::Disconnected)))
    }
}

impl SessionCore {
    pub(crate) fn request_listen(
        &mut self,
        host: String,
        port: u16,
    ) -> Result<oneshot::Receiver<Result<ForwardListener, SshError>>, SshError> {
        self.require_connected()?;
        let token = self.allocate_listen_token();
        self.engine.request_listen(token, &host, port)?;
        info!(
            "Requested remote listener {}:{} (token {}) for session {}",
            host, port, token, self.id
        );
        let (tx, rx) = oneshot::channel();
        self.listeners.insert(
            token,
            ListenerState {
                host,
                requested_port: port,
                bound_port: None,
                reply: Some(tx),
            },
        );
        Ok(rx)
    }

    pub(crate) fn on_listen_bound(&mut self, token: u32, bound_port: u16) {
        let session = self.session.clone();
        let Some(listener) = self.listeners.get_mut(&token) else {
            return;
        };
        listener.bound_port = Some(bound_port);
        info!(
            "Remote listener {}:{} bound on port {} for session {}",
            listener.host, listener.requested_port, bound_port, self.id
        );
        let Some(reply) = listener.reply.take() else {
            return;
        };
        let handle = ForwardListener {
            session,
            token,
            host: listener.host.clone(),
            requested_port: listener.requested_port,
            bound_port,
        };
        if reply.send(Ok(handle)).is_err() {
            // Requester is gone; don't leave a listener nobody can close.
            warn!("Listener {} abandoned before it was bound, cancelling", token);
            self.listeners.remove(&token);
            if let Err(e) = self.engine.cancel_listen(token) {
                warn!("Failed to cancel remote listener {}: {}", token, e);
            }
        }
    }

    pub(crate) fn on_listen_failed(&mut self, token: u32, error: SshError) {
        if let Some(mut listener) = self.listeners.remove(&token) {
            warn!(
                "Remote listener {}:{} refused for session {}: {}",
                listener.host, listener.requested_port, self.id, error
            );
            if let Some(reply) = listener.reply.take() {
                let _ = reply.send(Err(error));
            }
        }
    }

    pub(crate) fn cancel_listener(&mut self, token: u32) -> Result<(), SshError> {
        let Some(listener) = self.listeners.remove(&token) else {
            return Ok(());
        };
        info!(
            "Closing remote listener {}:{} for session {}",
            listener.host,
            listener.bound_port.unwrap_or(listener.requested_port),
            self.id
        );
        if self.stage.has_transport() {
            self.engine.cancel_listen(token)?;
        }
        Ok(())
    }

    pub(crate) fn on_forwarded_connection(
        &mut self,
        connection: ConnectionId,
        listen_host: String,
        listen_port: u16,
        originator_host: String,
        originator_port: u16,
    ) {
        let known = self
            .listeners
            .values()
            .any(|listener| listener.bound_port == Some(listen_port));
        if !known {
            warn!(
                "Rejecting forwarded connection for unknown listener {}:{}",
                listen_host, listen_port
            );
            self.engine.reject_forwarded(connection);
            return;
        }

        let claimed = self.forward_claims.pop_front();
        let id = match claimed {
            Some(id) => id,
            None => {
                let id = self.allocate_channel_id();
                self.channels
                    .insert(id, ChannelState::new(id, ChannelKind::Forward, no_delegate()));
                id
            }
        };

        if let Err(e) = self.engine.accept_forwarded(connection, id) {
            warn!("Failed to accept forwarded connection: {}", e);
            if claimed.is_some() {
                self.finish_channel(id, Some(e), SftpError::NotOpen);
            } else {
                self.channels.remove(&id);
            }
            return;
        }

        info!(
            "Forwarded connection from {}:{} on {}:{} is channel {}",
            originator_host, originator_port, listen_host, listen_port, id
        );
        let Some(channel) = self.channels.get_mut(&id) else {
            return;
        };
        channel.engine_open = true;
        channel.shared.set_forward(ForwardOrigin {
            listen_host,
            listen_port,
            originator_host,
            originator_port,
        });
        if channel.stage == ChannelStage::Pending {
            channel.set_stage(ChannelStage::Open);
        }
        if claimed.is_none() {
            self.outbox.push_back(Notice::ForwardChannelOpened(id));
        }
        self.outbox.push_back(Notice::ChannelOpened(id));
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::channel::ChannelStage;
    use crate::ssh::SshError;
    use crate::testing::{connected_session, RecordingChannel, SessionEvent, BUSY_PORT};

    #[test]
    fn test_listen_on_any_port() {
        let (session, remote, _delegate) = connected_session();

        let listener = session
            .request_listening_on_address("127.0.0.1", 0)
            .unwrap()
            .wait()
            .unwrap();
        assert_eq!(listener.host(), "127.0.0.1");
        assert_eq!(listener.requested_port(), 0);
        assert!(listener.bound_port() > 40000);
        assert_eq!(remote.listener_count(), 1);

        let second = session
            .request_listening_on_address("127.0.0.1", 0)
            .unwrap()
            .wait()
            .unwrap();
        assert_ne!(second.bound_port(), listener.bound_port());
    }

    #[test]
    fn test_listen_on_fixed_port() {
        let (session, _remote, _delegate) = connected_session();
        let listener = session
            .request_listening_on_address("localhost", 8080)
            .unwrap()
            .wait()
            .unwrap();
        assert_eq!(listener.bound_port(), 8080);
    }

    #[test]
    fn test_refused_listen() {
        let (session, remote, _delegate) = connected_session();
        let result = session
            .request_listening_on_address("0.0.0.0", BUSY_PORT)
            .unwrap()
            .wait();
        assert!(matches!(result, Err(SshError::RequestDenied(_))));
        assert_eq!(remote.listener_count(), 0);
        assert!(session.is_connected());
    }

    #[test]
    fn test_listen_request_can_be_awaited() {
        let (session, _remote, _delegate) = connected_session();
        let request = session.request_listening_on_address("127.0.0.1", 2222).unwrap();

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        let listener = runtime.block_on(request).unwrap();
        assert_eq!(listener.bound_port(), 2222);
    }

    #[test]
    fn test_claimed_connection_is_handed_to_waiting_channel() {
        let (session, remote, delegate) = connected_session();
        let listener = session
            .request_listening_on_address("127.0.0.1", 0)
            .unwrap()
            .wait()
            .unwrap();

        let recorder = RecordingChannel::new();
        let channel = session.open_forward_channel(recorder.weak()).unwrap();
        assert_eq!(channel.stage(), ChannelStage::Pending);

        remote.connect_to_listener(listener.bound_port());
        assert!(recorder.wait_for(|log| log.opened));
        assert!(channel.is_open());

        let origin = channel.forward_origin().unwrap();
        assert_eq!(origin.listen_host, "127.0.0.1");
        assert_eq!(origin.listen_port, listener.bound_port());
        assert_eq!(origin.originator_host, "192.0.2.7");
        assert_eq!(origin.originator_port, 51000);

        channel.write_data(&b"ping"[..]).unwrap();
        assert!(recorder.wait_for(|log| log.stdout == b"ping"));

        remote.send(channel.id(), b"pong");
        assert!(recorder.wait_for(|log| log.stdout == b"pingpong"));

        // A claimed connection is not announced to the session delegate.
        assert!(!delegate
            .events()
            .iter()
            .any(|event| matches!(event, SessionEvent::ForwardChannel(_))));
    }

    #[test]
    fn test_unclaimed_connection_is_announced() {
        let (session, remote, delegate) = connected_session();
        let adopted = RecordingChannel::new();
        delegate.adopt_forwards(Arc::clone(&adopted));
        let listener = session
            .request_listening_on_address("127.0.0.1", 0)
            .unwrap()
            .wait()
            .unwrap();

        remote.connect_to_listener(listener.bound_port());
        assert!(delegate.wait_for(|events| events
            .iter()
            .any(|event| matches!(event, SessionEvent::ForwardChannel(_)))));
        let forwarded = delegate.forwarded();
        assert_eq!(forwarded.len(), 1);
        let channel = &forwarded[0];
        assert_eq!(
            channel.forward_origin().map(|origin| origin.listen_port),
            Some(listener.bound_port())
        );

        remote.send(channel.id(), b"hello");
        assert!(adopted.wait_for(|log| log.stdout == b"hello"));
    }

    #[test]
    fn test_connection_to_unknown_port_is_rejected() {
        let (session, remote, delegate) = connected_session();
        let recorder = RecordingChannel::new();
        let _claim = session.open_forward_channel(recorder.weak()).unwrap();

        let connection = remote.connect_to_listener(9);
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while remote.rejected().is_empty() && std::time::Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert_eq!(remote.rejected(), vec![connection]);
        assert!(!recorder.log().opened);
        assert!(delegate.forwarded().is_empty());
    }

    #[test]
    fn test_closed_listener_stops_forwarding() {
        let (session, remote, _delegate) = connected_session();
        let listener = session
            .request_listening_on_address("127.0.0.1", 0)
            .unwrap()
            .wait()
            .unwrap();
        let port = listener.bound_port();

        listener.close().unwrap();
        listener.close().unwrap();
        assert_eq!(remote.listener_count(), 0);

        let connection = remote.connect_to_listener(port);
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while remote.rejected().is_empty() && std::time::Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert_eq!(remote.rejected(), vec![connection]);
    }

    #[test]
    fn test_disconnect_fails_claims_and_refuses_listening() {
        let (session, _remote, _delegate) = connected_session();
        let listener = session
            .request_listening_on_address("127.0.0.1", 0)
            .unwrap()
            .wait()
            .unwrap();
        let recorder = RecordingChannel::new();
        let _claim = session.open_forward_channel(recorder.weak()).unwrap();

        session.disconnect().unwrap();
        assert!(recorder.wait_for(|log| log.closed.is_some()));
        assert!(listener.close().is_ok());
        assert!(session.request_listening_on_address("127.0.0.1", 0).is_err());
    }
}
