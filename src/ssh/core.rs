//! Session core
//!
//! `SessionCore` is all mutable session state. It lives inside a `Context`
//! owned by the session thread and is only ever touched there. Notifications
//! are staged in `outbox` while the core is borrowed and delivered once the
//! borrow is released, so delegates are free to call back into the session.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::oneshot::{self, error::TryRecvError};
use tracing::{debug, info, warn};

use crate::channel::state::ChannelState;
use crate::channel::{Channel, ChannelStage};
use crate::forwarding::remote::ListenerState;
use crate::sftp::file::ReadDispatch;
use crate::sftp::SftpError;

use super::config::SessionOptions;
use super::delegate::{ChannelDelegate, SessionDelegate};
use super::engine::{ChannelId, EngineEvent, Negotiated, Target, WireEngine};
use super::error::SshError;
use super::queue::{QueueItem, ReadinessNotifier};
use super::session::{Session, SessionInner, SessionSnapshot, SessionStage};

/// Upper bound on poll/dispatch/flush rounds per service pass
const MAX_SERVICE_ROUNDS: usize = 64;

/// Engine wait used while a blocking call pumps the session in place
const INLINE_POLL_WAIT: Duration = Duration::from_millis(50);

/// Notifications waiting for delivery, in the order they were produced
pub(crate) enum Notice {
    ServerBanner(String),
    Negotiated(Negotiated),
    IssueBanner(String),
    Authenticated,
    Disconnected(Option<SshError>),
    ForwardChannelOpened(ChannelId),
    ChannelOpened(ChannelId),
    ChannelData {
        id: ChannelId,
        data: Bytes,
        stderr: bool,
    },
    ChannelWrote {
        id: ChannelId,
        len: usize,
    },
    ChannelEof(ChannelId),
    ChannelClosed {
        id: ChannelId,
        error: Option<SshError>,
    },
    PtySizeChanged {
        id: ChannelId,
        columns: u32,
        rows: u32,
        error: Option<SshError>,
    },
    ReadChunk {
        handlers: Arc<ReadDispatch>,
        data: Bytes,
        total: u64,
    },
    ReadFinished {
        handlers: Arc<ReadDispatch>,
        result: Result<u64, SftpError>,
    },
}

#[derive(Debug, Default)]
pub(crate) struct AuthState {
    /// Method names the server will currently accept
    pub(crate) allowed: Vec<String>,
    pub(crate) partial_success: bool,
    /// Delegate rounds so far
    pub(crate) rounds: u32,
}

pub(crate) struct SessionCore {
    pub(crate) id: u64,
    pub(crate) target: Target,
    pub(crate) options: SessionOptions,
    pub(crate) stage: SessionStage,
    pub(crate) engine: Box<dyn WireEngine>,
    pub(crate) delegate: Weak<dyn SessionDelegate>,
    pub(crate) session: Weak<SessionInner>,
    pub(crate) snapshot: Arc<RwLock<SessionSnapshot>>,
    pub(crate) channels: BTreeMap<ChannelId, ChannelState>,
    next_channel_id: ChannelId,
    pub(crate) listeners: HashMap<u32, ListenerState>,
    next_listen_token: u32,
    /// Forward channels waiting for the next forwarded connection, oldest first
    pub(crate) forward_claims: VecDeque<ChannelId>,
    pub(crate) auth: AuthState,
    pub(crate) outbox: VecDeque<Notice>,
    pub(crate) notifier: ReadinessNotifier,
}

impl SessionCore {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: u64,
        target: Target,
        options: SessionOptions,
        engine: Box<dyn WireEngine>,
        delegate: Weak<dyn SessionDelegate>,
        session: Weak<SessionInner>,
        snapshot: Arc<RwLock<SessionSnapshot>>,
        notifier: ReadinessNotifier,
    ) -> Self {
        Self {
            id,
            target,
            options,
            stage: SessionStage::NotConnected,
            engine,
            delegate,
            session,
            snapshot,
            channels: BTreeMap::new(),
            next_channel_id: 1,
            listeners: HashMap::new(),
            next_listen_token: 1,
            forward_claims: VecDeque::new(),
            auth: AuthState::default(),
            outbox: VecDeque::new(),
            notifier,
        }
    }

    pub(crate) fn set_stage(&mut self, stage: SessionStage) {
        debug!(
            "Session {} stage {:?} -> {:?}",
            self.id, self.stage, stage
        );
        self.stage = stage;
        self.snapshot.write().stage = stage;
    }

    pub(crate) fn require_connected(&self) -> Result<(), SshError> {
        if self.stage.is_connected() {
            Ok(())
        } else {
            Err(SshError::InvalidStage(format!(
                "Session {} is not authenticated ({:?})",
                self.id, self.stage
            )))
        }
    }

    pub(crate) fn allocate_channel_id(&mut self) -> ChannelId {
        let id = self.next_channel_id;
        self.next_channel_id = self.next_channel_id.wrapping_add(1).max(1);
        id
    }

    pub(crate) fn allocate_listen_token(&mut self) -> u32 {
        let token = self.next_listen_token;
        self.next_listen_token = self.next_listen_token.wrapping_add(1).max(1);
        token
    }

    pub(crate) fn channel_handle(&self, state: &ChannelState) -> Channel {
        Channel::new(self.session.clone(), state.id, state.shared.clone())
    }

    /// Channels not yet closed
    pub(crate) fn channel_count(&self) -> usize {
        self.channels
            .values()
            .filter(|c| c.stage != ChannelStage::Closed)
            .count()
    }

    /// Tear down with `error`, returning it for the caller to propagate
    pub(crate) fn fail(&mut self, error: SshError) -> SshError {
        self.teardown(Some(error.clone()), false);
        error
    }

    /// Pump the wire engine: dispatch its events in order, then flush
    /// pending writes, until nothing moves.
    pub(crate) fn service(&mut self, wait: Duration) {
        if !self.stage.has_transport() {
            return;
        }
        let mut wait = wait;
        for _ in 0..MAX_SERVICE_ROUNDS {
            let events = self.engine.poll_events(wait);
            wait = Duration::ZERO;
            let had_events = !events.is_empty();
            for event in events {
                self.handle_event(event);
                if !self.stage.has_transport() {
                    return;
                }
            }
            let flushed = self.flush_channels();
            if !had_events && !flushed {
                return;
            }
        }
        // Still busy: take another turn after queued tasks.
        self.notifier.notify();
    }

    pub(super) fn handle_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::AuthBanner(banner) => {
                self.snapshot.write().issue_banner = Some(banner.clone());
                self.outbox.push_back(Notice::IssueBanner(banner));
            }
            EngineEvent::ChannelOpened(id) => self.on_channel_opened(id),
            EngineEvent::ChannelOpenFailed { id, error } => self.on_channel_open_failed(id, error),
            EngineEvent::Data { id, data } => self.on_channel_data(id, data, false),
            EngineEvent::ExtendedData { id, data } => self.on_channel_data(id, data, true),
            EngineEvent::WindowAdjusted(_) => {}
            EngineEvent::Eof(id) => self.on_channel_eof(id),
            EngineEvent::Closed(id) => self.on_channel_closed(id),
            EngineEvent::PtyResized {
                id,
                columns,
                rows,
                result,
            } => self.on_pty_resized(id, columns, rows, result),
            EngineEvent::ListenBound { token, bound_port } => self.on_listen_bound(token, bound_port),
            EngineEvent::ListenFailed { token, error } => self.on_listen_failed(token, error),
            EngineEvent::ForwardedConnection {
                connection,
                listen_host,
                listen_port,
                originator_host,
                originator_port,
            } => self.on_forwarded_connection(
                connection,
                listen_host,
                listen_port,
                originator_host,
                originator_port,
            ),
            EngineEvent::Disconnected { error } => {
                let error = error.unwrap_or_else(|| {
                    SshError::ConnectionFailed("Server closed the connection".to_string())
                });
                warn!("Transport lost for session {}: {}", self.id, error);
                self.teardown(Some(error), false);
            }
        }
    }

    /// Close every channel, fail every waiter, release the transport and
    /// announce the disconnect. Runs at most once.
    pub(crate) fn teardown(&mut self, error: Option<SshError>, caller_initiated: bool) {
        if self.stage == SessionStage::Disconnected {
            return;
        }
        let had_transport = self.stage.has_transport();
        info!(
            "Tearing down session {} ({}){}",
            self.id,
            if caller_initiated { "requested" } else { "failure" },
            error
                .as_ref()
                .map(|e| format!(": {}", e))
                .unwrap_or_default()
        );

        let sftp_error = SftpError::Session(error.clone().unwrap_or(SshError::Disconnected));
        let ids: Vec<ChannelId> = self
            .channels
            .iter()
            .filter(|(_, c)| c.stage != ChannelStage::Closed)
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            if caller_initiated && had_transport {
                if let Some(channel) = self.channels.get(&id) {
                    if channel.engine_open && !channel.close_sent {
                        let _ = self.engine.close_channel(id);
                    }
                }
            }
            self.finish_channel(id, error.clone(), sftp_error.clone());
        }
        self.forward_claims.clear();

        for (_, mut listener) in self.listeners.drain() {
            if let Some(reply) = listener.reply.take() {
                let _ = reply.send(Err(error.clone().unwrap_or(SshError::Disconnected)));
            }
        }

        if had_transport {
            self.engine.disconnect();
        }
        self.set_stage(SessionStage::Disconnected);
        if let Some(err) = &error {
            self.snapshot.write().last_error = Some(err.clone());
        }
        self.outbox.push_back(Notice::Disconnected(if caller_initiated {
            None
        } else {
            error
        }));
    }
}

/// The session thread's serialized execution context
pub(crate) struct Context {
    session_id: u64,
    core: RefCell<SessionCore>,
    notifier: ReadinessNotifier,
}

impl Context {
    pub(crate) fn new(core: SessionCore) -> Self {
        Self {
            session_id: core.id,
            notifier: core.notifier.clone(),
            core: RefCell::new(core),
        }
    }

    pub(crate) fn session_id(&self) -> u64 {
        self.session_id
    }

    /// Run `f` against the core, then deliver whatever it produced
    pub(crate) fn with_core<R>(&self, f: impl FnOnce(&mut SessionCore) -> R) -> R {
        let result = {
            let mut core = self.core.borrow_mut();
            f(&mut core)
        };
        self.deliver_notices();
        result
    }

    pub(crate) fn stage(&self) -> SessionStage {
        self.core.borrow().stage
    }

    pub(crate) fn last_error(&self) -> Option<SshError> {
        self.core.borrow().snapshot.read().last_error.clone()
    }

    /// A temporary public handle plus the delegate, if both are still alive
    pub(crate) fn session_and_delegate(&self) -> Option<(Session, Arc<dyn SessionDelegate>)> {
        let (inner, delegate) = {
            let core = self.core.borrow();
            (core.session.upgrade(), core.delegate.upgrade())
        };
        Some((Session::from_inner(inner?), delegate?))
    }

    pub(crate) fn service(&self, wait: Duration) {
        self.with_core(|core| core.service(wait));
    }

    /// Keep the session moving on this thread until `rx` resolves.
    ///
    /// Used when a blocking call is made from inside the session context,
    /// where waiting on the queue would deadlock.
    pub(crate) fn pump_until<T>(&self, mut rx: oneshot::Receiver<T>) -> Result<T, SshError> {
        loop {
            match rx.try_recv() {
                Ok(value) => return Ok(value),
                Err(TryRecvError::Closed) => return Err(SshError::Disconnected),
                Err(TryRecvError::Empty) => {}
            }
            if !self.stage().has_transport() {
                return Err(self.last_error().unwrap_or(SshError::Disconnected));
            }
            self.notifier.consume();
            self.service(INLINE_POLL_WAIT);
        }
    }

    /// Session thread main loop
    pub(crate) fn run(&self, mut rx: UnboundedReceiver<QueueItem>) {
        info!("Session queue started for session {}", self.session_id);

        while let Some(item) = rx.blocking_recv() {
            match item {
                QueueItem::Task(task) => task(self),
                QueueItem::TransportReady => self.notifier.consume(),
                QueueItem::Shutdown => {
                    info!("All handles dropped for session {}", self.session_id);
                    self.with_core(|core| core.teardown(None, true));
                    break;
                }
            }
            self.service(Duration::ZERO);
            if self.stage() == SessionStage::Disconnected {
                break;
            }
        }

        // Anything still queued observes the disconnected session.
        rx.close();
        while let Ok(item) = rx.try_recv() {
            if let QueueItem::Task(task) = item {
                task(self);
            }
        }
        if self.stage() != SessionStage::Disconnected {
            self.with_core(|core| core.teardown(None, true));
        }

        info!("Session queue terminated for session {}", self.session_id);
    }

    fn deliver_notices(&self) {
        loop {
            let next = self.core.borrow_mut().outbox.pop_front();
            match next {
                Some(notice) => self.deliver(notice),
                None => break,
            }
        }
    }

    fn deliver(&self, notice: Notice) {
        match notice {
            Notice::ServerBanner(banner) => {
                if let Some((session, delegate)) = self.session_and_delegate() {
                    delegate.did_receive_server_banner(&session, &banner);
                }
            }
            Notice::Negotiated(negotiated) => {
                if let Some((session, delegate)) = self.session_and_delegate() {
                    delegate.did_negotiate(&session, &negotiated);
                }
            }
            Notice::IssueBanner(banner) => {
                if let Some((session, delegate)) = self.session_and_delegate() {
                    delegate.did_receive_issue_banner(&session, &banner);
                }
            }
            Notice::Authenticated => {
                if let Some((session, delegate)) = self.session_and_delegate() {
                    delegate.did_authenticate(&session);
                }
            }
            Notice::Disconnected(error) => {
                if let Some((session, delegate)) = self.session_and_delegate() {
                    delegate.did_disconnect(&session, error.as_ref());
                }
            }
            Notice::ForwardChannelOpened(id) => {
                if let Some((channel, _)) = self.channel_parts(id) {
                    if let Some((session, delegate)) = self.session_and_delegate() {
                        delegate.did_open_forward_channel(&session, &channel);
                    }
                }
            }
            Notice::ChannelOpened(id) => {
                self.with_channel_delegate(id, |delegate, channel| delegate.did_open(channel));
            }
            Notice::ChannelData { id, data, stderr } => {
                self.with_channel_delegate(id, |delegate, channel| {
                    if stderr {
                        delegate.did_read_stderr(channel, &data)
                    } else {
                        delegate.did_read_stdout(channel, &data)
                    }
                });
            }
            Notice::ChannelWrote { id, len } => {
                self.with_channel_delegate(id, |delegate, channel| {
                    delegate.did_write_data(channel, len)
                });
            }
            Notice::ChannelEof(id) => {
                self.with_channel_delegate(id, |delegate, channel| delegate.did_receive_eof(channel));
            }
            Notice::PtySizeChanged {
                id,
                columns,
                rows,
                error,
            } => {
                if let Some((channel, delegate)) = self.channel_parts(id) {
                    if error.is_none() {
                        channel.shared().set_size(columns, rows);
                    }
                    if let Some(delegate) = delegate {
                        delegate.did_change_pty_size(&channel, columns, rows, error.as_ref());
                    }
                }
            }
            Notice::ChannelClosed { id, error } => {
                let removed = self.core.borrow_mut().channels.remove(&id);
                if let Some(state) = removed {
                    let channel = self.core.borrow().channel_handle(&state);
                    if let Some(delegate) = state.delegate.upgrade() {
                        delegate.did_close(&channel, error.as_ref());
                    }
                }
            }
            Notice::ReadChunk {
                handlers,
                data,
                total,
            } => handlers.chunk(data, total),
            Notice::ReadFinished { handlers, result } => handlers.finish(result),
        }
    }

    fn channel_parts(&self, id: ChannelId) -> Option<(Channel, Option<Arc<dyn ChannelDelegate>>)> {
        let core = self.core.borrow();
        core.channels
            .get(&id)
            .map(|state| (core.channel_handle(state), state.delegate.upgrade()))
    }

    fn with_channel_delegate(&self, id: ChannelId, f: impl FnOnce(&dyn ChannelDelegate, &Channel)) {
        if let Some((channel, Some(delegate))) = self.channel_parts(id) {
            f(delegate.as_ref(), &channel);
        }
    }
}
