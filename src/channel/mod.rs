//! Channels multiplexed over a session
//!
//! A `Channel` is a handle: the state it reports is a snapshot kept current
//! by the session thread, and every action is forwarded to that thread.

pub(crate) mod state;

use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::ssh::delegate::ChannelDelegate;
use crate::ssh::engine::ChannelId;
use crate::ssh::session::SessionInner;
use crate::ssh::SshError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelStage {
    /// Open request sent, or waiting for a forwarded connection
    Pending,
    Open,
    /// Close requested; queued writes still drain first
    Closing,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelKind {
    DirectTcpip { target_host: String, target_port: u16 },
    /// Carries a connection accepted by a forward listener
    Forward,
    Shell { term: String },
    Sftp,
}

/// Where a forwarded connection came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardOrigin {
    pub listen_host: String,
    pub listen_port: u16,
    pub originator_host: String,
    pub originator_port: u16,
}

#[derive(Debug, Clone)]
pub(crate) struct ChannelSnapshot {
    pub(crate) stage: ChannelStage,
    pub(crate) columns: u32,
    pub(crate) rows: u32,
    pub(crate) forward: Option<ForwardOrigin>,
    pub(crate) sftp_version: Option<u32>,
}

pub(crate) struct ChannelShared {
    kind: ChannelKind,
    snapshot: RwLock<ChannelSnapshot>,
}

impl ChannelShared {
    pub(crate) fn new(kind: ChannelKind) -> Self {
        Self {
            kind,
            snapshot: RwLock::new(ChannelSnapshot {
                stage: ChannelStage::Pending,
                columns: 0,
                rows: 0,
                forward: None,
                sftp_version: None,
            }),
        }
    }

    pub(crate) fn stage(&self) -> ChannelStage {
        self.snapshot.read().stage
    }

    pub(crate) fn set_stage(&self, stage: ChannelStage) {
        self.snapshot.write().stage = stage;
    }

    pub(crate) fn set_size(&self, columns: u32, rows: u32) {
        let mut snapshot = self.snapshot.write();
        snapshot.columns = columns;
        snapshot.rows = rows;
    }

    pub(crate) fn set_forward(&self, origin: ForwardOrigin) {
        self.snapshot.write().forward = Some(origin);
    }

    pub(crate) fn set_sftp_version(&self, version: u32) {
        self.snapshot.write().sftp_version = Some(version);
    }

    pub(crate) fn sftp_version(&self) -> Option<u32> {
        self.snapshot.read().sftp_version
    }
}

/// One logical stream within a session
#[derive(Clone)]
pub struct Channel {
    session: Weak<SessionInner>,
    id: ChannelId,
    shared: Arc<ChannelShared>,
}

impl Channel {
    pub(crate) fn new(session: Weak<SessionInner>, id: ChannelId, shared: Arc<ChannelShared>) -> Self {
        Self {
            session,
            id,
            shared,
        }
    }

    pub(crate) fn shared(&self) -> &ChannelShared {
        &self.shared
    }

    pub(crate) fn session(&self) -> Result<Arc<SessionInner>, SshError> {
        self.session.upgrade().ok_or(SshError::Disconnected)
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn kind(&self) -> &ChannelKind {
        &self.shared.kind
    }

    pub fn stage(&self) -> ChannelStage {
        self.shared.stage()
    }

    pub fn is_open(&self) -> bool {
        self.stage() == ChannelStage::Open
    }

    pub fn target_host(&self) -> Option<&str> {
        match &self.shared.kind {
            ChannelKind::DirectTcpip { target_host, .. } => Some(target_host),
            _ => None,
        }
    }

    pub fn target_port(&self) -> Option<u16> {
        match &self.shared.kind {
            ChannelKind::DirectTcpip { target_port, .. } => Some(*target_port),
            _ => None,
        }
    }

    pub fn term(&self) -> Option<&str> {
        match &self.shared.kind {
            ChannelKind::Shell { term } => Some(term),
            _ => None,
        }
    }

    /// Terminal width in effect; 0 for channels without a terminal
    pub fn columns(&self) -> u32 {
        self.shared.snapshot.read().columns
    }

    pub fn rows(&self) -> u32 {
        self.shared.snapshot.read().rows
    }

    pub fn forward_origin(&self) -> Option<ForwardOrigin> {
        self.shared.snapshot.read().forward.clone()
    }

    /// Queue `data` for sending. Returns once the bytes are queued, not sent.
    /// Writes go out in call order, and `did_write_data` fires once all of
    /// this call's bytes were accepted.
    pub fn write_data(&self, data: impl Into<Bytes>) -> Result<(), SshError> {
        match self.stage() {
            ChannelStage::Closing | ChannelStage::Closed => {
                return Err(SshError::InvalidStage(format!(
                    "Channel {} is {:?}",
                    self.id,
                    self.stage()
                )))
            }
            ChannelStage::Pending | ChannelStage::Open => {}
        }
        let data = data.into();
        let id = self.id;
        self.session()?
            .run_sync(move |ctx| ctx.with_core(|core| core.queue_write(id, data)))?
    }

    /// Send EOF once queued writes have drained
    pub fn send_eof(&self) -> Result<(), SshError> {
        let id = self.id;
        self.session()?
            .run_async(move |ctx| ctx.with_core(|core| core.request_eof(id)))
    }

    /// Close after queued writes drain. Closing twice is harmless.
    pub fn close(&self) -> Result<(), SshError> {
        if self.stage() == ChannelStage::Closed {
            return Ok(());
        }
        let Some(session) = self.session.upgrade() else {
            return Ok(());
        };
        let id = self.id;
        match session.run_async(move |ctx| ctx.with_core(|core| core.request_close(id))) {
            Ok(()) | Err(SshError::Disconnected) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Resize a shell's terminal. Completion is reported through
    /// `did_change_pty_size`.
    pub fn change_pty_size(&self, columns: u32, rows: u32) -> Result<(), SshError> {
        let id = self.id;
        self.session()?
            .run_sync(move |ctx| ctx.with_core(|core| core.resize_pty(id, columns, rows)))?
    }

    /// Replace the delegate receiving this channel's notifications
    pub fn set_delegate(&self, delegate: Weak<dyn ChannelDelegate>) -> Result<(), SshError> {
        let id = self.id;
        self.session()?
            .run_sync(move |ctx| ctx.with_core(|core| core.set_channel_delegate(id, delegate)))
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("kind", &self.shared.kind)
            .field("stage", &self.stage())
            .finish()
    }
}
