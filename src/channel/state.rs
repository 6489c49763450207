//! Channel state owned by the session core

use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::sftp::channel::SftpState;
use crate::sftp::packet::{Request, SFTP_PROTOCOL_VERSION};
use crate::sftp::SftpError;
use crate::ssh::core::{Notice, SessionCore};
use crate::ssh::delegate::ChannelDelegate;
use crate::ssh::engine::{ChannelId, OpenRequest};
use crate::ssh::SshError;

use super::{Channel, ChannelKind, ChannelShared, ChannelStage};

/// Placeholder for channels nobody has claimed yet
pub(crate) struct NoDelegate;

impl ChannelDelegate for NoDelegate {}

pub(crate) fn no_delegate() -> Weak<dyn ChannelDelegate> {
    Weak::<NoDelegate>::new()
}

pub(crate) struct PendingWrite {
    data: Bytes,
    offset: usize,
    /// Report completion to the delegate; internal protocol traffic does not
    notify: bool,
}

impl PendingWrite {
    pub(crate) fn internal(data: Bytes) -> Self {
        Self {
            data,
            offset: 0,
            notify: false,
        }
    }
}

pub(crate) enum ChannelPayload {
    Stream,
    Sftp(Box<SftpState>),
}

pub(crate) struct ChannelState {
    pub(crate) id: ChannelId,
    pub(crate) shared: Arc<ChannelShared>,
    pub(crate) delegate: Weak<dyn ChannelDelegate>,
    pub(crate) payload: ChannelPayload,
    pub(crate) stage: ChannelStage,
    /// The engine has a live channel for this id
    pub(crate) engine_open: bool,
    pub(crate) close_requested: bool,
    pub(crate) eof_requested: bool,
    pub(crate) eof_sent: bool,
    pub(crate) close_sent: bool,
    pub(crate) writes: VecDeque<PendingWrite>,
}

impl ChannelState {
    pub(crate) fn new(id: ChannelId, kind: ChannelKind, delegate: Weak<dyn ChannelDelegate>) -> Self {
        let payload = match kind {
            ChannelKind::Sftp => ChannelPayload::Sftp(Box::new(SftpState::new())),
            _ => ChannelPayload::Stream,
        };
        Self {
            id,
            shared: Arc::new(ChannelShared::new(kind)),
            delegate,
            payload,
            stage: ChannelStage::Pending,
            engine_open: false,
            close_requested: false,
            eof_requested: false,
            eof_sent: false,
            close_sent: false,
            writes: VecDeque::new(),
        }
    }

    pub(crate) fn set_stage(&mut self, stage: ChannelStage) {
        debug!("Channel {} {:?} -> {:?}", self.id, self.stage, stage);
        self.stage = stage;
        self.shared.set_stage(stage);
    }

    fn can_send(&self) -> bool {
        self.engine_open && !self.close_sent && self.stage != ChannelStage::Closed
    }
}

impl SessionCore {
    pub(crate) fn open_channel(
        &mut self,
        kind: ChannelKind,
        request: Option<OpenRequest>,
        delegate: Weak<dyn ChannelDelegate>,
    ) -> Result<Channel, SshError> {
        self.require_connected()?;
        let id = self.allocate_channel_id();
        let state = ChannelState::new(id, kind, delegate);
        if let Some(OpenRequest::Shell { columns, rows, .. }) = &request {
            state.shared.set_size(*columns, *rows);
        }
        let channel = self.channel_handle(&state);

        match request {
            Some(request) => {
                debug!("Opening channel {} on session {}: {:?}", id, self.id, request);
                self.engine.open_channel(id, request)?;
            }
            None => {
                debug!("Channel {} waits for a forwarded connection", id);
                self.forward_claims.push_back(id);
            }
        }
        self.channels.insert(id, state);
        Ok(channel)
    }

    /// Queue a caller write. Refused once a close was requested, since the
    /// bytes could no longer reach the peer.
    pub(crate) fn queue_write(&mut self, id: ChannelId, data: Bytes) -> Result<(), SshError> {
        let channel = self
            .channels
            .get_mut(&id)
            .ok_or_else(|| SshError::ChannelError(format!("Unknown channel {}", id)))?;
        if matches!(channel.stage, ChannelStage::Closing | ChannelStage::Closed) {
            debug!("Refusing write to channel {} in {:?}", id, channel.stage);
            return Err(SshError::InvalidStage(format!(
                "Channel {} is {:?}",
                id, channel.stage
            )));
        }
        channel.writes.push_back(PendingWrite {
            data,
            offset: 0,
            notify: true,
        });
        self.notifier.notify();
        Ok(())
    }

    pub(crate) fn request_eof(&mut self, id: ChannelId) {
        if let Some(channel) = self.channels.get_mut(&id) {
            channel.eof_requested = true;
            self.notifier.notify();
        }
    }

    pub(crate) fn request_close(&mut self, id: ChannelId) {
        let Some(channel) = self.channels.get_mut(&id) else {
            return;
        };
        if channel.close_requested || channel.stage == ChannelStage::Closed {
            return;
        }
        channel.close_requested = true;

        // Nothing on the wire yet for an unclaimed forward channel.
        if self.forward_claims.contains(&id) {
            self.finish_channel(id, None, SftpError::NotOpen);
            return;
        }
        channel.set_stage(ChannelStage::Closing);
        self.notifier.notify();
    }

    pub(crate) fn resize_pty(&mut self, id: ChannelId, columns: u32, rows: u32) -> Result<(), SshError> {
        let channel = self
            .channels
            .get(&id)
            .ok_or_else(|| SshError::ChannelError(format!("Unknown channel {}", id)))?;
        if !matches!(channel.shared.kind, ChannelKind::Shell { .. }) {
            return Err(SshError::ChannelError(format!(
                "Channel {} has no terminal",
                id
            )));
        }
        if channel.stage != ChannelStage::Open {
            return Err(SshError::InvalidStage(format!(
                "Channel {} is {:?}",
                id, channel.stage
            )));
        }
        self.engine.resize_pty(id, columns, rows)
    }

    pub(crate) fn set_channel_delegate(&mut self, id: ChannelId, delegate: Weak<dyn ChannelDelegate>) {
        if let Some(channel) = self.channels.get_mut(&id) {
            channel.delegate = delegate;
        }
    }

    /// Mark a channel closed, fail its waiters and queue `did_close`.
    /// The entry itself is dropped once the notice is delivered.
    pub(crate) fn finish_channel(&mut self, id: ChannelId, error: Option<SshError>, sftp_error: SftpError) {
        let Some(channel) = self.channels.get_mut(&id) else {
            return;
        };
        if channel.stage == ChannelStage::Closed {
            return;
        }
        channel.set_stage(ChannelStage::Closed);
        channel.writes.clear();
        if let ChannelPayload::Sftp(sftp) = &mut channel.payload {
            sftp.fail_all(sftp_error, &mut self.outbox);
        }
        self.forward_claims.retain(|claim| *claim != id);
        info!("Channel {} closed on session {}", id, self.id);
        self.outbox.push_back(Notice::ChannelClosed { id, error });
    }

    /// Move queued bytes into the engine as far as windows allow, then
    /// carry out requested EOFs and closes. Returns whether anything moved.
    pub(crate) fn flush_channels(&mut self) -> bool {
        let mut progressed = false;
        let mut failed = Vec::new();

        for (id, channel) in self.channels.iter_mut() {
            if !channel.can_send() {
                continue;
            }
            while let Some(write) = channel.writes.front_mut() {
                let window = self.engine.window(*id);
                if window == 0 {
                    break;
                }
                let end = (write.offset + window).min(write.data.len());
                match self.engine.write(*id, &write.data[write.offset..end]) {
                    Ok(0) => break,
                    Ok(n) => {
                        write.offset += n;
                        progressed = true;
                    }
                    Err(e) => {
                        failed.push((*id, e));
                        break;
                    }
                }
                if write.offset < write.data.len() {
                    continue;
                }
                if let Some(done) = channel.writes.pop_front() {
                    if done.notify {
                        self.outbox.push_back(Notice::ChannelWrote {
                            id: *id,
                            len: done.data.len(),
                        });
                    }
                }
            }
            if !channel.writes.is_empty() {
                continue;
            }

            let wants_eof = channel.eof_requested || channel.stage == ChannelStage::Closing;
            if wants_eof && !channel.eof_sent {
                channel.eof_sent = true;
                progressed = true;
                if let Err(e) = self.engine.send_eof(*id) {
                    debug!("EOF on channel {} failed: {}", id, e);
                }
            }
            if channel.stage == ChannelStage::Closing && !channel.close_sent {
                channel.close_sent = true;
                progressed = true;
                if let Err(e) = self.engine.close_channel(*id) {
                    failed.push((*id, e));
                }
            }
        }

        for (id, error) in failed {
            warn!("Channel {} failed on session {}: {}", id, self.id, error);
            self.finish_channel(id, Some(error), SftpError::ConnectionLost);
        }
        progressed
    }

    pub(crate) fn on_channel_opened(&mut self, id: ChannelId) {
        let Some(channel) = self.channels.get_mut(&id) else {
            warn!("Open confirmation for unknown channel {}", id);
            return;
        };
        channel.engine_open = true;
        if matches!(channel.payload, ChannelPayload::Sftp(_)) {
            // Subsystem is up; the channel opens once VERSION arrives.
            let init = Request::Init {
                version: SFTP_PROTOCOL_VERSION,
            };
            match init.encode(0) {
                Ok(packet) => channel.writes.push_front(PendingWrite::internal(packet)),
                Err(e) => {
                    let error = SshError::ChannelError(format!("SFTP INIT: {}", e));
                    self.finish_channel(id, Some(error), e);
                }
            }
        } else if channel.stage == ChannelStage::Pending {
            channel.set_stage(ChannelStage::Open);
            self.outbox.push_back(Notice::ChannelOpened(id));
        }
    }

    pub(crate) fn on_channel_open_failed(&mut self, id: ChannelId, error: SshError) {
        let Some(channel) = self.channels.get(&id) else {
            return;
        };
        warn!("Channel {} refused on session {}: {}", id, self.id, error);
        let error = (!channel.close_requested).then_some(error);
        self.finish_channel(id, error, SftpError::NoConnection);
    }

    pub(crate) fn on_channel_data(&mut self, id: ChannelId, data: Bytes, stderr: bool) {
        let Some(channel) = self.channels.get_mut(&id) else {
            return;
        };
        if channel.stage == ChannelStage::Closed {
            return;
        }
        let received = match &mut channel.payload {
            ChannelPayload::Stream => {
                self.outbox.push_back(Notice::ChannelData { id, data, stderr });
                return;
            }
            ChannelPayload::Sftp(_) if stderr => {
                debug!("sftp stderr on channel {}: {} bytes", id, data.len());
                return;
            }
            ChannelPayload::Sftp(sftp) => sftp.receive(&data, &mut channel.writes, &mut self.outbox),
        };

        match received {
            Ok(Some(version)) => {
                info!("SFTP version {} on channel {}", version, id);
                channel.shared.set_sftp_version(version);
                if channel.stage == ChannelStage::Pending {
                    channel.set_stage(ChannelStage::Open);
                    self.outbox.push_back(Notice::ChannelOpened(id));
                }
                self.notifier.notify();
            }
            Ok(None) => {
                if !channel.writes.is_empty() {
                    self.notifier.notify();
                }
            }
            Err(e) => {
                warn!("SFTP protocol failure on channel {}: {}", id, e);
                if channel.engine_open && !channel.close_sent {
                    channel.close_sent = true;
                    let _ = self.engine.close_channel(id);
                }
                self.finish_channel(id, Some(SshError::ProtocolError(e.to_string())), e);
            }
        }
    }

    pub(crate) fn on_channel_eof(&mut self, id: ChannelId) {
        if let Some(channel) = self.channels.get(&id) {
            if channel.stage != ChannelStage::Closed {
                self.outbox.push_back(Notice::ChannelEof(id));
            }
        }
    }

    pub(crate) fn on_channel_closed(&mut self, id: ChannelId) {
        let Some(channel) = self.channels.get_mut(&id) else {
            return;
        };
        channel.engine_open = false;
        let error = (!channel.close_requested).then_some(SshError::ChannelClosedByRemote);
        self.finish_channel(id, error, SftpError::ConnectionLost);
    }

    pub(crate) fn on_pty_resized(
        &mut self,
        id: ChannelId,
        columns: u32,
        rows: u32,
        result: Result<(), SshError>,
    ) {
        let Some(channel) = self.channels.get(&id) else {
            return;
        };
        let notice = match result {
            Ok(()) => Notice::PtySizeChanged {
                id,
                columns,
                rows,
                error: None,
            },
            Err(error) => {
                let snapshot = channel.shared.snapshot.read();
                Notice::PtySizeChanged {
                    id,
                    columns: snapshot.columns,
                    rows: snapshot.rows,
                    error: Some(error),
                }
            }
        };
        self.outbox.push_back(notice);
    }
}
