//! SFTP over a session channel
//!
//! Requests are framed into the channel's write queue and matched to
//! replies by request id. Anything submitted before the server's VERSION
//! reply is held back and released in order once it arrives.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::channel::state::{ChannelPayload, PendingWrite};
use crate::channel::{Channel, ChannelStage};
use crate::ssh::core::{Notice, SessionCore};
use crate::ssh::engine::ChannelId;
use crate::ssh::SshError;

use super::error::{status, SftpError};
use super::file::{ReadDispatch, SftpDirectory, SftpFile};
use super::packet::{self, Request, Response};
use super::types::{DirEntry, FileAttributes, OpenFlags, MAX_TRANSFER_CHUNK};

type ReplySender = oneshot::Sender<Result<Response, SftpError>>;
pub(crate) type ReplyReceiver = oneshot::Receiver<Result<Response, SftpError>>;

enum PendingRequest {
    Reply(ReplySender),
    /// OPEN or OPENDIR; a HANDLE reply registers the handle
    Open(ReplySender),
    /// One step of a streaming read on this handle
    Read(String),
}

struct ActiveRead {
    offset: u64,
    total: u64,
    handlers: Arc<ReadDispatch>,
}

pub(crate) struct SftpState {
    decoder: BytesMut,
    version: Option<u32>,
    next_request_id: u32,
    pending: HashMap<u32, PendingRequest>,
    deferred: Vec<Bytes>,
    handles: HashSet<String>,
    reads: HashMap<String, ActiveRead>,
}

fn request_handle(request: &Request) -> Option<&String> {
    match request {
        Request::Close { handle }
        | Request::Read { handle, .. }
        | Request::Write { handle, .. }
        | Request::Fstat { handle }
        | Request::Fsetstat { handle, .. }
        | Request::Readdir { handle } => Some(handle),
        _ => None,
    }
}

impl SftpState {
    pub(crate) fn new() -> Self {
        Self {
            decoder: BytesMut::new(),
            version: None,
            next_request_id: 1,
            pending: HashMap::new(),
            deferred: Vec::new(),
            handles: HashSet::new(),
            reads: HashMap::new(),
        }
    }

    fn allocate_id(&mut self) -> u32 {
        let id = self.next_request_id;
        self.next_request_id = self.next_request_id.wrapping_add(1);
        id
    }

    fn send(&mut self, packet: Bytes, writes: &mut VecDeque<PendingWrite>) {
        if self.version.is_some() {
            writes.push_back(PendingWrite::internal(packet));
        } else {
            self.deferred.push(packet);
        }
    }

    pub(crate) fn submit(
        &mut self,
        request: Request,
        writes: &mut VecDeque<PendingWrite>,
        outbox: &mut VecDeque<Notice>,
    ) -> Result<ReplyReceiver, SftpError> {
        if let Some(handle) = request_handle(&request) {
            if !self.handles.contains(handle) {
                return Err(SftpError::NotOpen);
            }
        }
        if let Request::Close { handle } = &request {
            self.handles.remove(handle);
            if let Some(read) = self.reads.remove(handle) {
                outbox.push_back(Notice::ReadFinished {
                    handlers: read.handlers,
                    result: Err(SftpError::NotOpen),
                });
            }
        }

        let id = self.allocate_id();
        let packet = request.encode(id)?;
        let (tx, rx) = oneshot::channel();
        let pending = match request {
            Request::Open { .. } | Request::Opendir { .. } => PendingRequest::Open(tx),
            _ => PendingRequest::Reply(tx),
        };
        self.pending.insert(id, pending);
        self.send(packet, writes);
        Ok(rx)
    }

    pub(crate) fn start_read(
        &mut self,
        handle: String,
        offset: u64,
        handlers: Arc<ReadDispatch>,
        writes: &mut VecDeque<PendingWrite>,
    ) -> Result<(), SftpError> {
        if !self.handles.contains(&handle) {
            return Err(SftpError::NotOpen);
        }
        if self.reads.contains_key(&handle) {
            return Err(SftpError::Failure(
                "A read is already in progress on this file".to_string(),
            ));
        }
        self.reads.insert(
            handle.clone(),
            ActiveRead {
                offset,
                total: 0,
                handlers,
            },
        );
        if let Err(e) = self.send_read(handle.clone(), offset, writes) {
            self.reads.remove(&handle);
            return Err(e);
        }
        Ok(())
    }

    fn send_read(
        &mut self,
        handle: String,
        offset: u64,
        writes: &mut VecDeque<PendingWrite>,
    ) -> Result<(), SftpError> {
        let id = self.allocate_id();
        let packet = Request::Read {
            handle: handle.clone(),
            offset,
            len: MAX_TRANSFER_CHUNK as u32,
        }
        .encode(id)?;
        self.pending.insert(id, PendingRequest::Read(handle));
        self.send(packet, writes);
        Ok(())
    }

    /// Feed channel bytes in. Returns the protocol version when this data
    /// completed the handshake.
    pub(crate) fn receive(
        &mut self,
        data: &[u8],
        writes: &mut VecDeque<PendingWrite>,
        outbox: &mut VecDeque<Notice>,
    ) -> Result<Option<u32>, SftpError> {
        self.decoder.extend_from_slice(data);
        let mut ready = None;
        while let Some(frame) = packet::take_frame(&mut self.decoder)? {
            match Response::decode(frame)? {
                Response::Version { version, extensions } => {
                    if self.version.is_some() {
                        return Err(SftpError::Protocol("Duplicate VERSION".to_string()));
                    }
                    debug!("SFTP server extensions: {:?}", extensions);
                    self.version = Some(version);
                    for packet in self.deferred.drain(..) {
                        writes.push_back(PendingWrite::internal(packet));
                    }
                    ready = Some(version);
                }
                response => {
                    if self.version.is_none() {
                        return Err(SftpError::Protocol(
                            "Reply received before VERSION".to_string(),
                        ));
                    }
                    self.dispatch(response, writes, outbox);
                }
            }
        }
        Ok(ready)
    }

    fn dispatch(
        &mut self,
        response: Response,
        writes: &mut VecDeque<PendingWrite>,
        outbox: &mut VecDeque<Notice>,
    ) {
        let Some(id) = response.id() else {
            return;
        };
        let Some(pending) = self.pending.remove(&id) else {
            warn!("Dropping SFTP reply to unknown request {}", id);
            return;
        };
        match pending {
            PendingRequest::Reply(tx) => {
                let _ = tx.send(Ok(response));
            }
            PendingRequest::Open(tx) => {
                if let Response::Handle { handle, .. } = &response {
                    self.handles.insert(handle.clone());
                }
                let _ = tx.send(Ok(response));
            }
            PendingRequest::Read(handle) => self.on_read_reply(handle, response, writes, outbox),
        }
    }

    fn on_read_reply(
        &mut self,
        handle: String,
        response: Response,
        writes: &mut VecDeque<PendingWrite>,
        outbox: &mut VecDeque<Notice>,
    ) {
        // Gone when the handle was closed mid-read.
        let Some(mut read) = self.reads.remove(&handle) else {
            return;
        };
        let result = match response {
            Response::Data { data, .. } if !data.is_empty() => {
                let len = data.len() as u64;
                read.offset += len;
                read.total += len;
                outbox.push_back(Notice::ReadChunk {
                    handlers: read.handlers.clone(),
                    data,
                    total: read.total,
                });
                let offset = read.offset;
                match self.send_read(handle.clone(), offset, writes) {
                    Ok(()) => {
                        self.reads.insert(handle, read);
                        return;
                    }
                    Err(e) => Err(e),
                }
            }
            Response::Data { .. } => Ok(read.total),
            Response::Status {
                code: status::EOF, ..
            } => Ok(read.total),
            Response::Status { code, message, .. } => Err(SftpError::from_status(code, message)),
            other => Err(SftpError::Protocol(format!(
                "Unexpected reply to READ: {:?}",
                other
            ))),
        };
        outbox.push_back(Notice::ReadFinished {
            handlers: read.handlers,
            result,
        });
    }

    /// Fail everything outstanding; the channel is gone
    pub(crate) fn fail_all(&mut self, error: SftpError, outbox: &mut VecDeque<Notice>) {
        for (_, pending) in self.pending.drain() {
            match pending {
                PendingRequest::Reply(tx) | PendingRequest::Open(tx) => {
                    let _ = tx.send(Err(error.clone()));
                }
                PendingRequest::Read(_) => {}
            }
        }
        for (_, read) in self.reads.drain() {
            outbox.push_back(Notice::ReadFinished {
                handlers: read.handlers,
                result: Err(error.clone()),
            });
        }
        self.handles.clear();
        self.deferred.clear();
    }
}

impl SessionCore {
    fn sftp_parts(
        &mut self,
        id: ChannelId,
    ) -> Result<(&mut SftpState, &mut VecDeque<PendingWrite>, &mut VecDeque<Notice>), SftpError> {
        let channel = self.channels.get_mut(&id).ok_or(SftpError::NotOpen)?;
        if matches!(channel.stage, ChannelStage::Closing | ChannelStage::Closed) {
            return Err(SftpError::NotOpen);
        }
        match &mut channel.payload {
            ChannelPayload::Sftp(sftp) => Ok((sftp, &mut channel.writes, &mut self.outbox)),
            ChannelPayload::Stream => Err(SftpError::Protocol(format!(
                "Channel {} is not an SFTP channel",
                id
            ))),
        }
    }

    pub(crate) fn sftp_submit(&mut self, id: ChannelId, request: Request) -> Result<ReplyReceiver, SftpError> {
        let (sftp, writes, outbox) = self.sftp_parts(id)?;
        let rx = sftp.submit(request, writes, outbox)?;
        self.notifier.notify();
        Ok(rx)
    }

    pub(crate) fn sftp_start_read(
        &mut self,
        id: ChannelId,
        handle: String,
        offset: u64,
        handlers: Arc<ReadDispatch>,
    ) -> Result<(), SftpError> {
        let (sftp, writes, _) = self.sftp_parts(id)?;
        sftp.start_read(handle, offset, handlers, writes)?;
        self.notifier.notify();
        Ok(())
    }
}

pub(super) fn expect_status(response: Response) -> Result<(), SftpError> {
    match response {
        Response::Status {
            code: status::OK, ..
        } => Ok(()),
        Response::Status { code, message, .. } => Err(SftpError::from_status(code, message)),
        other => Err(unexpected(other)),
    }
}

pub(super) fn expect_handle(response: Response) -> Result<String, SftpError> {
    match response {
        Response::Handle { handle, .. } => Ok(handle),
        Response::Status { code, message, .. } => Err(SftpError::from_status(code, message)),
        other => Err(unexpected(other)),
    }
}

pub(super) fn expect_names(response: Response) -> Result<Vec<DirEntry>, SftpError> {
    match response {
        Response::Name { entries, .. } => Ok(entries),
        Response::Status { code, message, .. } => Err(SftpError::from_status(code, message)),
        other => Err(unexpected(other)),
    }
}

pub(super) fn expect_attrs(response: Response) -> Result<FileAttributes, SftpError> {
    match response {
        Response::Attrs { attrs, .. } => Ok(attrs),
        Response::Status { code, message, .. } => Err(SftpError::from_status(code, message)),
        other => Err(unexpected(other)),
    }
}

fn unexpected(response: Response) -> SftpError {
    SftpError::BadMessage(format!("Unexpected reply: {:?}", response))
}

fn single_name(response: Response) -> Result<String, SftpError> {
    expect_names(response)?
        .into_iter()
        .next()
        .map(|entry| entry.filename)
        .ok_or_else(|| SftpError::BadMessage("NAME reply without entries".to_string()))
}

/// An SFTP session running on a channel
#[derive(Clone, Debug)]
pub struct SftpChannel {
    channel: Channel,
}

impl SftpChannel {
    pub(crate) fn new(channel: Channel) -> Self {
        Self { channel }
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    pub fn is_open(&self) -> bool {
        self.channel.is_open()
    }

    /// Protocol version announced by the server, once the handshake is done
    pub fn version(&self) -> Option<u32> {
        self.channel.shared().sftp_version()
    }

    pub fn close(&self) -> Result<(), SshError> {
        self.channel.close()
    }

    /// Send `request` and wait for its reply
    pub(crate) fn request(&self, request: Request) -> Result<Response, SftpError> {
        let session = self.channel.session()?;
        let id = self.channel.id();
        let reply = session.run_sync(move |ctx| ctx.with_core(|core| core.sftp_submit(id, request)))??;
        session.wait_for(reply)?
    }

    /// Send `request` without waiting for the reply
    pub(crate) fn post(&self, request: Request) -> Result<(), SftpError> {
        let session = self.channel.session()?;
        let id = self.channel.id();
        session.post(move |ctx| {
            if let Err(e) = ctx.with_core(|core| core.sftp_submit(id, request)) {
                debug!("Background SFTP request on channel {} dropped: {}", id, e);
            }
        })?;
        Ok(())
    }

    pub(crate) fn start_read(
        &self,
        handle: String,
        offset: u64,
        handlers: Arc<ReadDispatch>,
    ) -> Result<(), SftpError> {
        let session = self.channel.session()?;
        let id = self.channel.id();
        session.run_sync(move |ctx| {
            ctx.with_core(|core| core.sftp_start_read(id, handle, offset, handlers))
        })?
    }

    /// Open a file for reading
    pub fn open_file(&self, path: &str) -> Result<SftpFile, SftpError> {
        self.open_file_with(path, OpenFlags::READ, 0)
    }

    /// Open with explicit flags. `mode` applies when the file is created; 0
    /// leaves it to the server.
    pub fn open_file_with(&self, path: &str, flags: OpenFlags, mode: u32) -> Result<SftpFile, SftpError> {
        let attrs = if mode == 0 {
            FileAttributes::default()
        } else {
            FileAttributes::with_permissions(mode)
        };
        let response = self.request(Request::Open {
            path: path.to_string(),
            flags,
            attrs,
        })?;
        let handle = expect_handle(response)?;
        Ok(SftpFile::new(self.clone(), handle, path.to_string(), 0))
    }

    /// Open for writing, creating the file if needed. With `should_resume`
    /// writing continues at the current end of the file, otherwise the file
    /// is truncated.
    pub fn open_file_for_write(&self, path: &str, should_resume: bool, mode: u32) -> Result<SftpFile, SftpError> {
        let mut flags = OpenFlags::WRITE | OpenFlags::CREATE;
        if !should_resume {
            flags = flags | OpenFlags::TRUNCATE;
        }
        let file = self.open_file_with(path, flags, mode)?;
        if should_resume {
            let size = file.stat()?.size.unwrap_or(0);
            file.seek(size);
        }
        Ok(file)
    }

    pub fn open_directory(&self, path: &str) -> Result<SftpDirectory, SftpError> {
        let response = self.request(Request::Opendir {
            path: path.to_string(),
        })?;
        let handle = expect_handle(response)?;
        Ok(SftpDirectory::new(self.clone(), handle, path.to_string()))
    }

    /// Resolve `path` to an absolute path on the server
    pub fn canonicalize_path(&self, path: &str) -> Result<String, SftpError> {
        single_name(self.request(Request::Realpath {
            path: path.to_string(),
        })?)
    }

    pub fn stat(&self, path: &str) -> Result<FileAttributes, SftpError> {
        expect_attrs(self.request(Request::Stat {
            path: path.to_string(),
        })?)
    }

    /// Like `stat` but does not follow a final symlink
    pub fn lstat(&self, path: &str) -> Result<FileAttributes, SftpError> {
        expect_attrs(self.request(Request::Lstat {
            path: path.to_string(),
        })?)
    }

    pub fn chmod(&self, path: &str, mode: u32) -> Result<(), SftpError> {
        expect_status(self.request(Request::Setstat {
            path: path.to_string(),
            attrs: FileAttributes::with_permissions(mode),
        })?)
    }

    pub fn rename(&self, from: &str, to: &str) -> Result<(), SftpError> {
        expect_status(self.request(Request::Rename {
            from: from.to_string(),
            to: to.to_string(),
        })?)
    }

    /// v3 has no "already exists" status, so a FAILURE for a path that
    /// exists is reported as `FileAlreadyExists`.
    pub fn mkdir(&self, path: &str, mode: u32) -> Result<(), SftpError> {
        let result = expect_status(self.request(Request::Mkdir {
            path: path.to_string(),
            attrs: FileAttributes::with_permissions(mode),
        })?);
        match result {
            Err(SftpError::Failure(message)) if self.lstat(path).is_ok() => {
                Err(SftpError::FileAlreadyExists(message))
            }
            other => other,
        }
    }

    pub fn rmdir(&self, path: &str) -> Result<(), SftpError> {
        expect_status(self.request(Request::Rmdir {
            path: path.to_string(),
        })?)
    }

    /// Remove a file
    pub fn unlink(&self, path: &str) -> Result<(), SftpError> {
        expect_status(self.request(Request::Remove {
            path: path.to_string(),
        })?)
    }

    /// Create `link_path` pointing at `target_path`
    pub fn symlink(&self, link_path: &str, target_path: &str) -> Result<(), SftpError> {
        expect_status(self.request(Request::Symlink {
            link_path: link_path.to_string(),
            target_path: target_path.to_string(),
        })?)
    }

    pub fn readlink(&self, path: &str) -> Result<String, SftpError> {
        single_name(self.request(Request::Readlink {
            path: path.to_string(),
        })?)
    }
}
