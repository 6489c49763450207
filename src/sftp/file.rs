//! Open remote files and directories

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::debug;

use super::channel::{expect_attrs, expect_names, expect_status, SftpChannel};
use super::error::{PartialWrite, SftpError};
use super::packet::Request;
use super::path_utils::join_remote_path;
use super::types::{DirEntry, FileAttributes, ListFilterAction, MAX_TRANSFER_CHUNK};

type ChunkFn = Box<dyn FnMut(&[u8]) + Send>;
type ProgressFn = Box<dyn FnMut(u64) + Send>;
type SuccessFn = Box<dyn FnOnce(u64) + Send>;
type FailureFn = Box<dyn FnOnce(SftpError) + Send>;

/// Callbacks for `SftpFile::async_read_file`.
///
/// Chunks arrive in file order on the session thread. Exactly one of
/// `on_success` (with the byte total) or `on_failure` fires, after the last
/// chunk.
#[derive(Default)]
pub struct ReadHandlers {
    on_chunk: Option<ChunkFn>,
    on_progress: Option<ProgressFn>,
    on_success: Option<SuccessFn>,
    on_failure: Option<FailureFn>,
    finished: bool,
}

impl ReadHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_chunk(mut self, f: impl FnMut(&[u8]) + Send + 'static) -> Self {
        self.on_chunk = Some(Box::new(f));
        self
    }

    /// Receives the running byte total after each chunk
    pub fn on_progress(mut self, f: impl FnMut(u64) + Send + 'static) -> Self {
        self.on_progress = Some(Box::new(f));
        self
    }

    pub fn on_success(mut self, f: impl FnOnce(u64) + Send + 'static) -> Self {
        self.on_success = Some(Box::new(f));
        self
    }

    pub fn on_failure(mut self, f: impl FnOnce(SftpError) + Send + 'static) -> Self {
        self.on_failure = Some(Box::new(f));
        self
    }

    pub(crate) fn chunk(&mut self, data: &[u8], total: u64) {
        if self.finished {
            return;
        }
        if let Some(on_chunk) = self.on_chunk.as_mut() {
            on_chunk(data);
        }
        if let Some(on_progress) = self.on_progress.as_mut() {
            on_progress(total);
        }
    }

    pub(crate) fn finish(&mut self, result: Result<u64, SftpError>) {
        if self.finished {
            return;
        }
        self.finished = true;
        match result {
            Ok(total) => {
                if let Some(on_success) = self.on_success.take() {
                    on_success(total);
                }
            }
            Err(error) => {
                if let Some(on_failure) = self.on_failure.take() {
                    on_failure(error);
                }
            }
        }
    }
}

enum ReadEvent {
    Chunk(Bytes, u64),
    Finished(Result<u64, SftpError>),
}

struct DispatchState {
    /// Taken while callbacks run
    handlers: Option<ReadHandlers>,
    backlog: VecDeque<ReadEvent>,
    finished: bool,
}

/// Delivers read events to a `ReadHandlers` on the session thread.
///
/// Callbacks may call back into the session, which pumps the channel and
/// can deliver further events for the same read before the callback
/// returns. Those are queued and run by the outer delivery in order.
pub(crate) struct ReadDispatch {
    state: Mutex<DispatchState>,
}

impl ReadDispatch {
    pub(crate) fn new(handlers: ReadHandlers) -> Self {
        Self {
            state: Mutex::new(DispatchState {
                handlers: Some(handlers),
                backlog: VecDeque::new(),
                finished: false,
            }),
        }
    }

    pub(crate) fn chunk(&self, data: Bytes, total: u64) {
        self.push(ReadEvent::Chunk(data, total));
    }

    pub(crate) fn finish(&self, result: Result<u64, SftpError>) {
        self.push(ReadEvent::Finished(result));
    }

    fn push(&self, event: ReadEvent) {
        let mut handlers = {
            let mut state = self.state.lock();
            if state.finished {
                return;
            }
            state.finished = matches!(event, ReadEvent::Finished(_));
            state.backlog.push_back(event);
            match state.handlers.take() {
                Some(handlers) => handlers,
                None => return,
            }
        };
        loop {
            let next = self.state.lock().backlog.pop_front();
            match next {
                Some(ReadEvent::Chunk(data, total)) => handlers.chunk(&data, total),
                Some(ReadEvent::Finished(result)) => handlers.finish(result),
                None => {
                    let mut state = self.state.lock();
                    // A nested delivery may have queued more since the pop.
                    if state.backlog.is_empty() {
                        state.handlers = Some(handlers);
                        return;
                    }
                }
            }
        }
    }
}

/// An open remote file
pub struct SftpFile {
    sftp: SftpChannel,
    handle: String,
    path: String,
    offset: AtomicU64,
    closed: AtomicBool,
}

impl SftpFile {
    pub(crate) fn new(sftp: SftpChannel, handle: String, path: String, offset: u64) -> Self {
        Self {
            sftp,
            handle,
            path,
            offset: AtomicU64::new(offset),
            closed: AtomicBool::new(false),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Offset the next `write` goes to
    pub fn offset(&self) -> u64 {
        self.offset.load(Ordering::Acquire)
    }

    pub fn seek(&self, offset: u64) {
        self.offset.store(offset, Ordering::Release);
    }

    pub fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    /// Write `data` at the current offset in chunks of at most 16 KiB. On
    /// failure the error says how many bytes made it.
    pub fn write(&self, data: &[u8]) -> Result<usize, PartialWrite> {
        if !self.is_open() {
            return Err(PartialWrite {
                written: 0,
                error: SftpError::NotOpen,
            });
        }
        let mut written = 0;
        for chunk in data.chunks(MAX_TRANSFER_CHUNK) {
            let offset = self.offset();
            let request = Request::Write {
                handle: self.handle.clone(),
                offset,
                data: Bytes::copy_from_slice(chunk),
            };
            match self.sftp.request(request).and_then(expect_status) {
                Ok(()) => {
                    written += chunk.len();
                    self.seek(offset + chunk.len() as u64);
                }
                Err(error) => return Err(PartialWrite { written, error }),
            }
        }
        Ok(written)
    }

    pub fn stat(&self) -> Result<FileAttributes, SftpError> {
        if !self.is_open() {
            return Err(SftpError::NotOpen);
        }
        expect_attrs(self.sftp.request(Request::Fstat {
            handle: self.handle.clone(),
        })?)
    }

    /// Stream the file from `start_offset` to its end. Returns once the read
    /// is started; progress is reported through `handlers`. Only one read
    /// may run per file.
    pub fn async_read_file(&self, start_offset: u64, handlers: ReadHandlers) -> Result<(), SftpError> {
        if !self.is_open() {
            return Err(SftpError::NotOpen);
        }
        self.sftp
            .start_read(self.handle.clone(), start_offset, Arc::new(ReadDispatch::new(handlers)))
    }

    pub fn close(&self) -> Result<(), SftpError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        expect_status(self.sftp.request(Request::Close {
            handle: self.handle.clone(),
        })?)
    }
}

impl Drop for SftpFile {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!("Closing dropped SFTP file {}", self.path);
            let _ = self.sftp.post(Request::Close {
                handle: self.handle.clone(),
            });
        }
    }
}

impl std::fmt::Debug for SftpFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SftpFile")
            .field("path", &self.path)
            .field("offset", &self.offset())
            .field("open", &self.is_open())
            .finish()
    }
}

/// An open remote directory
pub struct SftpDirectory {
    sftp: SftpChannel,
    handle: String,
    path: String,
    closed: AtomicBool,
}

impl SftpDirectory {
    pub(crate) fn new(sftp: SftpChannel, handle: String, path: String) -> Self {
        Self {
            sftp,
            handle,
            path,
            closed: AtomicBool::new(false),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Full remote path of an entry listed from this directory
    pub fn entry_path(&self, entry: &DirEntry) -> String {
        join_remote_path(&self.path, &entry.filename)
    }

    /// Read every entry. `filter` sees each entry in server order and may
    /// keep it, skip it, or stop the listing early.
    pub fn list_directory(
        &self,
        mut filter: Option<&mut dyn FnMut(&DirEntry) -> ListFilterAction>,
    ) -> Result<Vec<DirEntry>, SftpError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SftpError::NotOpen);
        }
        let mut entries = Vec::new();
        loop {
            let response = self.sftp.request(Request::Readdir {
                handle: self.handle.clone(),
            })?;
            let batch = match expect_names(response) {
                Ok(batch) => batch,
                Err(SftpError::Eof) => return Ok(entries),
                Err(e) => return Err(e),
            };
            for entry in batch {
                let action = match filter.as_deref_mut() {
                    Some(filter) => filter(&entry),
                    None => ListFilterAction::Add,
                };
                match action {
                    ListFilterAction::Add => entries.push(entry),
                    ListFilterAction::Ignore => {}
                    ListFilterAction::Cancel => return Ok(entries),
                }
            }
        }
    }

    pub fn close(&self) -> Result<(), SftpError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        expect_status(self.sftp.request(Request::Close {
            handle: self.handle.clone(),
        })?)
    }
}

impl Drop for SftpDirectory {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let _ = self.sftp.post(Request::Close {
                handle: self.handle.clone(),
            });
        }
    }
}
