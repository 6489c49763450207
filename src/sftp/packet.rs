//! SFTP v3 messages on top of `russh_sftp::protocol`
//!
//! `Request` and `Response` are the subset of packets the client speaks.
//! Serialization goes through `russh_sftp::protocol::Packet`; this module
//! only splits the length-prefixed frames out of channel data, which
//! arrives as events rather than as an async stream.

use std::collections::HashMap;

use bytes::{Buf, Bytes, BytesMut};
use russh_sftp::protocol::{self as wire, Packet, StatusCode};

use super::error::{status, SftpError};
use super::types::{DirEntry, FileAttributes, OpenFlags};

pub const SFTP_PROTOCOL_VERSION: u32 = 3;

/// Frames larger than this are treated as a protocol violation
pub const MAX_PACKET_LEN: usize = 256 * 1024;

/// Client to server messages
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Init { version: u32 },
    Open { path: String, flags: OpenFlags, attrs: FileAttributes },
    Close { handle: String },
    Read { handle: String, offset: u64, len: u32 },
    Write { handle: String, offset: u64, data: Bytes },
    Lstat { path: String },
    Fstat { handle: String },
    Setstat { path: String, attrs: FileAttributes },
    Fsetstat { handle: String, attrs: FileAttributes },
    Opendir { path: String },
    Readdir { handle: String },
    Remove { path: String },
    Mkdir { path: String, attrs: FileAttributes },
    Rmdir { path: String },
    Realpath { path: String },
    Stat { path: String },
    Rename { from: String, to: String },
    Readlink { path: String },
    Symlink { link_path: String, target_path: String },
}

/// Server to client messages
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Version { version: u32, extensions: Vec<(String, String)> },
    Status { id: u32, code: u32, message: String },
    Handle { id: u32, handle: String },
    Data { id: u32, data: Bytes },
    Name { id: u32, entries: Vec<DirEntry> },
    Attrs { id: u32, attrs: FileAttributes },
}

impl From<&FileAttributes> for wire::FileAttributes {
    fn from(attrs: &FileAttributes) -> Self {
        let mut out = wire::FileAttributes::default();
        out.size = attrs.size;
        out.uid = attrs.uid;
        out.gid = attrs.gid;
        out.permissions = attrs.permissions;
        out.atime = attrs.atime;
        out.mtime = attrs.mtime;
        out
    }
}

impl From<&wire::FileAttributes> for FileAttributes {
    fn from(attrs: &wire::FileAttributes) -> Self {
        FileAttributes {
            size: attrs.size,
            uid: attrs.uid,
            gid: attrs.gid,
            permissions: attrs.permissions,
            atime: attrs.atime,
            mtime: attrs.mtime,
        }
    }
}

fn wire_flags(flags: OpenFlags) -> wire::OpenFlags {
    wire::OpenFlags::from_bits_truncate(flags.bits())
}

/// Status codes outside v3 (later drafts add more) are sent as FAILURE
fn status_code(code: u32) -> StatusCode {
    match code {
        status::OK => StatusCode::Ok,
        status::EOF => StatusCode::Eof,
        status::NO_SUCH_FILE => StatusCode::NoSuchFile,
        status::PERMISSION_DENIED => StatusCode::PermissionDenied,
        status::BAD_MESSAGE => StatusCode::BadMessage,
        status::NO_CONNECTION => StatusCode::NoConnection,
        status::CONNECTION_LOST => StatusCode::ConnectionLost,
        status::OP_UNSUPPORTED => StatusCode::OpUnsupported,
        _ => StatusCode::Failure,
    }
}

fn encode_packet(packet: Packet) -> Result<Bytes, SftpError> {
    Bytes::try_from(packet).map_err(|e| SftpError::Protocol(e.to_string()))
}

fn decode_packet(mut body: Bytes) -> Result<Packet, SftpError> {
    Packet::try_from(&mut body).map_err(|e| SftpError::Protocol(e.to_string()))
}

impl Request {
    fn into_packet(self, id: u32) -> Packet {
        match self {
            Request::Init { version } => Packet::Init(wire::Init {
                version,
                extensions: HashMap::new(),
            }),
            Request::Open { path, flags, attrs } => Packet::Open(wire::Open {
                id,
                filename: path,
                pflags: wire_flags(flags),
                attrs: (&attrs).into(),
            }),
            Request::Close { handle } => Packet::Close(wire::Close { id, handle }),
            Request::Read {
                handle,
                offset,
                len,
            } => Packet::Read(wire::Read {
                id,
                handle,
                offset,
                len,
            }),
            Request::Write {
                handle,
                offset,
                data,
            } => Packet::Write(wire::Write {
                id,
                handle,
                offset,
                data: data.to_vec(),
            }),
            Request::Lstat { path } => Packet::Lstat(wire::Lstat { id, path }),
            Request::Fstat { handle } => Packet::Fstat(wire::Fstat { id, handle }),
            Request::Setstat { path, attrs } => Packet::SetStat(wire::SetStat {
                id,
                path,
                attrs: (&attrs).into(),
            }),
            Request::Fsetstat { handle, attrs } => Packet::FSetStat(wire::FSetStat {
                id,
                handle,
                attrs: (&attrs).into(),
            }),
            Request::Opendir { path } => Packet::OpenDir(wire::OpenDir { id, path }),
            Request::Readdir { handle } => Packet::ReadDir(wire::ReadDir { id, handle }),
            Request::Remove { path } => Packet::Remove(wire::Remove { id, filename: path }),
            Request::Mkdir { path, attrs } => Packet::MkDir(wire::MkDir {
                id,
                path,
                attrs: (&attrs).into(),
            }),
            Request::Rmdir { path } => Packet::RmDir(wire::RmDir { id, path }),
            Request::Realpath { path } => Packet::RealPath(wire::RealPath { id, path }),
            Request::Stat { path } => Packet::Stat(wire::Stat { id, path }),
            Request::Rename { from, to } => Packet::Rename(wire::Rename {
                id,
                oldpath: from,
                newpath: to,
            }),
            Request::Readlink { path } => Packet::ReadLink(wire::ReadLink { id, path }),
            // OpenSSH reads the target first, contrary to the draft.
            Request::Symlink {
                link_path,
                target_path,
            } => Packet::Symlink(wire::Symlink {
                id,
                linkpath: target_path,
                targetpath: link_path,
            }),
        }
    }

    /// Encode as a complete length-prefixed frame. `id` is ignored for INIT.
    pub fn encode(&self, id: u32) -> Result<Bytes, SftpError> {
        encode_packet(self.clone().into_packet(id))
    }

    /// Decode a frame body (without the length prefix). Returns the request id,
    /// which is 0 for INIT.
    pub fn decode(body: Bytes) -> Result<(u32, Request), SftpError> {
        let request = match decode_packet(body)? {
            Packet::Init(init) => (
                0,
                Request::Init {
                    version: init.version,
                },
            ),
            Packet::Open(open) => (
                open.id,
                Request::Open {
                    path: open.filename,
                    flags: OpenFlags::from_bits(open.pflags.bits()),
                    attrs: (&open.attrs).into(),
                },
            ),
            Packet::Close(close) => (close.id, Request::Close { handle: close.handle }),
            Packet::Read(read) => (
                read.id,
                Request::Read {
                    handle: read.handle,
                    offset: read.offset,
                    len: read.len,
                },
            ),
            Packet::Write(write) => (
                write.id,
                Request::Write {
                    handle: write.handle,
                    offset: write.offset,
                    data: Bytes::from(write.data),
                },
            ),
            Packet::Lstat(stat) => (stat.id, Request::Lstat { path: stat.path }),
            Packet::Fstat(stat) => (stat.id, Request::Fstat { handle: stat.handle }),
            Packet::SetStat(set) => (
                set.id,
                Request::Setstat {
                    path: set.path,
                    attrs: (&set.attrs).into(),
                },
            ),
            Packet::FSetStat(set) => (
                set.id,
                Request::Fsetstat {
                    handle: set.handle,
                    attrs: (&set.attrs).into(),
                },
            ),
            Packet::OpenDir(open) => (open.id, Request::Opendir { path: open.path }),
            Packet::ReadDir(read) => (read.id, Request::Readdir { handle: read.handle }),
            Packet::Remove(remove) => (remove.id, Request::Remove { path: remove.filename }),
            Packet::MkDir(mkdir) => (
                mkdir.id,
                Request::Mkdir {
                    path: mkdir.path,
                    attrs: (&mkdir.attrs).into(),
                },
            ),
            Packet::RmDir(rmdir) => (rmdir.id, Request::Rmdir { path: rmdir.path }),
            Packet::RealPath(real) => (real.id, Request::Realpath { path: real.path }),
            Packet::Stat(stat) => (stat.id, Request::Stat { path: stat.path }),
            Packet::Rename(rename) => (
                rename.id,
                Request::Rename {
                    from: rename.oldpath,
                    to: rename.newpath,
                },
            ),
            Packet::ReadLink(link) => (link.id, Request::Readlink { path: link.path }),
            Packet::Symlink(link) => (
                link.id,
                Request::Symlink {
                    link_path: link.targetpath,
                    target_path: link.linkpath,
                },
            ),
            _ => return Err(SftpError::Protocol("unexpected packet from client".into())),
        };
        Ok(request)
    }
}

impl Response {
    /// Request id this response answers; VERSION has none
    pub fn id(&self) -> Option<u32> {
        match self {
            Response::Version { .. } => None,
            Response::Status { id, .. }
            | Response::Handle { id, .. }
            | Response::Data { id, .. }
            | Response::Name { id, .. }
            | Response::Attrs { id, .. } => Some(*id),
        }
    }

    fn into_packet(self) -> Packet {
        match self {
            Response::Version {
                version,
                extensions,
            } => Packet::Version(wire::Version {
                version,
                extensions: extensions.into_iter().collect(),
            }),
            Response::Status { id, code, message } => Packet::Status(wire::Status {
                id,
                status_code: status_code(code),
                error_message: message,
                language_tag: "en".to_string(),
            }),
            Response::Handle { id, handle } => Packet::Handle(wire::Handle { id, handle }),
            Response::Data { id, data } => Packet::Data(wire::Data {
                id,
                data: data.to_vec(),
            }),
            Response::Name { id, entries } => Packet::Name(wire::Name {
                id,
                files: entries
                    .into_iter()
                    .map(|entry| wire::File {
                        attrs: (&entry.attrs).into(),
                        filename: entry.filename,
                        longname: entry.longname,
                    })
                    .collect(),
            }),
            Response::Attrs { id, attrs } => Packet::Attrs(wire::Attrs {
                id,
                attrs: (&attrs).into(),
            }),
        }
    }

    pub fn encode(&self) -> Result<Bytes, SftpError> {
        encode_packet(self.clone().into_packet())
    }

    /// Decode a frame body (without the length prefix)
    pub fn decode(body: Bytes) -> Result<Response, SftpError> {
        let response = match decode_packet(body)? {
            Packet::Version(version) => {
                let mut extensions: Vec<(String, String)> = version.extensions.into_iter().collect();
                extensions.sort();
                Response::Version {
                    version: version.version,
                    extensions,
                }
            }
            Packet::Status(status) => Response::Status {
                id: status.id,
                code: status.status_code as u32,
                message: status.error_message,
            },
            Packet::Handle(handle) => Response::Handle {
                id: handle.id,
                handle: handle.handle,
            },
            Packet::Data(data) => Response::Data {
                id: data.id,
                data: Bytes::from(data.data),
            },
            Packet::Name(name) => Response::Name {
                id: name.id,
                entries: name
                    .files
                    .into_iter()
                    .map(|file| DirEntry {
                        attrs: (&file.attrs).into(),
                        filename: file.filename,
                        longname: file.longname,
                    })
                    .collect(),
            },
            Packet::Attrs(attrs) => Response::Attrs {
                id: attrs.id,
                attrs: (&attrs.attrs).into(),
            },
            _ => return Err(SftpError::Protocol("unexpected packet from server".into())),
        };
        Ok(response)
    }
}

/// Split one complete frame body off the front of `buf`, if one is buffered.
pub fn take_frame(buf: &mut BytesMut) -> Result<Option<Bytes>, SftpError> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if len == 0 || len > MAX_PACKET_LEN {
        return Err(SftpError::Protocol(format!("invalid packet length {}", len)));
    }
    if buf.len() < 4 + len {
        return Ok(None);
    }
    buf.advance(4);
    Ok(Some(buf.split_to(len).freeze()))
}
