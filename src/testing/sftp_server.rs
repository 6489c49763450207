//! In-memory SFTP v3 server; packets are encoded by `russh_sftp`

use std::collections::{BTreeMap, HashMap};

use bytes::{Bytes, BytesMut};
use tracing::warn;

use crate::sftp::error::status;
use crate::sftp::packet::{take_frame, Request, Response, SFTP_PROTOCOL_VERSION};
use crate::sftp::path_utils::{join_remote_path, normalize_remote_path, parent_remote_path};
use crate::sftp::types::{DirEntry, FileAttributes, OpenFlags};

pub(crate) const HOME: &str = "/home/test";

/// Size of `big.bin` in the home directory; spans several read chunks
pub(crate) const BIG_FILE_LEN: usize = 40_000;

enum Node {
    Dir { mode: u32 },
    File { data: Vec<u8>, mode: u32 },
    Symlink { target: String },
}

enum OpenHandle {
    File { path: String },
    Dir { entries: Option<Vec<DirEntry>> },
}

pub(crate) struct SftpServer {
    inbound: BytesMut,
    nodes: BTreeMap<String, Node>,
    handles: HashMap<String, OpenHandle>,
    next_handle: u32,
}

fn status_reply(id: u32, code: u32, message: &str) -> Response {
    Response::Status {
        id,
        code,
        message: message.to_string(),
    }
}

fn ok(id: u32) -> Response {
    status_reply(id, status::OK, "")
}

impl SftpServer {
    pub(crate) fn new() -> Self {
        let mut nodes = BTreeMap::new();
        for dir in ["/", "/home", HOME, "/home/test/ls"] {
            nodes.insert(dir.to_string(), Node::Dir { mode: 0o040755 });
        }
        for (name, data) in [
            ("/home/test/ls/1", b"one".to_vec()),
            ("/home/test/ls/2", b"two".to_vec()),
            ("/home/test/hello.txt", b"hello world\n".to_vec()),
            (
                "/home/test/big.bin",
                (0..BIG_FILE_LEN).map(|i| (i % 251) as u8).collect(),
            ),
        ] {
            nodes.insert(name.to_string(), Node::File { data, mode: 0o100644 });
        }
        nodes.insert(
            "/home/test/link".to_string(),
            Node::Symlink {
                target: "/home/test/hello.txt".to_string(),
            },
        );
        Self {
            inbound: BytesMut::new(),
            nodes,
            handles: HashMap::new(),
            next_handle: 1,
        }
    }

    /// Consume client bytes, returning complete reply frames
    pub(crate) fn feed(&mut self, data: &[u8]) -> Vec<Bytes> {
        self.inbound.extend_from_slice(data);
        let mut replies = Vec::new();
        while let Ok(Some(frame)) = take_frame(&mut self.inbound) {
            let Ok((id, request)) = Request::decode(frame) else {
                continue;
            };
            match self.handle(id, request).encode() {
                Ok(reply) => replies.push(reply),
                Err(e) => warn!("Test SFTP server could not encode reply {}: {}", id, e),
            }
        }
        replies
    }

    fn resolve(&self, path: &str) -> String {
        normalize_remote_path(&join_remote_path(HOME, path))
    }

    /// Follow symlinks to the final path
    fn follow(&self, path: String) -> String {
        let mut path = path;
        for _ in 0..8 {
            match self.nodes.get(&path) {
                Some(Node::Symlink { target }) => path = self.resolve(target),
                _ => break,
            }
        }
        path
    }

    fn attrs(node: &Node) -> FileAttributes {
        match node {
            Node::Dir { mode } => FileAttributes {
                size: Some(4096),
                permissions: Some(*mode),
                uid: Some(1000),
                gid: Some(1000),
                ..Default::default()
            },
            Node::File { data, mode } => FileAttributes {
                size: Some(data.len() as u64),
                permissions: Some(*mode),
                uid: Some(1000),
                gid: Some(1000),
                ..Default::default()
            },
            Node::Symlink { target } => FileAttributes {
                size: Some(target.len() as u64),
                permissions: Some(0o120777),
                ..Default::default()
            },
        }
    }

    fn entry(name: &str, node: &Node) -> DirEntry {
        let attrs = Self::attrs(node);
        DirEntry {
            filename: name.to_string(),
            longname: format!("{} 1 test test {} {}", attrs.permission_string(), attrs.size.unwrap_or(0), name),
            attrs,
        }
    }

    fn children(&self, dir: &str) -> Vec<DirEntry> {
        self.nodes
            .iter()
            .filter(|(path, _)| path.as_str() != dir && parent_remote_path(path) == dir)
            .map(|(path, node)| {
                let name = path.rsplit('/').next().unwrap_or_default();
                Self::entry(name, node)
            })
            .collect()
    }

    fn new_handle(&mut self, open: OpenHandle) -> String {
        let handle = format!("h{}", self.next_handle);
        self.next_handle += 1;
        self.handles.insert(handle.clone(), open);
        handle
    }

    fn handle(&mut self, id: u32, request: Request) -> Response {
        match request {
            Request::Init { .. } => Response::Version {
                version: SFTP_PROTOCOL_VERSION,
                extensions: vec![("posix-rename@openssh.com".to_string(), "1".to_string())],
            },
            Request::Open { path, flags, attrs } => {
                let path = self.follow(self.resolve(&path));
                match self.nodes.get_mut(&path) {
                    Some(Node::Dir { .. }) => status_reply(id, status::FAILURE, "Is a directory"),
                    Some(Node::File { .. }) if flags.contains(OpenFlags::EXCLUDE) => {
                        status_reply(id, status::FAILURE, "File exists")
                    }
                    Some(Node::File { data, .. }) => {
                        if flags.contains(OpenFlags::TRUNCATE) {
                            data.clear();
                        }
                        Response::Handle {
                            id,
                            handle: self.new_handle(OpenHandle::File { path }),
                        }
                    }
                    Some(Node::Symlink { .. }) => status_reply(id, status::NO_SUCH_FILE, "Dangling link"),
                    None if flags.contains(OpenFlags::CREATE) => {
                        if !matches!(self.nodes.get(&parent_remote_path(&path)), Some(Node::Dir { .. })) {
                            return status_reply(id, status::NO_SUCH_FILE, "No such file");
                        }
                        let mode = attrs.permissions.map(|m| 0o100000 | (m & 0o7777)).unwrap_or(0o100644);
                        self.nodes.insert(path.clone(), Node::File { data: Vec::new(), mode });
                        Response::Handle {
                            id,
                            handle: self.new_handle(OpenHandle::File { path }),
                        }
                    }
                    None => status_reply(id, status::NO_SUCH_FILE, "No such file"),
                }
            }
            Request::Opendir { path } => {
                let path = self.follow(self.resolve(&path));
                match self.nodes.get(&path) {
                    Some(Node::Dir { .. }) => {
                        let mut entries = vec![
                            Self::entry(".", &Node::Dir { mode: 0o040755 }),
                            Self::entry("..", &Node::Dir { mode: 0o040755 }),
                        ];
                        entries.extend(self.children(&path));
                        Response::Handle {
                            id,
                            handle: self.new_handle(OpenHandle::Dir {
                                entries: Some(entries),
                            }),
                        }
                    }
                    Some(_) => status_reply(id, status::FAILURE, "Not a directory"),
                    None => status_reply(id, status::NO_SUCH_FILE, "No such file"),
                }
            }
            Request::Readdir { handle } => match self.handles.get_mut(&handle) {
                Some(OpenHandle::Dir { entries }) => match entries.take() {
                    Some(entries) => Response::Name { id, entries },
                    None => status_reply(id, status::EOF, ""),
                },
                _ => status_reply(id, status::FAILURE, "Bad handle"),
            },
            Request::Close { handle } => match self.handles.remove(&handle) {
                Some(_) => ok(id),
                None => status_reply(id, status::FAILURE, "Bad handle"),
            },
            Request::Read { handle, offset, len } => {
                let Some(OpenHandle::File { path }) = self.handles.get(&handle) else {
                    return status_reply(id, status::FAILURE, "Bad handle");
                };
                match self.nodes.get(path) {
                    Some(Node::File { data, .. }) if (offset as usize) < data.len() => {
                        let start = offset as usize;
                        let end = (start + len as usize).min(data.len());
                        Response::Data {
                            id,
                            data: Bytes::copy_from_slice(&data[start..end]),
                        }
                    }
                    Some(Node::File { .. }) => status_reply(id, status::EOF, ""),
                    _ => status_reply(id, status::NO_SUCH_FILE, "Gone"),
                }
            }
            Request::Write { handle, offset, data } => {
                let Some(OpenHandle::File { path }) = self.handles.get(&handle) else {
                    return status_reply(id, status::FAILURE, "Bad handle");
                };
                match self.nodes.get_mut(path) {
                    Some(Node::File { data: contents, .. }) => {
                        let start = offset as usize;
                        let end = start + data.len();
                        if contents.len() < end {
                            contents.resize(end, 0);
                        }
                        contents[start..end].copy_from_slice(&data);
                        ok(id)
                    }
                    _ => status_reply(id, status::NO_SUCH_FILE, "Gone"),
                }
            }
            Request::Fstat { handle } => {
                let Some(OpenHandle::File { path }) = self.handles.get(&handle) else {
                    return status_reply(id, status::FAILURE, "Bad handle");
                };
                match self.nodes.get(path) {
                    Some(node) => Response::Attrs {
                        id,
                        attrs: Self::attrs(node),
                    },
                    None => status_reply(id, status::NO_SUCH_FILE, "Gone"),
                }
            }
            Request::Stat { path } => {
                let path = self.follow(self.resolve(&path));
                self.stat_reply(id, &path)
            }
            Request::Lstat { path } => {
                let path = self.resolve(&path);
                self.stat_reply(id, &path)
            }
            Request::Setstat { path, attrs } => {
                let path = self.follow(self.resolve(&path));
                match (self.nodes.get_mut(&path), attrs.permissions) {
                    (Some(Node::File { mode, .. }), Some(perm)) => {
                        *mode = 0o100000 | (perm & 0o7777);
                        ok(id)
                    }
                    (Some(Node::Dir { mode }), Some(perm)) => {
                        *mode = 0o040000 | (perm & 0o7777);
                        ok(id)
                    }
                    (Some(_), _) => ok(id),
                    (None, _) => status_reply(id, status::NO_SUCH_FILE, "No such file"),
                }
            }
            Request::Fsetstat { .. } => status_reply(id, status::OP_UNSUPPORTED, "fsetstat"),
            Request::Mkdir { path, attrs } => {
                let path = self.resolve(&path);
                if self.nodes.contains_key(&path) {
                    return status_reply(id, status::FAILURE, "File exists");
                }
                if !matches!(self.nodes.get(&parent_remote_path(&path)), Some(Node::Dir { .. })) {
                    return status_reply(id, status::NO_SUCH_FILE, "No such file");
                }
                let mode = 0o040000 | (attrs.permissions.unwrap_or(0o755) & 0o7777);
                self.nodes.insert(path, Node::Dir { mode });
                ok(id)
            }
            Request::Rmdir { path } => {
                let path = self.resolve(&path);
                match self.nodes.get(&path) {
                    Some(Node::Dir { .. }) if !self.children(&path).is_empty() => {
                        status_reply(id, status::FAILURE, "Directory not empty")
                    }
                    Some(Node::Dir { .. }) => {
                        self.nodes.remove(&path);
                        ok(id)
                    }
                    Some(_) => status_reply(id, status::FAILURE, "Not a directory"),
                    None => status_reply(id, status::NO_SUCH_FILE, "No such file"),
                }
            }
            Request::Remove { path } => {
                let path = self.resolve(&path);
                match self.nodes.get(&path) {
                    Some(Node::Dir { .. }) => status_reply(id, status::FAILURE, "Is a directory"),
                    Some(_) => {
                        self.nodes.remove(&path);
                        ok(id)
                    }
                    None => status_reply(id, status::NO_SUCH_FILE, "No such file"),
                }
            }
            Request::Realpath { path } => {
                let path = self.resolve(&path);
                Response::Name {
                    id,
                    entries: vec![DirEntry {
                        filename: path.clone(),
                        longname: path,
                        attrs: FileAttributes::default(),
                    }],
                }
            }
            Request::Rename { from, to } => {
                let from = self.resolve(&from);
                let to = self.resolve(&to);
                if self.nodes.contains_key(&to) {
                    return status_reply(id, status::FAILURE, "Target exists");
                }
                let moved: Vec<String> = self
                    .nodes
                    .keys()
                    .filter(|p| **p == from || p.starts_with(&format!("{}/", from)))
                    .cloned()
                    .collect();
                if moved.is_empty() {
                    return status_reply(id, status::NO_SUCH_FILE, "No such file");
                }
                for old in moved {
                    if let Some(node) = self.nodes.remove(&old) {
                        let new = format!("{}{}", to, &old[from.len()..]);
                        self.nodes.insert(new, node);
                    }
                }
                ok(id)
            }
            Request::Readlink { path } => {
                let path = self.resolve(&path);
                match self.nodes.get(&path) {
                    Some(Node::Symlink { target }) => Response::Name {
                        id,
                        entries: vec![DirEntry {
                            filename: target.clone(),
                            longname: target.clone(),
                            attrs: FileAttributes::default(),
                        }],
                    },
                    Some(_) => status_reply(id, status::FAILURE, "Not a link"),
                    None => status_reply(id, status::NO_SUCH_FILE, "No such file"),
                }
            }
            Request::Symlink {
                link_path,
                target_path,
            } => {
                let link = self.resolve(&link_path);
                if self.nodes.contains_key(&link) {
                    return status_reply(id, status::FAILURE, "Link exists");
                }
                self.nodes.insert(link, Node::Symlink { target: target_path });
                ok(id)
            }
        }
    }

    fn stat_reply(&self, id: u32, path: &str) -> Response {
        match self.nodes.get(path) {
            Some(node) => Response::Attrs {
                id,
                attrs: Self::attrs(node),
            },
            None => status_reply(id, status::NO_SUCH_FILE, "No such file"),
        }
    }
}
