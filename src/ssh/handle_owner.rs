//! Single owner for the russh `Handle`
//!
//! `Handle` methods take `&mut self`, so one task holds it and everything
//! else goes through a cloneable `HandleController`. Each command carries a
//! oneshot for its reply.
//!
//! ```ignore
//! let controller = spawn_handle_owner_task(handle, session_id);
//! let channel = controller.open_session_channel().await?;
//! let bound_port = controller.tcpip_forward("0.0.0.0", 8080).await?;
//! ```

use std::sync::Arc;

use russh::client::{self, Handle, KeyboardInteractiveAuthResponse, Msg};
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::ssh_key::HashAlg;
use russh::keys::PrivateKey;
use russh::{Channel, MethodKind, MethodSet};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use super::auth::{KbiPrompt, KbiRequest};
use super::engine::AuthReply;
use super::error::SshError;

/// What to present for one authentication request
pub(crate) enum Credential {
    None,
    Password(Zeroizing<String>),
    PublicKey {
        key: Arc<PrivateKey>,
        hash: Option<HashAlg>,
    },
    KeyboardInteractiveStart,
    KeyboardInteractiveRespond(Vec<String>),
}

/// Work for the owner task
pub(crate) enum HandleCommand {
    Authenticate {
        username: String,
        credential: Credential,
        reply_tx: Reply<AuthReply>,
    },

    /// Open a session channel (shell, subsystem)
    ChannelOpenSession {
        reply_tx: Reply<Channel<Msg>>,
    },

    ChannelOpenDirectTcpip {
        host: String,
        port: u32,
        originator_host: String,
        originator_port: u32,
        reply_tx: Reply<Channel<Msg>>,
    },

    /// Request remote forward (tcpip-forward)
    TcpipForward {
        address: String,
        port: u32,
        reply_tx: Reply<u32>,
    },

    CancelTcpipForward {
        address: String,
        port: u32,
        reply_tx: Reply<()>,
    },

    Disconnect {
        reply_tx: oneshot::Sender<()>,
    },
}

type Reply<T> = oneshot::Sender<Result<T, russh::Error>>;

impl HandleCommand {
    /// Answer a command that will never run
    fn refuse(self) {
        match self {
            HandleCommand::Authenticate { reply_tx, .. } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::ChannelOpenSession { reply_tx }
            | HandleCommand::ChannelOpenDirectTcpip { reply_tx, .. } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::TcpipForward { reply_tx, .. } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::CancelTcpipForward { reply_tx, .. } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::Disconnect { reply_tx } => {
                let _ = reply_tx.send(());
            }
        }
    }
}

/// Cloneable front end of the owner task
#[derive(Clone)]
pub(crate) struct HandleController {
    cmd_tx: mpsc::Sender<HandleCommand>,
}

impl HandleController {
    /// Queue a command and wait for its reply. A stopped owner task reads
    /// as `Disconnected`.
    async fn call<T>(&self, command: impl FnOnce(Reply<T>) -> HandleCommand) -> Result<Result<T, russh::Error>, SshError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(command(tx))
            .await
            .map_err(|_| SshError::Disconnected)?;
        rx.await.map_err(|_| SshError::Disconnected)
    }

    pub(crate) async fn authenticate(
        &self,
        username: &str,
        credential: Credential,
    ) -> Result<AuthReply, SshError> {
        let username = username.to_string();
        Ok(self
            .call(|reply_tx| HandleCommand::Authenticate {
                username,
                credential,
                reply_tx,
            })
            .await??)
    }

    pub(crate) async fn open_session_channel(&self) -> Result<Channel<Msg>, SshError> {
        self.call(|reply_tx| HandleCommand::ChannelOpenSession { reply_tx })
            .await?
            .map_err(|e| SshError::ChannelError(e.to_string()))
    }

    pub(crate) async fn open_direct_tcpip(
        &self,
        host: &str,
        port: u32,
        originator_host: &str,
        originator_port: u32,
    ) -> Result<Channel<Msg>, SshError> {
        let (host, originator_host) = (host.to_string(), originator_host.to_string());
        self.call(|reply_tx| HandleCommand::ChannelOpenDirectTcpip {
            host,
            port,
            originator_host,
            originator_port,
            reply_tx,
        })
        .await?
        .map_err(|e| SshError::ChannelError(e.to_string()))
    }

    /// Returns the port the server bound, which differs from `port` when
    /// `port` was 0
    pub(crate) async fn tcpip_forward(&self, address: &str, port: u32) -> Result<u32, SshError> {
        let address = address.to_string();
        self.call(|reply_tx| HandleCommand::TcpipForward {
            address,
            port,
            reply_tx,
        })
        .await?
        .map_err(|e| SshError::RequestDenied(e.to_string()))
    }

    pub(crate) async fn cancel_tcpip_forward(&self, address: &str, port: u32) -> Result<(), SshError> {
        let address = address.to_string();
        self.call(|reply_tx| HandleCommand::CancelTcpipForward {
            address,
            port,
            reply_tx,
        })
        .await?
        .map_err(|e| SshError::RequestDenied(e.to_string()))
    }

    /// Disconnect and wait until the handle has been released
    pub(crate) async fn disconnect(&self) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.cmd_tx.send(HandleCommand::Disconnect { reply_tx }).await.is_ok() {
            let _ = reply_rx.await;
        }
    }
}

fn method_names(methods: &MethodSet) -> Vec<String> {
    [
        (MethodKind::PublicKey, "publickey"),
        (MethodKind::Password, "password"),
        (MethodKind::KeyboardInteractive, "keyboard-interactive"),
        (MethodKind::HostBased, "hostbased"),
    ]
    .into_iter()
    .filter(|(kind, _)| methods.contains(kind))
    .map(|(_, name)| name.to_string())
    .collect()
}

fn auth_reply(result: client::AuthResult) -> AuthReply {
    match result {
        client::AuthResult::Success => AuthReply::Success,
        client::AuthResult::Failure {
            remaining_methods,
            partial_success,
        } => AuthReply::Failure {
            methods: method_names(&remaining_methods),
            partial_success,
        },
    }
}

fn kbi_reply(response: KeyboardInteractiveAuthResponse) -> AuthReply {
    match response {
        KeyboardInteractiveAuthResponse::Success => AuthReply::Success,
        KeyboardInteractiveAuthResponse::Failure {
            remaining_methods,
            partial_success,
        } => AuthReply::Failure {
            methods: method_names(&remaining_methods),
            partial_success,
        },
        KeyboardInteractiveAuthResponse::InfoRequest {
            name,
            instructions,
            prompts,
        } => AuthReply::InfoRequest(KbiRequest {
            name,
            instructions,
            prompts: prompts
                .into_iter()
                .map(|p| KbiPrompt {
                    prompt: p.prompt,
                    echo: p.echo,
                })
                .collect(),
        }),
    }
}

async fn run_authentication<H: client::Handler>(
    handle: &mut Handle<H>,
    username: String,
    credential: Credential,
) -> Result<AuthReply, russh::Error> {
    match credential {
        Credential::None => handle.authenticate_none(username).await.map(auth_reply),
        Credential::Password(password) => handle
            .authenticate_password(username, password.as_str())
            .await
            .map(auth_reply),
        Credential::PublicKey { key, hash } => handle
            .authenticate_publickey(username, PrivateKeyWithHashAlg::new(key, hash))
            .await
            .map(auth_reply),
        Credential::KeyboardInteractiveStart => handle
            .authenticate_keyboard_interactive_start(username, None::<String>)
            .await
            .map(kbi_reply),
        Credential::KeyboardInteractiveRespond(responses) => handle
            .authenticate_keyboard_interactive_respond(responses)
            .await
            .map(kbi_reply),
    }
}

fn deliver<T>(reply_tx: Reply<T>, result: Result<T, russh::Error>, what: &str) {
    if reply_tx.send(result).is_err() {
        debug!("Caller went away before the {} reply", what);
    }
}

/// Spawn the owner task for `handle`. Must be called within a tokio runtime.
/// The task ends on `disconnect` or once every controller is dropped, and
/// disconnects the transport either way.
pub(crate) fn spawn_handle_owner_task<H>(mut handle: Handle<H>, session_id: u64) -> HandleController
where
    H: client::Handler + 'static,
{
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<HandleCommand>(64);

    tokio::spawn(async move {
        debug!("Handle owner task started for session {}", session_id);
        let mut disconnect_reply = None;

        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                HandleCommand::Authenticate {
                    username,
                    credential,
                    reply_tx,
                } => {
                    let result = run_authentication(&mut handle, username, credential).await;
                    deliver(reply_tx, result, "authentication");
                }
                HandleCommand::ChannelOpenSession { reply_tx } => {
                    deliver(reply_tx, handle.channel_open_session().await, "session channel");
                }
                HandleCommand::ChannelOpenDirectTcpip {
                    host,
                    port,
                    originator_host,
                    originator_port,
                    reply_tx,
                } => {
                    let result = handle
                        .channel_open_direct_tcpip(&host, port, &originator_host, originator_port)
                        .await;
                    deliver(reply_tx, result, "direct-tcpip");
                }
                HandleCommand::TcpipForward {
                    address,
                    port,
                    reply_tx,
                } => {
                    let result = handle.tcpip_forward(&address, port).await;
                    let bound = match &result {
                        Ok(0) => Some(port),
                        Ok(bound) => Some(*bound),
                        Err(_) => None,
                    };
                    if reply_tx.send(result).is_err() {
                        // Nobody is left to cancel a listener that did bind.
                        if let Some(bound) = bound {
                            warn!("Cancelling orphaned remote listener {}:{}", address, bound);
                            let _ = handle.cancel_tcpip_forward(&address, bound).await;
                        }
                    }
                }
                HandleCommand::CancelTcpipForward {
                    address,
                    port,
                    reply_tx,
                } => {
                    let result = handle.cancel_tcpip_forward(&address, port).await;
                    deliver(reply_tx, result, "cancel-tcpip-forward");
                }
                HandleCommand::Disconnect { reply_tx } => {
                    disconnect_reply = Some(reply_tx);
                    break;
                }
            }
        }

        drain_pending_commands(&mut cmd_rx);
        if let Err(e) = handle
            .disconnect(russh::Disconnect::ByApplication, "Session closed", "en")
            .await
        {
            debug!("Disconnect message for session {} not sent: {}", session_id, e);
        }
        if let Some(reply_tx) = disconnect_reply {
            let _ = reply_tx.send(());
        }
        info!("Transport released for session {}", session_id);
    });

    HandleController { cmd_tx }
}

/// Stop accepting commands and refuse whatever is still queued
fn drain_pending_commands(cmd_rx: &mut mpsc::Receiver<HandleCommand>) {
    cmd_rx.close();
    while let Ok(cmd) = cmd_rx.try_recv() {
        cmd.refuse();
    }
}
