//! SSH module - sessions, authentication and the wire engine
//!
//! # Features
//! - One serialized context per session, running on its own thread
//! - Host key trust and method negotiation through `SessionDelegate`
//! - Password, public key and keyboard-interactive authentication
//! - Pluggable wire engine (`WireEngine`), russh by default

pub mod auth;
pub mod config;
pub(crate) mod core;
pub mod delegate;
pub mod engine;
mod error;
mod handle_owner;
mod handshake;
pub mod host_key;
mod key_pair;
pub(crate) mod queue;
mod russh_engine;
pub(crate) mod session;

pub use auth::{AuthDecision, AuthMethod, KbiPrompt, KbiRequest};
pub use config::{SessionConfig, SessionOptions};
pub use delegate::{ChannelDelegate, SessionDelegate};
pub use engine::{Negotiated, WireEngine};
pub use error::SshError;
pub use host_key::{HostKey, HostKeyType};
pub use key_pair::{AskPassphrase, KeyPair};
pub use queue::ReadinessNotifier;
pub use russh_engine::RusshEngine;
pub use session::{Session, SessionStage};
