//! Port forwarding
//!
//! Direct (local) forwarding is a plain channel, see
//! `Session::open_direct_channel`. This module holds the remote side.

pub mod remote;

pub use remote::{ForwardListener, ListenRequest};
