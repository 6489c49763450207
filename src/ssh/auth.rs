//! Authentication method negotiation types
//!
//! The server reports which methods may continue; the session delegate picks
//! one and drives it through the `Session::authenticate_with_*` entry points.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::error::SshError;

/// Authentication methods named by the SSH protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthMethod {
    Password,
    #[serde(rename = "publickey")]
    PublicKey,
    KeyboardInteractive,
    #[serde(rename = "hostbased")]
    HostBased,
    GssapiWithMic,
}

impl AuthMethod {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "password" => Some(AuthMethod::Password),
            "publickey" => Some(AuthMethod::PublicKey),
            "keyboard-interactive" => Some(AuthMethod::KeyboardInteractive),
            "hostbased" => Some(AuthMethod::HostBased),
            "gssapi-with-mic" => Some(AuthMethod::GssapiWithMic),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            AuthMethod::Password => "password",
            AuthMethod::PublicKey => "publickey",
            AuthMethod::KeyboardInteractive => "keyboard-interactive",
            AuthMethod::HostBased => "hostbased",
            AuthMethod::GssapiWithMic => "gssapi-with-mic",
        }
    }

    /// Methods this crate can actually drive
    pub fn is_supported(&self) -> bool {
        matches!(
            self,
            AuthMethod::Password | AuthMethod::PublicKey | AuthMethod::KeyboardInteractive
        )
    }
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Turn the server's method names into a method list.
///
/// An empty list, or one whose first entry is not a known method, is a
/// denial. Known but undriveable methods are kept so the delegate can see
/// them, but a list offering nothing driveable is also a denial.
pub fn parse_allowed_methods(names: &[String]) -> Result<Vec<AuthMethod>, SshError> {
    let Some(first) = names.first() else {
        return Err(SshError::RequestDenied(
            "Server offered no authentication methods".to_string(),
        ));
    };
    if AuthMethod::from_name(first).is_none() {
        return Err(SshError::RequestDenied(format!(
            "Unrecognized authentication method: {}",
            first
        )));
    }
    let methods: Vec<AuthMethod> = names
        .iter()
        .filter_map(|name| AuthMethod::from_name(name))
        .collect();
    if !methods.iter().any(AuthMethod::is_supported) {
        return Err(SshError::RequestDenied(format!(
            "No supported authentication method in [{}]",
            names.join(",")
        )));
    }
    Ok(methods)
}

/// Outcome of the delegate's method selection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthDecision {
    /// The delegate drove one of the `authenticate_with_*` calls
    Handled,
    /// None of the offered methods can be used
    Unsupported,
    /// The delegate gave up with an error
    Failed(SshError),
}

/// Keyboard-Interactive prompt from server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KbiPrompt {
    /// The prompt text to display
    pub prompt: String,
    /// true = show input (echo), false = mask input (password-style)
    pub echo: bool,
}

/// One round of keyboard-interactive questions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KbiRequest {
    /// Display name from server (may be empty)
    pub name: String,
    /// Instructions from server (may be empty)
    pub instructions: String,
    pub prompts: Vec<KbiPrompt>,
}
