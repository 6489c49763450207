//! SSH Configuration

use serde::{Deserialize, Serialize};

use super::error::SshError;

/// Key exchange algorithms the engine can negotiate.
pub const KNOWN_KEX_ALGORITHMS: &[&str] = &[
    "curve25519-sha256",
    "curve25519-sha256@libssh.org",
    "ecdh-sha2-nistp256",
    "ecdh-sha2-nistp384",
    "ecdh-sha2-nistp521",
    "diffie-hellman-group-exchange-sha256",
    "diffie-hellman-group18-sha512",
    "diffie-hellman-group17-sha512",
    "diffie-hellman-group16-sha512",
    "diffie-hellman-group14-sha256",
    "diffie-hellman-group14-sha1",
    "diffie-hellman-group1-sha1",
];

pub const KNOWN_CIPHERS: &[&str] = &[
    "chacha20-poly1305@openssh.com",
    "aes256-gcm@openssh.com",
    "aes128-gcm@openssh.com",
    "aes256-ctr",
    "aes192-ctr",
    "aes128-ctr",
    "aes256-cbc",
    "aes192-cbc",
    "aes128-cbc",
    "3des-cbc",
];

pub const KNOWN_MACS: &[&str] = &[
    "hmac-sha2-512-etm@openssh.com",
    "hmac-sha2-256-etm@openssh.com",
    "hmac-sha2-512",
    "hmac-sha2-256",
    "hmac-sha1-etm@openssh.com",
    "hmac-sha1",
];

pub const KNOWN_HOST_KEY_ALGORITHMS: &[&str] = &[
    "ssh-ed25519",
    "ecdsa-sha2-nistp256",
    "ecdsa-sha2-nistp384",
    "ecdsa-sha2-nistp521",
    "rsa-sha2-512",
    "rsa-sha2-256",
    "ssh-rsa",
    "ssh-dss",
];

/// Negotiation and timing options for a session.
///
/// Every algorithm list, when present, replaces the engine's defaults for
/// that category. Names are validated before the transport is touched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionOptions {
    /// Host key algorithm preference list
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_key_algorithms: Option<Vec<String>>,

    /// MAC algorithm preference list
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac_algorithms: Option<Vec<String>>,

    /// Cipher preference list
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cipher_algorithms: Option<Vec<String>>,

    /// Key exchange preference list
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kex_algorithms: Option<Vec<String>>,

    /// Enable zlib compression
    #[serde(default)]
    pub compression: bool,

    /// Connection timeout in seconds, used when `connect` is given no timeout
    #[serde(default = "default_timeout")]
    pub connect_timeout_secs: u64,

    /// Authentication rounds allowed before the session gives up
    #[serde(default = "default_max_auth_attempts")]
    pub max_auth_attempts: u32,

    /// Identification string sent to the server, e.g. `SSH-2.0-myclient_1.0`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_banner: Option<String>,
}

fn default_port() -> u16 {
    22
}

fn default_timeout() -> u64 {
    120
}

fn default_max_auth_attempts() -> u32 {
    6
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            host_key_algorithms: None,
            mac_algorithms: None,
            cipher_algorithms: None,
            kex_algorithms: None,
            compression: false,
            connect_timeout_secs: default_timeout(),
            max_auth_attempts: default_max_auth_attempts(),
            client_banner: None,
        }
    }
}

impl SessionOptions {
    /// Parse options from a JSON document
    pub fn from_json(json: &str) -> Result<Self, SshError> {
        serde_json::from_str(json)
            .map_err(|e| SshError::NegotiationFailure(format!("Invalid session options: {}", e)))
    }

    /// Check every supplied algorithm name against the known tables.
    pub fn validate(&self) -> Result<(), SshError> {
        check_list("key exchange", self.kex_algorithms.as_deref(), KNOWN_KEX_ALGORITHMS)?;
        check_list("cipher", self.cipher_algorithms.as_deref(), KNOWN_CIPHERS)?;
        check_list("MAC", self.mac_algorithms.as_deref(), KNOWN_MACS)?;
        check_list(
            "host key",
            self.host_key_algorithms.as_deref(),
            KNOWN_HOST_KEY_ALGORITHMS,
        )?;
        if self.max_auth_attempts == 0 {
            return Err(SshError::NegotiationFailure(
                "max_auth_attempts must be at least 1".to_string(),
            ));
        }
        if let Some(banner) = &self.client_banner {
            if !banner.starts_with("SSH-2.0-") || banner.contains(['\r', '\n']) || banner.len() > 253 {
                return Err(SshError::NegotiationFailure(format!(
                    "Invalid client banner: {:?}",
                    banner
                )));
            }
        }
        Ok(())
    }
}

fn check_list(category: &str, names: Option<&[String]>, known: &[&str]) -> Result<(), SshError> {
    let Some(names) = names else {
        return Ok(());
    };
    if names.is_empty() {
        return Err(SshError::NegotiationFailure(format!(
            "Empty {} algorithm list",
            category
        )));
    }
    for name in names {
        if !known.contains(&name.as_str()) {
            return Err(SshError::NegotiationFailure(format!(
                "Unknown {} algorithm: {}",
                category, name
            )));
        }
    }
    Ok(())
}

/// Everything needed to construct a session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Remote host address
    pub host: String,

    /// SSH port (default: 22)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Username for authentication
    pub username: String,

    #[serde(default)]
    pub options: SessionOptions,
}

impl SessionConfig {
    pub fn new(host: impl Into<String>, port: u16, username: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
            options: SessionOptions::default(),
        }
    }

    pub fn with_options(mut self, options: SessionOptions) -> Self {
        self.options = options;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = SessionOptions::default();
        assert_eq!(options.connect_timeout_secs, 120);
        assert_eq!(options.max_auth_attempts, 6);
        assert!(!options.compression);
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_from_json_fills_defaults() {
        let options =
            SessionOptions::from_json(r#"{"cipher_algorithms": ["aes256-ctr"], "compression": true}"#)
                .unwrap();
        assert_eq!(options.cipher_algorithms, Some(vec!["aes256-ctr".to_string()]));
        assert!(options.compression);
        assert_eq!(options.connect_timeout_secs, 120);
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_unknown_algorithm_rejected() {
        let options = SessionOptions {
            mac_algorithms: Some(vec!["hmac-sha2-256".into(), "hmac-md5-bogus".into()]),
            ..Default::default()
        };
        match options.validate() {
            Err(SshError::NegotiationFailure(msg)) => assert!(msg.contains("hmac-md5-bogus")),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_empty_list_rejected() {
        let options = SessionOptions {
            kex_algorithms: Some(vec![]),
            ..Default::default()
        };
        assert!(matches!(
            options.validate(),
            Err(SshError::NegotiationFailure(_))
        ));
    }

    #[test]
    fn test_client_banner_checked() {
        let mut options = SessionOptions {
            client_banner: Some("SSH-2.0-sshmux_0.1".into()),
            ..Default::default()
        };
        assert!(options.validate().is_ok());

        options.client_banner = Some("sshmux\r\n".into());
        assert!(matches!(
            options.validate(),
            Err(SshError::NegotiationFailure(_))
        ));
    }

    #[test]
    fn test_session_config_default_port() {
        let config: SessionConfig =
            serde_json::from_str(r#"{"host": "example.com", "username": "root"}"#).unwrap();
        assert_eq!(config.port, 22);
        assert_eq!(config.options, SessionOptions::default());
    }
}
