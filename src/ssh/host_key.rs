//! Server host keys presented during negotiation
//!
//! A `HostKey` is an immutable value built from the server's public key blob.
//! Trust decisions (and any persistence of them) belong to the caller.

use std::fmt;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use sha2::{Digest, Sha256};

use super::error::SshError;

/// Host key families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostKeyType {
    Rsa1,
    Rsa,
    Dss,
    Ecdsa,
    Ed25519,
}

impl HostKeyType {
    /// Look up a key type by its short or wire name
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "rsa1" | "ssh-rsa1" => Some(HostKeyType::Rsa1),
            "rsa" | "ssh-rsa" | "rsa-sha2-256" | "rsa-sha2-512" => Some(HostKeyType::Rsa),
            "dsa" | "ssh-dss" => Some(HostKeyType::Dss),
            "ecdsa" | "ssh-ecdsa" | "ecdsa-sha2-nistp256" | "ecdsa-sha2-nistp384"
            | "ecdsa-sha2-nistp521" => Some(HostKeyType::Ecdsa),
            "ed25519" | "ssh-ed25519" => Some(HostKeyType::Ed25519),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            HostKeyType::Rsa1 => "ssh-rsa1",
            HostKeyType::Rsa => "ssh-rsa",
            HostKeyType::Dss => "ssh-dss",
            HostKeyType::Ecdsa => "ecdsa",
            HostKeyType::Ed25519 => "ssh-ed25519",
        }
    }

    /// Whether a blob carrying `wire_name` belongs to this family
    fn accepts(&self, wire_name: &str) -> bool {
        match self {
            HostKeyType::Ecdsa => wire_name.starts_with("ecdsa-sha2-"),
            other => other.name() == wire_name,
        }
    }
}

impl fmt::Display for HostKeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostKey {
    key_type: HostKeyType,
    algorithm: String,
    blob: Vec<u8>,
}

impl HostKey {
    /// Parse a base64 key blob that is expected to be of `key_type`.
    ///
    /// Invalid base64, a malformed blob or a blob of another family all fail
    /// with `HostKeyMismatch`.
    pub fn from_base64(data: &str, key_type: HostKeyType) -> Result<Self, SshError> {
        let blob = BASE64
            .decode(data.trim())
            .map_err(|e| SshError::HostKeyMismatch(format!("Invalid base64 host key: {}", e)))?;
        let algorithm = blob_algorithm(&blob)?;
        if !key_type.accepts(&algorithm) {
            return Err(SshError::HostKeyMismatch(format!(
                "Expected {} host key, got {}",
                key_type, algorithm
            )));
        }
        Ok(Self {
            key_type,
            algorithm,
            blob,
        })
    }

    /// Build a host key from a raw wire blob, inferring its type
    pub fn from_blob(blob: Vec<u8>) -> Result<Self, SshError> {
        let algorithm = blob_algorithm(&blob)?;
        let key_type = HostKeyType::from_name(&algorithm).ok_or_else(|| {
            SshError::HostKeyMismatch(format!("Unsupported host key type: {}", algorithm))
        })?;
        Ok(Self {
            key_type,
            algorithm,
            blob,
        })
    }

    pub fn key_type(&self) -> HostKeyType {
        self.key_type
    }

    /// Wire algorithm name embedded in the blob (e.g. `ecdsa-sha2-nistp256`)
    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.blob
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(&self.blob)
    }

    /// OpenSSH-style SHA256 fingerprint (`SHA256:<base64 without padding>`)
    pub fn fingerprint(&self) -> String {
        let hash = Sha256::digest(&self.blob);
        format!("SHA256:{}", BASE64.encode(hash).trim_end_matches('='))
    }
}

impl fmt::Display for HostKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.algorithm, self.fingerprint())
    }
}

fn blob_algorithm(blob: &[u8]) -> Result<String, SshError> {
    let malformed = || SshError::HostKeyMismatch("Malformed host key blob".to_string());
    let len_bytes: [u8; 4] = blob.get(..4).ok_or_else(malformed)?.try_into().map_err(|_| malformed())?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    let name = blob.get(4..4 + len).ok_or_else(malformed)?;
    String::from_utf8(name.to_vec()).map_err(|_| malformed())
}
