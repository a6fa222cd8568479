//! Job credential set and password decryption.
//!
//! Password values arrive as `Base64(salt || iv || ciphertext)`. The AES-256
//! key is derived from the process master secret with PBKDF2-HMAC-SHA256.

use std::collections::HashMap;

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::Deserialize;
use sha2::Sha256;
use thiserror::Error;
use tracing::{debug, info};
use zeroize::Zeroizing;

const SALT_LENGTH: usize = 16;
const IV_LENGTH: usize = 12;
const KEY_LENGTH: usize = 32;
const TAG_LENGTH: usize = 16;
const PBKDF2_ITERATIONS: u32 = 65_536;

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("credential not found: {0}")]
    NotFound(String),

    #[error("credential {0} has no encrypted value")]
    MissingValue(String),

    #[error("certificate {0} has no file path")]
    MissingPath(String),

    #[error("no master secret configured to decrypt {0}")]
    NoSecret(String),

    #[error("failed to decrypt credential: {0}")]
    Decrypt(String),
}

/// Credential type as sent by the intake side (`1`/`2` or a name).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "serde_json::Value")]
pub enum CredentialKind {
    Password,
    Certificate,
}

impl TryFrom<serde_json::Value> for CredentialKind {
    type Error = String;

    fn try_from(v: serde_json::Value) -> Result<Self, Self::Error> {
        match &v {
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(1) => Ok(CredentialKind::Password),
                Some(2) => Ok(CredentialKind::Certificate),
                _ => Err(format!("unknown credential type {v}")),
            },
            serde_json::Value::String(s) => match s.to_ascii_lowercase().as_str() {
                "1" | "password" => Ok(CredentialKind::Password),
                "2" | "certificate" => Ok(CredentialKind::Certificate),
                _ => Err(format!("unknown credential type {s}")),
            },
            _ => Err(format!("unknown credential type {v}")),
        }
    }
}

/// One entry of a job's credential set.
#[derive(Debug, Clone, Deserialize)]
pub struct CredentialSpec {
    pub name: String,
    #[serde(alias = "credential_type_id", alias = "credentialTypeId")]
    pub kind: CredentialKind,
    #[serde(default, alias = "encryptedValue")]
    pub encrypted_value: Option<String>,
    #[serde(default, alias = "filePath")]
    pub file_path: Option<String>,
}

/// Credentials of one job, keyed by name.
pub struct CredentialSet {
    secret: Option<Zeroizing<String>>,
    entries: HashMap<String, CredentialSpec>,
}

impl std::fmt::Debug for CredentialSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialSet")
            .field("names", &self.entries.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl CredentialSet {
    pub fn new(secret: Option<String>, specs: Vec<CredentialSpec>) -> Self {
        let entries: HashMap<_, _> = specs.into_iter().map(|c| (c.name.clone(), c)).collect();
        if !entries.is_empty() {
            info!(count = entries.len(), "loaded job credentials");
        }
        Self {
            secret: secret.map(Zeroizing::new),
            entries,
        }
    }

    pub fn empty() -> Self {
        Self::new(None, Vec::new())
    }

    /// Decrypted password, or the file path of a certificate.
    pub fn resolve(&self, name: &str) -> Result<Zeroizing<String>, CredentialError> {
        let spec = self
            .entries
            .get(name)
            .ok_or_else(|| CredentialError::NotFound(name.to_string()))?;
        debug!(credential = name, kind = ?spec.kind, "resolving credential");

        match spec.kind {
            CredentialKind::Password => {
                let encoded = spec
                    .encrypted_value
                    .as_deref()
                    .filter(|v| !v.is_empty())
                    .ok_or_else(|| CredentialError::MissingValue(name.to_string()))?;
                let secret = self
                    .secret
                    .as_ref()
                    .ok_or_else(|| CredentialError::NoSecret(name.to_string()))?;
                decrypt(secret, encoded)
            }
            CredentialKind::Certificate => spec
                .file_path
                .clone()
                .filter(|p| !p.is_empty())
                .map(Zeroizing::new)
                .ok_or_else(|| CredentialError::MissingPath(name.to_string())),
        }
    }
}

fn derive_key(secret: &str, salt: &[u8]) -> Zeroizing<[u8; KEY_LENGTH]> {
    let mut key = Zeroizing::new([0u8; KEY_LENGTH]);
    pbkdf2::pbkdf2_hmac::<Sha256>(secret.as_bytes(), salt, PBKDF2_ITERATIONS, &mut key[..]);
    key
}

/// Decrypt one `Base64(salt || iv || ciphertext)` value.
pub fn decrypt(secret: &str, encoded: &str) -> Result<Zeroizing<String>, CredentialError> {
    let raw = STANDARD
        .decode(encoded.trim())
        .map_err(|e| CredentialError::Decrypt(format!("invalid base64: {e}")))?;
    if raw.len() < SALT_LENGTH + IV_LENGTH + TAG_LENGTH {
        return Err(CredentialError::Decrypt("value too short".to_string()));
    }

    let (salt, rest) = raw.split_at(SALT_LENGTH);
    let (iv, ciphertext) = rest.split_at(IV_LENGTH);

    let key = derive_key(secret, salt);
    let cipher = Aes256Gcm::new_from_slice(&key[..])
        .map_err(|e| CredentialError::Decrypt(e.to_string()))?;
    let plaintext = cipher
        .decrypt(Nonce::from_slice(iv), ciphertext)
        .map_err(|_| CredentialError::Decrypt("authentication failed".to_string()))?;

    String::from_utf8(plaintext)
        .map(Zeroizing::new)
        .map_err(|_| CredentialError::Decrypt("plaintext is not UTF-8".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encrypt(secret: &str, plaintext: &str) -> String {
        let salt = [7u8; SALT_LENGTH];
        let iv = [3u8; IV_LENGTH];
        let key = derive_key(secret, &salt);
        let cipher = Aes256Gcm::new_from_slice(&key[..]).unwrap();
        let ct = cipher
            .encrypt(Nonce::from_slice(&iv), plaintext.as_bytes())
            .unwrap();

        let mut raw = Vec::new();
        raw.extend_from_slice(&salt);
        raw.extend_from_slice(&iv);
        raw.extend_from_slice(&ct);
        STANDARD.encode(raw)
    }

    fn spec(json: serde_json::Value) -> CredentialSpec {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn test_password_decrypts_with_master_secret() {
        let encoded = encrypt("master-secret", "hunter2");
        let set = CredentialSet::new(
            Some("master-secret".into()),
            vec![spec(serde_json::json!({
                "name": "db",
                "credential_type_id": 1,
                "encrypted_value": encoded,
            }))],
        );
        assert_eq!(set.resolve("db").unwrap().as_str(), "hunter2");

        let wrong = CredentialSet::new(
            Some("other".into()),
            vec![spec(serde_json::json!({
                "name": "db",
                "credentialTypeId": 1,
                "encryptedValue": encrypt("master-secret", "hunter2"),
            }))],
        );
        assert!(matches!(wrong.resolve("db"), Err(CredentialError::Decrypt(_))));
    }

    #[test]
    fn test_certificate_resolves_to_path() {
        let set = CredentialSet::new(
            None,
            vec![spec(serde_json::json!({
                "name": "client-cert",
                "credentialTypeId": "certificate",
                "filePath": "/certs/client.p12",
            }))],
        );
        assert_eq!(set.resolve("client-cert").unwrap().as_str(), "/certs/client.p12");
        assert!(matches!(set.resolve("nope"), Err(CredentialError::NotFound(_))));
    }

    #[test]
    fn test_password_without_secret_is_rejected() {
        let set = CredentialSet::new(
            None,
            vec![spec(serde_json::json!({
                "name": "db",
                "credential_type_id": 1,
                "encrypted_value": "AAAA",
            }))],
        );
        assert!(matches!(set.resolve("db"), Err(CredentialError::NoSecret(_))));
    }

    #[test]
    fn test_unknown_kind_fails_to_parse() {
        let res: Result<CredentialSpec, _> =
            serde_json::from_value(serde_json::json!({ "name": "x", "credential_type_id": 9 }));
        assert!(res.is_err());
    }

    #[test]
    fn test_short_value_is_rejected() {
        assert!(matches!(
            decrypt("k", &STANDARD.encode([0u8; 8])),
            Err(CredentialError::Decrypt(_))
        ));
    }
}
