//! Credential blob decoding.
//!
//! Stored integration credentials exist in several historical encodings. The
//! resolver walks `CREDENTIAL_CHAIN` in order and stops at the first strategy
//! that yields a usable access token. The chain is append-only: reordering it
//! changes which stored blobs decode.

use std::collections::HashMap;

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::engine::general_purpose::{STANDARD as BASE64, URL_SAFE_NO_PAD};
use base64::Engine;
use futures::future::BoxFuture;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, trace};

use waypoint_core::error::Result;
use waypoint_core::traits::CredentialSource;
use waypoint_core::types::AccessToken;

const NONCE_LEN: usize = 12;
const ENVELOPE_VERSION: u8 = 2;

/// One way of turning a blob into credential JSON.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialStrategy {
    /// Versioned JSON envelope, AES-256-GCM under the primary key.
    StructuredEnvelope,
    /// Base64 of plaintext JSON.
    Base64Json,
    /// Symmetric token under the primary key.
    SymmetricJson,
    /// Base64 wrapping of a symmetric token under the primary key.
    Base64SymmetricJson,
    /// Plaintext JSON.
    PlainJson,
    /// Symmetric token under the legacy key.
    LegacySymmetricJson,
    /// Base64 wrapping of a symmetric token under the legacy key.
    LegacyBase64SymmetricJson,
}

/// Resolution order. Append new strategies at the end only.
pub const CREDENTIAL_CHAIN: [CredentialStrategy; 7] = [
    CredentialStrategy::StructuredEnvelope,
    CredentialStrategy::Base64Json,
    CredentialStrategy::SymmetricJson,
    CredentialStrategy::Base64SymmetricJson,
    CredentialStrategy::PlainJson,
    CredentialStrategy::LegacySymmetricJson,
    CredentialStrategy::LegacyBase64SymmetricJson,
];

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("no strategy produced a usable token (tried {attempts:?})")]
    Exhausted { attempts: Vec<CredentialStrategy> },

    #[error("credential encryption failed: {0}")]
    Seal(String),
}

/// A token plus how it was found.
#[derive(Debug, Clone)]
pub struct ResolvedCredential {
    pub token: AccessToken,
    pub strategy: CredentialStrategy,
    /// Strategies tried, in order, ending with the winner.
    pub attempts: Vec<CredentialStrategy>,
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    v: u8,
    nonce: String,
    ciphertext: String,
}

/// Walks the decoding chain with the configured keys.
#[derive(Clone, Default)]
pub struct CredentialResolver {
    primary: Option<[u8; 32]>,
    legacy: Option<[u8; 32]>,
}

impl std::fmt::Debug for CredentialResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialResolver")
            .field("primary", &self.primary.is_some())
            .field("legacy", &self.legacy.is_some())
            .finish()
    }
}

impl CredentialResolver {
    /// Build from the configured secrets. Missing keys disable the strategies that need them.
    pub fn new(primary_secret: Option<&str>, legacy_secret: Option<&str>) -> Self {
        Self {
            primary: primary_secret.map(derive_key),
            legacy: legacy_secret.map(derive_key),
        }
    }

    pub fn resolve(&self, blob: &str) -> std::result::Result<ResolvedCredential, CredentialError> {
        let blob = blob.trim();
        let mut attempts = Vec::new();

        for strategy in CREDENTIAL_CHAIN {
            let Some(key) = self.key_for(strategy) else {
                trace!(?strategy, "Skipping credential strategy, no key configured");
                continue;
            };
            attempts.push(strategy);

            let decoded = match strategy {
                CredentialStrategy::StructuredEnvelope => key.and_then(|k| open_envelope(&k, blob)),
                CredentialStrategy::Base64Json => decode_base64_json(blob),
                CredentialStrategy::SymmetricJson | CredentialStrategy::LegacySymmetricJson => {
                    key.and_then(|k| open_token(&k, blob))
                }
                CredentialStrategy::Base64SymmetricJson
                | CredentialStrategy::LegacyBase64SymmetricJson => key.and_then(|k| {
                    let inner = BASE64.decode(blob).ok()?;
                    let inner = String::from_utf8(inner).ok()?;
                    open_token(&k, inner.trim())
                }),
                CredentialStrategy::PlainJson => serde_json::from_str(blob).ok(),
            };

            match decoded.as_ref().and_then(extract_token) {
                Some(token) => {
                    debug!(?strategy, attempts = attempts.len(), "Credential resolved");
                    return Ok(ResolvedCredential {
                        token,
                        strategy,
                        attempts,
                    });
                }
                None => trace!(?strategy, "Credential strategy produced no token"),
            }
        }

        Err(CredentialError::Exhausted { attempts })
    }

    /// Key requirement per strategy: `None` means skip, `Some(None)` means no key needed.
    fn key_for(&self, strategy: CredentialStrategy) -> Option<Option<[u8; 32]>> {
        match strategy {
            CredentialStrategy::Base64Json | CredentialStrategy::PlainJson => Some(None),
            CredentialStrategy::StructuredEnvelope
            | CredentialStrategy::SymmetricJson
            | CredentialStrategy::Base64SymmetricJson => self.primary.map(Some),
            CredentialStrategy::LegacySymmetricJson
            | CredentialStrategy::LegacyBase64SymmetricJson => self.legacy.map(Some),
        }
    }
}

fn derive_key(secret: &str) -> [u8; 32] {
    Sha256::digest(secret.as_bytes()).into()
}

fn decode_base64_json(blob: &str) -> Option<serde_json::Value> {
    let bytes = BASE64.decode(blob).ok()?;
    serde_json::from_slice(&bytes).ok()
}

fn decrypt(key: &[u8; 32], nonce: &[u8], ciphertext: &[u8]) -> Option<Vec<u8>> {
    if nonce.len() != NONCE_LEN {
        return None;
    }
    let cipher = Aes256Gcm::new_from_slice(key).ok()?;
    cipher.decrypt(Nonce::from_slice(nonce), ciphertext).ok()
}

fn encrypt(key: &[u8; 32], plaintext: &[u8]) -> std::result::Result<([u8; NONCE_LEN], Vec<u8>), CredentialError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|e| CredentialError::Seal(e.to_string()))?;
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|e| CredentialError::Seal(e.to_string()))?;
    Ok((nonce, ciphertext))
}

fn open_envelope(key: &[u8; 32], blob: &str) -> Option<serde_json::Value> {
    let envelope: Envelope = serde_json::from_str(blob).ok()?;
    if envelope.v != ENVELOPE_VERSION {
        return None;
    }
    let nonce = BASE64.decode(envelope.nonce).ok()?;
    let ciphertext = BASE64.decode(envelope.ciphertext).ok()?;
    let plaintext = decrypt(key, &nonce, &ciphertext)?;
    serde_json::from_slice(&plaintext).ok()
}

/// Symmetric token: url-safe base64 of `nonce || ciphertext`.
fn open_token(key: &[u8; 32], token: &str) -> Option<serde_json::Value> {
    let raw = URL_SAFE_NO_PAD.decode(token.trim_end_matches('=')).ok()?;
    if raw.len() <= NONCE_LEN {
        return None;
    }
    let (nonce, ciphertext) = raw.split_at(NONCE_LEN);
    let plaintext = decrypt(key, nonce, ciphertext)?;
    serde_json::from_slice(&plaintext).ok()
}

fn extract_token(value: &serde_json::Value) -> Option<AccessToken> {
    let obj = value.as_object()?;
    ["access_token", "token"]
        .iter()
        .filter_map(|k| obj.get(*k).and_then(|v| v.as_str()))
        .map(str::trim)
        .find(|t| !t.is_empty())
        .map(AccessToken::new)
}

/// Encrypt credential JSON in the current envelope format.
pub fn seal_envelope(secret: &str, plaintext: &str) -> std::result::Result<String, CredentialError> {
    let (nonce, ciphertext) = encrypt(&derive_key(secret), plaintext.as_bytes())?;
    let envelope = Envelope {
        v: ENVELOPE_VERSION,
        nonce: BASE64.encode(nonce),
        ciphertext: BASE64.encode(ciphertext),
    };
    serde_json::to_string(&envelope).map_err(|e| CredentialError::Seal(e.to_string()))
}

/// Encrypt credential JSON as a bare symmetric token.
pub fn seal_token(secret: &str, plaintext: &str) -> std::result::Result<String, CredentialError> {
    let (nonce, ciphertext) = encrypt(&derive_key(secret), plaintext.as_bytes())?;
    let mut raw = nonce.to_vec();
    raw.extend_from_slice(&ciphertext);
    Ok(URL_SAFE_NO_PAD.encode(raw))
}

/// In-memory credential store keyed by integration name.
#[derive(Debug, Default, Clone)]
pub struct StaticCredentialSource {
    blobs: HashMap<String, String>,
}

impl StaticCredentialSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, integration: impl Into<String>, blob: impl Into<String>) -> Self {
        self.blobs.insert(integration.into(), blob.into());
        self
    }
}

impl CredentialSource for StaticCredentialSource {
    fn credential_blob(&self, integration: &str) -> BoxFuture<'_, Result<Option<String>>> {
        let blob = self.blobs.get(integration).cloned();
        Box::pin(async move { Ok(blob) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PRIMARY: &str = "primary-secret";
    const LEGACY: &str = "legacy-secret";
    const CREDS: &str = r#"{"access_token":"ya29.abc","refresh_token":"1//r"}"#;

    fn resolver() -> CredentialResolver {
        CredentialResolver::new(Some(PRIMARY), Some(LEGACY))
    }

    #[test]
    fn test_envelope_resolves_first() {
        let blob = seal_envelope(PRIMARY, CREDS).unwrap();
        let resolved = resolver().resolve(&blob).unwrap();
        assert_eq!(resolved.strategy, CredentialStrategy::StructuredEnvelope);
        assert_eq!(resolved.token.expose(), "ya29.abc");
        assert_eq!(resolved.attempts, vec![CredentialStrategy::StructuredEnvelope]);
    }

    #[test]
    fn test_base64_json_skips_symmetric_decryption() {
        let blob = BASE64.encode(CREDS);
        let resolved = resolver().resolve(&blob).unwrap();
        assert_eq!(resolved.strategy, CredentialStrategy::Base64Json);
        assert_eq!(
            resolved.attempts,
            vec![CredentialStrategy::StructuredEnvelope, CredentialStrategy::Base64Json]
        );
    }

    #[test]
    fn test_symmetric_token() {
        let blob = seal_token(PRIMARY, CREDS).unwrap();
        let resolved = resolver().resolve(&blob).unwrap();
        assert_eq!(resolved.strategy, CredentialStrategy::SymmetricJson);
    }

    #[test]
    fn test_base64_wrapped_symmetric_token() {
        let blob = BASE64.encode(seal_token(PRIMARY, CREDS).unwrap());
        let resolved = resolver().resolve(&blob).unwrap();
        assert_eq!(resolved.strategy, CredentialStrategy::Base64SymmetricJson);
    }

    #[test]
    fn test_plain_json() {
        let resolved = resolver().resolve(r#"{"token":"plain-tok"}"#).unwrap();
        assert_eq!(resolved.strategy, CredentialStrategy::PlainJson);
        assert_eq!(resolved.token.expose(), "plain-tok");
    }

    #[test]
    fn test_legacy_key_fallback() {
        let blob = seal_token(LEGACY, CREDS).unwrap();
        let resolved = resolver().resolve(&blob).unwrap();
        assert_eq!(resolved.strategy, CredentialStrategy::LegacySymmetricJson);

        let wrapped = BASE64.encode(seal_token(LEGACY, CREDS).unwrap());
        let resolved = resolver().resolve(&wrapped).unwrap();
        assert_eq!(resolved.strategy, CredentialStrategy::LegacyBase64SymmetricJson);
        assert_eq!(resolved.attempts.len(), CREDENTIAL_CHAIN.len());
    }

    #[test]
    fn test_json_without_token_is_not_usable() {
        let err = resolver().resolve(r#"{"refresh_token":"only"}"#).unwrap_err();
        let CredentialError::Exhausted { attempts } = err else {
            panic!("expected exhaustion");
        };
        assert_eq!(attempts.len(), CREDENTIAL_CHAIN.len());
    }

    #[test]
    fn test_missing_keys_skip_encrypted_strategies() {
        let no_keys = CredentialResolver::new(None, None);
        let err = no_keys.resolve("garbage").unwrap_err();
        let CredentialError::Exhausted { attempts } = err else {
            panic!("expected exhaustion");
        };
        assert_eq!(
            attempts,
            vec![CredentialStrategy::Base64Json, CredentialStrategy::PlainJson]
        );
    }

    #[test]
    fn test_wrong_key_cannot_open_envelope() {
        let blob = seal_envelope("someone-else", CREDS).unwrap();
        assert!(resolver().resolve(&blob).is_err());
    }

    #[tokio::test]
    async fn test_static_source() {
        let source = StaticCredentialSource::new().with("calendar", "blob");
        assert_eq!(
            source.credential_blob("calendar").await.unwrap().as_deref(),
            Some("blob")
        );
        assert!(source.credential_blob("crm").await.unwrap().is_none());
    }
}
