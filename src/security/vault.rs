//! AES-256-GCM envelope for API keys and other stored secrets.
//!
//! Envelope format: `enc:v1:<nonce>:<tag>:<ciphertext>`, every part URL-safe
//! base64 without padding. Values without the `enc:v1:` prefix are legacy
//! plaintext and pass through [`SecretVault::decrypt`] unchanged.
//!
//! Decryption never fails loudly: a tampered, truncated or foreign envelope
//! decrypts to the empty string, which callers treat as "no key stored".

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use sha2::{Digest, Sha256};

const ENVELOPE_PREFIX: &str = "enc:v1:";
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Shortest secret material accepted as a real key.
pub const MIN_KEY_MATERIAL_LEN: usize = 32;

/// Used when no usable key material is configured. Fine for local development only.
const DEV_KEY_MATERIAL: &str = "quillgate-dev-secret-key";

const MASK_PREFIX: &str = "••••••••";

#[derive(Debug, thiserror::Error)]
enum DecryptionFailed {
    #[error("envelope must have 5 ':'-separated parts, found {0}")]
    PartCount(usize),
    #[error("invalid base64 in {0}")]
    Encoding(&'static str),
    #[error("nonce must be {NONCE_LEN} bytes and tag {TAG_LEN} bytes")]
    Length,
    #[error("authentication failed")]
    Authentication,
    #[error("plaintext is not UTF-8")]
    Utf8,
}

/// Encrypts and decrypts secret envelopes with one derived key.
pub struct SecretVault {
    key: [u8; 32],
}

impl SecretVault {
    /// Create a vault from a raw 256-bit key.
    pub fn new(key: [u8; 32]) -> Self {
        Self { key }
    }

    /// Derive the key as SHA-256 of `material`.
    ///
    /// Material shorter than [`MIN_KEY_MATERIAL_LEN`] characters is ignored in
    /// favour of a built-in development secret, with a warning.
    pub fn from_material(material: &str) -> Self {
        let material = if material.chars().count() >= MIN_KEY_MATERIAL_LEN {
            material
        } else {
            tracing::warn!(
                "Secret key material missing or shorter than {MIN_KEY_MATERIAL_LEN} characters; \
                 using the development key. Stored secrets are NOT protected."
            );
            DEV_KEY_MATERIAL
        };
        Self::new(Sha256::digest(material.as_bytes()).into())
    }

    /// Whether `value` looks like an envelope produced by [`Self::encrypt`].
    pub fn is_envelope(value: &str) -> bool {
        value.starts_with(ENVELOPE_PREFIX)
    }

    /// Encrypt `plaintext` with a fresh random nonce.
    pub fn encrypt(&self, plaintext: &str) -> anyhow::Result<String> {
        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|e| anyhow::anyhow!("AES cipher init failed: {e}"))?;
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

        let sealed = cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| anyhow::anyhow!("AES encryption failed: {e}"))?;
        // aes-gcm appends the tag to the ciphertext.
        let (ciphertext, tag) = sealed.split_at(sealed.len() - TAG_LEN);

        Ok(format!(
            "{ENVELOPE_PREFIX}{}:{}:{}",
            URL_SAFE_NO_PAD.encode(nonce),
            URL_SAFE_NO_PAD.encode(tag),
            URL_SAFE_NO_PAD.encode(ciphertext)
        ))
    }

    /// Decrypt an envelope. Empty or undecryptable input yields `""`;
    /// legacy plaintext is returned as-is.
    pub fn decrypt(&self, value: &str) -> String {
        if value.is_empty() {
            return String::new();
        }
        if !Self::is_envelope(value) {
            return value.to_string();
        }
        match self.try_decrypt(value) {
            Ok(plain) => plain,
            Err(e) => {
                tracing::debug!("Secret envelope rejected: {e}");
                String::new()
            }
        }
    }

    /// Display form of a stored secret: bullets plus the last four characters.
    pub fn mask(&self, value: &str) -> String {
        mask_plain(&self.decrypt(value))
    }

    fn try_decrypt(&self, value: &str) -> Result<String, DecryptionFailed> {
        let parts: Vec<&str> = value.split(':').collect();
        let [_, _, nonce, tag, ciphertext] = parts.as_slice() else {
            return Err(DecryptionFailed::PartCount(parts.len()));
        };

        let nonce = URL_SAFE_NO_PAD
            .decode(nonce)
            .map_err(|_| DecryptionFailed::Encoding("nonce"))?;
        let tag = URL_SAFE_NO_PAD
            .decode(tag)
            .map_err(|_| DecryptionFailed::Encoding("tag"))?;
        let mut sealed = URL_SAFE_NO_PAD
            .decode(ciphertext)
            .map_err(|_| DecryptionFailed::Encoding("ciphertext"))?;
        if nonce.len() != NONCE_LEN || tag.len() != TAG_LEN {
            return Err(DecryptionFailed::Length);
        }
        sealed.extend_from_slice(&tag);

        let cipher = Aes256Gcm::new_from_slice(&self.key).map_err(|_| DecryptionFailed::Length)?;
        let plain = cipher
            .decrypt(Nonce::from_slice(&nonce), sealed.as_slice())
            .map_err(|_| DecryptionFailed::Authentication)?;
        String::from_utf8(plain).map_err(|_| DecryptionFailed::Utf8)
    }
}

/// Mask an already-decrypted secret.
pub fn mask_plain(plain: &str) -> String {
    if plain.is_empty() {
        return String::new();
    }
    let count = plain.chars().count();
    let tail: String = plain.chars().skip(count.saturating_sub(4)).collect();
    format!("{MASK_PREFIX}{tail}")
}
