//! Authenticated envelope encryption: AES-256-CBC + HMAC-SHA256 (encrypt-then-MAC)
//!
//! Envelope fields:
//! ```text
//! encryptedData  base64(AES-256-CBC/PKCS7(plaintext))
//! iv             hex(16 random bytes)
//! salt           hex(32 random bytes)
//! hmac           hex(HMAC-SHA256(auth_key, iv || ciphertext))
//! ```
//!
//! `enc_key = PBKDF2(secret, salt)`, `auth_key = PBKDF2(secret, salt || ":hmac")`.
//! The tag is checked before any decryption happens.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use secrecy::SecretString;
use sha2::Sha256;
use std::sync::Arc;
use zeroize::Zeroize;

use zkv_core::types::{EncryptedEnvelope, KdfParams, SealedPayload};
use zkv_core::{ZkvError, ZkvResult};

use crate::kdf::{generate_iv, generate_salt, DerivedKey, KeyCache};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;
type HmacSha256 = Hmac<Sha256>;

/// Appended to the envelope salt to derive the authentication key.
const AUTH_SALT_SUFFIX: &[u8] = b":hmac";

/// Encrypts and decrypts vault envelopes under a master secret.
///
/// Cheap to clone; clones share the key cache.
#[derive(Clone, Default)]
pub struct AuthenticatedCipher {
    keys: Arc<KeyCache>,
}

impl AuthenticatedCipher {
    pub fn new(keys: Arc<KeyCache>) -> Self {
        Self { keys }
    }

    pub fn key_cache(&self) -> &Arc<KeyCache> {
        &self.keys
    }

    /// Encrypt `plaintext` into a fresh authenticated envelope.
    ///
    /// A new salt and IV are generated on every call.
    pub fn encrypt(
        &self,
        plaintext: &str,
        secret: &SecretString,
        params: &KdfParams,
    ) -> ZkvResult<EncryptedEnvelope> {
        let salt = generate_salt();
        let iv = generate_iv();
        let (enc_key, auth_key) = self.derive_pair(secret, &salt, params)?;

        let ciphertext = Aes256CbcEnc::new_from_slices(enc_key.as_bytes(), &iv)
            .map_err(|e| ZkvError::Derivation(format!("AES-CBC init: {e}")))?
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());

        let tag = compute_tag(&auth_key, &iv, &ciphertext)?;

        Ok(EncryptedEnvelope::Authenticated {
            payload: SealedPayload {
                encrypted_data: BASE64.encode(&ciphertext),
                iv: hex::encode(iv),
                salt: hex::encode(salt),
                params: *params,
            },
            hmac: hex::encode(tag),
        })
    }

    /// Decrypt an envelope.
    ///
    /// Authenticated envelopes fail with `TamperDetected` on any tag mismatch,
    /// including a wrong secret. Legacy envelopes fail with
    /// `WrongSecretOrCorrupted` when the output does not unpad to UTF-8.
    pub fn decrypt(&self, envelope: &EncryptedEnvelope, secret: &SecretString) -> ZkvResult<String> {
        match envelope {
            EncryptedEnvelope::Authenticated { payload, hmac } => {
                let decoded = DecodedPayload::decode(payload).ok_or(ZkvError::TamperDetected)?;
                let expected = hex::decode(hmac).map_err(|_| ZkvError::TamperDetected)?;

                let (enc_key, auth_key) =
                    self.derive_pair(secret, &decoded.salt, &payload.params)?;
                verify_tag(&auth_key, &decoded.iv, &decoded.ciphertext, &expected)?;

                decrypt_cbc(&enc_key, &decoded.iv, &decoded.ciphertext)
            }
            EncryptedEnvelope::Legacy(payload) => {
                let decoded =
                    DecodedPayload::decode(payload).ok_or(ZkvError::WrongSecretOrCorrupted)?;
                let enc_key = self.keys.derive(secret, &decoded.salt, &payload.params)?;
                let plaintext = decrypt_cbc(&enc_key, &decoded.iv, &decoded.ciphertext)?;
                if plaintext.is_empty() {
                    return Err(ZkvError::WrongSecretOrCorrupted);
                }
                Ok(plaintext)
            }
        }
    }

    fn derive_pair(
        &self,
        secret: &SecretString,
        salt: &[u8],
        params: &KdfParams,
    ) -> ZkvResult<(DerivedKey, DerivedKey)> {
        let enc_key = self.keys.derive(secret, salt, params)?;

        let mut auth_salt = Vec::with_capacity(salt.len() + AUTH_SALT_SUFFIX.len());
        auth_salt.extend_from_slice(salt);
        auth_salt.extend_from_slice(AUTH_SALT_SUFFIX);
        let auth_key = self.keys.derive(secret, &auth_salt, params)?;

        Ok((enc_key, auth_key))
    }
}

struct DecodedPayload {
    ciphertext: Vec<u8>,
    iv: Vec<u8>,
    salt: Vec<u8>,
}

impl DecodedPayload {
    fn decode(payload: &SealedPayload) -> Option<Self> {
        Some(DecodedPayload {
            ciphertext: BASE64.decode(&payload.encrypted_data).ok()?,
            iv: hex::decode(&payload.iv).ok()?,
            salt: hex::decode(&payload.salt).ok()?,
        })
    }
}

fn compute_tag(auth_key: &DerivedKey, iv: &[u8], ciphertext: &[u8]) -> ZkvResult<Vec<u8>> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(auth_key.as_bytes())
        .map_err(|e| ZkvError::Derivation(format!("HMAC init: {e}")))?;
    mac.update(iv);
    mac.update(ciphertext);
    Ok(mac.finalize().into_bytes().to_vec())
}

fn verify_tag(
    auth_key: &DerivedKey,
    iv: &[u8],
    ciphertext: &[u8],
    expected: &[u8],
) -> ZkvResult<()> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(auth_key.as_bytes())
        .map_err(|e| ZkvError::Derivation(format!("HMAC init: {e}")))?;
    mac.update(iv);
    mac.update(ciphertext);
    // verify_slice compares in constant time
    mac.verify_slice(expected).map_err(|_| {
        tracing::debug!("envelope authentication tag mismatch");
        ZkvError::TamperDetected
    })
}

fn decrypt_cbc(enc_key: &DerivedKey, iv: &[u8], ciphertext: &[u8]) -> ZkvResult<String> {
    let plaintext = Aes256CbcDec::new_from_slices(enc_key.as_bytes(), iv)
        .map_err(|_| ZkvError::WrongSecretOrCorrupted)?
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| ZkvError::WrongSecretOrCorrupted)?;

    String::from_utf8(plaintext).map_err(|e| {
        e.into_bytes().zeroize();
        ZkvError::WrongSecretOrCorrupted
    })
}
