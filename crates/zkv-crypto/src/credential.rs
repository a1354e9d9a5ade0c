//! Master secret enrolment and verification against a `UserCredentialRecord`.
//!
//! Verification order: fast hash → slow hash (backfilling the fast hash) →
//! legacy test envelope. A wrong secret yields `VerifyOutcome::Rejected`,
//! never an error.

use secrecy::{ExposeSecret, SecretString};
use sha2::Sha512;

use zkv_core::config::CryptoConfig;
use zkv_core::types::{KdfParams, UserCredentialRecord};
use zkv_core::{ZkvError, ZkvResult};

use crate::cipher::AuthenticatedCipher;
use crate::kdf::generate_salt;

/// Known plaintext sealed into every credential's legacy test envelope.
pub const VERIFICATION_PLAINTEXT: &str = "zkvault-verification-v1";

const FAST_SALT_SUFFIX: &[u8] = b":fast";
const HASH_LEN: usize = 32;

/// Iteration counts used for verification material.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CredentialParams {
    pub slow_iterations: u32,
    pub fast_iterations: u32,
    /// Light params for the disposable verification envelope; never used for records
    pub bootstrap: KdfParams,
}

impl CredentialParams {
    pub fn from_config(config: &CryptoConfig) -> Self {
        Self {
            slow_iterations: config.slow_hash_iterations,
            fast_iterations: config.fast_hash_iterations,
            bootstrap: config.bootstrap_params(),
        }
    }
}

impl Default for CredentialParams {
    fn default() -> Self {
        Self::from_config(&CryptoConfig::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyMethod {
    FastHash,
    SlowHash,
    LegacyEnvelope,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyOutcome {
    Verified {
        method: VerifyMethod,
        /// Fast hash to persist when the record lacks a current one
        backfill_fast_hash: Option<String>,
    },
    Rejected,
}

impl VerifyOutcome {
    pub fn is_verified(&self) -> bool {
        matches!(self, VerifyOutcome::Verified { .. })
    }
}

/// Create verification material for a newly chosen master secret.
pub fn enroll(
    cipher: &AuthenticatedCipher,
    owner_id: &str,
    secret: &SecretString,
    hint: Option<String>,
    params: &CredentialParams,
) -> ZkvResult<UserCredentialRecord> {
    check_iterations(params)?;
    let salt = generate_salt();

    let record = UserCredentialRecord {
        owner_id: owner_id.to_string(),
        secret_salted_slow_hash: slow_hash(secret, &salt, params.slow_iterations),
        salt: hex::encode(salt),
        secret_fast_hash: Some(fast_hash(secret, &salt, params.fast_iterations)),
        hint: hint.filter(|h| !h.trim().is_empty()),
        legacy_test_envelope: cipher.encrypt(VERIFICATION_PLAINTEXT, secret, &params.bootstrap)?,
    };
    tracing::debug!(owner_id, "enrolled credential record");
    Ok(record)
}

/// Check `secret` against a credential record.
pub fn verify(
    cipher: &AuthenticatedCipher,
    record: &UserCredentialRecord,
    secret: &SecretString,
    params: &CredentialParams,
) -> ZkvResult<VerifyOutcome> {
    check_iterations(params)?;

    if let Ok(salt) = hex::decode(&record.salt) {
        let fast = fast_hash(secret, &salt, params.fast_iterations);
        if let Some(stored_fast) = &record.secret_fast_hash {
            if constant_time_eq(fast.as_bytes(), stored_fast.to_lowercase().as_bytes()) {
                return Ok(VerifyOutcome::Verified {
                    method: VerifyMethod::FastHash,
                    backfill_fast_hash: None,
                });
            }
        }

        if !record.secret_salted_slow_hash.is_empty() {
            let slow = slow_hash(secret, &salt, params.slow_iterations);
            let stored_slow = record.secret_salted_slow_hash.to_lowercase();
            if constant_time_eq(slow.as_bytes(), stored_slow.as_bytes()) {
                tracing::debug!(owner_id = %record.owner_id, "slow hash matched; backfilling fast hash");
                return Ok(VerifyOutcome::Verified {
                    method: VerifyMethod::SlowHash,
                    backfill_fast_hash: Some(fast),
                });
            }
        }
    } else {
        tracing::warn!(owner_id = %record.owner_id, "credential salt is not hex; skipping hash checks");
    }

    match cipher.decrypt(&record.legacy_test_envelope, secret) {
        Ok(plaintext)
            if constant_time_eq(plaintext.as_bytes(), VERIFICATION_PLAINTEXT.as_bytes()) =>
        {
            Ok(VerifyOutcome::Verified {
                method: VerifyMethod::LegacyEnvelope,
                backfill_fast_hash: None,
            })
        }
        Ok(_) => Ok(VerifyOutcome::Rejected),
        Err(e) if e.is_auth_failure() => Ok(VerifyOutcome::Rejected),
        Err(e) => Err(e),
    }
}

fn check_iterations(params: &CredentialParams) -> ZkvResult<()> {
    if params.slow_iterations == 0 || params.fast_iterations == 0 {
        return Err(ZkvError::Derivation(
            "verification hash iterations must be greater than 0".into(),
        ));
    }
    Ok(())
}

fn slow_hash(secret: &SecretString, salt: &[u8], iterations: u32) -> String {
    pbkdf2_hex(secret, salt, iterations)
}

fn fast_hash(secret: &SecretString, salt: &[u8], iterations: u32) -> String {
    let mut fast_salt = Vec::with_capacity(salt.len() + FAST_SALT_SUFFIX.len());
    fast_salt.extend_from_slice(salt);
    fast_salt.extend_from_slice(FAST_SALT_SUFFIX);
    pbkdf2_hex(secret, &fast_salt, iterations)
}

fn pbkdf2_hex(secret: &SecretString, salt: &[u8], iterations: u32) -> String {
    let mut out = [0u8; HASH_LEN];
    pbkdf2::pbkdf2_hmac::<Sha512>(secret.expose_secret().as_bytes(), salt, iterations, &mut out);
    hex::encode(out)
}

/// Constant-time byte comparison (prevents timing side-channels).
pub(crate) fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kdf::KeyCache;
    use std::sync::Arc;

    fn params() -> CredentialParams {
        CredentialParams {
            slow_iterations: 2_000,
            fast_iterations: 500,
            bootstrap: KdfParams::new(500),
        }
    }

    fn cipher() -> AuthenticatedCipher {
        AuthenticatedCipher::new(Arc::new(KeyCache::disabled()))
    }

    #[test]
    fn test_enroll_then_verify_fast_path() {
        let c = cipher();
        let secret = SecretString::from("Tr0ub4dor&3");
        let record = enroll(&c, "user1", &secret, Some("horse".into()), &params()).unwrap();

        assert_eq!(record.owner_id, "user1");
        assert_eq!(record.hint.as_deref(), Some("horse"));
        assert!(record.legacy_test_envelope.is_authenticated());
        assert_ne!(record.secret_fast_hash.as_deref(), Some(record.secret_salted_slow_hash.as_str()));

        let outcome = verify(&c, &record, &secret, &params()).unwrap();
        assert_eq!(
            outcome,
            VerifyOutcome::Verified {
                method: VerifyMethod::FastHash,
                backfill_fast_hash: None
            }
        );
    }

    #[test]
    fn test_wrong_secret_rejected_not_error() {
        let c = cipher();
        let record = enroll(&c, "user1", &SecretString::from("Tr0ub4dor&3"), None, &params()).unwrap();
        let outcome = verify(&c, &record, &SecretString::from("wrongpass"), &params()).unwrap();
        assert_eq!(outcome, VerifyOutcome::Rejected);
        assert!(!outcome.is_verified());
    }

    #[test]
    fn test_slow_hash_backfills_fast_hash() {
        let c = cipher();
        let secret = SecretString::from("old-account");
        let mut record = enroll(&c, "user1", &secret, None, &params()).unwrap();
        let original_fast = record.secret_fast_hash.take();

        let outcome = verify(&c, &record, &secret, &params()).unwrap();
        match outcome {
            VerifyOutcome::Verified {
                method: VerifyMethod::SlowHash,
                backfill_fast_hash: Some(fast),
            } => assert_eq!(Some(fast), original_fast),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_legacy_envelope_fallback() {
        let c = cipher();
        let secret = SecretString::from("ancient");
        let mut record = enroll(&c, "user1", &secret, None, &params()).unwrap();
        record.secret_fast_hash = None;
        record.secret_salted_slow_hash = String::new();

        let outcome = verify(&c, &record, &secret, &params()).unwrap();
        assert_eq!(
            outcome,
            VerifyOutcome::Verified {
                method: VerifyMethod::LegacyEnvelope,
                backfill_fast_hash: None
            }
        );

        let rejected = verify(&c, &record, &SecretString::from("nope"), &params()).unwrap();
        assert_eq!(rejected, VerifyOutcome::Rejected);
    }

    #[test]
    fn test_blank_hint_dropped() {
        let c = cipher();
        let record = enroll(&c, "u", &SecretString::from("s"), Some("  ".into()), &params()).unwrap();
        assert!(record.hint.is_none());
    }

    #[test]
    fn test_zero_iterations_rejected() {
        let c = cipher();
        let mut p = params();
        p.fast_iterations = 0;
        assert!(matches!(
            enroll(&c, "u", &SecretString::from("s"), None, &p),
            Err(ZkvError::Derivation(_))
        ));
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"ab"));
    }
}
