//! Key derivation: PBKDF2-HMAC-SHA512 secret → symmetric key, plus a
//! short-lived memo of recently derived keys.

use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use sha2::{Sha256, Sha512};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use zeroize::Zeroize;

use zkv_core::types::{KdfParams, DEFAULT_KEY_SIZE_WORDS};
use zkv_core::{ZkvError, ZkvResult};

use crate::{IV_SIZE, SALT_SIZE};

/// Upper bound on iterations accepted from an envelope.
pub const MAX_ITERATIONS: u32 = 10_000_000;

/// A derived symmetric key. Zeroized on drop.
#[derive(Clone)]
pub struct DerivedKey {
    bytes: Vec<u8>,
}

impl DerivedKey {
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl Drop for DerivedKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DerivedKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Derive a key from a secret and salt using PBKDF2-HMAC-SHA512.
///
/// Deterministic: the same secret, salt and params always yield the same key.
pub fn derive_key(
    secret: &SecretString,
    salt: &[u8],
    params: &KdfParams,
) -> ZkvResult<DerivedKey> {
    check_params(params)?;
    let mut bytes = vec![0u8; params.key_len()];
    pbkdf2::pbkdf2_hmac::<Sha512>(
        secret.expose_secret().as_bytes(),
        salt,
        params.iterations,
        &mut bytes,
    );
    Ok(DerivedKey { bytes })
}

fn check_params(params: &KdfParams) -> ZkvResult<()> {
    if params.iterations == 0 || params.iterations > MAX_ITERATIONS {
        return Err(ZkvError::Derivation(format!(
            "iteration count {} outside 1..={MAX_ITERATIONS}",
            params.iterations
        )));
    }
    if params.key_size != DEFAULT_KEY_SIZE_WORDS {
        return Err(ZkvError::Derivation(format!(
            "unsupported key size: {} words (expected {DEFAULT_KEY_SIZE_WORDS})",
            params.key_size
        )));
    }
    Ok(())
}

/// Generate a random 256-bit salt. Never reuse across encryptions.
pub fn generate_salt() -> [u8; SALT_SIZE] {
    let mut salt = [0u8; SALT_SIZE];
    rand::thread_rng().fill_bytes(&mut salt);
    salt
}

/// Generate a random 128-bit IV. Never reuse across encryptions.
pub fn generate_iv() -> [u8; IV_SIZE] {
    let mut iv = [0u8; IV_SIZE];
    rand::thread_rng().fill_bytes(&mut iv);
    iv
}

// ── KeyCache ──────────────────────────────────────────────────────────────────

#[derive(Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    /// HMAC of the secret under the cache's private key
    fingerprint: [u8; 32],
    salt: Vec<u8>,
    params: KdfParams,
}

struct CachedKey {
    key: DerivedKey,
    inserted_at: Instant,
}

/// Memoizes derived keys per (secret, salt, iterations, key size) so a burst
/// of decryptions within one session does not pay PBKDF2 repeatedly.
///
/// Secrets never become map keys: entries are indexed by an HMAC fingerprint
/// under a random per-cache key. Every invalidation bumps an epoch; a key
/// whose derivation started before the bump is returned but never stored.
pub struct KeyCache {
    fingerprint_key: [u8; 32],
    entries: Mutex<HashMap<CacheKey, CachedKey>>,
    epoch: AtomicU64,
    ttl: Duration,
    capacity: usize,
}

impl KeyCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        let mut fingerprint_key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut fingerprint_key);
        KeyCache {
            fingerprint_key,
            entries: Mutex::new(HashMap::new()),
            epoch: AtomicU64::new(0),
            ttl,
            capacity,
        }
    }

    /// A cache that never stores anything.
    pub fn disabled() -> Self {
        Self::new(Duration::ZERO, 0)
    }

    pub fn from_config(config: &zkv_core::config::CryptoConfig) -> Self {
        Self::new(config.key_cache_ttl(), config.key_cache_capacity)
    }

    /// Derive a key, serving it from the cache while the entry is fresh.
    pub fn derive(
        &self,
        secret: &SecretString,
        salt: &[u8],
        params: &KdfParams,
    ) -> ZkvResult<DerivedKey> {
        if self.capacity == 0 {
            return derive_key(secret, salt, params);
        }

        let cache_key = CacheKey {
            fingerprint: self.fingerprint(secret)?,
            salt: salt.to_vec(),
            params: *params,
        };

        let epoch = {
            let mut entries = self.entries.lock();
            match entries.get(&cache_key) {
                Some(cached) if cached.inserted_at.elapsed() < self.ttl => {
                    return Ok(cached.key.clone());
                }
                Some(_) => {
                    entries.remove(&cache_key);
                }
                None => {}
            }
            self.epoch.load(Ordering::SeqCst)
        };

        // Derive outside the lock; PBKDF2 is the slow part.
        let key = derive_key(secret, salt, params)?;
        self.insert_if_current(cache_key, &key, epoch);
        Ok(key)
    }

    /// Store `key` unless the cache was invalidated since `epoch` was read.
    fn insert_if_current(&self, cache_key: CacheKey, key: &DerivedKey, epoch: u64) -> bool {
        let mut entries = self.entries.lock();
        if self.epoch.load(Ordering::SeqCst) != epoch {
            tracing::debug!("key cache: invalidated during derivation; not storing");
            return false;
        }
        entries.insert(
            cache_key,
            CachedKey {
                key: key.clone(),
                inserted_at: Instant::now(),
            },
        );
        while entries.len() > self.capacity {
            let oldest = entries
                .iter()
                .min_by_key(|(_, cached)| cached.inserted_at)
                .map(|(k, _)| k.clone());
            match oldest {
                Some(k) => {
                    entries.remove(&k);
                }
                None => break,
            }
        }
        true
    }

    /// Drop every entry derived from `secret`.
    pub fn invalidate_secret(&self, secret: &SecretString) {
        let fingerprint = match self.fingerprint(secret) {
            Ok(fp) => fp,
            Err(_) => {
                self.clear();
                return;
            }
        };
        let mut entries = self.entries.lock();
        self.epoch.fetch_add(1, Ordering::SeqCst);
        let before = entries.len();
        entries.retain(|k, _| k.fingerprint != fingerprint);
        tracing::debug!(removed = before - entries.len(), "key cache: invalidated secret");
    }

    /// Drop everything (logout).
    pub fn clear(&self) {
        let mut entries = self.entries.lock();
        self.epoch.fetch_add(1, Ordering::SeqCst);
        entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn fingerprint(&self, secret: &SecretString) -> ZkvResult<[u8; 32]> {
        let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(&self.fingerprint_key)
            .map_err(|e| ZkvError::Derivation(format!("key cache fingerprint: {e}")))?;
        mac.update(secret.expose_secret().as_bytes());
        let mut fingerprint = [0u8; 32];
        fingerprint.copy_from_slice(&mac.finalize().into_bytes());
        Ok(fingerprint)
    }
}

impl Default for KeyCache {
    fn default() -> Self {
        Self::from_config(&zkv_core::config::CryptoConfig::default())
    }
}

impl Drop for KeyCache {
    fn drop(&mut self) {
        self.fingerprint_key.zeroize();
    }
}
