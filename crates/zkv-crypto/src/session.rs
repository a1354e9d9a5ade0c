//! Session secret vault: keeps the master secret only as ciphertext under an
//! ephemeral session key, both held in a session-scoped store.
//!
//! State machine:
//! ```text
//! Locked ──begin_verification──▶ Verifying ──establish──▶ Unlocked
//!   ▲                               │                        │
//!   └──────── fail_verification ────┘◀──── lock / logout ────┘
//! ```
//!
//! Other components only call transitions; the store slots are private to
//! this module.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use parking_lot::Mutex;
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use zeroize::{Zeroize, Zeroizing};

use zkv_core::types::now_millis;
use zkv_core::{ZkvError, ZkvResult};

use crate::credential::constant_time_eq;
use crate::kdf::KeyCache;
use crate::{NONCE_SIZE, SESSION_KEY_SIZE};

const SESSION_KEY_SLOT: &str = "zkv.session.key";
const SESSION_SECRET_SLOT: &str = "zkv.session.secret";
const LAST_ACTIVE_SLOT: &str = "zkv.session.last_active";

const SELF_TEST_PLAINTEXT: &[u8] = b"zkv-session-self-test";

// ── Session-scoped storage ────────────────────────────────────────────────────

/// Storage that outlives a reload of the embedding application but not the
/// session itself. Never durable.
pub trait SessionStore: Send + Sync {
    fn get(&self, slot: &str) -> Option<String>;
    fn set(&self, slot: &str, value: String);
    fn remove(&self, slot: &str);
}

/// In-process session store. Clones share state, so a second vault built over
/// a clone behaves like the same session after a reload.
#[derive(Clone, Default)]
pub struct MemorySessionStore {
    slots: Arc<Mutex<Slots>>,
}

#[derive(Default)]
struct Slots(HashMap<String, String>);

impl Drop for Slots {
    fn drop(&mut self) {
        for value in self.0.values_mut() {
            value.zeroize();
        }
    }
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().0.is_empty()
    }
}

impl SessionStore for MemorySessionStore {
    fn get(&self, slot: &str) -> Option<String> {
        self.slots.lock().0.get(slot).cloned()
    }

    fn set(&self, slot: &str, value: String) {
        if let Some(mut old) = self.slots.lock().0.insert(slot.to_string(), value) {
            old.zeroize();
        }
    }

    fn remove(&self, slot: &str) {
        if let Some(mut old) = self.slots.lock().0.remove(slot) {
            old.zeroize();
        }
    }
}

// ── Vault ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Locked,
    Verifying,
    Unlocked,
}

/// Owns the session copy of the master secret.
pub struct SessionSecretVault {
    store: Arc<dyn SessionStore>,
    keys: Arc<KeyCache>,
    state: Mutex<SessionState>,
    auto_lock_after: Option<Duration>,
}

impl SessionSecretVault {
    pub fn new(store: Arc<dyn SessionStore>, keys: Arc<KeyCache>) -> Self {
        SessionSecretVault {
            store,
            keys,
            state: Mutex::new(SessionState::Locked),
            auto_lock_after: None,
        }
    }

    /// Refuse to restore sessions idle for longer than `after`.
    ///
    /// A convenience heuristic for "tab closed" detection; it is not a
    /// security boundary.
    pub fn with_auto_lock(mut self, after: Option<Duration>) -> Self {
        self.auto_lock_after = after;
        self
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn is_unlocked(&self) -> bool {
        self.state() == SessionState::Unlocked
    }

    /// Enter `Verifying`. Any previous session is erased first.
    pub fn begin_verification(&self) {
        self.erase_stored();
        *self.state.lock() = SessionState::Verifying;
    }

    /// Verification rejected the secret: back to `Locked`.
    ///
    /// Callers must also clear the rejected secret from their own state.
    pub fn fail_verification(&self) {
        self.erase_stored();
        *self.state.lock() = SessionState::Locked;
        tracing::debug!("session verification failed; staying locked");
    }

    /// Store `secret` under a fresh session key and enter `Unlocked`.
    ///
    /// Called after registration or a successful verification.
    pub fn establish(&self, secret: &SecretString) -> ZkvResult<()> {
        let mut session_key = Zeroizing::new([0u8; SESSION_KEY_SIZE]);
        rand::thread_rng().fill_bytes(session_key.as_mut());

        let sealed = seal(&session_key, secret.expose_secret().as_bytes())?;

        self.store
            .set(SESSION_KEY_SLOT, BASE64.encode(session_key.as_ref()));
        self.store.set(SESSION_SECRET_SLOT, BASE64.encode(sealed));
        self.touch();

        *self.state.lock() = SessionState::Unlocked;
        tracing::info!("session unlocked");
        Ok(())
    }

    /// Decrypt the session copy of the master secret.
    ///
    /// Returns `None` when locked. A pair that fails to decrypt is wiped and
    /// the vault locks.
    pub fn get_secret(&self) -> Option<SecretString> {
        if !self.is_unlocked() {
            return None;
        }
        match self.open_stored() {
            Ok(secret) => {
                self.touch();
                Some(secret)
            }
            Err(e) => {
                tracing::warn!(error = %e, "session secret unreadable; locking");
                self.erase_stored();
                *self.state.lock() = SessionState::Locked;
                None
            }
        }
    }

    /// Whether `candidate` is the unlocked session's master secret, compared
    /// in constant time. Always false while locked.
    pub fn matches(&self, candidate: &SecretString) -> bool {
        match self.get_secret() {
            Some(secret) => constant_time_eq(
                secret.expose_secret().as_bytes(),
                candidate.expose_secret().as_bytes(),
            ),
            None => false,
        }
    }

    /// Resume a session from the store after a reload.
    ///
    /// Succeeds only if the stored pair passes a decrypt round trip; any
    /// failure (or an idle session past `auto_lock_after`) wipes the pair.
    pub fn restore(&self) -> bool {
        if self.is_unlocked() {
            return true;
        }
        if self.store.get(SESSION_KEY_SLOT).is_none()
            && self.store.get(SESSION_SECRET_SLOT).is_none()
        {
            return false;
        }

        if let Some(limit) = self.auto_lock_after {
            let last_active = self
                .store
                .get(LAST_ACTIVE_SLOT)
                .and_then(|v| v.parse::<i64>().ok());
            let idle_ms = last_active.map(|t| now_millis().saturating_sub(t));
            let expired = match idle_ms {
                Some(ms) => ms < 0 || ms as u128 > limit.as_millis(),
                None => true,
            };
            if expired {
                tracing::info!(idle_ms = ?idle_ms, "session idle past auto-lock window; not restoring");
                self.erase_stored();
                return false;
            }
        }

        match self.self_test() {
            Ok(()) => {
                *self.state.lock() = SessionState::Unlocked;
                self.touch();
                tracing::info!("session restored");
                true
            }
            Err(e) => {
                tracing::warn!(error = %e, "session self-test failed; wiping stored secret");
                self.erase_stored();
                *self.state.lock() = SessionState::Locked;
                false
            }
        }
    }

    /// Record activity for the auto-lock heuristic.
    pub fn touch(&self) {
        self.store.set(LAST_ACTIVE_SLOT, now_millis().to_string());
    }

    /// Erase the session key, the encrypted secret and this secret's cached
    /// keys. Unconditional and idempotent.
    pub fn lock(&self) {
        if let Ok(secret) = self.open_stored() {
            self.keys.invalidate_secret(&secret);
        }
        self.erase_stored();
        *self.state.lock() = SessionState::Locked;
        tracing::info!("session locked");
    }

    /// `lock()` plus a wholesale key cache flush.
    pub fn logout(&self) {
        self.lock();
        self.keys.clear();
    }

    fn erase_stored(&self) {
        self.store.remove(SESSION_KEY_SLOT);
        self.store.remove(SESSION_SECRET_SLOT);
        self.store.remove(LAST_ACTIVE_SLOT);
    }

    fn load_key(&self) -> ZkvResult<Zeroizing<[u8; SESSION_KEY_SIZE]>> {
        let encoded = self
            .store
            .get(SESSION_KEY_SLOT)
            .ok_or(ZkvError::Locked)?;
        let raw = Zeroizing::new(
            BASE64
                .decode(encoded.as_bytes())
                .map_err(|_| ZkvError::WrongSecretOrCorrupted)?,
        );
        if raw.len() != SESSION_KEY_SIZE {
            return Err(ZkvError::WrongSecretOrCorrupted);
        }
        let mut key = Zeroizing::new([0u8; SESSION_KEY_SIZE]);
        key.copy_from_slice(&raw);
        Ok(key)
    }

    fn open_stored(&self) -> ZkvResult<SecretString> {
        let key = self.load_key()?;
        let sealed = self
            .store
            .get(SESSION_SECRET_SLOT)
            .ok_or(ZkvError::Locked)?;
        let sealed = BASE64
            .decode(sealed.as_bytes())
            .map_err(|_| ZkvError::WrongSecretOrCorrupted)?;
        let plaintext = open(&key, &sealed)?;
        let secret =
            std::str::from_utf8(&plaintext).map_err(|_| ZkvError::WrongSecretOrCorrupted)?;
        if secret.is_empty() {
            return Err(ZkvError::WrongSecretOrCorrupted);
        }
        Ok(SecretString::from(secret.to_string()))
    }

    fn self_test(&self) -> ZkvResult<()> {
        self.open_stored()?;
        let key = self.load_key()?;
        let round_trip = open(&key, &seal(&key, SELF_TEST_PLAINTEXT)?)?;
        if round_trip.as_slice() != SELF_TEST_PLAINTEXT {
            return Err(ZkvError::WrongSecretOrCorrupted);
        }
        Ok(())
    }
}

/// XChaCha20-Poly1305. Output: `[24-byte nonce][ciphertext + 16-byte tag]`
fn seal(key: &[u8; SESSION_KEY_SIZE], plaintext: &[u8]) -> ZkvResult<Vec<u8>> {
    let cipher = XChaCha20Poly1305::new(key.as_slice().into());

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = XNonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| ZkvError::Other(anyhow::anyhow!("session seal failed: {e}")))?;

    let mut result = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    result.extend_from_slice(&nonce_bytes);
    result.extend_from_slice(&ciphertext);
    Ok(result)
}

fn open(key: &[u8; SESSION_KEY_SIZE], sealed: &[u8]) -> ZkvResult<Zeroizing<Vec<u8>>> {
    if sealed.len() < NONCE_SIZE + 16 {
        return Err(ZkvError::WrongSecretOrCorrupted);
    }
    let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_SIZE);
    let cipher = XChaCha20Poly1305::new(key.as_slice().into());
    cipher
        .decrypt(XNonce::from_slice(nonce_bytes), ciphertext)
        .map(Zeroizing::new)
        .map_err(|_| ZkvError::WrongSecretOrCorrupted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use zkv_core::types::KdfParams;

    fn vault(store: &MemorySessionStore) -> SessionSecretVault {
        SessionSecretVault::new(Arc::new(store.clone()), Arc::new(KeyCache::default()))
    }

    #[test]
    fn test_establish_and_get_secret() {
        let store = MemorySessionStore::new();
        let v = vault(&store);
        assert_eq!(v.state(), SessionState::Locked);
        assert!(v.get_secret().is_none());

        v.begin_verification();
        assert_eq!(v.state(), SessionState::Verifying);
        v.establish(&SecretString::from("Tr0ub4dor&3")).unwrap();

        assert!(v.is_unlocked());
        let secret = v.get_secret().unwrap();
        assert_eq!(secret.expose_secret(), "Tr0ub4dor&3");
    }

    #[test]
    fn test_matches_only_the_session_secret() {
        let store = MemorySessionStore::new();
        let v = vault(&store);
        let secret = SecretString::from("right");
        assert!(!v.matches(&secret));

        v.begin_verification();
        v.establish(&secret).unwrap();
        assert!(v.matches(&secret));
        assert!(!v.matches(&SecretString::from("wrong")));
        assert!(!v.matches(&SecretString::from("righ")));

        v.lock();
        assert!(!v.matches(&secret));
    }

    #[test]
    fn test_store_never_holds_plaintext_secret() {
        let store = MemorySessionStore::new();
        let v = vault(&store);
        v.establish(&SecretString::from("plain-secret-value")).unwrap();
        let sealed = store.get(SESSION_SECRET_SLOT).unwrap();
        assert!(!sealed.contains("plain-secret-value"));
        let decoded = BASE64.decode(sealed).unwrap();
        assert!(!decoded
            .windows(b"plain-secret-value".len())
            .any(|w| w == b"plain-secret-value"));
    }

    #[test]
    fn test_restore_after_reload() {
        let store = MemorySessionStore::new();
        vault(&store)
            .establish(&SecretString::from("survives-reload"))
            .unwrap();

        let reloaded = vault(&store);
        assert_eq!(reloaded.state(), SessionState::Locked);
        assert!(reloaded.restore());
        assert_eq!(
            reloaded.get_secret().unwrap().expose_secret(),
            "survives-reload"
        );
    }

    #[test]
    fn test_lock_erases_and_blocks_restore() {
        let store = MemorySessionStore::new();
        let v = vault(&store);
        v.establish(&SecretString::from("s3cret")).unwrap();

        v.lock();
        assert!(v.get_secret().is_none());
        assert!(store.is_empty());

        let reloaded = vault(&store);
        assert!(!reloaded.restore());
        assert!(reloaded.get_secret().is_none());

        // Idempotent
        v.lock();
        v.logout();
        assert_eq!(v.state(), SessionState::Locked);
    }

    #[test]
    fn test_lock_invalidates_cached_keys_for_secret() {
        let store = MemorySessionStore::new();
        let keys = Arc::new(KeyCache::default());
        let v = SessionSecretVault::new(Arc::new(store.clone()), keys.clone());
        let secret = SecretString::from("cached-secret");
        v.establish(&secret).unwrap();

        keys.derive(&secret, b"salt", &KdfParams::new(100)).unwrap();
        keys.derive(&SecretString::from("other"), b"salt", &KdfParams::new(100))
            .unwrap();
        assert_eq!(keys.len(), 2);

        v.lock();
        assert_eq!(keys.len(), 1);

        v.logout();
        assert!(keys.is_empty());
    }

    #[test]
    fn test_corrupted_pair_is_wiped_on_restore() {
        let store = MemorySessionStore::new();
        vault(&store).establish(&SecretString::from("s")).unwrap();

        let mut sealed = BASE64.decode(store.get(SESSION_SECRET_SLOT).unwrap()).unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0xFF;
        store.set(SESSION_SECRET_SLOT, BASE64.encode(sealed));

        let reloaded = vault(&store);
        assert!(!reloaded.restore());
        assert!(store.get(SESSION_KEY_SLOT).is_none());
        assert!(store.get(SESSION_SECRET_SLOT).is_none());
    }

    #[test]
    fn test_corruption_while_unlocked_locks() {
        let store = MemorySessionStore::new();
        let v = vault(&store);
        v.establish(&SecretString::from("s")).unwrap();
        store.set(SESSION_KEY_SLOT, BASE64.encode([0u8; 5]));

        assert!(v.get_secret().is_none());
        assert_eq!(v.state(), SessionState::Locked);
        assert!(store.get(SESSION_SECRET_SLOT).is_none());
    }

    #[test]
    fn test_failed_verification_stays_locked() {
        let store = MemorySessionStore::new();
        let v = vault(&store);
        v.begin_verification();
        v.fail_verification();
        assert_eq!(v.state(), SessionState::Locked);
        assert!(!v.restore());
    }

    #[test]
    fn test_auto_lock_refuses_idle_session() {
        let store = MemorySessionStore::new();
        vault(&store).establish(&SecretString::from("s")).unwrap();
        let an_hour_ago = now_millis() - 60 * 60 * 1000;
        store.set(LAST_ACTIVE_SLOT, an_hour_ago.to_string());

        let reloaded = vault(&store).with_auto_lock(Some(Duration::from_secs(60)));
        assert!(!reloaded.restore());
        assert!(store.is_empty());
    }

    #[test]
    fn test_auto_lock_allows_recent_session() {
        let store = MemorySessionStore::new();
        vault(&store).establish(&SecretString::from("s")).unwrap();

        let reloaded = vault(&store).with_auto_lock(Some(Duration::from_secs(60)));
        assert!(reloaded.restore());
    }
}
