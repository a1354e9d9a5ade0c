//! VaultService: the interface UI collaborators call.
//!
//! Wires the crypto executor, session vault, record cache, sync channel and
//! document store for a single owner. Constructed explicitly and passed
//! around; there is no global instance.
//!
//! Every operation that takes the master secret checks it against the
//! session copy first. Locking cancels every subscription handed out.

use parking_lot::Mutex;
use secrecy::{ExposeSecret, SecretString};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use zkv_core::config::ZkvConfig;
use zkv_core::types::{now_millis, KdfParams, Record, RecordDraft, StoredRecord, UserCredentialRecord};
use zkv_core::{ZkvError, ZkvResult};
use zkv_crypto::{
    hash_field, AuthenticatedCipher, CredentialParams, KeyCache, MemorySessionStore, SearchField,
    SessionSecretVault, SessionStore, VerifyOutcome,
};

use crate::cache::RecordCache;
use crate::channel::{ErrorCallback, Subscription, SyncChannel, UpdateCallback};
use crate::codec::seal_record;
use crate::executor::CryptoTaskExecutor;
use crate::store::{Collection, DocKey, DocumentStore, OpendalStore};

pub struct VaultService {
    owner_id: String,
    record_params: KdfParams,
    store: Arc<dyn DocumentStore>,
    executor: Arc<CryptoTaskExecutor>,
    cache: Arc<RecordCache>,
    keys: Arc<KeyCache>,
    session: SessionSecretVault,
    channel: SyncChannel,
    /// Parent of every live subscription's token; replaced on lock
    subscriptions: Mutex<CancellationToken>,
}

impl VaultService {
    /// Build a service for `owner_id` over the given collaborators.
    ///
    /// Call from within a tokio runtime so the crypto worker can start;
    /// otherwise crypto runs inline.
    pub fn new(
        owner_id: impl Into<String>,
        config: &ZkvConfig,
        store: Arc<dyn DocumentStore>,
        session_store: Arc<dyn SessionStore>,
    ) -> ZkvResult<Self> {
        config.validate()?;
        let owner_id = owner_id.into();
        if owner_id.trim().is_empty() {
            return Err(ZkvError::Config("owner id must not be empty".into()));
        }

        let keys = Arc::new(KeyCache::from_config(&config.crypto));
        let cipher = AuthenticatedCipher::new(keys.clone());
        let executor = Arc::new(CryptoTaskExecutor::start(
            &config.executor,
            cipher,
            CredentialParams::from_config(&config.crypto),
        ));
        let cache = Arc::new(RecordCache::from_config(&config.cache));
        let session = SessionSecretVault::new(session_store, keys.clone())
            .with_auto_lock(config.session.auto_lock_after());
        let channel = SyncChannel::new(executor.clone(), cache.clone(), &config.sync);

        info!(owner_id = %owner_id, worker = executor.has_worker(), "vault service ready");
        Ok(VaultService {
            owner_id,
            record_params: config.crypto.record_params(),
            store,
            executor,
            cache,
            keys,
            session,
            channel,
            subscriptions: Mutex::new(CancellationToken::new()),
        })
    }

    /// Build a service whose document store comes from `config.storage` and
    /// whose session lives in process memory.
    pub fn from_config(owner_id: impl Into<String>, config: &ZkvConfig) -> ZkvResult<Self> {
        let store = Arc::new(OpendalStore::from_config(&config.storage)?);
        Self::new(owner_id, config, store, Arc::new(MemorySessionStore::new()))
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    // ── Session ───────────────────────────────────────────────────────────────

    /// Create verification material for a new account and unlock.
    pub async fn register(&self, secret: &SecretString, hint: Option<String>) -> ZkvResult<()> {
        if secret.expose_secret().is_empty() {
            return Err(ZkvError::Config("master secret must not be empty".into()));
        }
        let key = DocKey::credential(&self.owner_id);
        if self.store.get(&key).await?.is_some() {
            return Err(ZkvError::Storage(format!(
                "owner {} is already registered",
                self.owner_id
            )));
        }

        let credential = self.executor.enroll(&self.owner_id, secret, hint).await?;
        self.store.put(&key, &serde_json::to_value(&credential)?).await?;

        self.session.begin_verification();
        self.session.establish(secret)?;
        info!(owner_id = %self.owner_id, "registered");
        Ok(())
    }

    /// Verify `secret` and unlock on success.
    ///
    /// A wrong secret returns `Ok(false)` and leaves the vault locked.
    pub async fn unlock(&self, secret: &SecretString) -> ZkvResult<bool> {
        self.session.begin_verification();

        match self.verify_secret(secret).await {
            Ok(true) => {
                self.session.establish(secret)?;
                Ok(true)
            }
            Ok(false) => {
                self.session.fail_verification();
                self.cancel_subscriptions();
                self.cache.invalidate(&self.owner_id);
                info!(owner_id = %self.owner_id, "unlock rejected");
                Ok(false)
            }
            Err(e) => {
                self.session.fail_verification();
                self.cancel_subscriptions();
                self.cache.invalidate(&self.owner_id);
                Err(e.into_user_facing())
            }
        }
    }

    /// Resume a session left by a previous instance over the same session store.
    pub fn restore_session(&self) -> bool {
        self.session.restore()
    }

    /// Stop live subscriptions, then erase the session secret and its keys.
    pub fn lock(&self) {
        self.cancel_subscriptions();
        self.session.lock();
        self.cache.invalidate(&self.owner_id);
    }

    /// Lock and drop every cached key and record.
    pub fn logout(&self) {
        self.cancel_subscriptions();
        self.session.logout();
        self.keys.clear();
        self.cache.clear();
        info!(owner_id = %self.owner_id, "logged out");
    }

    pub fn is_unlocked(&self) -> bool {
        self.session.is_unlocked()
    }

    /// The master secret, while unlocked.
    pub fn session_secret(&self) -> Option<SecretString> {
        self.session.get_secret()
    }

    // ── Records ───────────────────────────────────────────────────────────────

    /// Encrypt and store a new record. Returns its id.
    pub async fn add_record(&self, draft: &RecordDraft, secret: &SecretString) -> ZkvResult<String> {
        self.ensure_secret(secret)?;
        let id = uuid::Uuid::new_v4().to_string();
        let now = now_millis();
        let stored = seal_record(
            &self.executor,
            &self.owner_id,
            draft,
            secret,
            self.record_params,
            now,
            now,
        )
        .await?;

        self.write_record(&id, &stored).await?;
        debug!(owner_id = %self.owner_id, record_id = %id, category = %stored.category, "record added");
        Ok(id)
    }

    /// Replace a record's content, keeping its creation time.
    pub async fn update_record(
        &self,
        id: &str,
        draft: &RecordDraft,
        secret: &SecretString,
    ) -> ZkvResult<()> {
        self.ensure_secret(secret)?;
        let key = DocKey::record(&self.owner_id, id);
        let existing: StoredRecord = match self.store.get(&key).await? {
            Some(body) => serde_json::from_value(body)?,
            None => return Err(ZkvError::NotFound(id.to_string())),
        };

        let stored = seal_record(
            &self.executor,
            &self.owner_id,
            draft,
            secret,
            self.record_params,
            existing.created,
            now_millis().max(existing.last_modified + 1),
        )
        .await?;

        self.write_record(id, &stored).await?;
        debug!(owner_id = %self.owner_id, record_id = %id, "record updated");
        Ok(())
    }

    pub async fn delete_record(&self, id: &str) -> ZkvResult<()> {
        self.ensure_unlocked()?;
        let key = DocKey::record(&self.owner_id, id);
        if self.store.get(&key).await?.is_none() {
            return Err(ZkvError::NotFound(id.to_string()));
        }
        self.cache.invalidate(&self.owner_id);
        self.store.delete(&key).await?;
        self.cache.invalidate(&self.owner_id);
        debug!(owner_id = %self.owner_id, record_id = %id, "record deleted");
        Ok(())
    }

    /// All records, newest first. Served from the record cache while fresh.
    ///
    /// Records that fail to decrypt are dropped; if every record fails the
    /// secret is treated as wrong and nothing is cached.
    pub async fn get_all(&self, secret: &SecretString) -> ZkvResult<Vec<Record>> {
        self.ensure_secret(secret)?;
        if let Some(records) = self.cache.get(&self.owner_id) {
            debug!(owner_id = %self.owner_id, count = records.len(), "record cache hit");
            return Ok(records);
        }

        let generation = self.cache.generation(&self.owner_id);
        let docs = self.store.list(Collection::Records, &self.owner_id).await?;
        let total = docs.len();
        let records = self
            .channel
            .decrypt_snapshot(&self.owner_id, docs, secret)
            .await;
        if total > 0 && records.is_empty() {
            return Err(ZkvError::WrongSecretOrCorrupted);
        }

        self.cache
            .set_if_current(&self.owner_id, generation, &records);
        Ok(records)
    }

    /// Records whose `field` equals `value` after normalization, matched by
    /// searchable hash before anything is decrypted.
    pub async fn find(
        &self,
        field: SearchField,
        value: &str,
        secret: &SecretString,
    ) -> ZkvResult<Vec<Record>> {
        self.ensure_secret(secret)?;
        let wanted = hash_field(value, &self.owner_id);

        let docs = self.store.list(Collection::Records, &self.owner_id).await?;
        let matches: Vec<_> = docs
            .into_iter()
            .filter(|doc| {
                serde_json::from_value::<StoredRecord>(doc.body.clone())
                    .map(|stored| field.stored(&stored.searchable_hashes) == Some(wanted.as_str()))
                    .unwrap_or(false)
            })
            .collect();

        Ok(self
            .channel
            .decrypt_snapshot(&self.owner_id, matches, secret)
            .await)
    }

    /// Follow remote changes. `on_update` receives each published snapshot
    /// (newest first); `on_error` receives stream-level failures.
    pub async fn subscribe(
        &self,
        secret: &SecretString,
        on_update: UpdateCallback,
        on_error: ErrorCallback,
    ) -> ZkvResult<Subscription> {
        self.ensure_secret(secret)?;
        let cancel = self.subscriptions.lock().child_token();
        let snapshots = self
            .store
            .subscribe(Collection::Records, &self.owner_id)
            .await?;
        Ok(self.channel.start(
            &self.owner_id,
            SecretString::from(secret.expose_secret().to_owned()),
            snapshots,
            on_update,
            on_error,
            cancel,
        ))
    }

    /// Stop the crypto worker. The service keeps working on the inline path.
    pub fn shutdown(&self) {
        self.executor.shutdown();
    }

    // ── Internals ─────────────────────────────────────────────────────────────

    fn ensure_unlocked(&self) -> ZkvResult<()> {
        if !self.session.is_unlocked() {
            return Err(ZkvError::Locked);
        }
        self.session.touch();
        Ok(())
    }

    /// Unlocked, and `secret` is the session's master secret.
    fn ensure_secret(&self, secret: &SecretString) -> ZkvResult<()> {
        self.ensure_unlocked()?;
        if !self.session.matches(secret) {
            warn!(owner_id = %self.owner_id, "supplied secret does not match session");
            return Err(ZkvError::WrongSecretOrCorrupted);
        }
        Ok(())
    }

    fn cancel_subscriptions(&self) {
        let token = std::mem::replace(&mut *self.subscriptions.lock(), CancellationToken::new());
        token.cancel();
    }

    async fn write_record(&self, id: &str, stored: &StoredRecord) -> ZkvResult<()> {
        let key = DocKey::record(&self.owner_id, id);
        let body = serde_json::to_value(stored)?;
        self.cache.invalidate(&self.owner_id);
        self.store.put(&key, &body).await?;
        // A read racing the write may have refilled the entry
        self.cache.invalidate(&self.owner_id);
        Ok(())
    }

    async fn verify_secret(&self, secret: &SecretString) -> ZkvResult<bool> {
        let key = DocKey::credential(&self.owner_id);
        let body = self
            .store
            .get(&key)
            .await?
            .ok_or_else(|| ZkvError::NotFound(format!("credential for {}", self.owner_id)))?;
        let mut credential: UserCredentialRecord = serde_json::from_value(body)?;

        match self.executor.verify(credential.clone(), secret).await? {
            VerifyOutcome::Verified {
                method,
                backfill_fast_hash,
            } => {
                debug!(owner_id = %self.owner_id, ?method, "secret verified");
                if let Some(fast) = backfill_fast_hash {
                    credential.secret_fast_hash = Some(fast);
                    match serde_json::to_value(&credential) {
                        Ok(body) => {
                            if let Err(e) = self.store.put(&key, &body).await {
                                warn!(owner_id = %self.owner_id, error = %e, "fast hash backfill failed");
                            }
                        }
                        Err(e) => warn!(error = %e, "serializing credential for backfill"),
                    }
                }
                Ok(true)
            }
            VerifyOutcome::Rejected => Ok(false),
        }
    }
}
