//! Remote document store: owner-scoped JSON documents with snapshot feeds.
//!
//! Layout on the backing operator:
//! ```text
//! {prefix}/records/{owner_id}/{record_id}.json
//! {prefix}/credentials/{owner_id}/{owner_id}.json
//! ```
//!
//! Only `StoredRecord` / `UserCredentialRecord` JSON ever reaches this layer;
//! nothing here sees plaintext.

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use opendal::{ErrorKind, Operator};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::ReceiverStream;

use zkv_core::config::StorageConfig;
use zkv_core::{ZkvError, ZkvResult};

const CHANGE_FEED_CAPACITY: usize = 256;
const SNAPSHOT_BUFFER: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    Records,
    Credentials,
}

impl Collection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Records => "records",
            Collection::Credentials => "credentials",
        }
    }
}

/// Address of one document.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DocKey {
    pub collection: Collection,
    pub owner_id: String,
    pub id: String,
}

impl DocKey {
    pub fn record(owner_id: &str, id: &str) -> Self {
        DocKey {
            collection: Collection::Records,
            owner_id: owner_id.to_string(),
            id: id.to_string(),
        }
    }

    /// One credential document per owner, keyed by the owner id.
    pub fn credential(owner_id: &str) -> Self {
        DocKey {
            collection: Collection::Credentials,
            owner_id: owner_id.to_string(),
            id: owner_id.to_string(),
        }
    }
}

/// A stored document and its id.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub body: Value,
}

impl Document {
    /// `lastModified` epoch-ms, or 0 when absent.
    pub fn last_modified(&self) -> i64 {
        self.body
            .get("lastModified")
            .and_then(Value::as_i64)
            .unwrap_or(0)
    }
}

/// Stream of full owner snapshots (lastModified desc): the current snapshot
/// first, then one per change.
pub type SnapshotStream = BoxStream<'static, ZkvResult<Vec<Document>>>;

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn put(&self, key: &DocKey, doc: &Value) -> ZkvResult<()>;

    async fn get(&self, key: &DocKey) -> ZkvResult<Option<Value>>;

    /// All documents of one owner, ordered by `lastModified` descending.
    async fn list(&self, collection: Collection, owner_id: &str) -> ZkvResult<Vec<Document>>;

    /// Removing a missing document is not an error.
    async fn delete(&self, key: &DocKey) -> ZkvResult<()>;

    async fn subscribe(&self, collection: Collection, owner_id: &str)
        -> ZkvResult<SnapshotStream>;
}

// ── OpenDAL implementation ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
struct ChangeNotice {
    collection: Collection,
    owner_id: String,
}

/// `DocumentStore` over an OpenDAL operator.
///
/// Change notifications are in-process: subscribers see writes made through
/// this store (and its clones), not writes by other processes.
#[derive(Clone)]
pub struct OpendalStore {
    op: Operator,
    prefix: String,
    changes: broadcast::Sender<ChangeNotice>,
}

impl OpendalStore {
    pub fn new(op: Operator, prefix: impl Into<String>) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        OpendalStore {
            op,
            prefix: prefix.into().trim_matches('/').to_string(),
            changes,
        }
    }

    /// In-memory store, for tests and ephemeral sessions.
    pub fn memory(prefix: impl Into<String>) -> ZkvResult<Self> {
        let op = Operator::new(opendal::services::Memory::default())
            .map_err(|e| storage_err("creating memory operator", e))?
            .finish();
        Ok(Self::new(op, prefix))
    }

    /// Build from config; S3 credentials come from the environment
    /// (`AWS_ACCESS_KEY_ID` / `AWS_SECRET_ACCESS_KEY`, or the `ZKV_` variants).
    pub fn from_config(cfg: &StorageConfig) -> ZkvResult<Self> {
        match cfg.backend.as_str() {
            "memory" => Self::memory(cfg.prefix.clone()),
            "s3" => {
                let access_key = std::env::var("AWS_ACCESS_KEY_ID")
                    .or_else(|_| std::env::var("ZKV_ACCESS_KEY_ID"))
                    .map_err(|_| {
                        ZkvError::Config("S3 credentials not set: export AWS_ACCESS_KEY_ID".into())
                    })?;
                let secret_key = std::env::var("AWS_SECRET_ACCESS_KEY")
                    .or_else(|_| std::env::var("ZKV_SECRET_ACCESS_KEY"))
                    .map_err(|_| ZkvError::Config("AWS_SECRET_ACCESS_KEY not set".into()))?;
                let op = build_s3_operator(cfg, &access_key, &secret_key)?;
                Ok(Self::new(op, cfg.prefix.clone()))
            }
            other => Err(ZkvError::Config(format!(
                "unknown storage backend '{other}' (expected memory or s3)"
            ))),
        }
    }

    /// Verify the backend is reachable by listing the store prefix.
    pub async fn check_health(&self) -> ZkvResult<()> {
        self.op
            .list(&format!("{}/", self.prefix))
            .await
            .map(|_| ())
            .or_else(|e| match e.kind() {
                ErrorKind::NotFound => Ok(()),
                _ => Err(storage_err("storage health check failed", e)),
            })
    }

    fn owner_dir(&self, collection: Collection, owner_id: &str) -> ZkvResult<String> {
        check_segment("owner id", owner_id)?;
        Ok(format!("{}/{}/{}/", self.prefix, collection.as_str(), owner_id))
    }

    fn path(&self, key: &DocKey) -> ZkvResult<String> {
        check_segment("document id", &key.id)?;
        Ok(format!(
            "{}{}.json",
            self.owner_dir(key.collection, &key.owner_id)?,
            key.id
        ))
    }

    fn notify(&self, key: &DocKey) {
        // No receivers is fine
        let _ = self.changes.send(ChangeNotice {
            collection: key.collection,
            owner_id: key.owner_id.clone(),
        });
    }

    async fn read_json(&self, path: &str) -> ZkvResult<Option<Value>> {
        match self.op.read(path).await {
            Ok(buf) => Ok(Some(serde_json::from_slice(&buf.to_vec())?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(storage_err(&format!("reading {path}"), e)),
        }
    }
}

#[async_trait]
impl DocumentStore for OpendalStore {
    async fn put(&self, key: &DocKey, doc: &Value) -> ZkvResult<()> {
        let path = self.path(key)?;
        let bytes = serde_json::to_vec(doc)?;
        self.op
            .write(&path, bytes)
            .await
            .map_err(|e| storage_err(&format!("writing {path}"), e))?;
        tracing::debug!(collection = key.collection.as_str(), owner_id = %key.owner_id, id = %key.id, "document written");
        self.notify(key);
        Ok(())
    }

    async fn get(&self, key: &DocKey) -> ZkvResult<Option<Value>> {
        let path = self.path(key)?;
        self.read_json(&path).await
    }

    async fn list(&self, collection: Collection, owner_id: &str) -> ZkvResult<Vec<Document>> {
        let dir = self.owner_dir(collection, owner_id)?;
        let entries = match self.op.list(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(storage_err(&format!("listing {dir}"), e)),
        };

        let mut docs = Vec::with_capacity(entries.len());
        for entry in entries {
            let Some(id) = entry.name().strip_suffix(".json") else {
                continue;
            };
            let id = id.to_string();
            // Deleted between list and read
            let body = match self.read_json(entry.path()).await {
                Ok(Some(body)) => body,
                Ok(None) => continue,
                Err(ZkvError::Serialization(e)) => {
                    tracing::warn!(path = entry.path(), error = %e, "skipping malformed document");
                    continue;
                }
                Err(e) => return Err(e),
            };
            docs.push(Document { id, body });
        }

        docs.sort_by(|a, b| {
            b.last_modified()
                .cmp(&a.last_modified())
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(docs)
    }

    async fn delete(&self, key: &DocKey) -> ZkvResult<()> {
        let path = self.path(key)?;
        self.op
            .delete(&path)
            .await
            .map_err(|e| storage_err(&format!("deleting {path}"), e))?;
        tracing::debug!(collection = key.collection.as_str(), owner_id = %key.owner_id, id = %key.id, "document deleted");
        self.notify(key);
        Ok(())
    }

    async fn subscribe(
        &self,
        collection: Collection,
        owner_id: &str,
    ) -> ZkvResult<SnapshotStream> {
        self.owner_dir(collection, owner_id)?;

        // Subscribe before the initial listing so no write slips between them.
        let mut changes = self.changes.subscribe();
        let (tx, rx) = mpsc::channel(SNAPSHOT_BUFFER);
        let store = self.clone();
        let owner_id = owner_id.to_string();

        tokio::spawn(async move {
            if tx.send(store.list(collection, &owner_id).await).await.is_err() {
                return;
            }
            loop {
                let notice = tokio::select! {
                    _ = tx.closed() => break,
                    notice = changes.recv() => notice,
                };
                match notice {
                    Ok(n) if n.collection == collection && n.owner_id == owner_id => {}
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "change feed lagged; re-listing");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
                if tx.send(store.list(collection, &owner_id).await).await.is_err() {
                    break;
                }
            }
            tracing::debug!(owner_id = %owner_id, "snapshot feed closed");
        });

        Ok(ReceiverStream::new(rx).boxed())
    }
}

/// Build an OpenDAL operator for S3 or any S3-compatible endpoint.
///
/// Plain HTTP endpoints are refused when `enforce_tls` is set, and logged
/// as a warning otherwise.
pub fn build_s3_operator(
    cfg: &StorageConfig,
    access_key_id: &str,
    secret_access_key: &str,
) -> ZkvResult<Operator> {
    if cfg.endpoint.starts_with("http://") {
        if cfg.enforce_tls {
            return Err(ZkvError::Config(format!(
                "S3 endpoint uses plaintext HTTP ({}), but enforce_tls is enabled. \
                 Use an HTTPS endpoint or set storage.enforce_tls = false for local development.",
                cfg.endpoint
            )));
        }
        tracing::warn!(
            endpoint = %cfg.endpoint,
            "S3 endpoint uses plaintext HTTP; set storage.enforce_tls = true and use HTTPS in production"
        );
    }

    // opendal 0.55: consuming builder; path-style addressing is the default
    let builder = opendal::services::S3::default()
        .endpoint(&cfg.endpoint)
        .region(&cfg.region)
        .bucket(&cfg.bucket)
        .access_key_id(access_key_id)
        .secret_access_key(secret_access_key);

    let op = Operator::new(builder)
        .map_err(|e| storage_err("creating S3 operator", e))?
        .layer(opendal::layers::LoggingLayer::default())
        .layer(
            opendal::layers::RetryLayer::new()
                .with_max_times(5)
                .with_jitter(),
        )
        .finish();
    Ok(op)
}

fn check_segment(what: &str, value: &str) -> ZkvResult<()> {
    if value.is_empty() || value.contains('/') || value == "." || value == ".." {
        return Err(ZkvError::Storage(format!("invalid {what}: {value:?}")));
    }
    Ok(())
}

fn storage_err(context: &str, e: opendal::Error) -> ZkvError {
    ZkvError::Storage(format!("{context}: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn store() -> OpendalStore {
        OpendalStore::memory("test").unwrap()
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let s = store();
        let key = DocKey::record("user1", "r1");
        assert!(s.get(&key).await.unwrap().is_none());

        s.put(&key, &json!({"lastModified": 1, "v": "a"})).await.unwrap();
        assert_eq!(s.get(&key).await.unwrap().unwrap()["v"], "a");

        s.delete(&key).await.unwrap();
        assert!(s.get(&key).await.unwrap().is_none());
        // Idempotent
        s.delete(&key).await.unwrap();
    }

    #[tokio::test]
    async fn test_list_orders_by_last_modified_desc_and_scopes_owner() {
        let s = store();
        s.put(&DocKey::record("user1", "old"), &json!({"lastModified": 10}))
            .await
            .unwrap();
        s.put(&DocKey::record("user1", "new"), &json!({"lastModified": 30}))
            .await
            .unwrap();
        s.put(&DocKey::record("user1", "mid"), &json!({"lastModified": 20}))
            .await
            .unwrap();
        s.put(&DocKey::record("user2", "other"), &json!({"lastModified": 99}))
            .await
            .unwrap();

        let ids: Vec<_> = s
            .list(Collection::Records, "user1")
            .await
            .unwrap()
            .into_iter()
            .map(|d| d.id)
            .collect();
        assert_eq!(ids, vec!["new", "mid", "old"]);

        assert!(s
            .list(Collection::Records, "nobody")
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_collections_are_separate() {
        let s = store();
        s.put(&DocKey::credential("user1"), &json!({"ownerId": "user1"}))
            .await
            .unwrap();
        assert!(s.list(Collection::Records, "user1").await.unwrap().is_empty());
        assert_eq!(s.list(Collection::Credentials, "user1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_rejects_path_segments() {
        let s = store();
        let err = s
            .put(&DocKey::record("../etc", "x"), &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, ZkvError::Storage(_)));
        assert!(s.get(&DocKey::record("user1", "a/b")).await.is_err());
    }

    #[tokio::test]
    async fn test_subscribe_initial_then_changes() {
        let s = store();
        s.put(&DocKey::record("user1", "a"), &json!({"lastModified": 1}))
            .await
            .unwrap();

        let mut feed = s.subscribe(Collection::Records, "user1").await.unwrap();
        let initial = feed.next().await.unwrap().unwrap();
        assert_eq!(initial.len(), 1);

        // Writes for another owner do not wake this feed
        s.put(&DocKey::record("user2", "x"), &json!({"lastModified": 5}))
            .await
            .unwrap();
        s.put(&DocKey::record("user1", "b"), &json!({"lastModified": 2}))
            .await
            .unwrap();

        let next = tokio::time::timeout(Duration::from_secs(2), feed.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(next.len(), 2);
        assert_eq!(next[0].id, "b");
    }

    #[tokio::test]
    async fn test_health_check_on_memory() {
        assert!(store().check_health().await.is_ok());
    }

    #[test]
    fn test_s3_operator_http_allowed_without_enforce_tls() {
        let cfg = StorageConfig {
            backend: "s3".into(),
            endpoint: "http://localhost:8333".into(),
            enforce_tls: false,
            ..Default::default()
        };
        assert!(build_s3_operator(&cfg, "key", "secret").is_ok());
    }

    #[test]
    fn test_s3_operator_http_refused_with_enforce_tls() {
        let cfg = StorageConfig {
            backend: "s3".into(),
            endpoint: "http://insecure:8333".into(),
            enforce_tls: true,
            ..Default::default()
        };
        let err = build_s3_operator(&cfg, "key", "secret").unwrap_err();
        assert!(err.to_string().contains("enforce_tls"));
    }

    #[test]
    fn test_unknown_backend_rejected() {
        let cfg = StorageConfig {
            backend: "ftp".into(),
            ..Default::default()
        };
        assert!(matches!(
            OpendalStore::from_config(&cfg),
            Err(ZkvError::Config(_))
        ));
    }
}
