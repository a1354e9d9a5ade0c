//! Record sealing and opening: `RecordDraft` → `StoredRecord` document and back.
//!
//! Only name and category-specific data go into the envelope; favorite, tags
//! and timestamps stay in plaintext metadata next to it.

use secrecy::SecretString;

use zkv_core::types::{KdfParams, Record, RecordDraft, SealedContent, StoredRecord};
use zkv_core::{ZkvError, ZkvResult};
use zkv_crypto::searchable_hashes;

use crate::executor::CryptoTaskExecutor;
use crate::store::Document;

/// Encrypt a draft into its stored form.
pub async fn seal_record(
    executor: &CryptoTaskExecutor,
    owner_id: &str,
    draft: &RecordDraft,
    secret: &SecretString,
    params: KdfParams,
    created: i64,
    last_modified: i64,
) -> ZkvResult<StoredRecord> {
    let content = draft.sealed_content();
    let plaintext = serde_json::to_string(&content)?;
    let encrypted_data = executor.encrypt(plaintext, secret, params).await?;

    Ok(StoredRecord {
        owner_id: owner_id.to_string(),
        encrypted_data,
        category: content.data.category(),
        favorite: draft.favorite,
        last_modified,
        created,
        tags: draft.tags.clone(),
        searchable_hashes: searchable_hashes(&content, owner_id),
    })
}

/// Decrypt a stored record document.
///
/// Fails on a foreign owner, an undecryptable envelope, or sealed content
/// whose category disagrees with the plaintext metadata.
pub async fn open_record(
    executor: &CryptoTaskExecutor,
    owner_id: &str,
    doc: Document,
    secret: &SecretString,
) -> ZkvResult<Record> {
    let stored: StoredRecord = serde_json::from_value(doc.body)?;
    if stored.owner_id != owner_id {
        return Err(ZkvError::Sync(format!(
            "record {} belongs to another owner",
            doc.id
        )));
    }

    let plaintext = executor
        .decrypt(stored.encrypted_data.clone(), secret)
        .await?;
    let content: SealedContent =
        serde_json::from_str(&plaintext).map_err(|_| ZkvError::WrongSecretOrCorrupted)?;
    if content.data.category() != stored.category {
        return Err(ZkvError::Sync(format!(
            "record {}: sealed category {} does not match stored {}",
            doc.id,
            content.data.category(),
            stored.category
        )));
    }

    Ok(stored.into_record(doc.id, content))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use zkv_core::config::ExecutorConfig;
    use zkv_core::types::{Category, LoginData, NoteData, RecordData};
    use zkv_crypto::{AuthenticatedCipher, CredentialParams, KeyCache};

    const FAST: KdfParams = KdfParams::new(300);

    fn executor() -> CryptoTaskExecutor {
        let config = ExecutorConfig {
            use_worker: false,
            ..Default::default()
        };
        CryptoTaskExecutor::start(
            &config,
            AuthenticatedCipher::new(Arc::new(KeyCache::default())),
            CredentialParams::default(),
        )
    }

    fn login() -> RecordDraft {
        RecordDraft::new(
            "GitHub",
            RecordData::Login(LoginData {
                username: "dev".into(),
                password: "x".into(),
                ..Default::default()
            }),
        )
        .tags(["work"])
    }

    fn doc(id: &str, stored: &StoredRecord) -> Document {
        Document {
            id: id.into(),
            body: serde_json::to_value(stored).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_seal_then_open() {
        let ex = executor();
        let secret = SecretString::from("s");
        let stored = seal_record(&ex, "user1", &login(), &secret, FAST, 10, 20)
            .await
            .unwrap();

        assert_eq!(stored.category, Category::Login);
        assert_eq!(stored.tags, vec!["work"]);
        let wire = serde_json::to_string(&stored).unwrap();
        assert!(!wire.contains("GitHub"));
        assert!(!wire.contains("\"dev\""));

        let record = open_record(&ex, "user1", doc("r1", &stored), &secret)
            .await
            .unwrap();
        assert_eq!(record.id, "r1");
        assert_eq!(record.name, "GitHub");
        assert_eq!(record.created, 10);
        assert_eq!(record.last_modified, 20);
    }

    #[tokio::test]
    async fn test_open_rejects_foreign_owner() {
        let ex = executor();
        let secret = SecretString::from("s");
        let stored = seal_record(&ex, "user1", &login(), &secret, FAST, 1, 1)
            .await
            .unwrap();
        let err = open_record(&ex, "user2", doc("r1", &stored), &secret)
            .await
            .unwrap_err();
        assert!(matches!(err, ZkvError::Sync(_)));
    }

    #[tokio::test]
    async fn test_open_rejects_category_mismatch() {
        let ex = executor();
        let secret = SecretString::from("s");
        let note = RecordDraft::new(
            "Diary",
            RecordData::Note(NoteData {
                content: "x".into(),
            }),
        );
        let mut stored = seal_record(&ex, "user1", &note, &secret, FAST, 1, 1)
            .await
            .unwrap();
        stored.category = Category::Card;

        assert!(open_record(&ex, "user1", doc("r1", &stored), &secret)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_open_with_wrong_secret_is_auth_failure() {
        let ex = executor();
        let stored = seal_record(&ex, "user1", &login(), &SecretString::from("a"), FAST, 1, 1)
            .await
            .unwrap();
        let err = open_record(&ex, "user1", doc("r1", &stored), &SecretString::from("b"))
            .await
            .unwrap_err();
        assert!(err.is_auth_failure());
    }
}
