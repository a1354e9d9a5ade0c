//! Owner-salted SHA-256 hashes of normalized fields for exact-match filtering
//! on the server.
//!
//! This is not encryption. Only name, url and username are indexed; never
//! hash a password or any other field whose hash must not leave the client.

use sha2::{Digest, Sha256};

use zkv_core::types::{SealedContent, SearchableHashes};

/// Fields that carry a searchable hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchField {
    Name,
    Url,
    Username,
}

impl SearchField {
    /// The stored hash for this field, if the record has one.
    pub fn stored<'a>(&self, hashes: &'a SearchableHashes) -> Option<&'a str> {
        match self {
            SearchField::Name => Some(hashes.name_hash.as_str()),
            SearchField::Url => hashes.url_hash.as_deref(),
            SearchField::Username => hashes.username_hash.as_deref(),
        }
    }
}

pub fn normalize(value: &str) -> String {
    value.trim().to_lowercase()
}

/// Hash a field value for `owner_id`.
///
/// Equal values (after lowercase + trim) under one owner always collide;
/// the owner id is length-prefixed so distinct owners never do.
pub fn hash_field(value: &str, owner_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update((owner_id.len() as u64).to_be_bytes());
    hasher.update(owner_id.as_bytes());
    hasher.update(normalize(value).as_bytes());
    hex::encode(hasher.finalize())
}

/// Build the searchable hash set for a record's content.
pub fn searchable_hashes(content: &SealedContent, owner_id: &str) -> SearchableHashes {
    SearchableHashes {
        name_hash: hash_field(&content.name, owner_id),
        url_hash: content
            .data
            .url()
            .filter(|url| !url.trim().is_empty())
            .map(|url| hash_field(url, owner_id)),
        username_hash: content
            .data
            .username()
            .filter(|user| !user.trim().is_empty())
            .map(|user| hash_field(user, owner_id)),
    }
}
