use serde::{Deserialize, Serialize};
use std::fmt;

/// Key size in 32-bit words for every envelope this crate writes (AES-256).
pub const DEFAULT_KEY_SIZE_WORDS: u32 = 8;

// ── Key derivation parameters ─────────────────────────────────────────────────

/// PBKDF2 parameters carried inside every envelope.
///
/// `key_size` is counted in 32-bit words, so `8` means a 256-bit key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KdfParams {
    pub iterations: u32,
    pub key_size: u32,
}

impl KdfParams {
    pub const fn new(iterations: u32) -> Self {
        Self {
            iterations,
            key_size: DEFAULT_KEY_SIZE_WORDS,
        }
    }

    /// Derived key length in bytes.
    pub fn key_len(&self) -> usize {
        self.key_size as usize * 4
    }
}

// ── Envelope ──────────────────────────────────────────────────────────────────

/// Ciphertext, IV, salt and KDF parameters shared by both envelope variants.
///
/// `encrypted_data` is standard base64; `iv` and `salt` are lowercase hex.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedPayload {
    pub encrypted_data: String,
    pub iv: String,
    pub salt: String,
    pub params: KdfParams,
}

/// Self-describing ciphertext package.
///
/// Every envelope created by this crate is `Authenticated`. `Legacy` only
/// exists so data written before authentication tags still decrypts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "EnvelopeWire", into = "EnvelopeWire")]
pub enum EncryptedEnvelope {
    Authenticated {
        payload: SealedPayload,
        /// HMAC-SHA256 over `iv || ciphertext`, lowercase hex
        hmac: String,
    },
    Legacy(SealedPayload),
}

impl EncryptedEnvelope {
    pub fn payload(&self) -> &SealedPayload {
        match self {
            EncryptedEnvelope::Authenticated { payload, .. } => payload,
            EncryptedEnvelope::Legacy(payload) => payload,
        }
    }

    pub fn payload_mut(&mut self) -> &mut SealedPayload {
        match self {
            EncryptedEnvelope::Authenticated { payload, .. } => payload,
            EncryptedEnvelope::Legacy(payload) => payload,
        }
    }

    pub fn hmac(&self) -> Option<&str> {
        match self {
            EncryptedEnvelope::Authenticated { hmac, .. } => Some(hmac),
            EncryptedEnvelope::Legacy(_) => None,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(self, EncryptedEnvelope::Authenticated { .. })
    }

    pub fn params(&self) -> &KdfParams {
        &self.payload().params
    }
}

/// On-the-wire envelope shape:
/// `{ encryptedData, iv, salt, hmac?, keyDerivationParams: { iterations, keySize } }`
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EnvelopeWire {
    encrypted_data: String,
    iv: String,
    salt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    hmac: Option<String>,
    key_derivation_params: KdfParams,
}

impl From<EnvelopeWire> for EncryptedEnvelope {
    fn from(wire: EnvelopeWire) -> Self {
        let payload = SealedPayload {
            encrypted_data: wire.encrypted_data,
            iv: wire.iv,
            salt: wire.salt,
            params: wire.key_derivation_params,
        };
        match wire.hmac {
            Some(hmac) if !hmac.is_empty() => EncryptedEnvelope::Authenticated { payload, hmac },
            _ => EncryptedEnvelope::Legacy(payload),
        }
    }
}

impl From<EncryptedEnvelope> for EnvelopeWire {
    fn from(envelope: EncryptedEnvelope) -> Self {
        let (payload, hmac) = match envelope {
            EncryptedEnvelope::Authenticated { payload, hmac } => (payload, Some(hmac)),
            EncryptedEnvelope::Legacy(payload) => (payload, None),
        };
        EnvelopeWire {
            encrypted_data: payload.encrypted_data,
            iv: payload.iv,
            salt: payload.salt,
            hmac,
            key_derivation_params: payload.params,
        }
    }
}

// ── Records ───────────────────────────────────────────────────────────────────

/// Closed set of record categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Login,
    Note,
    Card,
    Identity,
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Category::Login => "login",
            Category::Note => "note",
            Category::Card => "card",
            Category::Identity => "identity",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginData {
    pub username: String,
    pub password: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub totp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NoteData {
    pub content: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CardData {
    pub cardholder_name: String,
    pub number: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cvv: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityData {
    pub first_name: String,
    pub last_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

/// Category-specific payload of a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RecordData {
    Login(LoginData),
    Note(NoteData),
    Card(CardData),
    Identity(IdentityData),
}

impl RecordData {
    pub fn category(&self) -> Category {
        match self {
            RecordData::Login(_) => Category::Login,
            RecordData::Note(_) => Category::Note,
            RecordData::Card(_) => Category::Card,
            RecordData::Identity(_) => Category::Identity,
        }
    }

    pub fn url(&self) -> Option<&str> {
        match self {
            RecordData::Login(login) => login.url.as_deref(),
            _ => None,
        }
    }

    pub fn username(&self) -> Option<&str> {
        match self {
            RecordData::Login(login) => Some(login.username.as_str()),
            _ => None,
        }
    }
}

/// The part of a record that is encrypted into the envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedContent {
    pub name: String,
    pub data: RecordData,
}

/// A decrypted vault record. Lives in memory only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    pub id: String,
    pub name: String,
    pub data: RecordData,
    pub favorite: bool,
    pub tags: Vec<String>,
    /// Unix epoch milliseconds
    pub created: i64,
    /// Unix epoch milliseconds
    pub last_modified: i64,
}

impl Record {
    pub fn category(&self) -> Category {
        self.data.category()
    }
}

/// Plaintext supplied by a caller for add/update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordDraft {
    pub name: String,
    pub data: RecordData,
    pub favorite: bool,
    pub tags: Vec<String>,
}

impl RecordDraft {
    pub fn new(name: impl Into<String>, data: RecordData) -> Self {
        Self {
            name: name.into(),
            data,
            favorite: false,
            tags: Vec::new(),
        }
    }

    pub fn favorite(mut self, favorite: bool) -> Self {
        self.favorite = favorite;
        self
    }

    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn sealed_content(&self) -> SealedContent {
        SealedContent {
            name: self.name.clone(),
            data: self.data.clone(),
        }
    }
}

// ── Stored representation ─────────────────────────────────────────────────────

/// One-way, owner-salted hashes used for exact-match filtering.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchableHashes {
    pub name_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_hash: Option<String>,
}

/// The only record representation that crosses the trust boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredRecord {
    pub owner_id: String,
    pub encrypted_data: EncryptedEnvelope,
    pub category: Category,
    pub favorite: bool,
    pub last_modified: i64,
    pub created: i64,
    #[serde(default)]
    pub tags: Vec<String>,
    pub searchable_hashes: SearchableHashes,
}

impl StoredRecord {
    /// Join decrypted content with this record's plaintext metadata.
    pub fn into_record(self, id: impl Into<String>, content: SealedContent) -> Record {
        Record {
            id: id.into(),
            name: content.name,
            data: content.data,
            favorite: self.favorite,
            tags: self.tags,
            created: self.created,
            last_modified: self.last_modified,
        }
    }
}

/// Per-user verification material, created at registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserCredentialRecord {
    pub owner_id: String,
    /// High-iteration PBKDF2 hash of the master secret (hex)
    pub secret_salted_slow_hash: String,
    /// Hex salt shared by the slow and fast hashes
    pub salt: String,
    /// Low-iteration hash; backfilled lazily onto older accounts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_fast_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    /// Envelope of a known verification string, for pre-fast-hash accounts
    pub legacy_test_envelope: EncryptedEnvelope,
}

/// Current Unix time in milliseconds.
pub fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}
