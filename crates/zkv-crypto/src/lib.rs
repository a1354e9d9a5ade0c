//! zkv-crypto: client-side encryption for zkvault
//!
//! Architecture: Encrypt-then-MAC with PBKDF2-SHA512 derived keys
//!
//! Pipeline: record JSON → AES-256-CBC (PKCS7) → HMAC-SHA256(iv || ciphertext) → envelope → store
//!
//! Key hierarchy:
//! ```text
//! Master secret (user-held, never persisted)
//!   ├── Encryption key      PBKDF2-SHA512(secret, salt)            per envelope
//!   ├── Authentication key  PBKDF2-SHA512(secret, salt || ":hmac") per envelope
//!   ├── Slow / fast verification hashes (credential record)
//!   └── Session copy: XChaCha20-Poly1305 under an ephemeral session key
//! ```

pub mod cipher;
pub mod credential;
pub mod kdf;
pub mod search;
pub mod session;

pub use cipher::AuthenticatedCipher;
pub use credential::{enroll, verify, CredentialParams, VerifyMethod, VerifyOutcome};
pub use kdf::{derive_key, generate_iv, generate_salt, DerivedKey, KeyCache};
pub use search::{hash_field, searchable_hashes, SearchField};
pub use session::{MemorySessionStore, SessionSecretVault, SessionState, SessionStore};

/// Size of a per-envelope salt in bytes (256-bit)
pub const SALT_SIZE: usize = 32;

/// Size of an AES-CBC initialization vector (128-bit)
pub const IV_SIZE: usize = 16;

/// Size of an ephemeral session key (256-bit)
pub const SESSION_KEY_SIZE: usize = 32;

/// Size of an XChaCha20-Poly1305 nonce (192-bit)
pub const NONCE_SIZE: usize = 24;
