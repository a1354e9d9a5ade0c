//! zkv-core: shared data model, wire formats, configuration and errors for zkvault
//!
//! Trust boundary:
//! ```text
//! Record (plaintext, memory only)
//!   └── SealedContent (name + data) ──encrypt──▶ EncryptedEnvelope
//!                                                  └── StoredRecord (+ metadata, searchable hashes)
//!                                                        └── remote document store
//! ```

pub mod config;
pub mod error;
pub mod logging;
pub mod types;

pub use error::{ZkvError, ZkvResult};
