//! zkv-sync: crypto worker, record cache, debounced sync channel and the
//! vault service over an opaque document store.

pub mod cache;
pub mod channel;
pub mod codec;
pub mod executor;
pub mod service;
pub mod store;

pub use cache::{CacheGeneration, RecordCache};
pub use channel::{on_error, on_update, ErrorCallback, Subscription, SyncChannel, UpdateCallback};
pub use executor::{CryptoOp, CryptoOutput, CryptoTaskExecutor};
pub use service::VaultService;
pub use store::{Collection, DocKey, Document, DocumentStore, OpendalStore, SnapshotStream};
