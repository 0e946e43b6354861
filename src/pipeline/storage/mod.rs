// Persistent state: the dedup store and the transform cache

pub mod in_memory;
pub mod sqlite;
pub mod traits;

pub use in_memory::InMemoryStore;
pub use sqlite::SqliteStateStore;
pub use traits::{DedupStore, StoreError, StoreResult, StoredEvent, TransformCache};
