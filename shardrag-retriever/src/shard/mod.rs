//! Persisted shards and how to find them

pub mod discovery;
pub mod index;

pub use discovery::{ShardDiscovery, ShardHandle};
pub use index::{INDEX_FILE, METADATA_FILE, MetadataRecord, SearchHit, ShardIndex};
