//! Heap-resident storage backend.

mod backend;
mod table;

pub use backend::HeapStorageBackend;
pub use table::HeapStateTable;
