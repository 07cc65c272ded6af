//! DataStore: in-memory index over keyed entities, durable in a document
//! store through the write-behind sync service.

mod document;
mod error;
mod event;
mod memory;
mod sync;

pub use document::{
    collections, DocumentStore, FileDocumentStore, MemoryDocumentStore, NoopDocumentStore,
};
pub use error::{Result, StoreError};
pub use event::Event;
pub use memory::{DataStore, DirtySnapshot, EntityKind};
pub use sync::SyncService;
