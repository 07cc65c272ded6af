//! Periodic write-behind flush to the document store.
//!
//! Mutations mark entities dirty in the DataStore; this service clones
//! them out on its cadence and upserts them. The flush never holds the
//! store lock across I/O. Failed writes are re-marked dirty so the next
//! cycle retries them.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::document::DocumentStore;
use super::memory::{DataStore, EntityKind};

pub struct SyncService {
    store: Arc<DataStore>,
    documents: Arc<dyn DocumentStore>,
    interval: Duration,
}

impl SyncService {
    pub fn new(
        store: Arc<DataStore>,
        documents: Arc<dyn DocumentStore>,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            documents,
            interval,
        }
    }

    /// Flush every dirty entity once. Returns the number written.
    pub async fn flush(&self) -> usize {
        let snapshot = self.store.take_dirty().await;
        if snapshot.is_empty() {
            return 0;
        }
        let mut written = 0;

        for node in snapshot.nodes {
            written += self
                .write(EntityKind::Node, &node.id, serde_json::to_value(&node))
                .await;
        }
        for vm in snapshot.vms {
            written += self
                .write(EntityKind::Vm, &vm.id, serde_json::to_value(&vm))
                .await;
        }
        for user in snapshot.users {
            written += self
                .write(EntityKind::User, &user.id, serde_json::to_value(&user))
                .await;
        }
        for command in snapshot.commands {
            written += self
                .write(
                    EntityKind::Command,
                    &command.command_id,
                    serde_json::to_value(&command),
                )
                .await;
        }
        for (collection, id) in snapshot.deleted {
            if let Err(e) = self.documents.delete(collection, &id).await {
                warn!(collection, id, error = %e, "Failed to delete document (will not retry)");
            }
        }
        written
    }

    async fn write(
        &self,
        kind: EntityKind,
        id: &str,
        doc: serde_json::Result<serde_json::Value>,
    ) -> usize {
        let doc = match doc {
            Ok(doc) => doc,
            Err(e) => {
                warn!(id, error = %e, "Failed to serialize entity for flush");
                return 0;
            }
        };
        match self.documents.upsert(kind.collection(), id, doc).await {
            Ok(()) => 1,
            Err(e) => {
                warn!(collection = kind.collection(), id, error = %e, "Flush failed, will retry");
                self.store.mark_dirty(kind, id).await;
                0
            }
        }
    }

    /// Run the periodic flush until shutdown. A final flush runs on the
    /// way out.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            if !self.documents.is_backed_by_document_store() {
                debug!("Document store not configured, sync disabled");
                return;
            }
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let written = self.flush().await;
                        if written > 0 {
                            debug!(written, "Synced dirty entities to document store");
                        }
                    }
                    _ = shutdown.changed() => {
                        let written = self.flush().await;
                        info!(written, "Final sync flush complete");
                        return;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::document::{collections, MemoryDocumentStore};
    use crate::store::memory::DataStore;

    #[tokio::test]
    async fn test_flush_writes_dirty_entities() {
        let store = Arc::new(DataStore::new());
        let docs = Arc::new(MemoryDocumentStore::new());
        let sync = SyncService::new(store.clone(), docs.clone(), Duration::from_secs(60));

        store
            .save_user(crate::model::UserData::new("user-1", None))
            .await;
        store
            .register_command(
                "cmd-1",
                "vm-1",
                "node-1",
                crate::command::CommandType::CreateVm,
            )
            .await;

        let written = sync.flush().await;
        assert_eq!(written, 2);
        assert_eq!(docs.len(collections::USERS).await, 1);
        assert_eq!(docs.len(collections::COMMANDS).await, 1);

        // Clean store flushes nothing
        assert_eq!(sync.flush().await, 0);
    }

    #[tokio::test]
    async fn test_flush_removes_deleted_documents() {
        let store = Arc::new(DataStore::new());
        let docs = Arc::new(MemoryDocumentStore::new());
        let sync = SyncService::new(store.clone(), docs.clone(), Duration::from_secs(60));

        store
            .register_command(
                "cmd-1",
                "vm-1",
                "node-1",
                crate::command::CommandType::DeleteVm,
            )
            .await;
        sync.flush().await;
        assert_eq!(docs.len(collections::COMMANDS).await, 1);

        let _ = store.try_complete_command("cmd-1").await;
        sync.flush().await;
        assert_eq!(docs.len(collections::COMMANDS).await, 0);
    }
}
