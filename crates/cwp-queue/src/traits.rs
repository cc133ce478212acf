use cwp_core::{Archive, ArchiveReceipt, ItemId, WorkItem};

/// Durable pending/processed/rejected store for one queue.
///
/// Each queue has one producer role and one consumer role. Pending items form a set: no
/// ordering is promised, consumers must not rely on insertion order.
pub trait QueueBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Allocate the next id, persist `payload` under it and return the id. An existing item
    /// with the same identity is an internal error, never overwritten.
    fn push(&self, discriminator: &str, payload: &[u8]) -> anyhow::Result<ItemId>;

    fn list_pending(&self) -> anyhow::Result<Vec<WorkItem>>;

    fn read(&self, item: &WorkItem) -> anyhow::Result<Vec<u8>>;

    /// Move a pending item into an archive in one atomic step. Archiving an item that already
    /// left the pending set reports where it is and changes nothing.
    fn archive(&self, item: &WorkItem, archive: Archive) -> anyhow::Result<ArchiveReceipt>;

    fn list_archived(&self, archive: Archive) -> anyhow::Result<Vec<WorkItem>>;
}
