use serde::{Deserialize, Serialize};

use crate::ids::ItemId;

/// Handle to one persisted unit of pending work. The payload itself stays in the backend
/// and is read on demand.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: ItemId,
    pub queue_name: String,
    /// Short operator-facing tag (recipient, assignment name).
    pub discriminator: String,
    /// Backend locator: the file name for the directory queue, the row id for sqlite.
    pub key: String,
    pub created_at_unix: i64,
}

/// Where an archive call left the item.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArchiveReceipt {
    pub archive: crate::model::Archive,
    pub location: String,
    pub already_archived: bool,
}
