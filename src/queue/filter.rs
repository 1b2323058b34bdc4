use serde::{Deserialize, Serialize};

use crate::queue::entry::{EntryId, QueueEntry};

/// Caller-supplied restriction on which entries a claim or release may touch.
///
/// An empty filter matches every entry. `ids: Some(vec![])` matches nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<EntryId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

impl EntryFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    pub fn with_ids(mut self, ids: Vec<EntryId>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn matches(&self, entry: &QueueEntry) -> bool {
        if let Some(ref ids) = self.ids {
            if !ids.contains(&entry.id) {
                return false;
            }
        }
        if let Some(ref kind) = self.kind {
            if &entry.kind != kind {
                return false;
            }
        }
        true
    }
}
