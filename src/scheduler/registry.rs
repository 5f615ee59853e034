//! Cancellation registry: task id to token lookup plus the tag index.
//!
//! The registry holds clones of each live task's [`CancellationToken`] for
//! signalling only. It never owns or drives the work itself.

use std::collections::{BTreeSet, HashMap};

use tokio_util::sync::CancellationToken;

#[derive(Debug)]
struct Entry {
    token: CancellationToken,
    tags: BTreeSet<String>,
}

/// Lookup tables for cancelling live tasks by id or tag.
#[derive(Debug, Default)]
pub struct CancellationRegistry {
    entries: HashMap<String, Entry>,
    by_tag: HashMap<String, BTreeSet<String>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, id: &str, token: CancellationToken, tags: &BTreeSet<String>) {
        for tag in tags {
            self.by_tag.entry(tag.clone()).or_default().insert(id.to_string());
        }
        self.entries.insert(id.to_string(), Entry {
            token,
            tags: tags.clone(),
        });
    }

    /// Drop every reference to `id`. Returns false if it was not registered.
    pub fn unregister(&mut self, id: &str) -> bool {
        let Some(entry) = self.entries.remove(id) else {
            return false;
        };
        for tag in &entry.tags {
            if let Some(ids) = self.by_tag.get_mut(tag) {
                ids.remove(id);
                if ids.is_empty() {
                    self.by_tag.remove(tag);
                }
            }
        }
        true
    }

    /// Fire the token for `id`. Returns false if the id is unknown.
    pub fn signal(&self, id: &str) -> bool {
        match self.entries.get(id) {
            Some(entry) => {
                entry.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Live task ids carrying `tag`, in sorted order.
    pub fn ids_for_tag(&self, tag: &str) -> Vec<String> {
        self.by_tag
            .get(tag)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }
}
