//! Document syncer - owns the element tree and page list replica
//!
//! The replica lives in two Y.Text containers holding JSON. Each write is a
//! full replace-if-changed inside one transaction tagged with its origin, so
//! observers can tell a full resync from an applied remote operation.

use crate::element::{self, Element, Page};
use crate::error::{Error, Result};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, warn};
use yrs::{Doc, GetString, Text, TextRef, Transact};

/// Text container holding the serialized element tree
pub const ELEMENTS_KEY: &str = "elementsJson";

/// Text container holding the serialized page list
pub const PAGES_KEY: &str = "pagesJson";

/// Transaction origin tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReplicaOrigin {
    /// Full-state baseline from a `sync:page` response
    Sync,
    /// Incremental operation broadcast by the server
    RemoteUpdate,
}

impl ReplicaOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplicaOrigin::Sync => "v2-sync",
            ReplicaOrigin::RemoteUpdate => "remote-update",
        }
    }
}

impl std::fmt::Display for ReplicaOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which slice of the replica a write touched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaSlice {
    Elements,
    Pages,
}

/// Emitted after every committed write that changed the replica
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaChange {
    pub slice: ReplicaSlice,
    pub origin: ReplicaOrigin,
}

/// Structural operation on the element tree
#[derive(Debug, Clone, PartialEq)]
pub enum ElementOperation {
    /// create and update both resolve to an upsert
    Upsert(Element),
    Delete {
        element_id: String,
        deleted_children: Vec<String>,
    },
    Move {
        element_id: String,
        new_parent_id: Option<String>,
        new_order: i64,
    },
}

/// Operation on the flat page list
#[derive(Debug, Clone, PartialEq)]
pub enum PageOperation {
    Upsert(Page),
    Delete { page_id: String },
}

/// Owns the element/page replica inside a Y.Doc
pub struct DocumentSyncer {
    doc: Doc,
    elements: TextRef,
    pages: TextRef,
    // yrs panics on overlapping transactions; every read and write holds this
    lock: Mutex<()>,
    changes: broadcast::Sender<ReplicaChange>,
}

impl DocumentSyncer {
    pub fn new(doc: Doc) -> Self {
        let (changes, _) = broadcast::channel(256);
        let elements = doc.get_or_insert_text(ELEMENTS_KEY);
        let pages = doc.get_or_insert_text(PAGES_KEY);
        Self {
            doc,
            elements,
            pages,
            lock: Mutex::new(()),
            changes,
        }
    }

    /// The underlying Y.Doc
    pub fn doc(&self) -> &Doc {
        &self.doc
    }

    /// Subscribe to committed replica changes
    pub fn subscribe(&self) -> broadcast::Receiver<ReplicaChange> {
        self.changes.subscribe()
    }

    /// Current element tree; an unreadable replica reads as empty
    pub fn elements(&self) -> Vec<Element> {
        parse_or_empty(&self.read_or_empty(ELEMENTS_KEY), ELEMENTS_KEY)
    }

    /// Current page list; an unreadable replica reads as empty
    pub fn pages(&self) -> Vec<Page> {
        parse_or_empty(&self.read_or_empty(PAGES_KEY), PAGES_KEY)
    }

    pub fn find_element(&self, id: &str) -> Option<Element> {
        element::find_element(&self.elements(), id).cloned()
    }

    /// Replace the whole element tree with a server baseline
    pub fn apply_initial_sync(&self, elements: &[Element]) -> Result<bool> {
        let next = serde_json::to_string(elements)?;
        self.rewrite(ELEMENTS_KEY, ReplicaOrigin::Sync, |_| Ok(Some(next)))
    }

    /// Replace the whole page list with a server baseline
    pub fn apply_pages_sync(&self, pages: &[Page]) -> Result<bool> {
        let next = serde_json::to_string(pages)?;
        self.rewrite(PAGES_KEY, ReplicaOrigin::Sync, |_| Ok(Some(next)))
    }

    /// Apply one structural operation. Returns whether the replica changed.
    pub fn handle_element_operation(&self, op: ElementOperation) -> Result<bool> {
        debug!(op = ?op_name(&op), "Applying element operation");

        self.rewrite(ELEMENTS_KEY, ReplicaOrigin::RemoteUpdate, |current| {
            let tree: Vec<Element> = parse_or_empty(current, ELEMENTS_KEY);
            let next = match op {
                ElementOperation::Upsert(element) => element::upsert_element(&tree, element),
                ElementOperation::Delete {
                    element_id,
                    deleted_children,
                } => element::delete_elements(&tree, &element_id, &deleted_children),
                ElementOperation::Move {
                    element_id,
                    new_parent_id,
                    new_order,
                } => element::move_element(&tree, &element_id, new_parent_id.as_deref(), new_order),
            };
            if next == tree {
                return Ok(None);
            }
            Ok(Some(serde_json::to_string(&next)?))
        })
    }

    /// Apply one page operation. Returns whether the replica changed.
    pub fn handle_page_operation(&self, op: PageOperation) -> Result<bool> {
        self.rewrite(PAGES_KEY, ReplicaOrigin::RemoteUpdate, |current| {
            let pages: Vec<Page> = parse_or_empty(current, PAGES_KEY);
            let next = match op {
                PageOperation::Upsert(page) => element::upsert_page(&pages, page),
                PageOperation::Delete { page_id } => element::remove_page(&pages, &page_id),
            };
            if next == pages {
                return Ok(None);
            }
            Ok(Some(serde_json::to_string(&next)?))
        })
    }

    fn text(&self, key: &str) -> &TextRef {
        if key == PAGES_KEY {
            &self.pages
        } else {
            &self.elements
        }
    }

    fn read(&self, key: &str) -> Result<String> {
        let _guard = self.lock.lock();
        let text = self.text(key);
        let txn = self
            .doc
            .try_transact()
            .map_err(|e| Error::Crdt(e.to_string()))?;
        Ok(text.get_string(&txn))
    }

    fn read_or_empty(&self, key: &str) -> String {
        self.read(key).unwrap_or_else(|e| {
            warn!(container = key, error = %e, "Replica busy, reading as empty");
            String::new()
        })
    }

    /// Read, compute and write back inside a single origin-tagged transaction.
    /// `mutate` returns `None` when there is nothing to write.
    fn rewrite<F>(&self, key: &str, origin: ReplicaOrigin, mutate: F) -> Result<bool>
    where
        F: FnOnce(&str) -> Result<Option<String>>,
    {
        let _guard = self.lock.lock();
        let text = self.text(key);
        let changed = {
            let mut txn = self
                .doc
                .try_transact_mut_with(origin.as_str())
                .map_err(|e| Error::Crdt(e.to_string()))?;
            let current = text.get_string(&txn);
            match mutate(&current)? {
                Some(next) if next != current => {
                    let len = text.len(&txn);
                    text.remove_range(&mut txn, 0, len);
                    text.insert(&mut txn, 0, &next);
                    true
                }
                _ => false,
            }
        };

        if changed {
            let slice = if key == PAGES_KEY {
                ReplicaSlice::Pages
            } else {
                ReplicaSlice::Elements
            };
            let _ = self.changes.send(ReplicaChange { slice, origin });
        }
        Ok(changed)
    }
}

impl std::fmt::Debug for DocumentSyncer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentSyncer")
            .field("client_id", &self.doc.client_id())
            .finish()
    }
}

fn parse_or_empty<T: serde::de::DeserializeOwned>(json: &str, key: &str) -> Vec<T> {
    if json.trim().is_empty() {
        return Vec::new();
    }
    match serde_json::from_str(json) {
        Ok(items) => items,
        Err(e) => {
            warn!(container = key, error = %e, "Replica JSON unreadable, treating as empty");
            Vec::new()
        }
    }
}

fn op_name(op: &ElementOperation) -> &'static str {
    match op {
        ElementOperation::Upsert(_) => "upsert",
        ElementOperation::Delete { .. } => "delete",
        ElementOperation::Move { .. } => "move",
    }
}
