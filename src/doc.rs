// src/doc.rs
//
// Object identity for control-side document types (Pattern, Track, Song,
// Scene, Instrument). The original C engine gave every document a base
// struct embedded by value and linked it into a process-wide list so any
// object could be looked up by name from anywhere. That pattern doesn't
// translate: here each document owns a `DocId` and the `DocumentRegistry`
// holds weak, non-owning references, consulted only from the control
// thread. The RT thread never touches it.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocId(Uuid);

impl DocId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for DocId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for DocId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub struct Document {
    pub id: DocId,
    pub name: String,
}

impl Document {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: DocId::new(),
            name: name.into(),
        }
    }
}

/// Non-owning name/id lookup table, consulted by control-side commands
/// (e.g. resolving a track's "external output" target by name). Holding
/// only `Weak` references means a dropped document disappears from here
/// without any explicit unregistration step.
#[derive(Default)]
pub struct DocumentRegistry<T> {
    by_id: HashMap<DocId, Weak<T>>,
}

impl<T> DocumentRegistry<T> {
    pub fn new() -> Self {
        Self {
            by_id: HashMap::new(),
        }
    }

    pub fn register(&mut self, id: DocId, doc: &Arc<T>) {
        self.by_id.insert(id, Arc::downgrade(doc));
    }

    pub fn lookup(&self, id: DocId) -> Option<Arc<T>> {
        self.by_id.get(&id).and_then(Weak::upgrade)
    }

    /// Drops entries whose document has been freed. Call periodically from
    /// the control thread; never from RT.
    pub fn reap(&mut self) {
        self.by_id.retain(|_, weak| weak.strong_count() > 0);
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_reaps_dropped_documents() {
        let mut registry: DocumentRegistry<Document> = DocumentRegistry::new();
        let doc = Arc::new(Document::new("pattern-a"));
        registry.register(doc.id, &doc);
        assert_eq!(registry.len(), 1);
        assert!(registry.lookup(doc.id).is_some());

        drop(doc);
        registry.reap();
        assert!(registry.is_empty());
    }

    #[test]
    fn doc_ids_are_unique() {
        assert_ne!(DocId::new(), DocId::new());
    }
}
