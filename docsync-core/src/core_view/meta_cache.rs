//! Fixed-capacity LRU of document headers keyed by (documentId, branch)

use hashlink::LruCache;
use std::sync::Mutex;

use super::document_view::DocumentHeader;
use crate::lock;

pub struct DocumentMetaCache {
    entries: Mutex<LruCache<(String, String), DocumentHeader>>,
}

impl DocumentMetaCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(capacity.max(1))),
        }
    }

    /// Cached header; a hit becomes most recently used
    pub fn get(&self, document_id: &str, branch: &str) -> Option<DocumentHeader> {
        lock(&self.entries)
            .get(&(document_id.to_string(), branch.to_string()))
            .cloned()
    }

    pub fn put(&self, header: DocumentHeader) {
        let key = (header.id.clone(), header.branch.clone());
        lock(&self.entries).insert(key, header);
    }

    /// Drop every branch of a document
    pub fn invalidate(&self, document_id: &str) {
        let mut entries = lock(&self.entries);
        let stale: Vec<(String, String)> = entries
            .iter()
            .filter(|((doc, _), _)| doc == document_id)
            .map(|(key, _)| key.clone())
            .collect();

        for key in stale {
            entries.remove(&key);
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn header(id: &str, branch: &str) -> DocumentHeader {
        DocumentHeader {
            id: id.into(),
            document_type: "counter".into(),
            branch: branch.into(),
            created_at_utc_ms: 0,
            last_modified_at_utc_ms: 0,
            revision: BTreeMap::new(),
            deleted: false,
        }
    }

    #[test]
    fn test_evicts_least_recently_used() {
        let cache = DocumentMetaCache::new(2);
        cache.put(header("a", "main"));
        cache.put(header("b", "main"));

        // Touch "a" so "b" becomes the eviction candidate.
        assert!(cache.get("a", "main").is_some());
        cache.put(header("c", "main"));

        assert!(cache.get("a", "main").is_some());
        assert!(cache.get("b", "main").is_none());
        assert!(cache.get("c", "main").is_some());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_invalidate_all_branches() {
        let cache = DocumentMetaCache::new(8);
        cache.put(header("a", "main"));
        cache.put(header("a", "draft"));
        cache.put(header("b", "main"));

        cache.invalidate("a");
        assert!(cache.get("a", "main").is_none());
        assert!(cache.get("a", "draft").is_none());
        assert_eq!(cache.len(), 1);
    }
}
