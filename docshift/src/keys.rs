/// Key-construction helpers for the Redis store.
///
/// Documents live under `{prefix}:doc:`, so no collection name can reach the
/// `idx` or `lock` keys.
#[derive(Debug, Clone)]
pub struct KeyContext<'a> {
    pub prefix: &'a str,
}

/// Characters a collection name may not contain: the key separator and the
/// `SCAN MATCH` glob syntax.
const RESERVED_CHARS: &[char] = &[':', '*', '?', '[', ']', '\\'];

/// Whether `collection` can be used as a key segment without matching keys
/// of another collection.
pub fn is_valid_collection(collection: &str) -> bool {
    !collection.trim().is_empty() && !collection.contains(RESERVED_CHARS)
}

impl<'a> KeyContext<'a> {
    pub fn new(prefix: &'a str) -> Self {
        Self { prefix }
    }

    pub fn document(&self, collection: &str, document_id: &str) -> String {
        format!("{}:doc:{}:{}", self.prefix, collection, document_id)
    }

    /// Prefix shared by every document of a collection (trailing colon included).
    pub fn collection_prefix(&self, collection: &str) -> String {
        format!("{}:doc:{}:", self.prefix, collection)
    }

    pub fn collection_pattern(&self, collection: &str) -> String {
        format!("{}:doc:{}:*", self.prefix, collection)
    }

    pub fn index(&self, index_name: &str) -> String {
        format!("{}:idx:{}", self.prefix, index_name)
    }

    pub fn lock(&self, name: &str) -> String {
        format!("{}:lock:{}", self.prefix, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_document_keys() {
        let ctx = KeyContext::new("docshift");
        assert_eq!(ctx.document("users", "abc"), "docshift:doc:users:abc");
        assert_eq!(ctx.collection_pattern("users"), "docshift:doc:users:*");
        assert_eq!(ctx.collection_prefix("users"), "docshift:doc:users:");
    }

    #[test]
    fn collections_named_lock_or_idx_stay_in_the_doc_namespace() {
        let ctx = KeyContext::new("docshift");
        let lock = ctx.lock("_docshift_lock:dev");
        assert_eq!(lock, "docshift:lock:_docshift_lock:dev");
        assert!(!lock.starts_with(&ctx.collection_prefix("lock")));
        assert!(!ctx.index("users_email").starts_with(&ctx.collection_prefix("idx")));
    }

    #[test]
    fn separators_and_globs_are_not_collection_names() {
        assert!(is_valid_collection("users"));
        assert!(is_valid_collection("_docshift_ledger"));
        assert!(is_valid_collection("lock"));
        for name in ["users:archive", "user*", "user?", "users[0]", "a\\b", " "] {
            assert!(!is_valid_collection(name), "{name}");
        }
    }
}
