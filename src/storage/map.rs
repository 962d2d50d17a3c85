use std::collections::BTreeMap;

use super::types::utf16_bytes;

/// Ordered key/value table backing one or more storage areas.
///
/// Areas hold maps behind an `Arc`. A map referenced by more than one area is
/// never written in place; the writing area clones it first (see
/// [`StorageArea`](super::StorageArea)).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StorageMap {
    values: BTreeMap<String, String>,
    bytes_used: usize,
}

/// Outcome of [`StorageMap::set_item`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SetOutcome {
    pub changed: bool,
    pub old_value: Option<String>,
}

impl StorageMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Keys and values, counted as UTF-16 bytes.
    pub fn bytes_used(&self) -> usize {
        self.bytes_used
    }

    pub fn get_item(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Key at `index` in key order.
    pub fn key(&self, index: usize) -> Option<&str> {
        self.values.keys().nth(index).map(String::as_str)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Size of the map after storing `value` under `key`.
    pub fn bytes_after_set(&self, key: &str, value: &str) -> usize {
        match self.values.get(key) {
            Some(old) => self.bytes_used - utf16_bytes(old) + utf16_bytes(value),
            None => self.bytes_used + utf16_bytes(key) + utf16_bytes(value),
        }
    }

    pub fn set_item(&mut self, key: &str, value: &str) -> SetOutcome {
        if self.values.get(key).is_some_and(|old| old == value) {
            return SetOutcome { changed: false, old_value: Some(value.to_string()) };
        }

        self.bytes_used = self.bytes_after_set(key, value);
        let old_value = self.values.insert(key.to_string(), value.to_string());
        SetOutcome { changed: true, old_value }
    }

    pub fn remove_item(&mut self, key: &str) -> Option<String> {
        let old = self.values.remove(key)?;
        self.bytes_used -= utf16_bytes(key) + utf16_bytes(&old);
        Some(old)
    }

    pub fn clear(&mut self) {
        self.values.clear();
        self.bytes_used = 0;
    }

    pub fn to_btree(&self) -> BTreeMap<String, String> {
        self.values.clone()
    }
}

impl From<BTreeMap<String, String>> for StorageMap {
    fn from(values: BTreeMap<String, String>) -> Self {
        let bytes_used = values.iter().map(|(k, v)| utf16_bytes(k) + utf16_bytes(v)).sum();
        Self { values, bytes_used }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_reports_change_and_old_value() {
        let mut map = StorageMap::new();

        let first = map.set_item("k", "v1");
        assert!(first.changed);
        assert_eq!(first.old_value, None);

        let second = map.set_item("k", "v2");
        assert!(second.changed);
        assert_eq!(second.old_value.as_deref(), Some("v1"));

        let same = map.set_item("k", "v2");
        assert!(!same.changed);
        assert_eq!(map.get_item("k"), Some("v2"));
    }

    #[test]
    fn byte_accounting_follows_mutations() {
        let mut map = StorageMap::new();
        map.set_item("ab", "cde");
        assert_eq!(map.bytes_used(), 10);
        assert_eq!(map.bytes_after_set("ab", "c"), 6);

        map.set_item("ab", "c");
        assert_eq!(map.bytes_used(), 6);

        assert_eq!(map.remove_item("ab").as_deref(), Some("c"));
        assert_eq!(map.bytes_used(), 0);
        assert_eq!(map.remove_item("ab"), None);
    }

    #[test]
    fn keys_are_ordered() {
        let mut map = StorageMap::new();
        map.set_item("b", "2");
        map.set_item("a", "1");
        map.set_item("c", "3");

        assert_eq!(map.keys().collect::<Vec<_>>(), vec!["a", "b", "c"]);
        assert_eq!(map.key(1), Some("b"));
        assert_eq!(map.key(3), None);
    }

    #[test]
    fn clone_is_independent() {
        let mut a = StorageMap::new();
        a.set_item("k", "v");
        let mut b = a.clone();
        b.set_item("k", "other");
        b.clear();

        assert_eq!(a.get_item("k"), Some("v"));
        assert!(b.is_empty());
        assert_eq!(b.bytes_used(), 0);
    }

    #[test]
    fn from_btree_counts_bytes() {
        let mut values = BTreeMap::new();
        values.insert("x".to_string(), "yy".to_string());
        let map = StorageMap::from(values.clone());
        assert_eq!(map.bytes_used(), 6);
        assert_eq!(map.to_btree(), values);
    }
}
