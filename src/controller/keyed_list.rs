//! Insertion-ordered lists keyed by resource kind

use ahash::AHashMap;

/// Map from a kind key to an insertion-ordered list of items.
///
/// Lists keep their relative order under mixed insert/remove: removal shifts
/// later items left, so positional indices stay meaningful between
/// mutations. Expected list lengths are small (tens), which keeps the linear
/// scans cheap. The container does no locking of its own; callers guard it.
pub struct KeyedList<T> {
    items: AHashMap<String, Vec<T>>,
}

impl<T> Default for KeyedList<T> {
    fn default() -> Self {
        Self {
            items: AHashMap::new(),
        }
    }
}

impl<T: Clone> KeyedList<T> {
    /// Append `item` to the list under `key`. Items are not deduplicated;
    /// inserting the same item twice yields two entries.
    pub fn insert(&mut self, key: &str, item: T) {
        self.items.entry(key.to_owned()).or_default().push(item);
    }

    /// Remove the first item under `key` matching `pred`, preserving the
    /// order of the remaining items. Absent keys and unmatched predicates
    /// are no-ops.
    pub fn remove_where(&mut self, key: &str, pred: impl Fn(&T) -> bool) {
        if let Some(list) = self.items.get_mut(key) {
            if let Some(index) = list.iter().position(pred) {
                list.remove(index);
            }
        }
    }

    /// Drop `key` and everything under it.
    pub fn remove_all(&mut self, key: &str) {
        self.items.remove(key);
    }

    /// Number of distinct keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Number of items under `key`.
    #[must_use]
    pub fn key_len(&self, key: &str) -> usize {
        self.items.get(key).map_or(0, Vec::len)
    }

    /// Item at `index` under `key`, if both exist.
    #[must_use]
    pub fn item_at(&self, key: &str, index: usize) -> Option<T> {
        self.items.get(key).and_then(|list| list.get(index)).cloned()
    }

    /// Copy of the list under `key`, in insertion order. The copy is immune
    /// to later mutations, which is what dispatch relies on.
    #[must_use]
    pub fn snapshot(&self, key: &str) -> Vec<T> {
        self.items.get(key).cloned().unwrap_or_default()
    }

    /// All (key, item) pairs; items within one key come out in insertion
    /// order, key order is unspecified.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &T)> + '_ {
        self.items
            .iter()
            .flat_map(|(key, list)| list.iter().map(move |item| (key.as_str(), item)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_preserves_order_per_key() {
        let mut list = KeyedList::default();
        list.insert("foo", 1);
        list.insert("foo", 2);
        list.insert("bar", 3);
        list.insert("foo", 4);

        assert_eq!(list.len(), 2);
        assert_eq!(list.key_len("foo"), 3);
        assert_eq!(list.key_len("bar"), 1);
        assert_eq!(list.item_at("foo", 0), Some(1));
        assert_eq!(list.item_at("foo", 1), Some(2));
        assert_eq!(list.item_at("foo", 2), Some(4));
        assert_eq!(list.item_at("foo", 3), None);
        assert_eq!(list.item_at("missing", 0), None);
    }

    #[test]
    fn duplicate_items_each_get_their_own_slot() {
        let mut list = KeyedList::default();
        list.insert("foo", 7);
        list.insert("foo", 7);
        assert_eq!(list.key_len("foo"), 2);
    }

    #[test]
    fn removal_shifts_later_items_left() {
        let mut list = KeyedList::default();
        for item in [1, 2, 3, 4] {
            list.insert("foo", item);
        }

        // Middle, front, then back, checking order after each.
        list.remove_where("foo", |item| *item == 3);
        assert_eq!(list.key_len("foo"), 3);
        assert_eq!(list.item_at("foo", 0), Some(1));
        assert_eq!(list.item_at("foo", 1), Some(2));
        assert_eq!(list.item_at("foo", 2), Some(4));

        list.remove_where("foo", |item| *item == 1);
        assert_eq!(list.key_len("foo"), 2);
        assert_eq!(list.item_at("foo", 0), Some(2));
        assert_eq!(list.item_at("foo", 1), Some(4));

        list.remove_where("foo", |item| *item == 4);
        assert_eq!(list.key_len("foo"), 1);
        assert_eq!(list.item_at("foo", 0), Some(2));
    }

    #[test]
    fn removing_absent_items_changes_nothing() {
        let mut list = KeyedList::default();
        list.insert("foo", 1);
        list.remove_where("foo", |item| *item == 9);
        list.remove_where("missing", |_| true);
        assert_eq!(list.key_len("foo"), 1);
    }

    #[test]
    fn remove_all_drops_the_key() {
        let mut list = KeyedList::default();
        list.insert("foo", 1);
        list.insert("foo", 2);
        list.insert("bar", 3);

        list.remove_all("foo");
        assert_eq!(list.len(), 1);
        assert_eq!(list.key_len("foo"), 0);
        assert_eq!(list.key_len("bar"), 1);

        list.remove_all("missing");
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn snapshot_is_detached_from_later_mutations() {
        let mut list = KeyedList::default();
        list.insert("foo", 1);
        list.insert("foo", 2);
        let snapshot = list.snapshot("foo");
        list.remove_all("foo");
        assert_eq!(snapshot, vec![1, 2]);
        assert!(list.snapshot("foo").is_empty());
    }
}
