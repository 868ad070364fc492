//! Creation-time ordering of worlds used for pagination.

use std::cmp::Ordering;
use std::collections::HashMap;

use parking_lot::RwLock;

/// World ids ordered by directory creation time, newest first.
#[derive(Debug, Default)]
pub struct SortedIndex {
    ordered: RwLock<Vec<String>>,
}

impl SortedIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from `world_ids`; returns whether the stored ordering changed.
    /// Ties are broken by id so the order is stable across rebuilds.
    pub fn update<'a, I>(&self, world_ids: I, ctimes: &HashMap<String, f64>) -> bool
    where
        I: IntoIterator<Item = &'a String>,
    {
        let mut ordered: Vec<String> = world_ids.into_iter().cloned().collect();
        ordered.sort_by(|a, b| {
            let ca = ctimes.get(a).copied().unwrap_or(0.0);
            let cb = ctimes.get(b).copied().unwrap_or(0.0);
            cb.partial_cmp(&ca).unwrap_or(Ordering::Equal).then_with(|| a.cmp(b))
        });
        ordered.dedup();

        if *self.ordered.read() == ordered {
            return false;
        }
        *self.ordered.write() = ordered;
        true
    }

    /// One page of ids. Negative indices clamp to 0, pages past the end are empty.
    pub fn page(&self, page_index: i64, page_size: usize) -> Vec<String> {
        let page_index = page_index.max(0) as usize;
        let ordered = self.ordered.read();
        let start = page_index.saturating_mul(page_size);
        if start >= ordered.len() {
            return Vec::new();
        }
        let end = start.saturating_add(page_size).min(ordered.len());
        ordered[start..end].to_vec()
    }

    pub fn all(&self) -> Vec<String> {
        self.ordered.read().clone()
    }

    pub fn len(&self) -> usize {
        self.ordered.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn worlds(count: usize) -> (Vec<String>, HashMap<String, f64>) {
        let ids: Vec<String> = (0..count).map(|i| format!("wrld_{:02}", i)).collect();
        let ctimes = ids
            .iter()
            .enumerate()
            .map(|(i, id)| (id.clone(), 1_000.0 + i as f64))
            .collect();
        (ids, ctimes)
    }

    #[test]
    fn pages_newest_first() {
        let (ids, ctimes) = worlds(25);
        let index = SortedIndex::new();
        index.update(&ids, &ctimes);

        let first = index.page(0, 10);
        let expected: Vec<String> = (15..25).rev().map(|i| format!("wrld_{:02}", i)).collect();
        assert_eq!(first, expected);

        let last = index.page(2, 10);
        let expected: Vec<String> = (0..5).rev().map(|i| format!("wrld_{:02}", i)).collect();
        assert_eq!(last, expected);

        assert!(index.page(3, 10).is_empty());
    }

    #[test]
    fn negative_page_clamps_to_first() {
        let (ids, ctimes) = worlds(3);
        let index = SortedIndex::new();
        index.update(&ids, &ctimes);
        assert_eq!(index.page(-4, 2), index.page(0, 2));
    }

    #[test]
    fn update_reports_changes_only() {
        let (ids, ctimes) = worlds(4);
        let index = SortedIndex::new();
        assert!(index.update(&ids, &ctimes));
        assert!(!index.update(&ids, &ctimes));
        assert!(index.update(&ids[..3], &ctimes));
        assert_eq!(index.len(), 3);
    }

    #[test]
    fn equal_ctimes_order_by_id() {
        let ids = vec!["b".to_string(), "a".to_string()];
        let ctimes = HashMap::new();
        let index = SortedIndex::new();
        index.update(&ids, &ctimes);
        assert_eq!(index.all(), vec!["a", "b"]);
    }
}
