//! Compact per-client deleted-interval sets.

use std::collections::HashMap;

use crate::id::Id;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeleteRange {
    pub clock: u32,
    pub len: u32,
}

impl DeleteRange {
    pub fn end(&self) -> u32 {
        self.clock + self.len
    }
}

/// `client → sorted, non-overlapping (clock, len) intervals` known to
/// be deleted. Ranges are appended unordered during a transaction and
/// normalized once on close.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteSet {
    pub(crate) clients: HashMap<u32, Vec<DeleteRange>>,
}

impl DeleteSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn add(&mut self, client: u32, clock: u32, len: u32) {
        self.clients
            .entry(client)
            .or_default()
            .push(DeleteRange { clock, len });
    }

    pub fn ranges(&self, client: u32) -> &[DeleteRange] {
        self.clients.get(&client).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &[DeleteRange])> + '_ {
        self.clients.iter().map(|(c, r)| (*c, r.as_slice()))
    }

    /// Sorts each client's ranges and coalesces adjacent or
    /// overlapping ones.
    pub fn sort_and_merge(&mut self) {
        self.clients.retain(|_, ranges| {
            ranges.sort_unstable_by_key(|r| r.clock);
            let mut merged: Vec<DeleteRange> = Vec::with_capacity(ranges.len());
            for range in ranges.iter().copied() {
                match merged.last_mut() {
                    Some(last) if range.clock <= last.end() => {
                        let end = last.end().max(range.end());
                        last.len = end - last.clock;
                    }
                    _ => merged.push(range),
                }
            }
            *ranges = merged;
            !ranges.is_empty()
        });
    }

    /// Whether the unit identified by `id` falls in a deleted range.
    /// Only meaningful on a normalized set.
    pub fn is_deleted(&self, id: Id) -> bool {
        self.find_range(id).is_some()
    }

    fn find_range(&self, id: Id) -> Option<DeleteRange> {
        let ranges = self.clients.get(&id.client)?;
        let mut left = 0usize;
        let mut right = ranges.len();
        while left < right {
            let mid = (left + right) / 2;
            let range = ranges[mid];
            if id.clock < range.clock {
                right = mid;
            } else if id.clock < range.end() {
                return Some(range);
            } else {
                left = mid + 1;
            }
        }
        None
    }

    /// Folds `other` into `self`. The result needs `sort_and_merge`
    /// before range queries.
    pub fn merge(&mut self, other: DeleteSet) {
        for (client, ranges) in other.clients {
            self.clients.entry(client).or_default().extend(ranges);
        }
    }

    /// Clients in descending order, the iteration order of the codec.
    pub(crate) fn clients_descending(&self) -> Vec<u32> {
        let mut clients: Vec<u32> = self.clients.keys().copied().collect();
        clients.sort_unstable_by(|a, b| b.cmp(a));
        clients
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sort_and_merge_coalesces_adjacent_ranges() {
        let mut ds = DeleteSet::new();
        ds.add(1, 10, 5);
        ds.add(1, 0, 4);
        ds.add(1, 4, 6);
        ds.sort_and_merge();
        assert_eq!(
            ds.ranges(1),
            &[DeleteRange { clock: 0, len: 15 }]
        );
    }

    #[test]
    fn sort_and_merge_keeps_gaps() {
        let mut ds = DeleteSet::new();
        ds.add(1, 0, 2);
        ds.add(1, 5, 2);
        ds.sort_and_merge();
        assert_eq!(ds.ranges(1).len(), 2);
    }

    #[test]
    fn is_deleted_checks_bounds() {
        let mut ds = DeleteSet::new();
        ds.add(7, 3, 4);
        ds.sort_and_merge();
        assert!(!ds.is_deleted(Id::new(7, 2)));
        assert!(ds.is_deleted(Id::new(7, 3)));
        assert!(ds.is_deleted(Id::new(7, 6)));
        assert!(!ds.is_deleted(Id::new(7, 7)));
        assert!(!ds.is_deleted(Id::new(8, 3)));
    }

    #[test]
    fn merge_then_normalize() {
        let mut a = DeleteSet::new();
        a.add(1, 0, 3);
        let mut b = DeleteSet::new();
        b.add(1, 3, 3);
        b.add(2, 0, 1);
        a.merge(b);
        a.sort_and_merge();
        assert_eq!(a.ranges(1), &[DeleteRange { clock: 0, len: 6 }]);
        assert_eq!(a.ranges(2), &[DeleteRange { clock: 0, len: 1 }]);
    }
}
