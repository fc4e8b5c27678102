//! Blocked identifier table
//!
//! Every operation takes the lock for exactly one set operation. A `contains`
//! check in the bridge loop can therefore race with a concurrent `unblock`;
//! the frame is decided on whatever the table held at the instant of the check.

use std::collections::HashSet;

use parking_lot::Mutex;
use tracing::info;

use crate::can::CanId;

/// Set of arbitration identifiers excluded from bridging
#[derive(Debug, Default)]
pub struct FilterTable {
    blocked: Mutex<HashSet<CanId>>,
}

impl FilterTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block `id`. Returns `false` if it was already blocked.
    pub fn block(&self, id: CanId) -> bool {
        let inserted = self.blocked.lock().insert(id);
        if inserted {
            info!("Blocked CAN ID: {}", id);
        }
        inserted
    }

    /// Unblock `id`. Returns `false` if it was not blocked.
    pub fn unblock(&self, id: CanId) -> bool {
        let removed = self.blocked.lock().remove(&id);
        if removed {
            info!("Unblocked CAN ID: {}", id);
        } else {
            info!("CAN ID {} was not blocked", id);
        }
        removed
    }

    pub fn contains(&self, id: CanId) -> bool {
        self.blocked.lock().contains(&id)
    }

    /// Block each id in turn; returns how many were newly blocked
    pub fn block_all<I: IntoIterator<Item = CanId>>(&self, ids: I) -> usize {
        ids.into_iter().filter(|id| self.block(*id)).count()
    }

    /// Blocked identifiers in ascending order
    pub fn snapshot(&self) -> Vec<CanId> {
        let mut ids: Vec<CanId> = self.blocked.lock().iter().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.blocked.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocked.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn id(raw: u16) -> CanId {
        CanId::new(raw).unwrap()
    }

    #[test]
    fn test_block_is_idempotent() {
        let table = FilterTable::new();
        assert!(table.block(id(0x123)));
        assert!(!table.block(id(0x123)));

        assert_eq!(table.len(), 1);
        assert_eq!(table.snapshot(), vec![id(0x123)]);
    }

    #[test]
    fn test_unblock_absent_id_leaves_table_unchanged() {
        let table = FilterTable::new();
        table.block_all([id(0x10), id(0x20)]);

        assert!(!table.unblock(id(0x30)));
        assert_eq!(table.snapshot(), vec![id(0x10), id(0x20)]);

        assert!(table.unblock(id(0x10)));
        assert!(!table.contains(id(0x10)));
        assert!(table.contains(id(0x20)));
    }

    #[test]
    fn test_block_all_counts_new_entries() {
        let table = FilterTable::new();
        assert_eq!(table.block_all([id(1), id(2), id(2), id(3)]), 3);
        assert_eq!(table.block_all([id(3), id(9)]), 1);
        assert_eq!(table.snapshot(), vec![id(1), id(2), id(3), id(9)]);
    }

    #[test]
    fn test_snapshot_is_sorted() {
        let table = FilterTable::new();
        table.block_all([id(0x7FF), id(0x001), id(0x1A0)]);
        assert_eq!(table.snapshot(), vec![id(0x001), id(0x1A0), id(0x7FF)]);
    }

    #[test]
    fn test_concurrent_block_unblock_contains() {
        let table = Arc::new(FilterTable::new());
        let mut handles = Vec::new();

        for t in 0..4u16 {
            let table = Arc::clone(&table);
            handles.push(std::thread::spawn(move || {
                for i in 0..200u16 {
                    let target = id((t * 200 + i) % 0x800);
                    table.block(target);
                    assert!(table.contains(target));
                    if i % 2 == 0 {
                        table.unblock(target);
                    }
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        // 4 threads x 200 ids, odd iterations stay blocked
        assert_eq!(table.len(), 400);
    }
}
