//! Reference table: live values that keep their identity across round trips.
//!
//! Only the owning context mutates its table, so a plain map suffices.

use std::collections::HashMap;

use tether_types::HandleId;

pub struct RefTable<T> {
    next: u64,
    entries: HashMap<HandleId, T>,
}

impl<T> Default for RefTable<T> {
    fn default() -> Self {
        Self {
            next: 1,
            entries: HashMap::new(),
        }
    }
}

impl<T: Clone> RefTable<T> {
    /// Store a value and return its handle. Handles are never reused.
    pub fn insert(&mut self, value: T) -> HandleId {
        let id = HandleId(self.next);
        self.next += 1;
        self.entries.insert(id, value);
        id
    }

    pub fn get(&self, id: HandleId) -> Option<T> {
        self.entries.get(&id).cloned()
    }

    pub fn remove(&mut self, id: HandleId) -> Option<T> {
        self.entries.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handles_not_reused() {
        let mut table = RefTable::default();
        let a = table.insert("a");
        assert_eq!(table.remove(a), Some("a"));
        let b = table.insert("b");
        assert_ne!(a, b);
        assert_eq!(table.get(a), None);
        assert_eq!(table.get(b), Some("b"));
        assert_eq!(table.len(), 1);
    }
}
