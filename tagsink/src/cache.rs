//! Draft EPC cache: the set of EPCs currently pending submission.
//!
//! Membership is by normalized EPC only; callers normalize before touching
//! the store.

use parking_lot::RwLock;
use std::collections::HashSet;

#[derive(Default)]
pub struct Store {
    epcs: RwLock<HashSet<String>>,
}

impl Store {
    pub fn new() -> Self {
        Store::default()
    }

    /// Atomically rebuilds the set; duplicates collapse, empties are dropped.
    pub fn replace(&self, epcs: &[String]) {
        let next: HashSet<String> = epcs.iter().filter(|e| !e.is_empty()).cloned().collect();
        *self.epcs.write() = next;
    }

    /// Inserts missing entries, returning how many were genuinely new.
    pub fn add(&self, epcs: &[String]) -> usize {
        let mut set = self.epcs.write();
        let mut added = 0;
        for epc in epcs {
            if epc.is_empty() {
                continue;
            }
            if set.insert(epc.clone()) {
                added += 1;
            }
        }
        added
    }

    pub fn remove(&self, epc: &str) {
        if epc.is_empty() {
            return;
        }
        self.epcs.write().remove(epc);
    }

    pub fn has(&self, epc: &str) -> bool {
        if epc.is_empty() {
            return false;
        }
        self.epcs.read().contains(epc)
    }

    pub fn len(&self) -> usize {
        self.epcs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.epcs.read().is_empty()
    }

    pub fn snapshot_sorted(&self) -> Vec<String> {
        let mut out: Vec<String> = self.epcs.read().iter().cloned().collect();
        out.sort();
        out
    }
}
