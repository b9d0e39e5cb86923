use std::collections::{HashSet, VecDeque};

use parking_lot::Mutex;
use sha2::{Digest, Sha256};

/// How many distinct findings the run-wide cache remembers. A duplicate that
/// arrives after its key was evicted is reported again; that trade keeps the
/// cache O(1) in memory on unbounded scans.
pub const DEDUP_CAPACITY: usize = 500;

/// `(rule name, sha256(matched text))`.
pub type DedupKey = (String, [u8; 32]);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    Accepted,
    Suppressed,
}

/// Cross-worker suppression of repeated hits within one scan run.
///
/// Mutex-guarded bounded LRU; the critical section is O(1) per submit.
#[derive(Debug, Default)]
pub struct FindingDeduper {
    inner: Mutex<DedupInner>,
}

#[derive(Debug, Default)]
struct DedupInner {
    seen: HashSet<DedupKey>,
    order: VecDeque<DedupKey>,
}

impl FindingDeduper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn key(rule_name: &str, matched_text: &str) -> DedupKey {
        let digest = Sha256::digest(matched_text.as_bytes());
        (rule_name.to_owned(), digest.into())
    }

    pub fn submit(&self, rule_name: &str, matched_text: &str) -> Submission {
        let key = Self::key(rule_name, matched_text);
        let mut inner = self.inner.lock();
        if inner.seen.contains(&key) {
            return Submission::Suppressed;
        }
        inner.seen.insert(key.clone());
        inner.order.push_back(key);
        if inner.order.len() > DEDUP_CAPACITY {
            if let Some(oldest) = inner.order.pop_front() {
                inner.seen.remove(&oldest);
            }
        }
        Submission::Accepted
    }

    pub fn len(&self) -> usize {
        self.inner.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_is_suppressed() {
        let deduper = FindingDeduper::new();
        assert_eq!(deduper.submit("aws-access-key", "AKIAXXX"), Submission::Accepted);
        assert_eq!(deduper.submit("aws-access-key", "AKIAXXX"), Submission::Suppressed);
    }

    #[test]
    fn same_text_different_rule_is_distinct() {
        let deduper = FindingDeduper::new();
        assert_eq!(deduper.submit("rule-a", "secret"), Submission::Accepted);
        assert_eq!(deduper.submit("rule-b", "secret"), Submission::Accepted);
    }

    #[test]
    fn eviction_readmits_old_keys() {
        let deduper = FindingDeduper::new();
        assert_eq!(deduper.submit("generic", "secret-0"), Submission::Accepted);
        // Push the first key out of the window.
        for i in 1..=DEDUP_CAPACITY {
            assert_eq!(deduper.submit("generic", &format!("secret-{i}")), Submission::Accepted);
        }
        assert_eq!(deduper.len(), DEDUP_CAPACITY);
        assert_eq!(deduper.submit("generic", "secret-0"), Submission::Accepted);
    }

    #[test]
    fn capacity_is_bounded() {
        let deduper = FindingDeduper::new();
        for i in 0..(DEDUP_CAPACITY * 3) {
            deduper.submit("generic", &format!("secret-{i}"));
        }
        assert_eq!(deduper.len(), DEDUP_CAPACITY);
    }
}
