use parking_lot::Mutex;
use primitive_types::U256;

use crate::crypto::Hash;

/// The best chain tip any peer has told us about.
///
/// `number` and `hash` always come from the same peer report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkBest {
    pub number: u64,
    pub hash: Hash,
    pub total_difficulty: U256,
}

impl Default for NetworkBest {
    fn default() -> Self {
        Self {
            number: 0,
            hash: Hash::ZERO,
            total_difficulty: U256::zero(),
        }
    }
}

/// Result of offering a peer's status to the tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    pub updated: bool,
    /// The record after the report was applied.
    pub best: NetworkBest,
}

#[derive(Debug, Default)]
pub struct NetworkBestTracker {
    best: Mutex<NetworkBest>,
}

impl NetworkBestTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the record if the report is both higher and heavier. Compare and replace happen under one lock.
    pub fn observe(&self, number: u64, hash: Hash, total_difficulty: U256) -> Observation {
        let mut best = self.best.lock();
        let updated = number > best.number && total_difficulty > best.total_difficulty;
        if updated {
            *best = NetworkBest {
                number,
                hash,
                total_difficulty,
            };
        }
        Observation {
            updated,
            best: best.clone(),
        }
    }

    pub fn snapshot(&self) -> NetworkBest {
        self.best.lock().clone()
    }

    pub fn number(&self) -> u64 {
        self.best.lock().number
    }

    pub fn total_difficulty(&self) -> U256 {
        self.best.lock().total_difficulty
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread};

    use primitive_types::U256;

    use super::NetworkBestTracker;
    use crate::crypto::Hash;

    fn hash_of(number: u64) -> Hash {
        Hash::compute([number.to_be_bytes()])
    }

    #[test]
    fn requires_higher_number_and_difficulty() {
        let tracker = NetworkBestTracker::new();

        let first = tracker.observe(100, hash_of(100), U256::from(50));
        assert!(first.updated);
        assert_eq!(first.best.number, 100);
        assert_eq!(first.best.hash, hash_of(100));

        // Higher, but lighter.
        let lighter = tracker.observe(200, hash_of(200), U256::from(40));
        assert!(!lighter.updated);
        assert_eq!(lighter.best.number, 100);

        // Heavier, but lower.
        assert!(!tracker.observe(90, hash_of(90), U256::from(60)).updated);
        // Equal difficulty does not count as heavier.
        assert!(!tracker.observe(101, hash_of(101), U256::from(50)).updated);

        assert!(tracker.observe(101, hash_of(101), U256::from(51)).updated);
        assert_eq!(tracker.number(), 101);
        assert_eq!(tracker.total_difficulty(), U256::from(51));
    }

    #[test]
    fn concurrent_reports_never_mix_number_and_hash() {
        let tracker = Arc::new(NetworkBestTracker::new());
        let threads = (0..8u64)
            .map(|t| {
                let tracker = tracker.clone();
                thread::spawn(move || {
                    for i in 0..500u64 {
                        let number = i * 8 + t + 1;
                        tracker.observe(number, hash_of(number), U256::from(number));
                        let best = tracker.snapshot();
                        assert_eq!(best.hash, hash_of(best.number));
                    }
                })
            })
            .collect::<Vec<_>>();
        for thread in threads {
            thread.join().unwrap();
        }
        let best = tracker.snapshot();
        assert_eq!(best.number, 499 * 8 + 8);
        assert_eq!(best.hash, hash_of(best.number));
    }
}
