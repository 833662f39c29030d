//! Retry Tracker
//!
//! Counts failed uploads per record id and decides between requeue and drop.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

/// What to do with a record after a failed upload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Put it back on the queue; `attempts` failures so far
    Requeue { attempts: u32 },
    /// Give up after `attempts` failures
    Drop { attempts: u32 },
}

/// Per-record failure counts; a count never exceeds `max_retries`
#[derive(Debug)]
pub struct RetryTracker {
    attempts: DashMap<String, u32>,
    max_retries: u32,
}

impl RetryTracker {
    pub fn new(max_retries: u32) -> Self {
        Self {
            attempts: DashMap::new(),
            max_retries: max_retries.max(1),
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Register one more failure for `id`
    pub fn record_failure(&self, id: &str) -> RetryDecision {
        match self.attempts.entry(id.to_string()) {
            Entry::Occupied(mut entry) => {
                let attempts = *entry.get() + 1;
                if attempts >= self.max_retries {
                    entry.remove();
                    RetryDecision::Drop { attempts }
                } else {
                    *entry.get_mut() = attempts;
                    RetryDecision::Requeue { attempts }
                }
            }
            Entry::Vacant(entry) => {
                if self.max_retries <= 1 {
                    RetryDecision::Drop { attempts: 1 }
                } else {
                    entry.insert(1);
                    RetryDecision::Requeue { attempts: 1 }
                }
            }
        }
    }

    /// Forget `id`, typically after a successful upload
    pub fn clear(&self, id: &str) {
        self.attempts.remove(id);
    }

    pub fn attempts(&self, id: &str) -> Option<u32> {
        self.attempts.get(id).map(|entry| *entry)
    }

    /// Number of records currently awaiting a retry
    pub fn len(&self) -> usize {
        self.attempts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attempts.is_empty()
    }

    pub fn reset(&self) {
        self.attempts.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requeue_until_max_then_drop() {
        let tracker = RetryTracker::new(3);

        assert_eq!(tracker.record_failure("a"), RetryDecision::Requeue { attempts: 1 });
        assert_eq!(tracker.record_failure("a"), RetryDecision::Requeue { attempts: 2 });
        assert_eq!(tracker.attempts("a"), Some(2));
        assert_eq!(tracker.record_failure("a"), RetryDecision::Drop { attempts: 3 });

        assert_eq!(tracker.attempts("a"), None);
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_clear_on_success() {
        let tracker = RetryTracker::new(3);
        tracker.record_failure("a");
        tracker.record_failure("b");
        assert_eq!(tracker.len(), 2);

        tracker.clear("a");
        assert_eq!(tracker.len(), 1);
        assert_eq!(tracker.attempts("a"), None);
    }

    #[test]
    fn test_single_retry_drops_immediately() {
        let tracker = RetryTracker::new(1);
        assert_eq!(tracker.record_failure("a"), RetryDecision::Drop { attempts: 1 });
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_reset() {
        let tracker = RetryTracker::new(3);
        tracker.record_failure("a");
        tracker.reset();
        assert!(tracker.is_empty());
    }
}
