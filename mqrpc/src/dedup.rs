use std::time::Duration;

use dashmap::DashMap;
use foldhash::fast::RandomState;
use tokio::time::Instant;

struct Watermark {
    highest: Option<u64>,
    touched: Instant,
}

/// Drops redelivered messages.
///
/// Every sender stamps its messages with its identity and a sequence number
/// that grows with each send. Messages of one sender arrive in order on a
/// given queue, so remembering the highest number seen per `(identity, queue)`
/// is enough: anything at or below it was delivered before. Watermarks of
/// senders silent for longer than `expiry` are forgotten.
pub struct DeduplicationChecker {
    expiry: Duration,
    watermarks: DashMap<(String, String), Watermark, RandomState>,
}

impl DeduplicationChecker {
    #[must_use]
    pub fn new(expiry: Duration) -> Self {
        Self {
            expiry,
            watermarks: DashMap::default(),
        }
    }

    /// Records `sequence` and reports whether it was seen before on `queue`.
    pub fn is_duplicate(&self, identity: &str, queue: &str, sequence: u64) -> bool {
        let now = Instant::now();
        let mut entry = self
            .watermarks
            .entry((identity.to_string(), queue.to_string()))
            .or_insert(Watermark {
                highest: None,
                touched: now,
            });
        if now.duration_since(entry.touched) >= self.expiry {
            entry.highest = None;
        }
        entry.touched = now;
        match entry.highest {
            Some(highest) if sequence <= highest => true,
            _ => {
                entry.highest = Some(sequence);
                false
            }
        }
    }

    /// Forgets senders idle for longer than the expiry.
    pub fn prune(&self) -> usize {
        let before = self.watermarks.len();
        let expiry = self.expiry;
        self.watermarks
            .retain(|_, watermark| watermark.touched.elapsed() < expiry);
        before - self.watermarks.len()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.watermarks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.watermarks.is_empty()
    }
}

impl std::fmt::Debug for DeduplicationChecker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeduplicationChecker")
            .field("expiry", &self.expiry)
            .field("senders", &self.watermarks.len())
            .finish()
    }
}
