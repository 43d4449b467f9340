//! Point-in-time outbox counts.

use serde::Serialize;

/// Entry counts by status, read from a single snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OutboxMetrics {
    pub pending_count: u64,
    pub failed_count: u64,
    pub published_count: u64,
    pub dead_letter_count: u64,
}

impl OutboxMetrics {
    pub fn total_count(&self) -> u64 {
        self.pending_count + self.failed_count + self.published_count + self.dead_letter_count
    }

    /// No entry is failing or dead-lettered.
    pub fn is_healthy(&self) -> bool {
        self.failed_count == 0 && self.dead_letter_count == 0
    }

    /// Percentage of entries published, to two decimals. 100 for an empty outbox.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_count();
        if total == 0 {
            return 100.0;
        }
        let rate = self.published_count as f64 / total as f64 * 100.0;
        (rate * 100.0).round() / 100.0
    }
}
