//! Bounded in-memory probe history.

use std::collections::VecDeque;

use crate::probe::ProbeResult;

pub const HISTORY_CAPACITY: usize = 1000;

/// Most recent probe results, oldest evicted first.
#[derive(Debug)]
pub struct ProbeHistory {
    results: VecDeque<ProbeResult>,
    capacity: usize,
}

impl Default for ProbeHistory {
    fn default() -> Self {
        Self::with_capacity(HISTORY_CAPACITY)
    }
}

impl ProbeHistory {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            results: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, result: ProbeResult) {
        if self.results.len() == self.capacity {
            self.results.pop_front();
        }
        self.results.push_back(result);
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn successful(&self) -> usize {
        self.results.iter().filter(|r| r.success).count()
    }

    /// Oldest-first copy.
    pub fn snapshot(&self) -> Vec<ProbeResult> {
        self.results.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn result(i: usize) -> ProbeResult {
        ProbeResult::success(&format!("10.0.0.{}", i), "x", 1.0, Utc::now())
    }

    #[test]
    fn test_evicts_oldest_at_capacity() {
        let mut history = ProbeHistory::with_capacity(3);
        for i in 0..5 {
            history.push(result(i));
        }
        let targets: Vec<_> = history.snapshot().into_iter().map(|r| r.target).collect();
        assert_eq!(targets, vec!["10.0.0.2", "10.0.0.3", "10.0.0.4"]);
    }

    #[test]
    fn test_default_capacity() {
        let mut history = ProbeHistory::default();
        for i in 0..HISTORY_CAPACITY + 10 {
            history.push(result(i % 200));
        }
        assert_eq!(history.len(), HISTORY_CAPACITY);
        assert_eq!(history.successful(), HISTORY_CAPACITY);
    }
}
