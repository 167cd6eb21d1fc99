//! Round-robin endpoint selection for load-balanced services.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Lock-free round-robin index selector.
#[derive(Debug, Default)]
pub struct RoundRobinBalancer {
    counter: AtomicUsize,
}

impl RoundRobinBalancer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Select the next index into a pool of `count` endpoints.
    pub fn next(&self, count: usize) -> Option<usize> {
        if count == 0 {
            return None;
        }
        Some(self.counter.fetch_add(1, Ordering::Relaxed) % count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycles_and_wraps() {
        let lb = RoundRobinBalancer::new();
        let picks: Vec<_> = (0..5).map(|_| lb.next(3).unwrap()).collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1]);
    }

    #[test]
    fn empty_pool_returns_none() {
        assert_eq!(RoundRobinBalancer::new().next(0), None);
    }

    #[test]
    fn pool_shrinking_stays_in_bounds() {
        let lb = RoundRobinBalancer::new();
        for _ in 0..7 {
            lb.next(10);
        }
        for _ in 0..10 {
            assert!(lb.next(2).unwrap() < 2);
        }
    }
}
