use std::sync::{Mutex, MutexGuard, PoisonError};

use sattach_common::PortRange;

use crate::bitmap::TaskBitmap;

/// Bounded pool of reservable ports drawn from a configured range.
///
/// Allocation scans forward from the slot after the last one handed out,
/// wrapping around once. Owned by the coordinator and shared with the
/// listeners it starts.
#[derive(Debug)]
pub struct PortPool {
    range: PortRange,
    inner: Mutex<PoolState>,
}

#[derive(Debug)]
struct PoolState {
    last_allocated: Option<usize>,
    reserved: TaskBitmap,
}

impl PortPool {
    pub fn new(range: PortRange) -> Self {
        Self {
            range,
            inner: Mutex::new(PoolState {
                last_allocated: None,
                reserved: TaskBitmap::new(range.len()),
            }),
        }
    }

    pub fn range(&self) -> PortRange {
        self.range
    }

    /// Number of ports in the pool; also the retry budget for binding.
    pub fn size(&self) -> usize {
        self.range.len()
    }

    pub fn available(&self) -> usize {
        let state = self.lock();
        state.reserved.len() - state.reserved.count_ones()
    }

    /// Reserves the next free port, or `None` when every port is taken.
    pub fn assign(&self) -> Option<u16> {
        let mut state = self.lock();
        let start = state.last_allocated.map_or(0, |last| last + 1);
        let idx = state.reserved.next_clear_from(start)?;
        state.reserved.set(idx);
        state.last_allocated = Some(idx);
        Some(self.range.min + idx as u16)
    }

    /// Returns `port` to the pool. Ports outside the range are ignored.
    pub fn release(&self, port: u16) {
        if port < self.range.min || port > self.range.max {
            return;
        }
        self.lock().reserved.clear((port - self.range.min) as usize);
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(min: u16, max: u16) -> PortPool {
        PortPool::new(PortRange { min, max })
    }

    #[test]
    fn assigns_in_order_then_runs_dry() {
        let pool = pool(60001, 60003);
        assert_eq!(pool.assign(), Some(60001));
        assert_eq!(pool.assign(), Some(60002));
        assert_eq!(pool.assign(), Some(60003));
        assert_eq!(pool.assign(), None);
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn scan_continues_after_last_allocation() {
        let pool = pool(60001, 60003);
        let first = pool.assign().unwrap();
        pool.assign().unwrap();
        pool.release(first);
        // 60003 is still free and comes before wrapping back to 60001.
        assert_eq!(pool.assign(), Some(60003));
        assert_eq!(pool.assign(), Some(60001));
    }

    #[test]
    fn release_ignores_foreign_ports() {
        let pool = pool(60001, 60001);
        pool.assign().unwrap();
        pool.release(8080);
        assert_eq!(pool.available(), 0);
        pool.release(60001);
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn inverted_range_is_empty() {
        let pool = pool(60005, 60001);
        assert_eq!(pool.size(), 0);
        assert_eq!(pool.assign(), None);
    }
}
