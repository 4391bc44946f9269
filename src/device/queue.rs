//! One timer for every device's request queue.
//!
//! Devices keep their own time-ordered queues; the manager only remembers
//! when each device next wants service, so the driver can sleep until the
//! earliest of them.
use std::collections::HashMap;

use tokio::time::Instant;

use crate::plm::address::DeviceAddress;

#[derive(Debug, Default)]
pub struct RequestQueueManager {
    wake: HashMap<DeviceAddress, Instant>,
}

impl RequestQueueManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `addr` for service at `time`. An earlier pending wake wins.
    pub fn add_queue(&mut self, addr: DeviceAddress, time: Instant) {
        self.wake
            .entry(addr)
            .and_modify(|t| {
                if time < *t {
                    *t = time;
                }
            })
            .or_insert(time);
    }

    /// Remove and return every device due at `now`, earliest first.
    pub fn take_due(&mut self, now: Instant) -> Vec<DeviceAddress> {
        let mut due: Vec<(Instant, DeviceAddress)> = self
            .wake
            .iter()
            .filter(|(_, t)| **t <= now)
            .map(|(a, t)| (*t, *a))
            .collect();
        due.sort_by_key(|(t, _)| *t);
        for (_, addr) in &due {
            self.wake.remove(addr);
        }
        due.into_iter().map(|(_, a)| a).collect()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.wake.values().min().copied()
    }

    pub fn remove(&mut self, addr: &DeviceAddress) {
        self.wake.remove(addr);
    }

    pub fn len(&self) -> usize {
        self.wake.len()
    }

    pub fn is_empty(&self) -> bool {
        self.wake.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn earliest_wake_wins() {
        let t0 = Instant::now();
        let a = DeviceAddress::insteon(1, 2, 3);
        let mut q = RequestQueueManager::new();
        q.add_queue(a, t0 + Duration::from_secs(5));
        q.add_queue(a, t0 + Duration::from_secs(1));
        q.add_queue(a, t0 + Duration::from_secs(3));
        assert_eq!(q.len(), 1);
        assert_eq!(q.next_deadline(), Some(t0 + Duration::from_secs(1)));
    }

    #[test]
    fn take_due_orders_and_removes() {
        let t0 = Instant::now();
        let a = DeviceAddress::insteon(1, 2, 3);
        let b = DeviceAddress::insteon(4, 5, 6);
        let c = DeviceAddress::insteon(7, 8, 9);
        let mut q = RequestQueueManager::new();
        q.add_queue(a, t0 + Duration::from_millis(20));
        q.add_queue(b, t0 + Duration::from_millis(10));
        q.add_queue(c, t0 + Duration::from_secs(60));
        assert!(q.take_due(t0).is_empty());
        assert_eq!(q.take_due(t0 + Duration::from_millis(30)), vec![b, a]);
        assert_eq!(q.len(), 1);
        assert_eq!(q.next_deadline(), Some(t0 + Duration::from_secs(60)));
    }
}
