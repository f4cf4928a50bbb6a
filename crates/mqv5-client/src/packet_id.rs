//! Packet identifier allocation.
//!
//! Implements requirements from MQTT spec:
//! - [MQTT-2.2.1-3] Each new packet requiring one MUST be assigned a
//!   currently unused non-zero Packet Identifier.
//! - [MQTT-4.4.0-1] A re-sent Control Packet MUST use the same Packet
//!   Identifier, so an identifier stays allocated until its exchange
//!   (PUBACK for QoS 1, PUBCOMP for QoS 2) fully completes.
//!
//! The free set is kept as a sorted list of disjoint inclusive intervals over
//! `[1, 65535]`, initially one interval covering the whole range. Allocation
//! takes the lowest free identifier; release coalesces with both neighbors,
//! so a fully released allocator always collapses back to a single interval.

use parking_lot::Mutex;

const MAX_PACKET_ID: u16 = u16::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Interval {
    lo: u16,
    hi: u16,
}

/// Thread-safe packet identifier allocator.
#[derive(Debug)]
pub struct PacketIdAllocator {
    free: Mutex<Vec<Interval>>,
}

impl Default for PacketIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketIdAllocator {
    pub fn new() -> Self {
        Self {
            free: Mutex::new(vec![Interval {
                lo: 1,
                hi: MAX_PACKET_ID,
            }]),
        }
    }

    /// Allocate the lowest free packet identifier.
    ///
    /// Returns `None` when all 65535 identifiers are in flight.
    pub fn allocate(&self) -> Option<u16> {
        let mut free = self.free.lock();
        let first = free.first_mut()?;
        let pid = first.lo;
        if first.lo == first.hi {
            free.remove(0);
        } else {
            first.lo += 1;
        }
        Some(pid)
    }

    /// Return a packet identifier to the free set, merging with adjacent
    /// intervals. `pid` must have been handed out by [`allocate`] and not
    /// freed since.
    ///
    /// [`allocate`]: Self::allocate
    pub fn free(&self, pid: u16) {
        debug_assert!(pid != 0);
        let mut free = self.free.lock();

        // Index of the first interval starting above pid.
        let idx = free.partition_point(|iv| iv.lo <= pid);
        debug_assert!(idx == 0 || free[idx - 1].hi < pid, "double free of {pid}");

        let joins_prev = idx > 0 && free[idx - 1].hi == pid - 1;
        let joins_next = idx < free.len() && pid < MAX_PACKET_ID && free[idx].lo == pid + 1;

        match (joins_prev, joins_next) {
            (true, true) => {
                free[idx - 1].hi = free[idx].hi;
                free.remove(idx);
            }
            (true, false) => free[idx - 1].hi = pid,
            (false, true) => free[idx].lo = pid,
            (false, false) => free.insert(idx, Interval { lo: pid, hi: pid }),
        }
    }

    /// Reset to the fully-free state (used when a session is discarded).
    pub fn reset(&self) {
        *self.free.lock() = vec![Interval {
            lo: 1,
            hi: MAX_PACKET_ID,
        }];
    }

    #[cfg(test)]
    fn intervals(&self) -> Vec<(u16, u16)> {
        self.free.lock().iter().map(|iv| (iv.lo, iv.hi)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_lowest_first() {
        let alloc = PacketIdAllocator::new();
        assert_eq!(alloc.allocate(), Some(1));
        assert_eq!(alloc.allocate(), Some(2));
        assert_eq!(alloc.allocate(), Some(3));
    }

    #[test]
    fn freed_id_is_reused_before_higher_ones() {
        let alloc = PacketIdAllocator::new();
        let a = alloc.allocate().unwrap();
        let b = alloc.allocate().unwrap();
        let c = alloc.allocate().unwrap();
        alloc.free(b);
        let d = alloc.allocate().unwrap();
        assert_eq!((a, b, c, d), (1, 2, 3, 2));
    }

    #[test]
    fn free_coalesces_with_both_neighbors() {
        let alloc = PacketIdAllocator::new();
        for _ in 0..5 {
            alloc.allocate();
        }
        // free set is [6, 65535]
        alloc.free(2);
        alloc.free(4);
        assert_eq!(alloc.intervals(), vec![(2, 2), (4, 4), (6, MAX_PACKET_ID)]);
        alloc.free(3);
        assert_eq!(alloc.intervals(), vec![(2, 4), (6, MAX_PACKET_ID)]);
        alloc.free(5);
        assert_eq!(alloc.intervals(), vec![(2, MAX_PACKET_ID)]);
        alloc.free(1);
        assert_eq!(alloc.intervals(), vec![(1, MAX_PACKET_ID)]);
    }

    #[test]
    fn no_interval_has_adjacent_neighbor_after_free() {
        let alloc = PacketIdAllocator::new();
        let ids: Vec<u16> = (0..64).map(|_| alloc.allocate().unwrap()).collect();
        // free in a scattered order
        for &id in ids.iter().step_by(3) {
            alloc.free(id);
        }
        for &id in ids.iter().skip(1).step_by(3) {
            alloc.free(id);
        }
        for &id in ids.iter().skip(2).step_by(3) {
            alloc.free(id);
        }
        let intervals = alloc.intervals();
        assert_eq!(intervals, vec![(1, MAX_PACKET_ID)]);
    }

    #[test]
    fn exhaustion_returns_none() {
        let alloc = PacketIdAllocator::new();
        for expected in 1..=MAX_PACKET_ID {
            assert_eq!(alloc.allocate(), Some(expected));
        }
        assert_eq!(alloc.allocate(), None);
        alloc.free(12345);
        assert_eq!(alloc.allocate(), Some(12345));
        assert_eq!(alloc.allocate(), None);
    }

    #[test]
    fn outstanding_ids_are_unique() {
        let alloc = PacketIdAllocator::new();
        let mut held = std::collections::HashSet::new();
        for round in 0..10u16 {
            for _ in 0..100 {
                let id = alloc.allocate().unwrap();
                assert!(held.insert(id), "duplicate outstanding id {id}");
            }
            // release roughly half, keep the rest in flight
            let release: Vec<u16> = held
                .iter()
                .copied()
                .filter(|id| id % 2 == round % 2)
                .collect();
            for id in release {
                held.remove(&id);
                alloc.free(id);
            }
        }
        for id in held.drain() {
            alloc.free(id);
        }
        assert_eq!(alloc.intervals(), vec![(1, MAX_PACKET_ID)]);
    }
}
