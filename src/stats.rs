//! Per-CPU counters, summed on query.
//!
//! Writers never block and never contend with each other: each OS thread is
//! assigned a stable lane (round-robin, cached in a thread-local) the first
//! time it touches the counters, and increments land on that lane with a
//! relaxed fetch-add. Readers sum across all lanes.

use std::cell::Cell;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::packet::CompletionStatus;

const NAMES: [&str; 9] = [
    "packets_dropped",
    "backend_errors",
    "frontend_errors",
    "unicast_packets",
    "unicast_octets",
    "multicast_packets",
    "multicast_octets",
    "broadcast_packets",
    "broadcast_octets",
];

const N_NAMES: usize = NAMES.len();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Transmitter,
    Receiver,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    PacketsDropped,
    BackendErrors,
    FrontendErrors,
    UnicastPackets,
    UnicastOctets,
    MulticastPackets,
    MulticastOctets,
    BroadcastPackets,
    BroadcastOctets,
}

impl Counter {
    fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        NAMES[self.index()]
    }
}

thread_local! {
    static LANE: Cell<Option<usize>> = const { Cell::new(None) };
}

/// Per-CPU (approximated by per-thread lane) counter bank for one side
/// (transmitter or receiver) of one ring.
pub struct Statistics {
    lanes: Vec<[AtomicU64; N_NAMES]>,
    next_lane: AtomicUsize,
}

impl Statistics {
    pub fn new(num_cpus: usize) -> Self {
        let num_cpus = num_cpus.max(1);
        let mut lanes = Vec::with_capacity(num_cpus);
        for _ in 0..num_cpus {
            lanes.push(std::array::from_fn(|_| AtomicU64::new(0)));
        }
        Statistics {
            lanes,
            next_lane: AtomicUsize::new(0),
        }
    }

    fn current_lane(&self) -> usize {
        LANE.with(|cell| {
            if let Some(l) = cell.get() {
                return l % self.lanes.len();
            }
            let l = self.next_lane.fetch_add(1, Ordering::Relaxed) % self.lanes.len();
            cell.set(Some(l));
            l
        })
    }

    #[inline]
    pub fn add(&self, counter: Counter, value: u64) {
        let lane = self.current_lane();
        self.lanes[lane][counter.index()].fetch_add(value, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc(&self, counter: Counter) {
        self.add(counter, 1);
    }

    pub fn get(&self, counter: Counter) -> u64 {
        self.lanes
            .iter()
            .map(|lane| lane[counter.index()].load(Ordering::Relaxed))
            .sum()
    }

    pub fn record_completion(&self, side: Side, dest: Destination, status: CompletionStatus, packet_len: u64) {
        let _ = side;
        match status {
            CompletionStatus::Dropped => {
                self.inc(Counter::PacketsDropped);
                return;
            }
            CompletionStatus::Error => {
                self.inc(Counter::PacketsDropped);
                self.inc(Counter::BackendErrors);
                return;
            }
            CompletionStatus::Ok | CompletionStatus::Pending => {}
        }
        match dest {
            Destination::Unicast => {
                self.inc(Counter::UnicastPackets);
                self.add(Counter::UnicastOctets, packet_len);
            }
            Destination::Multicast => {
                self.inc(Counter::MulticastPackets);
                self.add(Counter::MulticastOctets, packet_len);
            }
            Destination::Broadcast => {
                self.inc(Counter::BroadcastPackets);
                self.add(Counter::BroadcastOctets, packet_len);
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    Unicast,
    Multicast,
    Broadcast,
}

impl Destination {
    pub fn classify(mac: &[u8; 6]) -> Destination {
        if *mac == [0xff; 6] {
            Destination::Broadcast
        } else if mac[0] & 0x01 != 0 {
            Destination::Multicast
        } else {
            Destination::Unicast
        }
    }
}

/// Both sides of a single queue's statistics.
pub struct RingStatistics {
    pub tx: Statistics,
    pub rx: Statistics,
}

impl RingStatistics {
    pub fn new(num_cpus: usize) -> Self {
        RingStatistics {
            tx: Statistics::new(num_cpus),
            rx: Statistics::new(num_cpus),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sum_across_lanes() {
        let stats = Statistics::new(4);
        for _ in 0..10 {
            stats.inc(Counter::UnicastPackets);
        }
        assert_eq!(stats.get(Counter::UnicastPackets), 10);
    }

    #[test]
    fn test_classify_destination() {
        assert_eq!(
            Destination::classify(&[0xff, 0xff, 0xff, 0xff, 0xff, 0xff]),
            Destination::Broadcast
        );
        assert_eq!(
            Destination::classify(&[0x01, 0x00, 0x5e, 0x00, 0x00, 0x01]),
            Destination::Multicast
        );
        assert_eq!(
            Destination::classify(&[0x02, 0x00, 0x00, 0x00, 0x00, 0x01]),
            Destination::Unicast
        );
    }

    #[test]
    fn test_record_completion_dropped() {
        let stats = Statistics::new(1);
        stats.record_completion(Side::Transmitter, Destination::Unicast, CompletionStatus::Dropped, 100);
        assert_eq!(stats.get(Counter::PacketsDropped), 1);
        assert_eq!(stats.get(Counter::BackendErrors), 0);
        assert_eq!(stats.get(Counter::UnicastPackets), 0);
    }

    #[test]
    fn test_record_completion_error_bumps_backend_errors() {
        let stats = Statistics::new(1);
        stats.record_completion(Side::Transmitter, Destination::Unicast, CompletionStatus::Error, 100);
        assert_eq!(stats.get(Counter::PacketsDropped), 1);
        assert_eq!(stats.get(Counter::BackendErrors), 1);
    }
}
