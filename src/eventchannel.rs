//! Event-channel abstraction: a lightweight, ordered, one-bit inter-domain
//! interrupt. Modeled as a trait so ring logic can drive a simulated peer in
//! tests, the same way the reactor registry elsewhere in this codebase
//! signals a waiting worker by writing to an eventfd rather than calling
//! into it directly.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::Result;

pub trait EventChannel: Send + Sync {
    /// Kick the peer. Never blocks, never fails except on a torn-down
    /// channel.
    fn notify(&self) -> Result<()>;
}

/// In-memory event channel: a counter the simulated peer polls. Used by the
/// test harness to observe how many times the ring kicked the backend.
#[derive(Default)]
pub struct SimEventChannel {
    kicks: AtomicU64,
}

impl SimEventChannel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn kick_count(&self) -> u64 {
        self.kicks.load(Ordering::Relaxed)
    }
}

impl EventChannel for SimEventChannel {
    fn notify(&self) -> Result<()> {
        self.kicks.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
