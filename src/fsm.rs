//! Frontend connection state machine.
//!
//! Mirrors the backend-state handshake xenstore-based PV drivers use:
//! frontend and backend each publish a small integer state under their own
//! store subtree, and each side watches the other's. This module owns only
//! the frontend's half: it writes `state`, watches `backend/state`, and
//! exposes the resulting phase to the rest of the driver.

use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{Duration, Instant};

use crate::error::{Result, VifError};
use crate::store::ScopedStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BackendState {
    Unknown = 0,
    Initialising = 1,
    InitWait = 2,
    Initialised = 3,
    Connected = 4,
    Closing = 5,
    Closed = 6,
    Reconfiguring = 7,
    Reconfigured = 8,
}

impl BackendState {
    fn parse(s: &str) -> BackendState {
        match s {
            "1" => BackendState::Initialising,
            "2" => BackendState::InitWait,
            "3" => BackendState::Initialised,
            "4" => BackendState::Connected,
            "5" => BackendState::Closing,
            "6" => BackendState::Closed,
            "7" => BackendState::Reconfiguring,
            "8" => BackendState::Reconfigured,
            _ => BackendState::Unknown,
        }
    }
}

/// Frontend lifecycle phase. Transitions only happen through
/// [`FrontendFsm::resume`], [`FrontendFsm::suspend`] and
/// [`FrontendFsm::poll_backend`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrontendState {
    Unknown = 0,
    Closed = 1,
    Prepared = 2,
    Connected = 3,
    Enabled = 4,
}

impl FrontendState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => FrontendState::Closed,
            2 => FrontendState::Prepared,
            3 => FrontendState::Connected,
            4 => FrontendState::Enabled,
            _ => FrontendState::Unknown,
        }
    }

    fn wire_value(self) -> &'static str {
        match self {
            FrontendState::Unknown => "0",
            FrontendState::Closed => "1",
            FrontendState::Prepared => "2",
            FrontendState::Connected => "3",
            FrontendState::Enabled => "4",
        }
    }
}

/// Drives the frontend side of the connect/disconnect handshake against a
/// [`ScopedStore`] rooted at the device's own xenstore path, with the
/// backend's subtree reachable via a sibling scope.
pub struct FrontendFsm {
    own: ScopedStore,
    backend: ScopedStore,
    state: AtomicU8,
    /// Asserted on reaching `Closed` and held through the rest of the
    /// normal lifecycle; the eject monitor gates on it alongside the
    /// frontend state itself.
    online: std::sync::atomic::AtomicBool,
}

impl FrontendFsm {
    pub fn new(own: ScopedStore, backend: ScopedStore) -> Self {
        FrontendFsm {
            own,
            backend,
            state: AtomicU8::new(FrontendState::Unknown as u8),
            online: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> FrontendState {
        FrontendState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Whether the device currently considers itself online, asserted on
    /// reaching `Closed` (see the `CLOSED` state description above).
    pub fn online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    fn set_state(&self, state: FrontendState) -> Result<()> {
        self.state.store(state as u8, Ordering::Release);
        if state == FrontendState::Closed {
            self.online.store(true, Ordering::Release);
        }
        self.own.write("state", state.wire_value())
    }

    /// Walk the adjacent-state chain one step at a time until `target` is
    /// reached, publishing each intermediate state along the way (mirrors
    /// the xenstore convention of never skipping a published state). A
    /// current state already at or past `target` is a no-op, so calling
    /// this twice with the same target is indistinguishable from once.
    fn set_state_chain(&self, target: FrontendState) -> Result<()> {
        loop {
            let current = self.state();
            if current as u8 >= target as u8 {
                return Ok(());
            }
            self.set_state(FrontendState::from_u8(current as u8 + 1))?;
        }
    }

    fn backend_state(&self) -> BackendState {
        self.backend.read("state").map(|s| BackendState::parse(&s)).unwrap_or(BackendState::Unknown)
    }

    /// Run the handshake up through `Connected`: step `UNKNOWN`→`CLOSED`→
    /// `PREPARED`, wait (bounded) for the backend to reach `InitWait` or
    /// later, then step to `CONNECTED` once the backend itself reports
    /// `Connected`. On any failure the state collapses back to `CLOSED`
    /// rather than being left stranded mid-handshake.
    pub fn resume(&self) -> Result<()> {
        match self.resume_inner() {
            Ok(()) => Ok(()),
            Err(e) => {
                let _ = self.set_state(FrontendState::Closed);
                Err(e)
            }
        }
    }

    fn resume_inner(&self) -> Result<()> {
        self.set_state_chain(FrontendState::Prepared)?;
        self.wait_for_backend(|s| !matches!(s, BackendState::Unknown | BackendState::Initialising), Duration::from_secs(120))?;
        if self.backend_state() == BackendState::Closed {
            return Err(VifError::BackendGone);
        }
        self.set_state_chain(FrontendState::Connected)?;
        self.wait_for_backend(|s| s == BackendState::Connected, Duration::from_secs(120))?;
        Ok(())
    }

    /// Idempotent: calling `enable` again once already `Enabled` is a
    /// no-op rather than an error.
    pub fn enable(&self) -> Result<()> {
        match self.state() {
            FrontendState::Enabled => Ok(()),
            FrontendState::Connected => self.set_state(FrontendState::Enabled),
            _ => Err(VifError::InvalidState),
        }
    }

    /// Tear down: publish `Closing`/`Closed` and wait for the backend to
    /// acknowledge by reaching `Closed` itself (or give up after the same
    /// bounded wait the connect path uses).
    pub fn suspend(&self) -> Result<()> {
        self.set_state(FrontendState::Closed)?;
        let _ = self.wait_for_backend(|s| s == BackendState::Closed, Duration::from_secs(5));
        Ok(())
    }

    /// Poll the backend's published state once, without blocking. Used by
    /// the watch-driven event loop to react to out-of-band backend
    /// transitions (e.g. the backend vanishing while the frontend is
    /// `Enabled`).
    pub fn poll_backend(&self) -> BackendState {
        self.backend_state()
    }

    fn wait_for_backend(&self, mut until: impl FnMut(BackendState) -> bool, timeout: Duration) -> Result<()> {
        let watch = self.backend.watch("state");
        let deadline = Instant::now() + timeout;
        loop {
            if until(self.backend_state()) {
                return Ok(());
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(VifError::BackendGone);
            }
            let _ = watch.recv_timeout(remaining.min(Duration::from_millis(50)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use std::sync::Arc;
    use std::thread;

    fn fsm_pair() -> (Arc<Store>, FrontendFsm) {
        let store = Arc::new(Store::new());
        let own = ScopedStore::new(store.clone(), "device/vif/0");
        let backend = ScopedStore::new(store.clone(), "backend/vif/0");
        (store, FrontendFsm::new(own, backend))
    }

    #[test]
    fn test_resume_reaches_connected_when_backend_cooperates() {
        let (store, fsm) = fsm_pair();
        let backend_store = store.clone();
        let handle = thread::spawn(move || {
            let frontend = ScopedStore::new(backend_store.clone(), "device/vif/0");
            let backend = ScopedStore::new(backend_store, "backend/vif/0");
            loop {
                if frontend.read("state").as_deref() == Some("2") {
                    backend.write("state", "4").unwrap();
                    break;
                }
                thread::sleep(Duration::from_millis(1));
            }
        });
        fsm.resume().unwrap();
        handle.join().unwrap();
        assert_eq!(fsm.state(), FrontendState::Connected);
        assert_eq!(store.read("device/vif/0/state"), Some("3".to_string()));
    }

    #[test]
    fn test_enable_requires_connected_state() {
        let (_store, fsm) = fsm_pair();
        assert!(matches!(fsm.enable(), Err(VifError::InvalidState)));
    }

    #[test]
    fn test_enable_twice_is_idempotent() {
        let (_store, fsm) = fsm_pair();
        fsm.set_state(FrontendState::Connected).unwrap();
        fsm.enable().unwrap();
        assert_eq!(fsm.state(), FrontendState::Enabled);
        fsm.enable().unwrap();
        assert_eq!(fsm.state(), FrontendState::Enabled);
    }

    #[test]
    fn test_resume_rolls_back_to_closed_when_backend_already_closed() {
        let (store, fsm) = fsm_pair();
        // Backend reporting Closed satisfies the first wait's predicate
        // immediately, so this exercises the rollback without waiting out
        // resume()'s real timeout.
        store.write("backend/vif/0/state", "6").unwrap();
        let err = fsm.resume().unwrap_err();
        assert!(matches!(err, VifError::BackendGone));
        assert_eq!(fsm.state(), FrontendState::Closed);
        assert_eq!(store.read("device/vif/0/state"), Some("1".to_string()));
    }

    #[test]
    fn test_set_state_chain_publishes_every_intermediate_state() {
        let (store, fsm) = fsm_pair();
        fsm.set_state_chain(FrontendState::Connected).unwrap();
        assert_eq!(fsm.state(), FrontendState::Connected);
        assert_eq!(store.read("device/vif/0/state"), Some("3".to_string()));
    }

    #[test]
    fn test_suspend_publishes_closed() {
        let (store, fsm) = fsm_pair();
        fsm.suspend().unwrap();
        assert_eq!(store.read("device/vif/0/state"), Some("1".to_string()));
    }
}
