//! Watches the backend's `online` node and runs a caller-supplied detach
//! callback when the backend reports itself offline while this device is
//! still live.
//!
//! Mirrors the optional PV-driver eject-on-demand mechanism: the backend
//! (or a host-side management agent acting on its behalf) clears its own
//! `online` flag to ask the frontend to detach; the frontend attempts a
//! clean detach and, on failure, records the reason under the shared
//! `error/<frontend-path>/error` node rather than anywhere in its own
//! subtree, so a host-side watcher doesn't need to know the frontend's
//! internal layout to learn why an eject failed.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Sender, bounded};

use crate::fsm::{FrontendFsm, FrontendState};
use crate::store::ScopedStore;

/// What the frontend does in response to an eject request. Returning
/// `Err` leaves the device attached and records the message for the host
/// to read back.
pub trait EjectHandler: Send + Sync {
    fn try_detach(&self) -> std::result::Result<(), String>;
}

pub struct WorkerHandle {
    stop: Sender<()>,
    join: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn stop(mut self) {
        let _ = self.stop.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        let _ = self.stop.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}

fn should_eject(fsm: &FrontendFsm, backend: &ScopedStore) -> bool {
    !matches!(fsm.state(), FrontendState::Unknown | FrontendState::Closed)
        && fsm.online()
        && backend.read("online").as_deref() == Some("0")
}

/// Spawn the eject-watch worker. Runs until [`WorkerHandle::stop`] is
/// called or the handle is dropped.
///
/// `frontend` is the device's own scope (used only to compute the error
/// path), `backend` is the backend's scope (watched for `online`).
pub fn spawn_eject_monitor(
    frontend: ScopedStore,
    backend: ScopedStore,
    fsm: Arc<FrontendFsm>,
    handler: Arc<dyn EjectHandler>,
) -> WorkerHandle {
    let (stop_tx, stop_rx) = bounded(1);
    let join = thread::spawn(move || {
        let watch = backend.watch("online");
        loop {
            if stop_rx.try_recv().is_ok() {
                return;
            }
            match watch.recv_timeout(Duration::from_millis(50)) {
                Ok(_) => {
                    if !should_eject(&fsm, &backend) {
                        continue;
                    }
                    match handler.try_detach() {
                        Ok(()) => {
                            tracing::info!("device ejected cleanly");
                        }
                        Err(reason) => {
                            tracing::warn!(reason = %reason, "eject request failed");
                            let error_path = format!("error/{}/error", frontend.full_path(""));
                            let _ = frontend.store().write(error_path, reason);
                        }
                    }
                }
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => return,
            }
        }
    });
    WorkerHandle { stop: stop_tx, join: Some(join) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    struct AlwaysSucceeds(Arc<AtomicBool>);
    impl EjectHandler for AlwaysSucceeds {
        fn try_detach(&self) -> std::result::Result<(), String> {
            self.0.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    struct AlwaysFails;
    impl EjectHandler for AlwaysFails {
        fn try_detach(&self) -> std::result::Result<(), String> {
            Err("device busy".to_string())
        }
    }

    fn connected_fsm(store: &Arc<Store>) -> Arc<FrontendFsm> {
        let own = ScopedStore::new(store.clone(), "device/vif/0");
        let backend = ScopedStore::new(store.clone(), "backend/vif/0");
        let fsm = FrontendFsm::new(own, backend);
        store.write("backend/vif/0/state", "4").unwrap();
        fsm.resume().unwrap();
        Arc::new(fsm)
    }

    #[test]
    fn test_backend_offline_triggers_detach() {
        let store = Arc::new(Store::new());
        let fsm = connected_fsm(&store);
        let frontend = ScopedStore::new(store.clone(), "device/vif/0");
        let backend = ScopedStore::new(store.clone(), "backend/vif/0");
        let detached = Arc::new(AtomicBool::new(false));
        let handle = spawn_eject_monitor(frontend, backend.clone(), fsm, Arc::new(AlwaysSucceeds(detached.clone())));
        backend.write("online", "0").unwrap();
        for _ in 0..200 {
            if detached.load(Ordering::SeqCst) {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        handle.stop();
        assert!(detached.load(Ordering::SeqCst));
    }

    #[test]
    fn test_failed_detach_records_error_under_shared_error_path() {
        let store = Arc::new(Store::new());
        let fsm = connected_fsm(&store);
        let frontend = ScopedStore::new(store.clone(), "device/vif/0");
        let backend = ScopedStore::new(store.clone(), "backend/vif/0");
        let handle = spawn_eject_monitor(frontend, backend.clone(), fsm, Arc::new(AlwaysFails));
        backend.write("online", "0").unwrap();
        for _ in 0..200 {
            if store.read("error/device/vif/0/error").is_some() {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        handle.stop();
        assert_eq!(store.read("error/device/vif/0/error"), Some("device busy".to_string()));
    }

    #[test]
    fn test_gated_out_when_frontend_not_online() {
        let store = Arc::new(Store::new());
        let own = ScopedStore::new(store.clone(), "device/vif/0");
        let backend = ScopedStore::new(store.clone(), "backend/vif/0");
        let fsm = Arc::new(FrontendFsm::new(own.clone(), backend.clone()));
        let detached = Arc::new(AtomicBool::new(false));
        let handle = spawn_eject_monitor(own, backend.clone(), fsm, Arc::new(AlwaysSucceeds(detached.clone())));
        backend.write("online", "0").unwrap();
        thread::sleep(Duration::from_millis(50));
        handle.stop();
        assert!(!detached.load(Ordering::SeqCst), "must not eject a frontend that never reached Closed/online");
    }
}
