//! Publishes the frontend's configured addresses into the store so the
//! backend (or a host-side management agent watching the same tree) can
//! read them without a side channel.
//!
//! Addresses live under the data prefix (`data/vif/<name>/…`), a sibling
//! of the frontend's own node (`device/vif/<name>/…`) rather than under
//! it, so callers construct this with the frontend's own scope and the
//! monitor derives the sibling data scope itself.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::error::Result;
use crate::store::ScopedStore;

type Snapshot = (Vec<Ipv4Addr>, Vec<Ipv6Addr>);

/// Where an address monitor gets its data from. The production caller
/// wires this to whatever reads the guest's configured interface
/// addresses; tests and the demo binary use a fixed or swappable list.
pub trait AddressSource: Send + Sync {
    fn ipv4_addresses(&self) -> Vec<Ipv4Addr>;
    fn ipv6_addresses(&self) -> Vec<Ipv6Addr>;
}

/// A source that always reports a fixed, caller-supplied set of addresses.
pub struct StaticAddressSource {
    pub ipv4: Vec<Ipv4Addr>,
    pub ipv6: Vec<Ipv6Addr>,
}

impl AddressSource for StaticAddressSource {
    fn ipv4_addresses(&self) -> Vec<Ipv4Addr> {
        self.ipv4.clone()
    }

    fn ipv6_addresses(&self) -> Vec<Ipv6Addr> {
        self.ipv6.clone()
    }
}

/// Derive the `data/vif/<name>` scope that sits alongside a frontend's own
/// `device/vif/<name>` node.
fn data_scope(frontend: &ScopedStore) -> ScopedStore {
    let base = frontend.full_path("");
    let data_base = base.replacen("device/", "data/", 1);
    ScopedStore::new(frontend.store().clone(), data_base)
}

/// Publishes the current address set under `data/vif/<name>/ipv4/<n>/addr`
/// and `.../ipv6/<n>/addr`, atomically replacing whatever was published
/// before.
pub struct AddressMonitor {
    scope: ScopedStore,
    source: Arc<dyn AddressSource>,
    /// Last snapshot actually written to the store. Readers on the watch
    /// path call `publish` far more often than the address set actually
    /// changes; comparing against this lock-free snapshot lets repeated
    /// calls skip the store transaction entirely.
    last_published: ArcSwap<Option<Snapshot>>,
}

impl AddressMonitor {
    /// `frontend` is the device's own `device/vif/<name>` scope; the data
    /// prefix this monitor actually writes under is derived from it.
    pub fn new(frontend: ScopedStore, source: Arc<dyn AddressSource>) -> Self {
        AddressMonitor { scope: data_scope(&frontend), source, last_published: ArcSwap::from_pointee(None) }
    }

    /// Re-read the source and republish if the address set changed since
    /// the last call. Removes every previously published entry under
    /// `ipv4/` and `ipv6/` in the same transaction that writes the new
    /// ones, so a watcher never observes a partial (stale-plus-new)
    /// address set.
    pub fn publish(&self) -> Result<()> {
        let ipv4 = self.source.ipv4_addresses();
        let ipv6 = self.source.ipv6_addresses();

        let unchanged = match self.last_published.load_full().as_ref() {
            Some((last_v4, last_v6)) => *last_v4 == ipv4 && *last_v6 == ipv6,
            None => false,
        };
        if unchanged {
            return Ok(());
        }

        let mut txn = self.scope.transaction();
        txn.remove_prefix(self.scope.full_path("ipv4/"));
        txn.remove_prefix(self.scope.full_path("ipv6/"));
        for (i, addr) in ipv4.iter().enumerate() {
            txn.write(self.scope.full_path(&format!("ipv4/{i}/addr")), addr.to_string());
        }
        for (i, addr) in ipv6.iter().enumerate() {
            txn.write(self.scope.full_path(&format!("ipv6/{i}/addr")), addr.to_string());
        }
        txn.commit()?;
        self.last_published.store(Arc::new(Some((ipv4, ipv6))));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use std::sync::Arc;

    #[test]
    fn test_publish_writes_addresses_under_data_prefix() {
        let store = Arc::new(Store::new());
        let frontend = ScopedStore::new(store.clone(), "device/vif/0");
        let source = Arc::new(StaticAddressSource {
            ipv4: vec!["10.0.0.5".parse().unwrap()],
            ipv6: vec!["fe80::1".parse().unwrap()],
        });
        let monitor = AddressMonitor::new(frontend, source);
        monitor.publish().unwrap();
        assert_eq!(store.read("data/vif/0/ipv4/0/addr"), Some("10.0.0.5".to_string()));
        assert_eq!(store.read("data/vif/0/ipv6/0/addr"), Some("fe80::1".to_string()));
        assert_eq!(store.read("device/vif/0/ipv4/0/addr"), None, "addresses must not land under the frontend's own node");
    }

    #[test]
    fn test_republish_replaces_prior_set_without_leaving_stale_entries() {
        let store = Arc::new(Store::new());
        let scope = ScopedStore::new(store.clone(), "device/vif/0");
        let source = Arc::new(std::sync::Mutex::new(StaticAddressSource {
            ipv4: vec!["10.0.0.5".parse().unwrap(), "10.0.0.6".parse().unwrap()],
            ipv6: vec![],
        }));

        struct Indirect(Arc<std::sync::Mutex<StaticAddressSource>>);
        impl AddressSource for Indirect {
            fn ipv4_addresses(&self) -> Vec<Ipv4Addr> {
                self.0.lock().unwrap().ipv4.clone()
            }
            fn ipv6_addresses(&self) -> Vec<Ipv6Addr> {
                self.0.lock().unwrap().ipv6.clone()
            }
        }

        let monitor = AddressMonitor::new(scope, Arc::new(Indirect(source.clone())));
        monitor.publish().unwrap();
        assert_eq!(store.read("data/vif/0/ipv4/1/addr"), Some("10.0.0.6".to_string()));

        source.lock().unwrap().ipv4 = vec!["10.0.0.7".parse().unwrap()];
        monitor.publish().unwrap();
        assert_eq!(store.read("data/vif/0/ipv4/0/addr"), Some("10.0.0.7".to_string()));
        assert_eq!(store.read("data/vif/0/ipv4/1/addr"), None, "stale second entry must be gone");
    }
}
