//! Hierarchical key/value store interface.
//!
//! Models the xenstore-like directory the frontend and backend halves use
//! to negotiate a connection: string keys organised as a tree, watches that
//! fire on any write under a subtree, and transactions that commit a batch
//! of writes atomically. Only an in-memory implementation lives here; it is
//! the same shape of CRUD surface used elsewhere in this codebase for
//! entity storage, reworked from an async/SQL-backed store into a
//! synchronous in-memory tree with watch support.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crossbeam_channel::{Receiver, Sender, unbounded};

use crate::error::{Result, VifError};

/// A pending set of writes that commits atomically.
pub struct Transaction<'a> {
    store: &'a Store,
    writes: Vec<(String, String)>,
    removals: Vec<String>,
}

impl<'a> Transaction<'a> {
    pub fn write(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.writes.push((key.into(), value.into()));
        self
    }

    /// Remove every key whose path starts with `prefix`.
    pub fn remove_prefix(&mut self, prefix: impl Into<String>) -> &mut Self {
        self.removals.push(prefix.into());
        self
    }

    pub fn commit(self) -> Result<()> {
        let mut inner = self.store.inner.lock().map_err(|_| VifError::Store("poisoned".into()))?;
        let mut touched_prefixes: Vec<String> = Vec::new();
        for prefix in &self.removals {
            inner.tree.retain(|k, _| !k.starts_with(prefix.as_str()));
            touched_prefixes.push(prefix.clone());
        }
        for (k, v) in &self.writes {
            inner.tree.insert(k.clone(), v.clone());
            touched_prefixes.push(k.clone());
        }
        drop(inner);
        self.store.fire_watches(&touched_prefixes);
        Ok(())
    }
}

struct Inner {
    tree: BTreeMap<String, String>,
    watches: Vec<(String, Sender<String>)>,
}

/// An in-memory hierarchical key/value store with watch support.
///
/// Stands in for the real cross-domain store transport; the frontend logic
/// only ever uses the interface below, so any real transport implementing
/// the same operations is a drop-in replacement.
pub struct Store {
    inner: Mutex<Inner>,
}

impl Default for Store {
    fn default() -> Self {
        Store::new()
    }
}

impl Store {
    pub fn new() -> Self {
        Store {
            inner: Mutex::new(Inner {
                tree: BTreeMap::new(),
                watches: Vec::new(),
            }),
        }
    }

    pub fn read(&self, key: &str) -> Option<String> {
        self.inner.lock().ok()?.tree.get(key).cloned()
    }

    pub fn read_or(&self, key: &str, default: &str) -> String {
        self.read(key).unwrap_or_else(|| default.to_string())
    }

    pub fn write(&self, key: impl Into<String>, value: impl Into<String>) -> Result<()> {
        let key = key.into();
        let value = value.into();
        {
            let mut inner = self.inner.lock().map_err(|_| VifError::Store("poisoned".into()))?;
            inner.tree.insert(key.clone(), value);
        }
        self.fire_watches(&[key]);
        Ok(())
    }

    pub fn remove(&self, key: &str) -> Result<()> {
        {
            let mut inner = self.inner.lock().map_err(|_| VifError::Store("poisoned".into()))?;
            inner.tree.remove(key);
        }
        self.fire_watches(&[key.to_string()]);
        Ok(())
    }

    /// List immediate children (one path segment) of `prefix`.
    pub fn list(&self, prefix: &str) -> Vec<String> {
        let inner = match self.inner.lock() {
            Ok(i) => i,
            Err(_) => return Vec::new(),
        };
        let prefix_slash = format!("{}/", prefix.trim_end_matches('/'));
        let mut out: Vec<String> = Vec::new();
        for k in inner.tree.keys() {
            if let Some(rest) = k.strip_prefix(&prefix_slash) {
                let child = rest.split('/').next().unwrap_or(rest);
                if !out.iter().any(|c| c == child) {
                    out.push(child.to_string());
                }
            }
        }
        out
    }

    pub fn transaction(&self) -> Transaction<'_> {
        Transaction {
            store: self,
            writes: Vec::new(),
            removals: Vec::new(),
        }
    }

    /// Register a watch on `prefix`; the returned receiver gets the written
    /// key every time a write or transaction touches something under it.
    pub fn watch(&self, prefix: impl Into<String>) -> Receiver<String> {
        let (tx, rx) = unbounded();
        if let Ok(mut inner) = self.inner.lock() {
            inner.watches.push((prefix.into(), tx));
        }
        rx
    }

    fn fire_watches(&self, touched: &[String]) {
        let inner = match self.inner.lock() {
            Ok(i) => i,
            Err(_) => return,
        };
        for key in touched {
            for (prefix, sender) in &inner.watches {
                if key.starts_with(prefix.as_str()) {
                    let _ = sender.send(key.clone());
                }
            }
        }
    }
}

/// A store scoped to a single path prefix, for convenient relative reads
/// and writes against e.g. `device/vif/eth0/...`.
#[derive(Clone)]
pub struct ScopedStore {
    store: Arc<Store>,
    base: String,
}

impl ScopedStore {
    pub fn new(store: Arc<Store>, base: impl Into<String>) -> Self {
        ScopedStore {
            store,
            base: base.into(),
        }
    }

    fn path(&self, rel: &str) -> String {
        if rel.is_empty() {
            self.base.clone()
        } else {
            format!("{}/{}", self.base, rel)
        }
    }

    pub fn read(&self, rel: &str) -> Option<String> {
        self.store.read(&self.path(rel))
    }

    pub fn write(&self, rel: &str, value: impl Into<String>) -> Result<()> {
        self.store.write(self.path(rel), value)
    }

    pub fn watch(&self, rel: &str) -> Receiver<String> {
        self.store.watch(self.path(rel))
    }

    pub fn transaction(&self) -> Transaction<'_> {
        self.store.transaction()
    }

    pub fn full_path(&self, rel: &str) -> String {
        self.path(rel)
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_read() {
        let store = Store::new();
        store.write("a/b", "1").unwrap();
        assert_eq!(store.read("a/b"), Some("1".to_string()));
    }

    #[test]
    fn test_watch_fires_on_write() {
        let store = Store::new();
        let rx = store.watch("backend");
        store.write("backend/state", "Connected").unwrap();
        let key = rx.recv_timeout(std::time::Duration::from_millis(100)).unwrap();
        assert_eq!(key, "backend/state");
    }

    #[test]
    fn test_transaction_atomic_remove_then_write() {
        let store = Store::new();
        store.write("data/vif/eth0/ipv4/0/addr", "10.0.0.5").unwrap();
        let mut txn = store.transaction();
        txn.remove_prefix("data/vif/eth0/ipv4/")
            .write("data/vif/eth0/ipv4/0/addr", "10.0.0.6");
        txn.commit().unwrap();
        assert_eq!(
            store.read("data/vif/eth0/ipv4/0/addr"),
            Some("10.0.0.6".to_string())
        );
    }

    #[test]
    fn test_list_children() {
        let store = Store::new();
        store.write("device/vif/eth0/state", "1").unwrap();
        store.write("device/vif/eth1/state", "1").unwrap();
        let mut children = store.list("device/vif");
        children.sort();
        assert_eq!(children, vec!["eth0".to_string(), "eth1".to_string()]);
    }

    #[test]
    fn test_scoped_store() {
        let store = Arc::new(Store::new());
        let scoped = ScopedStore::new(store.clone(), "device/vif/eth0");
        scoped.write("state", "2").unwrap();
        assert_eq!(store.read("device/vif/eth0/state"), Some("2".to_string()));
        assert_eq!(scoped.read("state"), Some("2".to_string()));
    }
}
