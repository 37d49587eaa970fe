//! Grant-table abstraction.
//!
//! A grant permits the backend domain temporary read (or read-write) access
//! to one page of frontend memory. The real primitive lives in the
//! hypervisor; here it is a trait so the ring logic can be driven against a
//! simulated table in tests. A [`GrantHandle`] ties the grant's lifetime to
//! an RAII guard exactly the way the hugepage mapping elsewhere in this
//! codebase ties an mmap's lifetime to its owning struct's `Drop` impl: the
//! grant is revoked automatically if a ring forgets to do it explicitly
//! after observing the backend's response.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{Result, VifError};

pub type GrantRef = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    ReadOnly,
    ReadWrite,
}

/// Backend domain + page-sharing capability manager.
pub trait GrantTable: Send + Sync {
    /// Permit the given backend domain to access `page_id` (an opaque
    /// identifier for the frontend page being shared) with the given
    /// access mode. Returns a grant reference the backend can resolve.
    fn permit(&self, backend_domain: u16, page_id: u64, access: Access) -> Result<GrantRef>;

    /// Revoke a previously permitted grant reference.
    fn revoke(&self, grant_ref: GrantRef) -> Result<()>;
}

/// A live grant, revoked on drop.
pub struct GrantHandle {
    table: Arc<dyn GrantTable>,
    grant_ref: GrantRef,
    revoked: bool,
}

impl GrantHandle {
    pub fn new(table: Arc<dyn GrantTable>, backend_domain: u16, page_id: u64, access: Access) -> Result<Self> {
        let grant_ref = table.permit(backend_domain, page_id, access)?;
        Ok(GrantHandle {
            table,
            grant_ref,
            revoked: false,
        })
    }

    pub fn grant_ref(&self) -> GrantRef {
        self.grant_ref
    }

    /// Revoke explicitly, observing any error instead of swallowing it at
    /// drop time.
    pub fn revoke(mut self) -> Result<()> {
        self.revoked = true;
        self.table.revoke(self.grant_ref)
    }
}

impl Drop for GrantHandle {
    fn drop(&mut self) {
        if !self.revoked {
            let _ = self.table.revoke(self.grant_ref);
        }
    }
}

/// In-memory grant table for tests and the demo binary: hands out
/// monotonically increasing references and tracks which are outstanding.
pub struct SimGrantTable {
    next_ref: AtomicU32,
    outstanding: Mutex<std::collections::HashSet<GrantRef>>,
}

impl Default for SimGrantTable {
    fn default() -> Self {
        SimGrantTable {
            next_ref: AtomicU32::new(1),
            outstanding: Mutex::new(std::collections::HashSet::new()),
        }
    }
}

impl SimGrantTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn outstanding_count(&self) -> usize {
        self.outstanding.lock().unwrap().len()
    }
}

impl GrantTable for SimGrantTable {
    fn permit(&self, _backend_domain: u16, _page_id: u64, _access: Access) -> Result<GrantRef> {
        let r = self.next_ref.fetch_add(1, Ordering::Relaxed);
        self.outstanding.lock().unwrap().insert(r);
        Ok(r)
    }

    fn revoke(&self, grant_ref: GrantRef) -> Result<()> {
        if self.outstanding.lock().unwrap().remove(&grant_ref) {
            Ok(())
        } else {
            Err(VifError::Grant(format!("double revoke of {grant_ref}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grant_and_revoke() {
        let table = Arc::new(SimGrantTable::new());
        {
            let handle = GrantHandle::new(table.clone(), 0, 42, Access::ReadOnly).unwrap();
            assert_eq!(table.outstanding_count(), 1);
            let _ = handle.grant_ref();
        }
        assert_eq!(table.outstanding_count(), 0);
    }

    #[test]
    fn test_explicit_revoke() {
        let table = Arc::new(SimGrantTable::new());
        let handle = GrantHandle::new(table.clone(), 0, 1, Access::ReadWrite).unwrap();
        handle.revoke().unwrap();
        assert_eq!(table.outstanding_count(), 0);
    }
}
