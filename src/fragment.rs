//! Fragment ids and descriptors.
//!
//! A fragment is the unit pushed onto a ring: one ring request, carrying
//! either a packet's own payload page, a bounce buffer, or a multicast
//! control record. Its id is the ring request slot identity the backend
//! echoes back in its response, drawn from a small range-set at
//! construction and returned at destruction so the `Pending` table can use
//! it as a dense array index instead of a hash key.

use crossbeam_queue::ArrayQueue;

use crate::grant::GrantHandle;

/// Fragment ids are 10-bit: valid range is `1..=MAX_FRAGMENT_ID`. Id 0 is
/// reserved (never issued) so it can serve as an explicit "no fragment"
/// sentinel in code that stores ids in a plain integer field.
pub const MAX_FRAGMENT_ID: u16 = 1023;

/// What a fragment's response ultimately completes: a caller packet
/// tracked in the ring's packet arena, or a synthesised control frame
/// (gratuitous ARP, neighbour advertisement, multicast add/remove) that
/// has no caller waiting on it.
#[derive(Debug, Clone, Copy)]
pub enum FragmentOwner {
    Packet(u32),
    Control,
}

pub struct Fragment {
    pub id: u16,
    pub grant: Option<GrantHandle>,
    pub offset: u16,
    pub len: u16,
    /// Set on the first fragment of a packet that carries a following
    /// extra-info side-band slot (GSO hint or multicast opcode).
    pub extra: bool,
    pub owner: FragmentOwner,
}

/// The range-set of available fragment ids, `[1, MAX_FRAGMENT_ID]`.
pub struct FragmentIdPool {
    free: ArrayQueue<u16>,
}

impl FragmentIdPool {
    pub fn new() -> Self {
        let free = ArrayQueue::new(MAX_FRAGMENT_ID as usize);
        for id in 1..=MAX_FRAGMENT_ID {
            let _ = free.push(id);
        }
        FragmentIdPool { free }
    }

    /// Pop one id, or `None` if the range-set is exhausted.
    pub fn pop(&self) -> Option<u16> {
        self.free.pop()
    }

    /// Return an id to the range-set. Callers must never return an id they
    /// didn't pop, and must never return the same id twice.
    pub fn put(&self, id: u16) {
        debug_assert!(id >= 1 && id <= MAX_FRAGMENT_ID);
        let _ = self.free.push(id);
    }

    pub fn available(&self) -> usize {
        self.free.len()
    }
}

impl Default for FragmentIdPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_exhausts_and_refills() {
        let pool = FragmentIdPool::new();
        assert_eq!(pool.available(), MAX_FRAGMENT_ID as usize);
        let id = pool.pop().unwrap();
        assert_eq!(pool.available(), MAX_FRAGMENT_ID as usize - 1);
        pool.put(id);
        assert_eq!(pool.available(), MAX_FRAGMENT_ID as usize);
    }

    #[test]
    fn test_ids_are_unique_until_returned() {
        let pool = FragmentIdPool::new();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..MAX_FRAGMENT_ID {
            let id = pool.pop().unwrap();
            assert!(seen.insert(id), "id {id} issued twice before return");
        }
        assert!(pool.pop().is_none());
    }
}
