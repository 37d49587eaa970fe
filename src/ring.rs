//! Shared single-producer/single-consumer ring.
//!
//! One page's worth of request slots and one page's worth of response
//! slots, each with its own producer index and a companion "event" index
//! the other side bumps to ask for a notification only when production
//! crosses a threshold rather than on every single slot. The frontend-
//! private `req_prod_pvt`/`rsp_cons` counters live on the ring's owner
//! (`TxRing`/`RxRing`), not here — this type only holds what both domains
//! can see.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, Ordering, fence};

use crate::wire::{REQUEST_SIZE, RESPONSE_SIZE, Response, TxRequest};

struct ReqSlot(UnsafeCell<[u8; REQUEST_SIZE]>);
// SAFETY: only the producer writes a given index, and only after it has
// advanced past the point where the consumer could still be reading it;
// the opposite holds for reads. See `SharedRing`'s module doc.
unsafe impl Sync for ReqSlot {}

struct RspSlot(UnsafeCell<[u8; RESPONSE_SIZE]>);
unsafe impl Sync for RspSlot {}

/// The half of ring state visible to both the frontend and the backend.
pub struct SharedRing {
    capacity: u32,
    req_slots: Box<[ReqSlot]>,
    rsp_slots: Box<[RspSlot]>,
    req_prod: AtomicU32,
    req_event: AtomicU32,
    rsp_prod: AtomicU32,
    rsp_event: AtomicU32,
}

impl SharedRing {
    pub fn new(capacity: u32) -> Self {
        let req_slots = (0..capacity)
            .map(|_| ReqSlot(UnsafeCell::new([0u8; REQUEST_SIZE])))
            .collect();
        let rsp_slots = (0..capacity)
            .map(|_| RspSlot(UnsafeCell::new([0u8; RESPONSE_SIZE])))
            .collect();
        SharedRing {
            capacity,
            req_slots,
            rsp_slots,
            req_prod: AtomicU32::new(0),
            req_event: AtomicU32::new(1),
            rsp_prod: AtomicU32::new(0),
            rsp_event: AtomicU32::new(1),
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Reset all indices to zero. Used when tearing a connection down.
    pub fn reset(&self) {
        self.req_prod.store(0, Ordering::Relaxed);
        self.req_event.store(1, Ordering::Relaxed);
        self.rsp_prod.store(0, Ordering::Relaxed);
        self.rsp_event.store(1, Ordering::Relaxed);
    }

    // ---- producer of requests (frontend TX, or frontend RX posting fill buffers) ----

    pub fn write_request(&self, index: u32, req: TxRequest) {
        let slot = &self.req_slots[(index % self.capacity) as usize];
        unsafe { *slot.0.get() = req.to_bytes() };
    }

    /// Publish `req_prod_pvt` as the new `req_prod`, with the full barrier
    /// the protocol requires between writing slot contents and advancing
    /// the index that makes them visible.
    pub fn publish_req_prod(&self, req_prod_pvt: u32) {
        fence(Ordering::SeqCst);
        self.req_prod.store(req_prod_pvt, Ordering::Release);
    }

    pub fn req_prod(&self) -> u32 {
        self.req_prod.load(Ordering::Acquire)
    }

    pub fn req_event(&self) -> u32 {
        self.req_event.load(Ordering::Acquire)
    }

    pub fn set_req_event(&self, value: u32) {
        self.req_event.store(value, Ordering::Release);
    }

    // ---- consumer of requests (the simulated backend peer) ----

    pub fn read_request(&self, index: u32) -> TxRequest {
        let slot = &self.req_slots[(index % self.capacity) as usize];
        TxRequest::from_bytes(unsafe { &*slot.0.get() })
    }

    // ---- producer of responses (the simulated backend peer) ----

    pub fn write_response(&self, index: u32, rsp: Response) {
        let slot = &self.rsp_slots[(index % self.capacity) as usize];
        unsafe { *slot.0.get() = rsp.to_bytes() };
    }

    pub fn publish_rsp_prod(&self, rsp_prod: u32) {
        fence(Ordering::SeqCst);
        self.rsp_prod.store(rsp_prod, Ordering::Release);
    }

    pub fn rsp_event(&self) -> u32 {
        self.rsp_event.load(Ordering::Acquire)
    }

    pub fn set_rsp_event(&self, value: u32) {
        self.rsp_event.store(value, Ordering::Release);
    }

    // ---- consumer of responses (the frontend ring) ----

    pub fn read_response(&self, index: u32) -> Response {
        let slot = &self.rsp_slots[(index % self.capacity) as usize];
        Response::from_bytes(unsafe { &*slot.0.get() })
    }

    pub fn rsp_prod(&self) -> u32 {
        self.rsp_prod.load(Ordering::Acquire)
    }
}

// SAFETY: `SharedRing` is handed out as `Arc<SharedRing>` to exactly one
// producer thread and one consumer thread per direction; the atomics order
// index publication against slot contents.
unsafe impl Send for SharedRing {}
unsafe impl Sync for SharedRing {}

/// Classic ring notify-threshold check: does bumping the producer index
/// from `old_prod` to `new_prod` cross the point the other side asked to
/// be woken at (`event`)? Wrapping-safe.
pub fn needs_notify(old_prod: u32, new_prod: u32, event: u32) -> bool {
    new_prod.wrapping_sub(event) < new_prod.wrapping_sub(old_prod)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{FLAG_MORE_DATA, STATUS_OKAY};

    #[test]
    fn test_request_round_trip_through_ring() {
        let ring = SharedRing::new(8);
        let req = TxRequest {
            id: 3,
            gref: 99,
            offset: 0,
            flags: FLAG_MORE_DATA,
            size: 512,
        };
        ring.write_request(0, req);
        ring.publish_req_prod(1);
        assert_eq!(ring.req_prod(), 1);
        assert_eq!(ring.read_request(0), req);
    }

    #[test]
    fn test_response_round_trip_through_ring() {
        let ring = SharedRing::new(8);
        let rsp = Response { id: 3, status: STATUS_OKAY };
        ring.write_response(0, rsp);
        ring.publish_rsp_prod(1);
        assert_eq!(ring.rsp_prod(), 1);
        assert_eq!(ring.read_response(0), rsp);
    }

    #[test]
    fn test_needs_notify_threshold() {
        // event sits strictly between old and new production -> notify
        assert!(needs_notify(0, 10, 5));
        // event was already passed -> no notify needed
        assert!(!needs_notify(10, 12, 5));
        // no progress -> no notify
        assert!(!needs_notify(5, 5, 5));
    }

    #[test]
    fn test_ring_indices_wrap_around_capacity() {
        let ring = SharedRing::new(4);
        let req = TxRequest { id: 1, gref: 1, offset: 0, flags: 0, size: 10 };
        ring.write_request(4, req); // index 4 wraps to slot 0
        assert_eq!(ring.read_request(0), req);
    }
}
