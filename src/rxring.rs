//! The receive ring: posting fill buffers for the backend to write
//! incoming packets into, and delivering completed ones to the caller.
//!
//! Structurally the mirror image of [`crate::txring::TxRing`]: instead of
//! a caller handing packets in, the ring itself is the producer of
//! requests (empty buffers offered up) and the backend is the one that
//! fills them and posts responses. A response's `status` field pulls
//! double duty here the same way the classic netif wire format does: a
//! non-negative value is the received byte count, a negative one is an
//! error/drop code.

use std::sync::Arc;
use std::sync::Mutex;

use crate::buffer::{BufferPool, PoolBuffer};
use crate::config::DriverConfig;
use crate::error::{Result, VifError};
use crate::eventchannel::EventChannel;
use crate::fragment::{FragmentIdPool, MAX_FRAGMENT_ID};
use crate::grant::{Access, GrantHandle, GrantTable};
use crate::headers;
use crate::packet::RxPacket;
use crate::ring::{SharedRing, needs_notify};
use crate::stats::{Destination, RingStatistics, Side};
use crate::wire::{Response, STATUS_DROPPED, STATUS_ERROR, TxRequest};

struct Posted {
    buffer: PoolBuffer,
    grant: GrantHandle,
}

struct Inner {
    posted: Vec<Option<Posted>>,
    req_prod_pvt: u32,
    rsp_cons: u32,
    connected: bool,
    enabled: bool,
    delivered: Vec<RxPacket>,
}

/// Per-queue receive ring state.
pub struct RxRing {
    shared: Arc<SharedRing>,
    grants: Arc<dyn GrantTable>,
    backend_domain: u16,
    events: Arc<dyn EventChannel>,
    buffer_pool: Arc<BufferPool>,
    fragment_ids: FragmentIdPool,
    inner: Mutex<Inner>,
    stats: Arc<RingStatistics>,
}

impl RxRing {
    pub fn new(
        config: DriverConfig,
        grants: Arc<dyn GrantTable>,
        backend_domain: u16,
        events: Arc<dyn EventChannel>,
        buffer_pool: Arc<BufferPool>,
        stats: Arc<RingStatistics>,
    ) -> Self {
        RxRing {
            shared: Arc::new(SharedRing::new(config.ring_capacity as u32)),
            grants,
            backend_domain,
            events,
            buffer_pool,
            fragment_ids: FragmentIdPool::new(),
            inner: Mutex::new(Inner {
                posted: (0..=MAX_FRAGMENT_ID as usize).map(|_| None).collect(),
                req_prod_pvt: 0,
                rsp_cons: 0,
                connected: false,
                enabled: false,
                delivered: Vec::new(),
            }),
            stats,
        }
    }

    pub fn shared_ring(&self) -> &Arc<SharedRing> {
        &self.shared
    }

    pub fn set_connected(&self, connected: bool) {
        self.inner.lock().unwrap().connected = connected;
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.inner.lock().unwrap().enabled = enabled;
    }

    /// Post as many fresh fill buffers as there is ring room and spare
    /// pool capacity for. Call this after construction and again after
    /// every [`RxRing::poll`] that delivered packets.
    pub fn fill(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.enabled {
            return Ok(());
        }
        let available = self.shared.capacity().wrapping_sub(inner.req_prod_pvt.wrapping_sub(inner.rsp_cons));
        let mut posted_any = false;
        for _ in 0..available {
            let Some(buffer) = self.buffer_pool.alloc() else { break };
            let Some(id) = self.fragment_ids.pop() else { break };
            let grant = match GrantHandle::new(self.grants.clone(), self.backend_domain, id as u64, Access::ReadWrite) {
                Ok(g) => g,
                Err(e) => {
                    self.fragment_ids.put(id);
                    return Err(e);
                }
            };
            let req = TxRequest { id, gref: grant.grant_ref(), offset: 0, flags: 0, size: crate::buffer::PAGE_SIZE as u16 };
            self.shared.write_request(inner.req_prod_pvt, req);
            inner.posted[id as usize] = Some(Posted { buffer, grant });
            inner.req_prod_pvt = inner.req_prod_pvt.wrapping_add(1);
            posted_any = true;
        }
        if posted_any {
            let old_prod = self.shared.req_prod();
            self.shared.publish_req_prod(inner.req_prod_pvt);
            if needs_notify(old_prod, inner.req_prod_pvt, self.shared.req_event()) {
                let _ = self.events.notify();
            }
        }
        Ok(())
    }

    /// Process available responses, copying completed buffers into
    /// delivered packets. Automatically tops the ring back up with fresh
    /// fill buffers before returning.
    pub fn poll(&self) -> Vec<RxPacket> {
        {
            let mut inner = self.inner.lock().unwrap();
            let rsp_prod = self.shared.rsp_prod();
            while inner.rsp_cons != rsp_prod {
                let idx = inner.rsp_cons;
                let response = self.shared.read_response(idx);
                inner.rsp_cons = inner.rsp_cons.wrapping_add(1);

                let Some(mut posted) = inner.posted[response.id as usize].take() else {
                    continue;
                };
                self.fragment_ids.put(response.id);

                if response.status == STATUS_ERROR {
                    self.stats.rx.record_completion(Side::Receiver, Destination::Unicast, crate::packet::CompletionStatus::Error, 0);
                    continue;
                }
                if response.status == STATUS_DROPPED || response.status < 0 {
                    self.stats.rx.record_completion(Side::Receiver, Destination::Unicast, crate::packet::CompletionStatus::Dropped, 0);
                    continue;
                }

                let len = (response.status as usize).min(crate::buffer::PAGE_SIZE);
                posted.buffer.set_len(len);
                let data = posted.buffer.data().to_vec();
                let dest = headers::parse_header(&data).dest_mac;
                let destination = Destination::classify(&dest);
                self.stats.rx.record_completion(Side::Receiver, destination, crate::packet::CompletionStatus::Ok, len as u64);
                inner.delivered.push(RxPacket { data, destination });
            }
            let window = self.shared.capacity().max(1) / 4;
            self.shared.set_rsp_event(inner.rsp_cons.wrapping_add(window.max(1)));
        }
        let _ = self.fill();
        let mut inner = self.inner.lock().unwrap();
        std::mem::take(&mut inner.delivered)
    }

    /// Disable the ring and release any outstanding fill buffers. If the
    /// backend is still connected this just stops posting further fill
    /// buffers; real in-flight responses are still drained by a final
    /// `poll`.
    pub fn disable(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.enabled = false;
        if !inner.connected {
            for (id, slot) in inner.posted.iter_mut().enumerate() {
                if slot.take().is_some() {
                    self.fragment_ids.put(id as u16);
                }
            }
            self.shared.reset();
            inner.req_prod_pvt = 0;
            inner.rsp_cons = 0;
        }
    }

    pub fn stats(&self) -> &Arc<RingStatistics> {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eventchannel::SimEventChannel;
    use crate::grant::SimGrantTable;
    use crate::wire::STATUS_OKAY;

    fn make_ring(capacity: usize) -> RxRing {
        let config = DriverConfig::builder().ring_capacity(capacity).build();
        RxRing::new(
            config,
            Arc::new(SimGrantTable::new()),
            0,
            SimEventChannel::new(),
            BufferPool::new(64),
            Arc::new(RingStatistics::new(1)),
        )
    }

    #[test]
    fn test_fill_posts_buffers_up_to_capacity() {
        let ring = make_ring(8);
        ring.set_enabled(true);
        ring.fill().unwrap();
        let inner = ring.inner.lock().unwrap();
        assert_eq!(inner.req_prod_pvt, 8);
    }

    #[test]
    fn test_poll_delivers_completed_packet() {
        let ring = make_ring(8);
        ring.set_enabled(true);
        ring.set_connected(true);
        ring.fill().unwrap();
        let req = ring.shared_ring().read_request(0);
        let payload = vec![0xAAu8; 20];
        {
            // simulate the backend writing received bytes directly into the
            // granted page before posting its response
            let mut inner = ring.inner.lock().unwrap();
            let posted = inner.posted[req.id as usize].as_mut().unwrap();
            posted.buffer.write_area()[..payload.len()].copy_from_slice(&payload);
        }
        ring.shared.write_response(0, Response { id: req.id, status: payload.len() as i16 });
        let _ = STATUS_OKAY;
        ring.shared.publish_rsp_prod(1);
        let delivered = ring.poll();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].data, payload);
    }

    #[test]
    fn test_disable_when_backend_gone_releases_fragment_ids() {
        let ring = make_ring(8);
        ring.set_enabled(true);
        ring.fill().unwrap();
        assert_eq!(ring.fragment_ids.available(), (MAX_FRAGMENT_ID as usize) - 8);
        ring.disable();
        assert_eq!(ring.fragment_ids.available(), MAX_FRAGMENT_ID as usize);
    }
}
