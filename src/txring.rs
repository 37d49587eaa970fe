//! The transmit ring: packet queueing, preparation, posting, and response
//! handling for one queue of the frontend.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::Mutex;

use crate::buffer::{BufferPool, PAGE_SIZE, PoolBuffer};
use crate::config::{DriverConfig, PayloadPolicy};
use crate::error::{Result, VifError};
use crate::eventchannel::EventChannel;
use crate::fragment::{Fragment, FragmentIdPool, FragmentOwner, MAX_FRAGMENT_ID};
use crate::grant::{Access, GrantHandle, GrantTable};
use crate::headers::{self, ETHERNET_MIN};
use crate::lock::FusedStash;
use crate::packet::{CompletionInfo, CompletionStatus, MulticastAction, MulticastControl, Packet};
use crate::ring::{SharedRing, needs_notify};
use crate::stats::{Counter, Destination, RingStatistics, Side};
use crate::wire::{
    EXTRA_INFO_SIZE, ExtraInfoKind, FLAG_CSUM_BLANK, FLAG_DATA_VALIDATED, FLAG_EXTRA_INFO,
    FLAG_MORE_DATA, GsoType, Response, STATUS_DROPPED, STATUS_ERROR, STATUS_NULL, STATUS_OKAY,
    TxRequest,
};

/// Per-packet ring-slot budget. A packet whose grant path would need more
/// fragments than this must fall back to copying (or fail outright under
/// a pure `Grant` policy).
pub const NR_SLOTS_MIN: usize = 18;

enum ControlRequest {
    GratuitousArp { sender_ip: [u8; 4], sender_mac: [u8; 6] },
    NeighbourAdvertisement { target_ip: [u8; 16], target_mac: [u8; 6] },
    Multicast(MulticastControl),
}

struct FragmentPlan {
    fragment: Fragment,
    wire_size: u16,
}

struct InProgress {
    fragments: VecDeque<FragmentPlan>,
    extra: Option<ExtraInfoKind>,
    csum_flags: u16,
    total_len: u32,
    first_not_posted: bool,
}

struct Inner {
    packets: HashMap<u32, Packet>,
    /// Bounce buffers backing header and copied-payload fragments, keyed
    /// by the fragment's ring id (unique while the fragment is in flight).
    buffers: HashMap<u16, PoolBuffer>,
    next_packet_id: u32,

    packet_queue: VecDeque<Packet>,
    request_queue: VecDeque<ControlRequest>,
    pending: Vec<Option<Fragment>>,
    in_progress: Option<InProgress>,

    req_prod_pvt: u32,
    rsp_cons: u32,
    stopped: bool,
    connected: bool,
    enabled: bool,

    complete: Vec<(Packet, CompletionInfo)>,

    requests_posted: u64,
    requests_pushed: u64,
    responses_processed: u64,
    packets_queued: u64,
    packets_prepared: u64,
    packets_copied: u64,
    packets_granted: u64,
    packets_faked: u64,
    packets_sent: u64,
    packets_completed: u64,
    packets_unprepared: u64,
}

impl Inner {
    fn new() -> Self {
        Inner {
            packets: HashMap::new(),
            buffers: HashMap::new(),
            next_packet_id: 1,
            packet_queue: VecDeque::new(),
            request_queue: VecDeque::new(),
            pending: (0..=MAX_FRAGMENT_ID as usize).map(|_| None).collect(),
            in_progress: None,
            req_prod_pvt: 0,
            rsp_cons: 0,
            stopped: false,
            connected: false,
            enabled: false,
            complete: Vec::new(),
            requests_posted: 0,
            requests_pushed: 0,
            responses_processed: 0,
            packets_queued: 0,
            packets_prepared: 0,
            packets_copied: 0,
            packets_granted: 0,
            packets_faked: 0,
            packets_sent: 0,
            packets_completed: 0,
            packets_unprepared: 0,
        }
    }

    fn next_packet_id(&mut self) -> u32 {
        let id = self.next_packet_id;
        self.next_packet_id = self.next_packet_id.wrapping_add(1).max(1);
        id
    }
}

/// Per-queue transmit ring state.
pub struct TxRing {
    config: DriverConfig,
    shared: Arc<SharedRing>,
    grants: Arc<dyn GrantTable>,
    backend_domain: u16,
    events: Arc<dyn EventChannel>,
    buffer_pool: Arc<BufferPool>,
    fragment_ids: FragmentIdPool,
    stash: FusedStash<Packet>,
    inner: Mutex<Inner>,
    stats: Arc<RingStatistics>,
}

impl TxRing {
    pub fn new(
        config: DriverConfig,
        grants: Arc<dyn GrantTable>,
        backend_domain: u16,
        events: Arc<dyn EventChannel>,
        buffer_pool: Arc<BufferPool>,
        stats: Arc<RingStatistics>,
    ) -> Self {
        let capacity = config.ring_capacity;
        TxRing {
            shared: Arc::new(SharedRing::new(capacity as u32)),
            config,
            grants,
            backend_domain,
            events,
            buffer_pool,
            fragment_ids: FragmentIdPool::new(),
            stash: FusedStash::new(),
            inner: Mutex::new(Inner::new()),
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

    pub fn is_enabled(&self) -> bool {
        self.inner.lock().unwrap().enabled
    }

    /// Lock-free enqueue. Returns completed packets if this call happened
    /// to become the drainer, otherwise an empty vector (some other
    /// in-flight caller will return them).
    pub fn queue_packets(&self, packets: Vec<Packet>) -> Vec<(Packet, CompletionInfo)> {
        let mut became_drainer = false;
        for packet in packets {
            if self.stash.push_and_try_acquire(packet) {
                became_drainer = true;
            }
        }
        if !became_drainer {
            return Vec::new();
        }
        self.release_lock()
    }

    fn release_lock(&self) -> Vec<(Packet, CompletionInfo)> {
        loop {
            {
                let mut inner = self.inner.lock().unwrap();
                self.stash.drain(|packet| {
                    inner.packets_queued += 1;
                    inner.packet_queue.push_back(packet);
                });
                self.schedule(&mut inner);
            }
            if self.stash.try_release() {
                break;
            }
        }
        let mut inner = self.inner.lock().unwrap();
        std::mem::take(&mut inner.complete)
    }

    pub fn queue_arp(&self, sender_ip: [u8; 4], sender_mac: [u8; 6]) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.enabled {
            return Err(VifError::InvalidState);
        }
        inner.request_queue.push_back(ControlRequest::GratuitousArp { sender_ip, sender_mac });
        self.schedule(&mut inner);
        Ok(())
    }

    pub fn queue_neighbour_advertisement(&self, target_ip: [u8; 16], target_mac: [u8; 6]) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.enabled {
            return Err(VifError::InvalidState);
        }
        inner
            .request_queue
            .push_back(ControlRequest::NeighbourAdvertisement { target_ip, target_mac });
        self.schedule(&mut inner);
        Ok(())
    }

    pub fn queue_multicast_control(&self, control: MulticastControl, feature_supported: bool) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.enabled {
            return Err(VifError::InvalidState);
        }
        if !feature_supported {
            return Err(VifError::FeatureMissing("feature-multicast-control"));
        }
        inner.request_queue.push_back(ControlRequest::Multicast(control));
        self.schedule(&mut inner);
        Ok(())
    }

    fn schedule(&self, inner: &mut Inner) {
        loop {
            if inner.in_progress.is_some() && !self.try_post_in_progress(inner) {
                break;
            }
            if inner.in_progress.is_some() {
                continue;
            }
            if let Some(control) = inner.request_queue.pop_front() {
                match self.prepare_control(inner, control) {
                    Ok(ip) => inner.in_progress = Some(ip),
                    Err(_) => continue,
                }
            } else if let Some(packet) = inner.packet_queue.pop_front() {
                match self.prepare_packet(inner, packet) {
                    Ok(ip) => inner.in_progress = Some(ip),
                    Err((packet, reason)) => {
                        // Fake that we prepared and sent this packet so
                        // PacketsSent/PacketsPrepared stay in step with
                        // PacketsUnprepared; the caller still sees a
                        // dropped completion.
                        inner.packets_unprepared += 1;
                        inner.packets_prepared += 1;
                        inner.packets_sent += 1;
                        inner.packets_faked += 1;
                        let mut completion = make_completion(&packet);
                        let _ = reason;
                        completion.status = CompletionStatus::Dropped;
                        self.stats.tx.inc(Counter::FrontendErrors);
                        self.stats.tx.record_completion(
                            Side::Transmitter,
                            completion.destination,
                            completion.status,
                            completion.packet_length as u64,
                        );
                        inner.complete.push((packet, completion));
                        continue;
                    }
                }
            } else {
                break;
            }
        }
        self.push_and_notify(inner);
    }

    fn available_slots(&self, inner: &Inner) -> u32 {
        self.shared.capacity() - inner.req_prod_pvt.wrapping_sub(inner.rsp_cons)
    }

    /// Returns `false` if the ring filled up before the in-progress packet
    /// could be fully posted (caller must stop scheduling more work).
    fn try_post_in_progress(&self, inner: &mut Inner) -> bool {
        let Some(mut ip) = inner.in_progress.take() else {
            return true;
        };
        loop {
            if ip.first_not_posted {
                let needed = 1 + ip.extra.is_some() as u32;
                if self.available_slots(inner) < needed {
                    inner.in_progress = Some(ip);
                    inner.stopped = true;
                    return false;
                }
                let plan = ip.fragments.pop_front().expect("prepared packet has no fragments");
                let is_last = ip.fragments.is_empty();
                let mut flags = ip.csum_flags;
                if !is_last {
                    flags |= FLAG_MORE_DATA;
                }
                if ip.extra.is_some() {
                    flags |= FLAG_EXTRA_INFO;
                }
                self.post_fragment(inner, plan, flags, Some(ip.total_len));
                ip.first_not_posted = false;
                if let Some(extra) = ip.extra.take() {
                    self.shared.write_request_raw(inner.req_prod_pvt, extra.to_bytes());
                    inner.req_prod_pvt = inner.req_prod_pvt.wrapping_add(1);
                    inner.requests_posted += 1;
                }
                if ip.fragments.is_empty() {
                    inner.packets_sent += 1;
                    return true;
                }
            } else {
                if self.available_slots(inner) < 1 {
                    inner.in_progress = Some(ip);
                    inner.stopped = true;
                    return false;
                }
                let plan = ip.fragments.pop_front().expect("prepared packet has no fragments");
                let is_last = ip.fragments.is_empty();
                let flags = if is_last { 0 } else { FLAG_MORE_DATA };
                self.post_fragment(inner, plan, flags, None);
                if is_last {
                    inner.packets_sent += 1;
                    return true;
                }
            }
        }
    }

    fn post_fragment(&self, inner: &mut Inner, plan: FragmentPlan, flags: u16, size_override: Option<u32>) {
        let gref = plan.fragment.grant.as_ref().map(|g| g.grant_ref()).unwrap_or(0);
        let size = size_override.map(|t| t.min(u16::MAX as u32) as u16).unwrap_or(plan.wire_size);
        let id = plan.fragment.id;
        let req = TxRequest { id, gref, offset: plan.fragment.offset, flags, size };
        self.shared.write_request(inner.req_prod_pvt, req);
        inner.pending[id as usize] = Some(plan.fragment);
        inner.req_prod_pvt = inner.req_prod_pvt.wrapping_add(1);
        inner.requests_posted += 1;
    }

    fn push_and_notify(&self, inner: &mut Inner) {
        if inner.requests_posted == inner.requests_pushed {
            return;
        }
        let old_prod = self.shared.req_prod();
        self.shared.publish_req_prod(inner.req_prod_pvt);
        inner.requests_pushed = inner.requests_posted;
        if needs_notify(old_prod, inner.req_prod_pvt, self.shared.req_event()) {
            let _ = self.events.notify();
        }
    }

    fn prepare_packet(&self, inner: &mut Inner, mut packet: Packet) -> std::result::Result<InProgress, (Packet, VifError)> {
        let mut info = headers::parse_header(&packet.header);
        let total_len_unpadded = packet.total_len();
        let lso = packet.send_info.lso_tcp4 || packet.send_info.lso_tcp6;

        if !lso && total_len_unpadded > 1514 {
            return Err((packet, VifError::PacketTooLarge));
        }

        let mut header_bytes = packet.header.clone();
        if let Some(tci) = packet.send_info.vlan_tag {
            headers::insert_vlan_tag(&mut header_bytes, tci);
            // Inserting the tag shifts everything from the ethertype field
            // onward by VLAN_TAG_LEN bytes; the cached offsets must follow.
            info.eth_len += headers::VLAN_TAG_LEN;
            info.l3_offset += headers::VLAN_TAG_LEN;
            info.l4_offset += headers::VLAN_TAG_LEN;
            info.header_len += headers::VLAN_TAG_LEN;
        }

        let mut csum_flags = 0u16;
        let mut extra = None;

        if packet.send_info.lso_tcp4 && info.is_tcp {
            let total_l3_len = (header_bytes.len() - info.l3_offset) as u16;
            header_bytes[info.l3_offset + 2..info.l3_offset + 4].copy_from_slice(&total_l3_len.to_be_bytes());
            let tcp_len = (header_bytes.len() - info.l4_offset) as u16;
            headers::fixup_ipv4_tcp_pseudo_checksum(&mut header_bytes, info.l3_offset, info.l3_header_len, info.l4_offset, tcp_len);
            csum_flags |= FLAG_CSUM_BLANK | FLAG_DATA_VALIDATED;
            if packet.send_info.mss as usize != packet.payload_len() {
                extra = Some(ExtraInfoKind::Gso { gso_type: GsoType::Tcpv4, size: packet.send_info.mss });
            }
            headers::fixup_ipv4_header_checksum(&mut header_bytes, info.l3_offset, info.l3_header_len);
        } else if packet.send_info.lso_tcp6 && info.is_tcp {
            let payload_len = (header_bytes.len() - info.l4_offset) as u32;
            header_bytes[info.l3_offset + 4..info.l3_offset + 6].copy_from_slice(&(payload_len as u16).to_be_bytes());
            headers::fixup_ipv6_tcp_pseudo_checksum(&mut header_bytes, info.l3_offset, info.l4_offset, payload_len);
            csum_flags |= FLAG_DATA_VALIDATED;
            if packet.send_info.mss as usize != packet.payload_len() {
                extra = Some(ExtraInfoKind::Gso { gso_type: GsoType::Tcpv6, size: packet.send_info.mss });
            }
        } else if packet.send_info.offload_ip4_header_checksum && info.l3_kind == headers::L3Kind::Ipv4 {
            headers::fixup_ipv4_header_checksum(&mut header_bytes, info.l3_offset, info.l3_header_len);
        }

        let runt = total_len_unpadded < ETHERNET_MIN;
        let policy = if runt { PayloadPolicy::Copy } else { self.config.payload_policy };

        let plan = match self.plan_payload(&packet, policy) {
            Ok(p) => p,
            Err(e) => return Err((packet, e)),
        };
        let is_copy = matches!(plan, PayloadPlan::Copied(_));

        let packet_id = inner.next_packet_id();

        let mut header_buf = match self.buffer_pool.alloc() {
            Some(b) => b,
            None => return Err((packet, VifError::OutOfResources)),
        };
        header_buf.extend(&header_bytes);
        if runt {
            let total_padded = ETHERNET_MIN.min(PAGE_SIZE);
            if header_buf.len < total_padded && packet.payload_len() == 0 {
                header_buf.pad_to(total_padded);
            }
        }

        let header_fragment_id = match self.fragment_ids.pop() {
            Some(id) => id,
            None => return Err((packet, VifError::OutOfResources)),
        };
        let grant = match GrantHandle::new(self.grants.clone(), self.backend_domain, header_fragment_id as u64, Access::ReadOnly) {
            Ok(g) => g,
            Err(e) => {
                self.fragment_ids.put(header_fragment_id);
                return Err((packet, e));
            }
        };
        let header_len = header_buf.len as u16;
        inner.buffers.insert(header_fragment_id, header_buf);

        let mut fragments = VecDeque::new();
        fragments.push_back(FragmentPlan {
            fragment: Fragment {
                id: header_fragment_id,
                grant: Some(grant),
                offset: 0,
                len: header_len,
                extra: extra.is_some(),
                owner: FragmentOwner::Packet(packet_id),
            },
            wire_size: header_len,
        });

        let chunks = match plan {
            PayloadPlan::Granted(c) | PayloadPlan::Copied(c) => c,
        };
        let last_index = chunks.len().checked_sub(1);
        for (i, chunk) in chunks.into_iter().enumerate() {
            let id = match self.fragment_ids.pop() {
                Some(id) => id,
                None => return Err((packet, VifError::OutOfResources)),
            };
            let grant = match GrantHandle::new(self.grants.clone(), self.backend_domain, id as u64, Access::ReadOnly) {
                Ok(g) => g,
                Err(e) => {
                    self.fragment_ids.put(id);
                    return Err((packet, e));
                }
            };
            let mut len = chunk.len() as u16;
            if is_copy {
                let mut buf = match self.buffer_pool.alloc() {
                    Some(b) => b,
                    None => return Err((packet, VifError::OutOfResources)),
                };
                buf.extend(&chunk);
                if runt && Some(i) == last_index {
                    let padded = total_len_unpadded.max(ETHERNET_MIN) - (header_len as usize);
                    buf.pad_to(padded.min(PAGE_SIZE));
                    len = buf.len as u16;
                }
                inner.buffers.insert(id, buf);
            }
            fragments.push_back(FragmentPlan {
                fragment: Fragment { id, grant: Some(grant), offset: 0, len, extra: false, owner: FragmentOwner::Packet(packet_id) },
                wire_size: len,
            });
        }

        if is_copy {
            inner.packets_copied += 1;
        } else {
            inner.packets_granted += 1;
        }
        inner.packets_prepared += 1;

        let total_len = fragments.iter().map(|f| f.wire_size as u32).sum::<u32>();
        let dest = Destination::classify(&info.dest_mac);
        packet.completion = CompletionInfo {
            destination: dest,
            status: CompletionStatus::Pending,
            packet_length: total_len,
            payload_length: packet.payload_len() as u32,
        };
        packet.outstanding = fragments.len() as u32;
        inner.packets.insert(packet_id, packet);

        Ok(InProgress {
            fragments,
            extra,
            csum_flags,
            total_len,
            first_not_posted: true,
        })
    }

    fn plan_payload(&self, packet: &Packet, policy: PayloadPolicy) -> Result<PayloadPlan> {
        match policy {
            PayloadPolicy::Grant => {
                let chunks = chunk_by_descriptor(&packet.payload);
                if 1 + chunks.len() > NR_SLOTS_MIN {
                    return Err(VifError::PayloadTooFragmented);
                }
                Ok(PayloadPlan::Granted(chunks))
            }
            PayloadPolicy::Copy => Ok(PayloadPlan::Copied(chunk_coalesced(&packet.payload))),
            PayloadPolicy::GrantElseCopy => {
                let chunks = chunk_by_descriptor(&packet.payload);
                if 1 + chunks.len() > NR_SLOTS_MIN {
                    Ok(PayloadPlan::Copied(chunk_coalesced(&packet.payload)))
                } else {
                    Ok(PayloadPlan::Granted(chunks))
                }
            }
        }
    }

    fn prepare_control(&self, inner: &mut Inner, control: ControlRequest) -> std::result::Result<InProgress, VifError> {
        let bytes = match &control {
            ControlRequest::GratuitousArp { sender_ip, sender_mac } => build_gratuitous_arp(*sender_ip, *sender_mac),
            ControlRequest::NeighbourAdvertisement { target_ip, target_mac } => build_neighbour_advertisement(*target_ip, *target_mac),
            ControlRequest::Multicast(_) => Vec::new(),
        };
        let extra = if let ControlRequest::Multicast(mc) = &control {
            Some(match mc.action {
                MulticastAction::Add => ExtraInfoKind::McastAdd(mc.address),
                MulticastAction::Remove => ExtraInfoKind::McastDel(mc.address),
            })
        } else {
            None
        };

        let id = self.fragment_ids.pop().ok_or(VifError::OutOfResources)?;
        let grant = GrantHandle::new(self.grants.clone(), self.backend_domain, id as u64, Access::ReadOnly)
            .inspect_err(|_| self.fragment_ids.put(id))?;

        let len = bytes.len() as u16;
        if !bytes.is_empty() {
            let mut buf = self.buffer_pool.alloc().ok_or(VifError::OutOfResources)?;
            buf.extend(&bytes);
            inner.buffers.insert(id, buf);
        }

        let mut fragments = VecDeque::new();
        fragments.push_back(FragmentPlan {
            fragment: Fragment { id, grant: Some(grant), offset: 0, len, extra: extra.is_some(), owner: FragmentOwner::Control },
            wire_size: len,
        });

        Ok(InProgress {
            fragments,
            extra,
            csum_flags: 0,
            total_len: len as u32,
            first_not_posted: true,
        })
    }

    /// Disable the ring: drain outstanding work. If the backend is still
    /// connected, wait for real responses (bounded retry); otherwise
    /// synthesise drop responses for every pending fragment.
    pub fn disable(&self) -> Vec<(Packet, CompletionInfo)> {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.enabled = false;
            if !inner.connected {
                self.fake_responses(&mut inner);
            }
        }
        for _ in 0..100 {
            let pending_remains = {
                let inner = self.inner.lock().unwrap();
                inner.responses_processed < inner.requests_pushed
            };
            if !pending_remains {
                break;
            }
            self.poll();
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        let mut inner = self.inner.lock().unwrap();
        std::mem::take(&mut inner.complete)
    }

    fn fake_responses(&self, inner: &mut Inner) {
        self.shared.reset();
        let outstanding = inner.pending.iter().filter(|p| p.is_some()).count() as u32;
        inner.rsp_cons = inner.req_prod_pvt.wrapping_sub(outstanding);
        let mut index = inner.rsp_cons;
        for id in 1..=MAX_FRAGMENT_ID as usize {
            if let Some(fragment) = &inner.pending[id] {
                let extra = fragment.extra;
                self.shared.write_response(index, Response { id: id as u16, status: STATUS_DROPPED });
                index = index.wrapping_add(1);
                if extra {
                    self.shared.write_response(index, Response { id: 0, status: STATUS_NULL });
                    index = index.wrapping_add(1);
                }
            }
        }
        self.shared.publish_rsp_prod(index);
    }

    /// Process available responses. Returns newly completed packets.
    pub fn poll(&self) -> Vec<(Packet, CompletionInfo)> {
        let mut inner = self.inner.lock().unwrap();
        let rsp_prod = self.shared.rsp_prod();
        while inner.rsp_cons != rsp_prod {
            let idx = inner.rsp_cons;
            let response = self.shared.read_response(idx);
            inner.rsp_cons = inner.rsp_cons.wrapping_add(1);
            inner.responses_processed += 1;
            inner.stopped = false;

            if response.status == STATUS_NULL {
                continue;
            }

            let Some(fragment) = inner.pending[response.id as usize].take() else {
                continue;
            };
            let owner = fragment.owner;
            inner.buffers.remove(&fragment.id);
            drop(fragment);

            let status = match response.status {
                STATUS_OKAY => CompletionStatus::Ok,
                STATUS_DROPPED => CompletionStatus::Dropped,
                STATUS_ERROR => CompletionStatus::Error,
                _ => CompletionStatus::Error,
            };

            if let FragmentOwner::Packet(packet_id) = owner {
                if let Some(packet) = inner.packets.get_mut(&packet_id) {
                    packet.outstanding = packet.outstanding.saturating_sub(1);
                    packet.completion.set_status(status);
                    if packet.outstanding == 0 {
                        let packet = inner.packets.remove(&packet_id).unwrap();
                        let completion = packet.completion;
                        self.stats.tx.record_completion(
                            Side::Transmitter,
                            completion.destination,
                            completion.status,
                            completion.packet_length as u64,
                        );
                        inner.packets_completed += 1;
                        inner.complete.push((packet, completion));
                    }
                }
            }
        }

        let window = self.available_slots(&inner).clamp(1, (self.shared.capacity() / 4).max(1));
        self.shared.set_rsp_event(inner.rsp_cons.wrapping_add(window));

        if inner.in_progress.is_some() || !inner.packet_queue.is_empty() || !inner.request_queue.is_empty() {
            self.schedule(&mut inner);
        }

        std::mem::take(&mut inner.complete)
    }

    pub fn stats(&self) -> &Arc<RingStatistics> {
        &self.stats
    }
}

enum PayloadPlan {
    Granted(Vec<Vec<u8>>),
    Copied(Vec<Vec<u8>>),
}

fn chunk_by_descriptor(payload: &[crate::packet::MemoryDescriptor]) -> Vec<Vec<u8>> {
    let mut out = Vec::new();
    for d in payload {
        for chunk in d.data.chunks(PAGE_SIZE) {
            out.push(chunk.to_vec());
        }
    }
    out
}

fn chunk_coalesced(payload: &[crate::packet::MemoryDescriptor]) -> Vec<Vec<u8>> {
    let mut flat = Vec::new();
    for d in payload {
        flat.extend_from_slice(&d.data);
    }
    if flat.is_empty() {
        return Vec::new();
    }
    flat.chunks(PAGE_SIZE).map(|c| c.to_vec()).collect()
}

fn make_completion(packet: &Packet) -> CompletionInfo {
    let info = headers::parse_header(&packet.header);
    CompletionInfo {
        destination: Destination::classify(&info.dest_mac),
        status: CompletionStatus::Pending,
        packet_length: packet.total_len() as u32,
        payload_length: packet.payload_len() as u32,
    }
}

fn build_gratuitous_arp(sender_ip: [u8; 4], sender_mac: [u8; 6]) -> Vec<u8> {
    let mut pkt = Vec::with_capacity(42);
    pkt.extend_from_slice(&[0xff; 6]);
    pkt.extend_from_slice(&sender_mac);
    pkt.extend_from_slice(&0x0806u16.to_be_bytes());
    pkt.extend_from_slice(&1u16.to_be_bytes());
    pkt.extend_from_slice(&0x0800u16.to_be_bytes());
    pkt.push(6);
    pkt.push(4);
    pkt.extend_from_slice(&1u16.to_be_bytes());
    pkt.extend_from_slice(&sender_mac);
    pkt.extend_from_slice(&sender_ip);
    pkt.extend_from_slice(&[0; 6]);
    pkt.extend_from_slice(&sender_ip);
    pkt
}

fn build_neighbour_advertisement(target_ip: [u8; 16], target_mac: [u8; 6]) -> Vec<u8> {
    let mut pkt = Vec::with_capacity(86);
    pkt.extend_from_slice(&[0x33, 0x33, 0, 0, 0, 1]);
    pkt.extend_from_slice(&target_mac);
    pkt.extend_from_slice(&0x86ddu16.to_be_bytes());
    pkt.push(0x60);
    pkt.extend_from_slice(&[0, 0, 0]);
    pkt.extend_from_slice(&32u16.to_be_bytes());
    pkt.push(58);
    pkt.push(255);
    pkt.extend_from_slice(&target_ip);
    pkt.extend_from_slice(&target_ip);
    pkt.push(136);
    pkt.push(0);
    pkt.extend_from_slice(&[0, 0]);
    pkt.extend_from_slice(&[0x20, 0, 0, 0]);
    pkt.extend_from_slice(&target_ip);
    pkt.push(2);
    pkt.push(1);
    pkt.extend_from_slice(&target_mac);
    pkt
}

impl crate::ring::SharedRing {
    /// Write a raw request-shaped payload (used for extra-info slots,
    /// which share the request record's byte layout but aren't addressed
    /// by a fragment id).
    pub fn write_request_raw(&self, index: u32, bytes: [u8; EXTRA_INFO_SIZE]) {
        let req = TxRequest::from_bytes(&bytes);
        self.write_request(index, req);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eventchannel::SimEventChannel;
    use crate::grant::SimGrantTable;
    use crate::packet::{MemoryDescriptor, SendInfo};

    fn make_ring(capacity: usize) -> TxRing {
        let config = DriverConfig::builder().ring_capacity(capacity).build();
        TxRing::new(
            config,
            Arc::new(SimGrantTable::new()),
            0,
            SimEventChannel::new(),
            BufferPool::new(64),
            Arc::new(RingStatistics::new(1)),
        )
    }

    fn eth_ip_tcp_header() -> Vec<u8> {
        let mut pkt = vec![0u8; 14 + 20 + 20];
        pkt[0..6].copy_from_slice(&[0x02, 0, 0, 0, 0, 1]);
        pkt[6..12].copy_from_slice(&[0x02, 0, 0, 0, 0, 2]);
        pkt[12..14].copy_from_slice(&0x0800u16.to_be_bytes());
        pkt[14] = 0x45;
        pkt[14 + 9] = 6;
        pkt[14 + 12..14 + 16].copy_from_slice(&[10, 0, 0, 1]);
        pkt[14 + 16..14 + 20].copy_from_slice(&[10, 0, 0, 2]);
        pkt[34 + 12] = 5 << 4;
        pkt
    }

    fn simple_packet(payload_len: usize) -> Packet {
        Packet {
            header: eth_ip_tcp_header(),
            payload: vec![MemoryDescriptor { data: vec![0xAB; payload_len] }],
            send_info: SendInfo::default(),
            outstanding: 0,
            completion: CompletionInfo {
                destination: Destination::Unicast,
                status: CompletionStatus::Pending,
                packet_length: 0,
                payload_length: 0,
            },
        }
    }

    #[test]
    fn test_queue_single_unicast_packet_posts_one_request() {
        let ring = make_ring(256);
        ring.set_enabled(true);
        ring.set_connected(true);
        let completed = ring.queue_packets(vec![simple_packet(100)]);
        assert!(completed.is_empty(), "no backend response yet");
        let inner = ring.inner.lock().unwrap();
        assert_eq!(inner.requests_posted, 2, "header fragment + one payload fragment");
    }

    #[test]
    fn test_runt_packet_uses_copy_policy() {
        ring_copies_runt();
    }

    fn ring_copies_runt() {
        let ring = make_ring(256);
        let completed_stash = ring.queue_packets(vec![simple_packet(0)]);
        assert!(completed_stash.is_empty());
        let inner = ring.inner.lock().unwrap();
        assert_eq!(inner.packets_copied, 1);
    }

    #[test]
    fn test_disable_fakes_drop_responses_when_backend_gone() {
        let ring = make_ring(256);
        ring.set_enabled(true);
        ring.queue_packets(vec![simple_packet(10)]);
        let completed = ring.disable();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].1.status, CompletionStatus::Dropped);
    }

    #[test]
    fn test_backend_okay_response_completes_packet() {
        let ring = make_ring(256);
        ring.set_enabled(true);
        ring.set_connected(true);
        ring.queue_packets(vec![simple_packet(10)]);
        let posted = {
            let inner = ring.inner.lock().unwrap();
            inner.requests_posted
        };
        for i in 0..posted {
            let req = ring.shared_ring().read_request(i as u32);
            ring.shared_ring().write_response(i as u32, Response { id: req.id, status: STATUS_OKAY });
        }
        ring.shared_ring().publish_rsp_prod(posted as u32);
        let completed = ring.poll();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].1.status, CompletionStatus::Ok);
    }

    #[test]
    fn test_ring_full_defers_packet_until_responses_drain() {
        let ring = make_ring(4);
        ring.set_enabled(true);
        ring.set_connected(true);
        // 4 slots; each packet needs 2 (header + payload), so the 3rd packet
        // cannot be posted until responses free space.
        let mut all_completed = Vec::new();
        all_completed.extend(ring.queue_packets(vec![simple_packet(10)]));
        all_completed.extend(ring.queue_packets(vec![simple_packet(10)]));
        all_completed.extend(ring.queue_packets(vec![simple_packet(10)]));
        {
            let inner = ring.inner.lock().unwrap();
            assert!(inner.stopped, "third packet should have stalled on ring-full");
            assert_eq!(inner.requests_posted, 4);
        }
        let posted = 4u32;
        for i in 0..posted {
            let req = ring.shared_ring().read_request(i);
            ring.shared_ring().write_response(i, Response { id: req.id, status: STATUS_OKAY });
        }
        ring.shared_ring().publish_rsp_prod(posted);
        all_completed.extend(ring.poll());
        assert_eq!(all_completed.len(), 2, "two packets should have completed so far");
    }

    #[test]
    fn test_oversized_packet_without_lso_is_dropped_and_bumps_frontend_errors() {
        let ring = make_ring(256);
        ring.set_enabled(true);
        let mut packet = simple_packet(2000);
        packet.header = eth_ip_tcp_header();
        let completed = ring.queue_packets(vec![packet]);
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].1.status, CompletionStatus::Dropped);
        assert_eq!(ring.stats().tx.get(crate::stats::Counter::FrontendErrors), 1);
        assert_eq!(ring.stats().tx.get(crate::stats::Counter::PacketsDropped), 1);

        let inner = ring.inner.lock().unwrap();
        assert_eq!(
            inner.packets_sent,
            inner.packets_prepared - inner.packets_unprepared,
            "PacketsSent must equal PacketsPrepared - PacketsUnprepared"
        );
        assert_eq!(inner.packets_unprepared, 1);
        assert_eq!(inner.packets_faked, 1);
    }

    #[test]
    fn test_vlan_tagged_lso_packet_shifts_header_offsets_correctly() {
        let ring = make_ring(64);
        let mut packet = simple_packet(2920);
        packet.send_info.vlan_tag = Some(42);
        packet.send_info.lso_tcp4 = true;
        packet.send_info.mss = 1460;

        let mut inner = ring.inner.lock().unwrap();
        let ip = ring.prepare_packet(&mut inner, packet).expect("prepare should succeed");
        let header_fragment_id = ip.fragments.front().unwrap().fragment.id;
        let buf = inner.buffers.get(&header_fragment_id).unwrap();
        let bytes = buf.data();

        assert_eq!(u16::from_be_bytes([bytes[12], bytes[13]]), headers::ETHERTYPE_VLAN);
        let l3_offset = 14 + headers::VLAN_TAG_LEN;
        assert_eq!(bytes[l3_offset], 0x45, "IPv4 version/IHL byte must sit at the VLAN-shifted offset");
        let total_l3_len = u16::from_be_bytes([bytes[l3_offset + 2], bytes[l3_offset + 3]]);
        assert_eq!(
            total_l3_len as usize,
            bytes.len() - l3_offset,
            "IPv4 total length must reflect the shifted header, not the pre-VLAN offset"
        );
    }
}
