//! Caller-facing packet types.

use crate::stats::Destination;

/// One scatter-list entry: a contiguous slice of the caller's payload.
#[derive(Debug, Clone)]
pub struct MemoryDescriptor {
    pub data: Vec<u8>,
}

/// Segmentation/checksum offload instructions attached to an outgoing
/// packet by the caller.
#[derive(Debug, Clone, Copy, Default)]
pub struct SendInfo {
    pub offload_ip4_header_checksum: bool,
    pub offload_ip4_tcp_checksum: bool,
    pub offload_ip6_tcp_checksum: bool,
    pub lso_tcp4: bool,
    pub lso_tcp6: bool,
    pub mss: u16,
    pub vlan_tag: Option<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    Pending,
    Ok,
    Dropped,
    Error,
}

#[derive(Debug, Clone, Copy)]
pub struct CompletionInfo {
    pub destination: Destination,
    pub status: CompletionStatus,
    pub packet_length: u32,
    pub payload_length: u32,
}

impl CompletionInfo {
    /// Mark a status terminal, never overwriting an already-terminal one
    /// (mirrors the ring's "never overwrite a non-pending completion"
    /// rule in the poll loop).
    pub fn set_status(&mut self, status: CompletionStatus) {
        if self.status == CompletionStatus::Pending {
            self.status = status;
        }
    }
}

/// A packet the caller wants transmitted.
#[derive(Debug)]
pub struct Packet {
    pub header: Vec<u8>,
    pub payload: Vec<MemoryDescriptor>,
    pub send_info: SendInfo,
    /// Remaining outstanding fragments; the packet completes when this
    /// reaches zero.
    pub outstanding: u32,
    pub completion: CompletionInfo,
}

impl Packet {
    pub fn payload_len(&self) -> usize {
        self.payload.iter().map(|d| d.data.len()).sum()
    }

    pub fn total_len(&self) -> usize {
        self.header.len() + self.payload_len()
    }
}

/// A received packet handed back to the caller.
pub struct RxPacket {
    pub data: Vec<u8>,
    pub destination: Destination,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MulticastAction {
    Add,
    Remove,
}

#[derive(Debug, Clone, Copy)]
pub struct MulticastControl {
    pub action: MulticastAction,
    pub address: [u8; 6],
}
