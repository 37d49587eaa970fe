//! Header parsing and in-place fix-up for the transmit prepare path.
//!
//! Offsets are located with `smoltcp`'s wire types (the same packet-parsing
//! crate already in this codebase's dependency graph); checksum
//! finalisation is hand-rolled one's-complement arithmetic the way the
//! virtio checksum offload helper elsewhere in this codebase folds a
//! running sum, since what's being computed here (a pseudo-header-only
//! partial sum primed for the backend/hardware to finish) isn't something
//! `smoltcp`'s own checksum helpers are shaped for.

use smoltcp::wire::{EthernetFrame, EthernetProtocol, IpProtocol, Ipv4Packet, Ipv6Packet};

pub const ETHERNET_HEADER_LEN: usize = 14;
pub const VLAN_TAG_LEN: usize = 4;
pub const ETHERNET_MIN: usize = 60;
pub const ETHERTYPE_VLAN: u16 = 0x8100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum L3Kind {
    Ipv4,
    Ipv6,
    Other,
}

#[derive(Debug, Clone, Copy)]
pub struct HeaderInfo {
    pub eth_len: usize,
    pub l3_offset: usize,
    pub l3_kind: L3Kind,
    pub l3_header_len: usize,
    pub l4_offset: usize,
    pub is_tcp: bool,
    pub is_udp: bool,
    pub header_len: usize,
    pub dest_mac: [u8; 6],
}

/// Parse as much of an Ethernet + IPv4/IPv6 + TCP/UDP header as is present.
/// Never fails on truncated or non-IP input: falls back to reporting only
/// what was actually parseable, since a caller's packet may legitimately be
/// ARP or something else entirely.
pub fn parse_header(data: &[u8]) -> HeaderInfo {
    let mut info = HeaderInfo {
        eth_len: 0,
        l3_offset: 0,
        l3_kind: L3Kind::Other,
        l3_header_len: 0,
        l4_offset: 0,
        is_tcp: false,
        is_udp: false,
        header_len: data.len().min(ETHERNET_HEADER_LEN),
        dest_mac: [0; 6],
    };

    let Ok(eth) = EthernetFrame::new_checked(data) else {
        return info;
    };
    info.dest_mac.copy_from_slice(eth.dst_addr().as_bytes());
    info.eth_len = ETHERNET_HEADER_LEN;
    info.l3_offset = ETHERNET_HEADER_LEN;
    info.header_len = info.eth_len;

    match eth.ethertype() {
        EthernetProtocol::Ipv4 => {
            let Ok(ip) = Ipv4Packet::new_checked(eth.payload()) else {
                return info;
            };
            info.l3_kind = L3Kind::Ipv4;
            info.l3_header_len = ip.header_len() as usize;
            info.l4_offset = info.l3_offset + info.l3_header_len;
            info.header_len = info.l4_offset;
            match ip.next_header() {
                IpProtocol::Tcp => {
                    info.is_tcp = true;
                    info.header_len += tcp_header_len(&data[info.l4_offset..]);
                }
                IpProtocol::Udp => {
                    info.is_udp = true;
                    info.header_len += 8;
                }
                _ => {}
            }
        }
        EthernetProtocol::Ipv6 => {
            let Ok(ip) = Ipv6Packet::new_checked(eth.payload()) else {
                return info;
            };
            info.l3_kind = L3Kind::Ipv6;
            info.l3_header_len = 40;
            info.l4_offset = info.l3_offset + info.l3_header_len;
            info.header_len = info.l4_offset;
            match ip.next_header() {
                IpProtocol::Tcp => {
                    info.is_tcp = true;
                    info.header_len += tcp_header_len(&data[info.l4_offset..]);
                }
                IpProtocol::Udp => {
                    info.is_udp = true;
                    info.header_len += 8;
                }
                _ => {}
            }
        }
        _ => {}
    }

    info
}

fn tcp_header_len(tcp: &[u8]) -> usize {
    if tcp.len() < 13 {
        return 20;
    }
    (((tcp[12] >> 4) as usize) * 4).max(20)
}

/// Shift everything after the ethertype field 4 bytes later and splice in
/// an 802.1Q tag. `data` must already have at least `VLAN_TAG_LEN` bytes of
/// spare capacity past its current length.
pub fn insert_vlan_tag(data: &mut Vec<u8>, tci: u16) {
    let original_len = data.len();
    data.resize(original_len + VLAN_TAG_LEN, 0);
    data.copy_within(12..original_len, 12 + VLAN_TAG_LEN);
    data[12..14].copy_from_slice(&ETHERTYPE_VLAN.to_be_bytes());
    data[14..16].copy_from_slice(&tci.to_be_bytes());
}

fn ones_complement_sum(data: &[u8]) -> u32 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u16::from_be_bytes([chunk[0], chunk[1]]) as u32;
    }
    if let [last] = chunks.remainder() {
        sum += (*last as u32) << 8;
    }
    sum
}

fn fold_checksum(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// Recompute and write the IPv4 header checksum in place.
pub fn fixup_ipv4_header_checksum(data: &mut [u8], l3_offset: usize, l3_header_len: usize) {
    let header = &mut data[l3_offset..l3_offset + l3_header_len];
    header[10] = 0;
    header[11] = 0;
    let sum = ones_complement_sum(header);
    let checksum = fold_checksum(sum);
    data[l3_offset + 10..l3_offset + 12].copy_from_slice(&checksum.to_be_bytes());
}

/// Write an IPv4 pseudo-header-only partial checksum into the TCP checksum
/// field, priming it for the backend (or, for a single-segment packet, for
/// `finalize_checksum` below) to complete over the actual segment data.
pub fn fixup_ipv4_tcp_pseudo_checksum(data: &mut [u8], l3_offset: usize, l3_header_len: usize, l4_offset: usize, tcp_segment_len: u16) {
    let src: [u8; 4] = data[l3_offset + 12..l3_offset + 16].try_into().unwrap();
    let dst: [u8; 4] = data[l3_offset + 16..l3_offset + 20].try_into().unwrap();
    let _ = l3_header_len;
    let checksum = ipv4_pseudo_header_checksum(src, dst, 6, tcp_segment_len);
    data[l4_offset + 16..l4_offset + 18].copy_from_slice(&checksum.to_be_bytes());
}

pub fn fixup_ipv6_tcp_pseudo_checksum(data: &mut [u8], l3_offset: usize, l4_offset: usize, tcp_segment_len: u32) {
    let src: [u8; 16] = data[l3_offset + 8..l3_offset + 24].try_into().unwrap();
    let dst: [u8; 16] = data[l3_offset + 24..l3_offset + 40].try_into().unwrap();
    let checksum = ipv6_pseudo_header_checksum(src, dst, 6, tcp_segment_len);
    data[l4_offset + 16..l4_offset + 18].copy_from_slice(&checksum.to_be_bytes());
}

fn ipv4_pseudo_header_checksum(src: [u8; 4], dst: [u8; 4], protocol: u8, length: u16) -> u16 {
    let mut pseudo = [0u8; 12];
    pseudo[0..4].copy_from_slice(&src);
    pseudo[4..8].copy_from_slice(&dst);
    pseudo[9] = protocol;
    pseudo[10..12].copy_from_slice(&length.to_be_bytes());
    fold_checksum(ones_complement_sum(&pseudo))
}

fn ipv6_pseudo_header_checksum(src: [u8; 16], dst: [u8; 16], next_header: u8, length: u32) -> u16 {
    let mut pseudo = [0u8; 40];
    pseudo[0..16].copy_from_slice(&src);
    pseudo[16..32].copy_from_slice(&dst);
    pseudo[32..36].copy_from_slice(&length.to_be_bytes());
    pseudo[39] = next_header;
    fold_checksum(ones_complement_sum(&pseudo))
}

/// Finish a one's-complement checksum over `packet[csum_start..]`, folding
/// it into whatever partial sum already sits at `csum_start + csum_offset`
/// (the pseudo-header value one of the `fixup_*_pseudo_checksum` functions
/// above primed there). Used by the simulated backend peer to validate
/// that offloaded packets carry a correct final checksum.
pub fn finalize_checksum(packet: &mut [u8], csum_start: usize, csum_offset: usize) {
    let partial = u16::from_be_bytes([
        packet[csum_start + csum_offset],
        packet[csum_start + csum_offset + 1],
    ]);
    packet[csum_start + csum_offset] = 0;
    packet[csum_start + csum_offset + 1] = 0;
    let sum = ones_complement_sum(&packet[csum_start..]) + partial as u32;
    let checksum = fold_checksum(sum);
    packet[csum_start + csum_offset..csum_start + csum_offset + 2].copy_from_slice(&checksum.to_be_bytes());
}
