//! Wire records exchanged over the shared ring page.
//!
//! Each record is a fixed-size little-endian packed layout. Rather than
//! depending on an external zero-copy byte-layout crate for a handful of
//! tiny structs, each type hand-rolls `to_bytes`/`from_bytes` the same way
//! the virtio header types elsewhere in this codebase lay out their wire
//! structs explicitly field by field.

pub const REQUEST_SIZE: usize = 12;
pub const RESPONSE_SIZE: usize = 4;
pub const EXTRA_INFO_SIZE: usize = 12;

pub const FLAG_CSUM_BLANK: u16 = 1;
pub const FLAG_DATA_VALIDATED: u16 = 2;
pub const FLAG_MORE_DATA: u16 = 4;
pub const FLAG_EXTRA_INFO: u16 = 8;

pub const STATUS_OKAY: i16 = 0;
pub const STATUS_NULL: i16 = 1;
pub const STATUS_DROPPED: i16 = -2;
pub const STATUS_ERROR: i16 = -3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxRequest {
    pub id: u16,
    pub gref: u32,
    pub offset: u16,
    pub flags: u16,
    pub size: u16,
}

impl TxRequest {
    pub fn to_bytes(self) -> [u8; REQUEST_SIZE] {
        let mut out = [0u8; REQUEST_SIZE];
        out[0..2].copy_from_slice(&self.id.to_le_bytes());
        out[2..6].copy_from_slice(&self.gref.to_le_bytes());
        out[6..8].copy_from_slice(&self.offset.to_le_bytes());
        out[8..10].copy_from_slice(&self.flags.to_le_bytes());
        out[10..12].copy_from_slice(&self.size.to_le_bytes());
        out
    }

    pub fn from_bytes(b: &[u8; REQUEST_SIZE]) -> Self {
        TxRequest {
            id: u16::from_le_bytes([b[0], b[1]]),
            gref: u32::from_le_bytes([b[2], b[3], b[4], b[5]]),
            offset: u16::from_le_bytes([b[6], b[7]]),
            flags: u16::from_le_bytes([b[8], b[9]]),
            size: u16::from_le_bytes([b[10], b[11]]),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Response {
    pub id: u16,
    pub status: i16,
}

impl Response {
    pub fn to_bytes(self) -> [u8; RESPONSE_SIZE] {
        let mut out = [0u8; RESPONSE_SIZE];
        out[0..2].copy_from_slice(&self.id.to_le_bytes());
        out[2..4].copy_from_slice(&self.status.to_le_bytes());
        out
    }

    pub fn from_bytes(b: &[u8; RESPONSE_SIZE]) -> Self {
        Response {
            id: u16::from_le_bytes([b[0], b[1]]),
            status: i16::from_le_bytes([b[2], b[3]]),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtraInfoKind {
    Gso { gso_type: GsoType, size: u16 },
    McastAdd([u8; 6]),
    McastDel([u8; 6]),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GsoType {
    Tcpv4,
    Tcpv6,
}

impl ExtraInfoKind {
    pub fn to_bytes(self) -> [u8; EXTRA_INFO_SIZE] {
        let mut out = [0u8; EXTRA_INFO_SIZE];
        match self {
            ExtraInfoKind::Gso { gso_type, size } => {
                out[0] = 1;
                out[1] = match gso_type {
                    GsoType::Tcpv4 => 4,
                    GsoType::Tcpv6 => 6,
                };
                out[2..4].copy_from_slice(&size.to_le_bytes());
            }
            ExtraInfoKind::McastAdd(addr) => {
                out[0] = 2;
                out[2..8].copy_from_slice(&addr);
            }
            ExtraInfoKind::McastDel(addr) => {
                out[0] = 3;
                out[2..8].copy_from_slice(&addr);
            }
        }
        out
    }

    pub fn from_bytes(b: &[u8; EXTRA_INFO_SIZE]) -> Option<Self> {
        match b[0] {
            1 => {
                let gso_type = match b[1] {
                    4 => GsoType::Tcpv4,
                    6 => GsoType::Tcpv6,
                    _ => return None,
                };
                let size = u16::from_le_bytes([b[2], b[3]]);
                Some(ExtraInfoKind::Gso { gso_type, size })
            }
            2 => {
                let mut addr = [0u8; 6];
                addr.copy_from_slice(&b[2..8]);
                Some(ExtraInfoKind::McastAdd(addr))
            }
            3 => {
                let mut addr = [0u8; 6];
                addr.copy_from_slice(&b[2..8]);
                Some(ExtraInfoKind::McastDel(addr))
            }
            _ => None,
        }
    }
}
