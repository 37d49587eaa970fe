//! Core of a paravirtualized virtual-interface frontend network driver.
//!
//! This crate implements the domain logic of the frontend half of a
//! split network driver: the connection handshake against a xenstore-like
//! key/value store, the transmit and receive ring state machines, header
//! fix-up for segmentation and checksum offload, and the ambient
//! collaborators (grant table, event channel) the rings drive through
//! traits rather than a concrete hypervisor binding. Nothing here spawns
//! its own I/O; callers own the threads and wire real backends in.

pub mod address_monitor;
pub mod buffer;
pub mod config;
pub mod eject;
pub mod error;
pub mod eventchannel;
pub mod fragment;
pub mod fsm;
pub mod grant;
pub mod headers;
pub mod lock;
pub mod packet;
pub mod ring;
pub mod rxring;
pub mod stats;
pub mod store;
pub mod txring;
pub mod wire;

pub use config::{DriverConfig, DriverConfigBuilder, PayloadPolicy};
pub use error::{Result, VifError};
pub use fsm::{BackendState, FrontendFsm, FrontendState};
pub use packet::{CompletionInfo, CompletionStatus, MemoryDescriptor, MulticastAction, MulticastControl, Packet, RxPacket, SendInfo};
pub use rxring::RxRing;
pub use txring::TxRing;
