//! Error types for the frontend driver core.

use thiserror::Error;

/// Errors surfaced by the frontend driver's public API.
#[derive(Debug, Error)]
pub enum VifError {
    #[error("out of resources")]
    OutOfResources,

    #[error("ring full")]
    RingFull,

    #[error("payload too fragmented for the ring's slot budget")]
    PayloadTooFragmented,

    #[error("packet too large for the negotiated MTU")]
    PacketTooLarge,

    #[error("backend is gone")]
    BackendGone,

    #[error("backend does not advertise feature: {0}")]
    FeatureMissing(&'static str),

    #[error("operation invalid in current state")]
    InvalidState,

    #[error("store error: {0}")]
    Store(String),

    #[error("grant table error: {0}")]
    Grant(String),

    #[error("event channel error: {0}")]
    EventChannel(String),
}

pub type Result<T> = std::result::Result<T, VifError>;
