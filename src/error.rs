//! Typed errors for the frame pipeline.
//!
//! Transient conditions (`Exhausted`, `Empty`) are control signals for the
//! caller. `DoubleRelease` means the slot ownership protocol was broken.

use std::any::Any;

use thiserror::Error;

use crate::decode::frame::{Frame, PixelFormat, SlotId};

/// Frame pool failures.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    /// Every slot is owned by someone; back off and retry
    #[error("frame pool exhausted")]
    Exhausted,

    /// Slot was already on the free list
    #[error("slot {0} released twice")]
    DoubleRelease(SlotId),

    /// Hand-off of a slot nobody acquired
    #[error("slot {0} is not acquired")]
    NotAcquired(SlotId),

    /// Slot index does not belong to this pool
    #[error("slot {0} is not part of this pool")]
    UnknownSlot(SlotId),

    /// Blocking wait interrupted by the stop signal
    #[error("wait for a free slot was cancelled")]
    Cancelled,
}

/// Non-blocking queue reads.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    #[error("frame queue is empty")]
    Empty,
}

/// A push that did not enqueue. The frame is handed back so the caller can
/// release its slot.
#[derive(Error, Debug)]
pub enum PushError {
    #[error("frame queue is full")]
    Full(Frame),

    #[error("push cancelled while waiting for space")]
    Cancelled(Frame),
}

impl PushError {
    pub fn into_frame(self) -> Frame {
        match self {
            Self::Full(frame) | Self::Cancelled(frame) => frame,
        }
    }
}

/// Per-unit decode failures. The worker skips the unit and keeps going until
/// too many happen in a row.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("empty packet payload")]
    EmptyPayload,

    #[error("jpeg decode failed: {0}")]
    Jpeg(String),

    #[error("unsupported jpeg colour layout: {0}")]
    UnsupportedLayout(String),

    #[error("decoded frame needs {needed} bytes but slot holds {capacity}")]
    TooLarge { needed: usize, capacity: usize },

    #[error("raw {format:?} payload is {actual} bytes, expected {expected}")]
    SizeMismatch {
        format: PixelFormat,
        expected: usize,
        actual: usize,
    },

    #[error("frame dimensions {width}x{height} are invalid")]
    BadDimensions { width: u32, height: u32 },

    #[error("slot unavailable: {0}")]
    Slot(#[from] PoolError),
}

/// Texture upload failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UploadError {
    /// The frame cannot be shown: bad dimensions, short data, or a pixel
    /// format with no entry in the conversion table. It is dropped and its
    /// slot released.
    #[error("unsupported frame: {0}")]
    UnsupportedFrame(String),

    #[error("texture backend error: {0}")]
    Backend(String),
}

/// Configuration loading and validation.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// The decode thread panicked instead of returning its report.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("decode worker panicked: {0}")]
pub struct WorkerPanic(pub String);

impl WorkerPanic {
    pub(crate) fn from_payload(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown reason".to_string()
        };
        Self(message)
    }
}
