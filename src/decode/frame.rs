use std::fmt;

use serde::{Deserialize, Serialize};

/// Index of a storage region inside the [`FramePool`](crate::pipeline::FramePool).
///
/// A frame carries this instead of a pointer back to the pool; the pool is
/// the only owner of pixel storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SlotId(pub(crate) usize);

impl SlotId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Decoded pixel layouts a frame can carry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelFormat {
    /// Packed 8-bit RGB
    Rgb8,
    /// Planar I420: full Y plane followed by quarter-size U and V planes
    Yuv420,
    /// Packed 8-bit BGRA
    Bgra8,
}

impl PixelFormat {
    /// Largest bytes-per-pixel of any supported layout, used to size pool slots.
    pub const MAX_BYTES_PER_PIXEL: usize = 4;

    /// Bytes needed to hold one `width` x `height` image in this layout.
    pub fn frame_size(self, width: u32, height: u32) -> usize {
        let w = width as usize;
        let h = height as usize;
        match self {
            Self::Rgb8 => w * h * 3,
            Self::Bgra8 => w * h * 4,
            Self::Yuv420 => {
                let (cw, ch) = Self::chroma_dimensions(width, height);
                w * h + 2 * (cw as usize * ch as usize)
            }
        }
    }

    /// Chroma plane size for 4:2:0 subsampling (rounded up for odd sizes).
    pub fn chroma_dimensions(width: u32, height: u32) -> (u32, u32) {
        (width.div_ceil(2), height.div_ceil(2))
    }
}

/// Frame metadata. Cheap to copy, handed out by `peek`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    /// Presentation timestamp in microseconds since stream start
    pub timestamp_us: u64,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    /// Bytes of the slot actually occupied by pixels
    pub len: usize,
}

/// A decoded frame living in a pool slot.
///
/// Not `Clone`: a published frame is consumed exactly once, and whoever holds
/// it is responsible for releasing the slot.
#[derive(Debug, PartialEq, Eq)]
pub struct Frame {
    info: FrameInfo,
    slot: SlotId,
}

impl Frame {
    pub fn new(slot: SlotId, info: FrameInfo) -> Self {
        Self { info, slot }
    }

    pub fn info(&self) -> FrameInfo {
        self.info
    }

    pub fn slot(&self) -> SlotId {
        self.slot
    }

    pub fn timestamp_us(&self) -> u64 {
        self.info.timestamp_us
    }

    pub fn width(&self) -> u32 {
        self.info.width
    }

    pub fn height(&self) -> u32 {
        self.info.height
    }

    pub fn format(&self) -> PixelFormat {
        self.info.format
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_sizes() {
        assert_eq!(PixelFormat::Rgb8.frame_size(4, 2), 24);
        assert_eq!(PixelFormat::Bgra8.frame_size(4, 2), 32);
        assert_eq!(PixelFormat::Yuv420.frame_size(4, 2), 8 + 2 * 2);
        // odd sizes round the chroma planes up
        assert_eq!(PixelFormat::Yuv420.frame_size(3, 3), 9 + 2 * 4);
    }
}
