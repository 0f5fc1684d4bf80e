//! Frame to GPU texture upload with a front/back texture pair.

use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};
use yuv::{yuv_nv12_to_rgba, YuvBiPlanarImage, YuvConversionMode, YuvRange, YuvStandardMatrix};

use crate::decode::frame::{FrameInfo, PixelFormat};
use crate::error::UploadError;

/// Texture formats frames can be uploaded as. All are 4 bytes per pixel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GpuFormat {
    Rgba8Unorm,
    Rgba8UnormSrgb,
    Bgra8Unorm,
    Bgra8UnormSrgb,
}

impl GpuFormat {
    pub const BYTES_PER_PIXEL: u32 = 4;

    fn is_bgra(self) -> bool {
        matches!(self, Self::Bgra8Unorm | Self::Bgra8UnormSrgb)
    }
}

/// One row of the pixel format conversion table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatMapping {
    pub source: PixelFormat,
    pub target: GpuFormat,
}

pub fn default_mappings() -> Vec<FormatMapping> {
    vec![
        FormatMapping {
            source: PixelFormat::Rgb8,
            target: GpuFormat::Rgba8UnormSrgb,
        },
        FormatMapping {
            source: PixelFormat::Yuv420,
            target: GpuFormat::Rgba8UnormSrgb,
        },
        FormatMapping {
            source: PixelFormat::Bgra8,
            target: GpuFormat::Bgra8UnormSrgb,
        },
    ]
}

/// Which GPU format each decoded layout is uploaded as. Later entries win.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionTable {
    mappings: Vec<FormatMapping>,
}

impl ConversionTable {
    pub fn new(mappings: &[FormatMapping]) -> Self {
        Self {
            mappings: mappings.to_vec(),
        }
    }

    pub fn target(&self, source: PixelFormat) -> Option<GpuFormat> {
        self.mappings
            .iter()
            .rev()
            .find(|m| m.source == source)
            .map(|m| m.target)
    }
}

impl Default for ConversionTable {
    fn default() -> Self {
        Self::new(&default_mappings())
    }
}

/// Where uploaded pixels end up: a GPU device or anything that can stand in
/// for one.
pub trait TextureBackend {
    type Texture;

    fn create_texture(
        &mut self,
        label: &str,
        width: u32,
        height: u32,
        format: GpuFormat,
    ) -> Result<Self::Texture, UploadError>;

    /// Replace the whole texture with tightly packed 4-byte pixels.
    fn write_texture(
        &mut self,
        texture: &Self::Texture,
        pixels: &[u8],
        width: u32,
        height: u32,
    ) -> Result<(), UploadError>;
}

/// Front/back texture pair. Draws read the front texture while the next
/// upload writes the back one; the two swap once the write is done.
#[derive(Debug)]
pub struct TextureHandle<T> {
    textures: [T; 2],
    front: usize,
    width: u32,
    height: u32,
    format: GpuFormat,
    uploads: u64,
}

impl<T> TextureHandle<T> {
    fn new(textures: [T; 2], width: u32, height: u32, format: GpuFormat) -> Self {
        Self {
            textures,
            front: 0,
            width,
            height,
            format,
            uploads: 0,
        }
    }

    /// Texture holding the most recently uploaded frame.
    pub fn current(&self) -> &T {
        &self.textures[self.front]
    }

    fn back(&self) -> &T {
        &self.textures[self.front ^ 1]
    }

    fn swap(&mut self) {
        self.front ^= 1;
    }

    pub fn front_index(&self) -> usize {
        self.front
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> GpuFormat {
        self.format
    }

    pub fn uploads(&self) -> u64 {
        self.uploads
    }

    fn matches(&self, width: u32, height: u32, format: GpuFormat) -> bool {
        self.width == width && self.height == height && self.format == format
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UploadStats {
    pub uploaded: u64,
    /// Frames refused before touching the GPU
    pub rejected: u64,
    /// Texture pairs created because size or format changed
    pub reallocated: u64,
}

/// Copies frames into a double-buffered texture, converting pixel layout on
/// the way. Lives on the render thread.
pub struct TextureUploader<B: TextureBackend> {
    backend: B,
    table: ConversionTable,
    max_width: u32,
    max_height: u32,
    handle: Option<TextureHandle<B::Texture>>,
    staging: Vec<u8>,
    chroma: Vec<u8>,
    stats: UploadStats,
}

impl<B: TextureBackend> TextureUploader<B> {
    pub fn new(backend: B, table: ConversionTable, max_width: u32, max_height: u32) -> Self {
        Self {
            backend,
            table,
            max_width,
            max_height,
            handle: None,
            staging: Vec::new(),
            chroma: Vec::new(),
            stats: UploadStats::default(),
        }
    }

    /// Upload `pixels` (the frame's slot bytes) into the back texture and make
    /// it current.
    ///
    /// A frame that cannot be shown fails with [`UploadError::UnsupportedFrame`];
    /// the current texture is left as it was.
    #[instrument(skip(self, info, pixels), fields(timestamp_us = info.timestamp_us))]
    pub fn upload(
        &mut self,
        info: &FrameInfo,
        pixels: &[u8],
    ) -> Result<&TextureHandle<B::Texture>, UploadError> {
        let started = Instant::now();
        let (target, staged) = match self.prepare(info, pixels) {
            Ok(prepared) => prepared,
            Err(e) => {
                self.stats.rejected += 1;
                warn!("rejected frame: {e}");
                return Err(e);
            }
        };
        let (width, height) = (info.width, info.height);

        if !self
            .handle
            .as_ref()
            .is_some_and(|h| h.matches(width, height, target))
        {
            let front = self
                .backend
                .create_texture("frame texture a", width, height, target)?;
            let back = self
                .backend
                .create_texture("frame texture b", width, height, target)?;
            self.stats.reallocated += 1;
            debug!(width, height, ?target, "allocated frame textures");
            self.handle = Some(TextureHandle::new([front, back], width, height, target));
        }
        let Some(handle) = self.handle.as_mut() else {
            return Err(UploadError::Backend("frame textures missing".into()));
        };

        let data = if staged {
            &self.staging[..]
        } else {
            &pixels[..info.len]
        };
        self.backend.write_texture(handle.back(), data, width, height)?;
        handle.swap();
        handle.uploads += 1;

        self.stats.uploaded += 1;
        metrics::histogram!("upload_time_us").record(started.elapsed().as_micros() as f64);
        Ok(&*handle)
    }

    /// Check the frame and convert it into staging if the layout differs.
    /// Returns the target format and whether staging holds the data.
    fn prepare(&mut self, info: &FrameInfo, pixels: &[u8]) -> Result<(GpuFormat, bool), UploadError> {
        let (width, height) = (info.width, info.height);
        if width == 0 || height == 0 || width > self.max_width || height > self.max_height {
            return Err(UploadError::UnsupportedFrame(format!(
                "{width}x{height} outside 1x1..={}x{}",
                self.max_width, self.max_height
            )));
        }
        let expected = info.format.frame_size(width, height);
        if info.len != expected || pixels.len() < expected {
            return Err(UploadError::UnsupportedFrame(format!(
                "{:?} frame of {width}x{height} carries {} bytes, expected {expected}",
                info.format, info.len
            )));
        }
        let target = self
            .table
            .target(info.format)
            .ok_or_else(|| {
                UploadError::UnsupportedFrame(format!("no GPU format configured for {:?} frames", info.format))
            })?;

        let src = &pixels[..expected];
        let pixel_count = width as usize * height as usize;
        self.staging.clear();
        match info.format {
            PixelFormat::Bgra8 if target.is_bgra() => return Ok((target, false)),
            PixelFormat::Bgra8 => {
                self.staging.extend_from_slice(src);
                swap_red_blue(&mut self.staging);
            }
            PixelFormat::Rgb8 => {
                self.staging.reserve(pixel_count * 4);
                for rgb in src.chunks_exact(3) {
                    if target.is_bgra() {
                        self.staging.extend_from_slice(&[rgb[2], rgb[1], rgb[0], 255]);
                    } else {
                        self.staging.extend_from_slice(&[rgb[0], rgb[1], rgb[2], 255]);
                    }
                }
            }
            PixelFormat::Yuv420 => {
                self.yuv420_to_rgba(src, width, height)?;
                if target.is_bgra() {
                    swap_red_blue(&mut self.staging);
                }
            }
        }
        Ok((target, true))
    }

    /// I420 into staging as RGBA, BT.601 limited range.
    fn yuv420_to_rgba(&mut self, src: &[u8], width: u32, height: u32) -> Result<(), UploadError> {
        let (cw, ch) = PixelFormat::chroma_dimensions(width, height);
        let luma = width as usize * height as usize;
        let plane = cw as usize * ch as usize;
        let (y_plane, chroma) = src.split_at(luma);
        let (u_plane, v_plane) = chroma.split_at(plane);

        // Interleave the planar chroma into NV12 layout
        self.chroma.clear();
        self.chroma.reserve(plane * 2);
        for (&u, &v) in u_plane.iter().zip(v_plane) {
            self.chroma.extend_from_slice(&[u, v]);
        }

        let image = YuvBiPlanarImage {
            y_plane,
            y_stride: width,
            uv_plane: &self.chroma,
            uv_stride: cw * 2,
            width,
            height,
        };
        self.staging.resize(luma * 4, 0);
        yuv_nv12_to_rgba(
            &image,
            &mut self.staging,
            width * GpuFormat::BYTES_PER_PIXEL,
            YuvRange::Limited,
            YuvStandardMatrix::Bt601,
            YuvConversionMode::Balanced,
        )
        .map_err(|e| UploadError::UnsupportedFrame(format!("yuv conversion failed: {e:?}")))
    }

    /// Handle holding the last uploaded frame, if any.
    pub fn handle(&self) -> Option<&TextureHandle<B::Texture>> {
        self.handle.as_ref()
    }

    pub fn current_texture(&self) -> Option<&B::Texture> {
        self.handle.as_ref().map(TextureHandle::current)
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn stats(&self) -> UploadStats {
        self.stats
    }
}

fn swap_red_blue(pixels: &mut [u8]) {
    for px in pixels.chunks_exact_mut(4) {
        px.swap(0, 2);
    }
}

/// Texture backend that keeps textures in host memory. Used where no GPU is
/// available and in tests.
#[derive(Debug, Default)]
pub struct HostTextures {
    textures: Vec<HostTextureData>,
}

#[derive(Debug)]
struct HostTextureData {
    label: String,
    width: u32,
    height: u32,
    format: GpuFormat,
    pixels: Vec<u8>,
    writes: u64,
}

/// Index of a texture owned by [`HostTextures`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostTexture(usize);

impl HostTextures {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pixels(&self, texture: &HostTexture) -> Option<&[u8]> {
        self.textures.get(texture.0).map(|t| t.pixels.as_slice())
    }

    pub fn format(&self, texture: &HostTexture) -> Option<GpuFormat> {
        self.textures.get(texture.0).map(|t| t.format)
    }

    pub fn label(&self, texture: &HostTexture) -> Option<&str> {
        self.textures.get(texture.0).map(|t| t.label.as_str())
    }

    pub fn writes(&self, texture: &HostTexture) -> u64 {
        self.textures.get(texture.0).map_or(0, |t| t.writes)
    }

    /// Textures created so far
    pub fn created(&self) -> usize {
        self.textures.len()
    }
}

impl TextureBackend for HostTextures {
    type Texture = HostTexture;

    fn create_texture(
        &mut self,
        label: &str,
        width: u32,
        height: u32,
        format: GpuFormat,
    ) -> Result<HostTexture, UploadError> {
        let len = width as usize * height as usize * GpuFormat::BYTES_PER_PIXEL as usize;
        self.textures.push(HostTextureData {
            label: label.to_owned(),
            width,
            height,
            format,
            pixels: vec![0; len],
            writes: 0,
        });
        Ok(HostTexture(self.textures.len() - 1))
    }

    fn write_texture(
        &mut self,
        texture: &HostTexture,
        pixels: &[u8],
        width: u32,
        height: u32,
    ) -> Result<(), UploadError> {
        let stored = self
            .textures
            .get_mut(texture.0)
            .ok_or_else(|| UploadError::Backend(format!("unknown texture {}", texture.0)))?;
        if (stored.width, stored.height) != (width, height) || stored.pixels.len() != pixels.len() {
            return Err(UploadError::Backend(format!(
                "write of {width}x{height} ({} bytes) into {}x{} texture",
                pixels.len(),
                stored.width,
                stored.height
            )));
        }
        stored.pixels.copy_from_slice(pixels);
        stored.writes += 1;
        Ok(())
    }
}
