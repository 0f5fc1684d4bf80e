//! WebGPU texture backend

use std::sync::Arc;

use color_eyre::{eyre::eyre, Result};
use tracing::{info, instrument};
use wgpu::*;

use super::texture::{GpuFormat, TextureBackend};
use crate::error::UploadError;
use crate::GpuBackend;

impl From<GpuBackend> for Backends {
    fn from(backend: GpuBackend) -> Self {
        match backend {
            GpuBackend::Auto => Backends::all(),
            GpuBackend::Vulkan => Backends::VULKAN,
            GpuBackend::Metal => Backends::METAL,
            GpuBackend::Dx12 => Backends::DX12,
            GpuBackend::OpenGl => Backends::GL,
        }
    }
}

impl From<GpuFormat> for TextureFormat {
    fn from(format: GpuFormat) -> Self {
        match format {
            GpuFormat::Rgba8Unorm => TextureFormat::Rgba8Unorm,
            GpuFormat::Rgba8UnormSrgb => TextureFormat::Rgba8UnormSrgb,
            GpuFormat::Bgra8Unorm => TextureFormat::Bgra8Unorm,
            GpuFormat::Bgra8UnormSrgb => TextureFormat::Bgra8UnormSrgb,
        }
    }
}

/// A frame texture and the view the render pass samples from
#[derive(Debug)]
pub struct GpuTexture {
    pub texture: Texture,
    pub view: TextureView,
}

/// Uploads frames into textures on a wgpu device
pub struct GpuTextures {
    device: Arc<Device>,
    queue: Arc<Queue>,
}

impl GpuTextures {
    /// Use a device owned by the windowing side.
    pub fn new(device: Arc<Device>, queue: Arc<Queue>) -> Self {
        Self { device, queue }
    }

    /// Open a device with no surface attached
    #[instrument]
    pub async fn headless(backend: GpuBackend) -> Result<Self> {
        info!("Initializing WebGPU device");

        let instance = Instance::new(InstanceDescriptor {
            backends: backend.into(),
            ..Default::default()
        });

        // Get adapter - prefer high-performance
        let adapter = instance
            .request_adapter(&RequestAdapterOptions {
                power_preference: PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .ok_or_else(|| eyre!("No suitable GPU adapter found"))?;

        info!("GPU: {}", adapter.get_info().name);

        let (device, queue) = adapter
            .request_device(
                &DeviceDescriptor {
                    label: Some("Hermes GPU Device"),
                    required_features: Features::empty(),
                    required_limits: Limits::default(),
                    memory_hints: MemoryHints::Performance,
                },
                None,
            )
            .await?;

        Ok(Self::new(Arc::new(device), Arc::new(queue)))
    }

    /// [`GpuTextures::headless`] for callers outside an async runtime.
    pub fn headless_blocking(backend: GpuBackend) -> Result<Self> {
        pollster::block_on(Self::headless(backend))
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn queue(&self) -> &Arc<Queue> {
        &self.queue
    }
}

impl TextureBackend for GpuTextures {
    type Texture = GpuTexture;

    fn create_texture(
        &mut self,
        label: &str,
        width: u32,
        height: u32,
        format: GpuFormat,
    ) -> Result<GpuTexture, UploadError> {
        let limit = self.device.limits().max_texture_dimension_2d;
        if width > limit || height > limit {
            return Err(UploadError::Backend(format!(
                "{width}x{height} exceeds device texture limit {limit}"
            )));
        }

        let texture = self.device.create_texture(&TextureDescriptor {
            label: Some(label),
            size: Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: TextureDimension::D2,
            format: format.into(),
            usage: TextureUsages::TEXTURE_BINDING | TextureUsages::COPY_DST,
            view_formats: &[],
        });
        let view = texture.create_view(&TextureViewDescriptor::default());

        Ok(GpuTexture { texture, view })
    }

    fn write_texture(
        &mut self,
        texture: &GpuTexture,
        pixels: &[u8],
        width: u32,
        height: u32,
    ) -> Result<(), UploadError> {
        let size = texture.texture.size();
        let bytes_per_row = GpuFormat::BYTES_PER_PIXEL * width;
        if (size.width, size.height) != (width, height)
            || pixels.len() != bytes_per_row as usize * height as usize
        {
            return Err(UploadError::Backend(format!(
                "write of {width}x{height} ({} bytes) into {}x{} texture",
                pixels.len(),
                size.width,
                size.height
            )));
        }

        self.queue.write_texture(
            ImageCopyTexture {
                texture: &texture.texture,
                mip_level: 0,
                origin: Origin3d::ZERO,
                aspect: TextureAspect::All,
            },
            pixels,
            ImageDataLayout {
                offset: 0,
                bytes_per_row: Some(bytes_per_row),
                rows_per_image: Some(height),
            },
            size,
        );

        Ok(())
    }
}
