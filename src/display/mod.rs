pub mod gpu;
pub mod render;
pub mod texture;

pub use gpu::{GpuTexture, GpuTextures};
pub use render::{DrawCommand, RenderLoop, RenderStats};
pub use texture::{
    ConversionTable, FormatMapping, GpuFormat, HostTexture, HostTextures, TextureBackend,
    TextureHandle, TextureUploader, UploadStats,
};
