pub mod decode;
pub mod display;
pub mod error;
pub mod pipeline;
pub mod utils;

use std::path::{Path, PathBuf};

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

pub use decode::{Decoder, EndReason, FrameDecoder, PacketSource, PipelineEvent};
pub use display::{DrawCommand, RenderLoop, TextureBackend};
pub use error::ConfigError;
pub use pipeline::{CatchUpPolicy, OverflowPolicy, Pipeline};

use display::texture::{default_mappings, FormatMapping, UploadStats};
use display::RenderStats;
use pipeline::{ClockStats, PoolStats, QueueStats};

/// Global configuration that can be atomically swapped at runtime
pub static CONFIG: once_cell::sync::Lazy<ArcSwap<Config>> =
    once_cell::sync::Lazy::new(|| ArcSwap::from_pointee(Config::default()));

/// System configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub source: SourceConfig,
    pub pipeline: PipelineConfig,
    pub display: DisplayConfig,
}

/// Image-sequence input for the bundled player
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Directory of JPEG frames
    pub path: PathBuf,
    pub fps: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Frame slots preallocated by the pool
    pub pool_capacity: usize,
    pub queue_capacity: usize,
    pub overflow_policy: OverflowPolicy,
    pub max_consecutive_decode_failures: u32,
    /// Largest frame the pool and uploader accept
    pub max_width: u32,
    pub max_height: u32,
    pub catch_up: CatchUpPolicy,
    /// CPU core to pin the decode thread to
    pub decode_core: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    pub refresh_hz: u32,
    pub backend: GpuBackend,
    pub pixel_format_conversion: Vec<FormatMapping>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GpuBackend {
    Vulkan,
    Metal,
    Dx12,
    OpenGl,
    #[default]
    Auto,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("frames"),
            fps: 30,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            pool_capacity: 8,
            queue_capacity: 4,
            overflow_policy: OverflowPolicy::Block,
            max_consecutive_decode_failures: 5,
            max_width: 1920,
            max_height: 1080,
            catch_up: CatchUpPolicy::Latest,
            decode_core: None,
        }
    }
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            refresh_hz: 60,
            backend: GpuBackend::Auto,
            pixel_format_conversion: default_mappings(),
        }
    }
}

impl Config {
    /// Defaults, overlaid by the TOML file at `path` if given, overlaid by
    /// `HERMES__<SECTION>__<KEY>` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let config: Self = builder
            .add_source(
                config::Environment::with_prefix("HERMES")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.source.fps == 0 {
            return Err(ConfigError::Invalid("source.fps must be positive".into()));
        }
        self.pipeline.validate()?;
        self.display.validate()
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        // The renderer keeps the displayed frame's slot, so one slot alone
        // would starve the decoder
        if self.pool_capacity < 2 {
            return Err(ConfigError::Invalid(format!(
                "pipeline.pool_capacity must be at least 2, got {}",
                self.pool_capacity
            )));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "pipeline.queue_capacity must be positive".into(),
            ));
        }
        if self.max_consecutive_decode_failures == 0 {
            return Err(ConfigError::Invalid(
                "pipeline.max_consecutive_decode_failures must be positive".into(),
            ));
        }
        if self.max_width == 0 || self.max_height == 0 {
            return Err(ConfigError::Invalid(format!(
                "pipeline frame maxima {}x{} must be positive",
                self.max_width, self.max_height
            )));
        }
        Ok(())
    }
}

impl DisplayConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.refresh_hz == 0 {
            return Err(ConfigError::Invalid(
                "display.refresh_hz must be positive".into(),
            ));
        }
        if self.pixel_format_conversion.is_empty() {
            return Err(ConfigError::Invalid(
                "display.pixel_format_conversion is empty".into(),
            ));
        }
        Ok(())
    }
}

/// Snapshot of every pipeline counter
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub pool: PoolStats,
    pub queue: QueueStats,
    pub clock: ClockStats,
    pub upload: UploadStats,
    pub render: RenderStats,
}
