pub mod clock;
pub mod pool;
pub mod ringbuf;

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub use clock::{CatchUpPolicy, ClockStats, PresentationClock};
pub use pool::{FramePool, PoolStats, SlotOwner};
pub use ringbuf::{FrameQueue, OverflowPolicy, PushOutcome, QueueStats};

use crate::decode::packet::PacketSource;
use crate::decode::worker::{DecodeWorker, PipelineEvent, WorkerHandle};
use crate::decode::Decoder;
use crate::display::render::RenderLoop;
use crate::display::texture::{ConversionTable, TextureBackend, TextureUploader};
use crate::error::ConfigError;
use crate::{DisplayConfig, PipelineConfig};

/// Cooperative stop flag shared with the decode worker.
///
/// Setting it does not wake blocked waiters by itself; pair it with
/// `FramePool::interrupt` / `FrameQueue::interrupt` (as `WorkerHandle::stop` does).
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// The shared half of the pipeline: pool, queue and the lifecycle event
/// channel. Hands out the decode worker and the render loop wired to them.
pub struct Pipeline {
    config: PipelineConfig,
    queue: Arc<FrameQueue>,
    events: (flume::Sender<PipelineEvent>, flume::Receiver<PipelineEvent>),
}

impl Pipeline {
    pub fn new(config: &PipelineConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let pool = Arc::new(FramePool::from_config(config));
        let queue = Arc::new(FrameQueue::new(
            config.queue_capacity,
            config.overflow_policy,
            pool,
        ));

        Ok(Self {
            config: config.clone(),
            queue,
            events: flume::unbounded(),
        })
    }

    pub fn pool(&self) -> &Arc<FramePool> {
        self.queue.pool()
    }

    pub fn queue(&self) -> &Arc<FrameQueue> {
        &self.queue
    }

    /// Receiver for `EndOfStream` notifications.
    pub fn events(&self) -> flume::Receiver<PipelineEvent> {
        self.events.1.clone()
    }

    /// Decode worker publishing into this pipeline, not yet running.
    pub fn decode_worker<S, D>(&self, source: S, decoder: D) -> DecodeWorker<S, D>
    where
        S: PacketSource,
        D: Decoder,
    {
        DecodeWorker::new(
            source,
            decoder,
            self.queue.clone(),
            self.events.0.clone(),
            &self.config,
        )
    }

    /// Start a decode worker on its own thread.
    pub fn spawn_decoder<S, D>(&self, source: S, decoder: D) -> io::Result<WorkerHandle>
    where
        S: PacketSource + 'static,
        D: Decoder + 'static,
    {
        self.decode_worker(source, decoder).spawn()
    }

    /// Render side of the pipeline, uploading through `backend`.
    pub fn render_loop<B: TextureBackend>(&self, backend: B, display: &DisplayConfig) -> RenderLoop<B> {
        let uploader = TextureUploader::new(
            backend,
            ConversionTable::new(&display.pixel_format_conversion),
            self.config.max_width,
            self.config.max_height,
        );
        RenderLoop::new(
            self.queue.clone(),
            PresentationClock::new(self.config.catch_up),
            uploader,
            self.events(),
        )
    }
}
