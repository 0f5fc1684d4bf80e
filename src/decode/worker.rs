//! The decode thread: packets in, pool-backed frames out.

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use tracing::{debug, error, info, instrument, warn};

use super::decoder::Decoder;
use super::frame::{Frame, FrameInfo};
use super::packet::PacketSource;
use crate::error::{DecodeError, WorkerPanic};
use crate::pipeline::{FrameQueue, StopSignal};
use crate::utils;
use crate::PipelineConfig;

/// Why decoding stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// The source ran dry after the last frame was published
    SourceExhausted,
    /// Too many units in a row failed to decode
    DecodeFailure,
    /// The stop signal fired
    Cancelled,
}

/// Lifecycle notifications sent to the render side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineEvent {
    EndOfStream { reason: EndReason },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub decoded: u64,
    pub published: u64,
    pub failed: u64,
    /// Frames dropped for arriving with a timestamp behind the last published one
    pub stale: u64,
}

/// What a finished worker thread hands back on join.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerReport {
    pub reason: EndReason,
    pub stats: WorkerStats,
}

/// Decodes packets from `S` with `D` into pool slots and publishes them to
/// the frame queue in decode order.
pub struct DecodeWorker<S, D> {
    source: S,
    decoder: D,
    queue: Arc<FrameQueue>,
    stop: StopSignal,
    events: flume::Sender<PipelineEvent>,
    max_consecutive_failures: u32,
    core: Option<usize>,
    last_published: Option<u64>,
    stats: WorkerStats,
}

impl<S, D> DecodeWorker<S, D>
where
    S: PacketSource,
    D: Decoder,
{
    pub fn new(
        source: S,
        decoder: D,
        queue: Arc<FrameQueue>,
        events: flume::Sender<PipelineEvent>,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            source,
            decoder,
            queue,
            stop: StopSignal::new(),
            events,
            max_consecutive_failures: config.max_consecutive_decode_failures.max(1),
            core: config.decode_core,
            last_published: None,
            stats: WorkerStats::default(),
        }
    }

    /// Signal that cancels this worker. Pair with the pool and queue
    /// `interrupt` calls to wake it from a blocking wait.
    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats
    }

    /// Decode until the source ends, failures pile up or the stop signal
    /// fires. Emits exactly one `EndOfStream` and returns its reason.
    #[instrument(skip(self), name = "decode_worker")]
    pub fn run(&mut self) -> EndReason {
        info!("Decode worker started");
        let reason = self.decode_loop();

        info!(
            ?reason,
            decoded = self.stats.decoded,
            published = self.stats.published,
            failed = self.stats.failed,
            "Decode worker finished"
        );
        if self.events.send(PipelineEvent::EndOfStream { reason }).is_err() {
            debug!("nobody listening for end of stream");
        }
        reason
    }

    fn decode_loop(&mut self) -> EndReason {
        let pool = self.queue.pool().clone();
        let mut consecutive_failures = 0;

        loop {
            if self.stop.is_stopped() {
                return EndReason::Cancelled;
            }
            let Some(packet) = self.source.next_packet() else {
                return EndReason::SourceExhausted;
            };

            let slot = match pool.acquire_blocking(&self.stop) {
                Ok(slot) => slot,
                Err(e) => {
                    debug!("slot wait ended: {e}");
                    return EndReason::Cancelled;
                }
            };

            let started = Instant::now();
            let decoded = pool
                .write(slot)
                .map_err(DecodeError::from)
                .and_then(|mut bytes| self.decoder.decode(&packet, &mut bytes));

            let image = match decoded {
                Ok(image) => image,
                Err(e) => {
                    if let Err(e) = pool.release(slot) {
                        error!(%slot, "failed to release slot after decode error: {e}");
                    }
                    self.stats.failed += 1;
                    consecutive_failures += 1;
                    metrics::counter!("decode_failures").increment(1);

                    if consecutive_failures >= self.max_consecutive_failures {
                        error!(
                            consecutive_failures,
                            "giving up after repeated decode failures: {e}"
                        );
                        return EndReason::DecodeFailure;
                    }
                    warn!(
                        timestamp_us = packet.timestamp_us,
                        consecutive_failures, "skipping undecodable unit: {e}"
                    );
                    continue;
                }
            };

            consecutive_failures = 0;
            self.stats.decoded += 1;
            metrics::counter!("frames_decoded").increment(1);
            metrics::histogram!("decode_time_us").record(started.elapsed().as_micros() as f64);

            let frame = Frame::new(
                slot,
                FrameInfo {
                    timestamp_us: packet.timestamp_us,
                    width: image.width,
                    height: image.height,
                    format: image.format,
                    len: image.len,
                },
            );

            // The queue is never re-sorted, so publish order must be timestamp order
            if self
                .last_published
                .is_some_and(|last| frame.timestamp_us() < last)
            {
                warn!(timestamp_us = frame.timestamp_us(), "dropping out-of-order frame");
                self.stats.stale += 1;
                self.queue.release(frame);
                continue;
            }

            let timestamp_us = frame.timestamp_us();
            match self.queue.push(frame, &self.stop) {
                Ok(_) => {
                    self.last_published = Some(timestamp_us);
                    self.stats.published += 1;
                }
                Err(e) => {
                    debug!(timestamp_us, "publish abandoned: {e}");
                    self.queue.release(e.into_frame());
                    return EndReason::Cancelled;
                }
            }
        }
    }
}

impl<S, D> DecodeWorker<S, D>
where
    S: PacketSource + 'static,
    D: Decoder + 'static,
{
    /// Run on a dedicated `decode-worker` thread, pinned to the configured
    /// core if there is one.
    pub fn spawn(self) -> io::Result<WorkerHandle> {
        let stop = self.stop.clone();
        let queue = self.queue.clone();
        let core = self.core;

        let thread = thread::Builder::new()
            .name("decode-worker".into())
            .spawn(move || {
                if let Some(core) = core {
                    utils::pin_current_thread(core);
                }
                let mut worker = self;
                let reason = worker.run();
                WorkerReport {
                    reason,
                    stats: worker.stats,
                }
            })?;

        Ok(WorkerHandle {
            stop,
            queue,
            thread: Some(thread),
        })
    }
}

/// Owner of a running decode thread. Dropping it stops and joins the thread.
pub struct WorkerHandle {
    stop: StopSignal,
    queue: Arc<FrameQueue>,
    thread: Option<JoinHandle<WorkerReport>>,
}

impl WorkerHandle {
    /// Ask the worker to stop and wake it if it is waiting on the pool or
    /// the queue.
    pub fn stop(&self) {
        self.stop.stop();
        self.queue.interrupt();
        self.queue.pool().interrupt();
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Wait for the thread to end. Does not stop it first.
    pub fn join(mut self) -> Result<WorkerReport, WorkerPanic> {
        match self.thread.take() {
            Some(thread) => thread.join().map_err(WorkerPanic::from_payload),
            None => Err(WorkerPanic("worker already joined".into())),
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.take() {
            self.stop();
            if let Err(payload) = thread.join() {
                error!("{}", WorkerPanic::from_payload(payload));
            }
        }
    }
}
