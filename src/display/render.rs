//! Per-refresh entry point driven by the windowing side.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, info, instrument, warn};

use super::texture::{TextureBackend, TextureUploader};
use crate::decode::frame::Frame;
use crate::decode::worker::{EndReason, PipelineEvent};
use crate::pipeline::{FrameQueue, PresentationClock};
use crate::PipelineStats;

/// What the driver should draw this refresh
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrawCommand {
    /// Which texture of the front/back pair is current
    pub texture: usize,
    pub timestamp_us: u64,
    pub width: u32,
    pub height: u32,
    /// False when redrawing the previous frame because nothing new was due
    pub fresh: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RenderStats {
    pub ticks: u64,
    /// Ticks that put a new frame on screen
    pub presented: u64,
    /// Ticks that redrew the previous frame
    pub repeated: u64,
    /// Due frames dropped because they could not be uploaded
    pub upload_failures: u64,
}

/// Render side of the pipeline. Call [`RenderLoop::tick`] once per display
/// refresh and draw [`RenderLoop::current_texture`].
pub struct RenderLoop<B: TextureBackend> {
    queue: Arc<FrameQueue>,
    clock: PresentationClock,
    uploader: TextureUploader<B>,
    /// Frame whose pixels are in the current texture; released once replaced
    showing: Option<Frame>,
    events: flume::Receiver<PipelineEvent>,
    end: Option<EndReason>,
    stats: RenderStats,
}

impl<B: TextureBackend> RenderLoop<B> {
    pub fn new(
        queue: Arc<FrameQueue>,
        clock: PresentationClock,
        uploader: TextureUploader<B>,
        events: flume::Receiver<PipelineEvent>,
    ) -> Self {
        Self {
            queue,
            clock,
            uploader,
            showing: None,
            events,
            end: None,
            stats: RenderStats::default(),
        }
    }

    pub fn tick(&mut self) -> Option<DrawCommand> {
        self.tick_at(Instant::now())
    }

    /// Pick the frame due at `now`, upload it and describe the draw. Never
    /// blocks. Returns `None` until the first frame has been shown.
    #[instrument(level = "trace", skip_all)]
    pub fn tick_at(&mut self, now: Instant) -> Option<DrawCommand> {
        self.stats.ticks += 1;
        self.poll_events();

        let updating = matches!(self.end, None | Some(EndReason::SourceExhausted));
        if updating {
            if let Some(frame) = self.clock.next_due(&self.queue, now) {
                if let Some(draw) = self.present(frame) {
                    return Some(draw);
                }
            }
        }

        let draw = self.redraw()?;
        self.stats.repeated += 1;
        Some(draw)
    }

    fn poll_events(&mut self) {
        while let Ok(PipelineEvent::EndOfStream { reason }) = self.events.try_recv() {
            if self.end.is_some() {
                continue;
            }
            info!(?reason, "End of stream");
            self.end = Some(reason);
            if reason != EndReason::SourceExhausted {
                let flushed = self.queue.flush();
                debug!(flushed, "stopped updating");
            }
        }
    }

    fn present(&mut self, frame: Frame) -> Option<DrawCommand> {
        let info = frame.info();
        let uploaded = match self.queue.pool().read(frame.slot()) {
            Ok(pixels) => self
                .uploader
                .upload(&info, &pixels)
                .map(|handle| handle.front_index()),
            Err(e) => {
                error!(slot = %frame.slot(), "due frame has no storage: {e}");
                self.queue.release(frame);
                return None;
            }
        };

        match uploaded {
            Ok(texture) => {
                // The new frame is on the front texture; the old one can go
                if let Some(previous) = self.showing.replace(frame) {
                    self.queue.release(previous);
                }
                self.stats.presented += 1;
                metrics::counter!("frames_presented").increment(1);
                Some(DrawCommand {
                    texture,
                    timestamp_us: info.timestamp_us,
                    width: info.width,
                    height: info.height,
                    fresh: true,
                })
            }
            Err(e) => {
                warn!(timestamp_us = info.timestamp_us, "dropping frame: {e}");
                self.stats.upload_failures += 1;
                metrics::counter!("frames_dropped", "reason" => "upload").increment(1);
                self.queue.release(frame);
                None
            }
        }
    }

    fn redraw(&self) -> Option<DrawCommand> {
        let frame = self.showing.as_ref()?;
        let handle = self.uploader.handle()?;
        Some(DrawCommand {
            texture: handle.front_index(),
            timestamp_us: frame.timestamp_us(),
            width: frame.width(),
            height: frame.height(),
            fresh: false,
        })
    }

    /// Texture to sample in this refresh's draw call.
    pub fn current_texture(&self) -> Option<&B::Texture> {
        self.uploader.current_texture()
    }

    pub fn end_of_stream(&self) -> Option<EndReason> {
        self.end
    }

    /// Nothing more will ever be shown: the stream ended and, for a clean
    /// end, every queued frame has been consumed.
    pub fn is_finished(&self) -> bool {
        match self.end {
            None => false,
            Some(EndReason::SourceExhausted) => self.queue.is_empty(),
            Some(_) => true,
        }
    }

    /// Release the displayed frame and everything still queued.
    pub fn shutdown(&mut self) {
        if let Some(frame) = self.showing.take() {
            self.queue.release(frame);
        }
        let flushed = self.queue.flush();
        debug!(flushed, "render loop shut down");
    }

    pub fn clock(&self) -> &PresentationClock {
        &self.clock
    }

    pub fn uploader(&self) -> &TextureUploader<B> {
        &self.uploader
    }

    pub fn stats(&self) -> RenderStats {
        self.stats
    }

    pub fn pipeline_stats(&self) -> PipelineStats {
        PipelineStats {
            pool: self.queue.pool().stats(),
            queue: self.queue.stats(),
            clock: self.clock.stats(),
            upload: self.uploader.stats(),
            render: self.stats,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::decoder::FrameDecoder;
    use crate::decode::frame::PixelFormat;
    use crate::decode::packet::{IterSource, Packet};
    use crate::display::texture::{FormatMapping, GpuFormat, HostTextures};
    use crate::pipeline::Pipeline;
    use crate::{DisplayConfig, PipelineConfig};
    use std::time::Duration;

    fn pipeline() -> Pipeline {
        Pipeline::new(&PipelineConfig {
            pool_capacity: 8,
            queue_capacity: 8,
            max_width: 2,
            max_height: 2,
            ..PipelineConfig::default()
        })
        .unwrap()
    }

    fn decode_all(pipeline: &Pipeline, packets: Vec<Packet>) -> EndReason {
        pipeline
            .decode_worker(IterSource(packets.into_iter()), FrameDecoder::new())
            .run()
    }

    fn rgb(timestamp_ms: u64, shade: u8) -> Packet {
        Packet::raw(timestamp_ms * 1000, PixelFormat::Rgb8, 2, 2, vec![shade; 12])
    }

    fn shown_ms(draw: Option<DrawCommand>) -> Option<(u64, bool)> {
        draw.map(|d| (d.timestamp_us / 1000, d.fresh))
    }

    #[test]
    fn late_ticks_catch_up_and_repeat_last_frame() {
        let pipeline = pipeline();
        let packets = [0, 16, 33, 50, 66].iter().map(|&ms| rgb(ms, ms as u8)).collect();
        decode_all(&pipeline, packets);

        let mut render = pipeline.render_loop(HostTextures::new(), &DisplayConfig::default());
        let t0 = Instant::now();

        assert_eq!(shown_ms(render.tick_at(t0)), Some((0, true)));
        assert!(!render.is_finished());
        assert_eq!(shown_ms(render.tick_at(t0 + Duration::from_millis(40))), Some((33, true)));
        assert_eq!(shown_ms(render.tick_at(t0 + Duration::from_millis(80))), Some((66, true)));
        assert_eq!(shown_ms(render.tick_at(t0 + Duration::from_millis(100))), Some((66, false)));

        let texture = render.current_texture().unwrap();
        assert_eq!(render.uploader().backend().pixels(texture).unwrap()[0], 66);
        assert!(render.is_finished());
        assert_eq!(render.end_of_stream(), Some(EndReason::SourceExhausted));

        let stats = render.pipeline_stats();
        assert_eq!(stats.clock.skipped, 2);
        assert_eq!(stats.render.presented, 3);
        assert_eq!(stats.render.repeated, 1);
        // only the frame on screen still holds a slot
        assert_eq!(stats.pool.available, 7);

        render.shutdown();
        assert_eq!(pipeline.pool().outstanding(), 0);
    }

    #[test]
    fn nothing_to_draw_before_first_frame() {
        let pipeline = pipeline();
        let mut render = pipeline.render_loop(HostTextures::new(), &DisplayConfig::default());
        assert_eq!(render.tick(), None);
        assert!(render.current_texture().is_none());
    }

    #[test]
    fn unsupported_frame_is_dropped_and_previous_kept() {
        let pipeline = pipeline();
        decode_all(
            &pipeline,
            vec![
                rgb(0, 1),
                Packet::raw(10_000, PixelFormat::Bgra8, 2, 2, vec![2u8; 16]),
            ],
        );
        let display = DisplayConfig {
            pixel_format_conversion: vec![FormatMapping {
                source: PixelFormat::Rgb8,
                target: GpuFormat::Rgba8Unorm,
            }],
            ..DisplayConfig::default()
        };
        let mut render = pipeline.render_loop(HostTextures::new(), &display);
        let t0 = Instant::now();

        assert_eq!(shown_ms(render.tick_at(t0)), Some((0, true)));
        assert_eq!(shown_ms(render.tick_at(t0 + Duration::from_millis(20))), Some((0, false)));
        assert_eq!(render.stats().upload_failures, 1);
        assert_eq!(pipeline.pool().outstanding(), 1);

        render.shutdown();
        assert_eq!(pipeline.pool().outstanding(), 0);
    }

    #[test]
    fn decode_failure_stops_updates() {
        let pipeline = pipeline();
        let mut packets = vec![rgb(0, 1), rgb(10, 2)];
        packets.extend((20..25).map(|ms| Packet::raw(ms * 1000, PixelFormat::Rgb8, 2, 2, vec![0u8; 1])));
        assert_eq!(decode_all(&pipeline, packets), EndReason::DecodeFailure);
        assert_eq!(pipeline.queue().len(), 2);

        let mut render = pipeline.render_loop(HostTextures::new(), &DisplayConfig::default());
        assert_eq!(render.tick(), None);
        assert_eq!(render.end_of_stream(), Some(EndReason::DecodeFailure));
        assert!(render.is_finished());
        assert_eq!(pipeline.pool().outstanding(), 0);
    }
}
