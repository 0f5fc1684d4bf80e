use std::thread;
use std::time::{Duration, Instant};

use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;

use hermes::decode::{ChannelSource, IterSource, Packet};
use hermes::display::HostTextures;
use hermes::{
    DisplayConfig, EndReason, FrameDecoder, OverflowPolicy, Pipeline, PipelineConfig,
};

const SIDE: u32 = 16;

fn jpeg(shade: u8) -> Vec<u8> {
    let rgb = vec![shade; (SIDE * SIDE * 3) as usize];
    let mut encoded = Vec::new();
    JpegEncoder::new_with_quality(&mut encoded, 95)
        .encode(&rgb, SIDE, SIDE, ExtendedColorType::Rgb8)
        .unwrap();
    encoded
}

fn config(pool_capacity: usize, queue_capacity: usize, overflow_policy: OverflowPolicy) -> PipelineConfig {
    PipelineConfig {
        pool_capacity,
        queue_capacity,
        overflow_policy,
        max_width: SIDE,
        max_height: SIDE,
        ..PipelineConfig::default()
    }
}

fn frame_packets(count: u64) -> Vec<Packet> {
    (0..count)
        .map(|i| Packet::mjpeg(i * 40_000, jpeg((i * 20) as u8)))
        .collect()
}

#[test]
fn block_policy_presents_every_frame_in_order() {
    let pipeline = Pipeline::new(&config(4, 2, OverflowPolicy::Block)).unwrap();
    let worker = pipeline
        .spawn_decoder(IterSource(frame_packets(12).into_iter()), FrameDecoder::new())
        .unwrap();
    let mut render = pipeline.render_loop(HostTextures::new(), &DisplayConfig::default());

    // one refresh per frame interval, waiting for the decoder when it lags
    let mut now = Instant::now();
    let mut shown = Vec::new();
    for _ in 0..20_000 {
        if pipeline.queue().is_empty() && !worker.is_finished() {
            thread::sleep(Duration::from_millis(1));
            continue;
        }
        if let Some(draw) = render.tick_at(now) {
            if draw.fresh {
                shown.push(draw.timestamp_us / 1000);
            }
        }
        if render.is_finished() {
            break;
        }
        now += Duration::from_millis(40);
    }

    assert_eq!(shown, (0..12).map(|i| i * 40).collect::<Vec<_>>());
    let report = worker.join().unwrap();
    assert_eq!(report.reason, EndReason::SourceExhausted);
    assert_eq!(report.stats.published, 12);

    let stats = render.pipeline_stats();
    assert_eq!(stats.clock.skipped, 0);
    assert_eq!(stats.queue.frames_dropped, 0);
    assert!(stats.pool.acquired_total >= 12);

    render.shutdown();
    assert_eq!(pipeline.pool().outstanding(), 0);
}

#[test]
fn drop_oldest_keeps_most_recent_frames() {
    let pipeline = Pipeline::new(&config(4, 2, OverflowPolicy::DropOldest)).unwrap();
    let worker = pipeline
        .spawn_decoder(IterSource(frame_packets(10).into_iter()), FrameDecoder::new())
        .unwrap();
    let report = worker.join().unwrap();
    assert_eq!(report.reason, EndReason::SourceExhausted);
    assert_eq!(pipeline.queue().stats().frames_dropped, 8);

    let mut render = pipeline.render_loop(HostTextures::new(), &DisplayConfig::default());
    let t0 = Instant::now();
    let first = render.tick_at(t0).unwrap();
    let second = render.tick_at(t0 + Duration::from_millis(40)).unwrap();
    assert_eq!((first.timestamp_us, second.timestamp_us), (320_000, 360_000));
    assert!(render.is_finished());

    // the last frame was a uniform grey; the texture holds it as RGBA
    let texture = render.current_texture().unwrap();
    let pixels = render.uploader().backend().pixels(texture).unwrap();
    assert_eq!(pixels.len(), (SIDE * SIDE * 4) as usize);
    assert!(pixels.chunks_exact(4).all(|px| px[0].abs_diff(180) <= 4 && px[3] == 255));

    render.shutdown();
    assert_eq!(pipeline.pool().outstanding(), 0);
}

#[test]
fn repeated_decode_failures_end_stream_without_leaks() {
    let pipeline = Pipeline::new(&config(4, 4, OverflowPolicy::Block)).unwrap();
    let (tx, source) = ChannelSource::bounded(16);
    tx.send(Packet::mjpeg(0, jpeg(50))).unwrap();
    for i in 1..=5u64 {
        tx.send(Packet::mjpeg(i * 40_000, vec![0xFF, 0xD8, 0xFF, 0x00])).unwrap();
    }
    tx.send(Packet::mjpeg(240_000, jpeg(60))).unwrap();

    let worker = pipeline.spawn_decoder(source, FrameDecoder::new()).unwrap();
    let report = worker.join().unwrap();
    assert_eq!(report.reason, EndReason::DecodeFailure);
    assert_eq!(report.stats.failed, 5);
    assert_eq!(tx.len(), 1);

    let mut render = pipeline.render_loop(HostTextures::new(), &DisplayConfig::default());
    assert_eq!(render.tick(), None);
    assert_eq!(render.end_of_stream(), Some(EndReason::DecodeFailure));
    assert!(render.is_finished());

    render.shutdown();
    assert_eq!(pipeline.pool().outstanding(), 0);
}

#[test]
fn cancelling_endless_stream_releases_every_slot() {
    let pipeline = Pipeline::new(&config(3, 2, OverflowPolicy::Block)).unwrap();
    let image = jpeg(90);
    let endless = IterSource((0u64..).map(move |i| Packet::mjpeg(i * 40_000, image.clone())));
    let worker = pipeline.spawn_decoder(endless, FrameDecoder::new()).unwrap();
    let mut render = pipeline.render_loop(HostTextures::new(), &DisplayConfig::default());

    let t0 = Instant::now();
    let mut presented = 0;
    for tick in 0..200u64 {
        if pipeline.queue().is_empty() {
            thread::sleep(Duration::from_millis(1));
        }
        if render
            .tick_at(t0 + Duration::from_millis(tick * 40))
            .is_some_and(|draw| draw.fresh)
        {
            presented += 1;
        }
        if presented >= 3 {
            break;
        }
    }
    assert!(presented >= 3);
    assert!(!worker.is_finished());

    worker.stop();
    let report = worker.join().unwrap();
    assert_eq!(report.reason, EndReason::Cancelled);

    let last = render.tick_at(t0 + Duration::from_secs(60));
    assert_eq!(render.end_of_stream(), Some(EndReason::Cancelled));
    assert!(last.is_some_and(|draw| !draw.fresh));
    assert!(render.is_finished());

    render.shutdown();
    assert_eq!(pipeline.pool().outstanding(), 0);
}
