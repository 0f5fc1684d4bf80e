//! Hermes headless player: decodes a JPEG image sequence on a worker thread
//! and presents it into GPU textures at the display refresh rate.

use std::path::PathBuf;
use std::sync::Arc;

use color_eyre::Result;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use hermes::decode::ImageSequence;
use hermes::display::GpuTextures;
use hermes::{utils, Config, FrameDecoder, Pipeline};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    init_tracing();

    info!("Hermes Launching...");

    // Load configuration; the optional first argument is a TOML file
    let config_path = std::env::args_os().nth(1).map(PathBuf::from);
    let config = Config::load(config_path.as_deref())?;
    hermes::CONFIG.store(Arc::new(config));
    let config = hermes::CONFIG.load_full();

    let source = ImageSequence::open(&config.source.path, config.source.fps)?;
    let pipeline = Pipeline::new(&config.pipeline)?;
    let worker = pipeline.spawn_decoder(source, FrameDecoder::new())?;

    let backend = GpuTextures::headless(config.display.backend).await?;
    let mut render = pipeline.render_loop(backend, &config.display);

    let mut ticker = tokio::time::interval(utils::refresh_interval(config.display.refresh_hz));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Some(draw) = render.tick() {
                    if draw.fresh {
                        debug!(timestamp_us = draw.timestamp_us, texture = draw.texture, "presented frame");
                    }
                }
                if render.is_finished() {
                    break;
                }
            }
            _ = &mut ctrl_c => {
                info!("Interrupted, shutting down");
                break;
            }
        }
    }

    worker.stop();
    let report = worker.join()?;
    render.shutdown();

    let stats = render.pipeline_stats();
    info!(
        reason = ?render.end_of_stream().unwrap_or(report.reason),
        decoded = report.stats.decoded,
        presented = stats.render.presented,
        skipped = stats.clock.skipped,
        leaked_slots = stats.pool.capacity - stats.pool.available,
        "Playback finished"
    );
    debug!("{stats:#?}");

    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("hermes=debug"));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .finish();

    #[cfg(feature = "profiling")]
    let subscriber = {
        use tracing_subscriber::layer::SubscriberExt;
        subscriber.with(tracing_tracy::TracyLayer::default())
    };

    subscriber.init();
}
