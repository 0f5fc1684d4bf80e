use std::time::Duration;

use tracing::{info, warn};

/// Microseconds between frames at `fps`. Zero fps is treated as 1.
pub fn frame_interval_us(fps: u32) -> u64 {
    1_000_000 / u64::from(fps.max(1))
}

/// Render tick period for a display refresh rate.
pub fn refresh_interval(refresh_hz: u32) -> Duration {
    Duration::from_secs(1) / refresh_hz.max(1)
}

/// Pin the calling thread to CPU `core`. Failure only costs latency, so it
/// is logged and otherwise ignored.
pub fn pin_current_thread(core: usize) -> bool {
    let Some(core_id) = core_affinity::get_core_ids()
        .and_then(|ids| ids.into_iter().find(|id| id.id == core))
    else {
        warn!(core, "CPU core not available, thread left unpinned");
        return false;
    };

    let pinned = core_affinity::set_for_current(core_id);
    if pinned {
        info!(core, "Pinned thread to CPU core");
    } else {
        warn!(core, "Failed to pin thread");
    }
    pinned
}
