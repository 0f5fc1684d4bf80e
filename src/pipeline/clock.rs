//! Maps frame timestamps onto wall-clock deadlines and picks the frame to show
//! on each render tick.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::decode::frame::{Frame, FrameInfo};
use crate::pipeline::ringbuf::FrameQueue;

/// How far the clock may jump when the renderer fell behind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum CatchUpPolicy {
    /// Skip every due frame except the newest one
    #[default]
    Latest,
    /// Skip at most `max_skip` due frames per tick; the rest wait for later ticks
    Bounded { max_skip: usize },
}

impl CatchUpPolicy {
    fn may_skip(self, skipped_this_tick: usize) -> bool {
        match self {
            Self::Latest => true,
            Self::Bounded { max_skip } => skipped_this_tick < max_skip,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Stale,
    Take,
    Wait,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClockStats {
    pub shown: u64,
    /// Due frames passed over in favour of a newer due frame
    pub skipped: u64,
    /// Frames older than the last shown one
    pub stale: u64,
}

/// Render-thread presentation clock.
///
/// The first frame seen anchors the stream: its timestamp maps to the wall
/// time of that tick (T0), and every later frame is due at
/// `T0 + (timestamp - first_timestamp)`.
#[derive(Debug)]
pub struct PresentationClock {
    policy: CatchUpPolicy,
    origin: Option<(Instant, u64)>,
    last_shown: Option<u64>,
    stats: ClockStats,
}

impl PresentationClock {
    pub fn new(policy: CatchUpPolicy) -> Self {
        Self {
            policy,
            origin: None,
            last_shown: None,
            stats: ClockStats::default(),
        }
    }

    /// Anchor `base_timestamp_us` to wall time `now`.
    pub fn start_at(&mut self, now: Instant, base_timestamp_us: u64) {
        debug!(base_timestamp_us, "presentation clock started");
        self.origin = Some((now, base_timestamp_us));
    }

    pub fn is_started(&self) -> bool {
        self.origin.is_some()
    }

    /// Wall time at which a frame with this timestamp becomes due.
    pub fn deadline(&self, timestamp_us: u64) -> Option<Instant> {
        self.origin.map(|(t0, base)| {
            t0 + Duration::from_micros(timestamp_us.saturating_sub(base))
        })
    }

    pub fn is_due(&self, timestamp_us: u64, now: Instant) -> bool {
        self.deadline(timestamp_us)
            .is_some_and(|deadline| now >= deadline)
    }

    /// Pull the frame to display at `now` out of `queue`.
    ///
    /// Returns `None` when nothing new is due; the caller keeps showing what
    /// it has. Stale and skipped frames are released to the pool here.
    pub fn next_due(&mut self, queue: &FrameQueue, now: Instant) -> Option<Frame> {
        let mut chosen: Option<Frame> = None;
        let mut skipped_this_tick = 0;

        loop {
            let holding = chosen.is_some();
            let mut verdict = Verdict::Wait;
            let popped = queue.pop_if(|head| {
                verdict = self.judge(head, now, holding, skipped_this_tick);
                verdict != Verdict::Wait
            });
            let Some(frame) = popped else { break };

            match verdict {
                Verdict::Stale => {
                    trace!(timestamp_us = frame.timestamp_us(), "discarding stale frame");
                    self.stats.stale += 1;
                    metrics::counter!("frames_dropped", "reason" => "stale").increment(1);
                    queue.release(frame);
                }
                Verdict::Take | Verdict::Wait => {
                    if let Some(passed) = chosen.replace(frame) {
                        trace!(timestamp_us = passed.timestamp_us(), "skipping late frame");
                        skipped_this_tick += 1;
                        queue.release(passed);
                    }
                }
            }
        }

        if skipped_this_tick > 0 {
            self.stats.skipped += skipped_this_tick as u64;
            metrics::counter!("frames_dropped", "reason" => "late").increment(skipped_this_tick as u64);
            debug!(skipped = skipped_this_tick, "renderer behind, caught up");
        }
        if let Some(frame) = &chosen {
            self.last_shown = Some(frame.timestamp_us());
            self.stats.shown += 1;
        }
        chosen
    }

    /// What to do with the queue head at `now`. Runs under the queue lock.
    fn judge(&mut self, head: &FrameInfo, now: Instant, holding: bool, skipped: usize) -> Verdict {
        if self.last_shown.is_some_and(|last| head.timestamp_us < last) {
            return Verdict::Stale;
        }
        if !self.is_started() {
            self.start_at(now, head.timestamp_us);
        }
        if !self.is_due(head.timestamp_us, now) || (holding && !self.policy.may_skip(skipped)) {
            return Verdict::Wait;
        }
        Verdict::Take
    }

    /// Timestamp of the most recently selected frame. Never decreases.
    pub fn last_shown(&self) -> Option<u64> {
        self.last_shown
    }

    pub fn policy(&self) -> CatchUpPolicy {
        self.policy
    }

    pub fn stats(&self) -> ClockStats {
        self.stats
    }
}
