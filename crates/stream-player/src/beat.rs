//! Beat scheduler: beat-aligned UI ticks keyed off audible playback time.
//!
//! [`BeatTracker`] is the pure part: it is fed `(now, audible)` samples and returns the
//! beats that became due. Time during which the progress event is cleared (paused,
//! buffering, ended) is accumulated separately and excluded from elapsed time, which
//! keeps the schedule phase-aligned across pauses.
//!
//! [`spawn_beat_scheduler`] drives a tracker from a polling thread and forwards beats to
//! the UI channel until the schedule runs out, a newer track takes over, or it is stopped.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use beatbar_types::BeatEvent;
use crossbeam_channel::Sender;

use crate::error::{EngineError, Result};
use crate::signal::Event;

/// Ascending beat offsets (seconds from track start) plus the track tempo.
#[derive(Clone, Debug, PartialEq)]
pub struct BeatSchedule {
    tempo: f64,
    offsets: VecDeque<f64>,
    next_index: usize,
}

impl BeatSchedule {
    /// Uniform schedule: `k / (tempo / 60)` for every k with offset `< duration`.
    pub fn synthesize(tempo: f64, duration_secs: f64) -> Self {
        let mut offsets = VecDeque::new();
        if tempo.is_finite() && tempo > 0.0 && duration_secs.is_finite() {
            let beats_per_sec = tempo / 60.0;
            let mut k = 0u64;
            loop {
                let offset = k as f64 / beats_per_sec;
                if offset >= duration_secs {
                    break;
                }
                offsets.push_back(offset);
                k += 1;
            }
        }
        Self {
            tempo,
            offsets,
            next_index: 0,
        }
    }

    /// Schedule from explicit offsets; non-finite values are dropped and the rest sorted.
    pub fn from_offsets(tempo: f64, beats: &[f64]) -> Self {
        let mut sorted: Vec<f64> = beats.iter().copied().filter(|b| b.is_finite()).collect();
        sorted.sort_by(|a, b| a.total_cmp(b));
        Self {
            tempo,
            offsets: sorted.into(),
            next_index: 0,
        }
    }

    /// Explicit beats when supplied, otherwise synthesized from tempo.
    pub fn for_track(tempo: f64, beats: Option<&[f64]>, duration_secs: f64) -> Self {
        match beats {
            Some(beats) if !beats.is_empty() => Self::from_offsets(tempo, beats),
            _ => Self::synthesize(tempo, duration_secs),
        }
    }

    pub fn tempo(&self) -> f64 {
        self.tempo
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    pub fn offsets(&self) -> impl Iterator<Item = f64> + '_ {
        self.offsets.iter().copied()
    }

    /// Pop the next beat if it is due at `elapsed` (within `tolerance` early).
    fn pop_due(&mut self, elapsed: f64, tolerance: f64) -> Option<usize> {
        let next = *self.offsets.front()?;
        if next > elapsed + tolerance {
            return None;
        }
        self.offsets.pop_front();
        let index = self.next_index;
        self.next_index += 1;
        Some(index)
    }
}

/// Pure elapsed-time bookkeeping and beat popping.
#[derive(Clone, Debug)]
pub struct BeatTracker {
    schedule: BeatSchedule,
    duration_secs: f64,
    tolerance: f64,
    start_time: Option<f64>,
    paused_accum: f64,
    last_sample: Option<f64>,
    overrun_warned: bool,
}

impl BeatTracker {
    pub fn new(schedule: BeatSchedule, duration_secs: f64, tolerance_secs: f64) -> Self {
        Self {
            schedule,
            duration_secs,
            tolerance: tolerance_secs.max(0.0),
            start_time: None,
            paused_accum: 0.0,
            last_sample: None,
            overrun_warned: false,
        }
    }

    /// Audible seconds so far (0 until the first audible sample).
    pub fn elapsed(&self) -> f64 {
        match (self.start_time, self.last_sample) {
            (Some(start), Some(now)) => (now - start - self.paused_accum).max(0.0),
            _ => 0.0,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.schedule.is_empty()
    }

    pub fn remaining(&self) -> usize {
        self.schedule.len()
    }

    /// Feed one clock sample (`now` in seconds on any monotonic base).
    ///
    /// Returns every beat that became due, in schedule order.
    pub fn poll(&mut self, now: f64, audible: bool) -> Vec<BeatEvent> {
        match (self.start_time, self.last_sample) {
            (None, _) => {
                if audible {
                    self.start_time = Some(now);
                }
            }
            (Some(_), Some(last)) if !audible => {
                self.paused_accum += (now - last).max(0.0);
            }
            _ => {}
        }
        self.last_sample = Some(now);

        if self.start_time.is_none() {
            return Vec::new();
        }

        let elapsed = self.elapsed();
        if elapsed > self.duration_secs && !self.schedule.is_empty() && !self.overrun_warned {
            self.overrun_warned = true;
            tracing::warn!(
                elapsed_secs = elapsed,
                duration_secs = self.duration_secs,
                remaining_beats = self.schedule.len(),
                "elapsed time exceeds track duration"
            );
        }

        let mut due = Vec::new();
        if !audible {
            return due;
        }
        while let Some(index) = self.schedule.pop_due(elapsed, self.tolerance) {
            due.push(BeatEvent {
                index,
                tempo: self.schedule.tempo(),
                elapsed,
            });
        }
        due
    }
}

/// Identifies the track currently owning the "now playing" slot.
///
/// Each new track bumps the generation; a scheduler started for an older generation
/// exits on its next poll.
#[derive(Clone, Debug, Default)]
pub struct NowPlaying {
    generation: Arc<AtomicU64>,
}

impl NowPlaying {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the slot for a new track and return its generation.
    pub fn advance(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn current(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }
}

pub struct BeatOptions {
    pub poll_interval: Duration,
    pub tolerance_secs: f64,
}

/// Handle to a running beat scheduler thread.
pub struct BeatScheduler {
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<usize>>,
}

/// Start a scheduler thread for one track.
pub fn spawn_beat_scheduler(
    schedule: BeatSchedule,
    duration_secs: f64,
    progress: Arc<Event>,
    now_playing: NowPlaying,
    generation: u64,
    beats_tx: Sender<BeatEvent>,
    opts: BeatOptions,
) -> Result<BeatScheduler> {
    let stop = Arc::new(AtomicBool::new(false));
    let stop_for_thread = stop.clone();
    let total = schedule.len();
    let mut tracker = BeatTracker::new(schedule, duration_secs, opts.tolerance_secs);

    let join = thread::Builder::new()
        .name("beat-scheduler".to_string())
        .spawn(move || {
            let origin = Instant::now();
            let mut emitted = 0usize;
            while !tracker.is_finished() {
                if stop_for_thread.load(Ordering::Relaxed) || now_playing.current() != generation {
                    break;
                }
                let now = origin.elapsed().as_secs_f64();
                for beat in tracker.poll(now, progress.is_set()) {
                    emitted += 1;
                    let _ = beats_tx.send(beat);
                }
                thread::sleep(opts.poll_interval);
            }
            tracing::debug!(emitted, total, "beat scheduler finished");
            emitted
        })
        .map_err(|e| EngineError::Thread {
            name: "beat-scheduler",
            reason: e.to_string(),
        })?;

    Ok(BeatScheduler {
        stop,
        join: Some(join),
    })
}

impl BeatScheduler {
    /// Stop and join; returns the number of beats emitted. Idempotent.
    pub fn shutdown(&mut self) -> Option<usize> {
        self.stop.store(true, Ordering::Relaxed);
        self.join.take().and_then(|j| j.join().ok())
    }
}

impl Drop for BeatScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
