use std::path::PathBuf;
use std::time::Duration;

/// Engine tuning parameters shared by the decode, output and beat stages.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Decode executable (looked up on `PATH` when not absolute).
    pub decoder_program: PathBuf,
    /// Apply EBU R128 loudness normalization in the decode step.
    pub loudness_normalization: bool,
    /// Frames queued before the first device write, and the unit of queue sizing.
    pub buffer_depth: usize,
    /// Queue capacity as a multiple of `buffer_depth`.
    pub queue_multiplier: usize,
    /// Sleep/wait bound used by every polling loop.
    pub poll_interval: Duration,
    /// Beat scheduler polling period.
    pub beat_poll_interval: Duration,
    /// How early (seconds) a beat may fire relative to elapsed audible time.
    pub beat_tolerance_secs: f64,
    /// Volume change applied by one VolumeUp/VolumeDown action.
    pub volume_step: f32,
    /// Volume applied to each new output stream.
    pub initial_volume: f32,
    /// How long a stopped decoder gets to exit before it is killed.
    pub reap_grace: Duration,
}

impl EngineConfig {
    /// Maximum number of frames held by a track's frame queue for a device buffering
    /// `buffer_depth` blocks.
    pub fn queue_capacity(&self, buffer_depth: usize) -> usize {
        buffer_depth
            .max(1)
            .saturating_mul(self.queue_multiplier.max(1))
    }
}

impl Default for EngineConfig {
    /// Defaults tuned for streaming over a LAN to a typical desktop device.
    fn default() -> Self {
        Self {
            decoder_program: PathBuf::from("ffmpeg"),
            loudness_normalization: true,
            buffer_depth: 20,
            queue_multiplier: 2,
            poll_interval: Duration::from_millis(50),
            beat_poll_interval: Duration::from_millis(100),
            beat_tolerance_secs: 0.07,
            volume_step: 0.1,
            initial_volume: 1.0,
            reap_grace: Duration::from_secs(2),
        }
    }
}

/// Output device parameters reported by device discovery.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceParams {
    pub sample_rate: u32,
    pub channels: u16,
    /// Frames (per channel) written per device block.
    pub block_size: u32,
    /// Blocks to buffer before the first write.
    pub buffer_depth: usize,
}

impl DeviceParams {
    /// Bytes of interleaved PCM in one device block.
    pub fn block_bytes(&self, sample_width: usize) -> usize {
        (self.block_size as usize)
            .saturating_mul(self.channels as usize)
            .saturating_mul(sample_width)
    }

    /// Backpressure timeout for one push: the playback time of a full startup buffer.
    pub fn push_timeout(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::from_millis(100);
        }
        let secs = self.block_size as f64 * self.buffer_depth as f64 / self.sample_rate as f64;
        Duration::from_secs_f64(secs.max(0.001))
    }
}
