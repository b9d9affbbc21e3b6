//! Output device abstraction.
//!
//! The output writer talks to an [`AudioSink`] opened by an [`OutputBackend`] on the
//! writer's own thread (CPAL streams are not `Send` on every platform). The sink is
//! dropped when the writer exits, which releases the device.

use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use anyhow::{Result, anyhow};

use crate::config::DeviceParams;
use crate::stream::SAMPLE_WIDTH_BYTES;

/// An open output stream accepting raw interleaved PCM blocks.
pub trait AudioSink {
    /// Write one block; blocks while the device buffer is full.
    fn write(&mut self, frame: &[u8]) -> Result<()>;
    /// Normalized output level in `[0, 1]`.
    fn set_volume(&mut self, level: f32) -> Result<()>;
    /// Silence output without forgetting the volume.
    fn set_muted(&mut self, muted: bool) -> Result<()>;
    /// Wait until written audio has been handed to the hardware.
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Opens sinks for a device configuration.
pub trait OutputBackend: Send + Sync {
    fn open(&self, params: &DeviceParams) -> Result<Box<dyn AudioSink>>;
}

/// Discards audio while pacing writes at the device's real-time rate.
#[derive(Clone, Debug, Default)]
pub struct NullBackend;

struct NullSink {
    bytes_per_sec: f64,
}

impl OutputBackend for NullBackend {
    fn open(&self, params: &DeviceParams) -> Result<Box<dyn AudioSink>> {
        let bytes_per_sec = params.sample_rate as f64
            * params.channels as f64
            * SAMPLE_WIDTH_BYTES as f64;
        tracing::info!(rate_hz = params.sample_rate, "null output opened");
        Ok(Box::new(NullSink { bytes_per_sec }))
    }
}

impl AudioSink for NullSink {
    fn write(&mut self, frame: &[u8]) -> Result<()> {
        if self.bytes_per_sec > 0.0 {
            thread::sleep(Duration::from_secs_f64(frame.len() as f64 / self.bytes_per_sec));
        }
        Ok(())
    }

    fn set_volume(&mut self, _level: f32) -> Result<()> {
        Ok(())
    }

    fn set_muted(&mut self, _muted: bool) -> Result<()> {
        Ok(())
    }
}

/// Everything a [`MemoryBackend`] observed.
#[derive(Clone, Debug, Default)]
pub struct MemoryLog {
    pub frames: Vec<Vec<u8>>,
    pub volumes: Vec<f32>,
    pub mutes: Vec<bool>,
    pub opened: usize,
    pub closed: usize,
    /// Highest number of sinks open at the same time.
    pub max_open: usize,
    pub flushed: usize,
}

impl MemoryLog {
    pub fn open_now(&self) -> usize {
        self.opened - self.closed
    }
}

/// Records every write; used by tests and dry runs.
#[derive(Clone, Debug, Default)]
pub struct MemoryBackend {
    log: Arc<Mutex<MemoryLog>>,
    write_delay: Duration,
    fail_open: bool,
    fail_after_writes: Option<usize>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long per write, emulating a device consuming audio.
    pub fn with_write_delay(mut self, delay: Duration) -> Self {
        self.write_delay = delay;
        self
    }

    /// Refuse to open, emulating a missing device.
    pub fn failing_open(mut self) -> Self {
        self.fail_open = true;
        self
    }

    /// Fail the write after `n` successful ones.
    pub fn failing_after(mut self, n: usize) -> Self {
        self.fail_after_writes = Some(n);
        self
    }

    pub fn log(&self) -> MemoryLog {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryLog> {
        self.log.lock().unwrap_or_else(|e| e.into_inner())
    }
}

struct MemorySink {
    backend: MemoryBackend,
    writes: usize,
}

impl OutputBackend for MemoryBackend {
    fn open(&self, _params: &DeviceParams) -> Result<Box<dyn AudioSink>> {
        if self.fail_open {
            return Err(anyhow!("memory output unavailable"));
        }
        let mut log = self.lock();
        log.opened += 1;
        log.max_open = log.max_open.max(log.open_now());
        drop(log);
        Ok(Box::new(MemorySink {
            backend: self.clone(),
            writes: 0,
        }))
    }
}

impl AudioSink for MemorySink {
    fn write(&mut self, frame: &[u8]) -> Result<()> {
        if let Some(limit) = self.backend.fail_after_writes {
            if self.writes >= limit {
                return Err(anyhow!("memory output write failed"));
            }
        }
        if !self.backend.write_delay.is_zero() {
            thread::sleep(self.backend.write_delay);
        }
        self.writes += 1;
        self.backend.lock().frames.push(frame.to_vec());
        Ok(())
    }

    fn set_volume(&mut self, level: f32) -> Result<()> {
        self.backend.lock().volumes.push(level);
        Ok(())
    }

    fn set_muted(&mut self, muted: bool) -> Result<()> {
        self.backend.lock().mutes.push(muted);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.backend.lock().flushed += 1;
        Ok(())
    }
}

impl Drop for MemorySink {
    fn drop(&mut self) {
        self.backend.lock().closed += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> DeviceParams {
        DeviceParams {
            sample_rate: 1000,
            channels: 1,
            block_size: 10,
            buffer_depth: 2,
        }
    }

    #[test]
    fn memory_backend_tracks_open_and_close() {
        let backend = MemoryBackend::new();
        {
            let mut sink = backend.open(&params()).unwrap();
            sink.write(&[1, 2]).unwrap();
            sink.set_volume(0.5).unwrap();
            sink.set_muted(true).unwrap();
            assert_eq!(backend.log().open_now(), 1);
        }
        let log = backend.log();
        assert_eq!(log.frames, vec![vec![1, 2]]);
        assert_eq!(log.volumes, vec![0.5]);
        assert_eq!(log.mutes, vec![true]);
        assert_eq!((log.opened, log.closed, log.max_open), (1, 1, 1));
    }

    #[test]
    fn memory_backend_failure_modes() {
        assert!(MemoryBackend::new().failing_open().open(&params()).is_err());

        let backend = MemoryBackend::new().failing_after(1);
        let mut sink = backend.open(&params()).unwrap();
        assert!(sink.write(&[0]).is_ok());
        assert!(sink.write(&[0]).is_err());
    }

    #[test]
    fn null_sink_paces_writes() {
        let mut sink = NullBackend.open(&params()).unwrap();
        let start = std::time::Instant::now();
        // 20 bytes = 10 mono s16 samples = 10 ms at 1 kHz.
        sink.write(&[0u8; 20]).unwrap();
        assert!(start.elapsed() >= Duration::from_millis(9));
    }
}
