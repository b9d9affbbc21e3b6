//! CPAL output sink.
//!
//! The output writer hands us blocking block writes; CPAL wants a real-time callback.
//! The two meet in a small bounded sample buffer:
//! - `write()` converts s16le bytes to samples and waits while the buffer is full
//!   (this is the "device write" the writer blocks on)
//! - the callback drains the buffer without blocking, applies gain, converts to the
//!   device sample format and fills underruns with silence

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use cpal::traits::{DeviceTrait, StreamTrait};

use crate::config::DeviceParams;
use crate::device;
use crate::sink::{AudioSink, OutputBackend};

/// Longest a single write may wait for the callback to make room.
const WRITE_STALL_TIMEOUT: Duration = Duration::from_secs(2);

/// Opens CPAL output streams on a device picked by name (or the default device).
#[derive(Clone, Debug, Default)]
pub struct CpalBackend {
    pub device: Option<String>,
}

impl CpalBackend {
    pub fn new(device: Option<String>) -> Self {
        Self {
            device: device::normalize_device_name(device),
        }
    }
}

impl OutputBackend for CpalBackend {
    fn open(&self, params: &DeviceParams) -> Result<Box<dyn AudioSink>> {
        let host = cpal::default_host();
        let device = device::pick_device(&host, self.device.as_deref())?;
        let (sample_format, stream_config) = device::stream_config_for(&device, params)?;
        tracing::info!(
            device = %device.description()?,
            rate_hz = stream_config.sample_rate,
            channels = stream_config.channels,
            buffer_size = ?stream_config.buffer_size,
            sample_format = ?sample_format,
            "output stream opening"
        );

        let capacity = (params.block_size as usize)
            .max(1)
            .saturating_mul(params.channels as usize)
            .saturating_mul(2);
        let shared = Arc::new(SharedOutput {
            buffer: Mutex::new(VecDeque::with_capacity(capacity)),
            cv: Condvar::new(),
            capacity,
            gain_bits: AtomicU32::new(1.0f32.to_bits()),
            muted: AtomicBool::new(false),
            underrun_events: AtomicU64::new(0),
            failed: AtomicBool::new(false),
        });

        let stream = build_output_stream(&device, &stream_config, sample_format, &shared)?;
        stream.play()?;

        Ok(Box::new(CpalSink {
            _stream: stream,
            shared,
            frame_duration: Duration::from_secs_f64(
                params.block_size as f64 / params.sample_rate.max(1) as f64,
            ),
        }))
    }
}

/// State shared between `CpalSink::write` and the real-time callback.
struct SharedOutput {
    buffer: Mutex<VecDeque<i16>>,
    cv: Condvar,
    capacity: usize,
    gain_bits: AtomicU32,
    muted: AtomicBool,
    underrun_events: AtomicU64,
    failed: AtomicBool,
}

impl SharedOutput {
    fn gain(&self) -> f32 {
        if self.muted.load(Ordering::Relaxed) {
            0.0
        } else {
            f32::from_bits(self.gain_bits.load(Ordering::Relaxed))
        }
    }
}

struct CpalSink {
    // Dropping the stream closes the device.
    _stream: cpal::Stream,
    shared: Arc<SharedOutput>,
    frame_duration: Duration,
}

impl AudioSink for CpalSink {
    fn write(&mut self, frame: &[u8]) -> Result<()> {
        let mut samples = frame
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .peekable();
        let deadline = Instant::now() + WRITE_STALL_TIMEOUT;

        while samples.peek().is_some() {
            if self.shared.failed.load(Ordering::Relaxed) {
                return Err(anyhow!("output stream reported an error"));
            }
            let mut g = self.shared.buffer.lock().unwrap_or_else(|e| e.into_inner());
            while g.len() >= self.shared.capacity {
                let now = Instant::now();
                if now >= deadline {
                    return Err(anyhow!("output device stalled"));
                }
                let (ng, _timeout) = self
                    .shared
                    .cv
                    .wait_timeout(g, deadline - now)
                    .unwrap_or_else(|e| e.into_inner());
                g = ng;
            }
            while g.len() < self.shared.capacity {
                match samples.next() {
                    Some(s) => g.push_back(s),
                    None => break,
                }
            }
        }
        Ok(())
    }

    fn set_volume(&mut self, level: f32) -> Result<()> {
        let level = level.clamp(0.0, 1.0);
        self.shared.gain_bits.store(level.to_bits(), Ordering::Relaxed);
        Ok(())
    }

    fn set_muted(&mut self, muted: bool) -> Result<()> {
        self.shared.muted.store(muted, Ordering::Relaxed);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        let deadline = Instant::now() + WRITE_STALL_TIMEOUT;
        let mut g = self.shared.buffer.lock().unwrap_or_else(|e| e.into_inner());
        while !g.is_empty() {
            let now = Instant::now();
            if now >= deadline || self.shared.failed.load(Ordering::Relaxed) {
                break;
            }
            let (ng, _timeout) = self
                .shared
                .cv
                .wait_timeout(g, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            g = ng;
        }
        drop(g);
        // Let the last callback block reach the hardware before the stream is dropped.
        std::thread::sleep(self.frame_duration);
        let underruns = self.shared.underrun_events.load(Ordering::Relaxed);
        if underruns > 0 {
            tracing::debug!(underrun_events = underruns, "output underruns during track");
        }
        Ok(())
    }
}

/// Build a CPAL output stream that plays audio from `shared`.
fn build_output_stream(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    sample_format: cpal::SampleFormat,
    shared: &Arc<SharedOutput>,
) -> Result<cpal::Stream> {
    match sample_format {
        cpal::SampleFormat::F32 => build_stream::<f32>(device, config, shared),
        cpal::SampleFormat::I16 => build_stream::<i16>(device, config, shared),
        cpal::SampleFormat::I32 => build_stream::<i32>(device, config, shared),
        cpal::SampleFormat::U16 => build_stream::<u16>(device, config, shared),
        other => Err(anyhow!("Unsupported sample format: {other:?}")),
    }
}

/// Type-specialized stream builder for CPAL sample formats.
///
/// The callback never waits on the condition variable; anything the buffer cannot
/// supply is silence.
fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    shared: &Arc<SharedOutput>,
) -> Result<cpal::Stream>
where
    T: cpal::Sample + cpal::SizedSample + cpal::FromSample<f32>,
{
    let shared_cb = shared.clone();
    let shared_err = shared.clone();
    let err_fn = move |err| {
        tracing::warn!("stream error: {err}");
        shared_err.failed.store(true, Ordering::Relaxed);
        shared_err.cv.notify_all();
    };

    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _| {
            let gain = shared_cb.gain();
            let mut g = shared_cb.buffer.lock().unwrap_or_else(|e| e.into_inner());
            let mut underrun = false;
            for out in data.iter_mut() {
                let sample = match g.pop_front() {
                    Some(s) => s as f32 / 32_768.0 * gain,
                    None => {
                        underrun = true;
                        0.0
                    }
                };
                *out = <T as cpal::Sample>::from_sample::<f32>(sample);
            }
            drop(g);
            shared_cb.cv.notify_all();
            if underrun {
                shared_cb.underrun_events.fetch_add(1, Ordering::Relaxed);
            }
        },
        err_fn,
        None,
    )?;

    Ok(stream)
}
