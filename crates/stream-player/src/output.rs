//! Output writer stage.
//!
//! Owns the output device for one track. The writer thread:
//! 1. opens the sink and reports readiness (or the open error) to the spawner
//! 2. waits until the frame queue holds `buffer_depth` frames (or closes)
//! 3. loops: write one frame (or idle while paused), then apply at most one control signal
//! 4. on queue closed+drained: flushes, clears progress and sets the end event
//!
//! The sink is dropped before the thread exits, so joining the writer guarantees the
//! device has been released.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};

use crate::config::DeviceParams;
use crate::error::{EngineError, Result};
use crate::queue::{FrameQueue, Popped};
use crate::signal::Event;
use crate::sink::{AudioSink, OutputBackend};

/// Control messages from the controller to the writer, applied in submission order.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ControlSignal {
    Pause,
    Resume,
    SetVolume(f32),
    SetMuted(bool),
}

/// Writer-side view of the output controls.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct OutputState {
    pub paused: bool,
    pub muted: bool,
    /// Normalized level in `[0, 1]`; kept while muted.
    pub volume: f32,
    /// Frames written for the current track.
    pub frames_written: u64,
}

impl Default for OutputState {
    fn default() -> Self {
        Self {
            paused: false,
            muted: false,
            volume: 1.0,
            frames_written: 0,
        }
    }
}

/// Shared, mutex-protected output state (controller reads, writer updates).
pub type SharedOutputState = Arc<Mutex<OutputState>>;

pub(crate) fn lock_state(state: &SharedOutputState) -> MutexGuard<'_, OutputState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Clone, Copy, Debug)]
pub struct WriterOptions {
    /// Frames queued before the first device write.
    pub buffer_depth: usize,
    pub poll_interval: Duration,
}

/// Handle to a running output writer thread.
pub struct OutputWriter {
    control_tx: Sender<ControlSignal>,
    stop: Arc<AtomicBool>,
    ended: Arc<Event>,
    join: Option<JoinHandle<Result<()>>>,
}

/// Open the output and start the writer thread.
///
/// Returns once the sink is open, so the caller may start producing frames. A device
/// that cannot be opened is reported here and no thread is left behind.
pub fn spawn_writer(
    backend: Arc<dyn OutputBackend>,
    params: DeviceParams,
    queue: Arc<FrameQueue>,
    progress: Arc<Event>,
    state: SharedOutputState,
    opts: WriterOptions,
) -> Result<OutputWriter> {
    let (control_tx, control_rx) = crossbeam_channel::unbounded();
    let (ready_tx, ready_rx) = crossbeam_channel::bounded::<Result<()>>(1);
    let stop = Arc::new(AtomicBool::new(false));
    let ended = Arc::new(Event::new());

    let stop_for_thread = stop.clone();
    let ended_for_thread = ended.clone();

    let join = thread::Builder::new()
        .name("pcm-writer".to_string())
        .spawn(move || {
            let result = match backend.open(&params) {
                Ok(sink) => {
                    let _ = ready_tx.send(Ok(()));
                    let mut writer = WriterLoop {
                        sink,
                        queue,
                        control_rx,
                        stop: stop_for_thread,
                        progress: progress.clone(),
                        state,
                        opts,
                    };
                    let result = writer.run();
                    // Release the device before anyone can observe the end event.
                    drop(writer);
                    result
                }
                Err(e) => {
                    let err = EngineError::device(e.context("open output"));
                    let _ = ready_tx.send(Err(EngineError::Device(err.to_string())));
                    Err(err)
                }
            };
            progress.clear();
            ended_for_thread.set();
            result
        })
        .map_err(|e| EngineError::Thread {
            name: "pcm-writer",
            reason: e.to_string(),
        })?;

    let ready = ready_rx.recv().unwrap_or_else(|_| {
        Err(EngineError::Thread {
            name: "pcm-writer",
            reason: "exited before reporting readiness".to_string(),
        })
    });

    let mut writer = OutputWriter {
        control_tx,
        stop,
        ended,
        join: Some(join),
    };
    if let Err(e) = ready {
        let _ = writer.shutdown();
        return Err(e);
    }
    Ok(writer)
}

impl OutputWriter {
    /// Queue a control signal. Dropped silently once the writer has exited.
    pub fn send(&self, signal: ControlSignal) {
        let _ = self.control_tx.send(signal);
    }

    /// End event: set when the writer thread has finished (drained, failed or stopped).
    pub fn ended(&self) -> Arc<Event> {
        self.ended.clone()
    }

    pub fn has_ended(&self) -> bool {
        self.ended.is_set()
    }

    /// Ask the writer to stop at its next iteration without waiting.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    /// Stop the writer and join it. Idempotent; later calls return `Ok(())`.
    pub fn shutdown(&mut self) -> Result<()> {
        self.request_stop();
        self.join_thread()
    }

    /// Join a writer that ended on its own.
    pub fn finish(&mut self) -> Result<()> {
        self.join_thread()
    }

    fn join_thread(&mut self) -> Result<()> {
        let Some(join) = self.join.take() else {
            return Ok(());
        };
        join.join().unwrap_or_else(|_| {
            Err(EngineError::Thread {
                name: "pcm-writer",
                reason: "panicked".to_string(),
            })
        })
    }
}

impl Drop for OutputWriter {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::warn!("output writer error during drop: {e}");
        }
    }
}

struct WriterLoop {
    sink: Box<dyn AudioSink>,
    queue: Arc<FrameQueue>,
    control_rx: Receiver<ControlSignal>,
    stop: Arc<AtomicBool>,
    progress: Arc<Event>,
    state: SharedOutputState,
    opts: WriterOptions,
}

impl WriterLoop {
    fn stopping(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    fn run(&mut self) -> Result<()> {
        let initial = *lock_state(&self.state);
        self.sink.set_volume(initial.volume).map_err(EngineError::device)?;
        self.sink.set_muted(initial.muted).map_err(EngineError::device)?;

        let depth = self.opts.buffer_depth.max(1);
        while !self.stopping() && !self.queue.wait_for_depth(depth, self.opts.poll_interval) {
            self.apply_pending()?;
        }
        if self.stopping() {
            return Ok(());
        }
        tracing::debug!(
            queued = self.queue.len(),
            buffer_depth = depth,
            "output buffering complete"
        );

        loop {
            if self.stopping() {
                return Ok(());
            }

            if lock_state(&self.state).paused {
                self.progress.clear();
                match self.control_rx.recv_timeout(self.opts.poll_interval) {
                    Ok(signal) => self.apply(signal)?,
                    Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {}
                }
                continue;
            }

            match self.queue.pop_timeout(self.opts.poll_interval) {
                Popped::Frame(frame) => {
                    self.sink.write(&frame).map_err(EngineError::device)?;
                    self.progress.set();
                    lock_state(&self.state).frames_written += 1;
                }
                Popped::Empty => {}
                Popped::Closed => {
                    self.sink.flush().map_err(EngineError::device)?;
                    tracing::debug!(
                        frames = lock_state(&self.state).frames_written,
                        "output drained"
                    );
                    return Ok(());
                }
            }

            self.apply_pending()?;
        }
    }

    /// Apply at most one queued control signal.
    fn apply_pending(&mut self) -> Result<()> {
        match self.control_rx.try_recv() {
            Ok(signal) => self.apply(signal),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => Ok(()),
        }
    }

    fn apply(&mut self, signal: ControlSignal) -> Result<()> {
        tracing::debug!(signal = ?signal, "output control");
        match signal {
            ControlSignal::Pause => {
                lock_state(&self.state).paused = true;
                self.progress.clear();
            }
            ControlSignal::Resume => {
                // Progress is re-armed by the next successful write.
                lock_state(&self.state).paused = false;
            }
            ControlSignal::SetVolume(level) => {
                let level = level.clamp(0.0, 1.0);
                self.sink.set_volume(level).map_err(EngineError::device)?;
                lock_state(&self.state).volume = level;
            }
            ControlSignal::SetMuted(muted) => {
                self.sink.set_muted(muted).map_err(EngineError::device)?;
                lock_state(&self.state).muted = muted;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::MemoryBackend;
    use std::time::Instant;

    const POLL: Duration = Duration::from_millis(5);

    fn params(depth: usize) -> DeviceParams {
        DeviceParams {
            sample_rate: 48_000,
            channels: 2,
            block_size: 4,
            buffer_depth: depth,
        }
    }

    fn start(
        backend: &MemoryBackend,
        depth: usize,
        queue: &Arc<FrameQueue>,
    ) -> (OutputWriter, Arc<Event>, SharedOutputState) {
        let progress = Arc::new(Event::new());
        let state: SharedOutputState = Arc::new(Mutex::new(OutputState::default()));
        let writer = spawn_writer(
            Arc::new(backend.clone()),
            params(depth),
            queue.clone(),
            progress.clone(),
            state.clone(),
            WriterOptions {
                buffer_depth: depth,
                poll_interval: POLL,
            },
        )
        .unwrap();
        (writer, progress, state)
    }

    fn push(queue: &FrameQueue, n: u8) {
        queue.push_timeout(vec![n; 8], Duration::from_secs(1)).unwrap();
    }

    fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        cond()
    }

    #[test]
    fn buffers_before_first_write_then_drains_in_order() {
        let backend = MemoryBackend::new();
        let queue = Arc::new(FrameQueue::new(6));
        let (mut writer, progress, _state) = start(&backend, 3, &queue);

        push(&queue, 1);
        push(&queue, 2);
        std::thread::sleep(Duration::from_millis(60));
        assert!(backend.log().frames.is_empty());
        assert!(!progress.is_set());

        push(&queue, 3);
        push(&queue, 4);
        push(&queue, 5);
        queue.close();

        assert!(writer.ended().wait_timeout(Duration::from_secs(2)));
        let frames = backend.log().frames;
        assert_eq!(
            frames,
            (1..=5u8).map(|n| vec![n; 8]).collect::<Vec<_>>()
        );
        assert!(!progress.is_set());
        writer.finish().unwrap();
        assert_eq!(backend.log().flushed, 1);
        assert_eq!(backend.log().open_now(), 0);
    }

    #[test]
    fn short_stream_plays_when_queue_closes_before_depth() {
        let backend = MemoryBackend::new();
        let queue = Arc::new(FrameQueue::new(8));
        let (mut writer, _progress, _state) = start(&backend, 4, &queue);
        push(&queue, 9);
        queue.close();
        assert!(writer.ended().wait_timeout(Duration::from_secs(2)));
        writer.finish().unwrap();
        assert_eq!(backend.log().frames, vec![vec![9; 8]]);
    }

    #[test]
    fn paused_writer_consumes_nothing_and_applies_signals_in_order() {
        let backend = MemoryBackend::new().with_write_delay(Duration::from_millis(2));
        let queue = Arc::new(FrameQueue::new(16));
        let (mut writer, progress, state) = start(&backend, 1, &queue);

        writer.send(ControlSignal::Pause);
        assert!(wait_until(Duration::from_secs(1), || lock_state(&state).paused));
        assert!(!progress.is_set());

        for n in 0..4 {
            push(&queue, n);
        }
        std::thread::sleep(Duration::from_millis(40));
        assert!(backend.log().frames.is_empty());
        assert_eq!(queue.len(), 4);

        writer.send(ControlSignal::SetVolume(0.6));
        writer.send(ControlSignal::SetMuted(true));
        writer.send(ControlSignal::Resume);
        assert!(wait_until(Duration::from_secs(1), || backend.log().frames.len() == 4));

        let snapshot = *lock_state(&state);
        assert!(!snapshot.paused);
        assert!(snapshot.muted);
        assert!((snapshot.volume - 0.6).abs() < f32::EPSILON);
        assert_eq!(backend.log().mutes, vec![false, true]);

        queue.close();
        writer.finish().unwrap();
    }

    #[test]
    fn mute_preserves_volume() {
        let backend = MemoryBackend::new();
        let queue = Arc::new(FrameQueue::new(4));
        let (mut writer, _progress, state) = start(&backend, 1, &queue);
        writer.send(ControlSignal::SetVolume(0.3));
        writer.send(ControlSignal::SetMuted(true));
        push(&queue, 1);
        push(&queue, 2);
        assert!(wait_until(Duration::from_secs(1), || lock_state(&state).muted));
        writer.send(ControlSignal::SetMuted(false));
        push(&queue, 3);
        assert!(wait_until(Duration::from_secs(1), || !lock_state(&state).muted));
        assert!((lock_state(&state).volume - 0.3).abs() < f32::EPSILON);
        writer.shutdown().unwrap();
    }

    #[test]
    fn open_failure_is_reported_before_any_frame() {
        let backend = MemoryBackend::new().failing_open();
        let queue = Arc::new(FrameQueue::new(4));
        let err = spawn_writer(
            Arc::new(backend),
            params(1),
            queue,
            Arc::new(Event::new()),
            Arc::new(Mutex::new(OutputState::default())),
            WriterOptions {
                buffer_depth: 1,
                poll_interval: POLL,
            },
        )
        .err()
        .expect("open must fail");
        assert!(matches!(err, EngineError::Device(_)));
    }

    #[test]
    fn write_failure_sets_end_event_and_releases_device() {
        let backend = MemoryBackend::new().failing_after(2);
        let queue = Arc::new(FrameQueue::new(8));
        let (mut writer, _progress, _state) = start(&backend, 1, &queue);
        for n in 0..4 {
            push(&queue, n);
        }
        assert!(writer.ended().wait_timeout(Duration::from_secs(2)));
        assert!(matches!(writer.finish(), Err(EngineError::Device(_))));
        assert_eq!(backend.log().frames.len(), 2);
        assert_eq!(backend.log().open_now(), 0);
    }

    #[test]
    fn shutdown_is_idempotent() {
        let backend = MemoryBackend::new();
        let queue = Arc::new(FrameQueue::new(4));
        let (mut writer, _progress, _state) = start(&backend, 2, &queue);
        writer.shutdown().unwrap();
        writer.shutdown().unwrap();
        assert_eq!(backend.log().closed, 1);
    }
}
