//! Decode stage: external decoder subprocess → bounded frame queue.
//!
//! The decode step (ffmpeg by default) handles network reconnects, format conversion
//! and loudness normalization, and emits raw interleaved PCM on its stdout. A reader
//! thread slices that pipe into device-sized frames and pushes them into the
//! [`FrameQueue`], waiting with a timeout whenever the queue is full.
//!
//! EOF, a read error or a dying decoder all end the loop the same way: the queue is
//! closed and the output drains what is left. Restarting is the controller's business.

use std::io::{BufRead, BufReader, ErrorKind, Read};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::error::{EngineError, Result};
use crate::queue::{FrameQueue, PushError};
use crate::stream::StreamDescriptor;

/// A launched decode step: the PCM pipe plus the process that feeds it, if any.
pub struct DecodeStream {
    pub pcm: Box<dyn Read + Send>,
    pub process: Option<DecodeProcess>,
}

/// Strategy for turning a stream descriptor into raw PCM.
pub trait DecodeBackend: Send + Sync {
    fn launch(&self, desc: &StreamDescriptor) -> Result<DecodeStream>;
}

/// Decode via an `ffmpeg` subprocess.
#[derive(Clone, Debug)]
pub struct FfmpegBackend {
    pub program: PathBuf,
    pub loudness_normalization: bool,
}

impl FfmpegBackend {
    pub fn new(program: PathBuf, loudness_normalization: bool) -> Self {
        Self {
            program,
            loudness_normalization,
        }
    }
}

/// Build the decoder argument list for `desc`.
pub fn ffmpeg_args(desc: &StreamDescriptor, loudness_normalization: bool) -> Vec<String> {
    let mut args: Vec<String> = [
        "-hide_banner",
        "-loglevel",
        "error",
        "-nostdin",
        "-reconnect",
        "1",
        "-reconnect_streamed",
        "1",
        "-reconnect_on_network_error",
        "1",
        "-reconnect_delay_max",
        "5",
        "-i",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    args.push(desc.url.clone());
    args.push("-vn".to_string());
    if loudness_normalization {
        args.push("-af".to_string());
        args.push("loudnorm=I=-16:TP=-1.5:LRA=11".to_string());
    }
    args.extend([
        "-ac".to_string(),
        desc.format.channels.to_string(),
        "-ar".to_string(),
        desc.format.sample_rate.to_string(),
        "-f".to_string(),
        desc.format.pcm_format().to_string(),
        "pipe:1".to_string(),
    ]);
    args
}

impl DecodeBackend for FfmpegBackend {
    fn launch(&self, desc: &StreamDescriptor) -> Result<DecodeStream> {
        let program = self.program.display().to_string();
        let mut child = Command::new(&self.program)
            .args(ffmpeg_args(desc, self.loudness_normalization))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| match source.kind() {
                ErrorKind::NotFound => EngineError::DecoderMissing {
                    program: program.clone(),
                },
                _ => EngineError::DecoderSpawn {
                    program: program.clone(),
                    source,
                },
            })?;

        let stdout = child.stdout.take().ok_or_else(|| EngineError::DecoderSpawn {
            program: program.clone(),
            source: std::io::Error::other("decoder stdout not captured"),
        })?;
        let stderr_log = child.stderr.take().map(|stderr| {
            let program = program.clone();
            thread::spawn(move || {
                for line in BufReader::new(stderr).lines() {
                    match line {
                        Ok(line) if !line.trim().is_empty() => {
                            tracing::debug!(decoder = %program, "{line}");
                        }
                        Ok(_) => {}
                        Err(_) => break,
                    }
                }
            })
        });

        tracing::debug!(
            decoder = %program,
            pid = child.id(),
            url = %desc.url,
            rate_hz = desc.format.sample_rate,
            channels = desc.format.channels,
            "decoder started"
        );

        Ok(DecodeStream {
            pcm: Box::new(stdout),
            process: Some(DecodeProcess {
                program,
                child,
                stderr_log,
                reaped: false,
            }),
        })
    }
}

/// Owned decoder subprocess. Always reaped: explicitly via [`DecodeProcess::reap`] or on drop.
pub struct DecodeProcess {
    program: String,
    child: Child,
    stderr_log: Option<JoinHandle<()>>,
    reaped: bool,
}

impl DecodeProcess {
    /// Wait for the decoder to exit, killing it only if it outlives `grace`.
    ///
    /// The reader must have released the stdout pipe (or be about to) so that a
    /// still-running decoder terminates on the broken pipe.
    pub fn reap(&mut self, grace: Duration) {
        if self.reaped {
            return;
        }
        self.reaped = true;

        let deadline = Instant::now() + grace;
        let status = loop {
            match self.child.try_wait() {
                Ok(Some(status)) => break Some(status),
                Ok(None) if Instant::now() < deadline => {
                    thread::sleep(Duration::from_millis(20));
                }
                Ok(None) => {
                    tracing::warn!(decoder = %self.program, "decoder did not exit; killing");
                    let _ = self.child.kill();
                    break self.child.wait().ok();
                }
                Err(e) => {
                    tracing::warn!(decoder = %self.program, "decoder wait error: {e}");
                    break None;
                }
            }
        };

        match status {
            Some(s) if s.success() => tracing::debug!(decoder = %self.program, "decoder exited"),
            Some(s) => tracing::warn!(
                decoder = %self.program,
                code = ?s.code(),
                "decoder exited with failure; treating as end of stream"
            ),
            None => {}
        }

        if let Some(handle) = self.stderr_log.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for DecodeProcess {
    fn drop(&mut self) {
        if !self.reaped {
            self.reap(Duration::ZERO);
        }
    }
}

/// Counters reported by a finished reader thread.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReadSummary {
    pub frames: u64,
    pub bytes: u64,
    /// `true` when the loop ended because stop was requested.
    pub stopped: bool,
}

/// Handle to a running reader thread and its decoder process.
pub struct ReaderHandle {
    stop: Arc<AtomicBool>,
    queue: Arc<FrameQueue>,
    join: Option<JoinHandle<ReadSummary>>,
    process: Option<DecodeProcess>,
    grace: Duration,
}

/// Start the reader thread for an already launched decode step.
pub fn spawn_reader(
    stream: DecodeStream,
    queue: Arc<FrameQueue>,
    read_size: usize,
    push_timeout: Duration,
    grace: Duration,
) -> Result<ReaderHandle> {
    let DecodeStream { pcm, process } = stream;
    let stop = Arc::new(AtomicBool::new(false));
    let stop_for_thread = stop.clone();
    let queue_for_thread = queue.clone();

    let join = thread::Builder::new()
        .name("pcm-reader".to_string())
        .spawn(move || {
            let summary = read_loop(
                pcm,
                &queue_for_thread,
                read_size.max(1),
                push_timeout,
                &stop_for_thread,
            );
            queue_for_thread.close();
            tracing::debug!(
                frames = summary.frames,
                bytes = summary.bytes,
                stopped = summary.stopped,
                "reader finished"
            );
            summary
        })
        .map_err(|e| EngineError::Thread {
            name: "pcm-reader",
            reason: e.to_string(),
        })?;

    Ok(ReaderHandle {
        stop,
        queue,
        join: Some(join),
        process,
        grace,
    })
}

impl ReaderHandle {
    /// Ask the reader to stop at its next iteration without waiting.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
        self.queue.close();
    }

    /// Whether the reader thread has exited.
    pub fn is_finished(&self) -> bool {
        self.join.as_ref().map(|j| j.is_finished()).unwrap_or(true)
    }

    /// Stop the reader, reap the decoder and join the thread. Idempotent.
    pub fn shutdown(&mut self) -> Option<ReadSummary> {
        self.request_stop();
        self.reap_and_join()
    }

    /// Join after a natural end of stream (no stop request).
    pub fn finish(&mut self) -> Option<ReadSummary> {
        self.reap_and_join()
    }

    fn reap_and_join(&mut self) -> Option<ReadSummary> {
        if let Some(mut process) = self.process.take() {
            process.reap(self.grace);
        }
        let join = self.join.take()?;
        match join.join() {
            Ok(summary) => Some(summary),
            Err(_) => {
                tracing::error!("reader thread panicked");
                None
            }
        }
    }
}

impl Drop for ReaderHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Read `read_size`-byte frames until EOF, error or stop, pushing each into `queue`.
fn read_loop(
    mut pcm: Box<dyn Read + Send>,
    queue: &FrameQueue,
    read_size: usize,
    push_timeout: Duration,
    stop: &AtomicBool,
) -> ReadSummary {
    let mut summary = ReadSummary::default();
    loop {
        if stop.load(Ordering::Relaxed) {
            summary.stopped = true;
            break;
        }

        let mut buf = vec![0u8; read_size];
        let (n, last) = match read_chunk(&mut pcm, &mut buf) {
            Ok((0, _)) => break,
            Ok(chunk) => chunk,
            Err(e) => {
                tracing::warn!("decoder read error: {e}; ending stream");
                break;
            }
        };
        buf.truncate(n);

        let mut frame = buf;
        loop {
            match queue.push_timeout(frame, push_timeout) {
                Ok(()) => {
                    summary.frames += 1;
                    summary.bytes += n as u64;
                    break;
                }
                Err(PushError::Full(back)) => {
                    if stop.load(Ordering::Relaxed) {
                        summary.stopped = true;
                        return summary;
                    }
                    frame = back;
                }
                Err(PushError::Closed(_)) => {
                    summary.stopped = stop.load(Ordering::Relaxed);
                    return summary;
                }
            }
        }
        if last {
            break;
        }
    }
    summary
}

/// Fill `buf` completely unless the stream ends first.
///
/// Returns the bytes read and whether this is the last chunk. A short chunk is always
/// the last one: reading past a failed partial read would misalign sample frames.
fn read_chunk(src: &mut dyn Read, buf: &mut [u8]) -> std::io::Result<(usize, bool)> {
    let mut filled = 0;
    while filled < buf.len() {
        match src.read(&mut buf[filled..]) {
            Ok(0) => return Ok((filled, true)),
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                if filled > 0 {
                    tracing::warn!("decoder read error after {filled} bytes: {e}; ending stream");
                    return Ok((filled, true));
                }
                return Err(e);
            }
        }
    }
    Ok((filled, false))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::Popped;
    use crate::stream::OutputFormat;
    use std::io::Cursor;

    fn desc() -> StreamDescriptor {
        StreamDescriptor {
            track_id: "t".to_string(),
            url: "http://media/t/stream?x=1".to_string(),
            format: OutputFormat {
                sample_rate: 48_000,
                channels: 2,
                sample_width: 2,
            },
            duration_secs: 10.0,
            read_size: 8,
        }
    }

    fn memory_stream(bytes: Vec<u8>) -> DecodeStream {
        DecodeStream {
            pcm: Box::new(Cursor::new(bytes)),
            process: None,
        }
    }

    /// Reader that yields one byte per call, then fails.
    struct Trickle {
        left: usize,
    }

    impl Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.left == 0 {
                return Err(std::io::Error::other("connection reset"));
            }
            self.left -= 1;
            buf[0] = 7;
            Ok(1)
        }
    }

    /// Reader that fails once in the middle of a frame, then recovers.
    struct Hiccup {
        reads: usize,
    }

    impl Read for Hiccup {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.reads += 1;
            if self.reads == 2 {
                return Err(std::io::Error::other("transient"));
            }
            let n = buf.len().min(3);
            buf[..n].fill(self.reads as u8);
            Ok(n)
        }
    }

    fn drain(q: &FrameQueue) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        loop {
            match q.pop_timeout(Duration::from_secs(1)) {
                Popped::Frame(f) => out.push(f),
                Popped::Empty => continue,
                Popped::Closed => return out,
            }
        }
    }

    #[test]
    fn ffmpeg_args_request_device_format() {
        let args = ffmpeg_args(&desc(), true);
        let joined = args.join(" ");
        assert!(joined.contains("-reconnect 1"));
        assert!(joined.contains("-i http://media/t/stream?x=1"));
        assert!(joined.contains("-af loudnorm"));
        assert!(joined.ends_with("-ac 2 -ar 48000 -f s16le pipe:1"));

        let plain = ffmpeg_args(&desc(), false);
        assert!(!plain.iter().any(|a| a == "-af"));
    }

    #[test]
    fn missing_decoder_is_reported() {
        let backend = FfmpegBackend::new(PathBuf::from("/nonexistent/beatbar-decoder"), false);
        let err = backend.launch(&desc()).err().expect("launch must fail");
        assert!(matches!(err, EngineError::DecoderMissing { .. }));
    }

    #[test]
    fn reader_splits_into_frames_and_closes() {
        let q = Arc::new(FrameQueue::new(16));
        let bytes: Vec<u8> = (0..20u8).collect();
        let mut handle = spawn_reader(
            memory_stream(bytes),
            q.clone(),
            8,
            Duration::from_millis(50),
            Duration::from_millis(100),
        )
        .unwrap();

        let frames = drain(&q);
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0], (0..8u8).collect::<Vec<_>>());
        assert_eq!(frames[2], vec![16, 17, 18, 19]);

        let summary = handle.finish().unwrap();
        assert_eq!(summary.frames, 3);
        assert_eq!(summary.bytes, 20);
        assert!(!summary.stopped);
        assert!(handle.finish().is_none());
    }

    #[test]
    fn read_error_ends_stream_like_eof() {
        let q = Arc::new(FrameQueue::new(16));
        let stream = DecodeStream {
            pcm: Box::new(Trickle { left: 5 }),
            process: None,
        };
        let mut handle =
            spawn_reader(stream, q.clone(), 4, Duration::from_millis(50), Duration::ZERO).unwrap();
        let frames = drain(&q);
        assert_eq!(frames, vec![vec![7; 4], vec![7; 1]]);
        assert_eq!(handle.finish().unwrap().frames, 2);
    }

    #[test]
    fn partial_frame_before_read_error_is_the_last_frame() {
        let q = Arc::new(FrameQueue::new(16));
        let stream = DecodeStream {
            pcm: Box::new(Hiccup { reads: 0 }),
            process: None,
        };
        let mut handle =
            spawn_reader(stream, q.clone(), 4, Duration::from_millis(50), Duration::ZERO).unwrap();
        let frames = drain(&q);
        assert_eq!(frames, vec![vec![1, 1, 1]]);
        let summary = handle.finish().unwrap();
        assert_eq!((summary.frames, summary.bytes), (1, 3));
        assert!(!summary.stopped);
    }

    #[test]
    fn stop_while_queue_full_does_not_flush() {
        let q = Arc::new(FrameQueue::new(2));
        let bytes = vec![1u8; 64];
        let mut handle = spawn_reader(
            memory_stream(bytes),
            q.clone(),
            4,
            Duration::from_millis(10),
            Duration::ZERO,
        )
        .unwrap();

        assert!(q.wait_for_depth(2, Duration::from_secs(1)));
        let summary = handle.shutdown().unwrap();
        assert!(summary.stopped);
        assert_eq!(summary.frames, 2);
        assert!(q.is_closed());
        assert!(handle.shutdown().is_none());
    }
}
