//! Playback controller.
//!
//! Runs one track at a time on the caller's thread: starts the output writer, then the
//! decoder/reader, then (when the track has a tempo) the beat scheduler, and supervises
//! the session until an action or the writer's end event finishes it.
//!
//! Actions arrive on a multi-producer command channel and are handled strictly one per
//! iteration, in arrival order. Actions still pending when a session ends are kept for
//! the next `play()`; actions that arrive while a session is being torn down are
//! dropped, and a Stop/Exit/Error drops everything pending. Status transitions are
//! published to an optional subscriber channel.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use beatbar_types::{BeatEvent, PlaybackAction, PlaybackStatus, Track};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use crate::beat::{BeatOptions, BeatSchedule, BeatScheduler, NowPlaying, spawn_beat_scheduler};
use crate::config::{DeviceParams, EngineConfig};
use crate::decode::{DecodeBackend, ReaderHandle, spawn_reader};
use crate::error::Result;
use crate::output::{
    ControlSignal, OutputState, OutputWriter, SharedOutputState, WriterOptions, lock_state,
    spawn_writer,
};
use crate::queue::FrameQueue;
use crate::signal::Event;
use crate::sink::OutputBackend;
use crate::stream::StreamDescriptor;

/// Capability interface over playback backends.
pub trait Player {
    /// Play `track` until it ends, is skipped, stopped or fails.
    ///
    /// Returns `Playing` on natural end of stream, `Next`/`Previous` on skip and
    /// `Stopped`/`Exit` when playback was ended by command.
    fn play(&mut self, track: &Track) -> Result<PlaybackStatus>;

    fn status(&self) -> PlaybackStatus;

    /// Cloneable command handle for UI, hotkeys or remote control.
    fn handle(&self) -> PlayerHandle;

    /// Tear down any running session. Safe to call in any state, any number of times.
    fn exit(&mut self);
}

/// Sends actions to a [`PlaybackController`] from any thread.
#[derive(Clone, Debug)]
pub struct PlayerHandle {
    cmd_tx: Sender<PlaybackAction>,
    output: SharedOutputState,
}

impl PlayerHandle {
    /// Queue an action. Returns `false` once the controller is gone.
    pub fn send(&self, action: PlaybackAction) -> bool {
        self.cmd_tx.send(action).is_ok()
    }

    pub fn pause(&self) -> bool {
        self.send(PlaybackAction::Pause)
    }

    pub fn resume(&self) -> bool {
        self.send(PlaybackAction::Resume)
    }

    pub fn stop(&self) -> bool {
        self.send(PlaybackAction::Stop)
    }

    pub fn restart(&self) -> bool {
        self.send(PlaybackAction::Restart)
    }

    pub fn next(&self) -> bool {
        self.send(PlaybackAction::Next)
    }

    pub fn previous(&self) -> bool {
        self.send(PlaybackAction::Previous)
    }

    pub fn volume_up(&self) -> bool {
        self.send(PlaybackAction::VolumeUp)
    }

    pub fn volume_down(&self) -> bool {
        self.send(PlaybackAction::VolumeDown)
    }

    pub fn mute(&self) -> bool {
        self.send(PlaybackAction::Mute)
    }

    pub fn exit(&self) -> bool {
        self.send(PlaybackAction::Exit)
    }

    /// Output state as last applied by the writer.
    pub fn output_state(&self) -> OutputState {
        *lock_state(&self.output)
    }
}

/// Where a supervised session went.
enum Outcome {
    Restart,
    Finished(PlaybackStatus),
}

/// Running reader/writer/beat threads for one track.
struct Session {
    writer: OutputWriter,
    reader: ReaderHandle,
    beats: Option<BeatScheduler>,
    ended: Arc<Event>,
}

impl Session {
    /// Cancel everything and join. The device is released when this returns.
    fn stop(&mut self) {
        if let Some(beats) = self.beats.as_mut() {
            beats.shutdown();
        }
        self.reader.request_stop();
        if let Err(e) = self.writer.shutdown() {
            tracing::warn!("output writer failed before stop: {e}");
        }
        self.reader.shutdown();
    }

    /// Join after the writer ended on its own and report its outcome.
    fn finish(&mut self) -> Result<()> {
        let result = self.writer.finish();
        if result.is_err() {
            // The reader may still be blocked on a full queue.
            self.reader.shutdown();
        } else {
            self.reader.finish();
        }
        if let Some(beats) = self.beats.as_mut() {
            beats.shutdown();
        }
        result
    }
}

/// Default [`Player`]: decoder subprocess + output device + beat scheduler.
pub struct PlaybackController {
    config: EngineConfig,
    params: DeviceParams,
    decoder: Arc<dyn DecodeBackend>,
    output: Arc<dyn OutputBackend>,
    status: PlaybackStatus,
    status_tx: Option<Sender<PlaybackStatus>>,
    beat_tx: Option<Sender<BeatEvent>>,
    cmd_tx: Sender<PlaybackAction>,
    cmd_rx: Receiver<PlaybackAction>,
    // Actions pulled off the channel during teardown but still owed to the next session.
    backlog: VecDeque<PlaybackAction>,
    output_state: SharedOutputState,
    // Requested levels; the writer's view in `output_state` trails these by one iteration.
    volume: f32,
    muted: bool,
    now_playing: NowPlaying,
    session: Option<Session>,
}

impl PlaybackController {
    pub fn new(
        config: EngineConfig,
        params: DeviceParams,
        decoder: Arc<dyn DecodeBackend>,
        output: Arc<dyn OutputBackend>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = crossbeam_channel::unbounded();
        let volume = config.initial_volume.clamp(0.0, 1.0);
        let output_state = Arc::new(Mutex::new(OutputState {
            volume,
            ..OutputState::default()
        }));
        Self {
            config,
            params,
            decoder,
            output,
            status: PlaybackStatus::Loading,
            status_tx: None,
            beat_tx: None,
            cmd_tx,
            cmd_rx,
            backlog: VecDeque::new(),
            output_state,
            volume,
            muted: false,
            now_playing: NowPlaying::new(),
            session: None,
        }
    }

    /// Publish every status transition on `tx`.
    pub fn with_status_channel(mut self, tx: Sender<PlaybackStatus>) -> Self {
        self.status_tx = Some(tx);
        self
    }

    /// Emit beat events for tracks that carry a tempo on `tx`.
    pub fn with_beat_channel(mut self, tx: Sender<BeatEvent>) -> Self {
        self.beat_tx = Some(tx);
        self
    }

    pub fn device_params(&self) -> DeviceParams {
        self.params
    }

    fn set_status(&mut self, status: PlaybackStatus) {
        tracing::info!(from = ?self.status, to = ?status, "playback status");
        self.status = status;
        if let Some(tx) = &self.status_tx {
            let _ = tx.send(status);
        }
    }

    fn start_session(&mut self, track: &Track) -> Result<()> {
        let desc = StreamDescriptor::for_track(track, &self.params);
        let depth = self.params.buffer_depth.max(1);
        let queue = Arc::new(FrameQueue::new(self.config.queue_capacity(depth)));
        let progress = Arc::new(Event::new());
        {
            let mut state = lock_state(&self.output_state);
            state.paused = false;
            state.frames_written = 0;
            state.volume = self.volume;
            state.muted = self.muted;
        }

        tracing::info!(
            track = %track.id,
            title = track.label(),
            url = %desc.url,
            duration_secs = desc.duration_secs,
            read_size = desc.read_size,
            queue_capacity = queue.capacity(),
            "starting track"
        );

        let mut writer = spawn_writer(
            self.output.clone(),
            self.params,
            queue.clone(),
            progress.clone(),
            self.output_state.clone(),
            WriterOptions {
                buffer_depth: depth,
                poll_interval: self.config.poll_interval,
            },
        )?;

        let reader = self
            .decoder
            .launch(&desc)
            .and_then(|stream| {
                spawn_reader(
                    stream,
                    queue.clone(),
                    desc.read_size,
                    self.params.push_timeout(),
                    self.config.reap_grace,
                )
            });
        let mut reader = match reader {
            Ok(reader) => reader,
            Err(e) => {
                let _ = writer.shutdown();
                return Err(e);
            }
        };

        let generation = self.now_playing.advance();
        let beats = match (track.tempo, &self.beat_tx) {
            (Some(tempo), Some(tx)) => {
                let schedule =
                    BeatSchedule::for_track(tempo, track.beats.as_deref(), track.duration_secs);
                tracing::debug!(tempo, beats = schedule.len(), "beat schedule ready");
                let spawned = spawn_beat_scheduler(
                    schedule,
                    track.duration_secs,
                    progress,
                    self.now_playing.clone(),
                    generation,
                    tx.clone(),
                    BeatOptions {
                        poll_interval: self.config.beat_poll_interval,
                        tolerance_secs: self.config.beat_tolerance_secs,
                    },
                );
                match spawned {
                    Ok(scheduler) => Some(scheduler),
                    Err(e) => {
                        reader.request_stop();
                        let _ = writer.shutdown();
                        reader.shutdown();
                        return Err(e);
                    }
                }
            }
            _ => None,
        };

        let ended = writer.ended();
        self.session = Some(Session {
            writer,
            reader,
            beats,
            ended,
        });
        Ok(())
    }

    fn stop_session(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.stop();
        }
    }

    fn supervise(&mut self) -> Result<Outcome> {
        loop {
            let next = match self.backlog.pop_front() {
                Some(action) => Ok(action),
                None => self.cmd_rx.recv_timeout(self.config.poll_interval),
            };
            match next {
                Ok(action) => {
                    if let Some(outcome) = self.handle_action(action) {
                        return Ok(outcome);
                    }
                }
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {}
            }

            let ended = self
                .session
                .as_ref()
                .map(|s| s.ended.is_set())
                .unwrap_or(true);
            if ended {
                let result = match self.session.take() {
                    Some(mut session) => session.finish(),
                    None => Ok(()),
                };
                return match result {
                    Ok(()) => {
                        tracing::info!("end of stream");
                        Ok(Outcome::Finished(PlaybackStatus::Playing))
                    }
                    Err(e) => Err(e),
                };
            }
        }
    }

    /// Apply one action. `Some` ends the current session.
    fn handle_action(&mut self, action: PlaybackAction) -> Option<Outcome> {
        tracing::debug!(action = ?action, status = ?self.status, "action");
        match action {
            PlaybackAction::Restart => {
                let pending = self.pending_actions();
                self.stop_session();
                self.drop_stale_actions(pending);
                Some(Outcome::Restart)
            }
            PlaybackAction::Next => Some(self.finish_with(PlaybackStatus::Next)),
            PlaybackAction::Previous => Some(self.finish_with(PlaybackStatus::Previous)),
            PlaybackAction::Stop => Some(self.finish_with(PlaybackStatus::Stopped)),
            PlaybackAction::Exit => Some(self.finish_with(PlaybackStatus::Exit)),
            PlaybackAction::Pause => {
                if self.status != PlaybackStatus::Paused {
                    self.signal(ControlSignal::Pause);
                    self.set_status(PlaybackStatus::Paused);
                }
                None
            }
            PlaybackAction::Resume => {
                if self.status == PlaybackStatus::Paused {
                    self.signal(ControlSignal::Resume);
                    self.set_status(PlaybackStatus::Resumed);
                    self.set_status(PlaybackStatus::Resumed.normalized());
                }
                None
            }
            PlaybackAction::VolumeUp | PlaybackAction::VolumeDown => {
                let step = if action == PlaybackAction::VolumeUp {
                    self.config.volume_step
                } else {
                    -self.config.volume_step
                };
                self.volume = (self.volume + step).clamp(0.0, 1.0);
                self.signal(ControlSignal::SetVolume(self.volume));
                None
            }
            PlaybackAction::Mute => {
                self.muted = !self.muted;
                self.signal(ControlSignal::SetMuted(self.muted));
                None
            }
        }
    }

    fn finish_with(&mut self, status: PlaybackStatus) -> Outcome {
        let pending = self.pending_actions();
        self.stop_session();
        if status.is_terminal() {
            self.drop_stale_actions(0);
        } else {
            self.drop_stale_actions(pending);
        }
        self.set_status(status);
        Outcome::Finished(status)
    }

    fn pending_actions(&self) -> usize {
        self.backlog.len() + self.cmd_rx.len()
    }

    /// Keep the first `keep` pending actions and discard the rest.
    fn drop_stale_actions(&mut self, keep: usize) {
        let mut dropped = Vec::new();
        if self.backlog.len() > keep {
            dropped.extend(self.backlog.drain(keep..));
        }
        while let Ok(action) = self.cmd_rx.try_recv() {
            if self.backlog.len() < keep {
                self.backlog.push_back(action);
            } else {
                dropped.push(action);
            }
        }
        if !dropped.is_empty() {
            tracing::debug!(actions = ?dropped, kept = self.backlog.len(), "dropping stale actions");
        }
    }

    fn signal(&self, signal: ControlSignal) {
        if let Some(session) = &self.session {
            session.writer.send(signal);
        }
    }
}

impl Player for PlaybackController {
    fn play(&mut self, track: &Track) -> Result<PlaybackStatus> {
        self.stop_session();
        loop {
            self.set_status(PlaybackStatus::Loading);
            if let Err(e) = self.start_session(track) {
                tracing::error!(track = %track.id, "playback failed to start: {e}");
                self.drop_stale_actions(0);
                self.set_status(PlaybackStatus::Error);
                return Err(e);
            }
            self.set_status(PlaybackStatus::Playing);

            match self.supervise() {
                Ok(Outcome::Restart) => {
                    tracing::info!(track = %track.id, "restarting track");
                }
                Ok(Outcome::Finished(status)) => return Ok(status),
                Err(e) => {
                    tracing::error!(track = %track.id, "playback failed: {e}");
                    self.stop_session();
                    self.drop_stale_actions(0);
                    self.set_status(PlaybackStatus::Error);
                    return Err(e);
                }
            }
        }
    }

    fn status(&self) -> PlaybackStatus {
        self.status
    }

    fn handle(&self) -> PlayerHandle {
        PlayerHandle {
            cmd_tx: self.cmd_tx.clone(),
            output: self.output_state.clone(),
        }
    }

    fn exit(&mut self) {
        self.stop_session();
        if self.status != PlaybackStatus::Exit {
            self.set_status(PlaybackStatus::Exit);
        }
    }
}

impl Drop for PlaybackController {
    fn drop(&mut self) {
        self.stop_session();
    }
}
