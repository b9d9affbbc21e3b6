//! Beatbar runtime helpers.
//!
//! Provides device enumeration and playlist playback with stdin/ctrl-c controls.

use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result, anyhow};
use beatbar_types::{BeatEvent, PlaybackStatus};
use cpal::traits::DeviceTrait;
use crossbeam_channel::Receiver;
use stream_player::config::DeviceParams;
use stream_player::decode::FfmpegBackend;
use stream_player::device;
use stream_player::playback::CpalBackend;
use stream_player::playlist::{self, LastPlaylist, PlaylistStore};
use stream_player::sequencer::{TrackQueue, run_queue};
use stream_player::sink::{NullBackend, OutputBackend};
use stream_player::{PlaybackController, Player};

use crate::config::RunConfig;
use crate::controls;

/// Device format used with `--null-output`.
const NULL_SAMPLE_RATE: u32 = 48_000;
const NULL_CHANNELS: u16 = 2;

/// List output devices and print them to stdout.
pub fn list_devices() -> Result<()> {
    let host = cpal::default_host();
    device::list_devices(&host)
}

/// Play a playlist file and remember it as the last playlist.
pub fn run_play(config: RunConfig, playlist_path: &Path, start_at: Option<&str>) -> Result<()> {
    let tracks = playlist::load_tracks(playlist_path)?;
    tracing::info!(path = ?playlist_path, tracks = tracks.len(), "playlist loaded");
    let mut queue = TrackQueue::new(tracks);
    if let Some(id) = start_at {
        skip_to(&mut queue, id)?;
    }
    let store = PlaylistStore::in_dir(&config.state_dir);
    play_queue(config, queue, store)
}

/// Reload the last playlist and continue where it stopped.
pub fn run_resume(config: RunConfig, start_at: Option<&str>) -> Result<()> {
    let store = PlaylistStore::in_dir(&config.state_dir);
    let saved = store.load()?.ok_or_else(|| {
        anyhow!(
            "no last playlist in {:?}; start one with `beatbar play`",
            config.state_dir
        )
    })?;
    let mut queue = match start_at {
        Some(_) => TrackQueue::new(saved.tracks),
        None => saved.into_queue(),
    };
    if let Some(id) = start_at {
        skip_to(&mut queue, id)?;
    }
    tracing::info!(
        tracks = queue.len(),
        position = queue.cursor() + 1,
        "resuming last playlist"
    );
    play_queue(config, queue, store)
}

fn skip_to(queue: &mut TrackQueue, id: &str) -> Result<()> {
    if queue.skip_to(id) {
        Ok(())
    } else {
        Err(anyhow!("track {id} is not in the playlist"))
    }
}

fn play_queue(config: RunConfig, mut queue: TrackQueue, store: PlaylistStore) -> Result<()> {
    if let Err(e) = store.save(&LastPlaylist::from_queue(&queue)) {
        tracing::warn!("could not persist last playlist: {e}");
    }

    let (params, output) = open_output(&config)?;
    tracing::info!(
        rate_hz = params.sample_rate,
        channels = params.channels,
        block_size = params.block_size,
        buffer_depth = params.buffer_depth,
        "device parameters"
    );
    let decoder = Arc::new(FfmpegBackend::new(
        config.engine.decoder_program.clone(),
        config.engine.loudness_normalization,
    ));

    let (status_tx, status_rx) = crossbeam_channel::unbounded();
    let (beat_tx, beat_rx) = crossbeam_channel::unbounded();
    let mut controller = PlaybackController::new(config.engine, params, decoder, output)
        .with_status_channel(status_tx)
        .with_beat_channel(beat_tx);
    let handle = controller.handle();

    let ctrlc_handle = handle.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        ctrlc_handle.exit();
    }) {
        tracing::warn!("ctrl-c handler not installed: {e}");
    }
    // Detached: it stays blocked on stdin after playback ends.
    let _controls = controls::spawn_controls(BufReader::new(std::io::stdin()), handle)
        .context("spawn control thread")?;
    let events = spawn_event_printer(status_rx, beat_rx).context("spawn event thread")?;

    let result = run_queue(&mut controller, &mut queue, Some(&store));
    controller.exit();
    // Dropping the controller closes the status and beat channels.
    drop(controller);
    let _ = events.join();

    let status = result.context("playback failed")?;
    tracing::info!(status = ?status, "playback finished");
    Ok(())
}

fn open_output(config: &RunConfig) -> Result<(DeviceParams, Arc<dyn OutputBackend>)> {
    if config.null_output {
        let params = DeviceParams {
            sample_rate: NULL_SAMPLE_RATE,
            channels: NULL_CHANNELS,
            block_size: device::DEFAULT_BLOCK_FRAMES,
            buffer_depth: config.engine.buffer_depth,
        };
        return Ok((params, Arc::new(NullBackend)));
    }

    let host = cpal::default_host();
    let device_name = device::normalize_device_name(config.device.clone());
    let dev = device::pick_device(&host, device_name.as_deref())?;
    tracing::info!(device = %dev.description()?, "output device");
    let params = device::discover_params(&dev, config.engine.buffer_depth)?;
    Ok((params, Arc::new(CpalBackend::new(device_name))))
}

/// Stand-in for the UI: log status transitions and print beats.
fn spawn_event_printer(
    status_rx: Receiver<PlaybackStatus>,
    beat_rx: Receiver<BeatEvent>,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("events".to_string())
        .spawn(move || {
            loop {
                crossbeam_channel::select! {
                    recv(status_rx) -> msg => match msg {
                        Ok(status) => println!("[{}]", status_label(status)),
                        Err(_) => break,
                    },
                    recv(beat_rx) -> msg => match msg {
                        Ok(beat) => println!("{}", beat_line(&beat)),
                        Err(_) => break,
                    },
                }
            }
        })
}

fn status_label(status: PlaybackStatus) -> &'static str {
    match status {
        PlaybackStatus::Loading => "loading",
        PlaybackStatus::Playing => "playing",
        PlaybackStatus::Paused => "paused",
        PlaybackStatus::Resumed => "resumed",
        PlaybackStatus::Stopped => "stopped",
        PlaybackStatus::Next => "next",
        PlaybackStatus::Previous => "previous",
        PlaybackStatus::Exit => "exit",
        PlaybackStatus::Error => "error",
    }
}

fn beat_line(beat: &BeatEvent) -> String {
    let marker = if beat.index % 4 == 0 { "#" } else { "." };
    format!(
        "{marker} beat {:>4} {:>7.2}s {:>5.1} bpm",
        beat.index, beat.elapsed, beat.tempo
    )
}
