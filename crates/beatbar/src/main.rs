//! Beatbar: streaming playlist player with beat-synchronized output.
//!
//! Each track is decoded by an ffmpeg subprocess into a bounded frame queue that an
//! output writer drains into the audio device. Tracks carrying a tempo also drive a
//! beat ticker printed to stdout.
//!
//! ## Modes
//! - `play <playlist.json>`: play a JSON array of tracks and remember it.
//! - `resume`: continue the last playlist where it stopped.
//!
//! While playing, action words on stdin (`pause`, `next`, `vol+`, ...) control playback.

use anyhow::{Result, anyhow};
use beatbar::{cli, config, runtime};
use clap::Parser;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let args = cli::Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,beatbar=info,stream_player=info")
        }))
        .init();

    if args.list_devices {
        return runtime::list_devices();
    }

    let file = match args.config.as_deref() {
        Some(path) => config::BeatbarConfig::load(path)?,
        None => config::BeatbarConfig::default(),
    };
    let run = config::RunConfig::resolve(&args, file);

    match &args.cmd {
        Some(cli::Command::Play { playlist, start_at }) => {
            runtime::run_play(run, playlist, start_at.as_deref())
        }
        Some(cli::Command::Resume { start_at }) => runtime::run_resume(run, start_at.as_deref()),
        None => Err(anyhow!(
            "nothing to do; use `play`, `resume` or --list-devices"
        )),
    }
}
