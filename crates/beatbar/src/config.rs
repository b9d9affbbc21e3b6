//! Configuration loading and resolution.
//!
//! Settings come from an optional TOML file, overridden by command-line flags, with
//! engine defaults for everything left unset.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use stream_player::config::EngineConfig;

use crate::cli::Args;

/// Top-level config file schema.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BeatbarConfig {
    /// Output device substring match.
    pub device: Option<String>,
    /// Directory holding the last playlist.
    pub state_dir: Option<PathBuf>,
    /// Decoder settings.
    pub decoder: Option<DecoderConfig>,
    /// Buffering and timing.
    pub playback: Option<PlaybackSettings>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DecoderConfig {
    /// Decoder executable (default: ffmpeg).
    pub program: Option<PathBuf>,
    /// Apply loudness normalization (default: true).
    pub loudness_normalization: Option<bool>,
    /// Seconds a stopped decoder gets before it is killed.
    pub reap_grace_secs: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlaybackSettings {
    pub buffer_depth: Option<usize>,
    pub queue_multiplier: Option<usize>,
    pub poll_interval_ms: Option<u64>,
    pub beat_poll_interval_ms: Option<u64>,
    pub beat_tolerance_secs: Option<f64>,
    pub volume_step: Option<f32>,
    pub initial_volume: Option<f32>,
}

impl BeatbarConfig {
    /// Load configuration from disk.
    pub fn load(path: &Path) -> Result<Self> {
        let raw =
            std::fs::read_to_string(path).with_context(|| format!("read config {:?}", path))?;
        let cfg = toml::from_str::<BeatbarConfig>(&raw)
            .with_context(|| format!("parse config {:?}", path))?;
        Ok(cfg)
    }
}

/// Fully resolved settings for one run.
#[derive(Clone, Debug)]
pub struct RunConfig {
    pub device: Option<String>,
    pub engine: EngineConfig,
    pub null_output: bool,
    pub state_dir: PathBuf,
}

impl RunConfig {
    /// Merge flags over the config file over defaults.
    pub fn resolve(args: &Args, file: BeatbarConfig) -> Self {
        let mut engine = EngineConfig::default();
        let decoder = file.decoder.unwrap_or_default();
        let playback = file.playback.unwrap_or_default();

        if let Some(program) = decoder.program {
            engine.decoder_program = program;
        }
        if let Some(on) = decoder.loudness_normalization {
            engine.loudness_normalization = on;
        }
        if let Some(secs) = decoder.reap_grace_secs.filter(|s| s.is_finite() && *s >= 0.0) {
            engine.reap_grace = Duration::from_secs_f64(secs);
        }
        if let Some(depth) = playback.buffer_depth {
            engine.buffer_depth = depth;
        }
        if let Some(mult) = playback.queue_multiplier {
            engine.queue_multiplier = mult;
        }
        if let Some(ms) = playback.poll_interval_ms {
            engine.poll_interval = Duration::from_millis(ms.max(1));
        }
        if let Some(ms) = playback.beat_poll_interval_ms {
            engine.beat_poll_interval = Duration::from_millis(ms.max(1));
        }
        if let Some(tol) = playback.beat_tolerance_secs {
            engine.beat_tolerance_secs = tol;
        }
        if let Some(step) = playback.volume_step {
            engine.volume_step = step;
        }
        if let Some(level) = playback.initial_volume {
            engine.initial_volume = level.clamp(0.0, 1.0);
        }

        if let Some(program) = args.ffmpeg.clone() {
            engine.decoder_program = program;
        }
        if let Some(depth) = args.buffer_depth {
            engine.buffer_depth = depth;
        }
        engine.buffer_depth = engine.buffer_depth.max(1);

        let state_dir = args
            .state_dir
            .clone()
            .or(file.state_dir)
            .unwrap_or_else(default_state_dir);

        Self {
            device: args.device.clone().or(file.device),
            engine,
            null_output: args.null_output,
            state_dir,
        }
    }
}

/// `$HOME/.beatbar`, or `.beatbar` in the working directory without a home.
fn default_state_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_default()
        .join(".beatbar")
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["beatbar"];
        argv.extend_from_slice(extra);
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn empty_file_uses_engine_defaults() {
        let cfg: BeatbarConfig = toml::from_str("").unwrap();
        let run = RunConfig::resolve(&args(&["--state-dir", "/tmp/bb"]), cfg);
        let defaults = EngineConfig::default();
        assert_eq!(run.engine.buffer_depth, defaults.buffer_depth);
        assert_eq!(run.engine.decoder_program, defaults.decoder_program);
        assert_eq!(run.state_dir, PathBuf::from("/tmp/bb"));
        assert!(run.device.is_none());
    }

    #[test]
    fn flags_override_file() {
        let cfg: BeatbarConfig = toml::from_str(
            r#"
            device = "Speakers"
            [decoder]
            program = "/opt/ffmpeg/bin/ffmpeg"
            loudness_normalization = false
            [playback]
            buffer_depth = 12
            poll_interval_ms = 20
            initial_volume = 1.5
            "#,
        )
        .unwrap();
        let run = RunConfig::resolve(&args(&["--device", "USB", "--buffer-depth", "4"]), cfg);
        assert_eq!(run.device.as_deref(), Some("USB"));
        assert_eq!(run.engine.buffer_depth, 4);
        assert_eq!(run.engine.decoder_program, PathBuf::from("/opt/ffmpeg/bin/ffmpeg"));
        assert!(!run.engine.loudness_normalization);
        assert_eq!(run.engine.poll_interval, Duration::from_millis(20));
        assert_eq!(run.engine.initial_volume, 1.0);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(toml::from_str::<BeatbarConfig>("volume = 3").is_err());
    }

    #[test]
    fn load_reports_path_on_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("beatbar.toml");
        std::fs::write(&path, "[playback]\nbuffer_depth = \"many\"\n").unwrap();
        let err = BeatbarConfig::load(&path).unwrap_err();
        assert!(format!("{err:#}").contains("parse config"));
    }
}
