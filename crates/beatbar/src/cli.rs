use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "beatbar", version)]
pub struct Args {
    #[command(subcommand)]
    pub cmd: Option<Command>,

    /// List output devices and exit
    #[arg(long)]
    pub list_devices: bool,

    /// Use a specific output device by substring match
    #[arg(long)]
    pub device: Option<String>,

    /// TOML config file (every setting optional)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Device blocks buffered before the first write
    #[arg(long)]
    pub buffer_depth: Option<usize>,

    /// Decoder executable (default: ffmpeg on PATH)
    #[arg(long)]
    pub ffmpeg: Option<PathBuf>,

    /// Discard audio at real-time pace instead of opening a device
    #[arg(long)]
    pub null_output: bool,

    /// Directory holding the last playlist
    #[arg(long)]
    pub state_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Play a JSON playlist (array of tracks) and remember it as the last playlist
    Play {
        /// Path to the playlist JSON file
        playlist: PathBuf,

        /// Start at this track id instead of the first track
        #[arg(long)]
        start_at: Option<String>,
    },

    /// Play the last playlist from where it stopped
    Resume {
        /// Start at this track id instead of the saved position
        #[arg(long)]
        start_at: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_play_with_overrides() {
        let args = Args::try_parse_from([
            "beatbar",
            "--device",
            "USB",
            "--buffer-depth",
            "8",
            "--null-output",
            "play",
            "queue.json",
            "--start-at",
            "t3",
        ])
        .unwrap();
        assert_eq!(args.device.as_deref(), Some("USB"));
        assert_eq!(args.buffer_depth, Some(8));
        assert!(args.null_output);
        match args.cmd {
            Some(Command::Play { playlist, start_at }) => {
                assert_eq!(playlist, PathBuf::from("queue.json"));
                assert_eq!(start_at.as_deref(), Some("t3"));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn list_devices_needs_no_subcommand() {
        let args = Args::try_parse_from(["beatbar", "--list-devices"]).unwrap();
        assert!(args.list_devices);
        assert!(args.cmd.is_none());
    }
}
