use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A playable track as handed over by the media-server client.
///
/// Beat data comes from the external beat analyzer and is optional: without a tempo no
/// beat events are produced for the track.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Track {
    /// Stable media-server id, used by "skip to track" directives.
    pub id: String,
    /// Display title.
    #[serde(default)]
    pub title: Option<String>,
    /// Remote stream URL fed to the decoder.
    pub stream_url: String,
    /// Track duration in seconds.
    pub duration_secs: f64,
    /// Tempo in beats per minute.
    #[serde(default)]
    pub tempo: Option<f64>,
    /// Explicit ascending beat offsets (seconds from track start).
    #[serde(default)]
    pub beats: Option<Vec<f64>>,
}

impl Track {
    /// Human-readable label for logs (title when known, id otherwise).
    pub fn label(&self) -> &str {
        self.title.as_deref().unwrap_or(&self.id)
    }
}

/// Player status published on every transition.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackStatus {
    /// Track is being prepared (decoder/output starting).
    Loading,
    /// Audio is flowing.
    Playing,
    /// Output is paused; decoder keeps its buffered position.
    Paused,
    /// Transient state published right before `Playing` after a resume.
    Resumed,
    /// Playback was explicitly stopped.
    Stopped,
    /// Skip forward requested.
    Next,
    /// Skip backward requested.
    Previous,
    /// The player is shutting down.
    Exit,
    /// Decoder or output failure; playback of the track was abandoned.
    Error,
}

impl PlaybackStatus {
    /// `Resumed` collapses to `Playing`; every other status is already stable.
    pub fn normalized(self) -> Self {
        match self {
            PlaybackStatus::Resumed => PlaybackStatus::Playing,
            other => other,
        }
    }

    /// Whether the status ends the playback session.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PlaybackStatus::Stopped | PlaybackStatus::Exit | PlaybackStatus::Error
        )
    }
}

/// Commands accepted by the playback controller from UI, hotkeys or remote control.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackAction {
    Restart,
    Next,
    Previous,
    Stop,
    Exit,
    Pause,
    Resume,
    VolumeUp,
    VolumeDown,
    Mute,
}

/// Error returned when parsing an unknown action word.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("unknown playback action: {0}")]
pub struct UnknownAction(pub String);

impl FromStr for PlaybackAction {
    type Err = UnknownAction;

    /// Parse the short action words used by the CLI and hotkey bindings.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let action = match s.trim().to_ascii_lowercase().as_str() {
            "restart" => PlaybackAction::Restart,
            "next" | "n" => PlaybackAction::Next,
            "previous" | "prev" | "p" => PlaybackAction::Previous,
            "stop" => PlaybackAction::Stop,
            "exit" | "quit" | "q" => PlaybackAction::Exit,
            "pause" => PlaybackAction::Pause,
            "resume" | "play" => PlaybackAction::Resume,
            "volume_up" | "vol+" | "+" => PlaybackAction::VolumeUp,
            "volume_down" | "vol-" | "-" => PlaybackAction::VolumeDown,
            "mute" | "m" => PlaybackAction::Mute,
            other => return Err(UnknownAction(other.to_string())),
        };
        Ok(action)
    }
}

/// Beat-aligned tick emitted for UI animation.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct BeatEvent {
    /// Zero-based index of the beat within the track's schedule.
    pub index: usize,
    /// Track tempo in beats per minute.
    pub tempo: f64,
    /// Audible elapsed time (seconds) when the beat fired.
    pub elapsed: f64,
}
