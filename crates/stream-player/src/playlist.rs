//! "Last playlist" persistence: the loaded queue survives process restarts.

use std::fs;
use std::path::{Path, PathBuf};

use beatbar_types::Track;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::sequencer::TrackQueue;

pub const LAST_PLAYLIST_FILE: &str = "last_playlist.json";

/// Persisted queue: the tracks plus the id of the track that was playing.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct LastPlaylist {
    pub tracks: Vec<Track>,
    #[serde(default)]
    pub current: Option<String>,
}

impl LastPlaylist {
    pub fn from_queue(queue: &TrackQueue) -> Self {
        Self {
            tracks: queue.tracks().to_vec(),
            current: queue.current().map(|t| t.id.clone()),
        }
    }

    /// Rebuild the queue with the cursor on the saved current track (or the start).
    pub fn into_queue(self) -> TrackQueue {
        let mut queue = TrackQueue::new(self.tracks);
        if let Some(id) = self.current.as_deref() {
            if !queue.skip_to(id) {
                tracing::debug!(track = id, "saved current track no longer in playlist");
            }
        }
        queue
    }
}

/// JSON file holding a [`LastPlaylist`].
#[derive(Clone, Debug)]
pub struct PlaylistStore {
    path: PathBuf,
}

impl PlaylistStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Store at `<dir>/last_playlist.json`.
    pub fn in_dir(dir: &Path) -> Self {
        Self::new(dir.join(LAST_PLAYLIST_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the saved playlist; `Ok(None)` when nothing was saved yet.
    pub fn load(&self) -> Result<Option<LastPlaylist>> {
        let data = match fs::read_to_string(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(self.persist_error(e)),
        };
        serde_json::from_str(&data)
            .map(Some)
            .map_err(|e| self.persist_error(e))
    }

    /// Write via a temporary sibling file so a crash never leaves half a playlist.
    pub fn save(&self, playlist: &LastPlaylist) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| self.persist_error(e))?;
            }
        }
        let data = serde_json::to_string_pretty(playlist).map_err(|e| self.persist_error(e))?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, data).map_err(|e| self.persist_error(e))?;
        fs::rename(&tmp, &self.path).map_err(|e| self.persist_error(e))?;
        tracing::debug!(path = %self.path.display(), tracks = playlist.tracks.len(), "last playlist saved");
        Ok(())
    }

    fn persist_error(&self, err: impl std::fmt::Display) -> EngineError {
        EngineError::Persist {
            path: self.path.clone(),
            reason: err.to_string(),
        }
    }
}

/// Parse a JSON array of tracks (the `play` command's playlist file).
pub fn load_tracks(path: &Path) -> Result<Vec<Track>> {
    let persist_error = |reason: String| EngineError::Persist {
        path: path.to_path_buf(),
        reason,
    };
    let data = fs::read_to_string(path).map_err(|e| persist_error(e.to_string()))?;
    serde_json::from_str(&data).map_err(|e| persist_error(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn track(id: &str) -> Track {
        Track {
            id: id.to_string(),
            title: Some(format!("Track {id}")),
            stream_url: format!("http://media/{id}/stream"),
            duration_secs: 200.0,
            tempo: Some(120.0),
            beats: None,
        }
    }

    #[test]
    fn missing_file_loads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = PlaylistStore::in_dir(dir.path());
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn saved_playlist_resumes_at_current_track() {
        let dir = tempfile::tempdir().unwrap();
        let store = PlaylistStore::in_dir(&dir.path().join("state"));
        let mut queue = TrackQueue::new(vec![track("a"), track("b"), track("c")]);
        queue.advance();
        store.save(&LastPlaylist::from_queue(&queue)).unwrap();

        let restored = store.load().unwrap().unwrap().into_queue();
        assert_eq!(restored.cursor(), 1);
        assert_eq!(restored.tracks(), queue.tracks());
        assert!(!store.path().with_extension("json.tmp").exists());
    }

    #[test]
    fn unknown_current_track_starts_from_top() {
        let playlist = LastPlaylist {
            tracks: vec![track("a")],
            current: Some("gone".to_string()),
        };
        assert_eq!(playlist.into_queue().cursor(), 0);
    }

    #[test]
    fn corrupt_file_is_a_persist_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = PlaylistStore::in_dir(dir.path());
        fs::write(store.path(), "{not json").unwrap();
        assert!(matches!(store.load(), Err(EngineError::Persist { .. })));
    }

    #[test]
    fn load_tracks_reads_minimal_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("playlist.json");
        fs::write(
            &path,
            r#"[{"id":"x","stream_url":"http://m/x","duration_secs":3.5,"tempo":128.0}]"#,
        )
        .unwrap();
        let tracks = load_tracks(&path).unwrap();
        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks[0].tempo, Some(128.0));
        assert!(tracks[0].beats.is_none());
    }
}
