//! Track sequencing above a [`Player`].
//!
//! Holds the ordered track list and a cursor; reacts to the status each `play()`
//! returns by moving the cursor, and persists the position after every move when a
//! [`PlaylistStore`] is attached.

use beatbar_types::{PlaybackStatus, Track};

use crate::controller::Player;
use crate::error::Result;
use crate::playlist::{LastPlaylist, PlaylistStore};

/// Ordered tracks plus the index of the current one.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TrackQueue {
    tracks: Vec<Track>,
    cursor: usize,
}

impl TrackQueue {
    pub fn new(tracks: Vec<Track>) -> Self {
        Self { tracks, cursor: 0 }
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Track under the cursor, `None` once the queue is exhausted.
    pub fn current(&self) -> Option<&Track> {
        self.tracks.get(self.cursor)
    }

    /// Move forward one track. Returns `false` when that runs off the end.
    pub fn advance(&mut self) -> bool {
        if self.cursor < self.tracks.len() {
            self.cursor += 1;
        }
        self.cursor < self.tracks.len()
    }

    /// Move back one track, staying on the first.
    pub fn back(&mut self) {
        self.cursor = self.cursor.saturating_sub(1);
    }

    /// Put the cursor on the first track with `id` at or after the cursor, without
    /// playing anything in between. Leaves the cursor alone when `id` is not ahead.
    pub fn skip_to(&mut self, id: &str) -> bool {
        match self.tracks[self.cursor.min(self.tracks.len())..]
            .iter()
            .position(|t| t.id == id)
        {
            Some(offset) => {
                self.cursor += offset;
                true
            }
            None => false,
        }
    }
}

/// Play `queue` from its cursor until it runs out or a terminal status comes back.
///
/// Returns `Stopped` when the queue is exhausted, otherwise the terminal status the
/// player reported (`Stopped` or `Exit`). Player errors end the sequence.
pub fn run_queue<P: Player + ?Sized>(
    player: &mut P,
    queue: &mut TrackQueue,
    store: Option<&PlaylistStore>,
) -> Result<PlaybackStatus> {
    loop {
        let Some(track) = queue.current().cloned() else {
            tracing::info!(tracks = queue.len(), "queue finished");
            return Ok(PlaybackStatus::Stopped);
        };
        if let Some(store) = store {
            if let Err(e) = store.save(&LastPlaylist::from_queue(queue)) {
                tracing::warn!("could not persist last playlist: {e}");
            }
        }
        tracing::info!(
            position = queue.cursor() + 1,
            of = queue.len(),
            track = %track.id,
            "now playing {}",
            track.label()
        );

        match player.play(&track)? {
            PlaybackStatus::Next | PlaybackStatus::Playing | PlaybackStatus::Resumed => {
                queue.advance();
            }
            PlaybackStatus::Previous => queue.back(),
            PlaybackStatus::Loading | PlaybackStatus::Paused => {
                // play() never returns these; treat like natural end.
                queue.advance();
            }
            status @ (PlaybackStatus::Stopped | PlaybackStatus::Exit | PlaybackStatus::Error) => {
                return Ok(status);
            }
        }
    }
}
