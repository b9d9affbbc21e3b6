//! Engine error taxonomy.
//!
//! Only failures that end a track's playback are represented here. Backpressure and
//! stream interruptions never surface as errors: the first is a bounded wait, the second
//! is reported as a natural end of stream.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// The decode executable could not be found.
    #[error("decoder executable not found: {program}")]
    DecoderMissing { program: String },

    /// The decode executable exists but could not be launched.
    #[error("failed to launch decoder {program}: {source}")]
    DecoderSpawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// Output device could not be opened or rejected a write.
    #[error("audio output error: {0}")]
    Device(String),

    /// A worker thread could not be spawned or panicked.
    #[error("worker thread {name} failed: {reason}")]
    Thread { name: &'static str, reason: String },

    /// The last-playlist file could not be read or written.
    #[error("playlist state {path:?}: {reason}")]
    Persist { path: PathBuf, reason: String },
}

impl EngineError {
    /// Wrap a cpal/anyhow device failure, keeping its context chain.
    pub fn device(err: anyhow::Error) -> Self {
        EngineError::Device(format!("{err:#}"))
    }
}

pub type Result<T, E = EngineError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn device_error_keeps_context_chain() {
        let err: anyhow::Result<()> = Err(anyhow::anyhow!("no such device")).context("open output");
        let mapped = EngineError::device(err.unwrap_err());
        assert_eq!(mapped.to_string(), "audio output error: open output: no such device");
    }

    #[test]
    fn decoder_missing_names_program() {
        let err = EngineError::DecoderMissing {
            program: "ffmpeg".to_string(),
        };
        assert_eq!(err.to_string(), "decoder executable not found: ffmpeg");
    }
}
