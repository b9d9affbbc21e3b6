#![allow(dead_code)]

use std::io::Cursor;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use beatbar_types::Track;
use stream_player::config::{DeviceParams, EngineConfig};
use stream_player::decode::{DecodeBackend, DecodeStream};
use stream_player::error::{EngineError, Result};
use stream_player::stream::StreamDescriptor;

#[derive(Clone, Copy, Debug)]
pub enum Script {
    /// `n` frames, frame `i` filled with byte `i`, then EOF.
    Frames(usize),
    /// Never reaches EOF.
    Endless,
    /// Behaves like a missing decoder executable.
    Missing,
}

/// In-memory decode step counting its launches.
#[derive(Clone, Debug)]
pub struct ScriptedDecoder {
    script: Script,
    launches: Arc<AtomicUsize>,
}

impl ScriptedDecoder {
    pub fn new(script: Script) -> Self {
        Self {
            script,
            launches: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }
}

impl DecodeBackend for ScriptedDecoder {
    fn launch(&self, desc: &StreamDescriptor) -> Result<DecodeStream> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        match self.script {
            Script::Frames(n) => {
                let bytes: Vec<u8> = (0..n)
                    .flat_map(|i| std::iter::repeat_n(i as u8, desc.read_size))
                    .collect();
                Ok(DecodeStream {
                    pcm: Box::new(Cursor::new(bytes)),
                    process: None,
                })
            }
            Script::Endless => Ok(DecodeStream {
                pcm: Box::new(std::io::repeat(1)),
                process: None,
            }),
            Script::Missing => Err(EngineError::DecoderMissing {
                program: "ffmpeg".to_string(),
            }),
        }
    }
}

/// 1 kHz mono, 4-sample blocks: 8-byte frames, 8 ms push timeout at depth 2.
pub fn params() -> DeviceParams {
    DeviceParams {
        sample_rate: 1000,
        channels: 1,
        block_size: 4,
        buffer_depth: 2,
    }
}

pub fn config() -> EngineConfig {
    EngineConfig {
        poll_interval: Duration::from_millis(5),
        beat_poll_interval: Duration::from_millis(5),
        reap_grace: Duration::from_millis(50),
        ..EngineConfig::default()
    }
}

pub fn track(id: &str) -> Track {
    Track {
        id: id.to_string(),
        title: Some(format!("Track {id}")),
        stream_url: format!("http://media.local/rest/stream?id={id}"),
        duration_secs: 30.0,
        tempo: None,
        beats: None,
    }
}

pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    cond()
}
