use beatbar_types::Track;

use crate::config::DeviceParams;

/// Raw PCM sample width handed from the decoder to the output (signed 16-bit LE).
pub const SAMPLE_WIDTH_BYTES: usize = 2;

/// Target PCM layout requested from the decode step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OutputFormat {
    pub sample_rate: u32,
    pub channels: u16,
    /// Bytes per sample.
    pub sample_width: usize,
}

impl OutputFormat {
    /// Decoder sample format name for this width.
    pub fn pcm_format(&self) -> &'static str {
        match self.sample_width {
            4 => "s32le",
            _ => "s16le",
        }
    }
}

/// Everything the decode step needs for one track. Built once, never mutated.
#[derive(Clone, Debug, PartialEq)]
pub struct StreamDescriptor {
    pub track_id: String,
    pub url: String,
    pub format: OutputFormat,
    pub duration_secs: f64,
    /// Bytes read from the decoder per frame (one device block).
    pub read_size: usize,
}

impl StreamDescriptor {
    pub fn for_track(track: &Track, device: &DeviceParams) -> Self {
        let format = OutputFormat {
            sample_rate: device.sample_rate,
            channels: device.channels,
            sample_width: SAMPLE_WIDTH_BYTES,
        };
        Self {
            track_id: track.id.clone(),
            url: track.stream_url.clone(),
            format,
            duration_secs: track.duration_secs,
            read_size: device.block_bytes(SAMPLE_WIDTH_BYTES).max(SAMPLE_WIDTH_BYTES),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_uses_device_block_for_read_size() {
        let track = Track {
            id: "a1".to_string(),
            title: None,
            stream_url: "http://media/a1/stream".to_string(),
            duration_secs: 180.0,
            tempo: Some(120.0),
            beats: None,
        };
        let device = DeviceParams {
            sample_rate: 44_100,
            channels: 2,
            block_size: 1024,
            buffer_depth: 8,
        };
        let desc = StreamDescriptor::for_track(&track, &device);
        assert_eq!(desc.read_size, 4096);
        assert_eq!(desc.format.sample_rate, 44_100);
        assert_eq!(desc.format.pcm_format(), "s16le");
        assert_eq!(desc.url, track.stream_url);
    }
}
