//! Output device discovery and selection.
//!
//! Thin wrappers around CPAL for:
//! - listing available output devices
//! - selecting either the default device or a device by substring match
//! - deriving the [`DeviceParams`] the engine sizes its buffers and decoder output from

use anyhow::{Context, Result, anyhow};
use cpal::traits::{DeviceTrait, HostTrait};

use crate::config::DeviceParams;

/// Block size used when the device does not advertise a buffer size range.
pub const DEFAULT_BLOCK_FRAMES: u32 = 2048;

/// Pick the first output device whose name contains `needle` (case-insensitive), or the
/// host default device.
///
/// Returns an error if no matching device exists or if the host reports no output devices.
pub fn pick_device(host: &cpal::Host, needle: Option<&str>) -> Result<cpal::Device> {
    let mut devices: Vec<cpal::Device> = host
        .output_devices()
        .context("No output devices")?
        .collect();

    if let Some(needle) = needle {
        if let Some(d) = devices.drain(..).find(|d| {
            d.description()
                .ok()
                .map(|n| matches_device_name(&n.name(), needle))
                .unwrap_or(false)
        }) {
            return Ok(d);
        }
        return Err(anyhow!("No output device matched: {needle}"));
    }

    host.default_output_device()
        .ok_or_else(|| anyhow!("No default output device"))
}

/// Derive engine device parameters from the device's native (default) output config.
pub fn discover_params(device: &cpal::Device, buffer_depth: usize) -> Result<DeviceParams> {
    let config = device
        .default_output_config()
        .context("query default output config")?;
    let block_size = pick_block_size(config.buffer_size(), DEFAULT_BLOCK_FRAMES);
    Ok(DeviceParams {
        sample_rate: config.sample_rate(),
        channels: config.channels(),
        block_size,
        buffer_depth: buffer_depth.max(1),
    })
}

/// Choose the sample format and stream config for opening `params` on `device`.
///
/// Only configs matching the exact channel count and containing the sample rate are
/// considered, because the decoder already produces audio in that layout. Among those,
/// f32 is preferred, then i32, i16, u16.
pub fn stream_config_for(
    device: &cpal::Device,
    params: &DeviceParams,
) -> Result<(cpal::SampleFormat, cpal::StreamConfig)> {
    let ranges: Vec<cpal::SupportedStreamConfigRange> = device
        .supported_output_configs()
        .context("query supported output configs")?
        .collect();

    let best = ranges
        .into_iter()
        .filter(|r| {
            r.channels() == params.channels
                && r.min_sample_rate() <= params.sample_rate
                && params.sample_rate <= r.max_sample_rate()
        })
        .min_by_key(|r| sample_format_rank(r.sample_format()))
        .ok_or_else(|| {
            anyhow!(
                "No output config for {} Hz / {} channels",
                params.sample_rate,
                params.channels
            )
        })?;

    let supported = best.with_sample_rate(params.sample_rate);
    let buffer_size = match supported.buffer_size() {
        cpal::SupportedBufferSize::Range { min, max }
            if (*min..=*max).contains(&params.block_size) =>
        {
            cpal::BufferSize::Fixed(params.block_size)
        }
        _ => cpal::BufferSize::Default,
    };
    let mut stream_config: cpal::StreamConfig = supported.clone().into();
    stream_config.buffer_size = buffer_size;
    Ok((supported.sample_format(), stream_config))
}

/// Pick a block size, preferring `preferred` clamped into the device's supported range.
pub fn pick_block_size(supported: &cpal::SupportedBufferSize, preferred: u32) -> u32 {
    match supported {
        cpal::SupportedBufferSize::Range { min, max } if *min <= *max && *max > 0 => {
            preferred.clamp((*min).max(1), *max)
        }
        _ => preferred,
    }
}

fn sample_format_rank(format: cpal::SampleFormat) -> u8 {
    match format {
        cpal::SampleFormat::F32 => 0,
        cpal::SampleFormat::I32 => 1,
        cpal::SampleFormat::I16 => 2,
        cpal::SampleFormat::U16 => 3,
        _ => 10,
    }
}

/// Print available output devices and their native config to stdout.
///
/// This is intended for CLI UX (`--list-devices`) rather than structured output.
pub fn list_devices(host: &cpal::Host) -> Result<()> {
    let devices = host.output_devices().context("No output devices")?;
    for (i, d) in devices.enumerate() {
        let name = d.description()?.to_string();
        match d.default_output_config() {
            Ok(cfg) => println!(
                "#{i}: {name} ({} Hz, {} ch, {:?})",
                cfg.sample_rate(),
                cfg.channels(),
                cfg.sample_format()
            ),
            Err(_) => println!("#{i}: {name}"),
        }
    }
    Ok(())
}

/// Trim a user-supplied device name; blank means "use the default device".
pub fn normalize_device_name(device: Option<String>) -> Option<String> {
    device.and_then(|name| {
        let trimmed = name.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn matches_device_name(name: &str, needle: &str) -> bool {
    let needle = needle.trim();
    if needle.is_empty() {
        return false;
    }
    name.to_lowercase().contains(&needle.to_lowercase())
}
