//! Streaming playback engine.
//!
//! A decoder subprocess feeds a bounded [`queue::FrameQueue`] that an output writer
//! drains into the audio device, while a beat scheduler emits beat-aligned events off
//! audible playback time. [`controller::PlaybackController`] ties one track's threads
//! together; [`sequencer::run_queue`] plays a list of tracks end to end.

pub mod beat;
pub mod config;
pub mod controller;
pub mod decode;
pub mod device;
pub mod error;
pub mod output;
pub mod playback;
pub mod playlist;
pub mod queue;
pub mod sequencer;
pub mod signal;
pub mod sink;
pub mod stream;

pub use controller::{PlaybackController, Player, PlayerHandle};
pub use error::{EngineError, Result};
