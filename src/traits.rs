use anyhow::Result;
use std::sync::Arc;

use crate::audio::synth::Tone;
use crate::audio::SoundBuffer;

/// Outgoing half of the room connection. Each call carries one JSON message.
#[cfg_attr(test, mockall::automock)]
pub trait Transport {
    fn send(&mut self, text: String) -> Result<()>;
}

/// Local wall clock in milliseconds since the Unix epoch (uncorrected).
#[cfg_attr(test, mockall::automock)]
pub trait WallClock {
    fn now_ms(&self) -> i64;
}

/// A low-jitter audio clock plus an append-only queue of scheduled sounds.
///
/// Times are seconds on the device clock, which runs independently of the
/// wall clock. Scheduled events are never cancelled or moved.
#[cfg_attr(test, mockall::automock)]
pub trait AudioOutput {
    /// Current position of the audio clock in seconds.
    fn current_time(&self) -> f64;

    /// Queue a decoded buffer to start at `at` seconds.
    fn play_buffer(&mut self, buffer: Arc<SoundBuffer>, at: f64, gain: f32);

    /// Queue a synthesized tone to start at `at` seconds.
    fn play_tone(&mut self, tone: Tone, at: f64);
}

#[cfg_attr(test, mockall::automock)]
pub trait SpeechOutput {
    /// Speak `text` at `volume` (0.0 to 1.0). Never blocks on playback.
    fn speak(&mut self, text: &str, volume: f32);

    /// Prepare the output ahead of the first cue. Silent.
    fn unlock(&mut self);
}

/// Loads one named countdown asset into a decoded buffer.
#[cfg_attr(test, mockall::automock)]
pub trait AssetSource: Send + Sync {
    fn load(&self, name: &str) -> Result<SoundBuffer>;
}

/// Wall clock backed by the system UTC time.
pub struct SystemWallClock;

impl WallClock for SystemWallClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}
