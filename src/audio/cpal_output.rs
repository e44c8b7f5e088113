//! CPAL output stream acting as the audio clock.
//!
//! The device callback is the only thing that advances the clock: each
//! rendered frame bumps a shared frame counter, so [`CpalOutput::current_time`]
//! is exactly the playback position and never jitters with the event loop.
//!
//! ```text
//! session thread ──play_*()──► Mixer (Mutex) ◄──render()── CPAL callback
//!                                                  │
//!                  current_time() ◄── frames (atomic) ◄┘
//! ```

use anyhow::{anyhow, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, SizedSample, Stream, StreamConfig};
use log::{info, warn};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use super::synth::Tone;
use super::SoundBuffer;
use crate::traits::AudioOutput;

enum VoiceSource {
    Buffer { buffer: Arc<SoundBuffer>, gain: f32 },
    Tone(Tone),
}

struct Voice {
    start_frame: u64,
    source: VoiceSource,
}

impl Voice {
    fn length_secs(&self) -> f64 {
        match &self.source {
            VoiceSource::Buffer { buffer, .. } => buffer.duration_secs(),
            VoiceSource::Tone(tone) => tone.length(),
        }
    }
}

/// Sums every scheduled voice at a given output frame.
pub struct Mixer {
    sample_rate: u32,
    voices: Vec<Voice>,
}

impl Mixer {
    pub fn new(sample_rate: u32) -> Self {
        Mixer {
            sample_rate,
            voices: Vec::new(),
        }
    }

    fn frame_at(&self, at: f64) -> u64 {
        (at.max(0.0) * self.sample_rate as f64).round() as u64
    }

    pub fn schedule_buffer(&mut self, buffer: Arc<SoundBuffer>, at: f64, gain: f32) {
        let start_frame = self.frame_at(at);
        self.voices.push(Voice {
            start_frame,
            source: VoiceSource::Buffer { buffer, gain },
        });
    }

    pub fn schedule_tone(&mut self, tone: Tone, at: f64) {
        let start_frame = self.frame_at(at);
        self.voices.push(Voice {
            start_frame,
            source: VoiceSource::Tone(tone),
        });
    }

    pub fn pending(&self) -> usize {
        self.voices.len()
    }

    pub fn render(&self, frame: u64) -> f32 {
        let mut mix = 0.0f32;
        for voice in &self.voices {
            if frame < voice.start_frame {
                continue;
            }
            let t = (frame - voice.start_frame) as f64 / self.sample_rate as f64;
            mix += match &voice.source {
                VoiceSource::Tone(tone) => tone.sample_at(t),
                VoiceSource::Buffer { buffer, gain } => sample_buffer(buffer, t) * gain,
            };
        }
        mix.clamp(-1.0, 1.0)
    }

    /// Drop voices that have finished by `frame`.
    pub fn retire(&mut self, frame: u64) {
        let sample_rate = self.sample_rate as f64;
        self.voices.retain(|v| {
            let end = v.start_frame + (v.length_secs() * sample_rate).ceil() as u64;
            end > frame
        });
    }
}

/// Linear interpolation into a buffer at its own sample rate.
fn sample_buffer(buffer: &SoundBuffer, t: f64) -> f32 {
    let pos = t * buffer.sample_rate as f64;
    let idx = pos.floor() as usize;
    let Some(a) = buffer.samples.get(idx) else {
        return 0.0;
    };
    let b = buffer.samples.get(idx + 1).copied().unwrap_or(0.0);
    let frac = (pos - idx as f64) as f32;
    a + (b - a) * frac
}

pub struct CpalOutput {
    _stream: Stream,
    mixer: Arc<Mutex<Mixer>>,
    frames: Arc<AtomicU64>,
    sample_rate: u32,
}

impl CpalOutput {
    /// Open the default output device. Fails if the platform has none.
    pub fn open() -> Result<Self> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| anyhow!("No audio output device"))?;
        let device_name = device.name().unwrap_or_else(|_| "Unknown".to_string());

        let supported = device.default_output_config()?;
        let sample_format = supported.sample_format();
        let config: StreamConfig = supported.into();
        let sample_rate = config.sample_rate.0;

        let mixer = Arc::new(Mutex::new(Mixer::new(sample_rate)));
        let frames = Arc::new(AtomicU64::new(0));

        let stream = match sample_format {
            SampleFormat::F32 => build_stream::<f32>(&device, &config, mixer.clone(), frames.clone())?,
            SampleFormat::I16 => build_stream::<i16>(&device, &config, mixer.clone(), frames.clone())?,
            SampleFormat::U16 => build_stream::<u16>(&device, &config, mixer.clone(), frames.clone())?,
            other => return Err(anyhow!("Unsupported sample format {:?}", other)),
        };
        stream.play()?;

        info!(
            "[Audio] Output on {} ({} Hz, {} channels)",
            device_name, sample_rate, config.channels
        );

        Ok(CpalOutput {
            _stream: stream,
            mixer,
            frames,
            sample_rate,
        })
    }

    fn with_mixer(&self, f: impl FnOnce(&mut Mixer)) {
        match self.mixer.lock() {
            Ok(mut mixer) => f(&mut mixer),
            Err(e) => warn!("[Audio] Mixer lock poisoned: {}", e),
        }
    }
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    mixer: Arc<Mutex<Mixer>>,
    frames: Arc<AtomicU64>,
) -> Result<Stream>
where
    T: SizedSample + FromSample<f32>,
{
    let channels = config.channels.max(1) as usize;
    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
            let start = frames.load(Ordering::Relaxed);
            let frame_count = (data.len() / channels) as u64;

            match mixer.lock() {
                Ok(mut m) => {
                    for (i, frame) in data.chunks_mut(channels).enumerate() {
                        let value = T::from_sample(m.render(start + i as u64));
                        frame.iter_mut().for_each(|s| *s = value);
                    }
                    m.retire(start + frame_count);
                }
                Err(_) => data.iter_mut().for_each(|s| *s = T::EQUILIBRIUM),
            }

            frames.fetch_add(frame_count, Ordering::Relaxed);
        },
        |e| warn!("[Audio] Stream error: {}", e),
        None,
    )?;
    Ok(stream)
}

impl AudioOutput for CpalOutput {
    fn current_time(&self) -> f64 {
        self.frames.load(Ordering::Relaxed) as f64 / self.sample_rate as f64
    }

    fn play_buffer(&mut self, buffer: Arc<SoundBuffer>, at: f64, gain: f32) {
        self.with_mixer(|m| m.schedule_buffer(buffer, at, gain));
    }

    fn play_tone(&mut self, tone: Tone, at: f64) {
        self.with_mixer(|m| m.schedule_tone(tone, at));
    }
}
