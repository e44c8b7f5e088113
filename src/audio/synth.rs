//! Enveloped sine tones used when countdown assets are unavailable.

use std::f64::consts::TAU;

/// Silence floor the envelope starts from and decays to.
const FLOOR: f32 = 0.0001;
const ATTACK_SEC: f64 = 0.006;
/// Oscillator keeps running this long past the decay.
const TAIL_SEC: f64 = 0.03;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tone {
    pub freq: f32,
    pub duration: f64,
    pub gain: f32,
}

impl Tone {
    pub const BASE_GAIN: f32 = 0.065;

    pub fn new(freq: f32, duration: f64, gain: f32) -> Self {
        Tone { freq, duration, gain }
    }

    /// Numbered countdown beep.
    pub fn count(gain_factor: f32) -> Self {
        Tone::new(720.0, 0.085, Self::BASE_GAIN * gain_factor)
    }

    /// Final "go" beep, slightly louder and longer.
    pub fn go(gain_factor: f32) -> Self {
        Tone::new(1100.0, 0.12, Self::BASE_GAIN * 1.1 * gain_factor)
    }

    /// Inaudible blip that opens the output device.
    pub fn unlock() -> Self {
        Tone::new(30.0, 0.02, 0.000001)
    }

    /// Total time the tone occupies the output.
    pub fn length(&self) -> f64 {
        self.duration + TAIL_SEC
    }

    /// Gain envelope `t` seconds after the tone starts: linear attack then
    /// exponential decay back to the floor.
    pub fn envelope(&self, t: f64) -> f32 {
        if t < 0.0 || t >= self.length() || self.gain <= 0.0 {
            return 0.0;
        }
        if t < ATTACK_SEC {
            let k = (t / ATTACK_SEC) as f32;
            return FLOOR + (self.gain - FLOOR) * k;
        }
        if t < self.duration {
            let k = (t - ATTACK_SEC) / (self.duration - ATTACK_SEC);
            return self.gain * (FLOOR / self.gain).powf(k as f32);
        }
        FLOOR
    }

    pub fn sample_at(&self, t: f64) -> f32 {
        self.envelope(t) * (TAU * self.freq as f64 * t).sin() as f32
    }
}
