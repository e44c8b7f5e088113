//! Countdown audio scheduled on the output device clock.
//!
//! Targets arrive as reference-clock milliseconds. [`AudioCountdownScheduler`]
//! converts them to positions on the audio clock, which is not subject to
//! tick or timer jitter, and queues numbered cues one second apart ending in
//! a "go" cue at the target. Decoded assets are used once preloaded; until
//! then (or for the whole session if loading failed) enveloped tones stand in.

pub mod assets;
pub mod cpal_output;
pub mod synth;

use log::{debug, info, warn};
use std::sync::Arc;
use tokio::sync::OnceCell;

use crate::traits::{AssetSource, AudioOutput};
use synth::Tone;

/// Numbered cues, in playback order. Each plays `n` seconds before the target.
pub const COUNTDOWN_NUMBERS: [u32; 5] = [5, 4, 3, 2, 1];
pub const GO_ASSET: &str = "AirHorn";
pub const GO_GAIN_FACTOR: f32 = 0.6;
pub const DEFAULT_SCHEDULE_GUARD_SEC: f64 = 0.02;
const UNLOCK_LEAD_SEC: f64 = 0.01;

/// Decoded mono PCM.
#[derive(Debug, Clone)]
pub struct SoundBuffer {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl SoundBuffer {
    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

#[derive(Debug)]
pub struct CountdownBuffers {
    /// Same order as [`COUNTDOWN_NUMBERS`].
    pub numbers: Vec<Arc<SoundBuffer>>,
    pub go: Arc<SoundBuffer>,
}

fn load_all(source: &dyn AssetSource) -> anyhow::Result<CountdownBuffers> {
    let numbers = COUNTDOWN_NUMBERS
        .iter()
        .map(|n| source.load(&n.to_string()).map(Arc::new))
        .collect::<anyhow::Result<Vec<_>>>()?;
    let go = Arc::new(source.load(GO_ASSET)?);
    Ok(CountdownBuffers { numbers, go })
}

/// Memoized, load-once countdown assets shared by the session.
///
/// The first [`AssetCache::preload`] starts the load; concurrent and later
/// callers await the same result. A failed load is cached as `None`.
#[derive(Clone)]
pub struct AssetCache {
    source: Arc<dyn AssetSource>,
    cell: Arc<OnceCell<Option<Arc<CountdownBuffers>>>>,
}

impl AssetCache {
    pub fn new(source: Arc<dyn AssetSource>) -> Self {
        AssetCache {
            source,
            cell: Arc::new(OnceCell::new()),
        }
    }

    pub async fn preload(&self) -> Option<Arc<CountdownBuffers>> {
        self.cell
            .get_or_init(|| async {
                let source = Arc::clone(&self.source);
                match tokio::task::spawn_blocking(move || load_all(source.as_ref())).await {
                    Ok(Ok(buffers)) => {
                        info!("[Audio] Countdown sounds loaded");
                        Some(Arc::new(buffers))
                    }
                    Ok(Err(e)) => {
                        warn!("[Audio] Failed to preload countdown sounds: {:#}", e);
                        None
                    }
                    Err(e) => {
                        warn!("[Audio] Countdown preload task failed: {}", e);
                        None
                    }
                }
            })
            .await
            .clone()
    }

    /// Start a background preload if a runtime is available. Idempotent.
    pub fn spawn_preload(&self) {
        if self.cell.initialized() {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let cache = self.clone();
                handle.spawn(async move {
                    cache.preload().await;
                });
            }
            Err(_) => debug!("[Audio] No runtime, countdown preload deferred"),
        }
    }

    /// Loaded buffers, if the preload finished successfully.
    pub fn buffers(&self) -> Option<Arc<CountdownBuffers>> {
        self.cell.get().cloned().flatten()
    }
}

pub struct AudioCountdownScheduler {
    output: Option<Box<dyn AudioOutput>>,
    assets: AssetCache,
    guard_sec: f64,
}

impl AudioCountdownScheduler {
    /// `output` is `None` when the platform has no audio device; every
    /// scheduling call is then a no-op.
    pub fn new(output: Option<Box<dyn AudioOutput>>, assets: AssetCache) -> Self {
        AudioCountdownScheduler {
            output,
            assets,
            guard_sec: DEFAULT_SCHEDULE_GUARD_SEC,
        }
    }

    pub fn with_guard(mut self, guard_sec: f64) -> Self {
        self.guard_sec = guard_sec;
        self
    }

    pub fn has_output(&self) -> bool {
        self.output.is_some()
    }

    pub fn assets(&self) -> &AssetCache {
        &self.assets
    }

    pub async fn preload_assets(&self) -> Option<Arc<CountdownBuffers>> {
        self.assets.preload().await
    }

    /// Synthesized tone at audio-clock time `at`.
    pub fn beep_at(&mut self, at: f64, tone: Tone) {
        if let Some(output) = self.output.as_mut() {
            output.play_tone(tone, at);
        }
    }

    /// Open the output with an inaudible blip and start loading assets.
    pub fn unlock(&mut self) {
        if let Some(now) = self.output.as_ref().map(|o| o.current_time()) {
            self.beep_at(now + UNLOCK_LEAD_SEC, Tone::unlock());
        }
        self.assets.spawn_preload();
    }

    /// Queue the countdown ending at `target_at` (reference ms), given the
    /// corrected clock `now`. Returns the number of events queued.
    pub fn schedule_countdown(&mut self, target_at: i64, now: i64, gain_factor: f32) -> usize {
        let buffers = self.assets.buffers();
        let Some(output) = self.output.as_mut() else {
            return 0;
        };

        let current = output.current_time();
        let secs_until_target = ((target_at - now) as f64 / 1000.0).max(0.0);
        let base = current + secs_until_target;
        let earliest = current + self.guard_sec;

        let mut queued = 0;
        for (i, n) in COUNTDOWN_NUMBERS.iter().enumerate() {
            let at = base - *n as f64;
            if at < earliest {
                continue;
            }
            match &buffers {
                Some(b) => output.play_buffer(Arc::clone(&b.numbers[i]), at, gain_factor),
                None => output.play_tone(Tone::count(gain_factor), at),
            }
            queued += 1;
        }

        if base >= earliest {
            match &buffers {
                Some(b) => output.play_buffer(Arc::clone(&b.go), base, gain_factor * GO_GAIN_FACTOR),
                None => output.play_tone(Tone::go(gain_factor), base),
            }
            queued += 1;
        }

        debug!(
            "[Audio] Queued {} cues for target in {:.2}s ({})",
            queued,
            secs_until_target,
            if buffers.is_some() { "assets" } else { "tones" }
        );
        queued
    }

    /// Release the output device.
    pub fn dispose(&mut self) {
        if self.output.take().is_some() {
            info!("[Audio] Output released");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::{MockAssetSource, MockAudioOutput};
    use anyhow::anyhow;
    use mockall::predicate::*;
    use mockall::Sequence;

    fn buffer(len: usize) -> SoundBuffer {
        SoundBuffer {
            samples: vec![0.1; len],
            sample_rate: 48_000,
        }
    }

    fn failing_cache() -> AssetCache {
        let mut source = MockAssetSource::new();
        source
            .expect_load()
            .returning(|name| Err(anyhow!("404 for {}", name)));
        AssetCache::new(Arc::new(source))
    }

    fn loading_cache() -> AssetCache {
        let mut source = MockAssetSource::new();
        source.expect_load().times(6).returning(|_| Ok(buffer(10)));
        AssetCache::new(Arc::new(source))
    }

    fn close(expected: f64) -> impl Fn(&f64) -> bool {
        move |at: &f64| (at - expected).abs() < 1e-9
    }

    #[tokio::test]
    async fn test_failed_preload_falls_back_to_tones() {
        let _ = env_logger::builder().is_test(true).try_init();
        let cache = failing_cache();
        assert!(cache.preload().await.is_none());
        assert!(cache.preload().await.is_none());

        let mut output = MockAudioOutput::new();
        let mut seq = Sequence::new();
        output.expect_current_time().return_const(10.0);
        for offset in [1.0, 2.0, 3.0, 4.0, 5.0] {
            output
                .expect_play_tone()
                .withf(move |tone, at| tone.freq == 720.0 && (at - (10.0 + offset)).abs() < 1e-9)
                .times(1)
                .in_sequence(&mut seq)
                .return_const(());
        }
        output
            .expect_play_tone()
            .withf(|tone, at| tone.freq == 1100.0 && (at - 16.0).abs() < 1e-9)
            .times(1)
            .in_sequence(&mut seq)
            .return_const(());
        output.expect_play_buffer().never();

        let mut scheduler = AudioCountdownScheduler::new(Some(Box::new(output)), cache);
        assert_eq!(scheduler.schedule_countdown(1_006_000, 1_000_000, 1.0), 6);
    }

    #[tokio::test]
    async fn test_preload_is_memoized() {
        let cache = loading_cache();
        let (a, b) = tokio::join!(cache.preload(), cache.preload());
        let a = a.unwrap();
        assert!(Arc::ptr_eq(&a, &b.unwrap()));
        assert_eq!(a.numbers.len(), COUNTDOWN_NUMBERS.len());

        // Mock allows exactly six loads, so a second load would panic.
        assert!(cache.preload().await.is_some());
        assert!(cache.buffers().is_some());
    }

    #[tokio::test]
    async fn test_loaded_assets_are_scheduled() {
        let cache = loading_cache();
        cache.preload().await;

        let mut output = MockAudioOutput::new();
        output.expect_current_time().return_const(2.0);
        // Target 3.5s ahead: only "3", "2", "1" and go are still in the future.
        output
            .expect_play_buffer()
            .withf(|_, at, gain| *gain == 0.5 && [2.5, 3.5, 4.5].iter().any(|t| (at - t).abs() < 1e-9))
            .times(3)
            .return_const(());
        output
            .expect_play_buffer()
            .with(always(), function(close(5.5)), eq(0.5 * GO_GAIN_FACTOR))
            .times(1)
            .return_const(());
        output.expect_play_tone().never();

        let mut scheduler = AudioCountdownScheduler::new(Some(Box::new(output)), cache);
        assert_eq!(scheduler.schedule_countdown(13_500, 10_000, 0.5), 4);
    }

    #[test]
    fn test_past_target_schedules_nothing() {
        let mut output = MockAudioOutput::new();
        output.expect_current_time().return_const(1.0);
        output.expect_play_tone().never();
        output.expect_play_buffer().never();

        let mut scheduler = AudioCountdownScheduler::new(Some(Box::new(output)), failing_cache());
        assert_eq!(scheduler.schedule_countdown(1_000, 5_000, 1.0), 0);
    }

    #[test]
    fn test_guard_drops_cue_too_close() {
        let mut output = MockAudioOutput::new();
        output.expect_current_time().return_const(0.0);
        // Target 1.01s ahead: "1" would land at 0.01s, inside the 20ms guard.
        output
            .expect_play_tone()
            .withf(|tone, at| tone.freq == 1100.0 && (at - 1.01).abs() < 1e-9)
            .times(1)
            .return_const(());

        let mut scheduler = AudioCountdownScheduler::new(Some(Box::new(output)), failing_cache());
        assert_eq!(scheduler.schedule_countdown(1_010, 0, 1.0), 1);
    }

    #[test]
    fn test_missing_output_is_silent() {
        let mut scheduler = AudioCountdownScheduler::new(None, failing_cache());
        assert!(!scheduler.has_output());
        assert_eq!(scheduler.schedule_countdown(10_000, 0, 1.0), 0);
        scheduler.beep_at(1.0, Tone::go(1.0));
        scheduler.unlock();
        scheduler.dispose();
    }

    #[test]
    fn test_unlock_plays_inaudible_tone() {
        let mut output = MockAudioOutput::new();
        output.expect_current_time().return_const(3.0);
        output
            .expect_play_tone()
            .withf(|tone, at| *tone == Tone::unlock() && (at - 3.01).abs() < 1e-9)
            .times(1)
            .return_const(());

        let mut scheduler = AudioCountdownScheduler::new(Some(Box::new(output)), failing_cache());
        scheduler.unlock();
    }
}
