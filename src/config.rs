use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub sync: SyncConfig,
    pub announce: AnnounceConfig,
    pub audio: AudioConfig,
    pub rally: RallyConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub burst_count: usize,
    pub burst_spacing_ms: u64,
    pub burst_interval_ms: u64,
    pub fresh_ms: i64,
    pub foreground_gap_ms: i64, // tick gap treated as "came back to foreground"
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnnounceConfig {
    pub voice_enabled: bool,
    pub rally_calls: bool,
    pub march_calls: bool,
    pub lead_window_ms: i64,
    pub min_guard_ms: i64,
    /// When non-empty, only these participant ids are called.
    pub notify_only: Vec<String>,
    pub voice_level: u8, // 0-100
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub enabled: bool,
    pub asset_dir: String,
    pub asset_ext: String,
    pub beep_level: u8, // 0-100
    pub schedule_guard_sec: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RallyConfig {
    pub default_rally_minutes: u32,
    pub default_pre_delay_secs: u32,
    pub tick_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            burst_count: 6,
            burst_spacing_ms: 250,
            burst_interval_ms: 5_000,
            fresh_ms: 60_000,
            foreground_gap_ms: 3_000,
        }
    }
}

impl Default for AnnounceConfig {
    fn default() -> Self {
        AnnounceConfig {
            voice_enabled: true,
            rally_calls: true,
            march_calls: false,
            lead_window_ms: 5_200,
            min_guard_ms: 600,
            notify_only: Vec::new(),
            voice_level: 80,
        }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        AudioConfig {
            enabled: true,
            asset_dir: "countdown".to_string(),
            asset_ext: "ogg".to_string(),
            beep_level: 70,
            schedule_guard_sec: 0.02,
        }
    }
}

impl Default for RallyConfig {
    fn default() -> Self {
        RallyConfig {
            default_rally_minutes: 5,
            default_pre_delay_secs: 10,
            tick_ms: 200,
        }
    }
}

impl SessionConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config = serde_json::from_str(&raw)
            .with_context(|| format!("Invalid config {}", path.display()))?;
        Ok(config)
    }

    pub fn default_rally_duration_ms(&self) -> i64 {
        self.rally.default_rally_minutes as i64 * 60_000
    }
}

/// Map a 0-100 level onto a 0.0-1.0 gain.
pub fn level_to_gain(level: u8) -> f32 {
    (level as f32 / 100.0).clamp(0.0, 1.0)
}
