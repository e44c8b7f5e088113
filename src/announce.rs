//! One-shot announcement gating.
//!
//! [`plan_cues`] decides which rows are close enough to their next target to
//! deserve a voice call and countdown; [`AnnouncementDeduplicator`] makes sure
//! each `(phase, participant, target)` fires at most once per rally.

use std::collections::HashSet;

use crate::config::AnnounceConfig;
use crate::rally::{Phase, RallyView};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CuePhase {
    /// Participant should start gathering.
    Rally,
    /// Participant should start marching.
    March,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AnnouncementKey {
    pub phase: CuePhase,
    pub participant_id: String,
    pub target_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cue {
    pub key: AnnouncementKey,
    pub name: String,
}

/// Rally-scoped set of cues already produced.
#[derive(Debug, Default)]
pub struct AnnouncementDeduplicator {
    announced: HashSet<AnnouncementKey>,
}

impl AnnouncementDeduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn should_announce(&self, key: &AnnouncementKey) -> bool {
        !self.announced.contains(key)
    }

    pub fn mark_announced(&mut self, key: AnnouncementKey) {
        self.announced.insert(key);
    }

    /// Check and mark in one step. Returns true the first time only.
    pub fn claim(&mut self, key: &AnnouncementKey) -> bool {
        if !self.should_announce(key) {
            return false;
        }
        self.mark_announced(key.clone());
        true
    }

    pub fn reset(&mut self) {
        self.announced.clear();
    }

    pub fn len(&self) -> usize {
        self.announced.len()
    }

    pub fn is_empty(&self) -> bool {
        self.announced.is_empty()
    }
}

/// True when `target_at` is inside the trigger window relative to `now`.
pub fn in_trigger_window(target_at: i64, now: i64, lead_window_ms: i64, min_guard_ms: i64) -> bool {
    let ms_left = target_at - now;
    ms_left > 0 && ms_left <= lead_window_ms && ms_left > min_guard_ms
}

/// Cues due at `now` for `view`, before deduplication.
pub fn plan_cues(view: &RallyView, now: i64, config: &AnnounceConfig) -> Vec<Cue> {
    if !config.voice_enabled {
        return Vec::new();
    }

    let cue_phase = match view.phase {
        Phase::Join if config.rally_calls => CuePhase::Rally,
        Phase::March if config.march_calls => CuePhase::March,
        _ => return Vec::new(),
    };
    let only_selected = !config.notify_only.is_empty();

    view.rows
        .iter()
        .filter(|r| !only_selected || config.notify_only.contains(&r.participant_id))
        .filter_map(|r| {
            let target_at = match cue_phase {
                CuePhase::Rally => r.rally_start_at,
                CuePhase::March => r.start_at,
            };
            if !in_trigger_window(target_at, now, config.lead_window_ms, config.min_guard_ms) {
                return None;
            }
            Some(Cue {
                key: AnnouncementKey {
                    phase: cue_phase,
                    participant_id: r.participant_id.clone(),
                    target_at,
                },
                name: r.name.clone(),
            })
        })
        .collect()
}
