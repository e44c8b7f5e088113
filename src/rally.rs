//! Rally phase derivation.
//!
//! [`derive`] turns the mirrored roster, the active rally and the corrected
//! clock into a [`RallyView`]. Every participant's march is back-computed from
//! one shared arrival instant, so all marches land together regardless of
//! their individual durations. The function is pure and runs on every tick.

use log::debug;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub id: String,
    pub name: String,
    #[serde(rename = "marchMs", alias = "marchDurationMs")]
    pub march_ms: u64,
}

/// Server-authoritative description of the running rally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RallyDescriptor {
    pub starter_id: String,
    pub launch_at: i64,
    #[serde(default)]
    pub rally_duration_ms: Option<i64>,
    #[serde(default)]
    pub pre_delay_ms: Option<i64>,
    #[serde(default)]
    pub arrival_at: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Phase {
    Join,
    March,
    Landed,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Join => "JOIN",
            Phase::March => "MARCH",
            Phase::Landed => "LANDED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowStatus {
    RallyPending,
    RallyRunning,
    Wait,
    Marching,
}

impl RowStatus {
    pub fn badge(&self) -> &'static str {
        match self {
            RowStatus::RallyPending => "RALLY PENDING",
            RowStatus::RallyRunning => "RALLY RUNNING",
            RowStatus::Wait => "WAIT",
            RowStatus::Marching => "MARCHING",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CountdownRow {
    pub participant_id: String,
    pub name: String,
    pub march_ms: u64,
    /// When this participant must start marching.
    pub start_at: i64,
    /// When this participant must start gathering.
    pub rally_start_at: i64,
    pub diff_ms: i64,
    pub diff_to_rally_start_ms: i64,
    pub diff_from_launch_ms: i64,
    pub land_in_ms: i64,
}

impl CountdownRow {
    pub fn status(&self, phase: Phase) -> RowStatus {
        match phase {
            Phase::Join if self.diff_to_rally_start_ms > 0 => RowStatus::RallyPending,
            Phase::Join => RowStatus::RallyRunning,
            _ if self.diff_ms > 0 => RowStatus::Wait,
            _ => RowStatus::Marching,
        }
    }

    /// True if this participant has to leave before the starter launches.
    pub fn before_march(&self) -> bool {
        self.diff_from_launch_ms < 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RallyView {
    pub starter: Participant,
    pub phase: Phase,
    pub launch_at: i64,
    pub rally_start_at: i64,
    pub arrival_at: i64,
    pub rally_duration_ms: i64,
    pub join_remaining_ms: i64,
    pub rows: Vec<CountdownRow>,
}

/// Derive the current view of `rally`, or `None` if there is no rally or
/// its starter has left the roster.
///
/// A missing or non-positive rally duration falls back to `default_rally_duration_ms`.
/// Instants that do not fit in `i64` make the view (for the starter) or the
/// row (for anyone else) unavailable instead of wrapping.
pub fn derive(
    participants: &[Participant],
    rally: Option<&RallyDescriptor>,
    corrected_now: i64,
    default_rally_duration_ms: i64,
) -> Option<RallyView> {
    let rally = rally?;
    let starter = participants.iter().find(|p| p.id == rally.starter_id)?;

    let rally_duration_ms = rally
        .rally_duration_ms
        .filter(|d| *d > 0)
        .unwrap_or(default_rally_duration_ms);
    let launch_at = rally.launch_at;
    let rally_start_at = launch_at.checked_sub(rally_duration_ms)?;
    let arrival_at = match rally.arrival_at {
        Some(at) => at,
        None => launch_at.checked_add(march_ms(starter)?)?,
    };

    let join_remaining_ms = launch_at.checked_sub(corrected_now)?;
    let phase = if arrival_at <= corrected_now {
        Phase::Landed
    } else if join_remaining_ms > 0 {
        Phase::Join
    } else {
        Phase::March
    };

    let land_in_ms = arrival_at.checked_sub(corrected_now)?;
    let mut rows: Vec<CountdownRow> = participants
        .iter()
        .filter_map(|p| {
            let row = countdown_row(p, arrival_at, launch_at, rally_duration_ms, corrected_now, land_in_ms);
            if row.is_none() {
                debug!("[Rally] Skipping {} with out-of-range march {} ms", p.id, p.march_ms);
            }
            row
        })
        .filter(|r| r.land_in_ms >= 0)
        .collect();
    // Stable: ties keep roster order.
    rows.sort_by_key(|r| r.start_at);

    Some(RallyView {
        starter: starter.clone(),
        phase,
        launch_at,
        rally_start_at,
        arrival_at,
        rally_duration_ms,
        join_remaining_ms,
        rows,
    })
}

fn march_ms(p: &Participant) -> Option<i64> {
    i64::try_from(p.march_ms).ok()
}

fn countdown_row(
    p: &Participant,
    arrival_at: i64,
    launch_at: i64,
    rally_duration_ms: i64,
    now: i64,
    land_in_ms: i64,
) -> Option<CountdownRow> {
    let start_at = arrival_at.checked_sub(march_ms(p)?)?;
    let rally_start_at = start_at.checked_sub(rally_duration_ms)?;
    Some(CountdownRow {
        participant_id: p.id.clone(),
        name: p.name.clone(),
        march_ms: p.march_ms,
        start_at,
        rally_start_at,
        diff_ms: start_at.checked_sub(now)?,
        diff_to_rally_start_ms: rally_start_at.checked_sub(now)?,
        diff_from_launch_ms: start_at.checked_sub(launch_at)?,
        land_in_ms,
    })
}
