use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct SyncStatus {
    pub offset_ms: f64,
    pub rtt_ms: Option<f64>,
    pub last_sync_at: Option<i64>,
    pub live: bool,
    pub samples: usize,
}

impl Default for SyncStatus {
    fn default() -> Self {
        SyncStatus {
            offset_ms: 0.0,
            rtt_ms: None,
            last_sync_at: None,
            live: false,
            samples: 0,
        }
    }
}

impl SyncStatus {
    pub fn label(&self) -> &'static str {
        if self.live {
            "Live"
        } else {
            "Syncing"
        }
    }

    /// One-line summary for status logs.
    pub fn summary(&self) -> String {
        let rtt = match self.rtt_ms {
            Some(r) => format!("{:.0} ms", r),
            None => "?".to_string(),
        };
        format!(
            "{} | offset {:.0} ms | rtt {} | {} samples",
            self.label(),
            self.offset_ms,
            rtt,
            self.samples
        )
    }
}
