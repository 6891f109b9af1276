use super::{EventKind, JournalError, Lane};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fs::File, path::Path, time::Duration};
use tracing::info;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub lane: Lane,
    pub kind: EventKind,
    pub begin: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub correlation: Option<u64>,
}

impl Bar {
    pub fn duration(&self) -> Duration {
        (self.end - self.begin).to_std().unwrap_or(Duration::ZERO)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Milestone {
    pub lane: Lane,
    pub kind: EventKind,
    pub at: DateTime<Utc>,
    pub correlation: Option<u64>,
}

/// Reconstructed run, ready to be drawn as a gantt chart
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Timeline {
    pub bars: Vec<Bar>,
    pub milestones: Vec<Milestone>,
}

impl Timeline {
    /// summed length of every bar of `kind`
    pub fn total(&self, kind: EventKind) -> Duration {
        self.bars
            .iter()
            .filter(|bar| bar.kind == kind)
            .map(Bar::duration)
            .sum()
    }

    pub fn write_yaml(&self, path: &Path) -> Result<(), JournalError> {
        let file = File::create(path)?;
        serde_yaml::to_writer(file, self)?;

        info!(
            bars = self.bars.len(),
            milestones = self.milestones.len(),
            "Wrote timeline to {}",
            path.to_string_lossy()
        );

        Ok(())
    }
}
