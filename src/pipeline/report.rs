use crate::ledger::TransformLedger;
use crate::types::Stage;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

/// One executed stage
#[derive(Debug, Clone, Serialize)]
pub struct StageReport {
    pub stage: Stage,
    pub duration: Duration,
    pub modalities: Vec<String>,
    pub message: String,
}

/// Result of a completed run
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: Uuid,
    pub variant: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub stages: Vec<StageReport>,
    /// Files written per modality: outputs, center masks and intermediates
    pub outputs: BTreeMap<String, Vec<PathBuf>>,
    pub transformations: Vec<PathBuf>,
    pub ledger: TransformLedger,
}

impl RunReport {
    pub fn duration(&self) -> chrono::Duration {
        self.completed_at - self.started_at
    }

    pub fn executed_stages(&self) -> Vec<Stage> {
        self.stages.iter().map(|s| s.stage).collect()
    }

    pub fn stage(&self, stage: Stage) -> Option<&StageReport> {
        self.stages.iter().find(|s| s.stage == stage)
    }

    pub fn files_written(&self) -> usize {
        self.outputs.values().map(Vec::len).sum()
    }

    pub fn summary(&self) -> String {
        format!(
            "Run {} ({}) executed {} stages and wrote {} files in {}ms",
            self.run_id,
            self.variant,
            self.stages.len(),
            self.files_written(),
            self.duration().num_milliseconds()
        )
    }
}
