use super::backends::Backends;
use super::cancellation::CancellationToken;
use super::context::{ModalityState, RunContext};
use super::executor::StageExecutor;
use super::materialize::materialize;
use super::plan::StagePlan;
use super::report::{RunReport, StageReport};
use super::steps::step_for;
use super::variants::PipelineVariant;
use crate::error::{PreprocessError, Result};
use crate::ledger::TransformLedger;
use crate::modality::{CenterModality, Modality};
use crate::types::{ImageStage, Stage};
use chrono::Utc;
use metrics::{counter, histogram};
use std::collections::{BTreeMap, HashMap};
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info};
use uuid::Uuid;

/// Knobs of a single run
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Limit for each individual backend call
    pub stage_timeout: Option<Duration>,
    pub max_parallel: usize,
    /// Directories receiving `{modality}_{stage}` intermediates
    pub save_dirs: HashMap<Stage, PathBuf>,
    pub transformations_dir: Option<PathBuf>,
    pub cancellation: CancellationToken,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            stage_timeout: None,
            max_parallel: std::thread::available_parallelism().map(NonZeroUsize::get).unwrap_or(1),
            save_dirs: HashMap::new(),
            transformations_dir: None,
            cancellation: CancellationToken::new(),
        }
    }
}

impl RunOptions {
    pub fn with_stage_timeout(mut self, timeout: Duration) -> Self {
        self.stage_timeout = Some(timeout);
        self
    }

    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel;
        self
    }

    pub fn with_save_dir(mut self, stage: Stage, dir: impl Into<PathBuf>) -> Self {
        self.save_dirs.insert(stage, dir.into());
        self
    }

    pub fn with_transformations_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.transformations_dir = Some(dir.into());
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }
}

/// Sequences the planned stages over one center and any number of moving
/// modalities, materializing outputs as soon as their image is final.
pub struct PipelineOrchestrator {
    variant: PipelineVariant,
    center: CenterModality,
    moving: Vec<Modality>,
    backends: Backends,
    options: RunOptions,
    plan: StagePlan,
}

impl PipelineOrchestrator {
    /// Validate the configuration and infer the stage plan. No backend is called.
    pub fn new(
        variant: PipelineVariant,
        center: CenterModality,
        moving: Vec<Modality>,
        backends: Backends,
        options: RunOptions,
    ) -> Result<Self> {
        let plan = StagePlan::build(&variant, &center, &moving, &backends)?;
        info!("📋 {} pipeline for '{}' plans: {}", variant, center.name(), plan);
        for (stage, dir) in &options.save_dirs {
            if !plan.contains(*stage) {
                info!("⏭️ Intermediate directory for '{}' ignored, stage not planned: {}", stage, dir.display());
            }
        }
        Ok(Self { variant, center, moving, backends, options, plan })
    }

    pub fn plan(&self) -> &StagePlan {
        &self.plan
    }

    pub fn variant(&self) -> &PipelineVariant {
        &self.variant
    }

    pub async fn run(&self) -> Result<RunReport> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(
            "🚀 Starting {} run {} with center '{}' and {} moving modalities",
            self.variant,
            run_id,
            self.center.name(),
            self.moving.len()
        );

        let executor = StageExecutor::new(
            self.options.stage_timeout,
            self.options.max_parallel,
            self.options.cancellation.clone(),
        );
        let first_stage = self.plan.stages().next().unwrap_or(Stage::Coregistration);
        executor.check_cancelled(first_stage)?;

        let mut ctx = RunContext {
            states: self.load_inputs(&executor, first_stage).await?,
            executor,
            backends: self.backends.clone(),
            plan: self.plan.clone(),
            variant: self.variant.clone(),
            center: self.center.clone(),
            ledger: TransformLedger::new(),
            save_dirs: self.options.save_dirs.clone(),
            written: BTreeMap::new(),
        };

        let planned: Vec<Stage> = self.plan.stages().collect();
        let mut stage_reports = Vec::with_capacity(planned.len());
        let mut skull_final = false;

        for (index, stage) in planned.iter().copied().enumerate() {
            ctx.executor.check_cancelled(stage)?;
            info!("🔄 Executing stage {}/{}: {}", index + 1, planned.len(), stage);

            let step = step_for(stage);
            let timer = Instant::now();
            let outcome = match step.execute(&mut ctx).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!("❌ Stage '{}' failed: {}", stage, e);
                    return Err(e);
                }
            };
            let elapsed = timer.elapsed();
            counter!("brainprep_stage_runs_total", "stage" => stage.as_str()).increment(1);
            histogram!("brainprep_stage_duration_seconds", "stage" => stage.as_str())
                .record(elapsed.as_secs_f64());
            info!("✅ Stage '{}' completed in {:?}: {}", stage, elapsed, outcome.message);

            stage_reports.push(StageReport {
                stage,
                duration: elapsed,
                modalities: outcome.modalities,
                message: outcome.message,
            });

            // the skull image is final once only masking stages remain
            if !skull_final && planned.iter().all(|s| *s <= stage || *s >= Stage::BrainExtraction) {
                materialize(&mut ctx, stage, ImageStage::Skull).await?;
                skull_final = true;
            }
            match stage {
                Stage::BrainExtraction => {
                    materialize(&mut ctx, stage, ImageStage::BrainExtracted).await?;
                }
                Stage::Defacing => {
                    materialize(&mut ctx, stage, ImageStage::Defaced).await?;
                }
                _ => {}
            }
        }

        let transformations = match &self.options.transformations_dir {
            Some(dir) => {
                let ledger = ctx.ledger.clone();
                let modalities: Vec<String> = ctx.states.keys().cloned().collect();
                let dir = dir.clone();
                let last_stage = planned.last().copied().unwrap_or(first_stage);
                ctx.executor
                    .call(last_stage, None, move || {
                        ledger
                            .save(&dir, modalities.iter().map(String::as_str))
                            .map_err(anyhow::Error::new)
                    })
                    .await?
            }
            None => Vec::new(),
        };

        let report = RunReport {
            run_id,
            variant: self.variant.to_string(),
            started_at,
            completed_at: Utc::now(),
            stages: stage_reports,
            outputs: ctx.written,
            transformations,
            ledger: ctx.ledger,
        };
        info!("🎉 {}", report.summary());
        Ok(report)
    }

    async fn load_inputs(
        &self,
        executor: &StageExecutor,
        stage: Stage,
    ) -> Result<BTreeMap<String, ModalityState>> {
        let modalities: Vec<(Modality, bool)> = std::iter::once((self.center.modality().clone(), true))
            .chain(self.moving.iter().cloned().map(|m| (m, false)))
            .collect();
        let items: Vec<(String, PathBuf)> = modalities
            .iter()
            .map(|(m, _)| (m.name().to_string(), m.input_path().to_path_buf()))
            .collect();

        let io = Arc::clone(&self.backends.io);
        let mut loaded = executor
            .fan_out(stage, items, move |name, path: PathBuf| {
                io.read(&path).map_err(|source| {
                    anyhow::Error::new(PreprocessError::Input {
                        modality: name.to_string(),
                        path: path.clone(),
                        source,
                    })
                })
            })
            .await?;
        info!("📥 Loaded {} input volumes", loaded.len());

        let mut states = BTreeMap::new();
        for (modality, is_center) in modalities {
            let image = loaded.remove(modality.name()).ok_or_else(|| {
                PreprocessError::config(format!("input of '{}' was not loaded", modality.name()))
            })?;
            states.insert(
                modality.name().to_string(),
                ModalityState {
                    modality,
                    is_center,
                    current: Arc::new(image),
                    brain: None,
                    defaced: None,
                },
            );
        }
        Ok(states)
    }
}
