use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::command::{self, Invocation};
use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::executor::Executor;
use crate::remote::{BatchJobSpec, SubmissionId, Submitter};
use crate::stage::{Dispatch, Stage, StagePlan};

mod manifest;
pub use manifest::{
    list_output_files, Manifest, StageManifest, SubmissionManifest, MANIFEST_FILE,
};

/// Lifecycle of one run. `Done` and `Failed` are terminal; nothing follows
/// `SubmittedRemote` except `Done`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "stage", rename_all = "snake_case")]
pub enum RunState {
    NotStarted,
    Running(Stage),
    SubmittedRemote,
    Done,
    Failed(Stage),
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Done | RunState::Failed(_))
    }

    fn allows(&self, next: &RunState) -> bool {
        use RunState::*;
        match (self, next) {
            (NotStarted, Running(_)) => true,
            (Running(cur), Running(n)) => n.predecessor() == Some(*cur),
            (Running(_), SubmittedRemote) => true,
            (Running(cur), Failed(s)) => cur == s,
            (Running(_), Done) | (SubmittedRemote, Done) => true,
            _ => false,
        }
    }

    pub fn advance(self, next: RunState) -> Result<RunState> {
        if self.allows(&next) {
            Ok(next)
        } else {
            Err(PipelineError::invalid(format!(
                "illegal run state transition {self:?} -> {next:?}"
            )))
        }
    }
}

/// A unit of dispatch: one local stage, or the remote stages chained into
/// a single batch job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Local(Stage),
    Remote(Vec<Stage>),
}

/// Groups a plan into dispatch steps, keeping its order.
pub fn steps(plan: &StagePlan) -> Vec<Step> {
    let mut steps = Vec::new();
    for &stage in plan.stages() {
        match (stage.dispatch(), steps.last_mut()) {
            (Dispatch::Local, _) => steps.push(Step::Local(stage)),
            (Dispatch::RemoteChained, Some(Step::Remote(chain))) => chain.push(stage),
            (Dispatch::RemoteChained, _) => steps.push(Step::Remote(vec![stage])),
        }
    }
    steps
}

/// Every command a plan would issue, built up front. Used for `plan` and
/// dry runs only; a real run builds each step just before dispatching it.
#[derive(Debug, Clone, PartialEq)]
pub enum PlannedStep {
    Local(Stage, Invocation),
    Remote(Vec<Stage>, BatchJobSpec),
}

pub fn plan_invocations(config: &PipelineConfig, plan: &StagePlan) -> Result<Vec<PlannedStep>> {
    steps(plan)
        .into_iter()
        .map(|step| match step {
            Step::Local(stage) => Ok(PlannedStep::Local(stage, command::build(stage, config)?)),
            Step::Remote(chain) => {
                let job = build_batch_job(&chain, config)?;
                Ok(PlannedStep::Remote(chain, job))
            }
        })
        .collect()
}

fn build_batch_job(chain: &[Stage], config: &PipelineConfig) -> Result<BatchJobSpec> {
    let invocations = chain
        .iter()
        .map(|&stage| command::build(stage, config))
        .collect::<Result<Vec<_>>>()?;
    Ok(BatchJobSpec::new(invocations, config))
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub dry_run: bool,
    pub show_progress: bool,
    pub write_manifest: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            show_progress: true,
            write_manifest: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub state: RunState,
    pub completed: Vec<Stage>,
    pub submission: Option<SubmissionId>,
    pub manifest_path: Option<PathBuf>,
}

/// Runs the plan: local stages inline and in order, then the remote stages
/// as one fire-and-forget batch job. Stops at the first failure.
pub fn run_pipeline(
    config: &PipelineConfig,
    plan: &StagePlan,
    executor: &dyn Executor,
    submitter: &dyn Submitter,
    options: &RunOptions,
) -> Result<RunReport> {
    config.validate_for(plan.stages())?;
    info!(
        pipeline = %config.name,
        output = %config.output_directory.display(),
        stages = plan.len(),
        "Running pipeline"
    );

    if options.dry_run {
        return dry_run(config, plan);
    }

    std::fs::create_dir_all(&config.output_directory)?;

    let mut run = Run::new(config, plan, options);
    let outcome = run.drive(plan, executor, submitter);

    let final_state = match &outcome {
        Ok(()) => run.transition(RunState::Done)?,
        Err(err) => {
            error!(error = %err, "pipeline failed");
            match run.state {
                RunState::Running(stage) => run.transition(RunState::Failed(stage))?,
                other => other,
            }
        }
    };
    run.manifest.finish(final_state);
    let manifest_path = run.write_manifest();
    run.progress.finish_and_clear();

    outcome?;
    info!(pipeline = %config.name, "Pipeline finished; remote stages belong to the scheduler now");
    Ok(RunReport {
        state: final_state,
        completed: run.completed,
        submission: run.submission,
        manifest_path,
    })
}

fn dry_run(config: &PipelineConfig, plan: &StagePlan) -> Result<RunReport> {
    for step in plan_invocations(config, plan)? {
        match step {
            PlannedStep::Local(stage, invocation) => {
                info!(%stage, command = %invocation, "[dry-run] would run locally");
            }
            PlannedStep::Remote(chain, job) => {
                let command_line = job.command_line()?;
                info!(
                    stages = ?chain,
                    job_name = %job.job_name,
                    mem_per_cpu = %job.memory_per_cpu,
                    command = %command_line,
                    "[dry-run] would submit batch job"
                );
            }
        }
    }
    Ok(RunReport {
        state: RunState::NotStarted,
        completed: Vec::new(),
        submission: None,
        manifest_path: None,
    })
}

struct Run<'a> {
    config: &'a PipelineConfig,
    options: &'a RunOptions,
    state: RunState,
    manifest: Manifest,
    progress: ProgressBar,
    completed: Vec<Stage>,
    submission: Option<SubmissionId>,
}

impl<'a> Run<'a> {
    fn new(config: &'a PipelineConfig, plan: &StagePlan, options: &'a RunOptions) -> Self {
        let progress = if options.show_progress {
            let pb = ProgressBar::new(plan.len() as u64);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("{spinner:.green} [{elapsed_precise}] [{bar:30.cyan/blue}] {pos}/{len} stages {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_bar()),
            );
            pb
        } else {
            ProgressBar::hidden()
        };

        Self {
            config,
            options,
            state: RunState::NotStarted,
            manifest: Manifest::new(config.name.clone(), config.output_directory.clone()),
            progress,
            completed: Vec::new(),
            submission: None,
        }
    }

    fn transition(&mut self, next: RunState) -> Result<RunState> {
        self.state = self.state.advance(next)?;
        self.manifest.state = self.state;
        Ok(self.state)
    }

    fn drive(
        &mut self,
        plan: &StagePlan,
        executor: &dyn Executor,
        submitter: &dyn Submitter,
    ) -> Result<()> {
        let total = plan.len();
        for step in steps(plan) {
            match step {
                Step::Local(stage) => self.run_local(stage, executor, total)?,
                Step::Remote(chain) => self.submit_remote(&chain, submitter, total)?,
            }
            self.write_manifest();
        }
        Ok(())
    }

    fn run_local(&mut self, stage: Stage, executor: &dyn Executor, total: usize) -> Result<()> {
        self.transition(RunState::Running(stage))?;
        let invocation = command::build(stage, self.config)?;
        info!(
            "[Stage {}/{}] {} (local)",
            self.completed.len() + 1,
            total,
            stage
        );
        debug!(command = %invocation);
        self.progress.set_message(stage.as_str());

        let started = Instant::now();
        let status = self.progress.suspend(|| executor.run(&invocation))?;
        let duration_ms = started.elapsed().as_millis() as u64;

        self.manifest.add_stage(StageManifest {
            stage,
            dispatch: Dispatch::Local,
            command: invocation.to_string(),
            exit_code: Some(status),
            duration_ms,
            output_files: list_output_files(&self.config.output_directory),
        });

        if status != 0 {
            error!(%stage, status, "local stage failed; later stages will not run");
            return Err(PipelineError::LocalStageFailure { stage, status });
        }

        info!(%stage, duration_ms, "  ✓ Stage completed");
        self.completed.push(stage);
        self.progress.inc(1);
        Ok(())
    }

    fn submit_remote(
        &mut self,
        chain: &[Stage],
        submitter: &dyn Submitter,
        total: usize,
    ) -> Result<()> {
        let Some(&first) = chain.first() else {
            return Ok(());
        };
        self.transition(RunState::Running(first))?;
        let job = build_batch_job(chain, self.config)?;
        let command_line = job.command_line()?;
        info!(
            "[Stage {}/{}] {} (batch job {}, {} per cpu)",
            self.completed.len() + 1,
            total,
            chain
                .iter()
                .map(Stage::as_str)
                .collect::<Vec<_>>()
                .join(" && "),
            job.job_name,
            job.memory_per_cpu
        );
        debug!(command = %command_line);
        self.progress.set_message(format!("submitting {}", job.job_name));

        let started = Instant::now();
        let id = submitter.submit(&job)?;
        let duration_ms = started.elapsed().as_millis() as u64;
        self.transition(RunState::SubmittedRemote)?;

        info!(
            job_name = %job.job_name,
            job_id = id.job_id.as_deref().unwrap_or("-"),
            ack = %id.acknowledgment,
            "  ✓ Batch job submitted"
        );
        warn!("submitted job failures are not reported back to this driver");

        for (&stage, invocation) in chain.iter().zip(&job.chained_commands) {
            self.manifest.add_stage(StageManifest {
                stage,
                dispatch: Dispatch::RemoteChained,
                command: invocation.to_string(),
                exit_code: None,
                duration_ms,
                output_files: Vec::new(),
            });
        }
        self.manifest.set_submission(SubmissionManifest::new(
            chain.to_vec(),
            job.job_name.clone(),
            job.memory_per_cpu.clone(),
            command_line,
            id.clone(),
        ));
        self.submission = Some(id);
        self.progress.inc(chain.len() as u64);
        Ok(())
    }

    /// Best effort: a manifest that cannot be written is logged, never fatal.
    fn write_manifest(&self) -> Option<PathBuf> {
        if !self.options.write_manifest {
            return None;
        }
        let path = self.manifest.path();
        match self.manifest.write_to_file(&path) {
            Ok(()) => {
                debug!(path = %path.display(), "manifest written");
                Some(path)
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "could not write manifest");
                None
            }
        }
    }
}
