use crate::command::Invocation;
use crate::config::{PipelineConfig, SubmitterConfig, SubmitterKind};
use crate::error::{PipelineError, Result};
use crate::executor::exit_code;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::process::{Command, Output};
use std::sync::OnceLock;
use tracing::debug;

/// Invocations submitted as one batch job, each running only if the one
/// before it succeeded.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchJobSpec {
    pub chained_commands: Vec<Invocation>,
    pub job_name: String,
    pub memory_per_cpu: String,
}

impl BatchJobSpec {
    pub fn new(chained_commands: Vec<Invocation>, config: &PipelineConfig) -> Self {
        Self {
            chained_commands,
            job_name: config.job_name.clone(),
            memory_per_cpu: config.memory_per_cpu.clone(),
        }
    }

    /// Single shell command joining every invocation with `&&`.
    pub fn command_line(&self) -> Result<String> {
        if self.chained_commands.is_empty() {
            return Err(PipelineError::invalid("batch job has no commands"));
        }
        Ok(self
            .chained_commands
            .iter()
            .map(Invocation::to_string)
            .collect::<Vec<_>>()
            .join(" && "))
    }
}

/// Acknowledgment from the batch client. The scheduler owns the job from here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionId {
    pub job_id: Option<String>,
    pub acknowledgment: String,
}

/// Hands a batch job to the scheduler and returns once it is accepted.
pub trait Submitter {
    fn submit(&self, job: &BatchJobSpec) -> Result<SubmissionId>;
}

/// Submits through the `remote.py` helper:
/// `<helper> --cmd <chain> --jobname <job> --mem-per-cpu <mem>`.
#[derive(Debug, Clone)]
pub struct HelperSubmitter {
    program: Vec<String>,
}

impl HelperSubmitter {
    pub fn new(program: Vec<String>) -> Self {
        Self { program }
    }
}

impl Default for HelperSubmitter {
    fn default() -> Self {
        Self::new(vec!["python".to_string(), "remote.py".to_string()])
    }
}

impl Submitter for HelperSubmitter {
    fn submit(&self, job: &BatchJobSpec) -> Result<SubmissionId> {
        let args = vec![
            "--cmd".to_string(),
            job.command_line()?,
            "--jobname".to_string(),
            job.job_name.clone(),
            "--mem-per-cpu".to_string(),
            job.memory_per_cpu.clone(),
        ];
        let output = run_client(Invocation::new(self.program.clone(), args))?;
        let acknowledgment = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok(SubmissionId {
            job_id: parse_job_id(&acknowledgment),
            acknowledgment,
        })
    }
}

/// Submits straight to Slurm with `sbatch --wrap`.
#[derive(Debug, Clone)]
pub struct SbatchSubmitter {
    program: Vec<String>,
}

impl SbatchSubmitter {
    pub fn new(program: Vec<String>) -> Self {
        Self { program }
    }
}

impl Default for SbatchSubmitter {
    fn default() -> Self {
        Self::new(vec!["sbatch".to_string()])
    }
}

impl Submitter for SbatchSubmitter {
    fn submit(&self, job: &BatchJobSpec) -> Result<SubmissionId> {
        let args = vec![
            format!("--job-name={}", job.job_name),
            format!("--mem-per-cpu={}", job.memory_per_cpu),
            format!("--wrap={}", job.command_line()?),
        ];
        let output = run_client(Invocation::new(self.program.clone(), args))?;
        let acknowledgment = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let job_id = parse_job_id(&acknowledgment).ok_or_else(|| {
            PipelineError::SubmissionFailure(format!(
                "sbatch did not report a job id: {acknowledgment:?}"
            ))
        })?;
        Ok(SubmissionId {
            job_id: Some(job_id),
            acknowledgment,
        })
    }
}

/// Picks the submitter the config asks for.
pub fn from_config(config: &SubmitterConfig) -> Box<dyn Submitter> {
    match (config.kind, config.command.clone()) {
        (SubmitterKind::Helper, Some(cmd)) => Box::new(HelperSubmitter::new(cmd)),
        (SubmitterKind::Helper, None) => Box::new(HelperSubmitter::default()),
        (SubmitterKind::Sbatch, Some(cmd)) => Box::new(SbatchSubmitter::new(cmd)),
        (SubmitterKind::Sbatch, None) => Box::new(SbatchSubmitter::default()),
    }
}

fn run_client(invocation: Invocation) -> Result<Output> {
    debug!(command = %invocation, "submitting batch job");
    let mut cmd: Command = invocation.to_command()?;
    let output = cmd.output().map_err(|e| {
        PipelineError::SubmissionFailure(format!("could not start `{invocation}`: {e}"))
    })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(PipelineError::SubmissionFailure(format!(
            "`{}` exited with status {}: {}",
            invocation.program.join(" "),
            exit_code(output.status),
            if stderr.is_empty() {
                "<no output>"
            } else {
                stderr.as_str()
            }
        )));
    }
    Ok(output)
}

/// Slurm acknowledges with `Submitted batch job <id>`.
pub fn parse_job_id(acknowledgment: &str) -> Option<String> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = PATTERN.get_or_init(|| {
        Regex::new(r"Submitted batch job (\d+)").expect("job id pattern is a valid regex")
    });
    pattern
        .captures(acknowledgment)
        .map(|caps| caps[1].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::build;
    use crate::stage::Stage;

    fn m11_job() -> BatchJobSpec {
        let config = PipelineConfig::preset("m11", 11.15, 11.22, 30000);
        let chain = vec![
            build(Stage::MakeProgenitors, &config).unwrap(),
            build(Stage::CombineAll, &config).unwrap(),
        ];
        BatchJobSpec::new(chain, &config)
    }

    #[test]
    fn chain_is_success_conditional() {
        assert_eq!(
            m11_job().command_line().unwrap(),
            "python catalog_pipeline.py --outdir output_m11 make-progenitors \
             && python catalog_pipeline.py --outdir output_m11 combine-all"
        );
    }

    #[test]
    fn empty_chain_is_rejected() {
        let mut job = m11_job();
        job.chained_commands.clear();
        assert!(matches!(
            job.command_line(),
            Err(PipelineError::InvalidParameter(_))
        ));
    }

    #[test]
    fn parses_slurm_acknowledgment() {
        assert_eq!(
            parse_job_id("Submitted batch job 4242\n").as_deref(),
            Some("4242")
        );
        assert_eq!(parse_job_id("queued"), None);
    }

    #[cfg(unix)]
    #[test]
    fn helper_failure_carries_stderr() {
        let helper = HelperSubmitter::new(vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            "echo queue unreachable >&2; exit 3".to_string(),
            "remote.py".to_string(),
        ]);
        let err = helper.submit(&m11_job()).unwrap_err();
        match err {
            PipelineError::SubmissionFailure(detail) => {
                assert!(detail.contains("queue unreachable"), "{detail}");
                assert!(detail.contains("status 3"), "{detail}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn sbatch_without_job_id_fails() {
        let sbatch = SbatchSubmitter::new(vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            "echo accepted".to_string(),
            "sbatch".to_string(),
        ]);
        assert!(matches!(
            sbatch.submit(&m11_job()),
            Err(PipelineError::SubmissionFailure(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn sbatch_reports_job_id() {
        let sbatch = SbatchSubmitter::new(vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            "echo Submitted batch job 77".to_string(),
            "sbatch".to_string(),
        ]);
        let id = sbatch.submit(&m11_job()).unwrap();
        assert_eq!(id.job_id.as_deref(), Some("77"));
    }
}
