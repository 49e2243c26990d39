use crate::error::Result;
use crate::remote::SubmissionId;
use crate::runtime::RunState;
use crate::stage::{Dispatch, Stage};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

pub const MANIFEST_FILE: &str = "pipeline_manifest.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub pipeline_name: String,
    pub output_directory: PathBuf,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub state: RunState,
    pub stages: Vec<StageManifest>,
    pub submission: Option<SubmissionManifest>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageManifest {
    pub stage: Stage,
    pub dispatch: Dispatch,
    pub command: String,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    pub output_files: Vec<String>, // relative to the output directory, after the stage
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionManifest {
    pub stages: Vec<Stage>,
    pub job_name: String,
    pub memory_per_cpu: String,
    pub command: String,
    pub submitted_at: DateTime<Utc>,
    pub job_id: Option<String>,
    pub acknowledgment: String,
}

impl Manifest {
    pub fn new(pipeline_name: String, output_directory: PathBuf) -> Self {
        Self {
            pipeline_name,
            output_directory,
            started_at: Utc::now(),
            finished_at: None,
            state: RunState::NotStarted,
            stages: Vec::new(),
            submission: None,
        }
    }

    pub fn add_stage(&mut self, stage: StageManifest) {
        self.stages.push(stage);
    }

    pub fn set_submission(&mut self, submission: SubmissionManifest) {
        self.submission = Some(submission);
    }

    pub fn finish(&mut self, state: RunState) {
        self.state = state;
        self.finished_at = Some(Utc::now());
    }

    pub fn path(&self) -> PathBuf {
        self.output_directory.join(MANIFEST_FILE)
    }

    pub fn write_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self).map_err(std::io::Error::from)?;
        std::fs::write(path.as_ref(), json)?;
        Ok(())
    }

    pub fn read_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let manifest = serde_json::from_str(&content).map_err(std::io::Error::from)?;
        Ok(manifest)
    }
}

impl SubmissionManifest {
    pub fn new(
        stages: Vec<Stage>,
        job_name: String,
        memory_per_cpu: String,
        command: String,
        id: SubmissionId,
    ) -> Self {
        Self {
            stages,
            job_name,
            memory_per_cpu,
            command,
            submitted_at: Utc::now(),
            job_id: id.job_id,
            acknowledgment: id.acknowledgment,
        }
    }
}

/// Files currently under `dir`, relative and sorted. The manifest itself is
/// left out.
pub fn list_output_files(dir: &Path) -> Vec<String> {
    let mut files: Vec<String> = WalkDir::new(dir)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| {
            entry
                .path()
                .strip_prefix(dir)
                .ok()
                .map(|p| p.to_string_lossy().into_owned())
        })
        .filter(|rel| rel != MANIFEST_FILE)
        .collect();
    files.sort();
    files
}
