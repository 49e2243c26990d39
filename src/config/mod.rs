use crate::error::PipelineError;
use crate::stage::Stage;
use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

pub const DEFAULT_MEMORY_PER_CPU: &str = "3GB";

/// Shared parameters for one pipeline run. Built once, then only borrowed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub name: String,
    pub output_directory: PathBuf,
    pub mass_low: f64,
    pub mass_high: f64,
    pub halo_count: i64,
    pub job_name: String,
    pub memory_per_cpu: String,
    #[serde(default)]
    pub programs: ProgramsConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramsConfig {
    /// argv prefix of the catalog CLI.
    #[serde(default = "default_catalog_program")]
    pub catalog: Vec<String>,
    #[serde(default)]
    pub submitter: SubmitterConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubmitterConfig {
    #[serde(default)]
    pub kind: SubmitterKind,
    /// argv prefix of the submission client; defaults depend on `kind`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubmitterKind {
    /// `remote.py --cmd ... --jobname ... --mem-per-cpu ...`
    #[default]
    Helper,
    /// `sbatch --wrap ...`
    Sbatch,
}

/// On-disk form: the derived fields may be left out.
#[derive(Debug, Deserialize)]
struct ConfigFile {
    name: String,
    output_directory: Option<PathBuf>,
    mass_low: f64,
    mass_high: f64,
    halo_count: i64,
    job_name: Option<String>,
    memory_per_cpu: Option<String>,
    #[serde(default)]
    programs: ProgramsConfig,
}

fn default_catalog_program() -> Vec<String> {
    vec!["python".to_string(), "catalog_pipeline.py".to_string()]
}

impl Default for ProgramsConfig {
    fn default() -> Self {
        Self {
            catalog: default_catalog_program(),
            submitter: SubmitterConfig::default(),
        }
    }
}

fn memory_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)^[0-9]+([KMGT]B?)?$").expect("memory pattern is a valid regex")
    })
}

impl PipelineConfig {
    /// Config for one mass bin from literal constants, deriving the output
    /// directory and job name from `name`.
    pub fn preset(name: &str, mass_low: f64, mass_high: f64, halo_count: i64) -> Self {
        Self {
            name: name.to_string(),
            output_directory: PathBuf::from(format!("output_{name}")),
            mass_low,
            mass_high,
            halo_count,
            job_name: format!("job_{name}"),
            memory_per_cpu: DEFAULT_MEMORY_PER_CPU.to_string(),
            programs: ProgramsConfig::default(),
        }
    }

    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;
        Self::from_yaml_str(&content)
            .with_context(|| format!("Invalid config file: {:?}", path.as_ref()))
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let file: ConfigFile =
            serde_yaml::from_str(content).context("Failed to parse YAML configuration")?;

        let mut config = Self::preset(&file.name, file.mass_low, file.mass_high, file.halo_count);
        if let Some(dir) = file.output_directory {
            config.output_directory = dir;
        }
        if let Some(job_name) = file.job_name {
            config.job_name = job_name;
        }
        if let Some(mem) = file.memory_per_cpu {
            config.memory_per_cpu = mem;
        }
        config.programs = file.programs;

        config.validate()?;
        Ok(config)
    }

    pub fn to_yaml_string(&self) -> Result<String> {
        serde_yaml::to_string(self).context("Failed to serialize configuration")
    }

    /// Checks the whole config, mass range included.
    pub fn validate(&self) -> std::result::Result<(), PipelineError> {
        self.validate_shared()?;
        self.validate_mass_range()
    }

    /// Checks only what the planned stages consume: the mass range is
    /// skipped when the plan does not include ID selection.
    pub fn validate_for(&self, stages: &[Stage]) -> std::result::Result<(), PipelineError> {
        self.validate_shared()?;
        if stages.iter().any(Stage::uses_mass_range) {
            self.validate_mass_range()?;
        }
        Ok(())
    }

    /// The output directory as passed to `--outdir`. Non-UTF-8 paths are
    /// refused rather than lossily converted, since the child would then
    /// write somewhere other than where the driver looks.
    pub fn output_directory_str(&self) -> std::result::Result<&str, PipelineError> {
        self.output_directory.to_str().ok_or_else(|| {
            PipelineError::invalid(format!(
                "output_directory {:?} is not valid UTF-8",
                self.output_directory
            ))
        })
    }

    fn validate_shared(&self) -> std::result::Result<(), PipelineError> {
        if self.name.trim().is_empty() {
            return Err(PipelineError::invalid("name must not be empty"));
        }
        if self.output_directory_str()?.is_empty() {
            return Err(PipelineError::invalid("output_directory must not be empty"));
        }
        if self.job_name.trim().is_empty() {
            return Err(PipelineError::invalid("job_name must not be empty"));
        }
        if !memory_pattern().is_match(&self.memory_per_cpu) {
            return Err(PipelineError::invalid(format!(
                "memory_per_cpu {:?} is not a memory size like 3GB or 500M",
                self.memory_per_cpu
            )));
        }
        if self.programs.catalog.is_empty() {
            return Err(PipelineError::invalid("programs.catalog must not be empty"));
        }
        if matches!(&self.programs.submitter.command, Some(cmd) if cmd.is_empty()) {
            return Err(PipelineError::invalid(
                "programs.submitter.command must not be empty",
            ));
        }
        Ok(())
    }

    /// Checks the fields only ID selection consumes.
    pub fn validate_mass_range(&self) -> std::result::Result<(), PipelineError> {
        if !self.mass_low.is_finite() || !self.mass_high.is_finite() {
            return Err(PipelineError::invalid(format!(
                "mass bounds must be finite (got {} and {})",
                self.mass_low, self.mass_high
            )));
        }
        if self.mass_low >= self.mass_high {
            return Err(PipelineError::invalid(format!(
                "mass_low ({}) must be below mass_high ({})",
                self.mass_low, self.mass_high
            )));
        }
        if self.halo_count <= 0 {
            return Err(PipelineError::invalid(format!(
                "halo_count must be positive (got {})",
                self.halo_count
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_directory_and_job_name() {
        let config = PipelineConfig::from_yaml_str(
            "name: m11\nmass_low: 11.15\nmass_high: 11.22\nhalo_count: 30000\n",
        )
        .unwrap();
        assert_eq!(config.output_directory, PathBuf::from("output_m11"));
        assert_eq!(config.job_name, "job_m11");
        assert_eq!(config.memory_per_cpu, "3GB");
        assert_eq!(config.programs.catalog, vec!["python", "catalog_pipeline.py"]);
        assert_eq!(config.programs.submitter.kind, SubmitterKind::Helper);
        assert_eq!(config, PipelineConfig::preset("m11", 11.15, 11.22, 30000));
    }

    #[test]
    fn explicit_fields_override_derivations() {
        let yaml = r#"
name: m12
output_directory: /scratch/m12
mass_low: 12.0
mass_high: 12.1
halo_count: 500
job_name: progenitors_m12
memory_per_cpu: 8G
programs:
  catalog: [python3, -m, relaxed.catalog_pipeline]
  submitter:
    kind: sbatch
"#;
        let config = PipelineConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.output_directory, PathBuf::from("/scratch/m12"));
        assert_eq!(config.job_name, "progenitors_m12");
        assert_eq!(config.memory_per_cpu, "8G");
        assert_eq!(config.programs.catalog.len(), 3);
        assert_eq!(config.programs.submitter.kind, SubmitterKind::Sbatch);
    }

    #[test]
    fn rejects_inverted_mass_range() {
        let err = PipelineConfig::from_yaml_str(
            "name: bad\nmass_low: 12.0\nmass_high: 11.0\nhalo_count: 10\n",
        )
        .unwrap_err();
        let inner = err.downcast_ref::<PipelineError>().unwrap();
        assert!(matches!(inner, PipelineError::InvalidParameter(_)));
    }

    #[test]
    fn rejects_non_positive_halo_count() {
        let config = PipelineConfig::preset("m11", 11.0, 11.5, 0);
        assert!(config.validate().is_err());
        let config = PipelineConfig::preset("m11", 11.0, 11.5, -3);
        assert!(config.validate().is_err());
    }

    #[test]
    fn memory_spec_format() {
        let mut config = PipelineConfig::preset("m11", 11.0, 11.5, 10);
        for ok in ["3GB", "500M", "4096", "2g", "1TB"] {
            config.memory_per_cpu = ok.to_string();
            assert!(config.validate().is_ok(), "{ok} should be accepted");
        }
        for bad in ["", "three", "3 GB", "GB"] {
            config.memory_per_cpu = bad.to_string();
            assert!(config.validate().is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn mass_range_only_checked_when_ids_are_planned() {
        let config = PipelineConfig::preset("m11", 11.5, 11.2, 0);
        assert!(config.validate().is_err());
        assert!(config
            .validate_for(&[Stage::MakeProgenitors, Stage::CombineAll])
            .is_ok());
        assert!(matches!(
            config.validate_for(&Stage::ALL),
            Err(PipelineError::InvalidParameter(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn rejects_non_utf8_output_directory() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let mut config = PipelineConfig::preset("m11", 11.15, 11.22, 30000);
        config.output_directory = PathBuf::from(OsStr::from_bytes(&[b'o', b'u', b't', 0xff]));
        assert!(matches!(
            config.validate(),
            Err(PipelineError::InvalidParameter(_))
        ));
        assert!(config.output_directory_str().is_err());
    }

    #[test]
    fn yaml_round_trip_of_resolved_config() {
        let config = PipelineConfig::preset("m13", 13.0, 13.1, 2000);
        let yaml = config.to_yaml_string().unwrap();
        assert_eq!(PipelineConfig::from_yaml_str(&yaml).unwrap(), config);
    }
}
