//! Stage command builder: turns a stage plus the run config into the exact
//! command line of the external catalog CLI.
//!
//! ```text
//! <prog> --outdir <path> make-ids --m-low <f> --m-high <f> --n-haloes <n>
//! <prog> --outdir <path> <stage>
//! ```

use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::stage::Stage;
use std::fmt;
use std::process::Command;

pub const OUTDIR_FLAG: &str = "--outdir";

/// A fully parameterized command line for one stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: Vec<String>,
    pub args: Vec<String>,
}

impl Invocation {
    pub fn new(program: Vec<String>, args: Vec<String>) -> Self {
        Self { program, args }
    }

    pub fn argv(&self) -> Vec<&str> {
        self.program
            .iter()
            .chain(self.args.iter())
            .map(String::as_str)
            .collect()
    }

    /// A `Command` ready to spawn; inherits cwd, environment and stdio.
    pub fn to_command(&self) -> Result<Command> {
        let (exe, rest) = self
            .program
            .split_first()
            .ok_or_else(|| PipelineError::invalid("invocation has no program"))?;
        let mut cmd = Command::new(exe);
        cmd.args(rest).args(&self.args);
        Ok(cmd)
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let words: Vec<String> = self.argv().into_iter().map(shell_quote).collect();
        f.write_str(&words.join(" "))
    }
}

pub fn build(stage: Stage, config: &PipelineConfig) -> Result<Invocation> {
    if config.programs.catalog.is_empty() {
        return Err(PipelineError::invalid("no catalog program configured"));
    }

    let mut args = vec![
        OUTDIR_FLAG.to_string(),
        config.output_directory_str()?.to_string(),
        stage.as_str().to_string(),
    ];

    if stage.uses_mass_range() {
        config.validate_mass_range()?;
        args.extend([
            "--m-low".to_string(),
            config.mass_low.to_string(),
            "--m-high".to_string(),
            config.mass_high.to_string(),
            "--n-haloes".to_string(),
            config.halo_count.to_string(),
        ]);
    }

    Ok(Invocation::new(config.programs.catalog.clone(), args))
}

/// Resolves a stage identifier, then builds it.
pub fn build_named(name: &str, config: &PipelineConfig) -> Result<Invocation> {
    build(name.parse()?, config)
}

/// Quotes a word for a POSIX shell. Plain words pass through untouched.
pub fn shell_quote(word: &str) -> String {
    let plain = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c));
    if plain {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}
