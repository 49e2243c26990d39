use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One named unit of catalog-pipeline work. Variants are declared in
/// canonical execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    MakeIds,
    MakeDmcat,
    MakeSubhaloes,
    MakeProgenitors,
    CombineAll,
}

/// Where a stage runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Dispatch {
    /// Run inline, blocking until the child exits.
    Local,
    /// Chained with the other remote stages into one batch job.
    RemoteChained,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::MakeIds,
        Stage::MakeDmcat,
        Stage::MakeSubhaloes,
        Stage::MakeProgenitors,
        Stage::CombineAll,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::MakeIds => "make-ids",
            Stage::MakeDmcat => "make-dmcat",
            Stage::MakeSubhaloes => "make-subhaloes",
            Stage::MakeProgenitors => "make-progenitors",
            Stage::CombineAll => "combine-all",
        }
    }

    /// The stage whose output this one reads.
    pub fn predecessor(&self) -> Option<Stage> {
        match self {
            Stage::MakeIds => None,
            Stage::MakeDmcat => Some(Stage::MakeIds),
            Stage::MakeSubhaloes => Some(Stage::MakeDmcat),
            Stage::MakeProgenitors => Some(Stage::MakeSubhaloes),
            Stage::CombineAll => Some(Stage::MakeProgenitors),
        }
    }

    pub fn dispatch(&self) -> Dispatch {
        match self {
            Stage::MakeIds | Stage::MakeDmcat | Stage::MakeSubhaloes => Dispatch::Local,
            Stage::MakeProgenitors | Stage::CombineAll => Dispatch::RemoteChained,
        }
    }

    /// Only ID selection takes the mass range and halo count.
    pub fn uses_mass_range(&self) -> bool {
        matches!(self, Stage::MakeIds)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        Stage::ALL
            .iter()
            .copied()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| PipelineError::UnknownStage(s.to_string()))
    }
}

/// An ordered run of stages, each one the declared successor of the one
/// before it. A plan may start mid-pipeline to resume from existing output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagePlan {
    stages: Vec<Stage>,
}

impl StagePlan {
    pub fn new(stages: Vec<Stage>) -> Result<Self> {
        if stages.is_empty() {
            return Err(PipelineError::invalid("stage list is empty"));
        }
        for pair in stages.windows(2) {
            let (prev, next) = (pair[0], pair[1]);
            if next.predecessor() != Some(prev) {
                return Err(PipelineError::invalid(format!(
                    "stage {} cannot follow {} (expected after {})",
                    next,
                    prev,
                    next.predecessor()
                        .map(|p| p.as_str())
                        .unwrap_or("nothing")
                )));
            }
        }
        Ok(Self { stages })
    }

    pub fn parse<S: AsRef<str>>(names: &[S]) -> Result<Self> {
        let stages = names
            .iter()
            .map(|name| name.as_ref().trim().parse())
            .collect::<Result<Vec<Stage>>>()?;
        Self::new(stages)
    }

    pub fn full() -> Self {
        Self {
            stages: Stage::ALL.to_vec(),
        }
    }

    pub fn starting_at(first: Stage) -> Self {
        Self {
            stages: Stage::ALL.iter().copied().filter(|s| *s >= first).collect(),
        }
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}
