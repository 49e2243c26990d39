pub mod command;
pub mod config;
pub mod error;
pub mod executor;
pub mod remote;
pub mod runtime;
pub mod stage;

pub use command::{build, build_named, Invocation};
pub use config::PipelineConfig;
pub use error::{PipelineError, Result};
pub use executor::{Executor, LocalExecutor};
pub use remote::{BatchJobSpec, HelperSubmitter, SbatchSubmitter, SubmissionId, Submitter};
pub use runtime::{run_pipeline, RunOptions, RunReport, RunState};
pub use stage::{Dispatch, Stage, StagePlan};
