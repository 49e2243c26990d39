use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

use halo_pipeline::command::shell_quote;
use halo_pipeline::config::PipelineConfig;
use halo_pipeline::executor::LocalExecutor;
use halo_pipeline::runtime::{self, PlannedStep, RunOptions};
use halo_pipeline::{remote, PipelineError, Stage, StagePlan};

#[derive(Parser)]
#[command(name = "hpl")]
#[command(about = "Halo catalog pipeline driver", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline described by a YAML configuration
    Run {
        /// Path to pipeline YAML file
        #[arg(short, long)]
        config: PathBuf,
        #[command(flatten)]
        selection: StageSelection,
        /// Log the commands without running or submitting anything
        #[arg(long)]
        dry_run: bool,
        /// Hide the stage progress bar
        #[arg(long)]
        no_progress: bool,
    },
    /// Print the commands a run would issue
    Plan {
        /// Path to pipeline YAML file
        #[arg(short, long)]
        config: PathBuf,
        #[command(flatten)]
        selection: StageSelection,
    },
    /// Validate a pipeline configuration
    Validate {
        /// Path to pipeline YAML file
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Write a configuration for one mass bin
    Init {
        /// Run name; output directory and job name derive from it
        #[arg(long)]
        name: String,
        #[arg(long, allow_negative_numbers = true)]
        m_low: f64,
        #[arg(long, allow_negative_numbers = true)]
        m_high: f64,
        #[arg(long, allow_negative_numbers = true)]
        n_haloes: i64,
        #[arg(long, default_value = halo_pipeline::config::DEFAULT_MEMORY_PER_CPU)]
        mem_per_cpu: String,
        /// Write here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Show version information
    Version,
}

#[derive(Args)]
struct StageSelection {
    /// Resume from this stage, running it and everything after it
    #[arg(long, conflicts_with = "stages")]
    from: Option<String>,
    /// Explicit comma-separated stage list, in pipeline order
    #[arg(long, value_delimiter = ',')]
    stages: Vec<String>,
}

impl StageSelection {
    fn plan(&self) -> Result<StagePlan> {
        if let Some(first) = &self.from {
            let first: Stage = first.parse()?;
            return Ok(StagePlan::starting_at(first));
        }
        if self.stages.is_empty() {
            return Ok(StagePlan::full());
        }
        Ok(StagePlan::parse(&self.stages)?)
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match execute(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let code = err
                .downcast_ref::<PipelineError>()
                .map(PipelineError::exit_code)
                .unwrap_or(1);
            eprintln!("Error: {err:#}");
            ExitCode::from(code.clamp(1, 255) as u8)
        }
    }
}

fn execute(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Run {
            config,
            selection,
            dry_run,
            no_progress,
        } => {
            let pipeline = PipelineConfig::from_yaml_file(&config)?;
            let plan = selection.plan()?;
            let submitter = remote::from_config(&pipeline.programs.submitter);
            let options = RunOptions {
                dry_run,
                show_progress: !no_progress,
                ..RunOptions::default()
            };
            let report = runtime::run_pipeline(
                &pipeline,
                &plan,
                &LocalExecutor::new(),
                submitter.as_ref(),
                &options,
            )?;
            if let Some(id) = &report.submission {
                println!(
                    "✓ Submitted {}: {}",
                    pipeline.job_name,
                    id.job_id.as_deref().unwrap_or(&id.acknowledgment)
                );
            }
            if let Some(path) = &report.manifest_path {
                println!("✓ Manifest written to: {}", path.display());
            }
        }
        Commands::Plan { config, selection } => {
            let pipeline = PipelineConfig::from_yaml_file(&config)?;
            let plan = selection.plan()?;
            for step in runtime::plan_invocations(&pipeline, &plan)? {
                match step {
                    PlannedStep::Local(stage, invocation) => {
                        println!("[local]  {stage}: {invocation}");
                    }
                    PlannedStep::Remote(chain, job) => {
                        let names: Vec<_> = chain.iter().map(Stage::as_str).collect();
                        println!(
                            "[remote] {}: --cmd {} --jobname {} --mem-per-cpu {}",
                            names.join(" + "),
                            shell_quote(&job.command_line()?),
                            shell_quote(&job.job_name),
                            shell_quote(&job.memory_per_cpu)
                        );
                    }
                }
            }
        }
        Commands::Validate { config } => {
            let _pipeline = PipelineConfig::from_yaml_file(&config)?;
            println!("✓ Pipeline configuration is valid");
        }
        Commands::Init {
            name,
            m_low,
            m_high,
            n_haloes,
            mem_per_cpu,
            output,
        } => {
            let mut pipeline = PipelineConfig::preset(&name, m_low, m_high, n_haloes);
            pipeline.memory_per_cpu = mem_per_cpu;
            pipeline.validate()?;
            let yaml = pipeline.to_yaml_string()?;
            match output {
                Some(path) => {
                    std::fs::write(&path, yaml)
                        .with_context(|| format!("Failed to write config file: {:?}", path))?;
                    println!("✓ Wrote {}", path.display());
                }
                None => print!("{yaml}"),
            }
        }
        Commands::Version => {
            println!("hpl version {}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
