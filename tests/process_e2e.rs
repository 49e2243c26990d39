#![cfg(unix)]

use halo_pipeline::config::{SubmitterConfig, SubmitterKind};
use halo_pipeline::{
    remote, run_pipeline, LocalExecutor, PipelineConfig, PipelineError, RunOptions, RunState,
    Stage, StagePlan,
};
use std::fs;
use std::path::Path;

/// Stand-in catalog CLI: `--outdir <dir> <stage> ...` marks `<dir>/<stage>.done`,
/// failing with status 2 on the stage named in `fail_on` next to the script.
const CATALOG_SCRIPT: &str = r#"
dir="$2"
stage="$3"
here="$(dirname "$0")"
if [ -f "$here/fail_on" ] && [ "$(cat "$here/fail_on")" = "$stage" ]; then
  exit 2
fi
mkdir -p "$dir"
echo "$@" > "$dir/$stage.done"
"#;

/// Stand-in for remote.py: records its argv one per line and acknowledges.
const HELPER_SCRIPT: &str = r#"
here="$(dirname "$0")"
for arg in "$@"; do echo "$arg"; done > "$here/submitted"
echo "Submitted batch job 55"
"#;

fn setup(dir: &Path) -> PipelineConfig {
    fs::write(dir.join("catalog.sh"), CATALOG_SCRIPT).unwrap();
    fs::write(dir.join("remote.sh"), HELPER_SCRIPT).unwrap();

    let mut config = PipelineConfig::preset("m11", 11.15, 11.22, 30000);
    config.output_directory = dir.join("output_m11");
    config.programs.catalog = vec![
        "/bin/sh".to_string(),
        dir.join("catalog.sh").to_string_lossy().into_owned(),
    ];
    config.programs.submitter = SubmitterConfig {
        kind: SubmitterKind::Helper,
        command: Some(vec![
            "/bin/sh".to_string(),
            dir.join("remote.sh").to_string_lossy().into_owned(),
        ]),
    };
    config
}

fn quiet() -> RunOptions {
    RunOptions {
        show_progress: false,
        ..RunOptions::default()
    }
}

#[test]
fn real_processes_run_in_order_and_submit_chain() {
    let tmp = tempfile::tempdir().unwrap();
    let config = setup(tmp.path());
    let submitter = remote::from_config(&config.programs.submitter);

    let report = run_pipeline(
        &config,
        &StagePlan::full(),
        &LocalExecutor::new(),
        submitter.as_ref(),
        &quiet(),
    )
    .unwrap();

    assert_eq!(report.state, RunState::Done);
    let out = &config.output_directory;
    let ids = fs::read_to_string(out.join("make-ids.done")).unwrap();
    assert!(ids.contains("--m-low 11.15 --m-high 11.22 --n-haloes 30000"));
    assert!(out.join("make-dmcat.done").exists());
    assert!(out.join("make-subhaloes.done").exists());
    // the remote stages are the scheduler's business
    assert!(!out.join("make-progenitors.done").exists());

    let submitted = fs::read_to_string(tmp.path().join("submitted")).unwrap();
    let argv: Vec<&str> = submitted.lines().collect();
    assert_eq!(argv[0], "--cmd");
    assert!(argv[1].contains(" make-progenitors && /bin/sh "));
    assert!(argv[1].ends_with(" combine-all"));
    assert_eq!(&argv[2..], &["--jobname", "job_m11", "--mem-per-cpu", "3GB"]);

    let id = report.submission.unwrap();
    assert_eq!(id.job_id.as_deref(), Some("55"));

    let manifest = report.manifest_path.unwrap();
    assert!(manifest.exists());
}

#[test]
fn failing_process_stops_pipeline_with_its_status() {
    let tmp = tempfile::tempdir().unwrap();
    let config = setup(tmp.path());
    fs::write(tmp.path().join("fail_on"), "make-dmcat").unwrap();
    let submitter = remote::from_config(&config.programs.submitter);

    let err = run_pipeline(
        &config,
        &StagePlan::full(),
        &LocalExecutor::new(),
        submitter.as_ref(),
        &quiet(),
    )
    .unwrap_err();

    assert!(matches!(
        err,
        PipelineError::LocalStageFailure {
            stage: Stage::MakeDmcat,
            status: 2
        }
    ));
    assert_eq!(err.exit_code(), 2);
    assert!(config.output_directory.join("make-ids.done").exists());
    assert!(!config.output_directory.join("make-subhaloes.done").exists());
    assert!(!tmp.path().join("submitted").exists());
}
