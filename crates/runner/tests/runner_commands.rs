//! Black-box runs of the runner against the in-memory backend.

use jobgate_infra::{CoordinatorConfig, ExecutionOutcome, JobBody, SkipReason};
use jobgate_runner::app::{self, EXIT_JOB_FAILED, EXIT_OK};
use jobgate_runner::cli::{Cli, Commands, Target};
use jobgate_runner::command::CommandJob;

use jobgate_core::{JobIdentity, RunId};

fn run_cli(identity: &str, cmd: &[&str]) -> Cli {
    Cli {
        database_url: None,
        webhook_url: None,
        command: Commands::Run {
            target: Target {
                identity: Some(identity.to_string()),
                date_key: false,
            },
            result_ref: None,
            cmd: cmd.iter().map(|s| s.to_string()).collect(),
        },
    }
}

#[tokio::test]
async fn successful_command_exits_zero() {
    let code = app::execute(
        run_cli("job-x", &["sh", "-c", "echo s3://bucket/result.json"]),
        CoordinatorConfig::default(),
    )
    .await
    .unwrap();
    assert_eq!(code, EXIT_OK);
}

#[tokio::test]
async fn failing_command_exits_one() {
    let code = app::execute(
        run_cli("job-x", &["sh", "-c", "echo broken >&2; exit 3"]),
        CoordinatorConfig::default(),
    )
    .await
    .unwrap();
    assert_eq!(code, EXIT_JOB_FAILED);
}

#[tokio::test]
async fn missing_program_is_a_job_failure() {
    let code = app::execute(
        run_cli("job-x", &["/definitely/not/a/program"]),
        CoordinatorConfig::default(),
    )
    .await
    .unwrap();
    assert_eq!(code, EXIT_JOB_FAILED);
}

#[tokio::test]
async fn inspect_of_unknown_identity_reports_missing() {
    let cli = Cli {
        database_url: None,
        webhook_url: None,
        command: Commands::Inspect {
            target: Target {
                identity: Some("never-seeded".to_string()),
                date_key: false,
            },
        },
    };
    let code = app::execute(cli, CoordinatorConfig::default()).await.unwrap();
    assert_eq!(code, EXIT_JOB_FAILED);
}

#[tokio::test]
async fn command_job_reports_stdout_and_stderr() {
    let ok = CommandJob::from_argv(&[
        "sh".to_string(),
        "-c".to_string(),
        "echo working; echo out/2025-06-01.json".to_string(),
    ])
    .unwrap();
    assert_eq!(
        ok.execute().await.unwrap().as_deref(),
        Some("out/2025-06-01.json")
    );

    let failing = CommandJob::from_argv(&[
        "sh".to_string(),
        "-c".to_string(),
        "echo quota exceeded >&2; exit 2".to_string(),
    ])
    .unwrap();
    let err = failing.execute().await.unwrap_err();
    assert!(err.message().contains("quota exceeded"));
}

#[test]
fn exit_codes_follow_outcome() {
    let id = JobIdentity::new("job-x").unwrap();
    let failed = ExecutionOutcome::Failed {
        identity: id.clone(),
        run_id: RunId::new(),
        error: "boom".to_string(),
        persisted: true,
    };
    assert_eq!(app::exit_code(&failed), EXIT_JOB_FAILED);

    let skipped = ExecutionOutcome::Skipped {
        identity: id,
        reason: SkipReason::RaceLost,
    };
    assert_eq!(app::exit_code(&skipped), EXIT_OK);
}
