//! End-to-end engine tests. Jobs run unconfined (no cgroup, no namespace
//! isolation) so the suite does not require root.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use jobworker::error::JobWorkerError;
use jobworker::manager::{JobManager, JobOptions, JobStatus};

fn args(values: &[&str]) -> Vec<String> {
    values.iter().map(|s| s.to_string()).collect()
}

async fn collect_stream(manager: &JobManager, job_id: &str) -> String {
    let mut rx = manager.stream_job(job_id).await.expect("stream_job failed");

    let mut output = Vec::new();
    while let Some(block) = rx.recv().await {
        output.extend_from_slice(&block);
    }
    String::from_utf8(output).expect("job output was not utf-8")
}

async fn wait_for_status(manager: &JobManager, job_id: &str, expected: JobStatus) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while tokio::time::Instant::now() < deadline {
        let matches = manager
            .query_job(job_id)
            .await
            .is_ok_and(|info| info.status() == expected);
        if matches {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

#[tokio::test]
async fn short_job_streams_its_output_and_stops() {
    let manager = JobManager::new().unwrap();
    let shutdown = CancellationToken::new();

    let info = manager
        .start_job(
            &shutdown,
            "ls",
            &args(&["-l", "/dev/null"]),
            JobOptions::unconfined(),
        )
        .await
        .unwrap();

    let output = collect_stream(&manager, info.job_id()).await;
    assert!(output.contains("/dev/null"), "output was: {output:?}");

    // The stream only closes after the terminal transition, so the status
    // must already read Stopped.
    let info = manager.query_job(info.job_id()).await.unwrap();
    assert_eq!(info.status(), JobStatus::Stopped);
    assert_eq!(info.exit_code(), 0);
    assert!(info.pid() > 0);
}

#[tokio::test]
async fn long_job_feeds_multiple_concurrent_subscribers() {
    let manager = Arc::new(JobManager::new().unwrap());
    let shutdown = CancellationToken::new();

    let info = manager
        .start_job(
            &shutdown,
            "bash",
            &args(&["-c", "for x in {1..9}; do echo $x; sleep 1; done"]),
            JobOptions::unconfined(),
        )
        .await
        .unwrap();
    let job_id = info.job_id().to_string();

    assert_eq!(manager.query_job(&job_id).await.unwrap().status(), JobStatus::Running);

    let mut handles = Vec::new();
    for _ in 0..3 {
        let manager = manager.clone();
        let job_id = job_id.clone();
        handles.push(tokio::spawn(async move {
            collect_stream(&manager, &job_id).await
        }));
    }

    tokio::time::sleep(Duration::from_secs(5)).await;
    manager.stop_job(&job_id).await.unwrap();

    for handle in handles {
        let output = tokio::time::timeout(Duration::from_secs(30), handle)
            .await
            .expect("subscriber timed out")
            .unwrap();
        assert!(
            output.replace('\n', "").contains("1234"),
            "output was: {output:?}"
        );
    }

    assert_eq!(manager.query_job(&job_id).await.unwrap().status(), JobStatus::Stopped);
}

#[tokio::test]
async fn invalid_command_is_queryable_as_failed_to_start() {
    let manager = JobManager::new().unwrap();
    let shutdown = CancellationToken::new();

    let opts = JobOptions {
        job_id: Some("invalid-command-job".to_string()),
        ..JobOptions::unconfined()
    };
    let result = manager
        .start_job(&shutdown, "no-such-command-anywhere", &[], opts)
        .await;

    assert!(matches!(
        result,
        Err(JobWorkerError::PreparationFailed { .. })
    ));

    // The failed job is retained so clients can see what happened to it.
    let info = manager.query_job("invalid-command-job").await.unwrap();
    assert_eq!(info.status(), JobStatus::FailedToStart);
}

#[tokio::test]
async fn duplicate_job_id_is_rejected_and_leaves_the_original_intact() {
    let manager = JobManager::new().unwrap();
    let shutdown = CancellationToken::new();

    let opts = JobOptions {
        job_id: Some("duplicate-id".to_string()),
        ..JobOptions::unconfined()
    };
    manager
        .start_job(&shutdown, "true", &[], opts)
        .await
        .unwrap();
    assert!(wait_for_status(&manager, "duplicate-id", JobStatus::Stopped).await);

    let opts = JobOptions {
        job_id: Some("duplicate-id".to_string()),
        ..JobOptions::unconfined()
    };
    let result = manager.start_job(&shutdown, "true", &[], opts).await;
    assert!(matches!(result, Err(JobWorkerError::AlreadyExists(_))));

    let info = manager.query_job("duplicate-id").await.unwrap();
    assert_eq!(info.status(), JobStatus::Stopped);
    assert_eq!(info.exit_code(), 0);
}

#[tokio::test]
async fn stream_attached_after_termination_replays_the_log() {
    let manager = JobManager::new().unwrap();
    let shutdown = CancellationToken::new();

    let info = manager
        .start_job(&shutdown, "echo", &args(&["hello"]), JobOptions::unconfined())
        .await
        .unwrap();

    assert!(wait_for_status(&manager, info.job_id(), JobStatus::Stopped).await);

    let output = tokio::time::timeout(
        Duration::from_secs(10),
        collect_stream(&manager, info.job_id()),
    )
    .await
    .expect("stream timed out");
    assert_eq!(output, "hello\n");
}

#[tokio::test]
async fn stopping_a_stopped_job_is_a_noop() {
    let manager = JobManager::new().unwrap();
    let shutdown = CancellationToken::new();

    let info = manager
        .start_job(&shutdown, "sleep", &args(&["30"]), JobOptions::unconfined())
        .await
        .unwrap();
    let job_id = info.job_id().to_string();

    manager.stop_job(&job_id).await.unwrap();
    assert!(wait_for_status(&manager, &job_id, JobStatus::Stopped).await);
    let exit_code = manager.query_job(&job_id).await.unwrap().exit_code();

    // Second stop: no error, no state change.
    let info = manager.stop_job(&job_id).await.unwrap();
    assert_eq!(info.status(), JobStatus::Stopped);
    assert_eq!(info.exit_code(), exit_code);
}

#[tokio::test]
async fn unknown_job_ids_report_not_found() {
    let manager = JobManager::new().unwrap();

    assert!(matches!(
        manager.query_job("missing").await,
        Err(JobWorkerError::NotFound(_))
    ));
    assert!(matches!(
        manager.stop_job("missing").await,
        Err(JobWorkerError::NotFound(_))
    ));
    assert!(matches!(
        manager.stream_job("missing").await,
        Err(JobWorkerError::NotFound(_))
    ));
}
