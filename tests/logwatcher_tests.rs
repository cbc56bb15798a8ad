//! Log watcher tests against an external writer, mirroring how a job feeds
//! its log file: one process appends, many independent subscribers tail.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use jobworker::manager::LogWatcher;

async fn collect(watcher: Arc<LogWatcher>, path: PathBuf, active: Arc<AtomicBool>) -> String {
    let mut rx = watcher
        .add_watch(path, Box::new(move || active.load(Ordering::SeqCst)))
        .await
        .expect("add_watch failed");

    let mut output = Vec::new();
    while let Some(block) = rx.recv().await {
        output.extend_from_slice(&block);
    }
    String::from_utf8(output).expect("log output was not utf-8")
}

/// Five subscribers attach at 0..4 s while a writer appends one line per
/// second for five seconds. Late joiners must still see the whole file:
/// every reader opens its own handle and starts from offset zero.
#[tokio::test]
async fn staggered_subscribers_each_receive_the_full_log() {
    let watcher = Arc::new(LogWatcher::new().unwrap());
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("writer.log");

    let log = std::fs::File::create(&path).unwrap();
    let child_stdout = log.try_clone().unwrap();

    let mut child = tokio::process::Command::new("bash")
        .arg("-c")
        .arg("for x in {1..5}; do echo $x; sleep 1; done")
        .stdout(Stdio::from(child_stdout))
        .spawn()
        .unwrap();

    let active = Arc::new(AtomicBool::new(true));
    let writer_active = active.clone();
    tokio::spawn(async move {
        let _ = child.wait().await;
        // Flip before the final close so readers woken by IN_CLOSE_WRITE
        // observe the inactive state, the same order the job engine uses.
        writer_active.store(false, Ordering::SeqCst);
        drop(log);
    });

    let mut handles = Vec::new();
    for i in 0..5u64 {
        let watcher = watcher.clone();
        let path = path.clone();
        let active = active.clone();
        handles.push(tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(i)).await;
            collect(watcher, path, active).await
        }));
    }

    for handle in handles {
        let output = tokio::time::timeout(Duration::from_secs(30), handle)
            .await
            .expect("subscriber timed out")
            .unwrap();
        assert_eq!(output, "1\n2\n3\n4\n5\n");
    }

    watcher.close();
}

/// A subscriber that attaches after the writer already finished still gets
/// the entire contents, then the channel closes.
#[tokio::test]
async fn late_subscriber_reads_the_whole_file() {
    let watcher = Arc::new(LogWatcher::new().unwrap());
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("done.log");

    std::fs::write(&path, "hello\n").unwrap();
    let active = Arc::new(AtomicBool::new(false));

    let output = tokio::time::timeout(
        Duration::from_secs(10),
        collect(watcher.clone(), path, active),
    )
    .await
    .expect("subscriber timed out");

    assert_eq!(output, "hello\n");
    watcher.close();
}

#[tokio::test]
async fn add_watch_fails_for_a_missing_file() {
    let watcher = LogWatcher::new().unwrap();
    let dir = tempfile::tempdir().unwrap();

    let result = watcher
        .add_watch(dir.path().join("absent.log"), Box::new(|| true))
        .await;

    assert!(result.is_err());
    watcher.close();
}
