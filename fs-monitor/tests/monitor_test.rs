//! End-to-end tests for the directory monitor.
//!
//! These run a real monitor against temporary directories and observe the
//! records it hands to its sink.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use fs_monitor::{
    ChangeEvent, ChangeKind, FsMonitor, MESSAGE_KEY, MonitorConfig, MonitorState, Record, file_id,
};
use pretty_assertions::assert_eq;
use tempfile::TempDir;
use tokio::task::JoinHandle;

type Collected = Arc<Mutex<Vec<ChangeEvent>>>;

/// Start `monitor` on its own task with a sink that parses every record.
fn spawn_collecting(monitor: &Arc<FsMonitor>) -> (Collected, JoinHandle<fs_monitor::Result<()>>) {
    let collected: Collected = Arc::new(Mutex::new(Vec::new()));
    let sink_events = collected.clone();
    let monitor = monitor.clone();

    let handle = tokio::spawn(async move {
        monitor
            .start(move |record: Record| -> anyhow::Result<()> {
                let message = record[MESSAGE_KEY]
                    .as_str()
                    .ok_or_else(|| anyhow::anyhow!("message is not a string"))?;
                sink_events
                    .lock()
                    .unwrap()
                    .push(serde_json::from_str(message)?);
                Ok(())
            })
            .await
    });

    (collected, handle)
}

async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {what}");
}

async fn wait_for_sessions(monitor: &FsMonitor, count: u64) {
    wait_until("watch session", || monitor.stats().sessions_opened >= count).await;
}

fn events_named(collected: &Collected, name: &str) -> Vec<ChangeEvent> {
    collected
        .lock()
        .unwrap()
        .iter()
        .filter(|e| e.file_name == name)
        .cloned()
        .collect()
}

fn config<P: AsRef<Path>>(paths: &[P]) -> MonitorConfig {
    MonitorConfig::new(paths.iter().map(|p| p.as_ref().to_path_buf()))
        .with_poll_interval(Duration::from_millis(100))
}

#[tokio::test]
async fn test_create_in_watched_directory() {
    let root = TempDir::new().unwrap();
    let watched = root.path().join("x");
    std::fs::create_dir(&watched).unwrap();

    let monitor = Arc::new(FsMonitor::new("fsmonitor", config(&[&watched])).unwrap());
    let (collected, handle) = spawn_collecting(&monitor);
    wait_for_sessions(&monitor, 1).await;

    std::fs::File::create(watched.join("a.txt")).unwrap();
    wait_until("create event", || !events_named(&collected, "a.txt").is_empty()).await;

    monitor.stop();
    monitor.await_stopped().await;
    handle.await.unwrap().unwrap();

    let creates: Vec<_> = events_named(&collected, "a.txt")
        .into_iter()
        .filter(|e| e.event_type == ChangeKind::Create)
        .collect();
    assert_eq!(creates.len(), 1);

    let expected_path = watched.to_string_lossy().into_owned();
    assert_eq!(creates[0].file_path, expected_path);
    assert_eq!(creates[0].file_id, file_id(&expected_path, "a.txt"));
}

#[tokio::test]
async fn test_modify_and_delete_are_reported() {
    let root = TempDir::new().unwrap();
    let file = root.path().join("notes.txt");
    std::fs::write(&file, "one").unwrap();

    let monitor = Arc::new(FsMonitor::new("fsmonitor", config(&[root.path()])).unwrap());
    let (collected, handle) = spawn_collecting(&monitor);
    wait_for_sessions(&monitor, 1).await;

    std::fs::write(&file, "two").unwrap();
    wait_until("modify event", || {
        events_named(&collected, "notes.txt")
            .iter()
            .any(|e| e.event_type == ChangeKind::Modify)
    })
    .await;

    std::fs::remove_file(&file).unwrap();
    wait_until("delete event", || {
        events_named(&collected, "notes.txt")
            .iter()
            .any(|e| e.event_type == ChangeKind::Delete)
    })
    .await;

    monitor.stop();
    handle.await.unwrap().unwrap();

    // Same directory and name, same id, whatever the kind.
    let ids: Vec<_> = events_named(&collected, "notes.txt")
        .iter()
        .map(|e| e.file_id)
        .collect();
    assert!(ids.windows(2).all(|w| w[0] == w[1]));
}

#[tokio::test]
async fn test_every_registered_directory_is_observed() {
    let root = TempDir::new().unwrap();
    let dirs: Vec<_> = ["a", "b", "c"].iter().map(|n| root.path().join(n)).collect();
    for dir in &dirs {
        std::fs::create_dir(dir).unwrap();
    }

    // Registration order differs from the order files are created in.
    let monitor = Arc::new(
        FsMonitor::new("fsmonitor", config(&[&dirs[2], &dirs[0], &dirs[1]])).unwrap(),
    );
    let (collected, handle) = spawn_collecting(&monitor);
    wait_for_sessions(&monitor, 1).await;

    for (index, dir) in dirs.iter().enumerate() {
        std::fs::File::create(dir.join(format!("file-{index}"))).unwrap();
    }

    wait_until("an event from every directory", || {
        (0..dirs.len()).all(|i| !events_named(&collected, &format!("file-{i}")).is_empty())
    })
    .await;

    monitor.stop();
    handle.await.unwrap().unwrap();

    for (index, dir) in dirs.iter().enumerate() {
        let events = events_named(&collected, &format!("file-{index}"));
        assert_eq!(events[0].file_path, dir.to_string_lossy().into_owned());
    }
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_deleted_directory_rebuilds_session() {
    let root = TempDir::new().unwrap();
    let x = root.path().join("x");
    let y = root.path().join("y");
    std::fs::create_dir(&x).unwrap();
    std::fs::create_dir(&y).unwrap();

    let monitor = Arc::new(FsMonitor::new("fsmonitor", config(&[&x, &y])).unwrap());
    let (collected, handle) = spawn_collecting(&monitor);
    wait_for_sessions(&monitor, 1).await;

    std::fs::remove_dir_all(&x).unwrap();
    wait_for_sessions(&monitor, 2).await;

    std::fs::File::create(y.join("after.txt")).unwrap();
    wait_until("event from surviving directory", || {
        !events_named(&collected, "after.txt").is_empty()
    })
    .await;

    assert_eq!(monitor.state(), MonitorState::Running);
    monitor.stop();
    handle.await.unwrap().unwrap();

    let stats = monitor.stats();
    assert!(stats.sessions_invalidated >= 1);
    assert!(stats.registrations_failed >= 1);
    assert_eq!(stats.sessions_closed, stats.sessions_opened);
    assert_eq!(
        events_named(&collected, "after.txt")[0].file_path,
        y.to_string_lossy().into_owned()
    );
}

#[tokio::test]
async fn test_rename_is_reported_as_delete_then_create() {
    let root = TempDir::new().unwrap();
    std::fs::write(root.path().join("old.txt"), "data").unwrap();

    let monitor = Arc::new(FsMonitor::new("fsmonitor", config(&[root.path()])).unwrap());
    let (collected, handle) = spawn_collecting(&monitor);
    wait_for_sessions(&monitor, 1).await;

    std::fs::rename(root.path().join("old.txt"), root.path().join("new.txt")).unwrap();
    wait_until("rename event", || !events_named(&collected, "new.txt").is_empty()).await;

    // Give any late duplicate a chance to arrive before stopping.
    tokio::time::sleep(Duration::from_millis(300)).await;
    monitor.stop();
    handle.await.unwrap().unwrap();

    let seen: Vec<_> = collected
        .lock()
        .unwrap()
        .iter()
        .map(|e| (e.file_name.clone(), e.event_type))
        .collect();
    assert_eq!(
        seen,
        vec![
            ("old.txt".to_string(), ChangeKind::Delete),
            ("new.txt".to_string(), ChangeKind::Create),
        ]
    );
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_deleting_a_watched_subdirectory_is_reported_by_its_parent() {
    let root = TempDir::new().unwrap();
    let x = root.path().join("x");
    std::fs::create_dir(&x).unwrap();

    let monitor =
        Arc::new(FsMonitor::new("fsmonitor", config(&[root.path(), x.as_path()])).unwrap());
    let (collected, handle) = spawn_collecting(&monitor);
    wait_for_sessions(&monitor, 1).await;

    std::fs::remove_dir(&x).unwrap();
    wait_until("delete event for the subdirectory", || {
        !events_named(&collected, "x").is_empty()
    })
    .await;
    // Losing x's lease rebuilds the session around the surviving root.
    wait_for_sessions(&monitor, 2).await;

    monitor.stop();
    handle.await.unwrap().unwrap();

    let events = events_named(&collected, "x");
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, ChangeKind::Delete);
    assert_eq!(events[0].file_path, root.path().to_string_lossy().into_owned());
}

#[tokio::test]
async fn test_start_stop_await_is_prompt() {
    let root = TempDir::new().unwrap();
    let monitor = Arc::new(FsMonitor::new("fsmonitor", config(&[root.path()])).unwrap());

    let started = Instant::now();
    let (_collected, handle) = spawn_collecting(&monitor);
    monitor.stop();
    tokio::time::timeout(Duration::from_secs(1), monitor.await_stopped())
        .await
        .unwrap();
    assert!(started.elapsed() < Duration::from_secs(1));

    handle.await.unwrap().unwrap();
    assert_eq!(monitor.state(), MonitorState::Stopped);
}

#[tokio::test]
async fn test_stop_interrupts_an_idle_wait() {
    let root = TempDir::new().unwrap();
    let monitor = Arc::new(
        FsMonitor::new(
            "fsmonitor",
            MonitorConfig::new([root.path()]).with_poll_interval(Duration::from_millis(300)),
        )
        .unwrap(),
    );
    let (collected, handle) = spawn_collecting(&monitor);
    wait_for_sessions(&monitor, 1).await;

    let stopping = Instant::now();
    monitor.stop();
    tokio::time::timeout(Duration::from_secs(1), monitor.await_stopped())
        .await
        .unwrap();
    assert!(stopping.elapsed() < Duration::from_secs(1));

    handle.await.unwrap().unwrap();

    // Waiting again after completion returns at once.
    tokio::time::timeout(Duration::from_millis(50), monitor.await_stopped())
        .await
        .unwrap();

    let stats = monitor.stats();
    assert_eq!(stats.sessions_opened, 1);
    assert_eq!(stats.sessions_closed, 1);
    assert!(collected.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_await_stopped_from_another_task() {
    let root = TempDir::new().unwrap();
    let monitor = Arc::new(FsMonitor::new("fsmonitor", config(&[root.path()])).unwrap());

    let waiter = tokio::spawn({
        let monitor = monitor.clone();
        async move { monitor.await_stopped().await }
    });

    let (_collected, handle) = spawn_collecting(&monitor);
    wait_for_sessions(&monitor, 1).await;
    assert!(!waiter.is_finished());

    monitor.stop();
    tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .unwrap()
        .unwrap();
    handle.await.unwrap().unwrap();
}
