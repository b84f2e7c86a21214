//! File observation against the real filesystem.

use credwatch::{FileChangeEvent, FileChangeKind, FileObserver};
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const WINDOW: Duration = Duration::from_millis(50);
const PATIENCE: Duration = Duration::from_secs(5);

struct Watched {
    observer: FileObserver,
    events: Arc<Mutex<Vec<FileChangeEvent>>>,
}

fn start_observer(window: Duration) -> Watched {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let observer = FileObserver::new(window).unwrap();
    observer
        .start(move |event| sink.lock().unwrap().push(event))
        .unwrap();
    Watched { observer, events }
}

async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + PATIENCE;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}

fn kinds_for(events: &Mutex<Vec<FileChangeEvent>>, name: &str) -> Vec<FileChangeKind> {
    events
        .lock()
        .unwrap()
        .iter()
        .filter(|event| event.path.file_name().is_some_and(|n| n == name))
        .flat_map(|event| event.kinds.clone())
        .collect()
}

#[tokio::test(flavor = "multi_thread")]
async fn modification_of_a_watched_file_is_delivered() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("watched.pem");
    fs::write(&file, b"v1").unwrap();

    let watched = start_observer(WINDOW);
    watched.observer.watch(&file).unwrap();

    fs::write(&file, b"v2").unwrap();

    assert!(
        wait_until(|| !kinds_for(&watched.events, "watched.pem").is_empty()).await,
        "no event arrived for the watched file"
    );
    assert!(kinds_for(&watched.events, "watched.pem").contains(&FileChangeKind::Modified));
}

#[tokio::test(flavor = "multi_thread")]
async fn deletion_of_a_watched_file_is_delivered() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("doomed.pem");
    fs::write(&file, b"v1").unwrap();

    let watched = start_observer(WINDOW);
    watched.observer.watch(&file).unwrap();

    fs::remove_file(&file).unwrap();

    assert!(wait_until(|| kinds_for(&watched.events, "doomed.pem")
        .contains(&FileChangeKind::Deleted))
    .await);
}

#[tokio::test(flavor = "multi_thread")]
async fn unwatched_sibling_files_are_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let watched_file = dir.path().join("watched.pem");
    let sibling = dir.path().join("sibling.pem");
    fs::write(&watched_file, b"v1").unwrap();
    fs::write(&sibling, b"v1").unwrap();

    let watched = start_observer(WINDOW);
    watched.observer.watch(&watched_file).unwrap();

    fs::write(&sibling, b"v2").unwrap();
    fs::write(&watched_file, b"v2").unwrap();

    // The watched file's event proves the sibling's change had every chance
    // to arrive first.
    assert!(wait_until(|| !kinds_for(&watched.events, "watched.pem").is_empty()).await);
    assert!(kinds_for(&watched.events, "sibling.pem").is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn no_events_after_unwatch() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("released.pem");
    fs::write(&file, b"v1").unwrap();

    let watched = start_observer(WINDOW);
    watched.observer.watch(&file).unwrap();
    watched.observer.unwatch(&file);

    fs::write(&file, b"v2").unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert!(kinds_for(&watched.events, "released.pem").is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn close_releases_watches_and_stops_delivery() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("closed.pem");
    fs::write(&file, b"v1").unwrap();

    let watched = start_observer(WINDOW);
    watched.observer.watch(&file).unwrap();
    watched.observer.close();
    assert_eq!(watched.observer.watched_file_count(), 0);

    fs::write(&file, b"v2").unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(kinds_for(&watched.events, "closed.pem").is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn burst_of_writes_coalesces_into_one_event() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("bursty.pem");
    fs::write(&file, b"v1").unwrap();

    let watched = start_observer(Duration::from_millis(500));
    watched.observer.watch(&file).unwrap();

    fs::write(&file, b"v2").unwrap();
    fs::write(&file, b"v3").unwrap();
    fs::write(&file, b"v4").unwrap();

    assert!(wait_until(|| !watched.events.lock().unwrap().is_empty()).await);
    // All raw events landed inside one debounce window.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let events = watched.events.lock().unwrap();
    assert_eq!(events.len(), 1, "expected one merged event, got {events:?}");
    assert!(!events[0].kinds.is_empty());
}
