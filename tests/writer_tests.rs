mod common;

use chrono::{TimeZone, Utc};
use common::{Outcomes, compressed_files, compressor, nav_delta, read_records, wait_until};
use serde_json::json;
use sk_delta_log::{Compression, Delta, EventWriter, RotationManager};
use std::fs;
use tempfile::tempdir;
use tokio::runtime::Handle;

fn spawn_writer(dir: &std::path::Path, outcomes: &Outcomes) -> EventWriter {
    let mut rotation = RotationManager::new(dir, compressor(Compression::Zstd { level: 3 }, outcomes));
    rotation.rotate(Utc::now(), false).unwrap();
    let (writer, _task) = EventWriter::spawn(rotation, &Handle::current());
    writer
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_n_events_n_lines_in_order() {
    let dir = tempdir().unwrap();
    let writer = spawn_writer(dir.path(), &Outcomes::default());

    let deltas: Vec<Delta> = (0..25).map(|i| nav_delta(i as f64)).collect();
    for delta in &deltas {
        writer.write(delta.clone());
    }
    writer.flush().await.unwrap();

    let current = writer.current_file().await.unwrap().unwrap();
    let records = read_records(&current);
    assert_eq!(records.len(), 25);
    for (record, delta) in records.iter().zip(&deltas) {
        assert_eq!(record, delta.as_value());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_file_created_lazily() {
    let dir = tempdir().unwrap();
    let writer = spawn_writer(dir.path(), &Outcomes::default());
    writer.flush().await.unwrap();

    let current = writer.current_file().await.unwrap().unwrap();
    assert!(!current.exists(), "no file until the first delta");

    writer.write(nav_delta(1.0));
    writer.flush().await.unwrap();
    assert!(current.exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_opaque_payload_logged_verbatim() {
    let dir = tempdir().unwrap();
    let writer = spawn_writer(dir.path(), &Outcomes::default());

    let odd = json!({"not": "signalk", "nested": {"list": [1, 2, {"x": null}]}, "unicode": "µ°"});
    writer.write(Delta::from(odd.clone()));
    writer.flush().await.unwrap();

    let current = writer.current_file().await.unwrap().unwrap();
    let contents = fs::read_to_string(&current).unwrap();
    assert!(contents.ends_with('\n'));
    assert_eq!(contents.lines().count(), 1);
    assert_eq!(read_records(&current), vec![odd]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_rotation_splits_stream_without_loss() {
    let dir = tempdir().unwrap();
    let outcomes = Outcomes::default();
    let writer = spawn_writer(dir.path(), &outcomes);

    for i in 0..10 {
        writer.write(nav_delta(i as f64));
    }
    let first = writer.current_file().await.unwrap().unwrap();
    let second = writer.rotate(Utc::now(), false).await.unwrap();
    let later: Vec<Delta> = (10..15).map(|i| nav_delta(i as f64)).collect();
    for delta in &later {
        writer.write(delta.clone());
    }
    writer.flush().await.unwrap();

    assert_ne!(first, second);
    assert_eq!(read_records(&first).len(), 10);
    let after = read_records(&second);
    assert_eq!(after.len(), 5);
    assert_eq!(after[0], *later[0].as_value());
    assert_eq!(outcomes.total_runs(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_writers_keep_per_source_order() {
    let dir = tempdir().unwrap();
    let writer = spawn_writer(dir.path(), &Outcomes::default());

    let mut threads = Vec::new();
    for source in 0..4 {
        let writer = writer.clone();
        threads.push(std::thread::spawn(move || {
            for seq in 0..50 {
                writer.write(Delta::from(json!({"source": source, "seq": seq})));
            }
        }));
    }
    for t in threads {
        t.join().unwrap();
    }
    writer.flush().await.unwrap();

    let records = read_records(&writer.current_file().await.unwrap().unwrap());
    assert_eq!(records.len(), 200);
    for source in 0..4 {
        let seqs: Vec<u64> = records
            .iter()
            .filter(|r| r["source"] == source)
            .map(|r| r["seq"].as_u64().unwrap())
            .collect();
        assert_eq!(seqs, (0..50).collect::<Vec<_>>());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failed_append_does_not_stop_stream() {
    let dir = tempdir().unwrap();
    let writer = spawn_writer(dir.path(), &Outcomes::default());

    // A directory squatting on the target path makes every append fail.
    let current = writer.current_file().await.unwrap().unwrap();
    fs::create_dir(&current).unwrap();
    writer.write(nav_delta(1.0));
    writer.write(nav_delta(2.0));
    writer.flush().await.unwrap();

    let next = writer
        .rotate(Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap(), false)
        .await
        .unwrap();
    let survivor = nav_delta(3.0);
    writer.write(survivor.clone());
    writer.flush().await.unwrap();

    assert_eq!(read_records(&next), vec![survivor.into_value()]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_rotate_compresses_previous_once() {
    let dir = tempdir().unwrap();
    let outcomes = Outcomes::default();
    let writer = spawn_writer(dir.path(), &outcomes);

    writer.write(nav_delta(1.0));
    let first = writer.current_file().await.unwrap().unwrap();
    writer.rotate(Utc::now(), true).await.unwrap();

    assert!(wait_until(|| outcomes.successes(&first) == 1).await);
    assert!(!first.exists());
    assert_eq!(compressed_files(dir.path(), ".zst").len(), 1);
    assert_eq!(outcomes.total_runs(), 1);
}
