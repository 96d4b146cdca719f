#![allow(dead_code)]

use serde_json::{Value, json};
use sk_delta_log::{
    Compression, Compressor, Delta, DeltaBus, DeltaLogger, LOG_FILE_PREFIX, LOG_FILE_SUFFIX,
    LockMode, LoggerConfigBuilder, SubmittedFiles,
};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn nav_delta(speed: f64) -> Delta {
    Delta::new("vessels.self").with_value("navigation.speedOverGround", json!(speed))
}

pub fn battery_delta(volts: f64) -> Delta {
    Delta::new("vessels.self").with_value("electrical.batteries.voltage", json!(volts))
}

/// Sorted list of uncompressed log files in `dir`.
pub fn log_files(dir: &Path) -> Vec<PathBuf> {
    files_ending_with(dir, LOG_FILE_SUFFIX)
}

/// Sorted list of files in `dir` that are log files compressed to `ext`.
pub fn compressed_files(dir: &Path, ext: &str) -> Vec<PathBuf> {
    files_ending_with(dir, &format!("{LOG_FILE_SUFFIX}{ext}"))
}

fn files_ending_with(dir: &Path, suffix: &str) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut files: Vec<PathBuf> = entries
        .map(|e| e.unwrap().path())
        .filter(|p| {
            let name = p.file_name().unwrap().to_str().unwrap();
            name.starts_with(LOG_FILE_PREFIX) && name.ends_with(suffix)
        })
        .collect();
    files.sort();
    files
}

/// Parse every line of a log file as JSON.
pub fn read_records(path: &Path) -> Vec<Value> {
    fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

/// Decode a `.zst` file produced by the zstd backend.
pub fn read_zst_records(path: &Path) -> Vec<Value> {
    let bytes = zstd::decode_all(fs::File::open(path).unwrap()).unwrap();
    String::from_utf8(bytes)
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

/// Poll `cond` every 10ms for up to five seconds.
pub async fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..500 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

/// Compression outcomes seen so far: submitted path -> (runs, successes).
#[derive(Clone, Default)]
pub struct Outcomes(Arc<Mutex<HashMap<PathBuf, (usize, usize)>>>);

impl Outcomes {
    pub fn runs(&self, path: &Path) -> usize {
        self.0.lock().unwrap().get(path).map_or(0, |(runs, _)| *runs)
    }

    pub fn successes(&self, path: &Path) -> usize {
        self.0.lock().unwrap().get(path).map_or(0, |(_, ok)| *ok)
    }

    pub fn total_runs(&self) -> usize {
        self.0.lock().unwrap().values().map(|(runs, _)| runs).sum()
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<_> = self.0.lock().unwrap().keys().cloned().collect();
        paths.sort();
        paths
    }
}

pub fn logger_with_outcomes(bus: &DeltaBus) -> (DeltaLogger, Outcomes) {
    let outcomes = Outcomes::default();
    let sink = outcomes.clone();
    let logger = DeltaLogger::new(Arc::new(bus.clone())).with_compression_observer(move |o| {
        let mut map = sink.0.lock().unwrap();
        let entry = map.entry(o.path.clone()).or_default();
        entry.0 += 1;
        if o.result.is_ok() {
            entry.1 += 1;
        }
    });
    (logger, outcomes)
}

/// Compressor on the current runtime reporting into `outcomes`.
pub fn compressor(compression: Compression, outcomes: &Outcomes) -> Compressor {
    let sink = outcomes.clone();
    Compressor::new(compression, tokio::runtime::Handle::current(), 2)
        .with_submitted(SubmittedFiles::default())
        .with_observer(Some(Arc::new(move |o: &sk_delta_log::CompressionOutcome| {
            let mut map = sink.0.lock().unwrap();
            let entry = map.entry(o.path.clone()).or_default();
            entry.0 += 1;
            if o.result.is_ok() {
                entry.1 += 1;
            }
        })))
}

/// Zstd compression, no lock, no periodic rotation.
pub fn test_config(builder: LoggerConfigBuilder) -> sk_delta_log::LoggerConfig {
    builder
        .compression(Compression::Zstd { level: 3 })
        .lock_mode(LockMode::None)
        .interval(Duration::ZERO)
        .build()
}
