//! Fire-and-forget compression of rotated log files.

use crate::config::Compression;
use crate::error::{Error, Result};
use std::collections::HashSet;
use std::ffi::OsString;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::runtime::Handle;
use tokio::sync::Semaphore;

/// Result of one compression run, handed to the completion observer.
#[derive(Debug)]
pub struct CompressionOutcome {
    /// The uncompressed file that was submitted.
    pub path: PathBuf,
    pub result: Result<()>,
}

/// Callback invoked once per finished compression run.
pub type CompressionObserver = Arc<dyn Fn(&CompressionOutcome) + Send + Sync>;

/// Paths that have been submitted for compression.
///
/// Shared by every session of a [`DeltaLogger`](crate::DeltaLogger) so a file
/// can't be submitted twice across restarts. Successful runs are removed (the
/// source file is gone by then); failed runs stay, so a file whose compression
/// failed is never retried.
pub type SubmittedFiles = Arc<Mutex<HashSet<PathBuf>>>;

/// Compresses closed log files in the background.
///
/// [`Compressor::compress`] returns immediately; the work runs as a detached
/// task on the runtime captured at construction. At most `max_concurrent`
/// runs are active at once, the rest wait on a semaphore.
#[derive(Clone)]
pub struct Compressor {
    backend: Arc<Compression>,
    runtime: Handle,
    submitted: SubmittedFiles,
    permits: Arc<Semaphore>,
    observer: Option<CompressionObserver>,
}

impl std::fmt::Debug for Compressor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Compressor")
            .field("backend", &self.backend)
            .field("available_permits", &self.permits.available_permits())
            .finish_non_exhaustive()
    }
}

impl Compressor {
    pub fn new(backend: Compression, runtime: Handle, max_concurrent: usize) -> Self {
        Compressor {
            backend: Arc::new(backend),
            runtime,
            submitted: SubmittedFiles::default(),
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            observer: None,
        }
    }

    /// Share the submitted-files set with other compressors.
    pub fn with_submitted(mut self, submitted: SubmittedFiles) -> Self {
        self.submitted = submitted;
        self
    }

    pub fn with_observer(mut self, observer: Option<CompressionObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Submit `path` for compression without waiting for it.
    ///
    /// Returns `false` when nothing was submitted: the file doesn't exist
    /// (nothing was ever written to it) or it has already been submitted.
    pub fn compress(&self, path: &Path) -> bool {
        if !path.is_file() {
            log::debug!("nothing to compress at {}", path.display());
            return false;
        }
        if !self.submitted().insert(path.to_path_buf()) {
            log::debug!("{} already submitted for compression", path.display());
            return false;
        }

        let this = self.clone();
        let path = path.to_path_buf();
        self.runtime.spawn(async move {
            // The semaphore is never closed.
            let _permit = this.permits.acquire().await;
            let result = run(&this.backend, &path).await;
            match &result {
                Ok(()) => {
                    log::info!("compressed {}", path.display());
                    this.submitted().remove(&path);
                }
                Err(e) => log::warn!("{e}; leaving it uncompressed"),
            }
            if let Some(observer) = &this.observer {
                observer(&CompressionOutcome { path, result });
            }
        });
        true
    }

    fn submitted(&self) -> std::sync::MutexGuard<'_, HashSet<PathBuf>> {
        self.submitted.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn run(backend: &Compression, path: &Path) -> Result<()> {
    match backend {
        Compression::Gzip => run_command("gzip", &[], path).await,
        Compression::Command { program, args } => run_command(program, args, path).await,
        Compression::Zstd { level } => {
            let level = *level;
            let owned = path.to_path_buf();
            tokio::task::spawn_blocking(move || zstd_file(&owned, level))
                .await
                .map_err(|e| failure(path, e.to_string()))?
                .map(|_| ())
                .map_err(|e| failure(path, e.to_string()))
        }
    }
}

async fn run_command(program: &str, args: &[String], path: &Path) -> Result<()> {
    let output = tokio::process::Command::new(program)
        .args(args)
        .arg(path)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| failure(path, format!("could not run {program}: {e}")))?;

    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    Err(failure(
        path,
        format!("{program} exited with {}: {}", output.status, stderr.trim()),
    ))
}

fn failure(path: &Path, reason: String) -> Error {
    Error::Compression {
        path: path.to_path_buf(),
        reason,
    }
}

/// Compress `path` into `<path>.zst` and remove the original.
///
/// The frame is written to `<path>.zst.tmp`, synced and renamed into place,
/// so a crash mid-way never leaves a truncated `.zst` next to the original.
fn zstd_file(path: &Path, level: i32) -> io::Result<PathBuf> {
    let target = with_suffix(path, ".zst");
    let tmp = with_suffix(path, ".zst.tmp");

    let written = (|| {
        let mut input = File::open(path)?;
        let output = File::create(&tmp)?;
        let mut encoder = zstd::Encoder::new(output, level)?;
        io::copy(&mut input, &mut encoder)?;
        let file = encoder.finish()?;
        file.sync_data()
    })();
    if let Err(e) = written {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }

    fs::rename(&tmp, &target)?;
    fs::remove_file(path)?;
    Ok(target)
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}
