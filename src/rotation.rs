//! Identity of the active log file, rotation, and crash recovery.
//!
//! The directory holds at most one active log file plus a marker naming it:
//!
//! ```text
//! <logdir>/sk-delta-log.2026-10-19T09-48-00.123Z.log      active (or rotated, awaiting compression)
//! <logdir>/sk-delta-log.2026-10-19T08-48-00.120Z.log.gz   compressed
//! <logdir>/.current_log_file                              marker: name of the active file
//! ```

use crate::compress::Compressor;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

pub const LOG_FILE_PREFIX: &str = "sk-delta-log.";
pub const LOG_FILE_SUFFIX: &str = ".log";
pub const MARKER_FILE: &str = ".current_log_file";

/// File name for a log started at `at`.
///
/// UTC, millisecond precision, with `:` replaced so the name is valid on
/// every common filesystem. Names sort lexically in time order.
///
/// # Examples
///
/// ```
/// use chrono::{TimeZone, Utc};
/// use sk_delta_log::log_file_name;
///
/// let at = Utc.with_ymd_and_hms(2026, 10, 19, 9, 48, 0).unwrap();
/// assert_eq!(log_file_name(at), "sk-delta-log.2026-10-19T09-48-00.000Z.log");
/// ```
pub fn log_file_name(at: DateTime<Utc>) -> String {
    format!(
        "{LOG_FILE_PREFIX}{}{LOG_FILE_SUFFIX}",
        at.format("%Y-%m-%dT%H-%M-%S%.3fZ")
    )
}

fn is_log_file_name(name: &str) -> bool {
    name.starts_with(LOG_FILE_PREFIX)
        && name.ends_with(LOG_FILE_SUFFIX)
        && Path::new(name).file_name().and_then(|n| n.to_str()) == Some(name)
}

/// Owns "which file is current" for one log directory.
///
/// Lives inside the writer task, which is the only place that mutates it;
/// rotations and appends are therefore serialized by construction.
#[derive(Debug)]
pub struct RotationManager {
    dir: PathBuf,
    marker_path: PathBuf,
    current: Option<PathBuf>,
    last_rotation_ms: Option<i64>,
    recovered: bool,
    orphan: Option<PathBuf>,
    compressor: Compressor,
}

impl RotationManager {
    pub fn new(dir: impl AsRef<Path>, compressor: Compressor) -> Self {
        let dir = dir.as_ref().to_path_buf();
        let marker_path = dir.join(MARKER_FILE);
        RotationManager {
            dir,
            marker_path,
            current: None,
            last_rotation_ms: None,
            recovered: false,
            orphan: None,
            compressor,
        }
    }

    /// Find the file a previous session left active, if any.
    ///
    /// Reads the marker; if it names a log file that still exists, that file
    /// was never rotated away from (crash, kill, power loss). It is handed to
    /// the compressor by the next successful [`RotationManager::rotate`], once
    /// the marker names the new file; if that rotation fails the orphan is
    /// left untouched for a later start. A missing marker, or one naming a
    /// file that no longer exists, is not an error: nothing happens and the
    /// marker is overwritten by the next rotation. Only the first call per
    /// manager does anything.
    pub fn recover_orphan(&mut self) -> Option<PathBuf> {
        if std::mem::replace(&mut self.recovered, true) {
            return None;
        }

        let contents = match fs::read_to_string(&self.marker_path) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
            Err(e) => {
                log::warn!(
                    "cannot read marker {}: {e}; skipping recovery",
                    self.marker_path.display()
                );
                return None;
            }
        };

        let name = contents.trim();
        if !is_log_file_name(name) {
            log::warn!(
                "marker {} holds unexpected content {name:?}; ignoring it",
                self.marker_path.display()
            );
            return None;
        }

        let orphan = self.dir.join(name);
        if !orphan.is_file() {
            log::debug!("marker names {name}, which no longer exists; nothing to recover");
            return None;
        }

        log::info!("recovering orphaned log file {}", orphan.display());
        self.orphan = Some(orphan.clone());
        Some(orphan)
    }

    /// Switch to a new log file named after `now`.
    ///
    /// The marker is rewritten first; if that fails nothing changes and the
    /// error is returned, so the marker always names the file being written.
    /// On success the previous file (if any, and if `compress_previous`) is
    /// handed to the compressor. The caller must have flushed and closed its
    /// handle on the previous file.
    ///
    /// A `now` not later than the previous rotation (same millisecond, clock
    /// stepped back) is moved to one millisecond past it, keeping names unique
    /// and increasing within a session.
    pub fn rotate(&mut self, now: DateTime<Utc>, compress_previous: bool) -> Result<PathBuf> {
        let mut at_ms = now.timestamp_millis();
        if let Some(prev) = self.last_rotation_ms {
            if at_ms <= prev {
                at_ms = prev + 1;
            }
        }
        let at = DateTime::from_timestamp_millis(at_ms).unwrap_or(now);
        let name = log_file_name(at);
        let next = self.dir.join(&name);

        write_marker(&self.marker_path, &name).map_err(|source| Error::Marker {
            path: self.marker_path.clone(),
            source,
        })?;

        self.last_rotation_ms = Some(at_ms);
        let previous = self.current.replace(next.clone());
        log::info!("rotated to {name}");

        if let Some(orphan) = self.orphan.take() {
            self.compressor.compress(&orphan);
        }
        if compress_previous {
            if let Some(previous) = previous {
                self.compressor.compress(&previous);
            }
        }
        Ok(next)
    }

    /// The file appends currently go to.
    pub fn current(&self) -> Option<&Path> {
        self.current.as_deref()
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn marker_path(&self) -> &Path {
        &self.marker_path
    }
}

/// Replace the marker atomically: write `.tmp`, sync, rename.
fn write_marker(path: &Path, name: &str) -> io::Result<()> {
    let tmp_path = path.with_extension("tmp");

    let written = (|| {
        let mut file = fs::File::create(&tmp_path)?;
        writeln!(file, "{name}")?;
        file.sync_data()?;
        fs::rename(&tmp_path, path)
    })();
    if written.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }
    written
}
