//! Start/stop orchestration.
//!
//! [`DeltaLogger`] is what the host keeps around; each successful
//! [`DeltaLogger::start`] builds a fresh [`LifecycleController`] holding
//! everything that belongs to that run (writer task, rotation timer,
//! subscription handles, directory lock). Nothing outlives the controller,
//! so a stop/start cycle can't leak handlers into the next run.

use crate::compress::{CompressionObserver, CompressionOutcome, Compressor, SubmittedFiles};
use crate::config::{LockMode, LoggerConfig};
use crate::delta::Delta;
use crate::error::{Error, Result};
use crate::host::{DeltaHandler, ErrorHandler, Host};
use crate::rotation::RotationManager;
use crate::subscription::{FilterMode, SubscriptionFilter, build_subscription};
use crate::writer::EventWriter;
use chrono::Utc;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

pub const LOCK_FILE: &str = ".sk-delta-log.lock";

/// Where a [`DeltaLogger`] is in its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleState {
    Stopped,
    Starting,
    Running,
    Stopping,
    /// Startup was refused; the reason has been reported to the host.
    /// Nothing is installed and no files are touched until the next start.
    Disabled(String),
}

struct RotationTimer {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl RotationTimer {
    fn spawn(writer: EventWriter, period: Duration, runtime: &Handle) -> Self {
        let cancel = CancellationToken::new();
        let cancelled = cancel.clone();
        let task = runtime.spawn(async move {
            let mut ticks = tokio::time::interval_at(Instant::now() + period, period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = cancelled.cancelled() => break,
                    _ = ticks.tick() => {
                        if let Err(e) = writer.rotate(Utc::now(), true).await {
                            log::error!("scheduled rotation failed: {e}");
                        }
                    }
                }
            }
        });
        RotationTimer { cancel, task }
    }

    async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            log::warn!("rotation timer ended abnormally: {e}");
        }
    }
}

/// One running session: from a successful start to its stop.
pub struct LifecycleController {
    dir: PathBuf,
    writer: EventWriter,
    writer_task: Option<JoinHandle<()>>,
    timer: Option<RotationTimer>,
    filter: SubscriptionFilter,
    _lock: Option<DirLock>,
}

impl std::fmt::Debug for LifecycleController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleController")
            .field("dir", &self.dir)
            .field("periodic_rotation", &self.timer.is_some())
            .field("filter", &self.filter)
            .finish_non_exhaustive()
    }
}

impl LifecycleController {
    /// Bring a session up.
    ///
    /// Order: validate and create the directory, take the lock, recover the
    /// previous session's orphan, open the first file, arm the timer,
    /// subscribe. Any error before subscribing leaves nothing installed on
    /// the host, and removes the directory and lock file if this call created
    /// them.
    pub fn start(
        host: &dyn Host,
        config: &LoggerConfig,
        submitted: SubmittedFiles,
        observer: Option<CompressionObserver>,
    ) -> Result<Self> {
        config.validate()?;
        let dir = config
            .logdir
            .clone()
            .ok_or_else(|| Error::Config("no log directory configured".into()))?;
        let runtime = Handle::try_current()
            .map_err(|e| Error::Config(format!("no async runtime available: {e}")))?;

        let created_dir = prepare_dir(&dir)?;
        let lock = match config.lock_mode {
            LockMode::Flock => match lock_dir(&dir) {
                Ok(lock) => Some(lock),
                Err(e) => {
                    undo_prepare(&dir, None, created_dir);
                    return Err(e);
                }
            },
            LockMode::None => None,
        };

        let compressor = Compressor::new(
            config.compression.clone(),
            runtime.clone(),
            config.max_concurrent_compressions,
        )
        .with_submitted(submitted)
        .with_observer(observer);

        // The orphan is only submitted once the first rotation has moved the
        // marker on, so a failed start leaves it exactly as it was.
        let mut rotation = RotationManager::new(&dir, compressor);
        rotation.recover_orphan();
        if let Err(e) = rotation.rotate(Utc::now(), false) {
            undo_prepare(&dir, lock, created_dir);
            return Err(e);
        }

        let (writer, writer_task) = EventWriter::spawn(rotation, &runtime);

        let timer = config
            .rotation_interval()
            .map(|period| RotationTimer::spawn(writer.clone(), period, &runtime));

        let spec = build_subscription(&config.context, &config.paths);
        let sink = writer.clone();
        let on_delta: DeltaHandler = Arc::new(move |delta: Delta| sink.write(delta));
        let on_error: ErrorHandler = Arc::new(|message: String| {
            log::warn!("{}", Error::Subscription(message));
        });
        let filter = SubscriptionFilter::activate(host, &spec, on_delta, on_error);

        Ok(LifecycleController {
            dir,
            writer,
            writer_task: Some(writer_task),
            timer,
            filter,
            _lock: lock,
        })
    }

    /// Tear the session down.
    ///
    /// The timer is cancelled and joined first, so no scheduled rotation can
    /// run after this returns. Subscriptions are cancelled next; deltas
    /// already queued still land in the current file, which the final
    /// rotation then hands to the compressor. Compression itself is not
    /// awaited.
    pub async fn stop(mut self) {
        if let Some(timer) = self.timer.take() {
            timer.stop().await;
        }
        self.filter.deactivate();

        if let Err(e) = self.writer.rotate(Utc::now(), true).await {
            log::error!("final rotation failed: {e}");
        }

        self.writer.close();
        if let Some(task) = self.writer_task.take() {
            if let Err(e) = task.await {
                log::warn!("writer task ended abnormally: {e}");
            }
        }
        log::info!("stopped logging to {}", self.dir.display());
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn writer(&self) -> &EventWriter {
        &self.writer
    }

    pub fn mode(&self) -> FilterMode {
        self.filter.mode()
    }
}

impl Drop for LifecycleController {
    // Only reached without `stop()` when the owner is dropped mid-run: cancel
    // what can be cancelled synchronously. There is no final rotation; the
    // marker still names the file, so the next start recovers it.
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.cancel.cancel();
        }
        if self.writer_task.take().is_some() {
            self.writer.close();
        }
    }
}

/// Returns whether the directory had to be created.
fn prepare_dir(dir: &Path) -> Result<bool> {
    let unusable = |source: io::Error| Error::LogDir {
        path: dir.to_path_buf(),
        source,
    };
    match fs::metadata(dir) {
        Ok(meta) if meta.is_dir() => Ok(false),
        Ok(_) => Err(unusable(io::Error::new(
            io::ErrorKind::AlreadyExists,
            "path exists and is not a directory",
        ))),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            fs::create_dir_all(dir).map_err(unusable)?;
            log::info!("created log directory {}", dir.display());
            Ok(true)
        }
        Err(e) => Err(unusable(e)),
    }
}

/// Exclusive advisory lock on the log directory, held while open.
struct DirLock {
    file: File,
    path: PathBuf,
    created: bool,
}

fn lock_dir(dir: &Path) -> Result<DirLock> {
    let path = dir.join(LOCK_FILE);
    let open_error = |source: io::Error| Error::LogDir {
        path: path.clone(),
        source,
    };
    let (file, created) = match OpenOptions::new().write(true).create_new(true).open(&path) {
        Ok(file) => (file, true),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            let file = OpenOptions::new()
                .write(true)
                .open(&path)
                .map_err(open_error)?;
            (file, false)
        }
        Err(e) => return Err(open_error(e)),
    };
    if file.try_lock_exclusive().is_err() {
        // Another writer holds it.
        return Err(Error::Locked {
            path: dir.to_path_buf(),
        });
    }
    Ok(DirLock {
        file,
        path,
        created,
    })
}

// Failed start: drop what this start created. The lock file goes while it is
// still held, so no other writer can be holding it.
fn undo_prepare(dir: &Path, lock: Option<DirLock>, created_dir: bool) {
    if let Some(lock) = lock {
        if lock.created {
            let _ = fs::remove_file(&lock.path);
        }
        drop(lock.file);
    }
    if created_dir {
        let _ = fs::remove_dir(dir);
    }
}

/// The logger as the host sees it.
///
/// # Examples
///
/// ```no_run
/// use sk_delta_log::{DeltaBus, DeltaLogger, LifecycleState, LoggerConfig};
/// use std::sync::Arc;
///
/// # async fn run() {
/// let bus = DeltaBus::new();
/// let mut logger = DeltaLogger::new(Arc::new(bus.clone()));
///
/// logger
///     .start(LoggerConfig::builder("/var/log/signalk").subscribe("navigation.*", 1000).build())
///     .await;
/// assert_eq!(logger.state(), &LifecycleState::Running);
///
/// // ... bus.publish(delta) from the application ...
///
/// logger.stop().await;
/// # }
/// ```
pub struct DeltaLogger {
    host: Arc<dyn Host>,
    state: LifecycleState,
    controller: Option<LifecycleController>,
    submitted: SubmittedFiles,
    observer: Option<CompressionObserver>,
}

impl std::fmt::Debug for DeltaLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeltaLogger")
            .field("state", &self.state)
            .field("controller", &self.controller)
            .finish_non_exhaustive()
    }
}

impl DeltaLogger {
    pub fn new(host: Arc<dyn Host>) -> Self {
        DeltaLogger {
            host,
            state: LifecycleState::Stopped,
            controller: None,
            submitted: SubmittedFiles::default(),
            observer: None,
        }
    }

    /// Be told about every finished compression run.
    pub fn with_compression_observer(
        mut self,
        observer: impl Fn(&CompressionOutcome) + Send + Sync + 'static,
    ) -> Self {
        self.observer = Some(Arc::new(observer));
        self
    }

    /// Start logging with `config`.
    ///
    /// A running session is stopped first. Never fails: if the configuration
    /// is unusable the logger ends up [`LifecycleState::Disabled`] and the
    /// reason goes to [`Host::set_error`].
    pub async fn start(&mut self, config: LoggerConfig) -> &LifecycleState {
        self.stop().await;

        self.state = LifecycleState::Starting;
        match LifecycleController::start(
            self.host.as_ref(),
            &config,
            self.submitted.clone(),
            self.observer.clone(),
        ) {
            Ok(controller) => {
                let mode = match controller.mode() {
                    FilterMode::Subscribed => "selected paths",
                    FilterMode::Fallback => "all deltas",
                };
                self.host.set_status(&format!(
                    "logging {mode} to {}",
                    controller.dir().display()
                ));
                self.controller = Some(controller);
                self.state = LifecycleState::Running;
            }
            Err(e) => {
                self.host.set_error(&format!("delta logging disabled: {e}"));
                self.state = LifecycleState::Disabled(e.to_string());
            }
        }
        &self.state
    }

    /// Stop the running session, if any. A disabled logger goes back to
    /// `Stopped`.
    pub async fn stop(&mut self) {
        if let Some(controller) = self.controller.take() {
            self.state = LifecycleState::Stopping;
            controller.stop().await;
        }
        self.state = LifecycleState::Stopped;
    }

    pub fn state(&self) -> &LifecycleState {
        &self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == LifecycleState::Running
    }

    /// Rotate immediately, compressing the file rotated away from.
    pub async fn rotate_now(&self) -> Result<PathBuf> {
        self.running()?.writer().rotate(Utc::now(), true).await
    }

    /// Wait until everything delivered so far is on disk.
    pub async fn flush(&self) -> Result<()> {
        self.running()?.writer().flush().await
    }

    /// The file currently being written, if running.
    pub async fn current_log_file(&self) -> Option<PathBuf> {
        let controller = self.controller.as_ref()?;
        controller.writer().current_file().await.ok().flatten()
    }

    fn running(&self) -> Result<&LifecycleController> {
        self.controller.as_ref().ok_or(Error::NotRunning)
    }
}
