use crate::delta::Delta;
use crate::error::{Error, Result};
use crate::rotation::RotationManager;
use chrono::{DateTime, Utc};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

enum Command {
    Append(Delta),
    Rotate {
        at: DateTime<Utc>,
        compress_previous: bool,
        done: oneshot::Sender<Result<PathBuf>>,
    },
    Flush(oneshot::Sender<Option<PathBuf>>),
    Close,
}

/// Handle for appending deltas to the current log file.
///
/// Cheap to clone; every clone feeds the same writer task. [`EventWriter::write`]
/// only enqueues, so the event source is never blocked by disk I/O. The task
/// owns both the open file and the [`RotationManager`] and applies appends and
/// rotations strictly in the order they were enqueued: an append lands wholly
/// in the file that was current when it reached the front of the queue.
#[derive(Debug, Clone)]
pub struct EventWriter {
    tx: mpsc::UnboundedSender<Command>,
}

impl EventWriter {
    /// Start the writer task on the runtime's blocking pool.
    ///
    /// `rotation` should already have a current file (see
    /// [`RotationManager::rotate`]); appends made before that are dropped.
    pub fn spawn(rotation: RotationManager, runtime: &Handle) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = WriterTask {
            rotation,
            file: None,
        };
        let handle = runtime.spawn_blocking(move || task.run(rx));
        (EventWriter { tx }, handle)
    }

    /// Queue `delta` for appending as one JSON line.
    ///
    /// Failures (serialization, disk) are logged by the writer task and only
    /// lose this one delta.
    pub fn write(&self, delta: Delta) {
        if self.tx.send(Command::Append(delta)).is_err() {
            log::debug!("writer closed, dropping delta");
        }
    }

    /// Rotate after every delta queued so far has been written.
    pub async fn rotate(&self, at: DateTime<Utc>, compress_previous: bool) -> Result<PathBuf> {
        let (done, rx) = oneshot::channel();
        self.tx
            .send(Command::Rotate {
                at,
                compress_previous,
                done,
            })
            .map_err(|_| Error::NotRunning)?;
        rx.await.map_err(|_| Error::NotRunning)?
    }

    /// Wait until every delta queued so far is written and synced.
    pub async fn flush(&self) -> Result<()> {
        self.barrier().await.map(|_| ())
    }

    /// The file appends currently go to.
    pub async fn current_file(&self) -> Result<Option<PathBuf>> {
        self.barrier().await
    }

    /// Ask the task to exit once it has drained what is already queued.
    pub(crate) fn close(&self) {
        let _ = self.tx.send(Command::Close);
    }

    async fn barrier(&self) -> Result<Option<PathBuf>> {
        let (done, rx) = oneshot::channel();
        self.tx
            .send(Command::Flush(done))
            .map_err(|_| Error::NotRunning)?;
        rx.await.map_err(|_| Error::NotRunning)
    }
}

struct WriterTask {
    rotation: RotationManager,
    file: Option<File>,
}

impl WriterTask {
    fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = rx.blocking_recv() {
            match command {
                Command::Append(delta) => {
                    if let Err(e) = self.append(&delta) {
                        log::warn!("dropping delta: {e}");
                    }
                }
                Command::Rotate {
                    at,
                    compress_previous,
                    done,
                } => {
                    self.close_file();
                    let result = self.rotation.rotate(at, compress_previous);
                    if let Err(e) = &result {
                        log::error!("rotation failed, still writing to the previous file: {e}");
                    }
                    let _ = done.send(result);
                }
                Command::Flush(done) => {
                    self.sync_file();
                    let _ = done.send(self.rotation.current().map(PathBuf::from));
                }
                Command::Close => break,
            }
        }
        self.close_file();
        log::debug!("writer task finished");
    }

    fn append(&mut self, delta: &Delta) -> Result<()> {
        let mut line = serde_json::to_vec(delta)?;
        line.push(b'\n');

        let path = self.rotation.current().ok_or(Error::NotRunning)?;
        let mut file = match self.file.take() {
            Some(file) => file,
            None => OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| Error::Write {
                    path: path.to_path_buf(),
                    source,
                })?,
        };

        // One write_all per record so a line is never interleaved. On failure
        // the handle is dropped and reopened by the next append.
        file.write_all(&line).map_err(|source| Error::Write {
            path: path.to_path_buf(),
            source,
        })?;
        self.file = Some(file);
        Ok(())
    }

    fn sync_file(&mut self) {
        if let Some(file) = &mut self.file {
            if let Err(e) = file.flush().and_then(|()| file.sync_data()) {
                log::warn!("failed to sync log file: {e}");
            }
        }
    }

    fn close_file(&mut self) {
        self.sync_file();
        self.file = None;
    }
}
