mod bus;
mod compress;
mod config;
mod delta;
mod error;
mod host;
mod lifecycle;
mod rotation;
mod subscription;
mod writer;

pub use bus::DeltaBus;
pub use compress::{CompressionObserver, CompressionOutcome, Compressor, SubmittedFiles};
pub use config::{Compression, LockMode, LoggerConfig, LoggerConfigBuilder};
pub use delta::Delta;
pub use error::{Error, Result};
pub use host::{DeltaHandler, ErrorHandler, Host, SubscriptionHandle};
pub use lifecycle::{DeltaLogger, LOCK_FILE, LifecycleController, LifecycleState};
pub use rotation::{LOG_FILE_PREFIX, LOG_FILE_SUFFIX, MARKER_FILE, RotationManager, log_file_name};
pub use subscription::{
    FilterMode, SubscriptionFilter, SubscriptionItem, SubscriptionSpec, build_subscription,
};
pub use writer::EventWriter;
