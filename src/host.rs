//! The seam between the logger and the application that feeds it.

use crate::delta::Delta;
use crate::subscription::SubscriptionSpec;
use std::fmt;
use std::sync::Arc;

/// Callback receiving deltas from the host.
pub type DeltaHandler = Arc<dyn Fn(Delta) + Send + Sync>;

/// Callback receiving subscription errors from the host.
pub type ErrorHandler = Arc<dyn Fn(String) + Send + Sync>;

/// Cancellation token for a handler installed on the host.
///
/// Cancelling is explicit: dropping a handle leaves the handler installed.
/// [`SubscriptionFilter`](crate::SubscriptionFilter) owns the handles it
/// receives and cancels all of them on deactivation or drop.
pub struct SubscriptionHandle {
    cancel: Box<dyn FnOnce() + Send>,
}

impl SubscriptionHandle {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        SubscriptionHandle {
            cancel: Box::new(cancel),
        }
    }

    /// Remove the handler from the host.
    pub fn cancel(self) {
        (self.cancel)()
    }
}

impl fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionHandle").finish_non_exhaustive()
    }
}

/// What the logger needs from its host application.
///
/// [`DeltaBus`](crate::DeltaBus) is an in-process implementation.
pub trait Host: Send + Sync {
    /// Install `handler` on the raw delta stream: every delta, unfiltered and
    /// unthrottled.
    fn on_delta(&self, handler: DeltaHandler) -> SubscriptionHandle;

    /// Ask the host's subscription manager for the paths in `spec`.
    ///
    /// The host matches paths, applies each item's sampling period and calls
    /// `on_delta` with the surviving values. Problems are reported through
    /// `on_error`.
    fn subscribe(
        &self,
        spec: &SubscriptionSpec,
        on_error: ErrorHandler,
        on_delta: DeltaHandler,
    ) -> Vec<SubscriptionHandle>;

    /// Report normal operating status.
    fn set_status(&self, message: &str) {
        log::info!("{message}");
    }

    /// Report a problem that stopped the logger from running.
    fn set_error(&self, message: &str) {
        log::error!("{message}");
    }
}
