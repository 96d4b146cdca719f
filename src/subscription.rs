//! Selective subscription: which deltas get logged, and how often.

use crate::host::{DeltaHandler, ErrorHandler, Host, SubscriptionHandle};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// One `{path, period}` entry: log values under `path` (wildcards allowed)
/// at most once every `period` milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionItem {
    pub path: String,
    #[serde(default)]
    pub period: u64,
}

impl SubscriptionItem {
    pub fn new(path: impl Into<String>, period_ms: u64) -> Self {
        SubscriptionItem {
            path: path.into(),
            period: period_ms,
        }
    }
}

/// Descriptor handed to the host's subscription manager.
///
/// Serializes as a Signal K subscribe message:
///
/// ```text
/// {"context": "vessels.self", "subscribe": [{"path": "navigation.*", "period": 1000}]}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionSpec {
    pub context: String,
    #[serde(rename = "subscribe")]
    pub items: Vec<SubscriptionItem>,
}

impl SubscriptionSpec {
    /// An empty spec means "log everything": the fallback path.
    pub fn is_unfiltered(&self) -> bool {
        self.items.is_empty()
    }
}

/// Build the subscription descriptor from configuration.
///
/// Items keep their configured order. A path listed more than once keeps its
/// first entry; later duplicates are dropped with a warning.
///
/// # Examples
///
/// ```
/// use sk_delta_log::{build_subscription, SubscriptionItem};
///
/// let spec = build_subscription(
///     "vessels.self",
///     &[
///         SubscriptionItem::new("navigation.*", 1000),
///         SubscriptionItem::new("navigation.*", 50),
///     ],
/// );
/// assert_eq!(spec.items, vec![SubscriptionItem::new("navigation.*", 1000)]);
/// ```
pub fn build_subscription(context: &str, items: &[SubscriptionItem]) -> SubscriptionSpec {
    let mut seen = HashSet::new();
    let mut unique = Vec::with_capacity(items.len());
    for item in items {
        if seen.insert(item.path.as_str()) {
            unique.push(item.clone());
        } else {
            log::warn!(
                "ignoring duplicate subscription for '{}' (period {}ms)",
                item.path,
                item.period
            );
        }
    }
    SubscriptionSpec {
        context: context.to_string(),
        items: unique,
    }
}

/// How a [`SubscriptionFilter`] is attached to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterMode {
    /// Attached to the host's subscription manager with a path list.
    Subscribed,
    /// Attached to the raw delta stream; every delta, no throttling.
    Fallback,
}

/// Owner of the handles installed on the host for one session.
///
/// All handles are cancelled by [`SubscriptionFilter::deactivate`] or, failing
/// that, when the filter is dropped, so a restarted session never inherits
/// live handlers from the previous one.
#[derive(Debug)]
pub struct SubscriptionFilter {
    mode: FilterMode,
    handles: Vec<SubscriptionHandle>,
}

impl SubscriptionFilter {
    /// Attach `on_delta` to the host according to `spec`.
    ///
    /// With items, the host's subscription manager does the matching and the
    /// rate limiting. Without items, `on_delta` goes straight onto the raw
    /// delta stream.
    pub fn activate(
        host: &dyn Host,
        spec: &SubscriptionSpec,
        on_delta: DeltaHandler,
        on_error: ErrorHandler,
    ) -> Self {
        if spec.is_unfiltered() {
            log::info!("no paths configured, logging all deltas");
            let handle = host.on_delta(on_delta);
            return SubscriptionFilter {
                mode: FilterMode::Fallback,
                handles: vec![handle],
            };
        }

        log::info!(
            "subscribing to {} path(s) in context '{}'",
            spec.items.len(),
            spec.context
        );
        let handles = host.subscribe(spec, on_error, on_delta);
        SubscriptionFilter {
            mode: FilterMode::Subscribed,
            handles,
        }
    }

    pub fn mode(&self) -> FilterMode {
        self.mode
    }

    /// Number of handles still installed on the host.
    pub fn active_handles(&self) -> usize {
        self.handles.len()
    }

    /// Cancel every handle. Idempotent.
    pub fn deactivate(&mut self) {
        let n = self.handles.len();
        for handle in self.handles.drain(..) {
            handle.cancel();
        }
        if n > 0 {
            log::debug!("cancelled {n} subscription handle(s)");
        }
    }
}

impl Drop for SubscriptionFilter {
    fn drop(&mut self) {
        self.deactivate();
    }
}
