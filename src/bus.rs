//! In-process delta bus.
//!
//! [`DeltaBus`] implements [`Host`] without an external server: publishers
//! call [`DeltaBus::publish`], raw handlers see every delta, and subscriptions
//! get the values matching their context and path patterns, each path
//! rate-limited to its item's period. Useful for embedding the logger in a
//! standalone process and for exercising it end-to-end.

use crate::delta::Delta;
use crate::host::{DeltaHandler, ErrorHandler, Host, SubscriptionHandle};
use crate::subscription::SubscriptionSpec;
use regex::Regex;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

const SELF_ALIAS: &str = "vessels.self";

/// Compile a Signal K path pattern (`*` matches any run of characters,
/// including dots) into an anchored regex.
fn glob_regex(pattern: &str) -> Result<Regex, regex::Error> {
    let body = pattern
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");
    Regex::new(&format!("^{body}$"))
}

struct Item {
    pattern: Regex,
    period: Duration,
}

struct BusSubscription {
    id: u64,
    context: Regex,
    items: Vec<Item>,
    on_delta: DeltaHandler,
    // (item index, concrete path) -> last delivery
    last_sent: HashMap<(usize, String), Instant>,
}

impl BusSubscription {
    fn admit(&mut self, path: &str, now: Instant) -> bool {
        let mut admitted = false;
        for (idx, item) in self.items.iter().enumerate() {
            if !item.pattern.is_match(path) {
                continue;
            }
            let key = (idx, path.to_string());
            let due = self
                .last_sent
                .get(&key)
                .is_none_or(|last| now.duration_since(*last) >= item.period);
            if due {
                self.last_sent.insert(key, now);
                admitted = true;
            }
        }
        admitted
    }
}

#[derive(Default)]
struct BusInner {
    next_id: u64,
    raw: Vec<(u64, DeltaHandler)>,
    subscriptions: Vec<BusSubscription>,
    status: Option<String>,
    error: Option<String>,
}

impl BusInner {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

/// An in-process [`Host`].
///
/// # Examples
///
/// ```
/// use sk_delta_log::{Delta, DeltaBus, Host};
/// use serde_json::json;
/// use std::sync::{Arc, Mutex};
///
/// let bus = DeltaBus::new();
/// let seen = Arc::new(Mutex::new(Vec::new()));
/// let sink = seen.clone();
/// let handle = bus.on_delta(Arc::new(move |d: Delta| sink.lock().unwrap().push(d)));
///
/// bus.publish(Delta::new("vessels.self").with_value("navigation.speedOverGround", json!(4.1)));
/// handle.cancel();
/// bus.publish(Delta::new("vessels.self").with_value("navigation.speedOverGround", json!(4.2)));
///
/// assert_eq!(seen.lock().unwrap().len(), 1);
/// ```
#[derive(Clone)]
pub struct DeltaBus {
    self_context: String,
    inner: Arc<Mutex<BusInner>>,
}

impl Default for DeltaBus {
    fn default() -> Self {
        DeltaBus::new()
    }
}

impl std::fmt::Debug for DeltaBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("DeltaBus")
            .field("self_context", &self.self_context)
            .field("raw_handlers", &inner.raw.len())
            .field("subscriptions", &inner.subscriptions.len())
            .finish()
    }
}

impl DeltaBus {
    pub fn new() -> Self {
        DeltaBus {
            self_context: SELF_ALIAS.to_string(),
            inner: Arc::new(Mutex::new(BusInner::default())),
        }
    }

    /// Set the context of the local vessel, e.g.
    /// `"vessels.urn:mrn:imo:mmsi:230099999"`. Deltas in this context (or with
    /// no context at all) match subscriptions for `"vessels.self"`.
    pub fn with_self_context(mut self, context: impl Into<String>) -> Self {
        self.self_context = context.into();
        self
    }

    /// Deliver `delta` to every raw handler and every matching subscription.
    ///
    /// Handlers run on the caller's thread, after the bus lock is released.
    pub fn publish(&self, delta: Delta) {
        let now = Instant::now();
        let mut deliveries: Vec<(DeltaHandler, Delta)> = Vec::new();
        {
            let mut inner = self.lock();
            for (_, handler) in &inner.raw {
                deliveries.push((handler.clone(), delta.clone()));
            }

            let context = delta
                .context()
                .unwrap_or(self.self_context.as_str())
                .to_string();
            let is_self = context == self.self_context || context == SELF_ALIAS;
            for sub in &mut inner.subscriptions {
                let in_context = sub.context.is_match(&context)
                    || (is_self
                        && (sub.context.is_match(SELF_ALIAS)
                            || sub.context.is_match(&self.self_context)));
                if !in_context {
                    continue;
                }
                if let Some(filtered) = delta.retain_values(|path| sub.admit(path, now)) {
                    deliveries.push((sub.on_delta.clone(), filtered));
                }
            }
        }

        for (handler, delta) in deliveries {
            handler(delta);
        }
    }

    /// Number of raw handlers plus subscriptions currently installed.
    pub fn handler_count(&self) -> usize {
        let inner = self.lock();
        inner.raw.len() + inner.subscriptions.len()
    }

    /// Last message passed to [`Host::set_status`].
    pub fn status(&self) -> Option<String> {
        self.lock().status.clone()
    }

    /// Last message passed to [`Host::set_error`].
    pub fn last_error(&self) -> Option<String> {
        self.lock().error.clone()
    }

    fn lock(&self) -> MutexGuard<'_, BusInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn handle(&self, remove: fn(&mut BusInner, u64), id: u64) -> SubscriptionHandle {
        let weak: Weak<Mutex<BusInner>> = Arc::downgrade(&self.inner);
        SubscriptionHandle::new(move || {
            if let Some(inner) = weak.upgrade() {
                remove(&mut inner.lock().unwrap_or_else(PoisonError::into_inner), id);
            }
        })
    }
}

impl Host for DeltaBus {
    fn on_delta(&self, handler: DeltaHandler) -> SubscriptionHandle {
        let id = {
            let mut inner = self.lock();
            let id = inner.next_id();
            inner.raw.push((id, handler));
            id
        };
        self.handle(|inner, id| inner.raw.retain(|(h, _)| *h != id), id)
    }

    fn subscribe(
        &self,
        spec: &SubscriptionSpec,
        on_error: ErrorHandler,
        on_delta: DeltaHandler,
    ) -> Vec<SubscriptionHandle> {
        let context = match glob_regex(&spec.context) {
            Ok(re) => re,
            Err(e) => {
                on_error(format!("invalid context '{}': {e}", spec.context));
                return Vec::new();
            }
        };

        let mut items = Vec::with_capacity(spec.items.len());
        for item in &spec.items {
            if item.path.is_empty() {
                on_error("subscription item with an empty path".to_string());
                continue;
            }
            match glob_regex(&item.path) {
                Ok(pattern) => items.push(Item {
                    pattern,
                    period: Duration::from_millis(item.period),
                }),
                Err(e) => on_error(format!("invalid path '{}': {e}", item.path)),
            }
        }
        if items.is_empty() {
            return Vec::new();
        }

        let id = {
            let mut inner = self.lock();
            let id = inner.next_id();
            inner.subscriptions.push(BusSubscription {
                id,
                context,
                items,
                on_delta,
                last_sent: HashMap::new(),
            });
            id
        };
        vec![self.handle(|inner, id| inner.subscriptions.retain(|s| s.id != id), id)]
    }

    fn set_status(&self, message: &str) {
        log::info!("{message}");
        self.lock().status = Some(message.to_string());
    }

    fn set_error(&self, message: &str) {
        log::error!("{message}");
        self.lock().error = Some(message.to_string());
    }
}
