use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

/// A structured update event received from the host.
///
/// The logger never interprets the payload: a `Delta` is serialized as-is,
/// one JSON object per line. The wrapper is `#[serde(transparent)]`, so what
/// lands in the log is exactly the value the host delivered.
///
/// Deltas follow the Signal K shape: an optional `context` and a list of
/// `updates`, each carrying `values` of `{path, value}` pairs. The accessors
/// below read that shape when it is present and return nothing when it isn't;
/// a delta that doesn't look like Signal K is still logged verbatim.
///
/// # Examples
///
/// ```
/// use sk_delta_log::Delta;
/// use serde_json::json;
///
/// let delta = Delta::new("vessels.self")
///     .with_value("navigation.speedOverGround", json!(3.85))
///     .with_value("navigation.courseOverGroundTrue", json!(1.52));
///
/// assert_eq!(delta.context(), Some("vessels.self"));
/// let paths: Vec<_> = delta.paths().collect();
/// assert_eq!(
///     paths,
///     ["navigation.speedOverGround", "navigation.courseOverGroundTrue"]
/// );
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct Delta(Value);

impl Delta {
    /// Create an empty delta for the given context.
    ///
    /// Use [`Delta::with_value`] to add values; the first call opens an
    /// update stamped with the current time.
    pub fn new(context: impl Into<String>) -> Self {
        Delta(json!({
            "context": context.into(),
            "updates": [],
        }))
    }

    /// Start a new update group, stamped with the current time.
    ///
    /// Subsequent [`Delta::with_value`] calls add to this group.
    ///
    /// # Examples
    ///
    /// ```
    /// use sk_delta_log::Delta;
    /// use serde_json::json;
    ///
    /// let delta = Delta::new("vessels.self")
    ///     .with_value("navigation.speedOverGround", json!(3.85))
    ///     .with_update()
    ///     .with_value("electrical.batteries.house.voltage", json!(12.7));
    /// assert_eq!(delta.as_value()["updates"].as_array().unwrap().len(), 2);
    /// ```
    pub fn with_update(mut self) -> Self {
        if let Some(updates) = self.updates_mut() {
            updates.push(json!({
                "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
                "values": [],
            }));
        }
        self
    }

    /// Append a `{path, value}` pair to the most recent update group.
    pub fn with_value(mut self, path: &str, value: Value) -> Self {
        let needs_update = self
            .0
            .get("updates")
            .and_then(Value::as_array)
            .is_none_or(|updates| updates.is_empty());
        if needs_update {
            self = self.with_update();
        }
        let values = self
            .updates_mut()
            .and_then(|updates| updates.last_mut())
            .and_then(|update| update.get_mut("values"))
            .and_then(Value::as_array_mut);
        if let Some(values) = values {
            values.push(json!({ "path": path, "value": value }));
        }
        self
    }

    /// The delta's `context`, if it carries one.
    pub fn context(&self) -> Option<&str> {
        self.0.get("context").and_then(Value::as_str)
    }

    /// Every `updates[].values[].path` in delivery order.
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.updates()
            .iter()
            .filter_map(|update| update.get("values").and_then(Value::as_array))
            .flatten()
            .filter_map(|entry| entry.get("path").and_then(Value::as_str))
    }

    /// Borrow the raw JSON value.
    pub fn as_value(&self) -> &Value {
        &self.0
    }

    /// Consume the delta and return the raw JSON value.
    pub fn into_value(self) -> Value {
        self.0
    }

    /// Copy of this delta keeping only the values whose path `keep` accepts.
    ///
    /// Updates left without values are dropped. Returns `None` when nothing
    /// survives. All other fields are carried over unchanged, so when every
    /// value is kept the result equals `self`.
    pub(crate) fn retain_values(&self, mut keep: impl FnMut(&str) -> bool) -> Option<Delta> {
        let Some(updates) = self.0.get("updates").and_then(Value::as_array) else {
            return None;
        };

        let mut kept_updates = Vec::with_capacity(updates.len());
        for update in updates {
            let Some(values) = update.get("values").and_then(Value::as_array) else {
                continue;
            };
            let kept: Vec<Value> = values
                .iter()
                .filter(|entry| {
                    entry
                        .get("path")
                        .and_then(Value::as_str)
                        .is_some_and(&mut keep)
                })
                .cloned()
                .collect();
            if kept.is_empty() {
                continue;
            }
            let mut update = update.clone();
            update["values"] = Value::Array(kept);
            kept_updates.push(update);
        }

        if kept_updates.is_empty() {
            return None;
        }

        let mut out: Map<String, Value> = self.0.as_object()?.clone();
        out.insert("updates".to_string(), Value::Array(kept_updates));
        Some(Delta(Value::Object(out)))
    }

    fn updates(&self) -> &[Value] {
        self.0
            .get("updates")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    fn updates_mut(&mut self) -> Option<&mut Vec<Value>> {
        self.0.get_mut("updates").and_then(Value::as_array_mut)
    }
}

impl From<Value> for Delta {
    fn from(value: Value) -> Self {
        Delta(value)
    }
}
