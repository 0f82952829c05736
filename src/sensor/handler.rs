//! Observer bookkeeping shared by every sensor handler
//!
//! A handler owns the observer set for one sensor and the per-observer
//! sampling demands. Observers are kept in registration order and fan-out
//! preserves that order. Demands aggregate by minimum: the sensor runs fast
//! enough for its most demanding observer.
//!
//! ## Aggregation rules
//!
//! - Interval: minimum over non-zero requests, clamped to
//!   `[min_interval, MAX_INTERVAL_MS]`. Zero means "no preference".
//! - Batch latency: minimum over non-zero requests, unclamped.
//! - Re-applying an unchanged aggregate is suppressed.

use crate::error::Result;
use crate::sensor::data::SensorData;
use crate::sensor::info::SensorInfo;
use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

/// Upper clamp for the applied sampling interval in milliseconds
pub const MAX_INTERVAL_MS: i32 = 255_000;

/// Identifies one observer within the whole process
pub type ObserverId = u32;

/// How handlers are shared between the registry, the dispatcher, and the
/// fusion fan-out path
pub type SharedHandler = Arc<parking_lot::Mutex<dyn SensorHandler>>;

static NEXT_OBSERVER_ID: AtomicU32 = AtomicU32::new(1);

/// Fresh process-unique observer id
pub fn next_observer_id() -> ObserverId {
    NEXT_OBSERVER_ID.fetch_add(1, Ordering::Relaxed)
}

/// Verdict an observer returns from each delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObserverAction {
    /// Keep delivering
    Continue,
    /// The observer is dead; remove it from the fan-out set
    Drop,
}

/// Consumer of one sensor's event stream
pub trait SensorObserver: Send + Sync {
    fn id(&self) -> ObserverId;

    /// Deliver one sample; returning [`ObserverAction::Drop`] removes the
    /// observer during the current fan-out
    fn update(&self, uri: &str, data: &SensorData) -> ObserverAction;

    /// The stream's reported accuracy changed between samples
    fn on_accuracy(&self, _uri: &str, _timestamp: u64, _accuracy: i32) {}

    /// An integer attribute changed through another observer
    fn on_attribute_int(&self, _uri: &str, _attribute: i32, _value: i32) {}

    /// A string attribute changed through another observer
    fn on_attribute_str(&self, _uri: &str, _attribute: i32, _value: &[u8]) {}
}

/// Uniform operations over any sensor variant.
///
/// Mutating operations run only on the server reactor thread; the mutex
/// around each handler exists for the fusion fan-out path, which crosses
/// handler boundaries along acyclic dependency edges.
pub trait SensorHandler: Send {
    fn info(&self) -> &SensorInfo;

    /// Attach an observer and power the sensor up on the first one
    fn start(&mut self, observer: Arc<dyn SensorObserver>) -> Result<()>;

    /// Detach an observer, drop its demands, re-aggregate, and power the
    /// sensor down when none remain
    fn stop(&mut self, observer_id: ObserverId) -> Result<()>;

    /// Record one observer's interval demand (0 clears it) and apply the
    /// new aggregate
    fn set_interval(&mut self, observer_id: ObserverId, interval_ms: i32) -> Result<()>;

    /// Record one observer's batch latency demand (0 clears it)
    fn set_batch_latency(&mut self, observer_id: ObserverId, latency_ms: i32) -> Result<()>;

    /// Last-write-wins integer attribute; `Ok(true)` when the stored value
    /// changed and other observers should hear about it
    fn set_attribute_int(
        &mut self,
        observer_id: ObserverId,
        attribute: i32,
        value: i32,
    ) -> Result<bool>;

    /// Last-write-wins string attribute, change-detected bytewise
    fn set_attribute_str(
        &mut self,
        observer_id: ObserverId,
        attribute: i32,
        value: &[u8],
    ) -> Result<bool>;

    fn get_attribute_int(&self, attribute: i32) -> Result<i32>;

    fn get_attribute_str(&self, attribute: i32) -> Result<Vec<u8>>;

    /// Most recent sample, from cache when the stream already produced one
    fn get_data(&mut self) -> Result<SensorData>;

    /// Force out any batched samples
    fn flush(&mut self, observer_id: ObserverId) -> Result<()>;

    fn observer_count(&self) -> usize;

    /// True while `observer_id` is attached. Fan-out may shed an observer
    /// between its owner's calls, so owners check before assuming.
    fn has_observer(&self, observer_id: ObserverId) -> bool;

    /// Tell every observer except `exclude` that an integer attribute changed
    fn broadcast_attribute_int(&self, exclude: ObserverId, attribute: i32, value: i32);

    /// Tell every observer except `exclude` that a string attribute changed
    fn broadcast_attribute_str(&self, exclude: ObserverId, attribute: i32, value: &[u8]);

    /// Readable fd driving this sensor, for reactor registration
    fn poll_fd(&self) -> Option<RawFd> {
        None
    }

    /// Drain the device after `poll_fd` signalled readability and fan the
    /// samples out
    fn dispatch_events(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Shared observer/demand bookkeeping embedded in each handler variant
pub struct HandlerBase {
    observers: Vec<Arc<dyn SensorObserver>>,
    intervals: HashMap<ObserverId, i32>,
    latencies: HashMap<ObserverId, i32>,
    applied_interval: Option<i32>,
    applied_latency: Option<i32>,
    attrs_int: HashMap<i32, i32>,
    attrs_str: HashMap<i32, Vec<u8>>,
    last_data: Option<SensorData>,
    last_accuracy: Option<i32>,
}

impl HandlerBase {
    pub fn new() -> Self {
        Self {
            observers: Vec::new(),
            intervals: HashMap::new(),
            latencies: HashMap::new(),
            applied_interval: None,
            applied_latency: None,
            attrs_int: HashMap::new(),
            attrs_str: HashMap::new(),
            last_data: None,
            last_accuracy: None,
        }
    }

    /// Attach an observer. Attaching the same id twice is a caller bug and
    /// fails rather than silently duplicating fan-out.
    pub fn add_observer(&mut self, observer: Arc<dyn SensorObserver>) -> Result<()> {
        let id = observer.id();
        if self.observers.iter().any(|o| o.id() == id) {
            return Err(crate::error::Error::InvalidParameter(format!(
                "observer {id} already attached"
            )));
        }
        self.observers.push(observer);
        Ok(())
    }

    /// Detach an observer and its demands; true when it was attached
    pub fn remove_observer(&mut self, id: ObserverId) -> bool {
        let before = self.observers.len();
        self.observers.retain(|o| o.id() != id);
        self.intervals.remove(&id);
        self.latencies.remove(&id);
        self.observers.len() != before
    }

    pub fn has_observer(&self, id: ObserverId) -> bool {
        self.observers.iter().any(|o| o.id() == id)
    }

    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    /// Record one observer's interval demand; zero clears it
    pub fn record_interval(&mut self, id: ObserverId, interval_ms: i32) {
        if interval_ms == 0 {
            self.intervals.remove(&id);
        } else {
            self.intervals.insert(id, interval_ms);
        }
    }

    /// Record one observer's batch latency demand; zero clears it
    pub fn record_latency(&mut self, id: ObserverId, latency_ms: i32) {
        if latency_ms == 0 {
            self.latencies.remove(&id);
        } else {
            self.latencies.insert(id, latency_ms);
        }
    }

    /// Minimum non-zero interval demand clamped to the device's range, or
    /// `None` when no observer has a preference
    pub fn aggregate_interval(&self, min_interval: i32) -> Option<i32> {
        let floor = min_interval.max(1);
        self.intervals
            .values()
            .copied()
            .filter(|v| *v > 0)
            .min()
            .map(|v| v.clamp(floor, MAX_INTERVAL_MS))
    }

    /// Minimum non-zero batch latency demand, unclamped
    pub fn aggregate_latency(&self) -> Option<i32> {
        self.latencies.values().copied().filter(|v| *v > 0).min()
    }

    /// True when `interval` differs from the last applied value; records it
    pub fn interval_needs_apply(&mut self, interval: i32) -> bool {
        if self.applied_interval == Some(interval) {
            return false;
        }
        self.applied_interval = Some(interval);
        true
    }

    /// True when `latency` differs from the last applied value; records it
    pub fn latency_needs_apply(&mut self, latency: i32) -> bool {
        if self.applied_latency == Some(latency) {
            return false;
        }
        self.applied_latency = Some(latency);
        true
    }

    /// Forget applied values when the sensor powers down
    pub fn clear_applied(&mut self) {
        self.applied_interval = None;
        self.applied_latency = None;
    }

    /// Store an integer attribute; true when the value changed
    pub fn set_attr_int(&mut self, attribute: i32, value: i32) -> bool {
        match self.attrs_int.insert(attribute, value) {
            Some(prev) => prev != value,
            None => true,
        }
    }

    /// Store a string attribute; true when the bytes changed
    pub fn set_attr_str(&mut self, attribute: i32, value: &[u8]) -> bool {
        match self.attrs_str.get(&attribute) {
            Some(prev) if prev.len() == value.len() && prev == value => false,
            _ => {
                self.attrs_str.insert(attribute, value.to_vec());
                true
            }
        }
    }

    pub fn get_attr_int(&self, attribute: i32) -> Option<i32> {
        self.attrs_int.get(&attribute).copied()
    }

    pub fn get_attr_str(&self, attribute: i32) -> Option<Vec<u8>> {
        self.attrs_str.get(&attribute).cloned()
    }

    pub fn last_data(&self) -> Option<SensorData> {
        self.last_data.clone()
    }

    pub fn cache_data(&mut self, data: SensorData) {
        self.last_data = Some(data);
    }

    /// Fan one sample out in registration order. Observers answering
    /// [`ObserverAction::Drop`] are removed and their ids returned so the
    /// caller can re-aggregate demands.
    ///
    /// When the sample's accuracy differs from the previous sample's, the
    /// surviving observers additionally hear `on_accuracy`. The first sample
    /// sets the baseline without an event.
    pub fn notify(&mut self, uri: &str, data: &SensorData) -> Vec<ObserverId> {
        self.last_data = Some(data.clone());
        let accuracy_changed = self
            .last_accuracy
            .is_some_and(|prev| prev != data.accuracy);
        self.last_accuracy = Some(data.accuracy);

        let mut dropped = Vec::new();
        self.observers.retain(|o| match o.update(uri, data) {
            ObserverAction::Continue => true,
            ObserverAction::Drop => {
                dropped.push(o.id());
                false
            }
        });
        for id in &dropped {
            self.intervals.remove(id);
            self.latencies.remove(id);
        }
        if accuracy_changed {
            for o in &self.observers {
                o.on_accuracy(uri, data.timestamp, data.accuracy);
            }
        }
        dropped
    }

    /// Attribute-change broadcast to everyone except the observer that set it
    pub fn broadcast_attr_int(&self, uri: &str, exclude: ObserverId, attribute: i32, value: i32) {
        for o in &self.observers {
            if o.id() != exclude {
                o.on_attribute_int(uri, attribute, value);
            }
        }
    }

    pub fn broadcast_attr_str(&self, uri: &str, exclude: ObserverId, attribute: i32, value: &[u8]) {
        for o in &self.observers {
            if o.id() != exclude {
                o.on_attribute_str(uri, attribute, value);
            }
        }
    }
}

impl Default for HandlerBase {
    fn default() -> Self {
        Self::new()
    }
}
