//! Handler for a synthesized (fusion) sensor
//!
//! A fusion sensor consumes the streams of other registered sensors and
//! emits a derived stream. The numeric algorithm lives behind the
//! `FusionSensor` trait; this module supplies the plumbing: subscribing to
//! the input handlers, feeding their samples into the algorithm, and
//! fanning derived samples out to the fusion sensor's own observers.
//!
//! Dependency edges always point at sensors registered earlier, so chains
//! of fusion sensors form a DAG and recursive fan-out terminates.

use crate::error::{Error, Result};
use crate::sensor::data::SensorData;
use crate::sensor::handler::{
    HandlerBase, ObserverAction, ObserverId, SensorHandler, SensorObserver, SharedHandler,
    next_observer_id,
};
use crate::sensor::info::SensorInfo;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};

/// Verdict of feeding one input sample into the algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FusionUpdate {
    /// More input needed before a derived sample exists
    Pending,
    /// A derived sample is ready for `get_data`
    Ready,
}

/// A fusion algorithm: identity, declared inputs, and the update/get cycle
pub trait FusionSensor: Send {
    fn info(&self) -> &SensorInfo;

    /// URIs of the sensors this algorithm consumes, matched by suffix
    /// against the registry
    fn required_sensors(&self) -> Vec<String>;

    /// Feed one input sample. Samples from URIs the algorithm does not
    /// recognize must be ignored (answer `Pending`).
    fn update(&mut self, uri: &str, data: &SensorData) -> FusionUpdate;

    /// Current derived sample; called after `update` answered `Ready`, and
    /// on demand for `get_data` requests
    fn get_data(&mut self) -> Result<SensorData>;
}

pub struct FusionSensorHandler {
    fusion: Box<dyn FusionSensor>,
    base: HandlerBase,
    inputs: Vec<FusionInput>,
    adapter_id: ObserverId,
    self_weak: Weak<Mutex<FusionSensorHandler>>,
    propagated_interval: Option<i32>,
    propagated_latency: Option<i32>,
}

/// One input edge. The URI is cached at construction so fan-out paths can
/// identify an input without taking its lock.
struct FusionInput {
    uri: String,
    handler: SharedHandler,
}

/// Observer planted on each input handler, forwarding into the fusion
struct FusionInputObserver {
    id: ObserverId,
    handler: Weak<Mutex<FusionSensorHandler>>,
}

impl SensorObserver for FusionInputObserver {
    fn id(&self) -> ObserverId {
        self.id
    }

    fn update(&self, uri: &str, data: &SensorData) -> ObserverAction {
        match self.handler.upgrade() {
            Some(handler) => {
                handler.lock().on_input(uri, data);
                ObserverAction::Continue
            }
            None => ObserverAction::Drop,
        }
    }
}

impl FusionSensorHandler {
    /// Build the handler and hand back the shared reference the registry
    /// stores. The self-weak inside is what input observers hold, so the
    /// handler disappears from input fan-out once the registry drops it.
    pub fn new(
        fusion: Box<dyn FusionSensor>,
        inputs: Vec<SharedHandler>,
    ) -> Arc<Mutex<FusionSensorHandler>> {
        let inputs = inputs
            .into_iter()
            .map(|handler| {
                let uri = handler.lock().info().uri.clone();
                FusionInput { uri, handler }
            })
            .collect();
        let handler = Arc::new(Mutex::new(FusionSensorHandler {
            fusion,
            base: HandlerBase::new(),
            inputs,
            adapter_id: next_observer_id(),
            self_weak: Weak::new(),
            propagated_interval: None,
            propagated_latency: None,
        }));
        handler.lock().self_weak = Arc::downgrade(&handler);
        handler
    }

    /// Feed one sample from an input stream. A `Ready` verdict pulls the
    /// derived sample and fans it out recursively.
    ///
    /// This runs inside the delivering input's own fan-out, with that
    /// input's lock held up the stack, so nothing here may take the lock of
    /// the input behind `uri`. Demand re-propagation after a dead-observer
    /// drop therefore skips the delivering input; it keeps its previous
    /// (faster or equal) demand until the next demand change or stop.
    /// Powering inputs down likewise waits for the explicit stop path.
    pub fn on_input(&mut self, uri: &str, data: &SensorData) {
        if self.fusion.update(uri, data) != FusionUpdate::Ready {
            return;
        }
        let derived = match self.fusion.get_data() {
            Ok(d) => d,
            Err(e) => {
                log::warn!("{}: get_data after update failed: {}", self.uri(), e);
                return;
            }
        };
        let own_uri = self.uri().to_string();
        let dropped = self.base.notify(&own_uri, &derived);
        if !dropped.is_empty() {
            log::debug!("{}: dropped {} dead observer(s)", own_uri, dropped.len());
            self.propagate_interval_skipping(Some(uri));
            self.propagate_latency_skipping(Some(uri));
        }
    }

    fn uri(&self) -> &str {
        &self.fusion.info().uri
    }

    fn start_inputs(&mut self) -> Result<()> {
        for (idx, input) in self.inputs.iter().enumerate() {
            let observer = Arc::new(FusionInputObserver {
                id: self.adapter_id,
                handler: self.self_weak.clone(),
            });
            if let Err(e) = input.handler.lock().start(observer) {
                for started in &self.inputs[..idx] {
                    let _ = started.handler.lock().stop(self.adapter_id);
                }
                return Err(e);
            }
        }
        Ok(())
    }

    fn stop_inputs(&mut self) {
        for input in &self.inputs {
            if let Err(e) = input.handler.lock().stop(self.adapter_id) {
                log::warn!("{}: input stop failed: {}", self.fusion.info().uri, e);
            }
        }
        self.propagated_interval = None;
        self.propagated_latency = None;
    }

    fn propagate_interval(&mut self) {
        self.propagate_interval_skipping(None);
    }

    fn propagate_latency(&mut self) {
        self.propagate_latency_skipping(None);
    }

    /// Push the aggregate interval down to every input except `skip`, the
    /// input whose fan-out is currently on the stack (its lock is held and
    /// must not be retaken). A later demand change re-pushes to all inputs.
    fn propagate_interval_skipping(&mut self, skip: Option<&str>) {
        let target = self.base.aggregate_interval(self.fusion.info().min_interval);
        if self.propagated_interval == target {
            return;
        }
        self.propagated_interval = target;
        let value = target.unwrap_or(0);
        for input in &self.inputs {
            if skip == Some(input.uri.as_str()) {
                continue;
            }
            if let Err(e) = input.handler.lock().set_interval(self.adapter_id, value) {
                log::warn!("{}: interval propagation failed: {}", self.fusion.info().uri, e);
            }
        }
    }

    fn propagate_latency_skipping(&mut self, skip: Option<&str>) {
        let target = self.base.aggregate_latency();
        if self.propagated_latency == target {
            return;
        }
        self.propagated_latency = target;
        let value = target.unwrap_or(0);
        for input in &self.inputs {
            if skip == Some(input.uri.as_str()) {
                continue;
            }
            if let Err(e) = input.handler.lock().set_batch_latency(self.adapter_id, value) {
                log::warn!("{}: latency propagation failed: {}", self.fusion.info().uri, e);
            }
        }
    }
}

impl SensorHandler for FusionSensorHandler {
    fn info(&self) -> &SensorInfo {
        self.fusion.info()
    }

    fn start(&mut self, observer: Arc<dyn SensorObserver>) -> Result<()> {
        let id = observer.id();
        self.base.add_observer(observer)?;
        if self.base.observer_count() == 1
            && let Err(e) = self.start_inputs()
        {
            // roll the attach back so a retry starts clean
            self.base.remove_observer(id);
            return Err(e);
        }
        self.propagate_interval();
        self.propagate_latency();
        Ok(())
    }

    fn stop(&mut self, observer_id: ObserverId) -> Result<()> {
        if !self.base.remove_observer(observer_id) {
            return Err(Error::InvalidParameter(format!(
                "observer {observer_id} not attached to {}",
                self.fusion.info().uri
            )));
        }
        if self.base.observer_count() == 0 {
            self.stop_inputs();
        } else {
            self.propagate_interval();
            self.propagate_latency();
        }
        Ok(())
    }

    fn set_interval(&mut self, observer_id: ObserverId, interval_ms: i32) -> Result<()> {
        if interval_ms < 0 {
            return Err(Error::InvalidParameter(format!(
                "negative interval {interval_ms}"
            )));
        }
        self.base.record_interval(observer_id, interval_ms);
        self.propagate_interval();
        Ok(())
    }

    fn set_batch_latency(&mut self, observer_id: ObserverId, latency_ms: i32) -> Result<()> {
        if latency_ms < 0 {
            return Err(Error::InvalidParameter(format!(
                "negative batch latency {latency_ms}"
            )));
        }
        self.base.record_latency(observer_id, latency_ms);
        self.propagate_latency();
        Ok(())
    }

    fn set_attribute_int(
        &mut self,
        _observer_id: ObserverId,
        attribute: i32,
        value: i32,
    ) -> Result<bool> {
        Ok(self.base.set_attr_int(attribute, value))
    }

    fn set_attribute_str(
        &mut self,
        _observer_id: ObserverId,
        attribute: i32,
        value: &[u8],
    ) -> Result<bool> {
        Ok(self.base.set_attr_str(attribute, value))
    }

    fn get_attribute_int(&self, attribute: i32) -> Result<i32> {
        self.base
            .get_attr_int(attribute)
            .ok_or_else(|| Error::InvalidParameter(format!("attribute {attribute} never set")))
    }

    fn get_attribute_str(&self, attribute: i32) -> Result<Vec<u8>> {
        self.base
            .get_attr_str(attribute)
            .ok_or_else(|| Error::InvalidParameter(format!("attribute {attribute} never set")))
    }

    fn get_data(&mut self) -> Result<SensorData> {
        if let Some(data) = self.base.last_data() {
            return Ok(data);
        }
        let data = self.fusion.get_data()?;
        self.base.cache_data(data.clone());
        Ok(data)
    }

    fn flush(&mut self, observer_id: ObserverId) -> Result<()> {
        for input in &self.inputs {
            input.handler.lock().flush(self.adapter_id)?;
        }
        let _ = observer_id;
        Ok(())
    }

    fn observer_count(&self) -> usize {
        self.base.observer_count()
    }

    fn has_observer(&self, observer_id: ObserverId) -> bool {
        self.base.has_observer(observer_id)
    }

    fn broadcast_attribute_int(&self, exclude: ObserverId, attribute: i32, value: i32) {
        self.base
            .broadcast_attr_int(&self.fusion.info().uri, exclude, attribute, value);
    }

    fn broadcast_attribute_str(&self, exclude: ObserverId, attribute: i32, value: &[u8]) {
        self.base
            .broadcast_attr_str(&self.fusion.info().uri, exclude, attribute, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensor::data::ACCURACY_GOOD;
    use crate::sensor::device::{Policy, SensorDevice};
    use crate::sensor::info::SensorType;
    use crate::sensor::physical::PhysicalSensorHandler;

    fn make_info(sensor_type: SensorType, uri: &str, min_interval: i32) -> SensorInfo {
        SensorInfo {
            sensor_type,
            uri: uri.into(),
            model: "test".into(),
            vendor: "test".into(),
            min_range: -100.0,
            max_range: 100.0,
            resolution: 0.01,
            min_interval,
            max_batch_count: 0,
            wakeup_supported: false,
            privilege: String::new(),
        }
    }

    struct StaticDevice {
        info: SensorInfo,
        intervals: Arc<Mutex<Vec<i32>>>,
        pending: Arc<Mutex<Vec<SensorData>>>,
    }

    impl SensorDevice for StaticDevice {
        fn info(&self) -> &SensorInfo {
            &self.info
        }

        fn on_interval(&mut self, interval_ms: i32) -> Result<Policy> {
            self.intervals.lock().push(interval_ms);
            Ok(Policy::Handled)
        }

        fn get_data(&mut self) -> Result<SensorData> {
            Ok(SensorData::now(vec![0.0]))
        }

        fn read_events(&mut self) -> Result<Vec<SensorData>> {
            Ok(std::mem::take(&mut *self.pending.lock()))
        }
    }

    /// Pairs one accelerometer sample with one gyroscope sample
    struct PairingFusion {
        info: SensorInfo,
        accel_uri: String,
        gyro_uri: String,
        accel: Option<SensorData>,
        gyro: Option<SensorData>,
        emitted: usize,
    }

    impl FusionSensor for PairingFusion {
        fn info(&self) -> &SensorInfo {
            &self.info
        }

        fn required_sensors(&self) -> Vec<String> {
            vec![self.accel_uri.clone(), self.gyro_uri.clone()]
        }

        fn update(&mut self, uri: &str, data: &SensorData) -> FusionUpdate {
            if uri == self.accel_uri {
                self.accel = Some(data.clone());
            } else if uri == self.gyro_uri {
                self.gyro = Some(data.clone());
            } else {
                return FusionUpdate::Pending;
            }
            if self.accel.is_some() && self.gyro.is_some() {
                FusionUpdate::Ready
            } else {
                FusionUpdate::Pending
            }
        }

        fn get_data(&mut self) -> Result<SensorData> {
            let a = self.accel.take().ok_or(Error::NoData)?;
            let g = self.gyro.take().ok_or(Error::NoData)?;
            self.emitted += 1;
            let mut values = a.values;
            values.extend(g.values);
            Ok(SensorData {
                timestamp: a.timestamp.max(g.timestamp),
                accuracy: ACCURACY_GOOD,
                values,
            })
        }
    }

    struct CollectingObserver {
        id: ObserverId,
        seen: Mutex<Vec<SensorData>>,
    }

    impl SensorObserver for CollectingObserver {
        fn id(&self) -> ObserverId {
            self.id
        }

        fn update(&self, _uri: &str, data: &SensorData) -> ObserverAction {
            self.seen.lock().push(data.clone());
            ObserverAction::Continue
        }
    }

    const ACCEL: &str = "http://example.org/sensor/general/accelerometer/test";
    const GYRO: &str = "http://example.org/sensor/general/gyroscope/test";
    const ROTATION: &str = "http://example.org/sensor/general/rotation_vector/test";

    fn build() -> (
        Arc<Mutex<FusionSensorHandler>>,
        SharedHandler,
        SharedHandler,
        Arc<Mutex<Vec<i32>>>,
    ) {
        let accel_intervals = Arc::new(Mutex::new(Vec::new()));
        let accel: SharedHandler = Arc::new(Mutex::new(PhysicalSensorHandler::new(Box::new(
            StaticDevice {
                info: make_info(SensorType::Accelerometer, ACCEL, 10),
                intervals: accel_intervals.clone(),
                pending: Arc::new(Mutex::new(Vec::new())),
            },
        ))));
        let gyro: SharedHandler = Arc::new(Mutex::new(PhysicalSensorHandler::new(Box::new(
            StaticDevice {
                info: make_info(SensorType::Gyroscope, GYRO, 10),
                intervals: Arc::new(Mutex::new(Vec::new())),
                pending: Arc::new(Mutex::new(Vec::new())),
            },
        ))));
        let fusion = FusionSensorHandler::new(
            Box::new(PairingFusion {
                info: make_info(SensorType::RotationVector, ROTATION, 10),
                accel_uri: ACCEL.into(),
                gyro_uri: GYRO.into(),
                accel: None,
                gyro: None,
                emitted: 0,
            }),
            vec![accel.clone(), gyro.clone()],
        );
        (fusion, accel, gyro, accel_intervals)
    }

    #[test]
    fn test_start_subscribes_to_inputs() {
        let (fusion, accel, gyro, _) = build();
        let observer = Arc::new(CollectingObserver {
            id: 500,
            seen: Mutex::new(Vec::new()),
        });
        fusion.lock().start(observer).unwrap();
        assert_eq!(accel.lock().observer_count(), 1);
        assert_eq!(gyro.lock().observer_count(), 1);

        fusion.lock().stop(500).unwrap();
        assert_eq!(accel.lock().observer_count(), 0);
        assert_eq!(gyro.lock().observer_count(), 0);
    }

    #[test]
    fn test_emits_only_when_pair_complete() {
        let (fusion, _accel, _gyro, _) = build();
        let observer = Arc::new(CollectingObserver {
            id: 501,
            seen: Mutex::new(Vec::new()),
        });
        fusion.lock().start(observer.clone()).unwrap();

        // one accel sample alone produces nothing
        fusion.lock().on_input(ACCEL, &SensorData::now(vec![1.0, 2.0, 3.0]));
        assert!(observer.seen.lock().is_empty());

        // the matching gyro sample completes the pair, exactly one output
        fusion.lock().on_input(GYRO, &SensorData::now(vec![0.1, 0.2, 0.3]));
        let seen = observer.seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].values.len(), 6);
    }

    #[test]
    fn test_unknown_input_uri_ignored() {
        let (fusion, _accel, _gyro, _) = build();
        let observer = Arc::new(CollectingObserver {
            id: 502,
            seen: Mutex::new(Vec::new()),
        });
        fusion.lock().start(observer.clone()).unwrap();
        fusion
            .lock()
            .on_input("http://example.org/sensor/general/light/test", &SensorData::now(vec![5.0]));
        assert!(observer.seen.lock().is_empty());
    }

    /// Observer that detaches itself by answering `Drop` on first delivery
    struct QuittingObserver {
        id: ObserverId,
    }

    impl SensorObserver for QuittingObserver {
        fn id(&self) -> ObserverId {
            self.id
        }

        fn update(&self, _uri: &str, _data: &SensorData) -> ObserverAction {
            ObserverAction::Drop
        }
    }

    /// A dead-observer drop during a sample delivered through an input's own
    /// fan-out must not retake that input's lock. The gyro handler lock is
    /// held across `dispatch_events` here, so re-propagation reaching back
    /// into the gyro would never return.
    #[test]
    fn test_observer_drop_during_input_fanout_completes() {
        let accel_intervals = Arc::new(Mutex::new(Vec::new()));
        let accel: SharedHandler = Arc::new(Mutex::new(PhysicalSensorHandler::new(Box::new(
            StaticDevice {
                info: make_info(SensorType::Accelerometer, ACCEL, 10),
                intervals: accel_intervals.clone(),
                pending: Arc::new(Mutex::new(Vec::new())),
            },
        ))));
        let gyro_pending = Arc::new(Mutex::new(vec![SensorData::now(vec![0.1, 0.2, 0.3])]));
        let gyro: SharedHandler = Arc::new(Mutex::new(PhysicalSensorHandler::new(Box::new(
            StaticDevice {
                info: make_info(SensorType::Gyroscope, GYRO, 10),
                intervals: Arc::new(Mutex::new(Vec::new())),
                pending: gyro_pending,
            },
        ))));
        let fusion = FusionSensorHandler::new(
            Box::new(PairingFusion {
                info: make_info(SensorType::RotationVector, ROTATION, 10),
                accel_uri: ACCEL.into(),
                gyro_uri: GYRO.into(),
                accel: None,
                gyro: None,
                emitted: 0,
            }),
            vec![accel.clone(), gyro.clone()],
        );

        let keeper = Arc::new(CollectingObserver {
            id: 505,
            seen: Mutex::new(Vec::new()),
        });
        fusion.lock().start(keeper.clone()).unwrap();
        fusion.lock().set_interval(505, 30).unwrap();
        fusion.lock().start(Arc::new(QuittingObserver { id: 504 })).unwrap();
        fusion.lock().set_interval(504, 20).unwrap();
        assert_eq!(accel_intervals.lock().as_slice(), &[30, 20]);

        // half of the pair, fed directly
        fusion.lock().on_input(ACCEL, &SensorData::now(vec![1.0, 2.0, 3.0]));

        // the completing half arrives through the gyro's own fan-out, with
        // the gyro handler lock held for the whole dispatch
        gyro.lock().dispatch_events().unwrap();

        assert_eq!(fusion.lock().observer_count(), 1);
        assert_eq!(keeper.seen.lock().len(), 1);
        // the relaxed demand still reached the input that was not mid-dispatch
        assert_eq!(accel_intervals.lock().as_slice(), &[30, 20, 30]);
    }

    #[test]
    fn test_interval_propagates_to_inputs() {
        let (fusion, _accel, _gyro, accel_intervals) = build();
        let observer = Arc::new(CollectingObserver {
            id: 503,
            seen: Mutex::new(Vec::new()),
        });
        fusion.lock().start(observer).unwrap();
        fusion.lock().set_interval(503, 20).unwrap();
        assert_eq!(accel_intervals.lock().as_slice(), &[20]);
    }
}
