//! Handler for a hardware-backed sensor
//!
//! Wraps one `SensorDevice` and drives it from observer lifecycle changes.
//! The device is enabled while at least one observer is attached. For every
//! device operation the capability hook is consulted first; the concrete
//! device operation runs only when the hook declines.

use crate::error::{Error, Result};
use crate::sensor::data::SensorData;
use crate::sensor::device::{Policy, SensorDevice};
use crate::sensor::handler::{HandlerBase, ObserverId, SensorHandler, SensorObserver};
use crate::sensor::info::SensorInfo;
use std::os::unix::io::RawFd;
use std::sync::Arc;

pub struct PhysicalSensorHandler {
    device: Box<dyn SensorDevice>,
    base: HandlerBase,
}

impl PhysicalSensorHandler {
    pub fn new(device: Box<dyn SensorDevice>) -> Self {
        Self {
            device,
            base: HandlerBase::new(),
        }
    }

    fn enable_device(&mut self) -> Result<()> {
        if self.device.on_start()? == Policy::Default {
            self.device.enable()?;
        }
        Ok(())
    }

    fn disable_device(&mut self) -> Result<()> {
        if self.device.on_stop()? == Policy::Default {
            self.device.disable()?;
        }
        Ok(())
    }

    fn apply_interval(&mut self) -> Result<()> {
        let min = self.device.info().min_interval;
        if let Some(interval) = self.base.aggregate_interval(min)
            && self.base.interval_needs_apply(interval)
        {
            if self.device.on_interval(interval)? == Policy::Default {
                self.device.set_interval(interval)?;
            }
            log::debug!("{}: interval {}ms", self.device.info().uri, interval);
        }
        Ok(())
    }

    fn apply_latency(&mut self) -> Result<()> {
        if let Some(latency) = self.base.aggregate_latency()
            && self.base.latency_needs_apply(latency)
        {
            if self.device.on_batch_latency(latency)? == Policy::Default {
                self.device.set_batch_latency(latency)?;
            }
            log::debug!("{}: batch latency {}ms", self.device.info().uri, latency);
        }
        Ok(())
    }

    /// Re-aggregate after fan-out dropped dead observers
    fn reapply_after_drop(&mut self, dropped: &[ObserverId]) {
        if dropped.is_empty() {
            return;
        }
        if self.base.observer_count() == 0 {
            if let Err(e) = self.disable_device() {
                log::warn!("{}: stop failed: {}", self.device.info().uri, e);
            }
            self.base.clear_applied();
        } else {
            if let Err(e) = self.apply_interval() {
                log::warn!("{}: interval reapply failed: {}", self.device.info().uri, e);
            }
            if let Err(e) = self.apply_latency() {
                log::warn!("{}: latency reapply failed: {}", self.device.info().uri, e);
            }
        }
    }
}

impl SensorHandler for PhysicalSensorHandler {
    fn info(&self) -> &SensorInfo {
        self.device.info()
    }

    fn start(&mut self, observer: Arc<dyn SensorObserver>) -> Result<()> {
        self.base.add_observer(observer)?;
        if self.base.observer_count() == 1 {
            self.enable_device()?;
        }
        self.apply_interval()?;
        self.apply_latency()?;
        Ok(())
    }

    fn stop(&mut self, observer_id: ObserverId) -> Result<()> {
        if !self.base.remove_observer(observer_id) {
            return Err(Error::InvalidParameter(format!(
                "observer {observer_id} not attached to {}",
                self.device.info().uri
            )));
        }
        if self.base.observer_count() == 0 {
            self.disable_device()?;
            self.base.clear_applied();
        } else {
            self.apply_interval()?;
            self.apply_latency()?;
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
        self.apply_interval()
    }

    fn set_batch_latency(&mut self, observer_id: ObserverId, latency_ms: i32) -> Result<()> {
        if latency_ms < 0 {
            return Err(Error::InvalidParameter(format!(
                "negative batch latency {latency_ms}"
            )));
        }
        self.base.record_latency(observer_id, latency_ms);
        self.apply_latency()
    }

    fn set_attribute_int(
        &mut self,
        _observer_id: ObserverId,
        attribute: i32,
        value: i32,
    ) -> Result<bool> {
        let changed = self.base.set_attr_int(attribute, value);
        if changed && self.device.on_attribute_int(attribute, value)? == Policy::Default {
            self.device.set_attribute_int(attribute, value)?;
        }
        Ok(changed)
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
        let data = self.device.get_data()?;
        self.base.cache_data(data.clone());
        Ok(data)
    }

    fn flush(&mut self, _observer_id: ObserverId) -> Result<()> {
        if self.device.on_flush()? == Policy::Default {
            self.device.flush()?;
        }
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
            .broadcast_attr_int(&self.device.info().uri, exclude, attribute, value);
    }

    fn broadcast_attribute_str(&self, exclude: ObserverId, attribute: i32, value: &[u8]) {
        self.base
            .broadcast_attr_str(&self.device.info().uri, exclude, attribute, value);
    }

    fn poll_fd(&self) -> Option<RawFd> {
        self.device.poll_fd()
    }

    fn dispatch_events(&mut self) -> Result<()> {
        let samples = self.device.read_events()?;
        let uri = self.device.info().uri.clone();
        let mut all_dropped = Vec::new();
        for sample in samples {
            all_dropped.extend(self.base.notify(&uri, &sample));
        }
        self.reapply_after_drop(&all_dropped);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensor::handler::ObserverAction;
    use crate::sensor::info::SensorType;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct DeviceLog {
        enables: usize,
        disables: usize,
        intervals: Vec<i32>,
        attrs: Vec<(i32, i32)>,
    }

    fn test_info(min_interval: i32) -> SensorInfo {
        SensorInfo {
            sensor_type: SensorType::Accelerometer,
            uri: "http://example.org/sensor/general/accelerometer/fake".into(),
            model: "fake".into(),
            vendor: "test".into(),
            min_range: -10.0,
            max_range: 10.0,
            resolution: 0.01,
            min_interval,
            max_batch_count: 0,
            wakeup_supported: false,
            privilege: String::new(),
        }
    }

    /// Plain driver: no hooks, everything reaches the concrete operations
    struct FakeDevice {
        info: SensorInfo,
        log: Arc<Mutex<DeviceLog>>,
        pending: Vec<SensorData>,
    }

    impl FakeDevice {
        fn new(min_interval: i32) -> (Self, Arc<Mutex<DeviceLog>>) {
            let log = Arc::new(Mutex::new(DeviceLog::default()));
            (
                Self {
                    info: test_info(min_interval),
                    log: log.clone(),
                    pending: Vec::new(),
                },
                log,
            )
        }
    }

    impl SensorDevice for FakeDevice {
        fn info(&self) -> &SensorInfo {
            &self.info
        }

        fn enable(&mut self) -> Result<()> {
            self.log.lock().enables += 1;
            Ok(())
        }

        fn disable(&mut self) -> Result<()> {
            self.log.lock().disables += 1;
            Ok(())
        }

        fn set_interval(&mut self, interval_ms: i32) -> Result<()> {
            self.log.lock().intervals.push(interval_ms);
            Ok(())
        }

        fn set_attribute_int(&mut self, attribute: i32, value: i32) -> Result<()> {
            self.log.lock().attrs.push((attribute, value));
            Ok(())
        }

        fn get_data(&mut self) -> Result<SensorData> {
            Ok(SensorData::now(vec![9.81]))
        }

        fn read_events(&mut self) -> Result<Vec<SensorData>> {
            Ok(std::mem::take(&mut self.pending))
        }
    }

    /// Self-managing driver: hooks answer `Handled`, so the concrete
    /// operations must never run
    struct SelfManagedDevice {
        info: SensorInfo,
        hook_starts: Arc<Mutex<usize>>,
        concrete_log: Arc<Mutex<DeviceLog>>,
    }

    impl SensorDevice for SelfManagedDevice {
        fn info(&self) -> &SensorInfo {
            &self.info
        }

        fn on_start(&mut self) -> Result<Policy> {
            *self.hook_starts.lock() += 1;
            Ok(Policy::Handled)
        }

        fn on_stop(&mut self) -> Result<Policy> {
            Ok(Policy::Handled)
        }

        fn on_interval(&mut self, _interval_ms: i32) -> Result<Policy> {
            Ok(Policy::Handled)
        }

        fn enable(&mut self) -> Result<()> {
            self.concrete_log.lock().enables += 1;
            Ok(())
        }

        fn disable(&mut self) -> Result<()> {
            self.concrete_log.lock().disables += 1;
            Ok(())
        }

        fn set_interval(&mut self, interval_ms: i32) -> Result<()> {
            self.concrete_log.lock().intervals.push(interval_ms);
            Ok(())
        }

        fn get_data(&mut self) -> Result<SensorData> {
            Ok(SensorData::now(vec![1.0]))
        }
    }

    struct NullObserver {
        id: ObserverId,
    }

    impl SensorObserver for NullObserver {
        fn id(&self) -> ObserverId {
            self.id
        }

        fn update(&self, _uri: &str, _data: &SensorData) -> ObserverAction {
            ObserverAction::Continue
        }
    }

    fn obs(id: ObserverId) -> Arc<dyn SensorObserver> {
        Arc::new(NullObserver { id })
    }

    #[test]
    fn test_device_enabled_on_first_observer_only() {
        let (dev, log) = FakeDevice::new(10);
        let mut h = PhysicalSensorHandler::new(Box::new(dev));

        h.start(obs(1)).unwrap();
        h.start(obs(2)).unwrap();
        assert_eq!(log.lock().enables, 1);

        h.stop(1).unwrap();
        assert_eq!(log.lock().disables, 0);
        h.stop(2).unwrap();
        assert_eq!(log.lock().disables, 1);
    }

    #[test]
    fn test_handled_hook_skips_concrete_operations() {
        let hook_starts = Arc::new(Mutex::new(0));
        let concrete_log = Arc::new(Mutex::new(DeviceLog::default()));
        let mut h = PhysicalSensorHandler::new(Box::new(SelfManagedDevice {
            info: test_info(10),
            hook_starts: hook_starts.clone(),
            concrete_log: concrete_log.clone(),
        }));

        h.start(obs(1)).unwrap();
        h.set_interval(1, 50).unwrap();
        h.stop(1).unwrap();

        assert_eq!(*hook_starts.lock(), 1);
        let log = concrete_log.lock();
        assert_eq!(log.enables, 0);
        assert_eq!(log.disables, 0);
        assert!(log.intervals.is_empty());
    }

    #[test]
    fn test_interval_aggregation_and_revert() {
        let (dev, log) = FakeDevice::new(10);
        let mut h = PhysicalSensorHandler::new(Box::new(dev));

        h.start(obs(1)).unwrap();
        h.start(obs(2)).unwrap();
        h.set_interval(1, 100).unwrap();
        h.set_interval(2, 20).unwrap();
        assert_eq!(log.lock().intervals, vec![100, 20]);

        // same aggregate again is suppressed
        h.set_interval(1, 50).unwrap();
        assert_eq!(log.lock().intervals, vec![100, 20]);

        // faster demand leaves with its observer
        h.stop(2).unwrap();
        assert_eq!(log.lock().intervals, vec![100, 20, 50]);
    }

    #[test]
    fn test_interval_clamped_to_device_floor() {
        let (dev, log) = FakeDevice::new(10);
        let mut h = PhysicalSensorHandler::new(Box::new(dev));
        h.start(obs(1)).unwrap();
        h.set_interval(1, 3).unwrap();
        assert_eq!(log.lock().intervals, vec![10]);
    }

    #[test]
    fn test_attribute_change_reaches_device_once() {
        let (dev, log) = FakeDevice::new(10);
        let mut h = PhysicalSensorHandler::new(Box::new(dev));
        assert!(h.set_attribute_int(1, 4, 7).unwrap());
        assert!(!h.set_attribute_int(1, 4, 7).unwrap());
        assert_eq!(log.lock().attrs, vec![(4, 7)]);
        assert_eq!(h.get_attribute_int(4).unwrap(), 7);
    }

    #[test]
    fn test_stop_unknown_observer_fails() {
        let (dev, _log) = FakeDevice::new(10);
        let mut h = PhysicalSensorHandler::new(Box::new(dev));
        assert!(h.stop(99).is_err());
    }

    #[test]
    fn test_get_data_prefers_cached_sample() {
        let (mut dev, _log) = FakeDevice::new(10);
        dev.pending.push(SensorData {
            timestamp: 42,
            accuracy: 2,
            values: vec![1.0, 2.0, 3.0],
        });
        let mut h = PhysicalSensorHandler::new(Box::new(dev));
        h.start(obs(1)).unwrap();
        h.dispatch_events().unwrap();
        assert_eq!(h.get_data().unwrap().timestamp, 42);
    }
}
