//! Handler for a sensor whose data is pushed from outside the daemon
//!
//! External sensors have no device under them; samples arrive through
//! `publish`. Lifecycle and demand changes are forwarded to an
//! `ExternalControl`, which is how the data source hears that somebody is
//! listening.

use crate::error::{Error, Result};
use crate::sensor::data::SensorData;
use crate::sensor::handler::{HandlerBase, ObserverId, SensorHandler, SensorObserver};
use crate::sensor::info::SensorInfo;
use std::sync::Arc;

/// Back-channel to the data source feeding an external sensor
pub trait ExternalControl: Send {
    /// First observer attached; the source should begin producing
    fn start(&self) -> Result<()> {
        Ok(())
    }

    /// Last observer detached; the source may stop producing
    fn stop(&self) -> Result<()> {
        Ok(())
    }

    /// Aggregated interval demand changed; 0 means "no preference"
    fn set_interval(&self, _interval_ms: i32) -> Result<()> {
        Ok(())
    }

    /// An integer attribute changed
    fn set_attribute_int(&self, _attribute: i32, _value: i32) -> Result<()> {
        Ok(())
    }
}

/// A source with nobody to tell
pub struct NullControl;

impl ExternalControl for NullControl {}

pub struct ExternalSensorHandler {
    info: SensorInfo,
    base: HandlerBase,
    control: Box<dyn ExternalControl>,
    propagated_interval: Option<i32>,
}

impl ExternalSensorHandler {
    pub fn new(info: SensorInfo, control: Box<dyn ExternalControl>) -> Self {
        Self {
            info,
            base: HandlerBase::new(),
            control,
            propagated_interval: None,
        }
    }

    /// Fan one pushed sample out to the observers
    pub fn publish(&mut self, data: &SensorData) {
        let uri = self.info.uri.clone();
        let dropped = self.base.notify(&uri, data);
        if !dropped.is_empty() {
            log::debug!("{}: dropped {} dead observer(s)", uri, dropped.len());
            self.propagate_interval();
        }
    }

    fn propagate_interval(&mut self) {
        let target = self.base.aggregate_interval(self.info.min_interval);
        if self.propagated_interval == target {
            return;
        }
        self.propagated_interval = target;
        if let Err(e) = self.control.set_interval(target.unwrap_or(0)) {
            log::warn!("{}: interval forwarding failed: {}", self.info.uri, e);
        }
    }
}

impl SensorHandler for ExternalSensorHandler {
    fn info(&self) -> &SensorInfo {
        &self.info
    }

    fn start(&mut self, observer: Arc<dyn SensorObserver>) -> Result<()> {
        let id = observer.id();
        self.base.add_observer(observer)?;
        if self.base.observer_count() == 1
            && let Err(e) = self.control.start()
        {
            self.base.remove_observer(id);
            return Err(e);
        }
        self.propagate_interval();
        Ok(())
    }

    fn stop(&mut self, observer_id: ObserverId) -> Result<()> {
        if !self.base.remove_observer(observer_id) {
            return Err(Error::InvalidParameter(format!(
                "observer {observer_id} not attached to {}",
                self.info.uri
            )));
        }
        if self.base.observer_count() == 0 {
            self.control.stop()?;
            self.propagated_interval = None;
        } else {
            self.propagate_interval();
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
        Ok(())
    }

    fn set_attribute_int(
        &mut self,
        _observer_id: ObserverId,
        attribute: i32,
        value: i32,
    ) -> Result<bool> {
        let changed = self.base.set_attr_int(attribute, value);
        if changed {
            self.control.set_attribute_int(attribute, value)?;
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
        self.base.last_data().ok_or(Error::NoData)
    }

    fn flush(&mut self, _observer_id: ObserverId) -> Result<()> {
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
            .broadcast_attr_int(&self.info.uri, exclude, attribute, value);
    }

    fn broadcast_attribute_str(&self, exclude: ObserverId, attribute: i32, value: &[u8]) {
        self.base
            .broadcast_attr_str(&self.info.uri, exclude, attribute, value);
    }
}
