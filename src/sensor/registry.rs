//! Sensor registry
//!
//! Owns every handler in the daemon, keyed by URI. Initialization loads in
//! a strict order: physical devices first, then fusion sensors, then
//! external sensors. Fusion dependencies resolve only against sensors that
//! are already registered, so dependency chains can never form a cycle.
//!
//! The registry is a state machine: it serves lookups only between `init`
//! and `deinit`, and a deinitialized registry cannot be revived.

use crate::error::{Error, Result};
use crate::sensor::device::SensorDevice;
use crate::sensor::external::{ExternalControl, ExternalSensorHandler};
use crate::sensor::fusion::{FusionSensor, FusionSensorHandler};
use crate::sensor::handler::SharedHandler;
use crate::sensor::info::SensorInfo;
use crate::sensor::physical::PhysicalSensorHandler;
use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Uninitialized,
    Initialized,
    Deinitialized,
}

pub struct SensorRegistry {
    state: State,
    // registration order preserved; lookups scan, the sensor count is small
    sensors: Vec<(SensorInfo, SharedHandler)>,
}

impl SensorRegistry {
    pub fn new() -> Self {
        Self {
            state: State::Uninitialized,
            sensors: Vec::new(),
        }
    }

    /// Load everything in dependency-safe order. Fails without touching
    /// state when no physical device exists; a daemon with no hardware has
    /// nothing to serve.
    pub fn init(
        &mut self,
        devices: Vec<Box<dyn SensorDevice>>,
        fusions: Vec<Box<dyn FusionSensor>>,
        externals: Vec<(SensorInfo, Box<dyn ExternalControl>)>,
    ) -> Result<()> {
        if self.state != State::Uninitialized {
            return Err(Error::InvalidParameter(
                "registry already initialized".into(),
            ));
        }
        if devices.is_empty() {
            return Err(Error::NoHardware);
        }

        for device in devices {
            let info = device.info().clone();
            self.insert(info, Arc::new(Mutex::new(PhysicalSensorHandler::new(device))))?;
        }

        // fusion sensors that cannot resolve all inputs are skipped, not
        // fatal: the hardware they need simply is not present on this box
        for fusion in fusions {
            let uri = fusion.info().uri.clone();
            if let Err(e) = self.add_fusion(fusion) {
                log::warn!("skipping fusion sensor {}: {}", uri, e);
            }
        }

        for (info, control) in externals {
            self.insert(
                info.clone(),
                Arc::new(Mutex::new(ExternalSensorHandler::new(info, control))),
            )?;
        }

        self.state = State::Initialized;
        log::info!("sensor registry initialized with {} sensor(s)", self.sensors.len());
        Ok(())
    }

    /// Tear down. The registry cannot be reinitialized afterwards.
    pub fn deinit(&mut self) {
        self.sensors.clear();
        self.state = State::Deinitialized;
    }

    pub fn is_initialized(&self) -> bool {
        self.state == State::Initialized
    }

    fn check_initialized(&self) -> Result<()> {
        if self.state == State::Initialized {
            Ok(())
        } else {
            Err(Error::NotInitialized)
        }
    }

    fn insert(&mut self, info: SensorInfo, handler: SharedHandler) -> Result<()> {
        if self.sensors.iter().any(|(i, _)| i.uri == info.uri) {
            return Err(Error::DuplicateUri(info.uri));
        }
        log::debug!("registered sensor {}", info.uri);
        self.sensors.push((info, handler));
        Ok(())
    }

    /// All-or-nothing: every required input must resolve before the fusion
    /// sensor is registered
    fn add_fusion(&mut self, fusion: Box<dyn FusionSensor>) -> Result<SensorInfo> {
        let info = fusion.info().clone();
        let mut inputs = Vec::new();
        for required in fusion.required_sensors() {
            match self.find(&required) {
                Some((_, handler)) => inputs.push(handler.clone()),
                None => {
                    return Err(Error::UnresolvedDependency {
                        fusion: info.uri,
                        required,
                    });
                }
            }
        }
        let handler = FusionSensorHandler::new(fusion, inputs);
        self.insert(info.clone(), handler)?;
        Ok(info)
    }

    /// Register a physical sensor at runtime (hotplug)
    pub fn register_physical(&mut self, device: Box<dyn SensorDevice>) -> Result<SensorInfo> {
        self.check_initialized()?;
        let info = device.info().clone();
        self.insert(
            info.clone(),
            Arc::new(Mutex::new(PhysicalSensorHandler::new(device))),
        )?;
        Ok(info)
    }

    /// Register a fusion sensor at runtime; dependency resolution is
    /// all-or-nothing
    pub fn register_fusion(&mut self, fusion: Box<dyn FusionSensor>) -> Result<SensorInfo> {
        self.check_initialized()?;
        self.add_fusion(fusion)
    }

    /// Register an externally fed sensor at runtime (provider connect).
    /// Returns the concrete handler so the caller can push samples into it.
    pub fn register_external(
        &mut self,
        info: SensorInfo,
        control: Box<dyn ExternalControl>,
    ) -> Result<Arc<Mutex<ExternalSensorHandler>>> {
        self.check_initialized()?;
        let handler = Arc::new(Mutex::new(ExternalSensorHandler::new(info.clone(), control)));
        self.insert(info, handler.clone())?;
        Ok(handler)
    }

    /// Remove a sensor by exact URI, returning its description
    pub fn deregister(&mut self, uri: &str) -> Result<SensorInfo> {
        self.check_initialized()?;
        match self.sensors.iter().position(|(i, _)| i.uri == uri) {
            Some(pos) => {
                let (info, _) = self.sensors.remove(pos);
                log::debug!("deregistered sensor {}", info.uri);
                Ok(info)
            }
            None => Err(Error::SensorNotFound(uri.to_string())),
        }
    }

    fn find(&self, uri: &str) -> Option<&(SensorInfo, SharedHandler)> {
        // exact match wins; otherwise a pattern matches any URI whose tail
        // path components equal it
        self.sensors
            .iter()
            .find(|(i, _)| i.uri == uri)
            .or_else(|| {
                self.sensors.iter().find(|(i, _)| {
                    i.uri.len() > uri.len()
                        && i.uri.ends_with(uri)
                        && i.uri.as_bytes()[i.uri.len() - uri.len() - 1] == b'/'
                })
            })
    }

    /// Resolve a URI (or tail-component pattern) to its handler
    pub fn lookup(&self, uri: &str) -> Result<SharedHandler> {
        self.check_initialized()?;
        self.find(uri)
            .map(|(_, h)| h.clone())
            .ok_or_else(|| Error::SensorNotFound(uri.to_string()))
    }

    /// Description of one sensor by URI or pattern
    pub fn lookup_info(&self, uri: &str) -> Result<SensorInfo> {
        self.check_initialized()?;
        self.find(uri)
            .map(|(i, _)| i.clone())
            .ok_or_else(|| Error::SensorNotFound(uri.to_string()))
    }

    /// Descriptions of every registered sensor, in registration order
    pub fn infos(&self) -> Vec<SensorInfo> {
        self.sensors.iter().map(|(i, _)| i.clone()).collect()
    }

    /// Every handler, in registration order
    pub fn handlers(&self) -> Vec<SharedHandler> {
        self.sensors.iter().map(|(_, h)| h.clone()).collect()
    }

    /// Wire form of the sensor list reply
    pub fn serialize_list(&self) -> Vec<u8> {
        SensorInfo::serialize_list(&self.infos())
    }

    pub fn len(&self) -> usize {
        self.sensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sensors.is_empty()
    }
}

impl Default for SensorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensor::data::SensorData;
    use crate::sensor::fusion::FusionUpdate;
    use crate::sensor::info::SensorType;

    fn make_info(uri: &str) -> SensorInfo {
        SensorInfo {
            sensor_type: SensorType::Custom(50),
            uri: uri.into(),
            model: "m".into(),
            vendor: "v".into(),
            min_range: 0.0,
            max_range: 1.0,
            resolution: 0.1,
            min_interval: 10,
            max_batch_count: 0,
            wakeup_supported: false,
            privilege: String::new(),
        }
    }

    struct Dev {
        info: SensorInfo,
    }

    impl Dev {
        fn boxed(uri: &str) -> Box<dyn SensorDevice> {
            Box::new(Dev {
                info: make_info(uri),
            })
        }
    }

    impl SensorDevice for Dev {
        fn info(&self) -> &SensorInfo {
            &self.info
        }

        fn get_data(&mut self) -> Result<SensorData> {
            Ok(SensorData::now(vec![0.0]))
        }
    }

    struct Fus {
        info: SensorInfo,
        required: Vec<String>,
    }

    impl FusionSensor for Fus {
        fn info(&self) -> &SensorInfo {
            &self.info
        }

        fn required_sensors(&self) -> Vec<String> {
            self.required.clone()
        }

        fn update(&mut self, _uri: &str, _data: &SensorData) -> FusionUpdate {
            FusionUpdate::Pending
        }

        fn get_data(&mut self) -> Result<SensorData> {
            Err(Error::NoData)
        }
    }

    const ACCEL: &str = "http://example.org/sensor/general/accelerometer/mock";
    const GYRO: &str = "http://example.org/sensor/general/gyroscope/mock";

    #[test]
    fn test_init_requires_hardware() {
        let mut reg = SensorRegistry::new();
        assert!(matches!(
            reg.init(vec![], vec![], vec![]),
            Err(Error::NoHardware)
        ));
        assert!(!reg.is_initialized());
    }

    #[test]
    fn test_lookup_before_init_fails() {
        let reg = SensorRegistry::new();
        assert!(matches!(reg.lookup(ACCEL), Err(Error::NotInitialized)));
    }

    #[test]
    fn test_suffix_lookup() {
        let mut reg = SensorRegistry::new();
        reg.init(vec![Dev::boxed(ACCEL), Dev::boxed(GYRO)], vec![], vec![])
            .unwrap();

        assert!(reg.lookup(ACCEL).is_ok());
        assert!(reg.lookup("accelerometer/mock").is_ok());
        // no component boundary
        assert!(reg.lookup("meter/mock").is_err());
        assert!(reg.lookup("barometer/mock").is_err());
    }

    #[test]
    fn test_duplicate_uri_rejected() {
        let mut reg = SensorRegistry::new();
        assert!(matches!(
            reg.init(vec![Dev::boxed(ACCEL), Dev::boxed(ACCEL)], vec![], vec![]),
            Err(Error::DuplicateUri(_))
        ));
    }

    #[test]
    fn test_unresolved_fusion_skipped_at_init() {
        let mut reg = SensorRegistry::new();
        reg.init(
            vec![Dev::boxed(ACCEL)],
            vec![Box::new(Fus {
                info: make_info("http://example.org/sensor/general/rotation_vector/mock"),
                required: vec![ACCEL.into(), GYRO.into()],
            })],
            vec![],
        )
        .unwrap();
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_fusion_resolves_against_earlier_sensors() {
        let mut reg = SensorRegistry::new();
        reg.init(
            vec![Dev::boxed(ACCEL), Dev::boxed(GYRO)],
            vec![Box::new(Fus {
                info: make_info("http://example.org/sensor/general/rotation_vector/mock"),
                required: vec!["accelerometer/mock".into(), "gyroscope/mock".into()],
            })],
            vec![],
        )
        .unwrap();
        assert_eq!(reg.len(), 3);
        assert!(reg.lookup("rotation_vector/mock").is_ok());
    }

    #[test]
    fn test_runtime_fusion_registration_all_or_nothing() {
        let mut reg = SensorRegistry::new();
        reg.init(vec![Dev::boxed(ACCEL)], vec![], vec![]).unwrap();
        let err = reg
            .register_fusion(Box::new(Fus {
                info: make_info("http://example.org/sensor/general/rotation_vector/mock"),
                required: vec![ACCEL.into(), GYRO.into()],
            }))
            .unwrap_err();
        assert!(matches!(err, Error::UnresolvedDependency { .. }));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_deregister_and_deinit() {
        let mut reg = SensorRegistry::new();
        reg.init(vec![Dev::boxed(ACCEL), Dev::boxed(GYRO)], vec![], vec![])
            .unwrap();
        let info = reg.deregister(GYRO).unwrap();
        assert_eq!(info.uri, GYRO);
        assert!(reg.lookup(GYRO).is_err());

        reg.deinit();
        assert!(matches!(reg.lookup(ACCEL), Err(Error::NotInitialized)));
        // a dead registry stays dead
        assert!(reg.init(vec![Dev::boxed(ACCEL)], vec![], vec![]).is_err());
    }

    #[test]
    fn test_list_serialization_roundtrip() {
        let mut reg = SensorRegistry::new();
        reg.init(vec![Dev::boxed(ACCEL), Dev::boxed(GYRO)], vec![], vec![])
            .unwrap();
        let list = SensorInfo::deserialize_list(&reg.serialize_list()).unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].uri, ACCEL);
        assert_eq!(list[1].uri, GYRO);
    }
}
