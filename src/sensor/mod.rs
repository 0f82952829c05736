//! Sensor model: devices, handlers, fusion, and the registry

pub mod application;
pub mod data;
pub mod device;
pub mod external;
pub mod fusion;
pub mod handler;
pub mod info;
pub mod physical;
pub mod registry;

pub use data::SensorData;
pub use device::{Policy, SensorDevice};
pub use external::{ExternalControl, ExternalSensorHandler};
pub use fusion::{FusionSensor, FusionSensorHandler, FusionUpdate};
pub use handler::{
    MAX_INTERVAL_MS, ObserverAction, ObserverId, SensorHandler, SensorObserver, SharedHandler,
    next_observer_id,
};
pub use info::{SensorInfo, SensorType};
pub use physical::PhysicalSensorHandler;
pub use registry::SensorRegistry;
