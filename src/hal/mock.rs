//! Simulated sensor devices
//!
//! Each mock device runs a sampler thread that writes encoded samples into
//! a pipe at the applied interval; the daemon's reactor polls the read end
//! like any hardware fd. Values are a fixed baseline with uniform noise.

use crate::config::HalConfig;
use crate::error::Result;
use crate::sensor::data::{ACCURACY_GOOD, SensorData, current_timestamp_us};
use crate::sensor::device::{Policy, SensorDevice};
use crate::sensor::info::{SensorInfo, SensorType};
use nix::fcntl::OFlag;
use rand::Rng;
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::thread;
use std::time::Duration;

/// Interval the sampler uses until an observer demands one
const DEFAULT_SAMPLE_INTERVAL_MS: i32 = 100;

pub struct MockDevice {
    info: SensorInfo,
    baseline: Vec<f32>,
    noise: f32,
    read_fd: OwnedFd,
    write_fd: Arc<OwnedFd>,
    interval_ms: Arc<AtomicI32>,
    running: Arc<AtomicBool>,
    sampler: Option<thread::JoinHandle<()>>,
    // partial frame carried between reads
    carry: Vec<u8>,
}

impl MockDevice {
    pub fn new(info: SensorInfo, baseline: Vec<f32>, noise: f32) -> Result<Self> {
        let (read_fd, write_fd) = nix::unistd::pipe2(OFlag::O_NONBLOCK | OFlag::O_CLOEXEC)?;
        Ok(Self {
            info,
            baseline,
            noise,
            read_fd,
            write_fd: Arc::new(write_fd),
            interval_ms: Arc::new(AtomicI32::new(DEFAULT_SAMPLE_INTERVAL_MS)),
            running: Arc::new(AtomicBool::new(false)),
            sampler: None,
            carry: Vec::new(),
        })
    }

    fn sample(baseline: &[f32], noise: f32) -> SensorData {
        let mut rng = rand::thread_rng();
        let values = baseline
            .iter()
            .map(|v| v + rng.gen_range(-noise..=noise))
            .collect();
        SensorData {
            timestamp: current_timestamp_us(),
            accuracy: ACCURACY_GOOD,
            values,
        }
    }

    fn stop_sampler(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(t) = self.sampler.take() {
            let _ = t.join();
        }
    }
}

impl SensorDevice for MockDevice {
    fn info(&self) -> &SensorInfo {
        &self.info
    }

    fn on_start(&mut self) -> Result<Policy> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Ok(Policy::Handled);
        }
        let running = self.running.clone();
        let interval = self.interval_ms.clone();
        let write_fd = self.write_fd.clone();
        let baseline = self.baseline.clone();
        let noise = self.noise;
        let name = format!("indriya-mock-{:?}", self.info.sensor_type).to_lowercase();
        self.sampler = Some(thread::Builder::new().name(name).spawn(move || {
            while running.load(Ordering::Acquire) {
                let ms = interval.load(Ordering::Acquire).max(1) as u64;
                thread::sleep(Duration::from_millis(ms));
                if !running.load(Ordering::Acquire) {
                    break;
                }
                let frame = Self::sample(&baseline, noise).encode();
                // pipe full means the reactor is behind; shed the sample
                let _ = nix::unistd::write(&*write_fd, &frame);
            }
        })?);
        Ok(Policy::Handled)
    }

    fn on_stop(&mut self) -> Result<Policy> {
        self.stop_sampler();
        Ok(Policy::Handled)
    }

    fn on_interval(&mut self, interval_ms: i32) -> Result<Policy> {
        self.interval_ms.store(interval_ms, Ordering::Release);
        Ok(Policy::Handled)
    }

    fn get_data(&mut self) -> Result<SensorData> {
        Ok(Self::sample(&self.baseline, self.noise))
    }

    fn poll_fd(&self) -> Option<RawFd> {
        Some(self.read_fd.as_raw_fd())
    }

    fn read_events(&mut self) -> Result<Vec<SensorData>> {
        let mut buf = [0u8; 4096];
        loop {
            match nix::unistd::read(self.read_fd.as_raw_fd(), &mut buf) {
                Ok(0) => break,
                Ok(n) => self.carry.extend_from_slice(&buf[..n]),
                Err(nix::errno::Errno::EAGAIN) => break,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        let mut samples = Vec::new();
        let mut offset = 0;
        while let Ok((sample, used)) = SensorData::decode_from(&self.carry[offset..]) {
            samples.push(sample);
            offset += used;
        }
        self.carry.drain(..offset);
        Ok(samples)
    }
}

impl Drop for MockDevice {
    fn drop(&mut self) {
        self.stop_sampler();
    }
}

fn mock_info(config: &HalConfig, sensor_type: SensorType, kind: &str, range: f32) -> SensorInfo {
    SensorInfo {
        sensor_type,
        uri: format!("http://indriya.org/sensor/general/{kind}/mock"),
        model: format!("mock-{kind}"),
        vendor: "indriya".into(),
        min_range: -range,
        max_range: range,
        resolution: range / 32768.0,
        min_interval: config.mock_min_interval_ms,
        max_batch_count: 0,
        wakeup_supported: false,
        privilege: String::new(),
    }
}

/// The mock device set: one accelerometer, one gyroscope
pub fn load(config: &HalConfig) -> Result<Vec<Box<dyn SensorDevice>>> {
    let accel = MockDevice::new(
        mock_info(config, SensorType::Accelerometer, "accelerometer", 39.2266),
        vec![0.0, 0.0, 9.80665],
        0.05,
    )?;
    let gyro = MockDevice::new(
        mock_info(config, SensorType::Gyroscope, "gyroscope", 8.726646),
        vec![0.0, 0.0, 0.0],
        0.01,
    )?;
    Ok(vec![Box::new(accel), Box::new(gyro)])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> HalConfig {
        HalConfig {
            driver: "mock".into(),
            mock_min_interval_ms: 5,
        }
    }

    #[test]
    fn test_load_builds_device_set() {
        let devices = load(&config()).unwrap();
        assert_eq!(devices.len(), 2);
        assert!(devices[0].info().uri.contains("accelerometer"));
        assert!(devices[1].info().uri.contains("gyroscope"));
        assert_eq!(devices[0].info().min_interval, 5);
    }

    #[test]
    fn test_sampler_produces_frames() {
        let mut dev = MockDevice::new(
            mock_info(&config(), SensorType::Accelerometer, "accelerometer", 39.2266),
            vec![0.0, 0.0, 9.80665],
            0.05,
        )
        .unwrap();
        dev.on_interval(2).unwrap();
        dev.on_start().unwrap();
        std::thread::sleep(Duration::from_millis(50));
        dev.on_stop().unwrap();

        let samples = dev.read_events().unwrap();
        assert!(!samples.is_empty());
        for s in &samples {
            assert_eq!(s.values.len(), 3);
            assert!((s.values[2] - 9.80665).abs() < 0.1);
        }
    }

    #[test]
    fn test_get_data_without_stream() {
        let mut dev = MockDevice::new(
            mock_info(&config(), SensorType::Gyroscope, "gyroscope", 8.7),
            vec![0.0, 0.0, 0.0],
            0.01,
        )
        .unwrap();
        let data = dev.get_data().unwrap();
        assert_eq!(data.values.len(), 3);
        assert!(data.timestamp > 0);
    }
}
