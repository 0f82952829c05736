//! Sensor identity and metadata
//!
//! `SensorInfo` is immutable after construction and keyed by URI across the
//! whole system: two sensors can never share a URI.
//!
//! ## Wire serialization
//!
//! One info record is a type-tagged field sequence, all little-endian:
//!
//! ```text
//! i32 type, lp uri, lp model, lp vendor,
//! f32 min_range, f32 max_range, f32 resolution,
//! i32 min_interval, i32 max_batch_count, u8 wakeup_supported, lp privilege
//! ```
//!
//! where `lp` is a `u32` byte length followed by UTF-8 bytes. The sensor
//! list reply is `[i32 count] { [i32 size][size bytes of one record] } *`.

use crate::error::{Error, Result};

/// Separator between multiple privilege tokens in one privilege string.
/// Every token must be independently granted (AND semantics).
pub const PRIVILEGE_DELIMITER: char = ';';

/// Semantic sensor type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SensorType {
    Accelerometer,
    Gyroscope,
    Magnetometer,
    Light,
    Proximity,
    Pressure,
    Gravity,
    LinearAcceleration,
    RotationVector,
    Pedometer,
    Custom(i32),
}

impl SensorType {
    pub fn as_i32(self) -> i32 {
        match self {
            SensorType::Accelerometer => 1,
            SensorType::Gyroscope => 2,
            SensorType::Magnetometer => 3,
            SensorType::Light => 4,
            SensorType::Proximity => 5,
            SensorType::Pressure => 6,
            SensorType::Gravity => 7,
            SensorType::LinearAcceleration => 8,
            SensorType::RotationVector => 9,
            SensorType::Pedometer => 10,
            SensorType::Custom(v) => v,
        }
    }

    pub fn from_i32(v: i32) -> Self {
        match v {
            1 => SensorType::Accelerometer,
            2 => SensorType::Gyroscope,
            3 => SensorType::Magnetometer,
            4 => SensorType::Light,
            5 => SensorType::Proximity,
            6 => SensorType::Pressure,
            7 => SensorType::Gravity,
            8 => SensorType::LinearAcceleration,
            9 => SensorType::RotationVector,
            10 => SensorType::Pedometer,
            other => SensorType::Custom(other),
        }
    }
}

/// Immutable description of one sensor
#[derive(Debug, Clone, PartialEq)]
pub struct SensorInfo {
    pub sensor_type: SensorType,
    /// Unique key across the whole system
    pub uri: String,
    pub model: String,
    pub vendor: String,
    pub min_range: f32,
    pub max_range: f32,
    pub resolution: f32,
    /// Minimum sampling interval the device supports, in milliseconds
    pub min_interval: i32,
    pub max_batch_count: i32,
    pub wakeup_supported: bool,
    /// Zero or more `;`-joined privilege tokens; empty means unrestricted
    pub privilege: String,
}

impl SensorInfo {
    /// Individual privilege tokens; empty iterator for an unrestricted sensor
    pub fn privileges(&self) -> impl Iterator<Item = &str> {
        self.privilege
            .split(PRIVILEGE_DELIMITER)
            .filter(|t| !t.is_empty())
    }

    /// Serialize one record to the wire field sequence
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(
            4 + 3 * 4
                + self.uri.len()
                + self.model.len()
                + self.vendor.len()
                + self.privilege.len()
                + 12
                + 8
                + 1
                + 4,
        );
        buf.extend_from_slice(&self.sensor_type.as_i32().to_le_bytes());
        put_lp_str(&mut buf, &self.uri);
        put_lp_str(&mut buf, &self.model);
        put_lp_str(&mut buf, &self.vendor);
        buf.extend_from_slice(&self.min_range.to_le_bytes());
        buf.extend_from_slice(&self.max_range.to_le_bytes());
        buf.extend_from_slice(&self.resolution.to_le_bytes());
        buf.extend_from_slice(&self.min_interval.to_le_bytes());
        buf.extend_from_slice(&self.max_batch_count.to_le_bytes());
        buf.push(u8::from(self.wakeup_supported));
        put_lp_str(&mut buf, &self.privilege);
        buf
    }

    /// Deserialize one record
    pub fn deserialize(buf: &[u8]) -> Result<Self> {
        let mut cur = Cursor::new(buf);
        let sensor_type = SensorType::from_i32(cur.get_i32()?);
        let uri = cur.get_lp_str()?;
        let model = cur.get_lp_str()?;
        let vendor = cur.get_lp_str()?;
        let min_range = cur.get_f32()?;
        let max_range = cur.get_f32()?;
        let resolution = cur.get_f32()?;
        let min_interval = cur.get_i32()?;
        let max_batch_count = cur.get_i32()?;
        let wakeup_supported = cur.get_u8()? != 0;
        let privilege = cur.get_lp_str()?;
        Ok(Self {
            sensor_type,
            uri,
            model,
            vendor,
            min_range,
            max_range,
            resolution,
            min_interval,
            max_batch_count,
            wakeup_supported,
            privilege,
        })
    }

    /// Serialize a whole sensor list: `[i32 count]{[i32 size][record]}*`
    pub fn serialize_list(infos: &[SensorInfo]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(infos.len() as i32).to_le_bytes());
        for info in infos {
            let record = info.serialize();
            buf.extend_from_slice(&(record.len() as i32).to_le_bytes());
            buf.extend_from_slice(&record);
        }
        buf
    }

    /// Deserialize a sensor list reply
    pub fn deserialize_list(buf: &[u8]) -> Result<Vec<SensorInfo>> {
        let mut cur = Cursor::new(buf);
        let count = cur.get_i32()?;
        if count < 0 {
            return Err(Error::InvalidMessage("negative sensor count".into()));
        }
        let mut infos = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let size = cur.get_i32()?;
            if size < 0 {
                return Err(Error::InvalidMessage("negative record size".into()));
            }
            let record = cur.get_bytes(size as usize)?;
            infos.push(SensorInfo::deserialize(record)?);
        }
        Ok(infos)
    }
}

fn put_lp_str(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(&(s.len() as u32).to_le_bytes());
    buf.extend_from_slice(s.as_bytes());
}

/// Bounds-checked reader over a received record
pub(crate) struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn short() -> Error {
        Error::InvalidMessage("record truncated".into())
    }

    pub fn get_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(Self::short());
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        Ok(self.get_bytes(1)?[0])
    }

    pub fn get_i32(&mut self) -> Result<i32> {
        let b = self.get_bytes(4)?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        let b = self.get_bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn get_u64(&mut self) -> Result<u64> {
        let b = self.get_bytes(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    pub fn get_f32(&mut self) -> Result<f32> {
        let b = self.get_bytes(4)?;
        Ok(f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn get_lp_str(&mut self) -> Result<String> {
        let len = self.get_u32()? as usize;
        let bytes = self.get_bytes(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| Error::InvalidMessage("invalid utf-8 in record".into()))
    }

    pub fn remaining(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }
}
