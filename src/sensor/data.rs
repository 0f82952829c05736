//! Sensor sample payload

use crate::error::{Error, Result};

/// Accuracy grades reported alongside each sample
pub const ACCURACY_UNDEFINED: i32 = -1;
pub const ACCURACY_GOOD: i32 = 2;

/// One sensor sample: timestamp plus a small vector of channel values.
///
/// This is the event payload carried opaquely in message bodies. Fixed
/// little-endian layout: `timestamp: u64, accuracy: i32, count: u32,
/// values: f32 * count`.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorData {
    /// Microseconds since the epoch
    pub timestamp: u64,
    /// Accuracy grade, [`ACCURACY_UNDEFINED`] when the device does not report one
    pub accuracy: i32,
    /// Channel values (e.g. x/y/z for an accelerometer)
    pub values: Vec<f32>,
}

impl SensorData {
    /// Sample stamped with the current wall-clock time
    pub fn now(values: Vec<f32>) -> Self {
        Self {
            timestamp: current_timestamp_us(),
            accuracy: ACCURACY_UNDEFINED,
            values,
        }
    }

    /// Encoded size in bytes
    pub fn encoded_len(&self) -> usize {
        8 + 4 + 4 + self.values.len() * 4
    }

    /// Append the fixed-layout encoding to `buf`
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.timestamp.to_le_bytes());
        buf.extend_from_slice(&self.accuracy.to_le_bytes());
        buf.extend_from_slice(&(self.values.len() as u32).to_le_bytes());
        for v in &self.values {
            buf.extend_from_slice(&v.to_le_bytes());
        }
    }

    /// Encode to a fresh buffer
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf
    }

    /// Decode one sample from the front of `buf`, returning it along with
    /// the number of bytes consumed
    pub fn decode_from(buf: &[u8]) -> Result<(Self, usize)> {
        if buf.len() < 16 {
            return Err(Error::InvalidMessage("sensor data truncated".into()));
        }
        let timestamp = u64::from_le_bytes(buf[0..8].try_into().map_err(|_| short())?);
        let accuracy = i32::from_le_bytes(buf[8..12].try_into().map_err(|_| short())?);
        let count = u32::from_le_bytes(buf[12..16].try_into().map_err(|_| short())?) as usize;
        let need = 16 + count * 4;
        if buf.len() < need {
            return Err(short());
        }
        let mut values = Vec::with_capacity(count);
        for i in 0..count {
            let off = 16 + i * 4;
            values.push(f32::from_le_bytes(
                buf[off..off + 4].try_into().map_err(|_| short())?,
            ));
        }
        Ok((
            Self {
                timestamp,
                accuracy,
                values,
            },
            need,
        ))
    }

    /// Decode a sample that occupies the whole buffer
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let (data, used) = Self::decode_from(buf)?;
        if used != buf.len() {
            return Err(Error::InvalidMessage("trailing bytes after sensor data".into()));
        }
        Ok(data)
    }
}

fn short() -> Error {
    Error::InvalidMessage("sensor data truncated".into())
}

/// Microseconds since the Unix epoch
pub fn current_timestamp_us() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}
