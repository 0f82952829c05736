//! Command codes and fixed-layout message bodies
//!
//! Bodies are raw little-endian field layouts keyed by listener/sensor
//! identifiers, not self-describing: both sides must agree on the exact
//! layout. Command code values are partitioned by range (manager 0x1xx,
//! listener 0x2xx, provider 0x3xx, misc 0x4xx) so they never collide.

use crate::error::{Error, Result};
use crate::sensor::data::SensorData;
use crate::sensor::info::Cursor;

/// Command and event codes
pub mod cmd {
    pub const MANAGER_CONNECT: u32 = 0x101;
    pub const MANAGER_SENSOR_LIST: u32 = 0x102;
    pub const MANAGER_SENSOR_ADDED: u32 = 0x103;
    pub const MANAGER_SENSOR_REMOVED: u32 = 0x104;
    pub const MANAGER_SET_ATTR_INT: u32 = 0x105;
    pub const MANAGER_GET_ATTR_INT: u32 = 0x106;

    pub const LISTENER_EVENT: u32 = 0x201;
    pub const LISTENER_ACCURACY_EVENT: u32 = 0x202;
    pub const LISTENER_CONNECT: u32 = 0x203;
    pub const LISTENER_START: u32 = 0x204;
    pub const LISTENER_STOP: u32 = 0x205;
    pub const LISTENER_SET_ATTR_INT: u32 = 0x206;
    pub const LISTENER_SET_ATTR_STR: u32 = 0x207;
    pub const LISTENER_GET_DATA: u32 = 0x208;
    pub const LISTENER_GET_ATTR_INT: u32 = 0x209;
    pub const LISTENER_GET_ATTR_STR: u32 = 0x20a;
    pub const LISTENER_GET_DATA_LIST: u32 = 0x20b;

    pub const PROVIDER_CONNECT: u32 = 0x301;
    pub const PROVIDER_START: u32 = 0x302;
    pub const PROVIDER_STOP: u32 = 0x303;
    pub const PROVIDER_ATTR_INT: u32 = 0x304;
    pub const PROVIDER_PUBLISH: u32 = 0x305;

    pub const HAS_PRIVILEGE: u32 = 0x401;
}

/// Attribute ids for the listener/manager attribute commands. Interval,
/// batch latency, and flush travel as attribute sets and are routed to the
/// dedicated handler operations by the dispatcher.
pub mod attr {
    pub const INTERVAL: i32 = 1;
    pub const MAX_BATCH_LATENCY: i32 = 2;
    pub const PASSIVE_MODE: i32 = 3;
    pub const PAUSE_POLICY: i32 = 4;
    pub const AXIS_ORIENTATION: i32 = 5;
    pub const FLUSH: i32 = 6;
}

fn put_lp_str(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(&(s.len() as u32).to_le_bytes());
    buf.extend_from_slice(s.as_bytes());
}

fn put_lp_bytes(buf: &mut Vec<u8>, b: &[u8]) {
    buf.extend_from_slice(&(b.len() as u32).to_le_bytes());
    buf.extend_from_slice(b);
}

impl Cursor<'_> {
    fn get_lp_vec(&mut self) -> Result<Vec<u8>> {
        let len = self.get_u32()? as usize;
        Ok(self.get_bytes(len)?.to_vec())
    }
}

/// `LISTENER_CONNECT` request: the target sensor URI
#[derive(Debug, Clone, PartialEq)]
pub struct ListenerConnect {
    pub uri: String,
}

impl ListenerConnect {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        put_lp_str(&mut buf, &self.uri);
        buf
    }

    pub fn decode(body: &[u8]) -> Result<Self> {
        let mut cur = Cursor::new(body);
        Ok(Self {
            uri: cur.get_lp_str()?,
        })
    }
}

/// `LISTENER_CONNECT` reply: the server-assigned listener id
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ListenerConnectReply {
    pub listener_id: u32,
}

impl ListenerConnectReply {
    pub fn encode(&self) -> Vec<u8> {
        self.listener_id.to_le_bytes().to_vec()
    }

    pub fn decode(body: &[u8]) -> Result<Self> {
        let mut cur = Cursor::new(body);
        Ok(Self {
            listener_id: cur.get_u32()?,
        })
    }
}

/// Request referencing an existing listener (start/stop/get-data)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ListenerRef {
    pub listener_id: u32,
}

impl ListenerRef {
    pub fn encode(&self) -> Vec<u8> {
        self.listener_id.to_le_bytes().to_vec()
    }

    pub fn decode(body: &[u8]) -> Result<Self> {
        let mut cur = Cursor::new(body);
        Ok(Self {
            listener_id: cur.get_u32()?,
        })
    }
}

/// Integer attribute set/get: `{listener_id, attribute, value}`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ListenerAttrInt {
    pub listener_id: u32,
    pub attribute: i32,
    pub value: i32,
}

impl ListenerAttrInt {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(12);
        buf.extend_from_slice(&self.listener_id.to_le_bytes());
        buf.extend_from_slice(&self.attribute.to_le_bytes());
        buf.extend_from_slice(&self.value.to_le_bytes());
        buf
    }

    pub fn decode(body: &[u8]) -> Result<Self> {
        let mut cur = Cursor::new(body);
        Ok(Self {
            listener_id: cur.get_u32()?,
            attribute: cur.get_i32()?,
            value: cur.get_i32()?,
        })
    }
}

/// String/blob attribute set: `{listener_id, attribute, lp bytes}`
#[derive(Debug, Clone, PartialEq)]
pub struct ListenerAttrStr {
    pub listener_id: u32,
    pub attribute: i32,
    pub value: Vec<u8>,
}

impl ListenerAttrStr {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(12 + self.value.len());
        buf.extend_from_slice(&self.listener_id.to_le_bytes());
        buf.extend_from_slice(&self.attribute.to_le_bytes());
        put_lp_bytes(&mut buf, &self.value);
        buf
    }

    pub fn decode(body: &[u8]) -> Result<Self> {
        let mut cur = Cursor::new(body);
        Ok(Self {
            listener_id: cur.get_u32()?,
            attribute: cur.get_i32()?,
            value: cur.get_lp_vec()?,
        })
    }
}

/// Integer attribute get request: `{listener_id, attribute}`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ListenerGetAttr {
    pub listener_id: u32,
    pub attribute: i32,
}

impl ListenerGetAttr {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8);
        buf.extend_from_slice(&self.listener_id.to_le_bytes());
        buf.extend_from_slice(&self.attribute.to_le_bytes());
        buf
    }

    pub fn decode(body: &[u8]) -> Result<Self> {
        let mut cur = Cursor::new(body);
        Ok(Self {
            listener_id: cur.get_u32()?,
            attribute: cur.get_i32()?,
        })
    }
}

/// Integer attribute value reply
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AttrIntReply {
    pub value: i32,
}

impl AttrIntReply {
    pub fn encode(&self) -> Vec<u8> {
        self.value.to_le_bytes().to_vec()
    }

    pub fn decode(body: &[u8]) -> Result<Self> {
        let mut cur = Cursor::new(body);
        Ok(Self {
            value: cur.get_i32()?,
        })
    }
}

/// Manager-level attribute set/get keyed by sensor URI
#[derive(Debug, Clone, PartialEq)]
pub struct ManagerAttrInt {
    pub uri: String,
    pub attribute: i32,
    pub value: i32,
}

impl ManagerAttrInt {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        put_lp_str(&mut buf, &self.uri);
        buf.extend_from_slice(&self.attribute.to_le_bytes());
        buf.extend_from_slice(&self.value.to_le_bytes());
        buf
    }

    pub fn decode(body: &[u8]) -> Result<Self> {
        let mut cur = Cursor::new(body);
        Ok(Self {
            uri: cur.get_lp_str()?,
            attribute: cur.get_i32()?,
            value: cur.get_i32()?,
        })
    }
}

/// Outbound sensor event: `{listener_id, sensor data}`
#[derive(Debug, Clone, PartialEq)]
pub struct ListenerEvent {
    pub listener_id: u32,
    pub data: SensorData,
}

impl ListenerEvent {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4 + self.data.encoded_len());
        buf.extend_from_slice(&self.listener_id.to_le_bytes());
        self.data.encode_into(&mut buf);
        buf
    }

    pub fn decode(body: &[u8]) -> Result<Self> {
        let mut cur = Cursor::new(body);
        let listener_id = cur.get_u32()?;
        let data = SensorData::decode(cur.remaining())?;
        Ok(Self { listener_id, data })
    }
}

/// `LISTENER_ACCURACY_EVENT`: the stream's accuracy changed between samples
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ListenerAccuracyEvent {
    pub listener_id: u32,
    pub timestamp: u64,
    pub accuracy: i32,
}

impl ListenerAccuracyEvent {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(16);
        buf.extend_from_slice(&self.listener_id.to_le_bytes());
        buf.extend_from_slice(&self.timestamp.to_le_bytes());
        buf.extend_from_slice(&self.accuracy.to_le_bytes());
        buf
    }

    pub fn decode(body: &[u8]) -> Result<Self> {
        let mut cur = Cursor::new(body);
        Ok(Self {
            listener_id: cur.get_u32()?,
            timestamp: cur.get_u64()?,
            accuracy: cur.get_i32()?,
        })
    }
}

/// `LISTENER_GET_DATA_LIST` reply: `[u32 count][sensor data]*`.
/// A partial server-side failure truncates the list; `count` is authoritative.
#[derive(Debug, Clone, PartialEq)]
pub struct DataListReply {
    pub entries: Vec<SensorData>,
}

impl DataListReply {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(self.entries.len() as u32).to_le_bytes());
        for e in &self.entries {
            e.encode_into(&mut buf);
        }
        buf
    }

    pub fn decode(body: &[u8]) -> Result<Self> {
        let mut cur = Cursor::new(body);
        let count = cur.get_u32()? as usize;
        let mut rest = cur.remaining();
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            let (d, used) = SensorData::decode_from(rest)?;
            entries.push(d);
            rest = &rest[used..];
        }
        if !rest.is_empty() {
            return Err(Error::InvalidMessage("trailing bytes in data list".into()));
        }
        Ok(Self { entries })
    }
}

/// `PROVIDER_PUBLISH` request: `{lp uri, sensor data}`
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderPublish {
    pub uri: String,
    pub data: SensorData,
}

impl ProviderPublish {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        put_lp_str(&mut buf, &self.uri);
        self.data.encode_into(&mut buf);
        buf
    }

    pub fn decode(body: &[u8]) -> Result<Self> {
        let mut cur = Cursor::new(body);
        let uri = cur.get_lp_str()?;
        let data = SensorData::decode(cur.remaining())?;
        Ok(Self { uri, data })
    }
}

/// `HAS_PRIVILEGE` request: the sensor URI to check. The reply carries the
/// verdict purely in the header `err` field (0 or -EACCES).
#[derive(Debug, Clone, PartialEq)]
pub struct HasPrivilege {
    pub uri: String,
}

impl HasPrivilege {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        put_lp_str(&mut buf, &self.uri);
        buf
    }

    pub fn decode(body: &[u8]) -> Result<Self> {
        let mut cur = Cursor::new(body);
        Ok(Self {
            uri: cur.get_lp_str()?,
        })
    }
}
