//! Wire message framing
//!
//! Every request, reply, and event is one `Message`: a fixed 24-byte header
//! followed by an opaque body. The header is sent verbatim before the body in
//! both directions; a body of length zero is skipped entirely on the wire.
//!
//! ```text
//! ┌────────────┬───────────┬──────────┬─────────────┬──────────────┐
//! │ id (8)     │ cmd (4)   │ err (4)  │ length (4)  │ reserved (4) │
//! └────────────┴───────────┴──────────┴─────────────┴──────────────┘
//! ```
//!
//! All header fields are little-endian. A reply carrying only an error code
//! has `length == 0` and a nonzero `err`; receivers must check `err` before
//! interpreting the body.

use std::sync::atomic::{AtomicU64, Ordering};

/// Maximum total body capacity. Messages whose declared length exceeds this
/// are rejected before any body is read.
pub const MAX_MSG_CAPACITY: usize = 64 * 1024;

/// Fixed header size on the wire
pub const HEADER_SIZE: usize = 24;

/// Per-process message id sequence. Informational only; replies echo the
/// request id so clients can correlate them.
static NEXT_MSG_ID: AtomicU64 = AtomicU64::new(1);

/// Fixed-layout message header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Monotonically increasing per-process sequence
    pub id: u64,
    /// Command/event code
    pub cmd: u32,
    /// 0 = success, negative errno-style code on error
    pub err: i32,
    /// Body byte length, 0 permitted
    pub length: u32,
    /// Reserved, always 0 on send
    pub reserved: u32,
}

impl Header {
    /// Encode to wire bytes
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..8].copy_from_slice(&self.id.to_le_bytes());
        buf[8..12].copy_from_slice(&self.cmd.to_le_bytes());
        buf[12..16].copy_from_slice(&self.err.to_le_bytes());
        buf[16..20].copy_from_slice(&self.length.to_le_bytes());
        buf[20..24].copy_from_slice(&self.reserved.to_le_bytes());
        buf
    }

    /// Decode from wire bytes
    pub fn from_bytes(buf: &[u8; HEADER_SIZE]) -> Self {
        Self {
            id: u64::from_le_bytes([
                buf[0], buf[1], buf[2], buf[3], buf[4], buf[5], buf[6], buf[7],
            ]),
            cmd: u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]),
            err: i32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]),
            length: u32::from_le_bytes([buf[16], buf[17], buf[18], buf[19]]),
            reserved: u32::from_le_bytes([buf[20], buf[21], buf[22], buf[23]]),
        }
    }
}

/// One request/response/event
#[derive(Debug, Clone)]
pub struct Message {
    header: Header,
    body: Vec<u8>,
}

impl Message {
    /// Create an empty message with the given command code
    pub fn new(cmd: u32) -> Self {
        Self {
            header: Header {
                id: NEXT_MSG_ID.fetch_add(1, Ordering::Relaxed),
                cmd,
                err: 0,
                length: 0,
                reserved: 0,
            },
            body: Vec::new(),
        }
    }

    /// Create a message and enclose a body in one step
    pub fn with_body(cmd: u32, body: &[u8]) -> Self {
        let mut msg = Self::new(cmd);
        msg.enclose(body);
        msg
    }

    /// Build a zero-length error reply to `request`
    pub fn error_reply(request_cmd: u32, request_id: u64, err: i32) -> Self {
        let mut msg = Self::new(request_cmd);
        msg.header.id = request_id;
        msg.header.err = err;
        msg
    }

    /// Build a reply to `request` carrying `body`
    pub fn reply_to(request_cmd: u32, request_id: u64, body: &[u8]) -> Self {
        let mut msg = Self::with_body(request_cmd, body);
        msg.header.id = request_id;
        msg
    }

    /// Copy `bytes` into the body.
    ///
    /// If the body would exceed [`MAX_MSG_CAPACITY`] this is a silent no-op
    /// and the message size stays 0. Longstanding wire behavior; callers that
    /// care check `len()` afterwards.
    pub fn enclose(&mut self, bytes: &[u8]) {
        if bytes.len() > MAX_MSG_CAPACITY {
            log::warn!(
                "enclose: {} bytes exceeds capacity {}, dropped",
                bytes.len(),
                MAX_MSG_CAPACITY
            );
            return;
        }
        self.body.clear();
        self.body.extend_from_slice(bytes);
        self.header.length = self.body.len() as u32;
    }

    /// Copy the body out into `dst` if it fits. Returns the copied length,
    /// or 0 if `dst` is too small.
    pub fn disclose(&self, dst: &mut [u8]) -> usize {
        if self.body.len() > dst.len() {
            return 0;
        }
        dst[..self.body.len()].copy_from_slice(&self.body);
        self.body.len()
    }

    /// Body bytes
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Body length
    pub fn len(&self) -> usize {
        self.body.len()
    }

    /// True when the body is empty
    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }

    /// Command/event code
    pub fn cmd(&self) -> u32 {
        self.header.cmd
    }

    /// Set the command/event code
    pub fn set_cmd(&mut self, cmd: u32) {
        self.header.cmd = cmd;
    }

    /// Header error code
    pub fn err(&self) -> i32 {
        self.header.err
    }

    /// Set the header error code
    pub fn set_err(&mut self, err: i32) {
        self.header.err = err;
    }

    /// Message id
    pub fn id(&self) -> u64 {
        self.header.id
    }

    /// Overwrite the message id (used by replies to echo the request id)
    pub fn set_id(&mut self, id: u64) {
        self.header.id = id;
    }

    /// Header value
    pub fn header(&self) -> &Header {
        &self.header
    }

    /// Rebuild a message from a received header and body
    pub fn from_parts(header: Header, body: Vec<u8>) -> Self {
        Self { header, body }
    }
}
