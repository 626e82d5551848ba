//! The wire-level message unit exchanged between remoting peers.
//!
//! A command travels as one frame: a 4-byte big-endian length prefix followed
//! by `code | flag | opaque | remark | custom header | body`. All integers
//! are big-endian; nullable fields (remark, custom header) encode their
//! length as -1 when absent.

use crate::{RemotingError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{de::DeserializeOwned, Serialize};
use std::sync::atomic::{AtomicI32, Ordering};

/// Flag bit distinguishing a response from a request.
pub const RESPONSE_FLAG: i32 = 1;
/// Flag bit marking a request as oneway: no response expected or sent.
pub const ONEWAY_FLAG: i32 = 1 << 1;

/// Status codes carried in `code` on responses.
pub mod response_code {
    pub const SUCCESS: i32 = 0;
    pub const SYSTEM_ERROR: i32 = 1;
    pub const SYSTEM_BUSY: i32 = 2;
    pub const REQUEST_CODE_NOT_SUPPORTED: i32 = 3;
}

// Correlation ids are never reissued while a pending entry for them can
// still exist: the counter is monotonically increasing across the process.
static OPAQUE_COUNTER: AtomicI32 = AtomicI32::new(0);

fn next_opaque() -> i32 {
    OPAQUE_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Whether a command carries a request or a response, derived from the flag
/// field rather than transmitted separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandType {
    Request,
    Response,
}

/// The wire-level message unit.
///
/// `code` identifies the business command on requests and doubles as the
/// status code on responses. `opaque` is the correlation id echoed verbatim
/// by the responding peer. `custom_header` is opaque to the transport layer;
/// collaborators encode and decode it through the typed helpers.
#[derive(Debug, Clone)]
pub struct RemotingCommand {
    pub code: i32,
    pub flag: i32,
    pub opaque: i32,
    pub remark: Option<String>,
    pub custom_header: Option<Bytes>,
    pub body: Bytes,
}

impl RemotingCommand {
    /// Create a request command with a fresh correlation id.
    pub fn create_request(code: i32) -> Self {
        Self {
            code,
            flag: 0,
            opaque: next_opaque(),
            remark: None,
            custom_header: None,
            body: Bytes::new(),
        }
    }

    /// Create a request command carrying a typed custom header.
    pub fn create_request_with_header<H: Serialize>(code: i32, header: &H) -> Result<Self> {
        let mut command = Self::create_request(code);
        command.custom_header = Some(Bytes::from(serde_json::to_vec(header)?));
        Ok(command)
    }

    /// Create a response command; the correlation id is filled in from the
    /// originating request before sending.
    pub fn create_response(code: i32, remark: Option<String>) -> Self {
        Self {
            code,
            flag: RESPONSE_FLAG,
            opaque: 0,
            remark,
            custom_header: None,
            body: Bytes::new(),
        }
    }

    /// Request or response, from the flag field.
    pub fn command_type(&self) -> CommandType {
        if self.flag & RESPONSE_FLAG != 0 {
            CommandType::Response
        } else {
            CommandType::Request
        }
    }

    pub fn is_response(&self) -> bool {
        self.command_type() == CommandType::Response
    }

    /// Mark this command as a response.
    pub fn mark_response(&mut self) {
        self.flag |= RESPONSE_FLAG;
    }

    /// Mark this request as oneway.
    pub fn mark_oneway(&mut self) {
        self.flag |= ONEWAY_FLAG;
    }

    pub fn is_oneway(&self) -> bool {
        self.flag & ONEWAY_FLAG != 0
    }

    /// Attach a typed custom header.
    pub fn set_custom_header<H: Serialize>(&mut self, header: &H) -> Result<()> {
        self.custom_header = Some(Bytes::from(serde_json::to_vec(header)?));
        Ok(())
    }

    /// Decode the custom header into a collaborator-owned header type.
    pub fn decode_custom_header<H: DeserializeOwned>(&self) -> Result<H> {
        let raw = self.custom_header.as_ref().ok_or_else(|| {
            RemotingError::Decode("command carries no custom header".to_string())
        })?;
        Ok(serde_json::from_slice(raw)?)
    }

    /// Encode the command into a full frame, length prefix included.
    pub fn encode(&self) -> Bytes {
        let remark = self.remark.as_deref().map(str::as_bytes);
        let header = self.custom_header.as_deref();

        let payload_len = 4 + 4 + 4
            + 4 + remark.map_or(0, <[u8]>::len)
            + 4 + header.map_or(0, <[u8]>::len)
            + self.body.len();

        let mut buf = BytesMut::with_capacity(4 + payload_len);
        buf.put_i32(payload_len as i32);
        buf.put_i32(self.code);
        buf.put_i32(self.flag);
        buf.put_i32(self.opaque);
        put_nullable(&mut buf, remark);
        put_nullable(&mut buf, header);
        buf.put_slice(&self.body);
        buf.freeze()
    }

    /// Decode a command from one complete frame with the length prefix
    /// already stripped by the frame assembler.
    pub fn decode(frame: Bytes) -> Result<Self> {
        let mut buf = frame;
        if buf.len() < 12 {
            return Err(RemotingError::Decode(format!(
                "frame too short for command header: {} bytes",
                buf.len()
            )));
        }

        let code = buf.get_i32();
        let flag = buf.get_i32();
        let opaque = buf.get_i32();

        let remark = match get_nullable(&mut buf, "remark")? {
            Some(bytes) => Some(
                String::from_utf8(bytes.to_vec())
                    .map_err(|e| RemotingError::Decode(format!("remark is not utf-8: {}", e)))?,
            ),
            None => None,
        };
        let custom_header = get_nullable(&mut buf, "custom header")?;

        Ok(Self {
            code,
            flag,
            opaque,
            remark,
            custom_header,
            body: buf,
        })
    }
}

fn put_nullable(buf: &mut BytesMut, field: Option<&[u8]>) {
    match field {
        Some(bytes) => {
            buf.put_i32(bytes.len() as i32);
            buf.put_slice(bytes);
        }
        None => buf.put_i32(-1),
    }
}

fn get_nullable(buf: &mut Bytes, what: &str) -> Result<Option<Bytes>> {
    if buf.len() < 4 {
        return Err(RemotingError::Decode(format!(
            "frame truncated before {} length",
            what
        )));
    }
    let len = buf.get_i32();
    if len < 0 {
        return Ok(None);
    }
    let len = len as usize;
    if buf.len() < len {
        return Err(RemotingError::Decode(format!(
            "{} length {} exceeds remaining {} bytes",
            what,
            len,
            buf.len()
        )));
    }
    Ok(Some(buf.split_to(len)))
}
