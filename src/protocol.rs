//! Control-plane wire format: versioned length-prefixed JSON records
//!
//! Each record is one version byte, a big-endian u32 payload length,
//! then that many bytes of JSON. One request record yields exactly
//! one response record; a connection carries any number of pairs.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use zygote_core::{Meta, Result, ZygoteError};

pub const PROTOCOL_VERSION: u8 = 1;

/// Upper bound on a record payload; anything larger is a framing bug
const MAX_RECORD_LEN: u32 = 16 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Request {
    Create { meta: Meta },
    Delete { id: String },
    Start { id: String },
    Stop { id: String },
    Pause { id: String },
    Unpause { id: String },
    Fork { id: String },
    List,
    Inspect { id: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl Response {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            ok: true,
            message: message.into(),
            payload: None,
        }
    }

    pub fn ok_with<T: Serialize>(message: impl Into<String>, payload: &T) -> Self {
        Self {
            ok: true,
            message: message.into(),
            payload: serde_json::to_value(payload).ok(),
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            message: message.into(),
            payload: None,
        }
    }
}

/// Write one framed record
pub fn write_record<W: Write, T: Serialize>(writer: &mut W, value: &T) -> Result<()> {
    let body =
        serde_json::to_vec(value).map_err(|e| ZygoteError::Protocol(format!("encode: {}", e)))?;
    if body.len() as u64 > MAX_RECORD_LEN as u64 {
        return Err(ZygoteError::Protocol(format!(
            "record of {} bytes exceeds limit",
            body.len()
        )));
    }
    writer.write_all(&[PROTOCOL_VERSION])?;
    writer.write_all(&(body.len() as u32).to_be_bytes())?;
    writer.write_all(&body)?;
    writer.flush()?;
    Ok(())
}

/// Read one framed record; `Ok(None)` on a cleanly closed connection
pub fn read_record<R: Read, T: DeserializeOwned>(reader: &mut R) -> Result<Option<T>> {
    let mut version = [0u8; 1];
    match reader.read(&mut version)? {
        0 => return Ok(None),
        _ => {}
    }
    if version[0] != PROTOCOL_VERSION {
        return Err(ZygoteError::Protocol(format!(
            "unsupported protocol version {}",
            version[0]
        )));
    }

    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf)?;
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_RECORD_LEN {
        return Err(ZygoteError::Protocol(format!(
            "record of {} bytes exceeds limit",
            len
        )));
    }

    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body)?;
    let value =
        serde_json::from_slice(&body).map_err(|e| ZygoteError::Protocol(format!("decode: {}", e)))?;
    Ok(Some(value))
}
