//! Messages between the coordinator and the Argon2 worker.
//!
//! Each message is a big-endian `u32` length followed by that many bytes of
//! JSON.

use super::DeriveJob;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::{self, Read, Write};
use thiserror::Error;
use zeroize::Zeroizing;

pub const MAX_MESSAGE_LEN: usize = 1 << 20;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("malformed message: {0}")]
    Json(#[from] serde_json::Error),
    #[error("message of {0} bytes exceeds limit of {MAX_MESSAGE_LEN} bytes")]
    TooLarge(usize),
    #[error("truncated message")]
    Truncated,
}

pub type Result<T, E = ProtocolError> = core::result::Result<T, E>;

#[derive(Serialize, Deserialize, Debug)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Request {
    Derive {
        job: DeriveJob,
        lock_timeout_ms: u64,
    },
    Watchdog {
        #[serde(with = "crate::b64")]
        challenge: Vec<u8>,
    },
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Response {
    Derived {
        #[serde(with = "crate::b64")]
        key: Vec<u8>,
    },
    Failed {
        message: String,
    },
    Watchdog {
        #[serde(with = "crate::b64")]
        response: Vec<u8>,
    },
}

pub fn write_message<W: Write, T: Serialize>(writer: &mut W, message: &T) -> Result<()> {
    let body = Zeroizing::new(serde_json::to_vec(message)?);
    let len = u32::try_from(body.len())
        .ok()
        .filter(|len| *len as usize <= MAX_MESSAGE_LEN)
        .ok_or(ProtocolError::TooLarge(body.len()))?;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(&body)?;
    writer.flush()?;
    Ok(())
}

/// Reads one message, or `None` on a clean end of stream.
pub fn read_message<R: Read, T: DeserializeOwned>(reader: &mut R) -> Result<Option<T>> {
    let mut header = [0u8; 4];
    let mut filled = 0;
    while filled < header.len() {
        match reader.read(&mut header[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => return Err(ProtocolError::Truncated),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }

    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_MESSAGE_LEN {
        return Err(ProtocolError::TooLarge(len));
    }
    let mut body = Zeroizing::new(vec![0u8; len]);
    reader.read_exact(&mut body).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => ProtocolError::Truncated,
        _ => e.into(),
    })?;
    Ok(Some(serde_json::from_slice(&body)?))
}
