//! Response status codes and response-body decoding.
//!
//! A response body is `status:int || payload`. When the status is OK the
//! payload is the msgpack-encoded result; otherwise the payload is an
//! explanation string.

use std::fmt;

use serde::de::DeserializeOwned;

use crate::error::{MuxwireError, Result};

/// Response status code.
///
/// `Status::OK` marks a successful response; any other value is an
/// application-defined failure carried back as a
/// [`MuxwireError::Response`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Status(pub i32);

impl Status {
    /// Successful response.
    pub const OK: Status = Status(0);
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Status::OK {
            write!(f, "status OK")
        } else {
            write!(f, "status {}", self.0)
        }
    }
}

/// Decode a response body into `output`.
///
/// Reads the leading status integer. Non-OK statuses are returned as
/// [`MuxwireError::Response`] with the explanation string that follows;
/// `output` is never touched on that path. An OK status with no `output`
/// supplied discards the payload.
pub(crate) fn read_reply<Out>(body: &[u8], output: Option<&mut Out>) -> Result<()>
where
    Out: DeserializeOwned,
{
    let mut rd: &[u8] = body;
    let code: i64 = rmp::decode::read_int(&mut rd)
        .map_err(|e| MuxwireError::Protocol(format!("bad response status: {}", e)))?;
    let status = Status(code as i32);
    if status != Status::OK {
        let expl = rmp_serde::from_slice::<String>(rd).unwrap_or_else(|_| "<?>".to_owned());
        return Err(MuxwireError::Response { code: status, expl });
    }
    if let Some(out) = output {
        *out = rmp_serde::from_slice(rd)?;
    }
    Ok(())
}
