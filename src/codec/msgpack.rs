//! MsgPack codec using `rmp-serde`.
//!
//! Always uses `to_vec_named`/`write_named` so structs are serialized as
//! maps (with field names) rather than positional arrays. The servers on
//! the other end of the wire expect the map format, and it keeps payloads
//! decodable by peers that do not share our struct definitions.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;

/// MessagePack codec for structured payloads.
pub struct MsgPackCodec;

impl MsgPackCodec {
    /// Encode a value to MsgPack bytes.
    ///
    /// # Errors
    ///
    /// Returns error if the value cannot be serialized.
    #[inline]
    pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(value)?)
    }

    /// Encode a value to MsgPack, appending to an existing buffer.
    ///
    /// Used on the request hot path so the waiter's buffer is reused
    /// instead of allocating a fresh vector per call.
    #[inline]
    pub fn encode_into<T: Serialize + ?Sized>(buf: &mut Vec<u8>, value: &T) -> Result<()> {
        rmp_serde::encode::write_named(buf, value)?;
        Ok(())
    }

    /// Decode MsgPack bytes to a value.
    ///
    /// # Errors
    ///
    /// Returns error if the bytes cannot be deserialized to type T.
    #[inline]
    pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}
