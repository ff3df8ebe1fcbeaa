//! Protocol module - wire format and response decoding.
//!
//! This module implements the binary protocol for the data plane:
//! - 12-byte lead encoding/decoding
//! - frame kinds
//! - response status and body decoding

mod reply;
mod wire_format;

pub use reply::Status;
pub(crate) use reply::read_reply;
pub use wire_format::{put_frame, read_frame, Kind, LEAD_SIZE, MAX_BODY_SIZE};
