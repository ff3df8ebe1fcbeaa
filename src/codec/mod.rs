//! Codec module - serialization/deserialization for payloads.
//!
//! Structured payloads travel as MessagePack; the codec is a marker
//! struct with static methods so call sites stay monomorphic.

mod msgpack;

pub use msgpack::MsgPackCodec;
