//! Error types for muxwire.

use thiserror::Error;

use crate::protocol::Status;

/// Main error type for all muxwire operations.
#[derive(Debug, Error)]
pub enum MuxwireError {
    /// I/O error during dial or transport operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Operation attempted on a closed client or cluster.
    #[error("client is closed")]
    Closed,

    /// The server did not respond before the timeout scavenger
    /// freed the waiting caller.
    #[error("the server did not respond in time")]
    Timeout,

    /// Encoded message body exceeds 65,535 bytes.
    #[error("message body too large")]
    TooLarge,

    /// The cluster has no live clients and cannot dial any.
    #[error("no clients available")]
    NoClients,

    /// Fatal transport error; surfaced to every pending caller.
    #[error("fatal transport error: {0}")]
    Fatal(String),

    /// Protocol error (malformed frame, bad response body, etc.).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The server returned a non-OK status with an explanation.
    #[error("server responded with {code}: {expl}")]
    Response {
        /// Status code carried in the response.
        code: Status,
        /// Explanation string from the server.
        expl: String,
    },

    /// MsgPack serialization error.
    #[error("msgpack encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MsgPack deserialization error.
    #[error("msgpack decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// The handshake ping failed during dial.
    #[error("handshake ping failed: {0}")]
    Handshake(#[source] Box<MuxwireError>),

    /// Command response carried no command code.
    #[error("no response command code")]
    NoCommandCode,

    /// Command response carried the invalid command code.
    #[error("invalid command")]
    InvalidCommand,

    /// Command response carried a code outside the command directory.
    #[error("unknown command")]
    UnknownCommand,
}

/// Result type alias using MuxwireError.
pub type Result<T> = std::result::Result<T, MuxwireError>;
