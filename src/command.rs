//! In-band control messages.
//!
//! Commands share the multiplex with data-plane calls: a CMD frame body
//! is `code(1 byte) || payload`, and responses are routed back through
//! the same pending map. The directory below maps each response code to
//! the client-side completion action.

use crate::client::Core;
use crate::codec::MsgPackCodec;
use crate::links;

/// Command codes carried in the first body byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum Cmd {
    /// Reserved; never sent.
    Invalid = 0,
    /// Round-trip liveness probe; the response carries the server's
    /// service name.
    Ping = 1,
    /// Exchange known peer service addresses.
    ListLinks = 2,
}

/// One past the highest defined command code.
pub(crate) const COMMAND_COUNT: u8 = 3;

pub(crate) struct CommandSpec {
    #[allow(dead_code)]
    pub name: &'static str,
    /// Client-side action applied to the response payload.
    pub done: fn(&Core, &[u8]),
}

/// Static directory indexed by command code.
pub(crate) static DIRECTORY: [CommandSpec; COMMAND_COUNT as usize] = [
    CommandSpec {
        name: "invalid",
        done: invalid_done,
    },
    CommandSpec {
        name: "ping",
        done: ping_done,
    },
    CommandSpec {
        name: "list-links",
        done: list_links_done,
    },
];

fn invalid_done(_core: &Core, _body: &[u8]) {}

/// The ping response payload is the server's service name.
fn ping_done(core: &Core, body: &[u8]) {
    if body.is_empty() {
        return;
    }
    core.set_service(String::from_utf8_lossy(body).into_owned());
}

/// The list-links response payload extends the local link directory.
fn list_links_done(_core: &Core, body: &[u8]) {
    match MsgPackCodec::decode::<Vec<links::Link>>(body) {
        Ok(peer_links) => links::merge(peer_links),
        Err(e) => tracing::warn!("discarding malformed link list: {}", e),
    }
}
