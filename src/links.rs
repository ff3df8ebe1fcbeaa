//! Process-wide directory of peer service addresses.
//!
//! Every process keeps one table of `service name -> addresses`. The
//! `list-links` command exchanges this table with each dialed server:
//! the client sends its own links and merges the server's response, so
//! the directory converges as connections are made.

use std::collections::HashMap;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

/// One known service endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    /// Service name.
    pub service: String,
    /// Address the service can be dialed at.
    pub addr: String,
}

static DIRECTORY: OnceLock<parking_lot::RwLock<HashMap<String, Vec<String>>>> = OnceLock::new();

fn directory() -> &'static parking_lot::RwLock<HashMap<String, Vec<String>>> {
    DIRECTORY.get_or_init(Default::default)
}

/// Record a service address in the local directory.
pub fn announce(service: &str, addr: &str) {
    let mut dir = directory().write();
    let addrs = dir.entry(service.to_string()).or_default();
    if !addrs.iter().any(|a| a == addr) {
        addrs.push(addr.to_string());
    }
}

/// Snapshot of every known link.
pub fn known() -> Vec<Link> {
    let dir = directory().read();
    let mut links: Vec<Link> = dir
        .iter()
        .flat_map(|(service, addrs)| {
            addrs.iter().map(move |addr| Link {
                service: service.clone(),
                addr: addr.clone(),
            })
        })
        .collect();
    links.sort_by(|a, b| (&a.service, &a.addr).cmp(&(&b.service, &b.addr)));
    links
}

/// Known addresses for one service.
pub fn lookup(service: &str) -> Vec<String> {
    directory()
        .read()
        .get(service)
        .cloned()
        .unwrap_or_default()
}

/// Merge a peer's link list into the local directory.
pub(crate) fn merge(links: Vec<Link>) {
    if links.is_empty() {
        return;
    }
    let mut dir = directory().write();
    for link in links {
        let addrs = dir.entry(link.service).or_default();
        if !addrs.iter().any(|a| *a == link.addr) {
            addrs.push(link.addr);
        }
    }
}
