//! Cluster client: a pool of per-connection clients with round-robin
//! dispatch, failure detection, and re-dialing.
//!
//! The cluster keeps two lists under two ordered locks: the client list
//! (outermost) and the remote address list (innermost). No code path
//! acquires them in the reverse order.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::client::{AsyncResponse, Client};
use crate::error::{MuxwireError, Result};
use crate::transport::{self, Network};

const CLUSTER_CLOSED: u32 = 0;
const CLUSTER_ACTIVE: u32 = 1;

/// Tunables for a cluster client.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Per-client request timeout (the scavenger period).
    pub timeout: Duration,
    /// Initial delay between re-dial attempts to a failed node.
    pub redial_base: Duration,
    /// Cap on the exponential re-dial backoff.
    pub redial_max: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(1000),
            redial_base: Duration::from_millis(100),
            redial_max: Duration::from_secs(5),
        }
    }
}

/// Connection state of a cluster, as reported by
/// [`ClusterClient::status`].
#[derive(Debug, Clone)]
pub struct ClusterStatus {
    /// Stream family the cluster dials.
    pub network: Network,
    /// Resolved addresses of live clients.
    pub connected: Vec<String>,
    /// Known remotes without a live client.
    pub disconnected: Vec<String>,
}

/// A pool of connections to one or more servers.
///
/// Calls are spread over the live clients round-robin. A client that
/// fails with a transport error is removed from the pool and re-dialed
/// in the background until its node answers or the cluster closes.
#[derive(Clone)]
pub struct ClusterClient {
    inner: Arc<ClusterCore>,
}

impl std::fmt::Debug for ClusterClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterClient").finish_non_exhaustive()
    }
}

struct ClusterCore {
    idx: AtomicU64,
    state: AtomicU32,
    network: Network,
    // lock order: clients before remotes, always
    clients: tokio::sync::RwLock<Vec<Client>>,
    remotes: tokio::sync::Mutex<Vec<String>>,
    config: ClusterConfig,
    done: watch::Sender<bool>,
}

impl ClusterClient {
    /// Dial every address and build a cluster from the connections that
    /// succeed. At least one address is required, and at least one dial
    /// must succeed; when all fail, the first error is returned.
    pub async fn dial(network: Network, addrs: &[&str]) -> Result<ClusterClient> {
        Self::dial_with(network, ClusterConfig::default(), addrs).await
    }

    /// Like [`ClusterClient::dial`] with explicit tunables.
    pub async fn dial_with(
        network: Network,
        config: ClusterConfig,
        addrs: &[&str],
    ) -> Result<ClusterClient> {
        if addrs.is_empty() {
            return Err(MuxwireError::NoClients);
        }
        let (done, _) = watch::channel(false);
        let cluster = ClusterClient {
            inner: Arc::new(ClusterCore {
                idx: AtomicU64::new(0),
                state: AtomicU32::new(CLUSTER_ACTIVE),
                network,
                clients: tokio::sync::RwLock::new(Vec::new()),
                remotes: tokio::sync::Mutex::new(
                    addrs.iter().map(|a| a.to_string()).collect(),
                ),
                config,
                done,
            }),
        };
        if let Err(e) = cluster.dial_all().await {
            let _ = cluster.close().await;
            return Err(e);
        }
        Ok(cluster)
    }

    /// Issue a call on the next client in round-robin order.
    ///
    /// An empty pool triggers a full re-dial first. A transport failure
    /// is returned to the caller and the failed client is handed to the
    /// background re-dialer.
    pub async fn call<In, Out>(
        &self,
        method: u32,
        input: Option<&In>,
        output: Option<&mut Out>,
    ) -> Result<()>
    where
        In: Serialize + ?Sized,
        Out: DeserializeOwned,
    {
        let client = self.acquire().await?;
        let res = client.call(method, input, output).await;
        if let Err(err) = &res {
            self.handle_err(&client, err);
        }
        res
    }

    /// Issue a call without waiting for the response.
    pub async fn call_async<In>(&self, method: u32, input: Option<&In>) -> Result<AsyncResponse>
    where
        In: Serialize + ?Sized,
    {
        let client = self.acquire().await?;
        let res = client.call_async(method, input).await;
        if let Err(err) = &res {
            self.handle_err(&client, err);
        }
        res
    }

    /// Dial one more address and add it to the pool, recording the
    /// remote if it is not already known.
    pub async fn add(&self, addr: &str) -> Result<()> {
        if !self.inner.is_active() {
            return Err(MuxwireError::Closed);
        }
        self.inner.dial_one(addr, true).await
    }

    /// Idempotently close the cluster and every pooled client.
    pub async fn close(&self) -> Result<()> {
        let core = &self.inner;
        if core
            .state
            .compare_exchange(
                CLUSTER_ACTIVE,
                CLUSTER_CLOSED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return Err(MuxwireError::Closed);
        }
        let _ = core.done.send(true);

        let drained: Vec<Client> = {
            let mut clients = core.clients.write().await;
            clients.drain(..).collect()
        };
        let mut closers = JoinSet::new();
        for client in drained {
            closers.spawn(async move {
                let _ = client.close().await;
            });
        }
        while closers.join_next().await.is_some() {}
        Ok(())
    }

    /// Snapshot of connected and disconnected remotes.
    pub async fn status(&self) -> ClusterStatus {
        let core = &self.inner;
        let connected: Vec<String> = {
            let clients = core.clients.read().await;
            clients
                .iter()
                .map(|c| c.remote_addr().to_string())
                .collect()
        };
        let remotes = core.remotes.lock().await;
        let disconnected = remotes
            .iter()
            .filter(|r| !connected.iter().any(|c| c == *r))
            .cloned()
            .collect();
        ClusterStatus {
            network: core.network,
            connected,
            disconnected,
        }
    }

    /// Round-robin a client out of the pool, re-dialing the whole remote
    /// list when the pool is empty.
    async fn acquire(&self) -> Result<Client> {
        loop {
            if let Some(client) = self.next().await {
                return Ok(client);
            }
            if !self.inner.is_active() {
                return Err(MuxwireError::Closed);
            }
            self.dial_all().await?;
        }
    }

    async fn next(&self) -> Option<Client> {
        let i = self.inner.idx.fetch_add(1, Ordering::Relaxed);
        let clients = self.inner.clients.read().await;
        if clients.is_empty() {
            return None;
        }
        Some(clients[(i % clients.len() as u64) as usize].clone())
    }

    /// Dial every known remote in parallel, if and only if the pool is
    /// empty. The client-list lock is held for the whole dialing period
    /// so concurrent triggers collapse into one attempt.
    async fn dial_all(&self) -> Result<()> {
        let core = &self.inner;
        let mut clients = core.clients.write().await;
        if !clients.is_empty() {
            // raced another dialer; its work is good enough
            return Ok(());
        }
        let mut remotes = core.remotes.lock().await;
        if remotes.is_empty() {
            return Err(MuxwireError::NoClients);
        }

        let mut dialers = JoinSet::new();
        for (idx, addr) in remotes.iter().enumerate() {
            let network = core.network;
            let addr = addr.clone();
            let timeout = core.config.timeout;
            dialers.spawn(async move {
                let outcome = dial_remote(network, &addr, timeout).await;
                (idx, addr, outcome)
            });
        }

        let mut first_err: Option<MuxwireError> = None;
        let mut any = false;
        while let Some(joined) = dialers.join_next().await {
            let Ok((idx, addr, outcome)) = joined else {
                continue;
            };
            match outcome {
                Ok((resolved, client)) => {
                    // keep the resolved form so status comparisons hold
                    remotes[idx] = resolved;
                    clients.push(client);
                    any = true;
                }
                Err(e) => {
                    tracing::warn!("error dialing {} {}: {}", core.network, addr, e);
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
            }
        }

        if any {
            Ok(())
        } else {
            Err(first_err.unwrap_or(MuxwireError::NoClients))
        }
    }

    /// Route a call failure: transport-level failures evict the client
    /// and schedule a re-dial; per-call failures (timeout, non-OK
    /// response, codec) leave the pool alone.
    fn handle_err(&self, client: &Client, err: &MuxwireError) {
        let fatal = matches!(
            err,
            MuxwireError::Fatal(_)
                | MuxwireError::Closed
                | MuxwireError::Io(_)
                | MuxwireError::Handshake(_)
        );
        if !fatal {
            return;
        }
        let core = self.inner.clone();
        let client = client.clone();
        tokio::spawn(async move {
            core.redial(client).await;
        });
    }
}

impl ClusterCore {
    fn is_active(&self) -> bool {
        self.state.load(Ordering::Acquire) == CLUSTER_ACTIVE
    }

    /// Remove the client from the pool; the winner of a racing removal
    /// proceeds to re-dial while losers back off.
    async fn remove(&self, target: &Client) -> bool {
        let mut clients = self.clients.write().await;
        match clients.iter().position(|c| c.ptr_eq(target)) {
            Some(pos) => {
                clients.swap_remove(pos);
                true
            }
            None => false,
        }
    }

    /// Dial one remote and append the client, optionally recording the
    /// resolved address in the remote list.
    async fn dial_one(&self, addr: &str, register: bool) -> Result<()> {
        let (resolved, client) = dial_remote(self.network, addr, self.config.timeout).await?;
        if register {
            let mut remotes = self.remotes.lock().await;
            if !remotes.iter().any(|r| *r == resolved) {
                remotes.push(resolved.clone());
            }
        }
        self.clients.write().await.push(client);
        Ok(())
    }

    /// Replace a failed client, retrying with exponential backoff until
    /// the node answers or the cluster closes.
    async fn redial(self: Arc<Self>, failed: Client) {
        if !self.remove(&failed).await {
            // another task won the removal race
            return;
        }
        let _ = failed.close().await;
        let addr = failed.remote_addr().to_string();
        if addr.is_empty() {
            tracing::warn!("dropping client with unknown remote, cannot re-dial");
            return;
        }
        tracing::info!("re-dialing {}", addr);

        let mut done = self.done.subscribe();
        let mut delay = self.config.redial_base;
        loop {
            if !self.is_active() {
                return;
            }
            match self.dial_one(&addr, false).await {
                Ok(()) => {
                    tracing::info!("re-connected to {}", addr);
                    return;
                }
                Err(e) => {
                    tracing::warn!("re-dialing {} failed: {}", addr, e);
                }
            }
            let stop = tokio::select! {
                _ = done.wait_for(|closed| *closed) => true,
                _ = tokio::time::sleep(delay) => false,
            };
            if stop {
                return;
            }
            delay = (delay * 2).min(self.config.redial_max);
        }
    }
}

/// Dial and handshake one remote, returning the resolved address used
/// for status comparisons.
async fn dial_remote(
    network: Network,
    addr: &str,
    timeout: Duration,
) -> Result<(String, Client)> {
    let stream = transport::connect(network, addr).await?;
    let resolved = stream
        .peer_addr_string()
        .unwrap_or_else(|| addr.to_string());
    let client = Client::from_parts(stream, resolved.clone(), timeout).await?;
    Ok((resolved, client))
}
