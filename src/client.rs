//! Client core: connection ownership, request multiplexing, lifecycle.
//!
//! One [`Client`] owns one full-duplex connection and three long-running
//! tasks:
//!
//! 1. The **reader** decodes frame leads, looks the waiter up by sequence
//!    number, fills its buffer with the response body and signals it.
//! 2. The **writer** drains the bounded writing queue into a buffered
//!    stream, coalescing consecutive frames and flushing when the queue
//!    is momentarily empty.
//! 3. The **scavenger** reaps waiters that have exceeded the timeout.
//!
//! Callers suspend on their waiter's completion signal; the writing
//! queue is bounded at the high-water mark, so `call` exerts
//! backpressure when the writer falls behind.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;

use crate::codec::MsgPackCodec;
use crate::command::{Cmd, COMMAND_COUNT, DIRECTORY};
use crate::error::{MuxwireError, Result};
use crate::links;
use crate::pending::PendingMap;
use crate::protocol::{put_frame, read_frame, read_reply, Kind, LEAD_SIZE, MAX_BODY_SIZE};
use crate::transport::{self, Network};
use crate::waiter::{Waiter, WaiterPool, HIGH_WATER};

const CLIENT_CLOSED: u32 = 0;
const CLIENT_OPEN: u32 = 1;

/// Capacity of the buffered reader and writer wrapping the transport.
const STREAM_BUF: usize = 4096;

/// A client to a single server.
///
/// Cheap to clone; all clones share the same connection and in-flight
/// state. `call` is safe to invoke from any number of tasks
/// simultaneously — responses are correlated back by sequence number.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Core>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").finish_non_exhaustive()
    }
}

impl Client {
    /// Dial `addr` over `network` and handshake.
    ///
    /// `timeout` is the scavenger period: a call that sees no response is
    /// failed with [`MuxwireError::Timeout`] after at most twice this
    /// duration. Dial fails if the server does not answer the handshake
    /// ping.
    pub async fn dial(network: Network, addr: &str, timeout: Duration) -> Result<Client> {
        let stream = transport::connect(network, addr).await?;
        let remote = stream
            .peer_addr_string()
            .unwrap_or_else(|| addr.to_string());
        Client::handshake(stream, remote, timeout).await
    }

    /// Build a client over an already-connected byte stream.
    ///
    /// Use this for streams the crate does not know how to dial itself,
    /// such as TLS-wrapped connections or in-memory pipes.
    pub async fn from_stream<S>(stream: S, timeout: Duration) -> Result<Client>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Client::handshake(stream, String::new(), timeout).await
    }

    /// Build a client over a dialed transport stream, keeping the
    /// resolved remote address for cluster status reporting.
    pub(crate) async fn from_parts(
        stream: transport::Stream,
        remote: String,
        timeout: Duration,
    ) -> Result<Client> {
        Client::handshake(stream, remote, timeout).await
    }

    async fn handshake<S>(stream: S, remote: String, timeout: Duration) -> Result<Client>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (rh, wh) = tokio::io::split(stream);
        let (writing, writing_rx) = mpsc::channel(HIGH_WATER);
        let (done, _) = watch::channel(false);

        let core = Arc::new(Core {
            service: parking_lot::Mutex::new(String::new()),
            remote,
            seq: AtomicU64::new(0),
            state: AtomicU32::new(CLIENT_OPEN),
            writing,
            done,
            inflight: Arc::new(InFlight::new()),
            pending: PendingMap::new(),
            pool: WaiterPool::new(),
            tasks: parking_lot::Mutex::new(Vec::new()),
        });

        let reader = tokio::spawn(read_loop(core.clone(), rh));
        let writer = tokio::spawn(write_loop(core.clone(), writing_rx, wh));
        let scavenger = tokio::spawn(scavenge_loop(core.clone(), timeout));
        core.tasks.lock().extend([reader, writer, scavenger]);

        let client = Client { inner: core };

        // sanity ping before handing the client out
        if let Err(e) = client.send_command(Cmd::Ping, Bytes::new()).await {
            let _ = client.close().await;
            return Err(MuxwireError::Handshake(Box::new(e)));
        }

        // sync links asap
        let synced = client.clone();
        tokio::spawn(async move { synced.sync_links().await });

        Ok(client)
    }

    /// Send a request and block until the response is decoded.
    ///
    /// The request body is `method` followed by `input`; an absent input
    /// is sent as an empty map. When the response status is OK and
    /// `output` is supplied, the payload is decoded into it; `output` is
    /// never touched on any error path.
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
        let core = &self.inner;
        let w = core.pool.pop();
        let res = async {
            let _guard = core.start_call(&w, method, input).await?;
            core.await_reply(&w, output).await
        }
        .await;
        core.pool.push(w);
        res
    }

    /// Send a request without waiting for the response.
    ///
    /// The returned [`AsyncResponse`] must be `read` to decode the
    /// response. The call counts as outstanding until then, so `close`
    /// will wait for it.
    pub async fn call_async<In>(&self, method: u32, input: Option<&In>) -> Result<AsyncResponse>
    where
        In: Serialize + ?Sized,
    {
        let core = &self.inner;
        let w = core.pool.pop();
        match core.start_call(&w, method, input).await {
            Ok(guard) => Ok(AsyncResponse {
                w,
                core: self.inner.clone(),
                _guard: guard,
            }),
            Err(e) => {
                core.pool.push(w);
                Err(e)
            }
        }
    }

    /// Idempotently close the connection.
    ///
    /// Waits for every outstanding call to finish (in-flight requests
    /// are not interrupted), stops the reader, writer, and scavenger,
    /// and joins them. Later invocations return
    /// [`MuxwireError::Closed`].
    pub async fn close(&self) -> Result<()> {
        if !self.inner.cas_closed() {
            return Err(MuxwireError::Closed);
        }
        self.inner.inflight.drained().await;
        let _ = self.inner.done.send(true);
        let handles: Vec<JoinHandle<()>> = self.inner.tasks.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        Ok(())
    }

    /// The server's service name, learned from the handshake ping.
    pub fn service(&self) -> String {
        self.inner.service.lock().clone()
    }

    /// Resolved remote address of the connection, or the empty string
    /// for clients built with [`Client::from_stream`].
    pub fn remote_addr(&self) -> &str {
        &self.inner.remote
    }

    /// Whether the client has been closed, by `close` or by a fatal
    /// transport error.
    pub fn is_closed(&self) -> bool {
        !self.inner.is_open()
    }

    pub(crate) fn ptr_eq(&self, other: &Client) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) async fn send_command(&self, cmd: Cmd, body: Bytes) -> Result<()> {
        let core = &self.inner;
        let w = core.pool.pop();
        let res = async {
            let _guard = core.start_command(&w, cmd, &body).await?;
            core.finish_command(&w).await
        }
        .await;
        core.pool.push(w);
        res
    }

    async fn sync_links(&self) {
        let payload = match MsgPackCodec::encode(&links::known()) {
            Ok(bytes) => Bytes::from(bytes),
            Err(e) => {
                tracing::warn!("link list encode failed: {}", e);
                return;
            }
        };
        if let Err(e) = self.send_command(Cmd::ListLinks, payload).await {
            tracing::warn!("error synchronizing links: {}", e);
        }
    }
}

/// Handle to a response that has been requested but not yet decoded.
pub struct AsyncResponse {
    w: Arc<Waiter>,
    core: Arc<Core>,
    _guard: InFlightGuard,
}

impl AsyncResponse {
    /// Block until the response arrives and decode it, with the same
    /// semantics as [`Client::call`].
    pub async fn read<Out>(self, output: Option<&mut Out>) -> Result<()>
    where
        Out: DeserializeOwned,
    {
        let AsyncResponse { w, core, _guard } = self;
        let res = core.await_reply(&w, output).await;
        core.pool.push(w);
        res
    }
}

/// Shared state behind a [`Client`].
pub(crate) struct Core {
    service: parking_lot::Mutex<String>,
    remote: String,
    seq: AtomicU64,
    state: AtomicU32,
    writing: mpsc::Sender<Arc<Waiter>>,
    done: watch::Sender<bool>,
    inflight: Arc<InFlight>,
    pending: PendingMap,
    pool: WaiterPool,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl Core {
    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn is_open(&self) -> bool {
        self.state.load(Ordering::Acquire) == CLIENT_OPEN
    }

    fn cas_closed(&self) -> bool {
        self.state
            .compare_exchange(
                CLIENT_OPEN,
                CLIENT_CLOSED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub(crate) fn set_service(&self, name: String) {
        *self.service.lock() = name;
    }

    /// Format a request into the waiter's buffer and submit it.
    ///
    /// The in-flight gauge is acquired before the state check so a
    /// concurrent `close` cannot begin draining while the call is being
    /// set up; the guard releases it on every early return.
    async fn start_call<In>(
        &self,
        w: &Arc<Waiter>,
        method: u32,
        input: Option<&In>,
    ) -> Result<InFlightGuard>
    where
        In: Serialize + ?Sized,
    {
        let guard = self.inflight.enter();
        if !self.is_open() {
            return Err(MuxwireError::Closed);
        }
        let seq = self.next_seq();
        {
            let mut buf = w.buf.lock().await;
            buf.clear();
            buf.resize(LEAD_SIZE, 0);
            rmp::encode::write_uint(&mut *buf, u64::from(method))
                .map_err(|e| MuxwireError::Protocol(format!("method encode failed: {}", e)))?;
            match input {
                Some(value) => MsgPackCodec::encode_into(&mut buf, value)?,
                None => {
                    // absent input travels as an empty map
                    rmp::encode::write_map_len(&mut *buf, 0).map_err(|e| {
                        MuxwireError::Protocol(format!("nil body encode failed: {}", e))
                    })?;
                }
            }
            let body_len = buf.len() - LEAD_SIZE;
            if body_len > MAX_BODY_SIZE {
                return Err(MuxwireError::TooLarge);
            }
            put_frame(&mut buf, seq, Kind::Req, body_len as u16);
        }
        self.submit(w, seq).await?;
        Ok(guard)
    }

    /// Format a command into the waiter's buffer and submit it.
    async fn start_command(
        &self,
        w: &Arc<Waiter>,
        cmd: Cmd,
        body: &Bytes,
    ) -> Result<InFlightGuard> {
        let guard = self.inflight.enter();
        if !self.is_open() {
            return Err(MuxwireError::Closed);
        }
        let seq = self.next_seq();
        {
            let mut buf = w.buf.lock().await;
            buf.clear();
            buf.resize(LEAD_SIZE, 0);
            buf.push(cmd as u8);
            buf.extend_from_slice(body);
            let body_len = buf.len() - LEAD_SIZE;
            if body_len > MAX_BODY_SIZE {
                return Err(MuxwireError::TooLarge);
            }
            put_frame(&mut buf, seq, Kind::Cmd, body_len as u16);
        }
        self.submit(w, seq).await?;
        Ok(guard)
    }

    /// Register the waiter in the pending map and enqueue it for the
    /// writer. Enqueueing races against shutdown and against the
    /// scavenger: whichever signal arrives first resolves the call.
    async fn submit(&self, w: &Arc<Waiter>, seq: u64) -> Result<()> {
        w.arm(seq);
        self.pending.insert(w.clone());

        let mut done = self.done.subscribe();
        let outcome = tokio::select! {
            r = self.writing.send(w.clone()) => Some(r.is_ok()),
            _ = done.wait_for(|closed| *closed) => Some(false),
            _ = w.done.notified() => None,
        };
        match outcome {
            Some(true) => Ok(()),
            Some(false) => {
                w.queued.store(false, Ordering::Release);
                if self.pending.remove(seq).is_some() {
                    Err(MuxwireError::Closed)
                } else {
                    // lost the removal race: a completion signal is in
                    // flight, consume it
                    w.done.notified().await;
                    Err(w.take_err().unwrap_or(MuxwireError::Closed))
                }
            }
            None => {
                // reaped or flushed while waiting for queue space
                w.queued.store(false, Ordering::Release);
                Err(w.take_err().unwrap_or(MuxwireError::Closed))
            }
        }
    }

    /// Suspend until the waiter is signalled, then decode the response.
    async fn await_reply<Out>(&self, w: &Arc<Waiter>, output: Option<&mut Out>) -> Result<()>
    where
        Out: DeserializeOwned,
    {
        w.done.notified().await;
        if let Some(err) = w.take_err() {
            return Err(err);
        }
        let buf = w.buf.lock().await;
        read_reply(&buf, output)
    }

    /// Suspend until the waiter is signalled, then run the command's
    /// completion action on the response payload.
    async fn finish_command(&self, w: &Arc<Waiter>) -> Result<()> {
        w.done.notified().await;
        if let Some(err) = w.take_err() {
            return Err(err);
        }
        let buf = w.buf.lock().await;
        if buf.is_empty() {
            return Err(MuxwireError::NoCommandCode);
        }
        let code = buf[0];
        if code == Cmd::Invalid as u8 {
            return Err(MuxwireError::InvalidCommand);
        }
        if code >= COMMAND_COUNT {
            return Err(MuxwireError::UnknownCommand);
        }
        (DIRECTORY[code as usize].done)(self, &buf[1..]);
        Ok(())
    }

    /// Close with a fatal transport error.
    ///
    /// Every pending waiter is failed with the wrapped error. The
    /// scavenger keeps running until the in-flight drain completes, so a
    /// caller whose insert races past the flush still gets reaped rather
    /// than stranded.
    async fn close_error(self: &Arc<Self>, err: MuxwireError) {
        if !self.cas_closed() {
            return;
        }
        tracing::error!("fatal transport error: {}", err);

        let msg = err.to_string();
        loop {
            self.pending.flush(|| MuxwireError::Fatal(msg.clone()));
            if self.pending.len() == 0 {
                break;
            }
        }
        self.inflight.drained().await;
        let _ = self.done.send(true);
    }
}

/// Counter of outstanding caller operations; `close` drains it before
/// tearing the connection down.
struct InFlight {
    count: AtomicUsize,
    zero: Notify,
}

impl InFlight {
    fn new() -> Self {
        Self {
            count: AtomicUsize::new(0),
            zero: Notify::new(),
        }
    }

    fn enter(self: &Arc<Self>) -> InFlightGuard {
        self.count.fetch_add(1, Ordering::AcqRel);
        InFlightGuard {
            gauge: self.clone(),
        }
    }

    async fn drained(&self) {
        loop {
            let mut waiting = std::pin::pin!(self.zero.notified());
            waiting.as_mut().enable();
            if self.count.load(Ordering::Acquire) == 0 {
                return;
            }
            waiting.await;
        }
    }
}

pub(crate) struct InFlightGuard {
    gauge: Arc<InFlight>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.gauge.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.gauge.zero.notify_waiters();
        }
    }
}

/// Reader task: decode leads, route bodies to waiters.
async fn read_loop<R>(core: Arc<Core>, rh: R)
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let mut done = core.done.subscribe();
    let mut br = BufReader::with_capacity(STREAM_BUF, rh);
    let mut lead = [0u8; LEAD_SIZE];
    let mut scratch = Vec::new();

    loop {
        let read = {
            let fut = br.read_exact(&mut lead);
            tokio::select! {
                _ = done.wait_for(|closed| *closed) => None,
                r = fut => Some(r),
            }
        };
        match read {
            None => return,
            Some(Err(e)) => {
                core.close_error(e.into()).await;
                return;
            }
            Some(Ok(_)) => {}
        }

        let (seq, raw_kind, len) = read_frame(&lead);
        let len = len as usize;

        // RES and CMD frames are routed to waiters the same way; any
        // other kind is a protocol error: skip the body and log.
        match Kind::from_wire(raw_kind) {
            Some(Kind::Res) | Some(Kind::Cmd) => {}
            _ => {
                tracing::warn!("server sent a bad frame kind {:#04x}, skipping", raw_kind);
                if !skip_body(&core, &mut br, &mut scratch, len, &mut done).await {
                    return;
                }
                continue;
            }
        }

        let Some(w) = core.pending.remove(seq) else {
            // reply arrived after its waiter timed out
            if !skip_body(&core, &mut br, &mut scratch, len, &mut done).await {
                return;
            }
            continue;
        };

        // fill the waiter's buffer, then notify
        let mut buf = w.buf.lock().await;
        buf.clear();
        buf.resize(len, 0);
        let read = {
            let fut = br.read_exact(&mut buf[..]);
            tokio::select! {
                _ = done.wait_for(|closed| *closed) => None,
                r = fut => Some(r),
            }
        };
        drop(buf);
        match read {
            None => {
                w.fail(MuxwireError::Closed);
                return;
            }
            Some(Ok(_)) => w.complete(),
            Some(Err(e)) => {
                // this waiter already left the pending map, so the flush
                // in close_error cannot reach it
                w.fail(MuxwireError::Fatal(e.to_string()));
                core.close_error(e.into()).await;
                return;
            }
        }
    }
}

async fn skip_body<R>(
    core: &Arc<Core>,
    br: &mut BufReader<R>,
    scratch: &mut Vec<u8>,
    len: usize,
    done: &mut watch::Receiver<bool>,
) -> bool
where
    R: AsyncRead + Send + Unpin + 'static,
{
    if len == 0 {
        return true;
    }
    scratch.clear();
    scratch.resize(len, 0);
    let read = {
        let fut = br.read_exact(&mut scratch[..]);
        tokio::select! {
            _ = done.wait_for(|closed| *closed) => None,
            r = fut => Some(r),
        }
    };
    match read {
        None => false,
        Some(Ok(_)) => true,
        Some(Err(e)) => {
            core.close_error(e.into()).await;
            false
        }
    }
}

/// Writer task: drain the writing queue into the buffered stream,
/// coalescing bursts and flushing when the queue is momentarily empty.
async fn write_loop<W>(core: Arc<Core>, mut rx: mpsc::Receiver<Arc<Waiter>>, wh: W)
where
    W: AsyncWrite + Send + Unpin + 'static,
{
    let mut done = core.done.subscribe();
    let mut bw = BufWriter::with_capacity(STREAM_BUF, wh);

    'outer: loop {
        let w = tokio::select! {
            _ = done.wait_for(|closed| *closed) => break 'outer,
            w = rx.recv() => match w {
                Some(w) => w,
                None => break 'outer,
            },
        };
        if !write_waiter(&core, &mut bw, &w, &mut done).await {
            return;
        }
        loop {
            match rx.try_recv() {
                Ok(next) => {
                    if !write_waiter(&core, &mut bw, &next, &mut done).await {
                        return;
                    }
                }
                Err(mpsc::error::TryRecvError::Empty) => {
                    if !flush_writer(&core, &mut bw, &mut done).await {
                        return;
                    }
                    break;
                }
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    let _ = flush_writer(&core, &mut bw, &mut done).await;
                    return;
                }
            }
        }
    }

    // shutdown: anything still queued has no live caller; just release it
    while let Ok(w) = rx.try_recv() {
        w.queued.store(false, Ordering::Release);
    }
}

async fn write_waiter<W>(
    core: &Arc<Core>,
    bw: &mut BufWriter<W>,
    w: &Arc<Waiter>,
    done: &mut watch::Receiver<bool>,
) -> bool
where
    W: AsyncWrite + Send + Unpin + 'static,
{
    w.queued.store(false, Ordering::Release);
    let buf = w.buf.lock().await;
    let wrote = {
        let fut = bw.write_all(&buf);
        tokio::select! {
            _ = done.wait_for(|closed| *closed) => None,
            r = fut => Some(r),
        }
    };
    drop(buf);
    match wrote {
        None => false,
        Some(Ok(())) => true,
        Some(Err(e)) => {
            core.close_error(e.into()).await;
            false
        }
    }
}

async fn flush_writer<W>(
    core: &Arc<Core>,
    bw: &mut BufWriter<W>,
    done: &mut watch::Receiver<bool>,
) -> bool
where
    W: AsyncWrite + Send + Unpin + 'static,
{
    let flushed = {
        let fut = bw.flush();
        tokio::select! {
            _ = done.wait_for(|closed| *closed) => None,
            r = fut => Some(r),
        }
    };
    match flushed {
        None => false,
        Some(Ok(())) => true,
        Some(Err(e)) => {
            core.close_error(e.into()).await;
            false
        }
    }
}

/// Scavenger task: reap timed-out waiters every `timeout` interval.
///
/// Reaping does not guarantee eviction exactly at the deadline; it
/// bounds the wait to twice the interval.
async fn scavenge_loop(core: Arc<Core>, timeout: Duration) {
    let mut done = core.done.subscribe();
    let mut tick = tokio::time::interval_at(tokio::time::Instant::now() + timeout, timeout);
    loop {
        tokio::select! {
            _ = done.wait_for(|closed| *closed) => return,
            _ = tick.tick() => core.pending.reap(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Instant;
    use tokio::io::DuplexStream;

    const SVC: &str = "echo-service";

    #[derive(Clone, Copy, PartialEq)]
    enum StubMode {
        /// Answer commands and echo request payloads.
        Echo,
        /// Swallow every frame.
        Silent,
        /// Answer commands, swallow requests.
        ControlOnly,
    }

    async fn run_stub(mut stream: DuplexStream, mode: StubMode) {
        let mut lead = [0u8; LEAD_SIZE];
        loop {
            if stream.read_exact(&mut lead).await.is_err() {
                return;
            }
            let (seq, kind, len) = read_frame(&lead);
            let mut body = vec![0u8; len as usize];
            if stream.read_exact(&mut body).await.is_err() {
                return;
            }
            if mode == StubMode::Silent {
                continue;
            }
            match Kind::from_wire(kind) {
                Some(Kind::Cmd) => {
                    let mut reply = vec![0u8; LEAD_SIZE];
                    reply.push(body[0]);
                    if body[0] == Cmd::Ping as u8 {
                        reply.extend_from_slice(SVC.as_bytes());
                    } else {
                        reply.extend_from_slice(
                            &rmp_serde::to_vec_named(&Vec::<links::Link>::new()).unwrap(),
                        );
                    }
                    let body_len = (reply.len() - LEAD_SIZE) as u16;
                    put_frame(&mut reply, seq, Kind::Cmd, body_len);
                    if stream.write_all(&reply).await.is_err() {
                        return;
                    }
                }
                Some(Kind::Req) => {
                    if mode == StubMode::ControlOnly {
                        continue;
                    }
                    // body is method || payload; echo the payload back
                    let mut rd: &[u8] = &body;
                    let _method: u64 = rmp::decode::read_int(&mut rd).unwrap();
                    let mut reply = vec![0u8; LEAD_SIZE];
                    rmp::encode::write_sint(&mut reply, 0).unwrap();
                    reply.extend_from_slice(rd);
                    let body_len = (reply.len() - LEAD_SIZE) as u16;
                    put_frame(&mut reply, seq, Kind::Res, body_len);
                    if stream.write_all(&reply).await.is_err() {
                        return;
                    }
                }
                _ => {}
            }
        }
    }

    async fn connect(mode: StubMode, timeout: Duration) -> Client {
        let (local, remote) = tokio::io::duplex(1 << 20);
        tokio::spawn(run_stub(remote, mode));
        Client::from_stream(local, timeout)
            .await
            .expect("handshake against stub")
    }

    #[tokio::test]
    async fn test_handshake_learns_service_name() {
        let client = connect(StubMode::Echo, Duration::from_millis(500)).await;
        assert_eq!(client.service(), SVC);
        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_handshake_failure_when_server_is_silent() {
        let (local, remote) = tokio::io::duplex(1 << 16);
        tokio::spawn(run_stub(remote, StubMode::Silent));

        let started = Instant::now();
        let err = Client::from_stream(local, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, MuxwireError::Handshake(_)));
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_call_roundtrip() {
        let client = connect(StubMode::Echo, Duration::from_millis(500)).await;

        let mut out = String::new();
        client
            .call(42, Some("hello"), Some(&mut out))
            .await
            .unwrap();
        assert_eq!(out, "hello");

        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_call_without_input_sends_empty_map() {
        let client = connect(StubMode::Echo, Duration::from_millis(500)).await;

        let mut out: HashMap<String, i32> = HashMap::from([("stale".into(), 1)]);
        client.call::<(), _>(7, None, Some(&mut out)).await.unwrap();
        assert!(out.is_empty());

        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_calls_each_get_their_own_reply() {
        #[derive(serde::Serialize, serde::Deserialize, PartialEq, Debug, Default)]
        struct Blob {
            seq: u64,
        }

        let client = connect(StubMode::Echo, Duration::from_secs(1)).await;

        let mut tasks = Vec::new();
        for caller in 0..20u64 {
            let client = client.clone();
            tasks.push(tokio::spawn(async move {
                for i in 0..10u64 {
                    let sent = Blob {
                        seq: caller * 1000 + i,
                    };
                    let mut got = Blob::default();
                    client.call(5, Some(&sent), Some(&mut got)).await.unwrap();
                    assert_eq!(got, sent);
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_sequence_numbers_are_unique() {
        let client = connect(StubMode::Echo, Duration::from_secs(1)).await;
        let before = client.inner.seq.load(Ordering::Acquire);
        for _ in 0..10 {
            client.call::<str, ()>(1, Some("x"), None).await.unwrap();
        }
        let after = client.inner.seq.load(Ordering::Acquire);
        assert_eq!(after - before, 10);
        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_timeout_bounds_and_empties_pending() {
        let timeout = Duration::from_millis(50);
        let client = connect(StubMode::ControlOnly, timeout).await;

        let started = Instant::now();
        let err = client
            .call::<str, ()>(9, Some("never answered"), None)
            .await
            .unwrap_err();
        let elapsed = started.elapsed();

        assert!(matches!(err, MuxwireError::Timeout));
        assert!(elapsed > timeout, "woke before the first reap pass");
        assert!(elapsed <= Duration::from_millis(350), "woke far too late");
        assert_eq!(client.inner.pending.len(), 0);

        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_too_large_payload_rejected_synchronously() {
        let client = connect(StubMode::Echo, Duration::from_secs(1)).await;

        let oversized = "x".repeat(MAX_BODY_SIZE + 1);
        let err = client
            .call::<String, ()>(3, Some(&oversized), None)
            .await
            .unwrap_err();
        assert!(matches!(err, MuxwireError::TooLarge));

        // the connection is still healthy
        let mut out = String::new();
        client.call(3, Some("small"), Some(&mut out)).await.unwrap();
        assert_eq!(out, "small");

        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_max_size_payload_roundtrips() {
        let client = connect(StubMode::Echo, Duration::from_secs(2)).await;

        // leave room for the msgpack string header and the method
        let payload = "y".repeat(60_000);
        let mut out = String::new();
        client
            .call(8, Some(payload.as_str()), Some(&mut out))
            .await
            .unwrap();
        assert_eq!(out, payload);

        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_rejects_calls() {
        let client = connect(StubMode::Echo, Duration::from_secs(1)).await;

        client.close().await.unwrap();
        assert!(matches!(
            client.close().await.unwrap_err(),
            MuxwireError::Closed
        ));
        assert!(client.is_closed());

        let err = client
            .call::<str, ()>(1, Some("late"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, MuxwireError::Closed));
    }

    #[tokio::test]
    async fn test_unknown_frame_kinds_are_skipped() {
        let (local, mut remote) = tokio::io::duplex(1 << 16);

        // hand-rolled stub: handshake, then a junk frame, then the reply
        let stub = tokio::spawn(async move {
            let mut lead = [0u8; LEAD_SIZE];

            // handshake ping
            remote.read_exact(&mut lead).await.unwrap();
            let (seq, _, len) = read_frame(&lead);
            let mut body = vec![0u8; len as usize];
            remote.read_exact(&mut body).await.unwrap();
            let mut reply = vec![0u8; LEAD_SIZE];
            reply.push(Cmd::Ping as u8);
            put_frame(&mut reply, seq, Kind::Cmd, 1);
            remote.write_all(&reply).await.unwrap();

            // request frame (may be preceded by the link sync command)
            loop {
                if remote.read_exact(&mut lead).await.is_err() {
                    return;
                }
                let (seq, kind, len) = read_frame(&lead);
                let mut body = vec![0u8; len as usize];
                if remote.read_exact(&mut body).await.is_err() {
                    return;
                }

                if Kind::from_wire(kind) == Some(Kind::Cmd) {
                    let mut reply = vec![0u8; LEAD_SIZE];
                    reply.push(body[0]);
                    reply.extend_from_slice(
                        &rmp_serde::to_vec_named(&Vec::<links::Link>::new()).unwrap(),
                    );
                    let body_len = (reply.len() - LEAD_SIZE) as u16;
                    put_frame(&mut reply, seq, Kind::Cmd, body_len);
                    remote.write_all(&reply).await.unwrap();
                    continue;
                }

                // junk frame first: kind 9 must be skipped by the reader
                let mut junk = vec![0u8; LEAD_SIZE];
                junk.extend_from_slice(b"garbage");
                junk[8] = 9;
                junk[9..11].copy_from_slice(&7u16.to_be_bytes());
                remote.write_all(&junk).await.unwrap();

                // then the real response
                let mut rd: &[u8] = &body;
                let _method: u64 = rmp::decode::read_int(&mut rd).unwrap();
                let mut reply = vec![0u8; LEAD_SIZE];
                rmp::encode::write_sint(&mut reply, 0).unwrap();
                reply.extend_from_slice(rd);
                let body_len = (reply.len() - LEAD_SIZE) as u16;
                put_frame(&mut reply, seq, Kind::Res, body_len);
                remote.write_all(&reply).await.unwrap();
            }
        });

        let client = Client::from_stream(local, Duration::from_secs(1))
            .await
            .unwrap();

        let mut out = String::new();
        client
            .call(1, Some("after junk"), Some(&mut out))
            .await
            .unwrap();
        assert_eq!(out, "after junk");

        client.close().await.unwrap();
        stub.abort();
    }

    #[tokio::test]
    async fn test_call_async_reads_later() {
        let client = connect(StubMode::Echo, Duration::from_secs(1)).await;

        let pending = client.call_async(6, Some("deferred")).await.unwrap();
        let mut out = String::new();
        pending.read(Some(&mut out)).await.unwrap();
        assert_eq!(out, "deferred");

        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_fatal_error_fails_pending_callers() {
        let (local, mut remote) = tokio::io::duplex(1 << 16);

        let stub = tokio::spawn(async move {
            let mut lead = [0u8; LEAD_SIZE];

            // answer the handshake ping, then cut the connection on the
            // first request
            remote.read_exact(&mut lead).await.unwrap();
            let (seq, _, len) = read_frame(&lead);
            let mut body = vec![0u8; len as usize];
            remote.read_exact(&mut body).await.unwrap();
            let mut reply = vec![0u8; LEAD_SIZE];
            reply.push(Cmd::Ping as u8);
            put_frame(&mut reply, seq, Kind::Cmd, 1);
            remote.write_all(&reply).await.unwrap();

            loop {
                remote.read_exact(&mut lead).await.unwrap();
                let (seq, kind, len) = read_frame(&lead);
                let mut body = vec![0u8; len as usize];
                remote.read_exact(&mut body).await.unwrap();
                if Kind::from_wire(kind) == Some(Kind::Cmd) {
                    let mut reply = vec![0u8; LEAD_SIZE];
                    reply.push(body[0]);
                    reply.extend_from_slice(
                        &rmp_serde::to_vec_named(&Vec::<links::Link>::new()).unwrap(),
                    );
                    let body_len = (reply.len() - LEAD_SIZE) as u16;
                    put_frame(&mut reply, seq, Kind::Cmd, body_len);
                    remote.write_all(&reply).await.unwrap();
                    continue;
                }
                // drop the stream: the client's reader hits EOF
                return;
            }
        });

        let client = Client::from_stream(local, Duration::from_secs(5))
            .await
            .unwrap();

        let err = client
            .call::<str, ()>(2, Some("doomed"), None)
            .await
            .unwrap_err();
        assert!(
            matches!(err, MuxwireError::Fatal(_)),
            "expected fatal, got {:?}",
            err
        );
        assert!(client.is_closed());
        let _ = stub.await;
    }
}
