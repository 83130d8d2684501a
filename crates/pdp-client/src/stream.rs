//! Multiplexed decision streams
//!
//! A stream is one TCP socket to a decision server carrying many concurrent
//! requests. Each request gets a correlation id unique on its stream while it
//! is pending; the response frame carries the same id back.
//!
//! Every stream runs two background tasks:
//!
//! - a **writer** that owns the socket's write half and a reusable frame
//!   buffer, fed through a channel so a cancelled caller never leaves half a
//!   frame on the wire
//! - a **reader** that resolves pending requests as their responses arrive
//!
//! When either task hits a transport error the stream is torn down: every
//! pending request fails with [`PdpError::Connection`] and the owning
//! connection is notified through its `broken` signal.

use pdp_common::protocol::error::{PdpError, Result};
use pdp_common::protocol::CorrelationId;
use pdp_common::transport::{TcpTransportAsync, FRAME_HEADER_SIZE};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tracing::instrument::WithSubscriber;
use tracing::{debug, warn};

/// Requests queued for the writer before callers wait for room.
const OUTBOX_DEPTH: usize = 256;

/// Starting estimate for automatically sized buffers.
const AUTO_INITIAL_SIZE: usize = 1024;

type Waiter = oneshot::Sender<Result<Vec<u8>>>;

/// How a stream sizes its outgoing frame buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestSizing {
    /// Buffer preallocated for the largest allowed request.
    Fixed(usize),
    /// Buffer follows a moving average of recent request sizes.
    Auto,
}

/// Writer-side buffer policy.
#[derive(Debug)]
struct FrameBuffer {
    buf: Vec<u8>,
    average: Option<usize>,
}

impl FrameBuffer {
    fn new(sizing: RequestSizing) -> Self {
        match sizing {
            RequestSizing::Fixed(max) => Self {
                buf: Vec::with_capacity(FRAME_HEADER_SIZE + max),
                average: None,
            },
            RequestSizing::Auto => Self {
                buf: Vec::with_capacity(FRAME_HEADER_SIZE + AUTO_INITIAL_SIZE),
                average: Some(AUTO_INITIAL_SIZE),
            },
        }
    }

    fn encode(&mut self, id: CorrelationId, payload: &[u8]) -> Result<&[u8]> {
        self.buf.clear();
        TcpTransportAsync::encode_frame(&mut self.buf, id, payload)?;
        Ok(&self.buf)
    }

    /// Feeds the size of a sent request into the moving average and gives
    /// back memory a rare large request left behind.
    fn observe(&mut self, size: usize) {
        if let Some(average) = self.average.as_mut() {
            *average = (*average * 7 + size) / 8;
            let target = FRAME_HEADER_SIZE + (*average).max(AUTO_INITIAL_SIZE / 4) * 2;
            if self.buf.capacity() > target * 2 {
                self.buf.clear();
                self.buf.shrink_to(target);
            }
        }
    }

    fn capacity(&self) -> usize {
        self.buf.capacity()
    }
}

/// One multiplexed request channel to a decision server.
pub struct Stream {
    addr: String,
    index: usize,
    outbox: mpsc::Sender<(CorrelationId, Vec<u8>)>,
    pending: Mutex<HashMap<CorrelationId, Waiter>>,
    next_id: AtomicU64,
    in_flight: AtomicUsize,
    closed: AtomicBool,
    halt: watch::Sender<bool>,
    broken: Arc<Notify>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Stream {
    /// Connects a new stream to `addr` and starts its reader and writer.
    ///
    /// `broken` is notified once if the stream fails on its own.
    pub async fn open(
        transport: &TcpTransportAsync,
        addr: &str,
        index: usize,
        sizing: RequestSizing,
        broken: Arc<Notify>,
    ) -> Result<Arc<Stream>> {
        let socket = transport.connect(addr).await?;
        let (read_half, write_half) = socket.into_split();
        let (outbox_tx, outbox_rx) = mpsc::channel(OUTBOX_DEPTH);
        let (halt_tx, halt_rx) = watch::channel(false);

        let stream = Arc::new(Stream {
            addr: addr.to_string(),
            index,
            outbox: outbox_tx,
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            in_flight: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            halt: halt_tx,
            broken,
            tasks: Mutex::new(Vec::with_capacity(2)),
        });

        let writer = tokio::spawn(
            write_loop(
                stream.clone(),
                write_half,
                outbox_rx,
                halt_rx.clone(),
                FrameBuffer::new(sizing),
            )
            .with_current_subscriber(),
        );
        let reader = tokio::spawn(read_loop(stream.clone(), read_half, halt_rx).with_current_subscriber());
        stream.lock_tasks().extend([writer, reader]);

        debug!(endpoint = %addr, stream = index, "decision stream opened");
        Ok(stream)
    }

    /// Requests sent on this stream and not yet answered.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn lock_pending(&self) -> MutexGuard<'_, HashMap<CorrelationId, Waiter>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_tasks(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn closed_error(&self) -> PdpError {
        PdpError::Connection(format!("stream {} to {} is closed", self.index, self.addr))
    }

    /// Sends an encoded request and waits for the encoded response.
    ///
    /// With a `deadline`, gives up after that long with [`PdpError::Timeout`];
    /// a response arriving later is dropped by the reader.
    pub async fn call(&self, payload: Vec<u8>, deadline: Option<Duration>) -> Result<Vec<u8>> {
        if self.is_closed() {
            return Err(self.closed_error());
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.lock_pending().insert(id, tx);
        let _slot = Slot::new(self, id);

        // Teardown drains the table after setting `closed`, so an entry
        // inserted before this check is guaranteed to be failed by it.
        if self.is_closed() {
            return Err(self.closed_error());
        }

        self.outbox
            .send((id, payload))
            .await
            .map_err(|_| self.closed_error())?;

        let response = match deadline {
            Some(limit) => tokio::time::timeout(limit, rx)
                .await
                .map_err(|_| PdpError::Timeout(limit.as_millis() as u64))?,
            None => rx.await,
        };

        response.map_err(|_| self.closed_error())?
    }

    fn resolve(&self, id: CorrelationId, result: Result<Vec<u8>>) {
        let waiter = self.lock_pending().remove(&id);
        match waiter {
            Some(waiter) => {
                // The caller may have gone away in the meantime.
                let _ = waiter.send(result);
            }
            None => warn!(
                endpoint = %self.addr,
                stream = self.index,
                id,
                "dropping response with unknown or expired correlation id"
            ),
        }
    }

    /// Fails every pending request and stops both tasks. Only the first call
    /// has an effect.
    fn teardown(&self, reason: &str, notify: bool) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.halt.send_replace(true);

        let waiters: Vec<_> = self.lock_pending().drain().collect();
        if !waiters.is_empty() {
            debug!(
                endpoint = %self.addr,
                stream = self.index,
                count = waiters.len(),
                "failing pending requests"
            );
        }
        for (_, waiter) in waiters {
            let _ = waiter.send(Err(PdpError::Connection(format!(
                "stream {} to {} {}",
                self.index, self.addr, reason
            ))));
        }

        if notify {
            self.broken.notify_one();
        }
    }

    /// Closes the stream and waits for its tasks to finish.
    pub async fn close(&self) {
        self.teardown("closed", false);
        let tasks: Vec<_> = self.lock_tasks().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("addr", &self.addr)
            .field("index", &self.index)
            .field("in_flight", &self.in_flight())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// A pending request's place in the correlation table.
struct Slot<'a> {
    stream: &'a Stream,
    id: CorrelationId,
}

impl<'a> Slot<'a> {
    fn new(stream: &'a Stream, id: CorrelationId) -> Self {
        stream.in_flight.fetch_add(1, Ordering::AcqRel);
        Self { stream, id }
    }
}

impl Drop for Slot<'_> {
    fn drop(&mut self) {
        self.stream.lock_pending().remove(&self.id);
        self.stream.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

async fn write_loop(
    stream: Arc<Stream>,
    mut half: OwnedWriteHalf,
    mut outbox: mpsc::Receiver<(CorrelationId, Vec<u8>)>,
    mut halt: watch::Receiver<bool>,
    mut buffer: FrameBuffer,
) {
    loop {
        let (id, payload) = tokio::select! {
            _ = halt.wait_for(|halted| *halted) => break,
            next = outbox.recv() => match next {
                Some(request) => request,
                None => break,
            },
        };

        let frame = match buffer.encode(id, &payload) {
            Ok(frame) => frame,
            Err(e) => {
                stream.resolve(id, Err(e));
                continue;
            }
        };

        if let Err(e) = TcpTransportAsync::write_all(&mut half, frame).await {
            warn!(endpoint = %stream.addr, stream = stream.index, error = %e, "decision stream write failed");
            stream.teardown("failed to write", true);
            break;
        }
        buffer.observe(payload.len());
    }

    debug!(
        endpoint = %stream.addr,
        stream = stream.index,
        buffer = buffer.capacity(),
        "stream writer stopped"
    );
    let _ = half.shutdown().await;
}

async fn read_loop(stream: Arc<Stream>, mut half: OwnedReadHalf, mut halt: watch::Receiver<bool>) {
    loop {
        let frame = tokio::select! {
            _ = halt.wait_for(|halted| *halted) => return,
            frame = TcpTransportAsync::receive_frame(&mut half) => frame,
        };

        match frame {
            Ok(frame) => stream.resolve(frame.id, Ok(frame.payload)),
            Err(e) => {
                warn!(endpoint = %stream.addr, stream = stream.index, error = %e, "decision stream broken");
                stream.teardown("broke", true);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::join_all;
    use pdp_common::protocol::{Attribute, AttributeValue, Effect, Request, Response};
    use pdp_common::transport::{JsonCodec, TcpServer};

    async fn start_server() -> (String, JoinHandle<()>) {
        let server = TcpServer::new("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap().to_string();
        let handle = tokio::spawn(async move {
            let _ = server
                .run_with_handler(|request: Request| async move {
                    if let Some(Attribute { value: AttributeValue::Integer(ms), .. }) =
                        request.get("sleep")
                    {
                        tokio::time::sleep(Duration::from_millis(*ms as u64)).await;
                    }
                    Ok(Response::decision(Effect::Permit, request.attributes))
                })
                .await;
        });
        (addr, handle)
    }

    fn payload(id: &str, value: AttributeValue) -> Vec<u8> {
        JsonCodec::encode_request(&Request::new(vec![Attribute::new(id, value)])).unwrap()
    }

    async fn open(addr: &str) -> (Arc<Stream>, Arc<Notify>) {
        let broken = Arc::new(Notify::new());
        let stream = Stream::open(
            &TcpTransportAsync::new().unwrap(),
            addr,
            0,
            RequestSizing::Fixed(1024),
            broken.clone(),
        )
        .await
        .unwrap();
        (stream, broken)
    }

    #[tokio::test]
    async fn test_concurrent_calls_are_correlated() {
        let (addr, server) = start_server().await;
        let (stream, _) = open(&addr).await;

        let calls = (0..20i64).map(|n| {
            let stream = stream.clone();
            async move {
                let body = stream
                    .call(payload("n", AttributeValue::Integer(n)), None)
                    .await
                    .unwrap();
                let response = JsonCodec::decode_response(&body).unwrap();
                (n, response.attributes[0].value.clone())
            }
        });

        for (n, value) in join_all(calls).await {
            assert_eq!(value, AttributeValue::Integer(n));
        }
        assert_eq!(stream.in_flight(), 0);

        stream.close().await;
        server.abort();
    }

    #[tokio::test]
    async fn test_call_deadline() {
        let (addr, server) = start_server().await;
        let (stream, _) = open(&addr).await;

        let result = stream
            .call(
                payload("sleep", AttributeValue::Integer(500)),
                Some(Duration::from_millis(50)),
            )
            .await;
        assert!(matches!(result, Err(PdpError::Timeout(50))));
        assert_eq!(stream.in_flight(), 0);

        // The late response is dropped and the stream stays usable.
        let body = stream
            .call(payload("n", AttributeValue::Integer(1)), Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert!(JsonCodec::decode_response(&body).is_ok());

        stream.close().await;
        server.abort();
    }

    #[tokio::test]
    async fn test_server_loss_fails_pending_and_signals_broken() {
        let (addr, server) = start_server().await;
        let (stream, broken) = open(&addr).await;

        let pending = {
            let stream = stream.clone();
            tokio::spawn(async move {
                stream
                    .call(payload("sleep", AttributeValue::Integer(5000)), None)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        server.abort();

        let result = tokio::time::timeout(Duration::from_secs(5), pending)
            .await
            .expect("pending call should fail once the server is gone")
            .unwrap();
        assert!(matches!(result, Err(PdpError::Connection(_))));

        tokio::time::timeout(Duration::from_secs(1), broken.notified())
            .await
            .expect("broken signal should fire");
        assert!(stream.is_closed());
    }

    #[tokio::test]
    async fn test_closed_stream_rejects_calls() {
        let (addr, server) = start_server().await;
        let (stream, _) = open(&addr).await;

        stream.close().await;
        stream.close().await;

        let result = stream.call(payload("n", AttributeValue::Integer(1)), None).await;
        assert!(matches!(result, Err(PdpError::Connection(_))));
        server.abort();
    }

    #[test]
    fn test_fixed_buffer_is_preallocated() {
        let buffer = FrameBuffer::new(RequestSizing::Fixed(4096));
        assert!(buffer.capacity() >= FRAME_HEADER_SIZE + 4096);
    }

    #[test]
    fn test_auto_buffer_follows_traffic() {
        let mut buffer = FrameBuffer::new(RequestSizing::Auto);
        let big = vec![b'x'; 256 * 1024];

        buffer.encode(1, &big).unwrap();
        let grown = buffer.capacity();
        assert!(grown >= big.len());
        buffer.observe(big.len());

        for id in 2..200 {
            buffer.encode(id, b"{}").unwrap();
            buffer.observe(2);
        }
        assert!(buffer.capacity() < 4096);
        assert!(buffer.average.is_some_and(|average| average < 64));
    }
}
