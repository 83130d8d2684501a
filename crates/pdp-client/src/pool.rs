use crate::balancer::{Balancer, Endpoint, Lease};
use crate::config::ClientConfig;
use crate::stream::{RequestSizing, Stream};
use futures::future::join_all;
use pdp_common::protocol::error::{PdpError, Result};
use pdp_common::transport::{TcpTransportAsync, MAX_PAYLOAD_SIZE};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::instrument::WithSubscriber;
use tracing::{debug, info, warn};

/// Pool settings derived from the client configuration.
///
/// # Fields
///
/// - `streams`: streams opened per endpoint connection
/// - `sizing`: outgoing buffer policy of every stream
/// - `connection_timeout`: how long `send` waits for a ready connection
/// - `request_timeout`: deadline of a single exchange
/// - `initial_backoff_ms` / `max_backoff_ms`: redial backoff bounds
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub streams: usize,
    pub sizing: RequestSizing,
    pub connection_timeout: Option<Duration>,
    pub request_timeout: Option<Duration>,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl PoolConfig {
    pub fn from_client_config(config: &ClientConfig) -> Self {
        let sizing = if config.auto_request_size {
            RequestSizing::Auto
        } else {
            RequestSizing::Fixed(config.max_request_size)
        };

        Self {
            streams: config.streams,
            sizing,
            connection_timeout: config.connection_timeout,
            request_timeout: config.request_timeout,
            initial_backoff_ms: config.initial_redial_backoff_ms,
            max_backoff_ms: config.max_redial_backoff_ms,
        }
    }

    /// Largest request payload the pool accepts.
    pub fn request_limit(&self) -> usize {
        match self.sizing {
            RequestSizing::Fixed(max) => max,
            RequestSizing::Auto => MAX_PAYLOAD_SIZE,
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::from_client_config(&ClientConfig::default())
    }
}

/// Connection state published by an endpoint's dialer.
#[derive(Clone)]
enum ConnState {
    Connecting,
    Ready(Arc<Vec<Arc<Stream>>>),
    Down,
    Closed,
}

impl fmt::Debug for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnState::Connecting => write!(f, "Connecting"),
            ConnState::Ready(streams) => write!(f, "Ready({} streams)", streams.len()),
            ConnState::Down => write!(f, "Down"),
            ConnState::Closed => write!(f, "Closed"),
        }
    }
}

struct Connection {
    endpoint: Arc<Endpoint>,
    state: watch::Receiver<ConnState>,
    dialer: Mutex<Option<JoinHandle<()>>>,
}

/// A response body and the balancer lease of the request that produced it.
///
/// Holding the reply keeps the request counted against its endpoint; drop
/// it once the response has been decoded.
#[derive(Debug)]
pub struct Reply {
    pub body: Vec<u8>,
    pub lease: Option<Lease>,
}

/// Connections to one or more decision servers.
///
/// Every endpoint has a dialer task that opens its streams, watches them and
/// redials with exponential backoff when they break. `send` never dials; it
/// waits for the dialer according to the connection timeout.
///
/// # Example
///
/// ```rust,no_run
/// use pdp_client::pool::{ConnectionPool, PoolConfig};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let pool = ConnectionPool::single("127.0.0.1:5555", PoolConfig::default());
/// let reply = pool.send(br#"{"attributes":[]}"#.to_vec()).await?;
/// println!("{} response bytes", reply.body.len());
/// pool.close().await;
/// # Ok(())
/// # }
/// ```
pub struct ConnectionPool {
    connections: Vec<Connection>,
    balancer: Option<Balancer>,
    config: Arc<PoolConfig>,
    shutdown: watch::Sender<bool>,
    closed: AtomicBool,
}

impl ConnectionPool {
    /// Starts a pool with one endpoint and no balancer. The endpoint's health
    /// is tracked but never consulted.
    pub fn single(addr: &str, config: PoolConfig) -> Self {
        Self::start(vec![Arc::new(Endpoint::new(addr))], None, config)
    }

    /// Starts a pool over every endpoint of `balancer`.
    pub fn balanced(balancer: Balancer, config: PoolConfig) -> Self {
        let endpoints = balancer.endpoints().to_vec();
        Self::start(endpoints, Some(balancer), config)
    }

    fn start(endpoints: Vec<Arc<Endpoint>>, balancer: Option<Balancer>, config: PoolConfig) -> Self {
        let config = Arc::new(config);
        let (shutdown, _) = watch::channel(false);

        let connections = endpoints
            .into_iter()
            .map(|endpoint| {
                let (state_tx, state_rx) = watch::channel(ConnState::Connecting);
                let dialer = tokio::spawn(
                    dial_loop(endpoint.clone(), state_tx, shutdown.subscribe(), config.clone())
                        .with_current_subscriber(),
                );
                Connection {
                    endpoint,
                    state: state_rx,
                    dialer: Mutex::new(Some(dialer)),
                }
            })
            .collect();

        Self {
            connections,
            balancer,
            config,
            shutdown,
            closed: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Endpoints in configuration order.
    pub fn endpoints(&self) -> impl Iterator<Item = &Arc<Endpoint>> {
        self.connections.iter().map(|c| &c.endpoint)
    }

    /// Whether the endpoint at `index` currently has open streams.
    pub fn is_ready(&self, index: usize) -> bool {
        self.connections
            .get(index)
            .is_some_and(|c| matches!(*c.state.borrow(), ConnState::Ready(_)))
    }

    /// Sends an encoded request and waits for the encoded response.
    ///
    /// # Errors
    ///
    /// - [`PdpError::RequestTooLarge`] if the payload exceeds the request limit
    /// - [`PdpError::NoAvailableEndpoint`] if the balancer finds no reachable endpoint
    /// - [`PdpError::NotConnected`] if the chosen connection isn't ready in time
    /// - [`PdpError::Connection`] / [`PdpError::Timeout`] from the exchange itself
    pub async fn send(&self, payload: Vec<u8>) -> Result<Reply> {
        let limit = self.config.request_limit();
        if payload.len() > limit {
            return Err(PdpError::RequestTooLarge {
                size: payload.len(),
                limit,
            });
        }

        if self.closed.load(Ordering::Acquire) {
            return Err(PdpError::NotConnected);
        }

        let (streams, lease) = match &self.balancer {
            Some(balancer) => self.select_ready(balancer).await?,
            None => {
                let connection = self.connections.first().ok_or(PdpError::NotConnected)?;
                match self.settled_state(connection, false).await? {
                    ConnState::Ready(streams) => (streams, None),
                    _ => return Err(PdpError::NotConnected),
                }
            }
        };

        // Least loaded stream, first one on ties.
        let stream = streams
            .iter()
            .min_by_key(|s| s.in_flight())
            .ok_or(PdpError::NotConnected)?;

        let body = stream.call(payload, self.config.request_timeout).await?;
        Ok(Reply { body, lease })
    }

    /// Picks a ready endpoint from the balancer. An endpoint whose dial
    /// fails while the request waits on it is already marked unhealthy, so
    /// the request moves on to the next selection.
    async fn select_ready(&self, balancer: &Balancer) -> Result<(Arc<Vec<Arc<Stream>>>, Option<Lease>)> {
        for _ in 0..self.connections.len() {
            let lease = balancer.select()?;
            let connection = self.connections.get(lease.index()).ok_or(PdpError::NotConnected)?;

            match self.settled_state(connection, true).await? {
                ConnState::Ready(streams) => return Ok((streams, Some(lease))),
                ConnState::Down => {
                    debug!(endpoint = %lease.endpoint().addr(), "selected endpoint is down, reselecting");
                }
                _ => return Err(PdpError::NotConnected),
            }
        }
        Err(PdpError::NotConnected)
    }

    /// Current state of `connection` once it has settled, within the
    /// connection timeout.
    async fn settled_state(&self, connection: &Connection, settle_on_down: bool) -> Result<ConnState> {
        let mut state = connection.state.clone();

        match self.config.connection_timeout {
            Some(limit) if limit.is_zero() => Ok(current_state(&state)),
            Some(limit) => tokio::time::timeout(limit, wait_settled(&mut state, settle_on_down))
                .await
                .map_err(|_| {
                    debug!(endpoint = %connection.endpoint.addr(), "gave up waiting for connection");
                    PdpError::NotConnected
                }),
            None => Ok(wait_settled(&mut state, settle_on_down).await),
        }
    }

    /// Stops every dialer, fails pending requests and closes all sockets.
    /// Calling it again has no effect.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown.send_replace(true);

        let dialers: Vec<_> = self
            .connections
            .iter()
            .filter_map(|c| c.dialer.lock().unwrap_or_else(PoisonError::into_inner).take())
            .collect();
        join_all(dialers).await;
        debug!(endpoints = self.connections.len(), "connection pool closed");
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field(
                "endpoints",
                &self.connections.iter().map(|c| c.endpoint.addr()).collect::<Vec<_>>(),
            )
            .field("balancer", &self.balancer.as_ref().map(|b| b.strategy()))
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish()
    }
}

fn current_state(state: &watch::Receiver<ConnState>) -> ConnState {
    state.borrow().clone()
}

/// Waits until the connection is ready or closed for good, or down when
/// `settle_on_down` is set.
async fn wait_settled(state: &mut watch::Receiver<ConnState>, settle_on_down: bool) -> ConnState {
    let settled = |s: &ConnState| match s {
        ConnState::Ready(_) | ConnState::Closed => true,
        ConnState::Down => settle_on_down,
        ConnState::Connecting => false,
    };
    match state.wait_for(settled).await {
        Ok(current) => current.clone(),
        Err(_) => ConnState::Closed,
    }
}

async fn dial_loop(
    endpoint: Arc<Endpoint>,
    state: watch::Sender<ConnState>,
    mut shutdown: watch::Receiver<bool>,
    config: Arc<PoolConfig>,
) {
    let transport = TcpTransportAsync::default();
    let initial = Duration::from_millis(config.initial_backoff_ms);
    let max = Duration::from_millis(config.max_backoff_ms);
    let mut backoff = initial;

    loop {
        let broken = Arc::new(Notify::new());
        let mut opened = Vec::with_capacity(config.streams);

        let dialed = tokio::select! {
            _ = shutdown.wait_for(|stop| *stop) => None,
            dialed = open_streams(&transport, &endpoint, &config, &broken, &mut opened) => Some(dialed),
        };

        match dialed {
            None => {
                close_streams(&opened).await;
                break;
            }
            Some(Ok(())) => {
                backoff = initial;
                info!(endpoint = %endpoint.addr(), streams = opened.len(), "connected to decision server");

                let streams = Arc::new(opened);
                state.send_replace(ConnState::Ready(streams.clone()));
                if !endpoint.set_healthy(true) {
                    info!(endpoint = %endpoint.addr(), "decision server reachable again");
                }

                let stopping = tokio::select! {
                    _ = shutdown.wait_for(|stop| *stop) => true,
                    _ = broken.notified() => false,
                };

                if stopping {
                    state.send_replace(ConnState::Closed);
                    close_streams(&streams).await;
                    break;
                }

                endpoint.set_healthy(false);
                state.send_replace(ConnState::Down);
                warn!(endpoint = %endpoint.addr(), "lost connection to decision server");
                close_streams(&streams).await;
            }
            Some(Err(e)) => {
                close_streams(&opened).await;
                // Unhealthy before Down so waiting requests reselect past it.
                if endpoint.set_healthy(false) {
                    warn!(endpoint = %endpoint.addr(), error = %e, "decision server unreachable");
                } else {
                    debug!(endpoint = %endpoint.addr(), error = %e, retry_ms = backoff.as_millis() as u64, "dial failed");
                }
                state.send_replace(ConnState::Down);
            }
        }

        tokio::select! {
            _ = shutdown.wait_for(|stop| *stop) => break,
            _ = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(max);
    }

    state.send_replace(ConnState::Closed);
}

/// Opens the configured number of streams into `opened`. On error the
/// streams opened so far are left in `opened` for the caller to close.
async fn open_streams(
    transport: &TcpTransportAsync,
    endpoint: &Endpoint,
    config: &PoolConfig,
    broken: &Arc<Notify>,
    opened: &mut Vec<Arc<Stream>>,
) -> Result<()> {
    for index in 0..config.streams {
        let stream = Stream::open(transport, endpoint.addr(), index, config.sizing, broken.clone()).await?;
        opened.push(stream);
    }
    Ok(())
}

async fn close_streams(streams: &[Arc<Stream>]) {
    join_all(streams.iter().map(|s| s.close())).await;
}
