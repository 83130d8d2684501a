use pdp_common::protocol::error::{PdpError, Result};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// A decision server the client can send requests to.
///
/// Health is owned by the endpoint's dialer: it is set when the connection
/// comes up and cleared when it breaks or a dial fails.
pub struct Endpoint {
    addr: String,
    healthy: AtomicBool,
    outstanding: AtomicUsize,
}

impl Endpoint {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            healthy: AtomicBool::new(true),
            outstanding: AtomicUsize::new(0),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    /// Marks the endpoint (un)reachable. Returns the previous state.
    pub fn set_healthy(&self, healthy: bool) -> bool {
        self.healthy.swap(healthy, Ordering::AcqRel)
    }

    /// Requests selected for this endpoint that have not completed yet.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("addr", &self.addr)
            .field("healthy", &self.is_healthy())
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

/// Endpoint selection strategy.
pub trait Strategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Picks the index of a healthy endpoint, or `None` if there is none.
    fn select(&self, endpoints: &[Arc<Endpoint>]) -> Option<usize>;
}

/// Cycles through the endpoints in order, skipping unhealthy ones.
#[derive(Debug, Default)]
pub struct RoundRobin {
    cursor: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Strategy for RoundRobin {
    fn name(&self) -> &'static str {
        "round_robin"
    }

    fn select(&self, endpoints: &[Arc<Endpoint>]) -> Option<usize> {
        if endpoints.is_empty() {
            return None;
        }

        // Each attempt advances the shared cursor, so concurrent callers
        // still spread over the healthy endpoints.
        for _ in 0..endpoints.len() {
            let i = self.cursor.fetch_add(1, Ordering::Relaxed) % endpoints.len();
            if endpoints[i].is_healthy() {
                return Some(i);
            }
        }
        None
    }
}

/// Picks the healthy endpoint with the fewest outstanding requests.
/// Ties go to the endpoint listed first.
#[derive(Debug, Default)]
pub struct HotSpot;

impl HotSpot {
    pub fn new() -> Self {
        Self
    }
}

impl Strategy for HotSpot {
    fn name(&self) -> &'static str {
        "hot_spot"
    }

    fn select(&self, endpoints: &[Arc<Endpoint>]) -> Option<usize> {
        endpoints
            .iter()
            .enumerate()
            .filter(|(_, e)| e.is_healthy())
            .min_by_key(|(i, e)| (e.outstanding(), *i))
            .map(|(i, _)| i)
    }
}

/// Fixed endpoint list plus the strategy choosing among it.
pub struct Balancer {
    endpoints: Vec<Arc<Endpoint>>,
    strategy: Box<dyn Strategy>,
}

impl Balancer {
    pub fn new(addrs: &[String], strategy: Box<dyn Strategy>) -> Self {
        Self {
            endpoints: addrs.iter().map(|a| Arc::new(Endpoint::new(a.as_str()))).collect(),
            strategy,
        }
    }

    pub fn round_robin(addrs: &[String]) -> Self {
        Self::new(addrs, Box::new(RoundRobin::new()))
    }

    pub fn hot_spot(addrs: &[String]) -> Self {
        Self::new(addrs, Box::new(HotSpot::new()))
    }

    pub fn strategy(&self) -> &'static str {
        self.strategy.name()
    }

    pub fn endpoints(&self) -> &[Arc<Endpoint>] {
        &self.endpoints
    }

    /// Selects an endpoint and counts the request against it until the
    /// returned lease is dropped.
    pub fn select(&self) -> Result<Lease> {
        let i = self
            .strategy
            .select(&self.endpoints)
            .ok_or(PdpError::NoAvailableEndpoint)?;
        Ok(Lease::new(i, self.endpoints[i].clone()))
    }
}

impl fmt::Debug for Balancer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Balancer")
            .field("strategy", &self.strategy.name())
            .field("endpoints", &self.endpoints)
            .finish()
    }
}

/// An outstanding request against an endpoint.
#[derive(Debug)]
pub struct Lease {
    index: usize,
    endpoint: Arc<Endpoint>,
}

impl Lease {
    fn new(index: usize, endpoint: Arc<Endpoint>) -> Self {
        endpoint.outstanding.fetch_add(1, Ordering::AcqRel);
        Self { index, endpoint }
    }

    /// Position of the endpoint in the balancer's list.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn endpoint(&self) -> &Arc<Endpoint> {
        &self.endpoint
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.endpoint.outstanding.fetch_sub(1, Ordering::AcqRel);
    }
}
