use pdp_common::protocol::error::{PdpError, Result};
use pdp_common::transport::MAX_PAYLOAD_SIZE;
use std::collections::HashSet;
use std::time::Duration;

/// How requests are spread over decision servers.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Balancing {
    /// One server, given to [`PdpClient::connect`](crate::PdpClient::connect).
    #[default]
    Single,
    /// Cycle through the endpoints, skipping unreachable ones.
    RoundRobin(Vec<String>),
    /// Pick the reachable endpoint with the fewest outstanding requests.
    HotSpot(Vec<String>),
}

impl Balancing {
    /// Configured endpoint list, empty in single-endpoint mode.
    pub fn endpoints(&self) -> &[String] {
        match self {
            Balancing::Single => &[],
            Balancing::RoundRobin(endpoints) | Balancing::HotSpot(endpoints) => endpoints,
        }
    }
}

/// Client configuration.
///
/// Built once, validated by [`PdpClient::new`](crate::PdpClient::new) and
/// read-only afterwards.
///
/// # Fields
///
/// - `streams`: concurrent streams opened to every connected endpoint
/// - `max_request_size`: cap on encoded request payloads in bytes
/// - `auto_request_size`: size outgoing buffers from observed traffic
///   instead of enforcing `max_request_size`
/// - `cache_ttl`: response cache lifetime; `None` or zero disables caching
/// - `cache_max_entries`: bound on cached responses
/// - `balancing`: endpoint selection strategy and its endpoints
/// - `connection_timeout`: how long a request waits for its connection to
///   become ready; zero fails fast, `None` waits until ready or closed
/// - `request_timeout`: optional deadline for a single request
/// - `initial_redial_backoff_ms` / `max_redial_backoff_ms`: bounds of the
///   exponential backoff between dial attempts
/// - `logger`: tracing dispatcher for everything the client logs; `None`
///   discards all client logs
///
/// # Example
///
/// ```rust
/// use pdp_client::ClientConfig;
/// use std::time::Duration;
///
/// let config = ClientConfig::default()
///     .with_streams(2)
///     .with_cache_ttl(Duration::from_secs(900))
///     .with_hot_spot_balancer(["127.0.0.1:5555", "127.0.0.1:5556"]);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub streams: usize,
    pub max_request_size: usize,
    pub auto_request_size: bool,
    pub cache_ttl: Option<Duration>,
    pub cache_max_entries: usize,
    pub balancing: Balancing,
    pub connection_timeout: Option<Duration>,
    pub request_timeout: Option<Duration>,
    pub initial_redial_backoff_ms: u64,
    pub max_redial_backoff_ms: u64,
    pub logger: Option<tracing::Dispatch>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            streams: 1,
            max_request_size: 10 * 1024,
            auto_request_size: false,
            cache_ttl: None,
            cache_max_entries: 64 * 1024,
            balancing: Balancing::Single,
            connection_timeout: Some(Duration::from_secs(30)),
            request_timeout: None,
            initial_redial_backoff_ms: 50,
            max_redial_backoff_ms: 5000,
            logger: None,
        }
    }
}

impl ClientConfig {
    pub fn with_streams(mut self, streams: usize) -> Self {
        self.streams = streams;
        self
    }

    pub fn with_max_request_size(mut self, size: usize) -> Self {
        self.max_request_size = size;
        self
    }

    pub fn with_auto_request_size(mut self, enabled: bool) -> Self {
        self.auto_request_size = enabled;
        self
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = Some(ttl);
        self
    }

    pub fn with_cache_ttl_and_max_entries(mut self, ttl: Duration, max_entries: usize) -> Self {
        self.cache_ttl = Some(ttl);
        self.cache_max_entries = max_entries;
        self
    }

    pub fn with_round_robin_balancer<I, S>(mut self, endpoints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.balancing = Balancing::RoundRobin(endpoints.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_hot_spot_balancer<I, S>(mut self, endpoints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.balancing = Balancing::HotSpot(endpoints.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = Some(timeout);
        self
    }

    /// Waits for a connection as long as it takes (until the client closes).
    pub fn without_connection_timeout(mut self) -> Self {
        self.connection_timeout = None;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn with_logger(mut self, logger: impl Into<tracing::Dispatch>) -> Self {
        self.logger = Some(logger.into());
        self
    }

    /// Whether responses are cached at all.
    pub fn cache_enabled(&self) -> bool {
        self.cache_ttl.is_some_and(|ttl| !ttl.is_zero())
    }

    /// Checks the configuration for values the client cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.streams == 0 {
            return Err(PdpError::Config(
                "number of streams must be at least 1".to_string(),
            ));
        }

        if self.max_request_size == 0 || self.max_request_size > MAX_PAYLOAD_SIZE {
            return Err(PdpError::Config(format!(
                "max request size must be between 1 and {} bytes, got {}",
                MAX_PAYLOAD_SIZE, self.max_request_size
            )));
        }

        if self.cache_enabled() && self.cache_max_entries == 0 {
            return Err(PdpError::Config(
                "cache must be able to hold at least one entry".to_string(),
            ));
        }

        if self.initial_redial_backoff_ms == 0
            || self.initial_redial_backoff_ms > self.max_redial_backoff_ms
        {
            return Err(PdpError::Config(format!(
                "invalid redial backoff bounds {}ms..{}ms",
                self.initial_redial_backoff_ms, self.max_redial_backoff_ms
            )));
        }

        if let Balancing::RoundRobin(endpoints) | Balancing::HotSpot(endpoints) = &self.balancing {
            if endpoints.is_empty() {
                return Err(PdpError::Config(
                    "balancer requires at least one endpoint".to_string(),
                ));
            }

            let mut seen = HashSet::new();
            for endpoint in endpoints {
                if endpoint.trim().is_empty() {
                    return Err(PdpError::Config("empty endpoint address".to_string()));
                }
                if !seen.insert(endpoint.as_str()) {
                    return Err(PdpError::Config(format!(
                        "duplicate endpoint address {}",
                        endpoint
                    )));
                }
            }
        }

        Ok(())
    }
}
