use crate::balancer::Balancer;
use crate::cache::{Fingerprint, ResponseCache};
use crate::config::{Balancing, ClientConfig};
use crate::mapper::{self, Decision, DecisionRequest, DecisionResponse};
use crate::pool::{ConnectionPool, PoolConfig, Reply};
use pdp_common::protocol::error::{PdpError, Result};
use pdp_common::protocol::{Attribute, Request, Response};
use pdp_common::transport::JsonCodec;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::instrument::WithSubscriber;
use tracing::{debug, info, trace, Dispatch};

/// Streaming policy decision client
///
/// Sends decision requests to one or more decision servers over long-lived
/// multiplexed streams. Responses can be cached for a configured time, keyed
/// by the encoded request.
///
/// The client is shared by reference: every operation takes `&self`, so an
/// `Arc<PdpClient>` can serve any number of concurrent callers.
///
/// # Example
///
/// ```rust,no_run
/// use pdp_client::{ClientConfig, PdpClient};
/// use pdp_common::{Attribute, AttributeValue, Effect};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let client = PdpClient::new(ClientConfig::default())?;
/// client.connect("127.0.0.1:5555").await?;
///
/// let decision = client
///     .decide(vec![Attribute::new("domain", AttributeValue::Domain("example.com".into()))])
///     .await?;
/// if decision.effect == Effect::Permit {
///     println!("allowed");
/// }
///
/// client.close().await;
/// # Ok(())
/// # }
/// ```
pub struct PdpClient {
    config: ClientConfig,
    dispatch: Dispatch,
    cache: Option<ResponseCache>,
    pool: RwLock<Option<Arc<ConnectionPool>>>,
}

impl PdpClient {
    /// Creates a client. Nothing is connected until [`connect`](Self::connect).
    ///
    /// # Errors
    ///
    /// Returns [`PdpError::Config`] if the configuration is invalid.
    pub fn new(config: ClientConfig) -> Result<Self> {
        config.validate()?;

        let cache = match config.cache_ttl {
            Some(ttl) if config.cache_enabled() => Some(ResponseCache::new(ttl, config.cache_max_entries)),
            _ => None,
        };
        let dispatch = config.logger.clone().unwrap_or_else(Dispatch::none);

        Ok(Self {
            config,
            dispatch,
            cache,
            pool: RwLock::new(None),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// The response cache, if caching is enabled.
    pub fn cache(&self) -> Option<&ResponseCache> {
        self.cache.as_ref()
    }

    pub async fn is_connected(&self) -> bool {
        self.pool.read().await.is_some()
    }

    /// Starts connecting to the decision servers.
    ///
    /// Returns once background dialers are running; requests wait for them
    /// according to the connection timeout. `addr` names the server in
    /// single-endpoint mode and is ignored when a balancer is configured.
    ///
    /// # Errors
    ///
    /// - [`PdpError::AlreadyConnected`] if connected and not closed since
    /// - [`PdpError::Config`] if no address is given in single-endpoint mode
    pub async fn connect(&self, addr: &str) -> Result<()> {
        async {
            let mut slot = self.pool.write().await;
            if slot.is_some() {
                return Err(PdpError::AlreadyConnected);
            }

            let pool_config = PoolConfig::from_client_config(&self.config);
            let pool = match &self.config.balancing {
                Balancing::Single => {
                    if addr.trim().is_empty() {
                        return Err(PdpError::Config(
                            "decision server address is required".to_string(),
                        ));
                    }
                    ConnectionPool::single(addr, pool_config)
                }
                Balancing::RoundRobin(endpoints) => {
                    ConnectionPool::balanced(Balancer::round_robin(endpoints), pool_config)
                }
                Balancing::HotSpot(endpoints) => {
                    ConnectionPool::balanced(Balancer::hot_spot(endpoints), pool_config)
                }
            };

            info!(
                endpoints = ?pool.endpoints().map(|e| e.addr()).collect::<Vec<_>>(),
                streams = self.config.streams,
                "connecting to decision servers"
            );
            *slot = Some(Arc::new(pool));
            Ok(())
        }
        .with_subscriber(self.dispatch.clone())
        .await
    }

    /// Disconnects from all servers. Pending requests fail with a
    /// connection error. Does nothing if not connected; the client can
    /// connect again afterwards.
    pub async fn close(&self) {
        async {
            let pool = self.pool.write().await.take();
            if let Some(pool) = pool {
                pool.close().await;
                info!("disconnected from decision servers");
            }
        }
        .with_subscriber(self.dispatch.clone())
        .await
    }

    /// Asks for a decision on `request` and binds the answer to `response`.
    ///
    /// `response` is reset to its default before binding and left untouched
    /// on error.
    pub async fn map<Q, R>(&self, request: &Q, response: &mut R) -> Result<()>
    where
        Q: DecisionRequest,
        R: DecisionResponse,
    {
        async {
            let attributes = mapper::encode(request)?;
            self.exchange(attributes, |decoded| mapper::decode(decoded, response))
                .await
        }
        .with_subscriber(self.dispatch.clone())
        .await
    }

    /// Asks for a decision on a raw attribute list.
    pub async fn decide(&self, attributes: Vec<Attribute>) -> Result<Decision> {
        self.exchange(attributes, Decision::from_response)
            .with_subscriber(self.dispatch.clone())
            .await
    }

    async fn pool(&self) -> Result<Arc<ConnectionPool>> {
        self.pool.read().await.clone().ok_or(PdpError::NotConnected)
    }

    /// Encode, consult the cache, send on a miss, decode, then cache what
    /// decoded cleanly.
    async fn exchange<T, F>(&self, attributes: Vec<Attribute>, bind: F) -> Result<T>
    where
        F: FnOnce(&Response) -> Result<T>,
    {
        let payload = JsonCodec::encode_request(&Request::new(attributes))?;

        let fingerprint = match &self.cache {
            Some(cache) => {
                let fingerprint = Fingerprint::of(&payload);
                if let Some(bytes) = cache.lookup(&fingerprint) {
                    trace!(%fingerprint, "decision served from cache");
                    return bind(&JsonCodec::decode_response(&bytes)?);
                }
                Some(fingerprint)
            }
            None => None,
        };

        let pool = self.pool().await?;
        let Reply { body, lease } = pool.send(payload).await?;

        let response = JsonCodec::decode_response(&body)?;
        let out = bind(&response)?;
        // Completion is counted only once the response has been decoded.
        drop(lease);

        if let (Some(cache), Some(fingerprint)) = (&self.cache, fingerprint) {
            debug!(%fingerprint, "caching decision");
            cache.store(fingerprint, body);
        }

        Ok(out)
    }
}

impl std::fmt::Debug for PdpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PdpClient")
            .field("balancing", &self.config.balancing)
            .field("streams", &self.config.streams)
            .field("cache", &self.cache)
            .finish()
    }
}
