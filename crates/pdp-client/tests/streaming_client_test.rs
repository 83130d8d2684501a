//! Streaming Client Integration Tests
//!
//! End-to-end tests running [`PdpClient`] against real decision servers on
//! loopback ports. They cover:
//! - Fixed and automatically sized request buffers
//! - Response caching
//! - Round-robin and hot-spot balancing
//! - Connection and request timeouts
//! - Balanced endpoints that are all down
//! - Closing with requests in flight
//! - Injected loggers

use futures::future::join_all;
use pdp_client::mapper::{self, DecisionRequest, DecisionResponse, RequestSchema, ResponseSchema};
use pdp_client::{ClientConfig, Fingerprint, PdpClient};
use pdp_common::protocol::error::PdpError;
use pdp_common::transport::{JsonCodec, TcpServer};
use pdp_common::{Attribute, AttributeValue, Effect, Request, Response};
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
struct DnsQuery {
    direction: String,
    policy: String,
    domain: String,
}

impl DnsQuery {
    fn new(domain: &str) -> Self {
        Self::with_policy(domain, "AllPermitPolicy")
    }

    fn with_policy(domain: &str, policy: &str) -> Self {
        Self {
            direction: "Any".to_string(),
            policy: policy.to_string(),
            domain: domain.to_string(),
        }
    }
}

impl DecisionRequest for DnsQuery {
    fn schema() -> &'static RequestSchema<Self> {
        static SCHEMA: OnceLock<RequestSchema<DnsQuery>> = OnceLock::new();
        SCHEMA.get_or_init(|| {
            RequestSchema::builder()
                .string("k3", |q: &DnsQuery| q.direction.clone())
                .string("policy", |q: &DnsQuery| q.policy.clone())
                .domain("domain", |q: &DnsQuery| q.domain.clone())
                .build()
        })
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
struct PolicyAnswer {
    effect: Effect,
    reason: Option<String>,
    x: String,
    domain: String,
}

impl DecisionResponse for PolicyAnswer {
    fn schema() -> &'static ResponseSchema<Self> {
        static SCHEMA: OnceLock<ResponseSchema<PolicyAnswer>> = OnceLock::new();
        SCHEMA.get_or_init(|| {
            ResponseSchema::builder()
                .effect(|a: &mut PolicyAnswer, effect| a.effect = effect)
                .reason(|a: &mut PolicyAnswer, reason| a.reason = reason)
                .string("x", |a: &mut PolicyAnswer, x| a.x = x)
                .domain("domain", |a: &mut PolicyAnswer, domain| a.domain = domain)
                .build()
        })
    }
}

/// All-permit decision server echoing the requested domain. `SlowPolicy`
/// requests are answered after 500 ms and `HangPolicy` requests never are.
struct TestServer {
    addr: String,
    requests: Arc<AtomicUsize>,
    handle: JoinHandle<()>,
}

impl TestServer {
    async fn start() -> Self {
        let server = TcpServer::new("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap().to_string();
        let requests = Arc::new(AtomicUsize::new(0));

        let counter = requests.clone();
        let handle = tokio::spawn(async move {
            let _ = server
                .run_with_handler(move |request: Request| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        match request.get("policy").map(|p| &p.value) {
                            Some(AttributeValue::String(p)) if p == "SlowPolicy" => {
                                tokio::time::sleep(Duration::from_millis(500)).await;
                            }
                            Some(AttributeValue::String(p)) if p == "HangPolicy" => {
                                std::future::pending::<()>().await;
                            }
                            _ => {}
                        }
                        let mut attributes = vec![Attribute::new(
                            "x",
                            AttributeValue::String("AllPermitRule".into()),
                        )];
                        if let Some(domain) = request.get("domain") {
                            attributes.push(domain.clone());
                        }
                        Ok(Response::decision(Effect::Permit, attributes))
                    }
                })
                .await;
        });

        Self {
            addr,
            requests,
            handle,
        }
    }

    fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// An address nothing listens on.
async fn dead_addr() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().to_string()
}

fn assert_permit(answer: &PolicyAnswer, domain: &str) {
    assert_eq!(answer.effect, Effect::Permit);
    assert!(answer.reason.is_none());
    assert_eq!(answer.x, "AllPermitRule");
    assert_eq!(answer.domain, domain);
}

// ============================================================================
// Request Sizing
// ============================================================================

#[tokio::test]
async fn test_fixed_buffer_decision() {
    let server = TestServer::start().await;
    let client = PdpClient::new(ClientConfig::default().with_max_request_size(1024)).unwrap();
    client.connect(&server.addr).await.unwrap();

    let mut answer = PolicyAnswer::default();
    client.map(&DnsQuery::new("example.com"), &mut answer).await.unwrap();
    assert_permit(&answer, "example.com");

    client.close().await;
}

#[tokio::test]
async fn test_auto_sized_decision() {
    let server = TestServer::start().await;
    let client = PdpClient::new(
        ClientConfig::default()
            .with_max_request_size(16)
            .with_auto_request_size(true)
            .with_streams(2),
    )
    .unwrap();
    client.connect(&server.addr).await.unwrap();

    // Larger than max_request_size, which only applies to fixed buffers.
    let mut answer = PolicyAnswer::default();
    client.map(&DnsQuery::new("example.com"), &mut answer).await.unwrap();
    assert_permit(&answer, "example.com");

    client.close().await;
}

#[tokio::test]
async fn test_oversized_request_never_leaves_client() {
    let server = TestServer::start().await;
    let client = PdpClient::new(ClientConfig::default().with_max_request_size(16)).unwrap();
    client.connect(&server.addr).await.unwrap();

    let mut answer = PolicyAnswer::default();
    let result = client.map(&DnsQuery::new("example.com"), &mut answer).await;
    assert!(matches!(result, Err(PdpError::RequestTooLarge { limit: 16, .. })));
    assert_eq!(server.requests(), 0);

    client.close().await;
}

#[tokio::test]
async fn test_invalid_domain_is_mapping_error() {
    let server = TestServer::start().await;
    let client = PdpClient::new(ClientConfig::default()).unwrap();
    client.connect(&server.addr).await.unwrap();

    let mut answer = PolicyAnswer::default();
    let result = client.map(&DnsQuery::new("not a domain"), &mut answer).await;
    assert!(matches!(result, Err(PdpError::Mapping(_))));
    assert_eq!(server.requests(), 0);

    client.close().await;
}

// ============================================================================
// Caching
// ============================================================================

#[tokio::test]
async fn test_cached_decision() {
    let server = TestServer::start().await;
    let client = PdpClient::new(
        ClientConfig::default()
            .with_max_request_size(1024)
            .with_cache_ttl(Duration::from_secs(900)),
    )
    .unwrap();
    client.connect(&server.addr).await.unwrap();

    let query = DnsQuery::new("example.com");
    let mut live = PolicyAnswer::default();
    client.map(&query, &mut live).await.unwrap();
    assert_permit(&live, "example.com");

    let cache = client.cache().unwrap();
    let entries = cache.entries();
    assert_eq!(entries.len(), 1);

    let cached = JsonCodec::decode_response(&entries[0].bytes).unwrap();
    let mut from_cache = PolicyAnswer::default();
    mapper::decode(&cached, &mut from_cache).unwrap();
    assert_eq!(from_cache, live);

    let mut again = PolicyAnswer::default();
    client.map(&query, &mut again).await.unwrap();
    assert_eq!(again, live);
    assert_eq!(cache.len(), 1);
    assert_eq!(server.requests(), 1);

    client.close().await;
}

#[tokio::test]
async fn test_request_fingerprints() {
    let key = |query: &DnsQuery| {
        let attributes = mapper::encode(query).unwrap();
        Fingerprint::of(&JsonCodec::encode_request(&Request::new(attributes)).unwrap())
    };

    let a = DnsQuery::new("example.com");
    assert_eq!(key(&a), key(&a.clone()));
    // Canonical domains share a key.
    assert_eq!(key(&a), key(&DnsQuery::new("Example.COM.")));

    let mut other_policy = a.clone();
    other_policy.policy = "AllDenyPolicy".to_string();
    assert_ne!(key(&a), key(&other_policy));
    assert_ne!(key(&a), key(&DnsQuery::new("example.org")));
}

// ============================================================================
// Balancing
// ============================================================================

#[tokio::test]
async fn test_round_robin_balancer() {
    let first = TestServer::start().await;
    let second = TestServer::start().await;
    let client = PdpClient::new(
        ClientConfig::default()
            .with_max_request_size(1024)
            .with_round_robin_balancer([first.addr.clone(), second.addr.clone()]),
    )
    .unwrap();
    client.connect("").await.unwrap();

    let mut answer = PolicyAnswer::default();
    client.map(&DnsQuery::new("example.com"), &mut answer).await.unwrap();
    assert_permit(&answer, "example.com");

    for _ in 0..3 {
        client.map(&DnsQuery::new("example.com"), &mut answer).await.unwrap();
    }
    assert_eq!(first.requests(), 2);
    assert_eq!(second.requests(), 2);

    client.close().await;
}

#[tokio::test]
async fn test_hot_spot_balancer_concurrent_requests() {
    let first = TestServer::start().await;
    let second = TestServer::start().await;
    let client = PdpClient::new(
        ClientConfig::default()
            .with_max_request_size(1024)
            .with_streams(2)
            .with_hot_spot_balancer([first.addr.clone(), second.addr.clone()]),
    )
    .unwrap();
    client.connect("").await.unwrap();

    let calls = (0..10).map(|i| {
        let client = &client;
        async move {
            let domain = format!("host{}.example.com", i);
            let query = DnsQuery::new(&domain);
            let mut answer = PolicyAnswer::default();
            let result = client.map(&query, &mut answer).await;
            result.map(|()| (domain, answer))
        }
    });

    for result in join_all(calls).await {
        let (domain, answer) = result.unwrap();
        assert_permit(&answer, &domain);
    }
    assert_eq!(first.requests() + second.requests(), 10);
    assert!(first.requests() > 0 && second.requests() > 0);

    client.close().await;
}

// ============================================================================
// Connection Timeouts
// ============================================================================

#[tokio::test]
async fn test_zero_connection_timeout_fails_fast() {
    let client = PdpClient::new(ClientConfig::default().with_connection_timeout(Duration::ZERO)).unwrap();
    client.connect(&dead_addr().await).await.unwrap();

    let start = Instant::now();
    let mut answer = PolicyAnswer::default();
    let result = client.map(&DnsQuery::new("example.com"), &mut answer).await;
    assert!(matches!(result, Err(PdpError::NotConnected)));
    assert!(start.elapsed() < Duration::from_secs(1));

    client.close().await;
}

#[tokio::test]
async fn test_connection_timeout_waits_then_fails() {
    let client =
        PdpClient::new(ClientConfig::default().with_connection_timeout(Duration::from_secs(3))).unwrap();
    client.connect(&dead_addr().await).await.unwrap();

    let start = Instant::now();
    let mut answer = PolicyAnswer::default();
    let result = tokio::time::timeout(
        Duration::from_secs(10),
        client.map(&DnsQuery::new("example.com"), &mut answer),
    )
    .await
    .expect("request should give up on its own");

    assert!(matches!(result, Err(PdpError::NotConnected)));
    assert!(start.elapsed() >= Duration::from_millis(2900));

    client.close().await;
}

#[tokio::test]
async fn test_request_timeout_drops_late_reply() {
    let server = TestServer::start().await;
    let client = PdpClient::new(
        ClientConfig::default()
            .with_connection_timeout(Duration::from_secs(5))
            .with_request_timeout(Duration::from_millis(100)),
    )
    .unwrap();
    client.connect(&server.addr).await.unwrap();

    let mut answer = PolicyAnswer::default();
    let result = client
        .map(&DnsQuery::with_policy("slow.example.com", "SlowPolicy"), &mut answer)
        .await;
    assert!(matches!(result, Err(PdpError::Timeout(_))), "{:?}", result);
    assert_eq!(answer, PolicyAnswer::default());

    // The slow reply arrives after its caller gave up and must not be
    // delivered to a later request on the same stream.
    tokio::time::sleep(Duration::from_millis(600)).await;
    client.map(&DnsQuery::new("example.com"), &mut answer).await.unwrap();
    assert_permit(&answer, "example.com");
    assert_eq!(server.requests(), 2);

    client.close().await;
}

#[tokio::test]
async fn test_all_balanced_endpoints_down() {
    let client = PdpClient::new(
        ClientConfig::default()
            .with_connection_timeout(Duration::from_secs(3))
            .with_round_robin_balancer([dead_addr().await, dead_addr().await]),
    )
    .unwrap();
    client.connect("").await.unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    let mut answer = PolicyAnswer::default();
    loop {
        match client.map(&DnsQuery::new("example.com"), &mut answer).await {
            Err(PdpError::NoAvailableEndpoint) => break,
            // Raced the second dialer before it marked its endpoint down.
            Err(PdpError::NotConnected) => {}
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(Instant::now() < deadline, "endpoints never reported down");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    client.close().await;
}

#[tokio::test]
async fn test_close_fails_in_flight_request() {
    let server = TestServer::start().await;
    let client = PdpClient::new(ClientConfig::default().with_connection_timeout(Duration::from_secs(5))).unwrap();
    client.connect(&server.addr).await.unwrap();

    let mut answer = PolicyAnswer::default();
    let query = DnsQuery::with_policy("example.com", "HangPolicy");
    let closing = async {
        while server.requests() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        client.close().await;
    };
    let (result, ()) = tokio::time::timeout(Duration::from_secs(10), async {
        tokio::join!(client.map(&query, &mut answer), closing)
    })
    .await
    .expect("close should fail the pending request");

    assert!(matches!(result, Err(PdpError::Connection(_))), "{:?}", result);
    assert!(!client.is_connected().await);
}

// ============================================================================
// Logging
// ============================================================================

#[derive(Clone, Default)]
struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl CapturedLogs {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl io::Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn test_injected_logger_receives_client_logs() {
    let server = TestServer::start().await;
    let logs = CapturedLogs::default();
    let writer = logs.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_ansi(false)
        .with_writer(move || writer.clone())
        .finish();

    let client = PdpClient::new(ClientConfig::default().with_logger(subscriber)).unwrap();
    client.connect(&server.addr).await.unwrap();

    let mut answer = PolicyAnswer::default();
    client.map(&DnsQuery::new("example.com"), &mut answer).await.unwrap();
    client.close().await;

    let output = logs.contents();
    assert!(output.contains("connecting to decision servers"), "{}", output);
    // Logged by the background dialer.
    assert!(output.contains("connected to decision server"), "{}", output);
}
