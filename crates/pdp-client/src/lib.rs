//! pdp Decision Client
//!
//! Asks remote policy decision servers whether an operation is permitted.
//!
//! # Components
//!
//! - **[`PdpClient`]**: connect, close and ask for decisions
//! - **[`mapper`]**: declare how application records map to attributes
//! - **[`pool`]** / **[`stream`]**: connections, multiplexed streams, redialing
//! - **[`balancer`]**: round-robin and hot-spot endpoint selection
//! - **[`cache`]**: TTL cache of encoded responses
//! - **[`audit`]**: hand-off point for auditing responses

pub mod audit;
pub mod balancer;
pub mod cache;
pub mod client;
pub mod config;
pub mod mapper;
pub mod pool;
pub mod stream;

pub use audit::{AuditRecord, AuditSink, ChannelAuditSink, ResponseWriter};
pub use balancer::{Balancer, Endpoint, HotSpot, Lease, RoundRobin, Strategy};
pub use cache::{CachedResponse, Fingerprint, ResponseCache};
pub use client::PdpClient;
pub use config::{Balancing, ClientConfig};
pub use mapper::{
    Decision, DecisionRequest, DecisionResponse, FieldValue, RequestSchema, ResponseSchema,
};
pub use pool::{ConnectionPool, PoolConfig, Reply};
pub use stream::{RequestSizing, Stream};
