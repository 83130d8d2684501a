//! pdp Common Types and Transport
//!
//! This crate provides the protocol definitions and TCP transport shared by
//! the pdp decision client and decision servers.
//!
//! # Overview
//!
//! A client asks a decision server whether an operation is permitted by
//! sending an ordered list of typed attribute assignments; the server answers
//! with an effect (permit, deny, ...), an optional reason and extra attribute
//! assignments. Many such exchanges share one stream and are matched by a
//! correlation id.
//!
//! - **Protocol Layer**: attributes, effects, request/response payloads, errors
//! - **Transport Layer**: correlated length-prefixed frames over TCP, JSON payloads
//!
//! # Example
//!
//! ```
//! use pdp_common::{Attribute, AttributeValue, Effect, Request, Response};
//!
//! let request = Request::new(vec![
//!     Attribute::new("policy", AttributeValue::String("AllPermitPolicy".into())),
//!     Attribute::new("domain", AttributeValue::Domain("example.com".into())),
//! ]);
//!
//! let response = Response::decision(Effect::Permit, vec![]);
//! assert_eq!(response.effect().unwrap(), Effect::Permit);
//! # let _ = request;
//! ```

pub mod protocol;
pub mod transport;

pub use protocol::*;
