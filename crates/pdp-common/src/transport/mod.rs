//! Decision stream transport
//!
//! This module provides the TCP transport and codec used by decision streams.
//!
//! # Architecture
//!
//! - **Transport**: TCP, one socket per stream, kept open for the life of the
//!   connection
//! - **Codec**: JSON serialization for request/response payloads
//! - **Wire Format**: `[4-byte length, u32 BE] + [8-byte correlation id] + [JSON payload]`
//!
//! # Components
//!
//! - **[`JsonCodec`]**: Encode/decode protocol payloads
//! - **[`TcpTransportAsync`]**: Connect, write and read correlated frames
//! - **[`TcpServer`]**: Multiplexing decision server
//!
//! # Message Size Limits
//!
//! Frames are capped at [`MAX_FRAME_SIZE`] in both directions.

pub mod codec;
pub mod tcp;
pub mod tcp_server;

pub use codec::JsonCodec;
pub use tcp::{
    Frame, TcpTransportAsync, CORRELATION_ID_SIZE, FRAME_HEADER_SIZE, MAX_FRAME_SIZE,
    MAX_PAYLOAD_SIZE,
};
pub use tcp_server::TcpServer;
