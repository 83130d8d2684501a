//! Audit hand-off
//!
//! Applications that serve decisions to their own clients often forward the
//! response they sent, together with a few extra attributes, to an audit
//! pipeline. [`AuditSink`] is that hand-off point. The client never calls it;
//! the application does, after it has answered its caller.

use pdp_common::protocol::Attribute;
use std::net::SocketAddr;
use std::time::SystemTime;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, error, warn};

/// Whatever the application used to answer its own caller.
pub trait ResponseWriter: Send + Sync {
    fn remote_addr(&self) -> Option<SocketAddr>;
}

impl ResponseWriter for SocketAddr {
    fn remote_addr(&self) -> Option<SocketAddr> {
        Some(*self)
    }
}

/// Receives responses and extra attribute assignments for auditing.
pub trait AuditSink: Send + Sync {
    /// Records `response`, as sent through `writer`, along with `extra`.
    ///
    /// Must not block. A missing writer or response means there is nothing to
    /// audit and the call is dropped.
    fn send_extra(&self, writer: Option<&dyn ResponseWriter>, response: Option<&[u8]>, extra: &[Attribute]);
}

/// One audited response.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditRecord {
    pub time: SystemTime,
    pub remote_addr: Option<SocketAddr>,
    pub message: Vec<u8>,
    /// JSON array of the extra attributes, empty if there were none.
    pub extra: Vec<u8>,
}

/// [`AuditSink`] handing records to a bounded channel.
///
/// Records that don't fit are dropped with a warning rather than slowing the
/// caller down.
#[derive(Debug, Clone)]
pub struct ChannelAuditSink {
    tx: mpsc::Sender<AuditRecord>,
}

impl ChannelAuditSink {
    /// Creates a sink and the receiving end of its channel.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<AuditRecord>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl AuditSink for ChannelAuditSink {
    fn send_extra(&self, writer: Option<&dyn ResponseWriter>, response: Option<&[u8]>, extra: &[Attribute]) {
        let (Some(writer), Some(response)) = (writer, response) else {
            error!("no response to audit, record dropped");
            return;
        };

        let extra = if extra.is_empty() {
            Vec::new()
        } else {
            serde_json::to_vec(extra).unwrap_or_else(|e| {
                error!(error = %e, "failed to encode extra audit attributes");
                Vec::new()
            })
        };

        let record = AuditRecord {
            time: SystemTime::now(),
            remote_addr: writer.remote_addr(),
            message: response.to_vec(),
            extra,
        };

        match self.tx.try_send(record) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => warn!("audit channel full, record dropped"),
            Err(TrySendError::Closed(_)) => debug!("audit channel closed, record dropped"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pdp_common::protocol::AttributeValue;

    const PEER: &str = "192.0.2.1:5353";

    fn peer() -> SocketAddr {
        PEER.parse().unwrap()
    }

    fn writer() -> Option<&'static dyn ResponseWriter> {
        static ADDR: std::sync::OnceLock<SocketAddr> = std::sync::OnceLock::new();
        Some(ADDR.get_or_init(peer) as &dyn ResponseWriter)
    }

    #[tokio::test]
    async fn test_record_carries_response_and_extra() {
        let (sink, mut rx) = ChannelAuditSink::new(4);
        let extra = [Attribute::new("policy_action", AttributeValue::String("block".into()))];

        sink.send_extra(writer(), Some(&b"response"[..]), &extra);

        let record = rx.recv().await.unwrap();
        assert_eq!(record.remote_addr, Some(peer()));
        assert_eq!(record.message, b"response");
        let decoded: Vec<Attribute> = serde_json::from_slice(&record.extra).unwrap();
        assert_eq!(decoded, extra);
    }

    #[tokio::test]
    async fn test_no_extra_leaves_field_empty() {
        let (sink, mut rx) = ChannelAuditSink::new(4);
        sink.send_extra(writer(), Some(&b"response"[..]), &[]);
        assert!(rx.recv().await.unwrap().extra.is_empty());
    }

    #[tokio::test]
    async fn test_missing_writer_or_response_is_dropped() {
        let (sink, mut rx) = ChannelAuditSink::new(4);
        sink.send_extra(None, Some(&b"response"[..]), &[]);
        sink.send_extra(writer(), None, &[]);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_full_channel_does_not_block() {
        let (sink, mut rx) = ChannelAuditSink::new(1);
        sink.send_extra(writer(), Some(&b"first"[..]), &[]);
        sink.send_extra(writer(), Some(&b"second"[..]), &[]);

        assert_eq!(rx.recv().await.unwrap().message, b"first");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_closed_channel_is_ignored() {
        let (sink, rx) = ChannelAuditSink::new(1);
        drop(rx);
        sink.send_extra(writer(), Some(&b"response"[..]), &[]);
    }
}
