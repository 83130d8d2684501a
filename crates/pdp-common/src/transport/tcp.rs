use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{lookup_host, TcpStream};

use crate::protocol::CorrelationId;
use crate::protocol::error::{PdpError, Result};

/// Maximum frame size (16 MiB), header included.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Size of the correlation id that follows the length prefix.
pub const CORRELATION_ID_SIZE: usize = 8;

/// Bytes in front of every payload: length prefix plus correlation id.
pub const FRAME_HEADER_SIZE: usize = 4 + CORRELATION_ID_SIZE;

/// Largest payload a single frame can carry.
pub const MAX_PAYLOAD_SIZE: usize = MAX_FRAME_SIZE - FRAME_HEADER_SIZE;

/// A payload tagged with the correlation id it travels under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub id: CorrelationId,
    pub payload: Vec<u8>,
}

/// Async TCP transport for decision streams.
///
/// # Wire Protocol
///
/// Every message on a stream is one frame. The length covers the correlation
/// id and the payload, so a frame with an empty payload has length 8:
///
/// ```text
/// [4-byte length, u32 BE] [8-byte correlation id, u64 BE] [payload]
/// ```
///
/// Requests and responses share the format; the server echoes the id it
/// received so that many requests can be in flight on one stream.
///
/// # Example
///
/// ```no_run
/// use pdp_common::transport::TcpTransportAsync;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let transport = TcpTransportAsync::new()?;
/// let mut stream = transport.connect("127.0.0.1:5555").await?;
///
/// TcpTransportAsync::send_frame(&mut stream, 1, br#"{"attributes":[]}"#).await?;
/// let frame = TcpTransportAsync::receive_frame(&mut stream).await?;
/// assert_eq!(frame.id, 1);
/// # Ok(())
/// # }
/// ```
pub struct TcpTransportAsync;

impl TcpTransportAsync {
    /// Creates a new async TCP transport instance.
    pub fn new() -> Result<Self> {
        Ok(Self)
    }

    /// Connects to a remote endpoint.
    ///
    /// Resolves the address (which may resolve to multiple addresses) and
    /// attempts to connect to each until one succeeds. Nagle is disabled since
    /// decision requests are small and latency bound.
    pub async fn connect(&self, addr: &str) -> Result<TcpStream> {
        let socket_addrs = lookup_host(addr)
            .await
            .map_err(|e| PdpError::Connection(format!("Invalid address '{}': {}", addr, e)))?;

        let mut last_err = None;
        for socket_addr in socket_addrs {
            match TcpStream::connect(&socket_addr).await {
                Ok(stream) => {
                    stream.set_nodelay(true).map_err(|e| {
                        PdpError::Connection(format!("Failed to set TCP_NODELAY: {}", e))
                    })?;
                    return Ok(stream);
                }
                Err(e) => {
                    last_err = Some(e);
                }
            }
        }

        Err(PdpError::Connection(format!(
            "Failed to connect to {}: {}",
            addr,
            last_err
                .map(|e| e.to_string())
                .unwrap_or_else(|| "Unknown error".to_string())
        )))
    }

    /// Appends a complete frame to `buf`.
    ///
    /// Lets callers assemble header and payload in a reusable buffer and hand
    /// the whole frame to a single write.
    pub fn encode_frame(buf: &mut Vec<u8>, id: CorrelationId, payload: &[u8]) -> Result<()> {
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(PdpError::RequestTooLarge {
                size: payload.len(),
                limit: MAX_PAYLOAD_SIZE,
            });
        }

        let len = (CORRELATION_ID_SIZE + payload.len()) as u32;
        buf.reserve(FRAME_HEADER_SIZE + payload.len());
        buf.extend_from_slice(&len.to_be_bytes());
        buf.extend_from_slice(&id.to_be_bytes());
        buf.extend_from_slice(payload);
        Ok(())
    }

    /// Writes one frame and flushes.
    pub async fn send_frame<W>(writer: &mut W, id: CorrelationId, payload: &[u8]) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let mut buf = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
        Self::encode_frame(&mut buf, id, payload)?;
        Self::write_all(writer, &buf).await
    }

    /// Writes pre-encoded frame bytes and flushes.
    pub async fn write_all<W>(writer: &mut W, data: &[u8]) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        writer
            .write_all(data)
            .await
            .map_err(|e| Self::map_io_error(e, "writing frame"))?;

        writer
            .flush()
            .await
            .map_err(|e| Self::map_io_error(e, "flushing stream"))?;

        Ok(())
    }

    /// Reads one frame.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The peer closed the stream or reading fails
    /// - The frame is shorter than its correlation id
    /// - The frame exceeds [`MAX_FRAME_SIZE`]
    pub async fn receive_frame<R>(reader: &mut R) -> Result<Frame>
    where
        R: AsyncRead + Unpin,
    {
        let mut len_buf = [0u8; 4];
        reader
            .read_exact(&mut len_buf)
            .await
            .map_err(|e| Self::map_io_error(e, "reading length prefix"))?;

        let len = u32::from_be_bytes(len_buf) as usize;

        if len < CORRELATION_ID_SIZE {
            return Err(PdpError::InvalidResponse(format!(
                "Frame too short: {} bytes",
                len
            )));
        }
        if len + 4 > MAX_FRAME_SIZE {
            return Err(PdpError::InvalidResponse(format!(
                "Frame too large: {} bytes (max {} bytes)",
                len + 4,
                MAX_FRAME_SIZE
            )));
        }

        let mut id_buf = [0u8; CORRELATION_ID_SIZE];
        reader
            .read_exact(&mut id_buf)
            .await
            .map_err(|e| Self::map_io_error(e, "reading correlation id"))?;

        let mut payload = vec![0u8; len - CORRELATION_ID_SIZE];
        reader
            .read_exact(&mut payload)
            .await
            .map_err(|e| Self::map_io_error(e, "reading payload"))?;

        Ok(Frame {
            id: u64::from_be_bytes(id_buf),
            payload,
        })
    }

    /// Map IO errors to appropriate PdpError variants
    ///
    /// - Timeouts/would block -> `Timeout`
    /// - Connection errors and EOF -> `Connection`
    /// - Other IO errors -> `Io`
    fn map_io_error(err: std::io::Error, context: &str) -> PdpError {
        match err.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
                PdpError::Timeout(0)
            }
            std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::NotConnected
            | std::io::ErrorKind::UnexpectedEof => {
                PdpError::Connection(format!("{}: Connection lost", context))
            }
            _ => PdpError::Io(err),
        }
    }
}

impl Default for TcpTransportAsync {
    fn default() -> Self {
        Self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_frame_layout() {
        let mut buf = Vec::new();
        TcpTransportAsync::encode_frame(&mut buf, 7, b"abc").unwrap();
        assert_eq!(&buf[..4], &11u32.to_be_bytes());
        assert_eq!(&buf[4..12], &7u64.to_be_bytes());
        assert_eq!(&buf[12..], b"abc");
    }

    #[test]
    fn test_encode_frame_rejects_oversized_payload() {
        let mut buf = Vec::new();
        let payload = vec![0u8; MAX_PAYLOAD_SIZE + 1];
        let err = TcpTransportAsync::encode_frame(&mut buf, 1, &payload).unwrap_err();
        assert!(matches!(err, PdpError::RequestTooLarge { .. }));
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn test_frames_over_duplex() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        TcpTransportAsync::send_frame(&mut client, 42, b"hello").await.unwrap();
        TcpTransportAsync::send_frame(&mut client, 43, b"").await.unwrap();

        let first = TcpTransportAsync::receive_frame(&mut server).await.unwrap();
        assert_eq!(first, Frame { id: 42, payload: b"hello".to_vec() });
        let second = TcpTransportAsync::receive_frame(&mut server).await.unwrap();
        assert_eq!(second.id, 43);
        assert!(second.payload.is_empty());
    }

    #[tokio::test]
    async fn test_receive_short_frame_is_invalid() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&3u32.to_be_bytes()).await.unwrap();
        client.write_all(b"abc").await.unwrap();

        let err = TcpTransportAsync::receive_frame(&mut server).await.unwrap_err();
        assert!(matches!(err, PdpError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn test_receive_after_peer_close_is_connection_error() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);

        let err = TcpTransportAsync::receive_frame(&mut server).await.unwrap_err();
        assert!(matches!(err, PdpError::Connection(_)));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let transport = TcpTransportAsync::new().unwrap();
        let result = transport.connect(&addr).await;
        assert!(matches!(result, Err(PdpError::Connection(_))));
    }
}
