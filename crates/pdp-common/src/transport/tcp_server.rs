use std::future::Future;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::protocol::{CorrelationId, Request, Response};
use crate::protocol::error::{PdpError, Result};
use crate::transport::codec::JsonCodec;
use crate::transport::tcp::TcpTransportAsync;

/// Responses queued per connection before handlers wait for the writer.
const RESPONSE_QUEUE_DEPTH: usize = 1024;

/// Async TCP decision server.
///
/// Each accepted connection is one stream. Requests on a stream are handled
/// concurrently and their responses are written back as soon as they are
/// ready, tagged with the correlation id of the request, so responses may
/// leave in a different order than requests arrived.
///
/// # Example
///
/// ```no_run
/// use pdp_common::protocol::{Effect, Response};
/// use pdp_common::transport::TcpServer;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let server = TcpServer::new("127.0.0.1:5555").await?;
/// server
///     .run_with_handler(|_request| async { Ok(Response::decision(Effect::Permit, vec![])) })
///     .await?;
/// # Ok(())
/// # }
/// ```
pub struct TcpServer {
    listener: TcpListener,
}

impl TcpServer {
    /// Creates a new TCP server bound to the specified address.
    ///
    /// # Arguments
    /// * `bind_addr` - The address to bind to (e.g., "127.0.0.1:0")
    pub async fn new(bind_addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|e| PdpError::Connection(format!("Failed to bind to {}: {}", bind_addr, e)))?;

        Ok(Self { listener })
    }

    /// Gets the actual bound address.
    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| PdpError::Connection(format!("Failed to get local addr: {}", e)))
    }

    /// Runs the server with the given request handler until the task is
    /// dropped. Open connections are closed along with it.
    pub async fn run_with_handler<F, Fut>(&self, handler: F) -> Result<()>
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Response>> + Send + 'static,
    {
        self.run_until(handler, std::future::pending()).await
    }

    /// Runs the server until `shutdown` completes, then closes every open
    /// connection.
    pub async fn run_until<F, Fut, S>(&self, handler: F, shutdown: S) -> Result<()>
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Response>> + Send + 'static,
        S: Future<Output = ()>,
    {
        let handler = Arc::new(handler);
        let (stop_tx, stop_rx) = watch::channel(false);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    let _ = stop_tx.send(true);
                    info!("decision server stopped");
                    return Ok(());
                }
                accepted = self.listener.accept() => {
                    let (stream, peer_addr) = accepted.map_err(|e| {
                        PdpError::Connection(format!("Failed to accept connection: {}", e))
                    })?;

                    debug!(peer = %peer_addr, "connection established");

                    let handler = handler.clone();
                    let stop = stop_rx.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, handler, stop).await {
                            warn!(peer = %peer_addr, error = %e, "connection error");
                        }
                    });
                }
            }
        }
    }
}

/// Handle a single stream until the peer closes it or the server stops.
async fn handle_connection<F, Fut>(
    stream: TcpStream,
    handler: Arc<F>,
    mut stop: watch::Receiver<bool>,
) -> Result<()>
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response>> + Send + 'static,
{
    let (mut reader, mut writer) = stream.into_split();
    let (tx, mut rx) = mpsc::channel::<(CorrelationId, Response)>(RESPONSE_QUEUE_DEPTH);

    let writer_task = tokio::spawn(async move {
        while let Some((id, response)) = rx.recv().await {
            let encoded = match JsonCodec::encode_response(&response) {
                Ok(encoded) => encoded,
                Err(e) => {
                    warn!(id, error = %e, "failed to encode response");
                    continue;
                }
            };
            if let Err(e) = TcpTransportAsync::send_frame(&mut writer, id, &encoded).await {
                debug!(id, error = %e, "failed to send response");
                break;
            }
        }
    });

    let result = loop {
        let frame = tokio::select! {
            _ = stop.changed() => break Ok(()),
            frame = TcpTransportAsync::receive_frame(&mut reader) => frame,
        };

        let frame = match frame {
            Ok(frame) => frame,
            Err(PdpError::Connection(_)) => {
                debug!("connection closed by peer");
                return Ok(());
            }
            Err(e) => break Err(e),
        };

        let request = match JsonCodec::decode_request(&frame.payload) {
            Ok(request) => request,
            Err(e) => {
                warn!(id = frame.id, error = %e, "failed to decode request");
                let _ = tx.send((frame.id, Response::error(e.to_string()))).await;
                continue;
            }
        };

        let handler = handler.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            let response = match handler(request).await {
                Ok(response) => response,
                Err(e) => Response::error(e.to_string()),
            };
            let _ = tx.send((frame.id, response)).await;
        });
    };

    writer_task.abort();
    result
}
