//! TCP control endpoint
//!
//! Line-oriented: one command per line in, a block of reply lines out closed
//! by an empty line. Every connection runs in its own task; `quit` closes only
//! that connection.

use std::net::SocketAddr;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::codec::{ControlCodec, ControlLine, END_OF_REPLY, MAX_LINE_LENGTH};
use super::dispatch::ControlPlane;
use crate::error::{BridgeError, Result};

pub struct ControlServer {
    listener: TcpListener,
    plane: Arc<ControlPlane>,
}

impl ControlServer {
    pub async fn bind(addr: SocketAddr, plane: Arc<ControlPlane>) -> Result<Self> {
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            BridgeError::IoError(format!("Failed to bind control socket {addr}: {e}"))
        })?;
        Ok(Self { listener, plane })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `cancel` fires, then wait for open sessions.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        info!("Control server listening on {}", self.local_addr()?);
        let mut sessions = JoinSet::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        info!("Control client connected: {}", peer);
                        let plane = Arc::clone(&self.plane);
                        let session_cancel = cancel.child_token();
                        sessions.spawn(async move {
                            if let Err(e) = serve_connection(stream, plane, session_cancel).await {
                                warn!("Control session {} ended with error: {}", peer, e);
                            }
                            info!("Control client disconnected: {}", peer);
                        });
                    },
                    Err(e) => error!("Failed to accept control connection: {}", e),
                },
                Some(finished) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = finished {
                        error!("Control session task failed: {}", e);
                    }
                },
            }
        }

        while let Some(finished) = sessions.join_next().await {
            if let Err(e) = finished {
                error!("Control session task failed: {}", e);
            }
        }
        info!("Control server stopped");
        Ok(())
    }
}

async fn serve_connection(
    stream: TcpStream,
    plane: Arc<ControlPlane>,
    cancel: CancellationToken,
) -> Result<()> {
    let mut lines = Framed::new(stream, ControlCodec::new());

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = lines.next() => next,
        };

        let line = match next {
            None => break,
            Some(Ok(ControlLine::Line(line))) => line,
            Some(Ok(ControlLine::TooLong)) => {
                warn!("Control line longer than {} bytes discarded", MAX_LINE_LENGTH);
                send_reply(
                    &mut lines,
                    &[format!("ERROR: line longer than {MAX_LINE_LENGTH} bytes")],
                )
                .await?;
                continue;
            },
            Some(Err(e)) => return Err(e),
        };

        debug!("Control line: {}", line.trim());
        let Some(reply) = plane.handle_line(&line).await else {
            continue;
        };
        send_reply(&mut lines, &reply.lines).await?;
        if reply.quit {
            break;
        }
    }

    Ok(())
}

async fn send_reply(lines: &mut Framed<TcpStream, ControlCodec>, reply: &[String]) -> Result<()> {
    for line in reply {
        lines.feed(line.clone()).await?;
    }
    lines.feed(END_OF_REPLY.to_string()).await?;
    SinkExt::<String>::flush(lines).await
}
