//! Client side of the TCP control protocol

use std::net::SocketAddr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use super::codec::{ControlCodec, ControlLine, END_OF_REPLY};
use crate::error::{BridgeError, Result};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Connection to a running instance's control socket
pub struct ControlClient {
    lines: Framed<TcpStream, ControlCodec>,
}

impl ControlClient {
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| BridgeError::IoError(format!("Timed out connecting to {addr}")))?
            .map_err(|e| {
                BridgeError::IoError(format!("Cannot reach canbridge control socket {addr}: {e}"))
            })?;
        Ok(Self {
            lines: Framed::new(stream, ControlCodec::new()),
        })
    }

    /// Send one command and read its reply block
    pub async fn request(&mut self, command: &str) -> Result<Vec<String>> {
        self.lines.send(command.to_string()).await?;

        let mut reply = Vec::new();
        loop {
            match self.lines.next().await {
                Some(Ok(ControlLine::Line(line))) if line == END_OF_REPLY => return Ok(reply),
                Some(Ok(ControlLine::Line(line))) => reply.push(line),
                Some(Ok(ControlLine::TooLong)) => {
                    return Err(BridgeError::ProtocolError(
                        "Reply line too long".to_string(),
                    ))
                },
                Some(Err(e)) => return Err(e),
                None => {
                    return Err(BridgeError::IoError(
                        "Control connection closed".to_string(),
                    ))
                },
            }
        }
    }

    /// Send a command and return the first line of its reply
    pub async fn request_line(&mut self, command: &str) -> Result<String> {
        self.request(command)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| BridgeError::ProtocolError("Empty reply".to_string()))
    }
}
