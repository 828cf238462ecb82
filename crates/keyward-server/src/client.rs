//! Line-delimited JSON command client
//!
//! One short-lived TCP connection per call. Used by the outbound gateway to
//! reach the mailer and profile services, and by the `keyward` CLI.

use std::time::Duration;

use keyward_core::{Reply, ReplyFrame, RequestFrame};
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid frame: {0}")]
    InvalidFrame(#[from] serde_json::Error),

    #[error("Connection closed before a reply arrived")]
    Closed,

    #[error("Reply id {actual:?} does not match request id {expected}")]
    MismatchedReply {
        expected: String,
        actual: Option<String>,
    },
}

/// Client for one remote command endpoint
#[derive(Debug, Clone)]
pub struct CommandClient {
    addr: String,
    timeout: Duration,
}

impl CommandClient {
    pub fn new(addr: impl Into<String>, timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            timeout,
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Send a request frame and wait for its reply
    pub async fn call(&self, pattern: &str, data: Value) -> Result<Reply, ClientError> {
        let id = Uuid::new_v4().to_string();
        let frame = RequestFrame::request(id.clone(), pattern, data);

        let reply = tokio::time::timeout(self.timeout, self.exchange(&frame))
            .await
            .map_err(|_| ClientError::Timeout(self.timeout))??;

        if reply.id.as_deref() != Some(id.as_str()) {
            return Err(ClientError::MismatchedReply {
                expected: id,
                actual: reply.id,
            });
        }
        Ok(reply.response)
    }

    /// Write an event frame without waiting for anything back
    pub async fn send_event(&self, pattern: &str, data: Value) -> Result<(), ClientError> {
        let frame = RequestFrame::event(pattern, data);
        tokio::time::timeout(self.timeout, async {
            let mut stream = TcpStream::connect(&self.addr).await?;
            write_frame(&mut stream, &frame).await?;
            stream.shutdown().await?;
            Ok::<_, ClientError>(())
        })
        .await
        .map_err(|_| ClientError::Timeout(self.timeout))?
    }

    async fn exchange(&self, frame: &RequestFrame) -> Result<ReplyFrame, ClientError> {
        let stream = TcpStream::connect(&self.addr).await?;
        let (read_half, mut write_half) = stream.into_split();
        write_frame(&mut write_half, frame).await?;

        let mut reader = BufReader::new(read_half);
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            return Err(ClientError::Closed);
        }
        Ok(serde_json::from_str(line.trim_end())?)
    }
}

async fn write_frame<W>(writer: &mut W, frame: &RequestFrame) -> Result<(), ClientError>
where
    W: AsyncWrite + Unpin,
{
    let mut encoded = serde_json::to_vec(frame)?;
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}
