//! TCP command listener
//!
//! Each connection carries any number of request frames, one JSON object per
//! line, handled in order. Frames with an `id` get exactly one reply line;
//! frames without one are events and get nothing back.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use keyward_core::{messages, ErrorKind, Reply, ReplyFrame, RequestFrame};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::dispatch::Dispatcher;

/// Accept connections until `shutdown` resolves
pub async fn serve<F>(
    listener: TcpListener,
    dispatcher: Arc<Dispatcher>,
    max_frame_bytes: usize,
    shutdown: F,
) -> std::io::Result<()>
where
    F: Future<Output = ()>,
{
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(error = %e, "Accept failed");
                        continue;
                    }
                };
                let dispatcher = dispatcher.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, peer, dispatcher, max_frame_bytes).await {
                        debug!(peer = %peer, error = %e, "Connection closed with error");
                    }
                });
            }
            _ = &mut shutdown => {
                info!("Shutdown signal received, no longer accepting connections");
                return Ok(());
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    dispatcher: Arc<Dispatcher>,
    max_frame_bytes: usize,
) -> std::io::Result<()> {
    debug!(peer = %peer, "Connection opened");
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line = Vec::new();

    loop {
        line.clear();
        let read = (&mut reader)
            .take(max_frame_bytes as u64 + 1)
            .read_until(b'\n', &mut line)
            .await?;
        if read == 0 {
            debug!(peer = %peer, "Connection closed by peer");
            return Ok(());
        }

        if line.last() != Some(&b'\n') && line.len() > max_frame_bytes {
            warn!(peer = %peer, limit = max_frame_bytes, "Frame too large, closing connection");
            let reply = Reply::error(ErrorKind::BadRequest, messages::MALFORMED_PAYLOAD);
            write_reply(&mut write_half, None, reply).await?;
            return Ok(());
        }

        let text = String::from_utf8_lossy(&line);
        let text = text.trim();
        if text.is_empty() {
            continue;
        }

        let frame: RequestFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(peer = %peer, error = %e, "Undecodable frame");
                let reply = Reply::error(ErrorKind::BadRequest, messages::MALFORMED_PAYLOAD);
                write_reply(&mut write_half, None, reply).await?;
                continue;
            }
        };

        let expects_reply = frame.expects_reply();
        let reply = dispatcher.dispatch(&frame.pattern, frame.data).await;
        if expects_reply {
            write_reply(&mut write_half, frame.id, reply).await?;
        }
    }
}

async fn write_reply<W>(writer: &mut W, id: Option<String>, response: Reply) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = ReplyFrame { id, response };
    let mut encoded = match serde_json::to_vec(&frame) {
        Ok(encoded) => encoded,
        Err(e) => {
            error!(error = %e, "Failed to encode reply");
            return Ok(());
        }
    };
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await
}
