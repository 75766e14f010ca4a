use std::sync::Arc;

use dirsync_core::protocol::{Request, Response, decode_line, encode_line};
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};

use crate::context::ServerContext;
use crate::dispatcher::Dispatcher;

/// Accepts connections forever, one task per connection.
pub async fn serve(
    listener: TcpListener,
    ctx: Arc<ServerContext>,
    dispatcher: Arc<Dispatcher>,
) -> std::io::Result<()> {
    loop {
        let (socket, peer) = listener.accept().await?;
        tracing::info!(%peer, "client connected");
        let ctx = Arc::clone(&ctx);
        let dispatcher = Arc::clone(&dispatcher);
        tokio::spawn(async move {
            match handle_connection(socket, ctx, dispatcher).await {
                Ok(served) => tracing::info!(%peer, served, "client disconnected"),
                Err(err) => tracing::warn!(%peer, error = %err, "connection closed with error"),
            }
        });
    }
}

/// Serves one request/response exchange per line until the peer closes.
///
/// A line longer than the configured request bound gets an error reply and
/// ends the connection.
pub async fn handle_connection(
    socket: TcpStream,
    ctx: Arc<ServerContext>,
    dispatcher: Arc<Dispatcher>,
) -> std::io::Result<u64> {
    let (read, mut write) = socket.into_split();
    let max_line = ctx.limits.max_request_line();
    let mut lines = FramedRead::new(read, LinesCodec::new_with_max_length(max_line));
    let mut served = 0u64;

    while let Some(line) = lines.next().await {
        let line = match line {
            Ok(line) => line,
            Err(LinesCodecError::MaxLineLengthExceeded) => {
                tracing::warn!(max_line, "request line too long, closing connection");
                let response = Response::error(format!(
                    "Request too large: lines are limited to {max_line} bytes"
                ));
                write_response(&mut write, &response).await?;
                write.shutdown().await?;
                break;
            }
            Err(LinesCodecError::Io(err)) => return Err(err),
        };
        if line.trim().is_empty() {
            continue;
        }
        let response = match decode_line::<Request>(&line) {
            Ok(request) => {
                tracing::debug!(action = %request.action, "request received");
                dispatcher.dispatch(Arc::clone(&ctx), request).await
            }
            Err(err) => Response::error(format!("Invalid request: {err}")),
        };
        write_response(&mut write, &response).await?;
        served += 1;
    }
    Ok(served)
}

async fn write_response(write: &mut OwnedWriteHalf, response: &Response) -> std::io::Result<()> {
    let out = match encode_line(response) {
        Ok(out) => out,
        Err(err) => {
            tracing::error!(error = %err, "failed to encode response");
            encode_line(&Response::error("Internal server error")).map_err(std::io::Error::other)?
        }
    };
    write.write_all(out.as_bytes()).await?;
    write.write_all(b"\n").await?;
    write.flush().await
}
