use std::io;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("not connected to server")]
    NotConnected,
    #[error("no server address recorded; connect first")]
    NoAddress,
    #[error("connection timed out to {0}")]
    ConnectTimeout(String),
    #[error("connection closed by server without a reply")]
    PeerClosed,
    #[error("connection I/O error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerAddress {
    pub host: String,
    pub port: u16,
}

impl ServerAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl std::fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Default)]
struct ConnectionState {
    address: Option<ServerAddress>,
    stream: Option<BufReader<TcpStream>>,
}

impl ConnectionState {
    fn is_alive(&self) -> bool {
        self.stream
            .as_ref()
            .is_some_and(|stream| stream.get_ref().peer_addr().is_ok())
    }

    fn teardown(&mut self) {
        if self.stream.take().is_some() {
            tracing::debug!(address = ?self.address, "connection torn down");
        }
    }

    async fn open(&mut self, address: ServerAddress, timeout: Duration) -> Result<(), ConnectionError> {
        self.teardown();
        let target = address.to_string();
        self.address = Some(address);
        let stream = tokio::time::timeout(timeout, TcpStream::connect(target.as_str()))
            .await
            .map_err(|_| ConnectionError::ConnectTimeout(target.clone()))??;
        stream.set_nodelay(true)?;
        tracing::info!(address = %target, "connected to server");
        self.stream = Some(BufReader::new(stream));
        Ok(())
    }
}

/// One persistent connection to the server.
///
/// Every method takes the same internal lock, so concurrent callers sharing a
/// manager observe one in-order request/response stream.
pub struct ConnectionManager {
    state: Mutex<ConnectionState>,
    connect_timeout: Duration,
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::with_connect_timeout(DEFAULT_CONNECT_TIMEOUT)
    }

    pub fn with_connect_timeout(connect_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(ConnectionState::default()),
            connect_timeout,
        }
    }

    /// Opens the connection unless one to the same address is already alive.
    pub async fn connect(&self, address: &ServerAddress) -> Result<(), ConnectionError> {
        let mut state = self.state.lock().await;
        if state.is_alive() && state.address.as_ref() == Some(address) {
            return Ok(());
        }
        state.open(address.clone(), self.connect_timeout).await
    }

    pub async fn reconnect(&self) -> Result<(), ConnectionError> {
        let mut state = self.state.lock().await;
        let address = state.address.clone().ok_or(ConnectionError::NoAddress)?;
        state.open(address, self.connect_timeout).await
    }

    pub async fn disconnect(&self) {
        let mut state = self.state.lock().await;
        state.teardown();
    }

    pub async fn is_connected(&self) -> bool {
        self.state.lock().await.is_alive()
    }

    pub async fn address(&self) -> Option<ServerAddress> {
        self.state.lock().await.address.clone()
    }

    /// Writes one request line and blocks for exactly one reply line.
    ///
    /// Any failure drops the socket so the next call has to connect again.
    pub async fn send_request_and_get_response(
        &self,
        payload: &str,
    ) -> Result<String, ConnectionError> {
        let mut state = self.state.lock().await;
        let Some(stream) = state.stream.as_mut() else {
            return Err(ConnectionError::NotConnected);
        };
        match exchange(stream, payload).await {
            Ok(line) => Ok(line),
            Err(err) => {
                tracing::warn!(error = %err, "request failed, dropping connection");
                state.teardown();
                Err(err)
            }
        }
    }
}

async fn exchange(
    stream: &mut BufReader<TcpStream>,
    payload: &str,
) -> Result<String, ConnectionError> {
    let writer = stream.get_mut();
    writer.write_all(payload.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;

    let mut line = String::new();
    let read = stream.read_line(&mut line).await?;
    if read == 0 {
        return Err(ConnectionError::PeerClosed);
    }
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}
