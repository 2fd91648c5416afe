//! TCP echo backend.
//!
//! One unit of work writes a fixed payload and reads the same number of bytes
//! back, comparing them. The target is expected to echo what it receives.
//! The whole unit, including the connect in per-transaction mode, is bounded
//! by `io_timeout`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use super::{Backend, BackendError, ConnectionMode, Session};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpConfig {
    /// `host:port` of the echo service.
    pub target: String,

    /// Bytes written (and expected back) per unit of work.
    pub payload_size: usize,

    /// Upper bound on one unit of work.
    pub io_timeout: Duration,

    pub connection_mode: ConnectionMode,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            target: String::new(),
            payload_size: 64,
            io_timeout: Duration::from_secs(5),
            connection_mode: ConnectionMode::LongRunning,
        }
    }
}

pub struct TcpBackend {
    config: TcpConfig,
    payload: Vec<u8>,
}

impl TcpBackend {
    pub fn new(config: TcpConfig) -> Self {
        let payload = (0..config.payload_size).map(|i| (i % 251) as u8).collect();
        Self { config, payload }
    }
}

#[async_trait]
impl Backend for TcpBackend {
    fn name(&self) -> &'static str {
        "tcp"
    }

    async fn open_session(&self) -> Result<Box<dyn Session>, BackendError> {
        let mut session = TcpSession {
            config: self.config.clone(),
            payload: self.payload.clone(),
            response: vec![0u8; self.payload.len()],
            stream: None,
        };
        // Long-running sessions connect up front so a dead target shows up as
        // an open failure rather than on the first unit of work.
        if session.config.connection_mode == ConnectionMode::LongRunning {
            let stream = timeout(session.config.io_timeout, connect(&session.config.target))
                .await
                .map_err(|_| BackendError::Timeout(session.config.io_timeout))??;
            session.stream = Some(stream);
        }
        Ok(Box::new(session))
    }
}

/// Connect and configure the socket for low latency.
async fn connect(target: &str) -> Result<TcpStream, BackendError> {
    let stream = TcpStream::connect(target).await?;
    let std_stream = stream.into_std()?;
    let socket = socket2::Socket::from(std_stream.try_clone()?);
    socket.set_nodelay(true)?;
    Ok(TcpStream::from_std(std_stream)?)
}

struct TcpSession {
    config: TcpConfig,
    payload: Vec<u8>,
    response: Vec<u8>,
    stream: Option<TcpStream>,
}

impl TcpSession {
    async fn round_trip(
        stream: &mut TcpStream,
        payload: &[u8],
        response: &mut [u8],
    ) -> Result<(), BackendError> {
        stream.write_all(payload).await?;
        stream.flush().await?;
        match stream.read_exact(response).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(BackendError::Closed)
            }
            Err(e) => return Err(e.into()),
        }
        if response != payload {
            let received = payload
                .iter()
                .zip(response.iter())
                .take_while(|(a, b)| a == b)
                .count();
            return Err(BackendError::ShortRead {
                sent: payload.len(),
                received,
            });
        }
        Ok(())
    }

    async fn unit_of_work(&mut self) -> Result<(), BackendError> {
        // The stream is taken out for the duration of the call: if this future
        // is dropped or fails mid-exchange, the connection is discarded instead
        // of being reused with unread bytes in flight.
        let mut stream = match self.stream.take() {
            Some(stream) => stream,
            None => connect(&self.config.target).await?,
        };
        Self::round_trip(&mut stream, &self.payload, &mut self.response).await?;

        match self.config.connection_mode {
            ConnectionMode::LongRunning => self.stream = Some(stream),
            ConnectionMode::PerTransaction => {
                let _ = stream.shutdown().await;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Session for TcpSession {
    async fn execute(&mut self) -> Result<(), BackendError> {
        let limit = self.config.io_timeout;
        match timeout(limit, self.unit_of_work()).await {
            Ok(result) => {
                if let Err(ref e) = result {
                    debug!("TCP unit of work against {} failed: {}", self.config.target, e);
                }
                result
            }
            Err(_) => Err(BackendError::Timeout(limit)),
        }
    }

    async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn echo_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let (mut rd, mut wr) = stream.split();
                    let _ = tokio::io::copy(&mut rd, &mut wr).await;
                });
            }
        });
        addr
    }

    fn config(target: String, mode: ConnectionMode) -> TcpConfig {
        TcpConfig {
            target,
            payload_size: 32,
            io_timeout: Duration::from_secs(2),
            connection_mode: mode,
        }
    }

    #[tokio::test]
    async fn test_long_running_round_trips() {
        let addr = echo_server().await;
        let backend = TcpBackend::new(config(addr, ConnectionMode::LongRunning));
        let mut session = backend.open_session().await.unwrap();
        for _ in 0..20 {
            session.execute().await.unwrap();
        }
        session.close().await;
    }

    #[tokio::test]
    async fn test_per_transaction_round_trips() {
        let addr = echo_server().await;
        let backend = TcpBackend::new(config(addr, ConnectionMode::PerTransaction));
        let mut session = backend.open_session().await.unwrap();
        for _ in 0..5 {
            session.execute().await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_peer_closing_is_reported() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            // Accept and immediately drop every connection.
            while let Ok((stream, _)) = listener.accept().await {
                drop(stream);
            }
        });

        let backend = TcpBackend::new(config(addr, ConnectionMode::PerTransaction));
        let mut session = backend.open_session().await.unwrap();
        assert!(session.execute().await.is_err());
    }

    #[tokio::test]
    async fn test_unreachable_target_fails_to_open() {
        // Bind then drop to get a port with nothing listening.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let backend = TcpBackend::new(config(addr, ConnectionMode::LongRunning));
        assert!(backend.open_session().await.is_err());
    }

    #[test]
    fn test_payload_pattern() {
        let backend = TcpBackend::new(TcpConfig {
            target: "127.0.0.1:9".into(),
            payload_size: 300,
            ..Default::default()
        });
        assert_eq!(backend.payload.len(), 300);
        assert_eq!(backend.payload[251], 0);
        assert_eq!(backend.payload[250], 250);
    }
}
