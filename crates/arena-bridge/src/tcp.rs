//! TCP transport for the simulation bridge
//!
//! The simulation's training bridge listens on a plain TCP port; every match is
//! one persistent connection.

use arena_core::ConnectionError;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::time::timeout;
use tracing::debug;

use crate::transport::{LineReader, LineWriter};

/// TCP read wrapper
pub type TcpReadWrapper = LineReader<OwnedReadHalf>;

/// TCP write wrapper
pub type TcpWriteWrapper = LineWriter<OwnedWriteHalf>;

/// Dial `address` within `connect_timeout` and split into framed halves
pub async fn dial(
    address: &str,
    connect_timeout: Duration,
) -> Result<(TcpReadWrapper, TcpWriteWrapper), ConnectionError> {
    debug!("Connecting to simulation at {}", address);

    let stream = timeout(connect_timeout, TcpStream::connect(address))
        .await
        .map_err(|_| {
            ConnectionError::new(
                address,
                format!("timed out after {}ms", connect_timeout.as_millis()),
            )
        })?
        .map_err(|e| ConnectionError::new(address, e.to_string()))?;

    // Records are small and latency-bound
    stream
        .set_nodelay(true)
        .map_err(|e| ConnectionError::new(address, format!("set_nodelay failed: {}", e)))?;

    let (read_half, write_half) = stream.into_split();
    Ok((LineReader::new(read_half), LineWriter::new(write_half)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_dial_refused() {
        // Bind then drop to get a port nobody listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let err = dial(&address, Duration::from_secs(1)).await.unwrap_err();
        assert_eq!(err.address, address);
    }

    #[tokio::test]
    async fn test_dial_connects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let accept = tokio::spawn(async move { listener.accept().await.is_ok() });

        assert!(dial(&address, Duration::from_secs(1)).await.is_ok());
        assert!(accept.await.unwrap());
    }
}
