//! Request/response transport over TCP.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::auth::{shorten_sig, verify_msg};
use crate::frame::{receive_msg, write_msg};
use crate::msg::{Message, Msg};
use crate::results::DestinationResult;
use crate::TransportError;

/// Delivers one message to a node and waits for the aggregated outcomes of
/// the node and everything it forwards to.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send_and_receive(
        &self,
        msg: &Msg,
        addr: SocketAddr,
        timeout: Duration,
    ) -> Result<Vec<DestinationResult>, TransportError>;
}

#[derive(Clone, Debug, Default)]
pub struct TcpTransport {
    auth_key: Option<Vec<u8>>,
}

impl TcpTransport {
    pub fn new(auth_key: Option<Vec<u8>>) -> Self {
        Self { auth_key }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send_and_receive(
        &self,
        msg: &Msg,
        addr: SocketAddr,
        wait: Duration,
    ) -> Result<Vec<DestinationResult>, TransportError> {
        let mut stream = connect(addr, wait).await?;
        write_msg(&mut stream, msg).await?;

        // The first hop answers only after its own forwards have answered.
        let hop_ms = msg.forward.as_ref().map_or(0, |f| f.timeout_ms);
        let reply = receive_msg(stream, wait.saturating_add(Duration::from_millis(hop_ms))).await?;

        if let Some(key) = &self.auth_key {
            if !verify_msg(&reply, key) {
                warn!(
                    "Reply from {} failed verification (sig {})",
                    addr,
                    shorten_sig(&reply.auth.sig)
                );
                return Err(TransportError::BadSignature);
            }
        }

        match reply.decode()? {
            Message::ForwardResults(results) => {
                debug!("{} result entries from {}", results.len(), addr);
                Ok(results)
            }
            _ => Err(TransportError::UnexpectedResponse(reply.kind())),
        }
    }
}

/// Sends a message without waiting for a reply.
pub async fn send_msg(addr: SocketAddr, msg: &Msg, wait: Duration) -> Result<(), TransportError> {
    let mut stream = connect(addr, wait).await?;
    write_msg(&mut stream, msg).await?;
    stream.shutdown().await?;
    Ok(())
}

async fn connect(addr: SocketAddr, wait: Duration) -> Result<TcpStream, TransportError> {
    match timeout(wait, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(source)) => Err(TransportError::Connect { addr, source }),
        Err(_) => Err(TransportError::Timeout),
    }
}
