use crate::protocol::{decode, encode, Message};
use async_trait::async_trait;
use datagrid_common::{GridError, Result};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Largest frame accepted from a peer
const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

/// Server side of the protocol: turns one request into one reply
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, message: Message, peer: SocketAddr) -> Message;
}

/// Request/response client over length-delimited TCP frames
#[derive(Debug, Clone)]
pub struct Transport {
    request_timeout: Duration,
}

impl Transport {
    pub fn new(request_timeout: Duration) -> Self {
        Self { request_timeout }
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Send a request and wait for its reply using the default timeout
    pub async fn request(&self, addr: SocketAddr, message: &Message) -> Result<Message> {
        self.request_with_timeout(addr, message, self.request_timeout)
            .await
    }

    /// Send a request and wait for its reply
    pub async fn request_with_timeout(
        &self,
        addr: SocketAddr,
        message: &Message,
        timeout: Duration,
    ) -> Result<Message> {
        let kind = message.kind();
        match tokio::time::timeout(timeout, exchange(addr, message)).await {
            Ok(result) => result,
            Err(_) => Err(GridError::Timeout(format!(
                "{} to {} got no reply within {:?}",
                kind, addr, timeout
            ))),
        }
    }
}

async fn exchange(addr: SocketAddr, message: &Message) -> Result<Message> {
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|e| GridError::Network(format!("connect to {} failed: {}", addr, e)))?;
    stream.set_nodelay(true)?;

    let mut framed = Framed::new(stream, codec());
    framed
        .send(encode(message)?)
        .await
        .map_err(|e| GridError::Network(format!("send to {} failed: {}", addr, e)))?;

    match framed.next().await {
        Some(Ok(frame)) => decode(&frame),
        Some(Err(e)) => Err(GridError::Network(format!("read from {} failed: {}", addr, e))),
        None => Err(GridError::Network(format!("{} closed the connection", addr))),
    }
}

fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec()
}

/// Bind a listener, mapping failures to `GridError::Bind`
pub async fn bind(addr: SocketAddr) -> Result<TcpListener> {
    TcpListener::bind(addr).await.map_err(|e| GridError::Bind {
        addr,
        message: e.to_string(),
    })
}

/// Accept connections until cancelled, answering each request frame with
/// the handler's reply
pub async fn serve(
    listener: TcpListener,
    handler: Arc<dyn MessageHandler>,
    cancel: CancellationToken,
) {
    let local = listener.local_addr().ok();
    debug!("Serving membership protocol on {:?}", local);

    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                let handler = handler.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        _ = handle_connection(stream, peer, handler) => {}
                    }
                });
            }
            Err(e) => {
                warn!("Failed to accept connection on {:?}: {}", local, e);
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }

    debug!("Stopped serving on {:?}", local);
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, handler: Arc<dyn MessageHandler>) {
    let _ = stream.set_nodelay(true);
    let mut framed = Framed::new(stream, codec());

    while let Some(frame) = framed.next().await {
        let reply = match frame {
            Ok(frame) => match decode(&frame) {
                Ok(message) => {
                    trace!("Received {} from {}", message.kind(), peer);
                    handler.handle(message, peer).await
                }
                Err(e) => {
                    warn!("Dropping connection from {}: {}", peer, e);
                    return;
                }
            },
            Err(e) => {
                debug!("Connection from {} failed: {}", peer, e);
                return;
            }
        };

        let encoded = match encode(&reply) {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!("Failed to encode {} for {}: {}", reply.kind(), peer, e);
                return;
            }
        };
        if let Err(e) = framed.send(encoded).await {
            debug!("Failed to reply to {}: {}", peer, e);
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use datagrid_common::{Member, MemberKind};

    struct Echo;

    #[async_trait]
    impl MessageHandler for Echo {
        async fn handle(&self, message: Message, _peer: SocketAddr) -> Message {
            match message {
                Message::Heartbeat { member, view_id } => Message::HeartbeatAck { member, view_id },
                _ => Message::error("unexpected"),
            }
        }
    }

    #[tokio::test]
    async fn test_request_reply_over_tcp() {
        let listener = bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        tokio::spawn(serve(listener, Arc::new(Echo), cancel.clone()));

        let transport = Transport::new(Duration::from_secs(2));
        let member = Member::new(addr, MemberKind::Normal);
        let reply = transport
            .request(addr, &Message::Heartbeat { member: member.clone(), view_id: 3 })
            .await
            .unwrap();

        match reply {
            Message::HeartbeatAck { member: echoed, view_id } => {
                assert_eq!(echoed, member);
                assert_eq!(view_id, 3);
            }
            other => panic!("unexpected {}", other.kind()),
        }

        cancel.cancel();
    }

    #[tokio::test]
    async fn test_unreachable_peer_is_network_error() {
        let listener = bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let transport = Transport::new(Duration::from_secs(2));
        let err = transport.request(addr, &Message::Ok).await.unwrap_err();
        assert!(matches!(err, GridError::Network(_) | GridError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_bind_conflict_is_bind_error() {
        let listener = bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = listener.local_addr().unwrap();

        let err = bind(addr).await.unwrap_err();
        assert!(matches!(err, GridError::Bind { .. }));
    }
}
