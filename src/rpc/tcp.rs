#![warn(missing_docs)]

//! Length-prefixed bincode frames over TCP.
//!
//! One request per connection: the client connects, writes a frame, reads
//! the response frame and hangs up. Failures are classified, not retried:
//! connect and IO errors are [TransportKind::Call], elapsed deadlines are
//! [TransportKind::Timeout]. Retrying is the caller's decision, the lookup
//! loop has a budget for it.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::net::TcpStream;

use crate::consts;
use crate::dht::Key;
use crate::dht::NetAddress;
use crate::error::Error;
use crate::error::Result;
use crate::node::Node;
use crate::rpc::ClosestPredecessor;
use crate::rpc::Outcome;
use crate::rpc::PeerInfo;
use crate::rpc::PeerRpc;
use crate::rpc::Request;
use crate::rpc::RequestBody;
use crate::rpc::Response;
use crate::rpc::TopoDigest;
use crate::rpc::TransportKind;

use async_trait::async_trait;

/// TCP client side of the five-call surface.
pub struct TcpRpc {
    timeout: Duration,
}

impl Default for TcpRpc {
    fn default() -> Self {
        Self::new()
    }
}

impl TcpRpc {
    /// Client with the default per-call deadline.
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_millis(consts::DEFAULT_RPC_TIMEOUT_MS))
    }

    /// Client with a caller-chosen per-call deadline.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn call(&self, addr: &NetAddress, request: &Request) -> Result<Outcome<Response>> {
        let frame = encode_frame(request)?;
        let exchange = async {
            let mut stream = TcpStream::connect((addr.host(), addr.port())).await?;
            stream.write_all(&frame).await?;
            read_frame(&mut stream).await
        };
        match tokio::time::timeout(self.timeout, exchange).await {
            Err(_) => {
                tracing::debug!("call to {} timed out", addr);
                Ok(Outcome::Transport(TransportKind::Timeout))
            }
            Ok(Err(e)) => {
                tracing::debug!("call to {} failed: {}", addr, e);
                Ok(Outcome::Transport(TransportKind::Call))
            }
            Ok(Ok(bytes)) => match bincode::deserialize::<Response>(&bytes) {
                Ok(response) => Ok(Outcome::Ok(response)),
                Err(e) => {
                    tracing::debug!("garbled response from {}: {}", addr, e);
                    Ok(Outcome::Transport(TransportKind::Call))
                }
            },
        }
    }

    fn request(recipient: &PeerInfo, caller: &PeerInfo, body: RequestBody) -> Request {
        Request {
            recipient: recipient.key,
            caller: caller.clone(),
            body,
        }
    }
}

#[async_trait]
impl PeerRpc for TcpRpc {
    async fn join_get_succ(
        &self,
        recipient: &PeerInfo,
        caller: &PeerInfo,
    ) -> Result<Outcome<PeerInfo>> {
        let request = Self::request(recipient, caller, RequestBody::JoinGetSucc);
        Ok(self
            .call(&recipient.addr, &request)
            .await?
            .and_then(Response::into_successor))
    }

    async fn find_closest_predecessor(
        &self,
        recipient: &PeerInfo,
        caller: &PeerInfo,
        target: Key,
    ) -> Result<Outcome<ClosestPredecessor>> {
        let request = Self::request(
            recipient,
            caller,
            RequestBody::FindClosestPredecessor { target },
        );
        Ok(self
            .call(&recipient.addr, &request)
            .await?
            .and_then(Response::into_closest_predecessor))
    }

    async fn get_successor(
        &self,
        recipient: &PeerInfo,
        caller: &PeerInfo,
    ) -> Result<Outcome<PeerInfo>> {
        let request = Self::request(recipient, caller, RequestBody::GetSuccessor);
        Ok(self
            .call(&recipient.addr, &request)
            .await?
            .and_then(Response::into_successor))
    }

    async fn ping(&self, recipient: &PeerInfo, caller: &PeerInfo) -> Result<Outcome<()>> {
        let request = Self::request(recipient, caller, RequestBody::Ping);
        Ok(self
            .call(&recipient.addr, &request)
            .await?
            .and_then(Response::into_ack))
    }

    async fn notify(
        &self,
        recipient: &PeerInfo,
        caller: &PeerInfo,
    ) -> Result<Outcome<TopoDigest>> {
        let request = Self::request(recipient, caller, RequestBody::Notify);
        Ok(self
            .call(&recipient.addr, &request)
            .await?
            .and_then(Response::into_topo))
    }
}

fn encode_frame<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
    let body = bincode::serialize(value).map_err(Error::BincodeSerialize)?;
    if body.len() > consts::MAX_FRAME_LEN {
        return Err(Error::OversizedFrame(body.len()));
    }
    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

async fn read_frame(stream: &mut TcpStream) -> std::io::Result<Vec<u8>> {
    let mut len = [0u8; 4];
    stream.read_exact(&mut len).await?;
    let len = u32::from_be_bytes(len) as usize;
    if len > consts::MAX_FRAME_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds limit"),
        ));
    }
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;
    Ok(body)
}

/// Accept loop of the RPC server. Every connection carries one request,
/// answered through [Node::handle_request].
pub async fn serve(node: Arc<Node>, listener: TcpListener) -> Result<()> {
    loop {
        let (stream, remote) = listener.accept().await?;
        let node = node.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(node, stream).await {
                tracing::debug!("connection from {} dropped: {}", remote, e);
            }
        });
    }
}

async fn handle_connection(node: Arc<Node>, mut stream: TcpStream) -> Result<()> {
    let bytes = read_frame(&mut stream).await?;
    let request: Request =
        bincode::deserialize(&bytes).map_err(Error::BincodeDeserialize)?;
    let response = node.handle_request(request).await;
    let frame = encode_frame(&response)?;
    stream.write_all(&frame).await?;
    stream.shutdown().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::RemoteStatus;

    fn peer(key: Key, addr: &NetAddress) -> PeerInfo {
        PeerInfo {
            key,
            addr: addr.clone(),
        }
    }

    async fn serve_node(keys: &[u32]) -> (Arc<Node>, NetAddress) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let addr = NetAddress::new("127.0.0.1", port);
        let node = Arc::new(Node::new(addr.clone(), Arc::new(TcpRpc::new())));
        for key in keys {
            node.register_vnode(Key::from(*key)).unwrap();
        }
        tokio::spawn(serve(node.clone(), listener));
        (node, addr)
    }

    #[tokio::test]
    async fn test_ping_and_join_over_tcp() {
        let (node, addr) = serve_node(&[4]).await;
        node.find_vnode(Key::from(4u32)).unwrap().unwrap().create().unwrap();

        let client = TcpRpc::new();
        let caller = peer(Key::from(12u32), &NetAddress::new("127.0.0.1", 1));
        let recipient = peer(Key::from(4u32), &addr);

        let pong = client.ping(&recipient, &caller).await.unwrap();
        assert_eq!(pong, Outcome::Ok(()));

        let succ = client.join_get_succ(&recipient, &caller).await.unwrap();
        assert_eq!(succ, Outcome::Ok(peer(Key::from(4u32), &addr)));

        // the callee learned the caller's binding from the request
        let vnode = node.find_vnode(Key::from(4u32)).unwrap().unwrap();
        assert!(vnode.table().find(Key::from(12u32)).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_unknown_recipient_status() {
        let (_node, addr) = serve_node(&[4]).await;
        let client = TcpRpc::new();
        let caller = peer(Key::from(12u32), &NetAddress::new("127.0.0.1", 1));
        let recipient = peer(Key::from(9u32), &addr);

        let pong = client.ping(&recipient, &caller).await.unwrap();
        assert_eq!(pong, Outcome::Remote(RemoteStatus::UnknownPeer));
    }

    #[tokio::test]
    async fn test_unreachable_peer_classified_as_call() {
        let client = TcpRpc::new();
        let caller = peer(Key::from(12u32), &NetAddress::new("127.0.0.1", 1));
        // nothing listens on port 1
        let recipient = peer(Key::from(4u32), &NetAddress::new("127.0.0.1", 1));

        let pong = client.ping(&recipient, &caller).await.unwrap();
        assert_eq!(pong, Outcome::Transport(TransportKind::Call));
    }

    #[tokio::test]
    async fn test_silent_peer_classified_as_timeout() {
        // a listener that accepts but never answers
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut parked = vec![];
            loop {
                if let Ok((stream, _)) = listener.accept().await {
                    parked.push(stream);
                }
            }
        });

        let client = TcpRpc::with_timeout(Duration::from_millis(100));
        let caller = peer(Key::from(12u32), &NetAddress::new("127.0.0.1", 1));
        let recipient = peer(Key::from(4u32), &NetAddress::new("127.0.0.1", port));

        let pong = client.ping(&recipient, &caller).await.unwrap();
        assert_eq!(pong, Outcome::Transport(TransportKind::Timeout));
    }
}
