#![warn(missing_docs)]

//! Typed RPC surface of the ring.
//!
//! Five calls cover the whole membership and routing protocol:
//! `join_get_succ`, `find_closest_predecessor`, `get_successor`, `ping` and
//! `notify`. Every request names its recipient virtual node and carries the
//! caller's own (key, address) binding so the callee can refresh its
//! location cache.
//!
//! Results are two-tier. [`Outcome`] separates what happened to the call
//! itself ([`TransportKind`]) from what the callee had to say
//! ([`RemoteStatus`]), so a call site cannot consult one tier and forget the
//! other.

pub mod tcp;

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;

use crate::dht::Key;
use crate::dht::NetAddress;
use crate::error::Result;

/// Domain verdict of the callee, returned on every successful transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteStatus {
    /// The operation succeeded.
    Ok,
    /// The recipient key is not hosted by the addressed process.
    UnknownPeer,
    /// The callee failed a downstream call.
    Call,
    /// The callee timed out on a downstream call.
    Timeout,
    /// Temporary failure, the caller should retry.
    Retry,
    /// The callee has not finished joining the ring.
    Bootstrap,
    /// The callee's ring state is inconsistent and left for repair.
    Maintenance,
}

/// Classification of a failed transport attempt. Both kinds are retryable
/// under the caller's budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// The peer could not be reached or the connection broke.
    Call,
    /// The peer did not answer within the deadline.
    Timeout,
}

impl From<TransportKind> for RemoteStatus {
    fn from(kind: TransportKind) -> Self {
        match kind {
            TransportKind::Call => RemoteStatus::Call,
            TransportKind::Timeout => RemoteStatus::Timeout,
        }
    }
}

/// Call result carrying both tiers.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    /// Transport and callee both succeeded.
    Ok(T),
    /// Transport succeeded, the callee reported a non-ok status.
    Remote(RemoteStatus),
    /// The call itself failed.
    Transport(TransportKind),
}

impl<T> Outcome<T> {
    /// Returns `true` for [Outcome::Ok].
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok(_))
    }

    /// Extract the payload of a successful call.
    pub fn ok(self) -> Option<T> {
        match self {
            Self::Ok(v) => Some(v),
            _ => None,
        }
    }

    /// Chain a conversion of the payload, passing failures through.
    pub fn and_then<U>(self, f: impl FnOnce(T) -> Outcome<U>) -> Outcome<U> {
        match self {
            Self::Ok(v) => f(v),
            Self::Remote(status) => Outcome::Remote(status),
            Self::Transport(kind) => Outcome::Transport(kind),
        }
    }
}

/// A peer's (key, address) binding as carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    /// Ring id of the peer's virtual node.
    pub key: Key,
    /// Endpoint of the process hosting it.
    pub addr: NetAddress,
}

/// Answer to a closest-predecessor probe. The candidate's own successor is
/// attached when the callee happens to know it, saving the round trip that
/// would otherwise close the lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClosestPredecessor {
    /// The closest predecessor the callee knows for the target.
    pub peer: PeerInfo,
    /// That candidate's successor, when known.
    pub successor: Option<PeerInfo>,
}

/// A virtual node's view of its neighborhood, piggybacked on notify
/// responses and consumed by stabilization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopoDigest {
    /// Current predecessor, when set.
    pub predecessor: Option<PeerInfo>,
    /// Successor list, closest first.
    pub successors: Vec<PeerInfo>,
}

/// One request frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    /// Virtual node the request is addressed to.
    pub recipient: Key,
    /// Who is calling, for location refresh on the callee.
    pub caller: PeerInfo,
    /// The operation.
    pub body: RequestBody,
}

/// Operation selector of a request frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestBody {
    /// Ask a bootstrap peer for the caller's successor on the ring.
    JoinGetSucc,
    /// Ask for the closest predecessor of `target` the recipient knows.
    FindClosestPredecessor {
        /// Lookup target.
        target: Key,
    },
    /// Ask for the recipient's direct successor.
    GetSuccessor,
    /// Liveness probe. A successful response means the recipient was alive
    /// at call time.
    Ping,
    /// Tell the recipient the caller believes it is its predecessor.
    Notify,
}

/// One response frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    /// Domain verdict of the callee.
    pub status: RemoteStatus,
    /// Payload, present on ok statuses of payload-bearing operations.
    pub body: Option<ResponseBody>,
}

/// Payload of a response frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseBody {
    /// A successor binding.
    Successor(PeerInfo),
    /// A closest-predecessor answer.
    ClosestPredecessor(ClosestPredecessor),
    /// Neighborhood digest of the callee.
    Topo(TopoDigest),
}

impl Response {
    /// A successful response carrying `body`.
    pub fn ok(body: ResponseBody) -> Self {
        Self {
            status: RemoteStatus::Ok,
            body: Some(body),
        }
    }

    /// A bare status response.
    pub fn status(status: RemoteStatus) -> Self {
        Self { status, body: None }
    }

    /// Interpret the response as a successor answer.
    pub fn into_successor(self) -> Outcome<PeerInfo> {
        match (self.status, self.body) {
            (RemoteStatus::Ok, Some(ResponseBody::Successor(peer))) => Outcome::Ok(peer),
            (RemoteStatus::Ok, other) => malformed(other),
            (status, _) => Outcome::Remote(status),
        }
    }

    /// Interpret the response as a closest-predecessor answer.
    pub fn into_closest_predecessor(self) -> Outcome<ClosestPredecessor> {
        match (self.status, self.body) {
            (RemoteStatus::Ok, Some(ResponseBody::ClosestPredecessor(cp))) => Outcome::Ok(cp),
            (RemoteStatus::Ok, other) => malformed(other),
            (status, _) => Outcome::Remote(status),
        }
    }

    /// Interpret the response as a neighborhood digest.
    pub fn into_topo(self) -> Outcome<TopoDigest> {
        match (self.status, self.body) {
            (RemoteStatus::Ok, Some(ResponseBody::Topo(digest))) => Outcome::Ok(digest),
            (RemoteStatus::Ok, other) => malformed(other),
            (status, _) => Outcome::Remote(status),
        }
    }

    /// Interpret the response as a bare acknowledgement.
    pub fn into_ack(self) -> Outcome<()> {
        match self.status {
            RemoteStatus::Ok => Outcome::Ok(()),
            status => Outcome::Remote(status),
        }
    }
}

fn malformed<T>(body: Option<ResponseBody>) -> Outcome<T> {
    tracing::warn!("ok response with unexpected body: {:?}", body);
    Outcome::Remote(RemoteStatus::Maintenance)
}

/// The typed call surface of the ring.
///
/// Implemented twice: by the remote transport ([tcp::TcpRpc]) and by
/// [Node](crate::node::Node) itself, which answers for virtual nodes hosted
/// in-process and falls back to its transport for everyone else. Routing
/// code only ever talks to this trait and never learns whether a recipient
/// was local.
#[async_trait]
pub trait PeerRpc: Send + Sync {
    /// Ask `recipient` for the successor of the caller's key, used to seed
    /// the successor pointer while joining.
    async fn join_get_succ(
        &self,
        recipient: &PeerInfo,
        caller: &PeerInfo,
    ) -> Result<Outcome<PeerInfo>>;

    /// Ask `recipient` for the closest predecessor of `target` it knows.
    async fn find_closest_predecessor(
        &self,
        recipient: &PeerInfo,
        caller: &PeerInfo,
        target: Key,
    ) -> Result<Outcome<ClosestPredecessor>>;

    /// Ask `recipient` for its direct successor.
    async fn get_successor(
        &self,
        recipient: &PeerInfo,
        caller: &PeerInfo,
    ) -> Result<Outcome<PeerInfo>>;

    /// Probe `recipient` for liveness.
    async fn ping(&self, recipient: &PeerInfo, caller: &PeerInfo) -> Result<Outcome<()>>;

    /// Tell `recipient` the caller believes it is its predecessor. The
    /// response digests the recipient's neighborhood for stabilization.
    async fn notify(
        &self,
        recipient: &PeerInfo,
        caller: &PeerInfo,
    ) -> Result<Outcome<TopoDigest>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(n: u32) -> PeerInfo {
        PeerInfo {
            key: Key::from(n),
            addr: NetAddress::new("127.0.0.1", 9000 + n as u16),
        }
    }

    #[test]
    fn test_response_conversions() {
        let resp = Response::ok(ResponseBody::Successor(peer(4)));
        assert_eq!(resp.into_successor(), Outcome::Ok(peer(4)));

        let resp = Response::status(RemoteStatus::UnknownPeer);
        assert_eq!(
            resp.into_successor(),
            Outcome::Remote(RemoteStatus::UnknownPeer)
        );

        // an ok status with the wrong body is a broken peer, not a panic
        let resp = Response::ok(ResponseBody::Successor(peer(4)));
        assert_eq!(
            resp.into_topo(),
            Outcome::Remote(RemoteStatus::Maintenance)
        );

        assert_eq!(Response::status(RemoteStatus::Ok).into_ack(), Outcome::Ok(()));
    }

    #[test]
    fn test_transport_kind_maps_to_status() {
        assert_eq!(RemoteStatus::from(TransportKind::Call), RemoteStatus::Call);
        assert_eq!(
            RemoteStatus::from(TransportKind::Timeout),
            RemoteStatus::Timeout
        );
    }

    #[test]
    fn test_request_frame_roundtrip() {
        let req = Request {
            recipient: Key::from(10u32),
            caller: peer(4),
            body: RequestBody::FindClosestPredecessor {
                target: Key::from(7u32),
            },
        };
        let bytes = bincode::serialize(&req).unwrap();
        let back: Request = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, req);
    }
}
