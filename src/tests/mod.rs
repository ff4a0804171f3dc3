//! In-memory simulation harness.
//!
//! [SimNet] plays the network: a registry of [Node]s keyed by address, a
//! kill switch per address and per-operation call counters. It implements
//! [PeerRpc] by feeding requests straight into the target node's
//! `handle_request`, so the full wire dispatch runs without sockets.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::dht::Key;
use crate::dht::NetAddress;
use crate::dht::VirtualNode;
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

mod test_stabilization;

pub(crate) struct SimNet {
    nodes: Mutex<HashMap<NetAddress, Arc<Node>>>,
    dead: Mutex<HashSet<NetAddress>>,
    calls: Mutex<HashMap<&'static str, usize>>,
}

impl SimNet {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            nodes: Mutex::new(HashMap::new()),
            dead: Mutex::new(HashSet::new()),
            calls: Mutex::new(HashMap::new()),
        })
    }

    /// Register a node process at a synthetic address.
    pub fn add_node(self: &Arc<Self>, port: u16) -> Arc<Node> {
        let addr = NetAddress::new("sim", port);
        let node = Arc::new(Node::new(addr.clone(), self.clone() as Arc<dyn PeerRpc>));
        self.nodes.lock().unwrap().insert(addr, node.clone());
        node
    }

    /// Make every call towards `addr` time out from now on.
    pub fn kill(&self, addr: &NetAddress) {
        self.dead.lock().unwrap().insert(addr.clone());
    }

    /// Remote calls of one operation since the last reset.
    pub fn calls(&self, op: &'static str) -> usize {
        *self.calls.lock().unwrap().get(op).unwrap_or(&0)
    }

    pub fn reset_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    fn bump(&self, op: &'static str) {
        *self.calls.lock().unwrap().entry(op).or_insert(0) += 1;
    }

    fn route(&self, addr: &NetAddress) -> std::result::Result<Arc<Node>, TransportKind> {
        if self.dead.lock().unwrap().contains(addr) {
            return Err(TransportKind::Timeout);
        }
        self.nodes
            .lock()
            .unwrap()
            .get(addr)
            .cloned()
            .ok_or(TransportKind::Call)
    }

    async fn exchange(
        &self,
        op: &'static str,
        recipient: &PeerInfo,
        caller: &PeerInfo,
        body: RequestBody,
    ) -> Result<Outcome<Response>> {
        self.bump(op);
        let node = match self.route(&recipient.addr) {
            Ok(node) => node,
            Err(kind) => return Ok(Outcome::Transport(kind)),
        };
        let response = node
            .handle_request(Request {
                recipient: recipient.key,
                caller: caller.clone(),
                body,
            })
            .await;
        Ok(Outcome::Ok(response))
    }
}

#[async_trait]
impl PeerRpc for SimNet {
    async fn join_get_succ(
        &self,
        recipient: &PeerInfo,
        caller: &PeerInfo,
    ) -> Result<Outcome<PeerInfo>> {
        Ok(self
            .exchange("join_get_succ", recipient, caller, RequestBody::JoinGetSucc)
            .await?
            .and_then(Response::into_successor))
    }

    async fn find_closest_predecessor(
        &self,
        recipient: &PeerInfo,
        caller: &PeerInfo,
        target: Key,
    ) -> Result<Outcome<ClosestPredecessor>> {
        Ok(self
            .exchange(
                "find_closest_predecessor",
                recipient,
                caller,
                RequestBody::FindClosestPredecessor { target },
            )
            .await?
            .and_then(Response::into_closest_predecessor))
    }

    async fn get_successor(
        &self,
        recipient: &PeerInfo,
        caller: &PeerInfo,
    ) -> Result<Outcome<PeerInfo>> {
        Ok(self
            .exchange("get_successor", recipient, caller, RequestBody::GetSuccessor)
            .await?
            .and_then(Response::into_successor))
    }

    async fn ping(&self, recipient: &PeerInfo, caller: &PeerInfo) -> Result<Outcome<()>> {
        Ok(self
            .exchange("ping", recipient, caller, RequestBody::Ping)
            .await?
            .and_then(Response::into_ack))
    }

    async fn notify(
        &self,
        recipient: &PeerInfo,
        caller: &PeerInfo,
    ) -> Result<Outcome<TopoDigest>> {
        Ok(self
            .exchange("notify", recipient, caller, RequestBody::Notify)
            .await?
            .and_then(Response::into_topo))
    }
}

/// One process per id, hosting one virtual node keyed `id`. The first id
/// founds the ring, the rest join through it. Nothing is stabilized yet.
pub(crate) async fn ring_of(net: &Arc<SimNet>, ids: &[u32]) -> Vec<(Arc<Node>, Arc<VirtualNode>)> {
    let mut members = vec![];
    for (i, id) in ids.iter().enumerate() {
        let node = net.add_node(9000 + *id as u16);
        let vnode = node.register_vnode(Key::from(*id)).unwrap();
        if i == 0 {
            vnode.create().unwrap();
        } else {
            let bootstrap = members_info(&members[0]);
            let joined = vnode.join(node.as_ref(), &bootstrap).await.unwrap();
            assert!(joined.is_ok(), "join of {id} failed: {joined:?}");
        }
        members.push((node, vnode));
    }
    members
}

fn members_info(member: &(Arc<Node>, Arc<VirtualNode>)) -> PeerInfo {
    member.1.peer_info()
}

/// Run `rounds` full stabilization passes over the ring, in member order.
pub(crate) async fn settle(members: &[(Arc<Node>, Arc<VirtualNode>)], rounds: usize) {
    for _ in 0..rounds {
        for (node, vnode) in members {
            vnode.stabilize(node.as_ref()).await.unwrap();
        }
    }
}

/// Repair every finger slot of every member once.
pub(crate) async fn fix_all_fingers(members: &[(Arc<Node>, Arc<VirtualNode>)]) {
    for (node, vnode) in members {
        for _ in 0..crate::consts::KEY_BITS {
            vnode.fix_fingers(node.as_ref()).await.unwrap();
        }
    }
}
