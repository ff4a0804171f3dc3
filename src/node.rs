#![warn(missing_docs)]

//! Process-level node.
//!
//! A [Node] hosts any number of virtual nodes behind one transport endpoint
//! and one RPC client. It implements [PeerRpc] itself: calls addressed to a
//! virtual node hosted here are answered in place, everything else falls
//! through to the client. Routing code gets handed the node as its call
//! seam and never has to ask "is this peer local?".

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::dht::Key;
use crate::dht::NetAddress;
use crate::dht::VirtualNode;
use crate::error::Error;
use crate::error::Result;
use crate::rpc::ClosestPredecessor;
use crate::rpc::Outcome;
use crate::rpc::PeerInfo;
use crate::rpc::PeerRpc;
use crate::rpc::RemoteStatus;
use crate::rpc::Request;
use crate::rpc::RequestBody;
use crate::rpc::Response;
use crate::rpc::ResponseBody;
use crate::rpc::TopoDigest;

/// Container of the virtual nodes hosted by one process.
pub struct Node {
    addr: NetAddress,
    client: Arc<dyn PeerRpc>,
    vnodes: RwLock<HashMap<Key, Arc<VirtualNode>>>,
}

impl Node {
    /// Build a node listening at `addr`, reaching remote peers through
    /// `client`.
    pub fn new(addr: NetAddress, client: Arc<dyn PeerRpc>) -> Self {
        Self {
            addr,
            client,
            vnodes: RwLock::new(HashMap::new()),
        }
    }

    /// Endpoint of this process.
    pub fn addr(&self) -> &NetAddress {
        &self.addr
    }

    /// Host a new virtual node under a fresh random key.
    pub fn spawn_vnode(&self) -> Result<Arc<VirtualNode>> {
        loop {
            match self.register_vnode(Key::random()) {
                Err(Error::DuplicateVirtualNode(_)) => continue,
                other => return other,
            }
        }
    }

    /// Host a new virtual node under a caller-chosen key.
    pub fn register_vnode(&self, key: Key) -> Result<Arc<VirtualNode>> {
        let mut vnodes = self
            .vnodes
            .write()
            .map_err(|_| Error::VirtualNodeTableLock)?;
        if vnodes.contains_key(&key) {
            return Err(Error::DuplicateVirtualNode(key));
        }
        let vnode = Arc::new(VirtualNode::with_key(key, self.addr.clone())?);
        vnodes.insert(key, vnode.clone());
        tracing::info!("hosting virtual node {} at {}", key, self.addr);
        Ok(vnode)
    }

    /// Tear a virtual node down. Removal from the map also removes it from
    /// the maintenance set in the same step, since maintenance snapshots the
    /// map under this lock.
    pub fn remove_vnode(&self, key: Key) -> Result<Option<Arc<VirtualNode>>> {
        let mut vnodes = self
            .vnodes
            .write()
            .map_err(|_| Error::VirtualNodeTableLock)?;
        let removed = vnodes.remove(&key);
        if removed.is_some() {
            tracing::info!("dropped virtual node {}", key);
        }
        Ok(removed)
    }

    /// Look up a locally hosted virtual node.
    pub fn find_vnode(&self, key: Key) -> Result<Option<Arc<VirtualNode>>> {
        Ok(self
            .vnodes
            .read()
            .map_err(|_| Error::VirtualNodeTableLock)?
            .get(&key)
            .cloned())
    }

    /// Snapshot of all hosted virtual nodes.
    pub fn vnodes(&self) -> Result<Vec<Arc<VirtualNode>>> {
        Ok(self
            .vnodes
            .read()
            .map_err(|_| Error::VirtualNodeTableLock)?
            .values()
            .cloned()
            .collect())
    }

    /// Resolve `target` to the node responsible for it, routing through the
    /// first hosted virtual node that finished joining. This is the lookup
    /// entry point for co-hosted applications.
    pub async fn find_successor(&self, target: Key) -> Result<Outcome<PeerInfo>> {
        for vnode in self.vnodes()? {
            if vnode.successor()?.is_some() {
                return vnode.find_successor(self, target).await;
            }
        }
        Err(Error::NoActiveVirtualNode)
    }

    /// Serve one decoded request frame. This is the single entry point of
    /// the RPC server: it resolves the recipient among the hosted virtual
    /// nodes, teaches it where the caller lives, runs the operation and
    /// folds errors into a wire status.
    pub async fn handle_request(&self, request: Request) -> Response {
        let vnode = match self.find_vnode(request.recipient) {
            Ok(Some(vnode)) => vnode,
            Ok(None) => return Response::status(RemoteStatus::UnknownPeer),
            Err(e) => {
                tracing::error!("recipient lookup failed: {}", e);
                return Response::status(RemoteStatus::Maintenance);
            }
        };

        // every request carries the caller's binding; remember it
        if request.caller.key != vnode.key() {
            if let Err(e) = vnode
                .table()
                .add_or_find(request.caller.key, &request.caller.addr)
            {
                tracing::error!("caller registration failed: {}", e);
                return Response::status(RemoteStatus::Maintenance);
            }
        }

        let served: Result<Response> = match request.body {
            RequestBody::JoinGetSucc => {
                self.serve_join(&vnode, &request.caller).await
            }
            RequestBody::FindClosestPredecessor { target } => vnode
                .closest_predecessor(target)
                .map(|cp| Response::ok(ResponseBody::ClosestPredecessor(cp))),
            RequestBody::GetSuccessor => vnode.successor_info().map(|succ| match succ {
                Some(peer) => Response::ok(ResponseBody::Successor(peer)),
                None => Response::status(RemoteStatus::Bootstrap),
            }),
            RequestBody::Ping => Ok(Response::status(vnode.ping())),
            RequestBody::Notify => match vnode.notify(self, &request.caller).await {
                Ok(()) => TopoDigest::try_from(vnode.as_ref())
                    .map(|digest| Response::ok(ResponseBody::Topo(digest))),
                Err(e) => Err(e),
            },
        };

        match served {
            Ok(response) => response,
            Err(Error::MissingSuccessor(_)) => Response::status(RemoteStatus::Bootstrap),
            Err(e) => {
                tracing::error!("request on {} failed: {}", request.recipient, e);
                Response::status(RemoteStatus::Maintenance)
            }
        }
    }

    async fn serve_join(&self, vnode: &Arc<VirtualNode>, sender: &PeerInfo) -> Result<Response> {
        match vnode.join_get_succ(self, sender).await? {
            Outcome::Ok(succ) => Ok(Response::ok(ResponseBody::Successor(succ))),
            Outcome::Remote(status) => Ok(Response::status(status)),
            // a downstream failure while serving a join surfaces to the
            // joiner as its remote verdict
            Outcome::Transport(kind) => Ok(Response::status(kind.into())),
        }
    }
}

#[async_trait]
impl PeerRpc for Node {
    async fn join_get_succ(
        &self,
        recipient: &PeerInfo,
        caller: &PeerInfo,
    ) -> Result<Outcome<PeerInfo>> {
        if let Some(vnode) = self.find_vnode(recipient.key)? {
            return match vnode.join_get_succ(self, caller).await {
                Err(Error::MissingSuccessor(_)) => Ok(Outcome::Remote(RemoteStatus::Bootstrap)),
                other => other,
            };
        }
        self.client.join_get_succ(recipient, caller).await
    }

    async fn find_closest_predecessor(
        &self,
        recipient: &PeerInfo,
        caller: &PeerInfo,
        target: Key,
    ) -> Result<Outcome<ClosestPredecessor>> {
        if let Some(vnode) = self.find_vnode(recipient.key)? {
            return vnode.closest_predecessor(target).map(Outcome::Ok);
        }
        self.client
            .find_closest_predecessor(recipient, caller, target)
            .await
    }

    async fn get_successor(
        &self,
        recipient: &PeerInfo,
        caller: &PeerInfo,
    ) -> Result<Outcome<PeerInfo>> {
        if let Some(vnode) = self.find_vnode(recipient.key)? {
            return Ok(match vnode.successor_info()? {
                Some(peer) => Outcome::Ok(peer),
                None => Outcome::Remote(RemoteStatus::Bootstrap),
            });
        }
        self.client.get_successor(recipient, caller).await
    }

    async fn ping(&self, recipient: &PeerInfo, caller: &PeerInfo) -> Result<Outcome<()>> {
        if let Some(vnode) = self.find_vnode(recipient.key)? {
            return Ok(match vnode.ping() {
                RemoteStatus::Ok => Outcome::Ok(()),
                status => Outcome::Remote(status),
            });
        }
        self.client.ping(recipient, caller).await
    }

    async fn notify(
        &self,
        recipient: &PeerInfo,
        caller: &PeerInfo,
    ) -> Result<Outcome<TopoDigest>> {
        if let Some(vnode) = self.find_vnode(recipient.key)? {
            vnode.notify(self, caller).await?;
            return Ok(Outcome::Ok(TopoDigest::try_from(vnode.as_ref())?));
        }
        self.client.notify(recipient, caller).await
    }
}
