#![warn(missing_docs)]

//! The per-identity ring state machine.
//!
//! A [VirtualNode] is one independently addressable point on the ring. A
//! process may host several; each owns its key, its successor and
//! predecessor pointers, a [LocationTable], a [FingerTable] and a
//! [SuccessorList], and runs the Chord operations against an injected
//! [PeerRpc] seam, so it never knows whether a peer lives in the same
//! process.
//!
//! Lock order, for operations that hold several: location table, finger
//! table, successor list, predecessor, successor. Table operations are
//! self-contained and never nest inside the others' critical sections the
//! other way around.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;

use num_bigint::BigUint;

use crate::consts;
use crate::dht::FingerTable;
use crate::dht::Key;
use crate::dht::Location;
use crate::dht::LocationTable;
use crate::dht::NetAddress;
use crate::dht::SuccessorList;
use crate::dht::SuccessorReader;
use crate::dht::SuccessorWriter;
use crate::error::Error;
use crate::error::Result;
use crate::rpc::ClosestPredecessor;
use crate::rpc::Outcome;
use crate::rpc::PeerInfo;
use crate::rpc::PeerRpc;
use crate::rpc::RemoteStatus;
use crate::rpc::TopoDigest;

/// One virtual node on the ring.
pub struct VirtualNode {
    key: Key,
    addr: NetAddress,
    table: LocationTable,
    finger: Mutex<FingerTable>,
    successors: SuccessorList,
    successor: Mutex<Option<Key>>,
    predecessor: Mutex<Option<Key>>,
}

/// Result of one finished lookup: the predecessor owning the arc the target
/// falls into, and that predecessor's successor, which is the answer to
/// `find_successor`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Route {
    pred: PeerInfo,
    succ: PeerInfo,
}

impl VirtualNode {
    /// Build a virtual node with a fresh random key, hosted at `addr`.
    pub fn new(addr: NetAddress) -> Result<Self> {
        Self::with_key(Key::random(), addr)
    }

    /// Build a virtual node with a caller-chosen key.
    pub fn with_key(key: Key, addr: NetAddress) -> Result<Self> {
        let table = LocationTable::new();
        table.add(key, &addr)?;
        Ok(Self {
            key,
            addr,
            table,
            finger: Mutex::new(FingerTable::new(key, consts::KEY_BITS)),
            successors: SuccessorList::new(key, consts::SUCCESSOR_LIST_MAX),
            successor: Mutex::new(None),
            predecessor: Mutex::new(None),
        })
    }

    /// Ring id of this virtual node.
    pub fn key(&self) -> Key {
        self.key
    }

    /// Endpoint of the hosting process.
    pub fn addr(&self) -> &NetAddress {
        &self.addr
    }

    /// The (key, address) binding of this virtual node.
    pub fn peer_info(&self) -> PeerInfo {
        PeerInfo {
            key: self.key,
            addr: self.addr.clone(),
        }
    }

    /// The owned location table.
    pub fn table(&self) -> &LocationTable {
        &self.table
    }

    /// The successor list.
    pub fn successors(&self) -> SuccessorList {
        self.successors.clone()
    }

    /// Lock and return MutexGuard of finger table.
    pub fn lock_finger(&self) -> Result<MutexGuard<FingerTable>> {
        self.finger.lock().map_err(|_| Error::FingerTableLock)
    }

    /// Lock and return MutexGuard of the successor slot.
    pub fn lock_successor(&self) -> Result<MutexGuard<Option<Key>>> {
        self.successor.lock().map_err(|_| Error::SuccessorLock)
    }

    /// Lock and return MutexGuard of the predecessor slot.
    pub fn lock_predecessor(&self) -> Result<MutexGuard<Option<Key>>> {
        self.predecessor.lock().map_err(|_| Error::PredecessorLock)
    }

    /// Current successor key, if any.
    pub fn successor(&self) -> Result<Option<Key>> {
        Ok(*self.lock_successor()?)
    }

    /// Current predecessor key, if any.
    pub fn predecessor(&self) -> Result<Option<Key>> {
        Ok(*self.lock_predecessor()?)
    }

    /// Whether a predecessor is set and equals `key`.
    pub fn predecessor_is(&self, key: Key) -> Result<bool> {
        Ok(*self.lock_predecessor()? == Some(key))
    }

    /// Resolve a key that ring state claims to know. A miss here means a
    /// pointer outlived its table entry; routing through it would silently
    /// mis-deliver, so the process aborts unless the check is toggled off.
    fn location(&self, key: Key) -> Result<Arc<Location>> {
        match self.table.find(key)? {
            Some(loc) => Ok(loc),
            None => {
                tracing::error!("ring state broken on {}: no location for {}", self.key, key);
                if consts::ABORT_ON_BROKEN_RING {
                    std::process::abort();
                }
                Err(Error::LocationMissing(key))
            }
        }
    }

    fn resolve(&self, key: Key) -> Result<PeerInfo> {
        if key == self.key {
            return Ok(self.peer_info());
        }
        let loc = self.location(key)?;
        Ok(PeerInfo {
            key,
            addr: loc.addr()?,
        })
    }

    /// Start a fresh ring with this node as its only member. The successor
    /// slot points back at the node itself until someone joins.
    pub fn create(&self) -> Result<()> {
        tracing::debug!("{} creates a new ring", self.key);
        let addr = self.addr.clone();
        self.set_successor(self.key, &addr)
    }

    /// Install `key` as the direct successor, registering or refreshing its
    /// location. Setting the current successor again only refreshes the
    /// address and re-binds finger slot 0.
    pub fn set_successor(&self, key: Key, addr: &NetAddress) -> Result<()> {
        self.table.add_or_find(key, addr)?;
        let mut finger = self.lock_finger()?;
        self.successors.set_head(key)?;
        let mut successor = self.lock_successor()?;
        if *successor != Some(key) {
            tracing::debug!("{} successor -> {}", self.key, key);
        }
        *successor = Some(key);
        finger.set(0, key);
        Ok(())
    }

    /// Install `key` as the predecessor, registering or refreshing its
    /// location.
    pub fn set_predecessor(&self, key: Key, addr: &NetAddress) -> Result<()> {
        if key == self.key {
            tracing::info!("refusing own key as predecessor of {}", self.key);
            return Ok(());
        }
        self.table.add_or_find(key, addr)?;
        let mut predecessor = self.lock_predecessor()?;
        if *predecessor != Some(key) {
            tracing::debug!("{} predecessor -> {}", self.key, key);
        }
        *predecessor = Some(key);
        Ok(())
    }

    /// Drop every reference to a peer, then its location. The order is
    /// normative: finger table first, successor list second, predecessor
    /// third, table entry last, so no pointer ever outlives the entry it
    /// resolves through.
    pub fn remove_location(&self, loc: &Arc<Location>) -> Result<()> {
        let key = loc.key();
        tracing::debug!("{} drops peer {}", self.key, key);
        {
            let mut finger = self.lock_finger()?;
            finger.remove(key);
            self.successors.remove(key)?;
            {
                let mut predecessor = self.lock_predecessor()?;
                if *predecessor == Some(key) {
                    *predecessor = None;
                }
            }
            let mut successor = self.lock_successor()?;
            if *successor == Some(key) {
                let next = match self.successors.list()?.first().copied() {
                    Some(next) => Some(next),
                    None => finger.first(),
                };
                *successor = next;
                if let Some(next) = next {
                    finger.set(0, next);
                    tracing::info!("{} promotes successor {}", self.key, next);
                }
            }
        }
        self.table.remove(loc)
    }

    /// Join a ring through a bootstrap peer: forget any stale predecessor,
    /// ask the bootstrap for our successor and install it. Transport
    /// failures are handed back to the caller; maintenance retries the join.
    pub async fn join(&self, via: &dyn PeerRpc, bootstrap: &PeerInfo) -> Result<Outcome<()>> {
        tracing::debug!("{} joins via {}", self.key, bootstrap.key);
        {
            let mut predecessor = self.lock_predecessor()?;
            *predecessor = None;
        }
        match via.join_get_succ(bootstrap, &self.peer_info()).await? {
            Outcome::Ok(succ) => {
                self.set_successor(succ.key, &succ.addr)?;
                Ok(Outcome::Ok(()))
            }
            Outcome::Remote(status) => {
                tracing::warn!("{} join refused by {}: {:?}", self.key, bootstrap.key, status);
                Ok(Outcome::Remote(status))
            }
            Outcome::Transport(kind) => {
                tracing::warn!("{} join via {} failed: {:?}", self.key, bootstrap.key, kind);
                Ok(Outcome::Transport(kind))
            }
        }
    }

    /// Serve a join request: the sender becomes a known peer and gets told
    /// its successor.
    pub async fn join_get_succ(
        &self,
        via: &dyn PeerRpc,
        sender: &PeerInfo,
    ) -> Result<Outcome<PeerInfo>> {
        self.table.add_or_find(sender.key, &sender.addr)?;
        self.find_successor(via, sender.key).await
    }

    /// The closest predecessor of `target` this node knows, with the
    /// candidate's own successor attached when available: always when the
    /// answer is this node itself, and when the candidate heads the
    /// successor list, whose second entry is exactly its successor.
    pub fn closest_predecessor(&self, target: Key) -> Result<ClosestPredecessor> {
        let candidate = { self.lock_finger()?.closest_predecessor(target) };
        if candidate == self.key {
            return Ok(ClosestPredecessor {
                peer: self.peer_info(),
                successor: self.successor_info()?,
            });
        }
        let successor = {
            let list = self.successors.list()?;
            if list.first() == Some(&candidate) && list.len() > 1 {
                Some(self.resolve(list[1])?)
            } else {
                None
            }
        };
        Ok(ClosestPredecessor {
            peer: self.resolve(candidate)?,
            successor,
        })
    }

    /// The direct successor as a wire binding, `None` before joining.
    pub fn successor_info(&self) -> Result<Option<PeerInfo>> {
        match *self.lock_successor()? {
            None => Ok(None),
            Some(key) => Ok(Some(self.resolve(key)?)),
        }
    }

    /// Liveness probe. A successful status means this node was alive at
    /// call time; throttling of abusive callers can hang off this hook.
    pub fn ping(&self) -> RemoteStatus {
        RemoteStatus::Ok
    }

    /// Whether a peer looks dead: unreachable or answering non-ok. Peers
    /// hosted by the local process answer through the dispatcher without a
    /// wire call and are alive by definition.
    pub async fn is_dead(&self, via: &dyn PeerRpc, peer: &PeerInfo) -> Result<bool> {
        match via.ping(peer, &self.peer_info()).await? {
            Outcome::Ok(()) => Ok(false),
            Outcome::Remote(status) => {
                tracing::debug!("ping {} answered {:?}", peer.key, status);
                Ok(true)
            }
            Outcome::Transport(kind) => {
                tracing::debug!("ping {} failed: {:?}", peer.key, kind);
                Ok(true)
            }
        }
    }

    /// Handle a peer claiming to be our predecessor. Accept when no
    /// predecessor is set, when the current one is dead, or when the sender
    /// bisects the arc (predecessor, self). Acceptance refreshes the
    /// sender's address binding.
    pub async fn notify(&self, via: &dyn PeerRpc, sender: &PeerInfo) -> Result<()> {
        if sender.key == self.key {
            return Ok(());
        }
        let current = *self.lock_predecessor()?;
        let accept = match current {
            None => true,
            Some(pred) if pred == sender.key => true,
            Some(pred) => {
                if sender.key.between(pred, self.key) {
                    true
                } else {
                    // a crashed predecessor must not block its replacement
                    let pred_info = self.resolve(pred)?;
                    self.is_dead(via, &pred_info).await?
                }
            }
        };
        if accept {
            self.set_predecessor(sender.key, &sender.addr)?;
        }
        Ok(())
    }

    /// Find the live node responsible for `target`.
    pub async fn find_successor(
        &self,
        via: &dyn PeerRpc,
        target: Key,
    ) -> Result<Outcome<PeerInfo>> {
        Ok(self.find_route(via, target).await?.and_then(|route| {
            tracing::debug!(
                "find_successor: self: {}, target: {}, result: {}",
                self.key,
                target,
                route.succ.key
            );
            Outcome::Ok(route.succ)
        }))
    }

    /// Find the node whose arc covers `target`, i.e. the last node strictly
    /// before it on the ring.
    pub async fn find_predecessor(
        &self,
        via: &dyn PeerRpc,
        target: Key,
    ) -> Result<Outcome<PeerInfo>> {
        Ok(self
            .find_route(via, target)
            .await?
            .and_then(|route| Outcome::Ok(route.pred)))
    }

    /// The iterative lookup. Starting from this node, repeatedly ask the
    /// current candidate for the closest predecessor of `target` it knows,
    /// until `target` falls inside (candidate, candidate's successor]. Each
    /// answering step moves strictly clockwise, so the walk terminates; an
    /// unreachable hop is routed around through the recorded trail, at most
    /// [consts::UNDERSHOOT_RETRY_BUDGET] times per lookup.
    async fn find_route(&self, via: &dyn PeerRpc, target: Key) -> Result<Outcome<Route>> {
        let own_succ = (*self.lock_successor()?).ok_or(Error::MissingSuccessor(self.key))?;
        let caller = self.peer_info();

        let mut cur = self.peer_info();
        let mut cur_succ = self.resolve(own_succ)?;
        let mut hops: Vec<PeerInfo> = vec![cur.clone()];
        let mut recoveries = 0usize;

        while !target.between_left_open(cur.key, cur_succ.key) {
            tracing::debug!(
                "find_route: {} not in ({}, {}], asking {}",
                target,
                cur.key,
                cur_succ.key,
                cur.key
            );
            let step = match via.find_closest_predecessor(&cur, &caller, target).await? {
                Outcome::Ok(cp) => cp,
                Outcome::Remote(status) => {
                    tracing::debug!("find_route: {} answered {:?}", cur.key, status);
                    return Ok(Outcome::Remote(status));
                }
                Outcome::Transport(kind) => {
                    match self.reroute(via, &mut hops, &mut recoveries).await? {
                        Some(cp) => cp,
                        None => return Ok(Outcome::Transport(kind)),
                    }
                }
            };

            debug_assert!(step.peer.key.count() > 0, "unset key in routing answer");

            if step.peer.key == cur.key {
                // cur already believes it is the closest predecessor; only a
                // fresher successor view can still make progress
                match step.successor {
                    Some(succ) if succ.key != cur_succ.key => {
                        cur_succ = succ;
                        continue;
                    }
                    _ => {
                        tracing::warn!(
                            "find_route: {} stuck at {}, leaving repair to stabilization",
                            target,
                            cur.key
                        );
                        return Ok(Outcome::Remote(RemoteStatus::Maintenance));
                    }
                }
            }

            hops.push(step.peer.clone());
            cur = step.peer;
            cur_succ = match step.successor {
                Some(succ) => succ,
                None => loop {
                    match via.get_successor(&cur, &caller).await? {
                        Outcome::Ok(succ) => break succ,
                        Outcome::Remote(status) => {
                            tracing::debug!(
                                "find_route: get_successor on {} answered {:?}",
                                cur.key,
                                status
                            );
                            return Ok(Outcome::Remote(status));
                        }
                        Outcome::Transport(kind) => {
                            match self.reroute(via, &mut hops, &mut recoveries).await? {
                                Some(cp) => {
                                    hops.push(cp.peer.clone());
                                    cur = cp.peer;
                                    if let Some(succ) = cp.successor {
                                        break succ;
                                    }
                                }
                                None => return Ok(Outcome::Transport(kind)),
                            }
                        }
                    }
                },
            };
            debug_assert!(cur_succ.key.count() > 0, "unset successor in routing answer");
        }

        Ok(Outcome::Ok(Route {
            pred: cur,
            succ: cur_succ,
        }))
    }

    /// Route around the unreachable node at the end of the trail: walk the
    /// previously visited hops backwards and ask each for the closest
    /// predecessor of the dead key, undershooting the original target on
    /// purpose. On success the trail is truncated to the hop that answered
    /// and its candidate becomes the next step.
    async fn reroute(
        &self,
        via: &dyn PeerRpc,
        hops: &mut Vec<PeerInfo>,
        recoveries: &mut usize,
    ) -> Result<Option<ClosestPredecessor>> {
        if *recoveries >= consts::UNDERSHOOT_RETRY_BUDGET {
            tracing::warn!("reroute budget exhausted on {}", self.key);
            return Ok(None);
        }
        let dead = match hops.last() {
            Some(dead) => dead.clone(),
            None => return Ok(None),
        };
        let caller = self.peer_info();
        for idx in (0..hops.len().saturating_sub(1)).rev() {
            let past = &hops[idx];
            tracing::debug!("rerouting around {} via {}", dead.key, past.key);
            match via.find_closest_predecessor(past, &caller, dead.key).await? {
                Outcome::Ok(cp) => {
                    hops.truncate(idx + 1);
                    *recoveries += 1;
                    return Ok(Some(cp));
                }
                Outcome::Remote(status) => {
                    tracing::debug!("reroute via {} answered {:?}", past.key, status);
                    return Ok(None);
                }
                Outcome::Transport(_) => continue,
            }
        }
        Ok(None)
    }

    /// One stabilization round: notify the successor, adopt its predecessor
    /// when that node bisects the arc to the successor, and rebuild the
    /// successor-list tail from the successor's view. An unreachable
    /// successor is confirmed dead, dropped and replaced by the next list
    /// entry.
    pub async fn stabilize(&self, via: &dyn PeerRpc) -> Result<()> {
        let succ_key = match *self.lock_successor()? {
            Some(succ) => succ,
            None => return Ok(()),
        };
        let succ = self.resolve(succ_key)?;
        match via.notify(&succ, &self.peer_info()).await? {
            Outcome::Ok(digest) => {
                let mut view = digest;
                if let Some(cand) = view.predecessor.clone() {
                    if cand.key != self.key && cand.key.between(self.key, succ.key) {
                        tracing::debug!("stabilize: {} adopts {} as successor", self.key, cand.key);
                        self.set_successor(cand.key, &cand.addr)?;
                        // the tail refresh below should track the adopted
                        // successor's view, not the superseded one
                        if let Outcome::Ok(fresh) = via.notify(&cand, &self.peer_info()).await? {
                            view = fresh;
                        }
                    }
                }
                self.refresh_successors(&view)?;
            }
            Outcome::Remote(status) => {
                tracing::debug!("stabilize: {} answered {:?}", succ.key, status);
            }
            Outcome::Transport(kind) => {
                tracing::warn!("stabilize: successor {} unreachable: {:?}", succ.key, kind);
                if succ.key != self.key && self.is_dead(via, &succ).await? {
                    if let Some(loc) = self.table.find(succ.key)? {
                        self.remove_location(&loc)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn refresh_successors(&self, digest: &TopoDigest) -> Result<()> {
        for peer in &digest.successors {
            if peer.key != self.key {
                self.table.add_or_find(peer.key, &peer.addr)?;
            }
        }
        let keys: Vec<Key> = digest.successors.iter().map(|p| p.key).collect();
        self.successors.refresh(&keys)
    }

    /// Repair one finger slot: advance the cursor, look up the owner of
    /// `self + 2^i` and point the slot at it.
    pub async fn fix_fingers(&self, via: &dyn PeerRpc) -> Result<()> {
        if (*self.lock_successor()?).is_none() {
            return Ok(());
        }
        let index = {
            let mut finger = self.lock_finger()?;
            finger.fix_finger_index =
                ((finger.fix_finger_index as usize + 1) % consts::KEY_BITS) as u8;
            finger.fix_finger_index
        };
        let target = self.key + Key::from(BigUint::from(2u16).pow(index as u32));
        match self.find_successor(via, target).await? {
            Outcome::Ok(peer) => {
                if peer.key != self.key {
                    self.table.add_or_find(peer.key, &peer.addr)?;
                }
                let mut finger = self.lock_finger()?;
                finger.set(index as usize, peer.key);
            }
            Outcome::Remote(status) => {
                tracing::debug!("fix_fingers: slot {} skipped: {:?}", index, status);
            }
            Outcome::Transport(kind) => {
                tracing::debug!("fix_fingers: slot {} skipped: {:?}", index, kind);
            }
        }
        Ok(())
    }

    /// Drop the predecessor when it stops answering pings; the next honest
    /// notify will fill the slot again.
    pub async fn check_predecessor(&self, via: &dyn PeerRpc) -> Result<()> {
        let pred = match *self.lock_predecessor()? {
            Some(pred) => pred,
            None => return Ok(()),
        };
        let info = self.resolve(pred)?;
        if self.is_dead(via, &info).await? {
            tracing::info!("predecessor {} of {} is gone", pred, self.key);
            let mut predecessor = self.lock_predecessor()?;
            if *predecessor == Some(pred) {
                *predecessor = None;
            }
        }
        Ok(())
    }
}

impl TryFrom<&VirtualNode> for TopoDigest {
    type Error = Error;
    fn try_from(vnode: &VirtualNode) -> Result<TopoDigest> {
        let predecessor = match *vnode.lock_predecessor()? {
            None => None,
            Some(key) => Some(vnode.resolve(key)?),
        };
        let mut successors = vec![];
        for key in vnode.successors.list()? {
            successors.push(vnode.resolve(key)?);
        }
        Ok(TopoDigest {
            predecessor,
            successors,
        })
    }
}
