//! ringway: a Chord-style DHT routing substrate.
//!
//! Each participating process ([Node](crate::node::Node)) hosts one or more
//! [virtual nodes](crate::dht::VirtualNode) on a circular 160-bit identifier
//! space, cooperating to resolve any key to the node currently responsible
//! for it.
//!
//! - [dht](crate::dht) holds the per-virtual-node ring state (successor,
//!   predecessor, [successor list](crate::dht::SuccessorList),
//!   [finger table](crate::dht::FingerTable),
//!   [location cache](crate::dht::LocationTable)), the iterative lookup with
//!   fault-tolerant rerouting, and the [Stabilizer](crate::dht::Stabilizer)
//!   that repairs the ring under churn.
//! - [rpc](crate::rpc) is the typed five-call surface between peers, with a
//!   two-tier result model separating transport failures from the callee's
//!   domain verdict, and a TCP transport speaking length-prefixed bincode
//!   frames.
//! - [node](crate::node) dispatches calls: recipients hosted in-process are
//!   answered locally, everyone else goes through the transport. Lookups
//!   never learn which case they hit.
//!
//! # Joining
//! A fresh virtual node either creates a ring or joins through any known
//! peer, which answers with the joiner's successor. Everything else
//! (predecessor pointers, successor-list tails, finger slots) converges in
//! the background:
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use ringway::dht::{NetAddress, Stabilizer};
//! use ringway::node::Node;
//! use ringway::rpc::tcp::TcpRpc;
//!
//! # async fn join_example(bootstrap: ringway::rpc::PeerInfo) -> ringway::Result<()> {
//! let node = Arc::new(Node::new(
//!     NetAddress::new("198.51.100.7", 4444),
//!     Arc::new(TcpRpc::new()),
//! ));
//! let vnode = node.spawn_vnode()?;
//! vnode.join(node.as_ref(), &bootstrap).await?;
//! tokio::spawn(Arc::new(Stabilizer::new(node.clone())).wait());
//! # Ok(())
//! # }
//! ```

pub mod consts;
pub mod dht;
pub mod error;
pub mod node;
pub mod rpc;

#[cfg(test)]
mod tests;

pub use async_trait::async_trait;

pub use crate::error::Error;
pub use crate::error::Result;
