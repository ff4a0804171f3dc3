#![warn(missing_docs)]
//! The ring state machine.
//! A Chord overlay, ref: <https://pdos.csail.mit.edu/papers/ton:chord/paper-ton.pdf>.
//! With high probability a lookup in an N-node ring contacts O(log N) nodes.

pub mod finger;
pub mod key;
pub mod location;
mod stabilization;
pub mod successor;
pub mod vnode;

pub use finger::FingerTable;
pub use key::BiasKey;
pub use key::Key;
pub use location::Location;
pub use location::LocationTable;
pub use location::NetAddress;
pub use stabilization::StabilizeConfig;
pub use stabilization::Stabilizer;
pub use successor::SuccessorList;
pub use successor::SuccessorReader;
pub use successor::SuccessorWriter;
pub use vnode::VirtualNode;
