//! Error of ringway

use crate::dht::Key;

/// A wrap `Result` contains custom errors.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors collections in ringway.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("Failed to read successor list")]
    FailedToReadSuccessors,

    #[error("Failed to write successor list")]
    FailedToWriteSuccessors,

    #[error("Finger table lock failed")]
    FingerTableLock,

    #[error("Predecessor lock failed")]
    PredecessorLock,

    #[error("Successor lock failed")]
    SuccessorLock,

    #[error("Location table lock failed")]
    LocationTableLock,

    #[error("Location address lock failed")]
    LocationAddrLock,

    #[error("Virtual node table lock failed")]
    VirtualNodeTableLock,

    #[error("Location for {0} already registered")]
    DuplicateLocation(Key),

    #[error("Virtual node {0} already hosted by this process")]
    DuplicateVirtualNode(Key),

    #[error("No location registered for {0}")]
    LocationMissing(Key),

    #[error("Virtual node {0} has no successor yet")]
    MissingSuccessor(Key),

    #[error("No virtual node is ready to route lookups")]
    NoActiveVirtualNode,

    #[error("Invalid network address: {0}")]
    BadAddress(String),

    #[error("Invalid hexadecimal key: {0}")]
    BadHexKey(String),

    #[error("Rpc frame of {0} bytes exceeds limit")]
    OversizedFrame(usize),

    #[error("Bincode serialization error")]
    BincodeSerialize(#[source] bincode::Error),

    #[error("Bincode deserialization error")]
    BincodeDeserialize(#[source] bincode::Error),

    #[error("IOError")]
    ServiceIOError(#[from] std::io::Error),
}
