#![warn(missing_docs)]

//! Successor bookkeeping for a virtual node.
//!
//! A single successor pointer makes the whole ring fall apart on one crash,
//! so every virtual node tracks up to k consecutive clockwise successors.
//! The head is the direct successor and always mirrors the owning node's
//! successor field; the tail is rebuilt from the head's own list during
//! stabilization.

use std::sync::Arc;
use std::sync::RwLock;
use std::sync::RwLockReadGuard;

use crate::dht::key::SortRing;
use crate::dht::Key;
use crate::error::Error;
use crate::error::Result;

/// Ordered list of up to k successors of one virtual node.
#[derive(Debug, Clone)]
pub struct SuccessorList {
    /// Owning node key.
    key: Key,
    /// Max successor num.
    max: u8,
    /// Successors, closest first.
    successors: Arc<RwLock<Vec<Key>>>,
}

/// Read access to a successor list.
pub trait SuccessorReader {
    /// Direct successor, falling back to the owner's key when empty.
    fn head(&self) -> Result<Key>;
    /// Whether the list is empty.
    fn is_empty(&self) -> Result<bool>;
    /// Whether the list reached its capacity.
    fn is_full(&self) -> Result<bool>;
    /// Number of tracked successors.
    fn len(&self) -> Result<usize>;
    /// Snapshot of the entries, closest first.
    fn list(&self) -> Result<Vec<Key>>;
    /// Whether `key` is tracked.
    fn contains(&self, key: &Key) -> Result<bool>;
}

/// Write access to a successor list.
pub trait SuccessorWriter {
    /// Install a new direct successor. Entries that would sit between the
    /// owner and the new head contradict it being the direct successor and
    /// are dropped.
    fn set_head(&self, key: Key) -> Result<()>;
    /// Rebuild the tail from the head's reported successor list, shifted by
    /// one and truncated to capacity.
    fn refresh(&self, from_head: &[Key]) -> Result<()>;
    /// Drop one entry.
    fn remove(&self, key: Key) -> Result<()>;
}

impl SuccessorList {
    /// Build an empty list for the node `key`, tracking at most `max`
    /// successors.
    pub fn new(key: Key, max: u8) -> Self {
        Self {
            key,
            max,
            successors: Arc::new(RwLock::new(vec![])),
        }
    }

    fn successors(&self) -> Result<RwLockReadGuard<Vec<Key>>> {
        self.successors
            .read()
            .map_err(|_| Error::FailedToReadSuccessors)
    }
}

impl SuccessorReader for SuccessorList {
    fn head(&self) -> Result<Key> {
        let succs = self.successors()?;
        Ok(succs.first().copied().unwrap_or(self.key))
    }

    fn is_empty(&self) -> Result<bool> {
        let succs = self.successors()?;
        Ok(succs.is_empty())
    }

    fn is_full(&self) -> Result<bool> {
        let succs = self.successors()?;
        Ok(succs.len() as u8 >= self.max)
    }

    fn len(&self) -> Result<usize> {
        let succs = self.successors()?;
        Ok(succs.len())
    }

    fn list(&self) -> Result<Vec<Key>> {
        let succs = self.successors()?;
        Ok(succs.clone())
    }

    fn contains(&self, key: &Key) -> Result<bool> {
        let succs = self.successors()?;
        Ok(succs.contains(key))
    }
}

impl SuccessorWriter for SuccessorList {
    fn set_head(&self, key: Key) -> Result<()> {
        if key == self.key {
            return Ok(());
        }
        let mut succs = self
            .successors
            .write()
            .map_err(|_| Error::FailedToWriteSuccessors)?;
        succs.retain(|&v| v != key && v.bias(self.key) > key.bias(self.key));
        succs.insert(0, key);
        succs.truncate(self.max.into());
        Ok(())
    }

    fn refresh(&self, from_head: &[Key]) -> Result<()> {
        let head = match self.successors()?.first().copied() {
            Some(head) => head,
            None => return Ok(()),
        };
        let mut next = vec![head];
        for k in from_head {
            if *k == self.key || next.contains(k) {
                continue;
            }
            next.push(*k);
        }
        next.sort(self.key);
        next.truncate(self.max.into());

        let mut succs = self
            .successors
            .write()
            .map_err(|_| Error::FailedToWriteSuccessors)?;
        *succs = next;
        Ok(())
    }

    fn remove(&self, key: Key) -> Result<()> {
        let mut succs = self
            .successors
            .write()
            .map_err(|_| Error::FailedToWriteSuccessors)?;
        succs.retain(|&v| v != key);
        Ok(())
    }
}
