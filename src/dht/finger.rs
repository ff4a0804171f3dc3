#![warn(missing_docs)]

//! Finger table of the ring.
//!
//! Slot i points at the node responsible for `own_key + 2^i`, so slot 0
//! aliases the direct successor and the highest slots cross half the ring.
//! Lookups scan from the highest slot down for the first entry strictly
//! inside the arc to the target, which shrinks the remaining distance
//! roughly in half per hop.

use std::ops::Index;

use derivative::Derivative;

use crate::dht::Key;

/// Finger table of one virtual node.
#[derive(Derivative, Clone, Debug)]
#[derivative(PartialEq)]
pub struct FingerTable {
    key: Key,
    size: usize,
    finger: Vec<Option<Key>>,
    /// Cursor of the periodic repair cycle, one slot per round.
    #[derivative(PartialEq = "ignore")]
    pub(super) fix_finger_index: u8,
}

impl FingerTable {
    /// builder
    pub fn new(key: Key, size: usize) -> Self {
        Self {
            key,
            size,
            finger: vec![None; size],
            fix_finger_index: 0,
        }
    }

    /// is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// First populated slot, i.e. the closest known clockwise peer.
    pub fn first(&self) -> Option<Key> {
        self.finger.iter().flatten().next().copied()
    }

    /// getter
    pub fn get(&self, index: usize) -> Option<Key> {
        if index >= self.finger.len() {
            return None;
        }
        self.finger[index]
    }

    /// setter
    pub fn set(&mut self, index: usize, key: Key) {
        tracing::debug!("set finger table index: {} key: {}", index, key);
        if index >= self.finger.len() {
            tracing::error!("set finger index out of range, index: {}", index);
            return;
        }
        if key == self.key {
            tracing::info!("set finger table with own key, ignore it");
            return;
        }
        self.finger[index] = Some(key);
    }

    /// Drop a node from every slot it occupies. Vacated slots are back-filled
    /// with the next entry after the removed run, so they keep pointing at
    /// the removed node's table successor until repair recomputes them.
    pub fn remove(&mut self, key: Key) {
        let indexes: Vec<usize> = self
            .finger
            .iter()
            .enumerate()
            .filter(|(_, &x)| x == Some(key))
            .map(|(id, _)| id)
            .collect();

        if let Some(last_idx) = indexes.last() {
            let (first_idx, end_idx) = (*indexes.first().unwrap(), *last_idx + 1);

            let fill = self.finger.get(end_idx).copied().flatten();
            for idx in first_idx..end_idx {
                self.finger[idx] = fill;
            }
        }
    }

    /// Check whether some slot holds `key`.
    pub fn contains(&self, key: Key) -> bool {
        self.finger.contains(&Some(key))
    }

    /// Highest-to-lowest scan for the first entry strictly inside the open
    /// arc (own key, target). Falls back to the own key when nothing
    /// qualifies, including for the empty arc target == own key.
    pub fn closest_predecessor(&self, target: Key) -> Key {
        let target_bias = target.bias(self.key);

        for i in (0..self.size).rev() {
            if let Some(k) = self.finger[i] {
                if k.bias(self.key) < target_bias {
                    return k;
                }
            }
        }

        self.key
    }

    /// get length of finger
    pub fn len(&self) -> usize {
        self.finger.iter().flatten().count()
    }

    /// get finger list
    pub fn list(&self) -> &Vec<Option<Key>> {
        &self.finger
    }
}

impl Index<usize> for FingerTable {
    type Output = Option<Key>;
    fn index(&self, index: usize) -> &Self::Output {
        if index >= self.finger.len() {
            return &None;
        }
        &self.finger[index]
    }
}
