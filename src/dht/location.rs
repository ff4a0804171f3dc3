#![warn(missing_docs)]

//! Peer address cache.
//!
//! A [Location] is the binding between a ring id and the transport endpoint
//! it was last seen at. Identity is the key; the address is rewritten in
//! place when a peer moves, so every holder of the handle observes the
//! update. The [LocationTable] owns all bindings of one virtual node; finger
//! slots, the successor list and the predecessor slot store plain keys and
//! resolve them through the table.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::RwLock;

use serde::Deserialize;
use serde::Serialize;

use crate::dht::Key;
use crate::error::Error;
use crate::error::Result;

/// Transport endpoint of a peer process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NetAddress {
    host: String,
    port: u16,
}

impl NetAddress {
    /// Build an endpoint from host and port.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Host part of the endpoint.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port part of the endpoint.
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for NetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for NetAddress {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| Error::BadAddress(s.to_string()))?;
        if host.is_empty() {
            return Err(Error::BadAddress(s.to_string()));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| Error::BadAddress(s.to_string()))?;
        Ok(Self::new(host, port))
    }
}

/// A cached (key, address) binding with stable identity.
#[derive(Debug)]
pub struct Location {
    key: Key,
    addr: RwLock<NetAddress>,
}

impl Location {
    fn new(key: Key, addr: NetAddress) -> Self {
        Self {
            key,
            addr: RwLock::new(addr),
        }
    }

    /// Ring id of the peer.
    pub fn key(&self) -> Key {
        self.key
    }

    /// Endpoint the peer was last seen at.
    pub fn addr(&self) -> Result<NetAddress> {
        Ok(self
            .addr
            .read()
            .map_err(|_| Error::LocationAddrLock)?
            .clone())
    }

    /// Rewrite the endpoint in place. A peer keeps its id across moves, and
    /// across port changes of the process hosting it.
    pub fn update(&self, addr: &NetAddress) -> Result<()> {
        let mut cur = self.addr.write().map_err(|_| Error::LocationAddrLock)?;
        if *cur != *addr {
            tracing::debug!("location {} moved {} -> {}", self.key, cur, addr);
            *cur = addr.clone();
        }
        Ok(())
    }
}

/// Address cache owned by one virtual node, keyed by ring id.
#[derive(Debug, Default)]
pub struct LocationTable {
    locs: Mutex<HashMap<Key, Arc<Location>>>,
}

impl LocationTable {
    /// Build an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<HashMap<Key, Arc<Location>>>> {
        self.locs.lock().map_err(|_| Error::LocationTableLock)
    }

    /// Look a binding up. Never creates.
    pub fn find(&self, key: Key) -> Result<Option<Arc<Location>>> {
        Ok(self.lock()?.get(&key).cloned())
    }

    /// Register a fresh binding. Fails when the key is already present.
    pub fn add(&self, key: Key, addr: &NetAddress) -> Result<Arc<Location>> {
        let mut locs = self.lock()?;
        if locs.contains_key(&key) {
            return Err(Error::DuplicateLocation(key));
        }
        let loc = Arc::new(Location::new(key, addr.clone()));
        locs.insert(key, loc.clone());
        Ok(loc)
    }

    /// Return the existing binding, refreshing its address when it differs,
    /// or register a fresh one.
    pub fn add_or_find(&self, key: Key, addr: &NetAddress) -> Result<Arc<Location>> {
        let mut locs = self.lock()?;
        match locs.get(&key) {
            Some(loc) => {
                loc.update(addr)?;
                Ok(loc.clone())
            }
            None => {
                let loc = Arc::new(Location::new(key, addr.clone()));
                locs.insert(key, loc.clone());
                Ok(loc)
            }
        }
    }

    /// Drop a binding. Removing a handle not in the table is a no-op.
    pub fn remove(&self, loc: &Arc<Location>) -> Result<()> {
        self.lock()?.remove(&loc.key());
        Ok(())
    }

    /// Number of cached bindings.
    pub fn len(&self) -> Result<usize> {
        Ok(self.lock()?.len())
    }

    /// Whether the table holds no bindings.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.lock()?.is_empty())
    }

    /// Export the bindings, e.g. to warm the cache of a restarted process.
    /// Loaded entries are hints only; liveness is re-confirmed by ring
    /// maintenance.
    pub fn snapshot(&self) -> Result<Vec<(Key, NetAddress)>> {
        let locs = self.lock()?;
        let mut out = Vec::with_capacity(locs.len());
        for loc in locs.values() {
            out.push((loc.key(), loc.addr()?));
        }
        Ok(out)
    }

    /// Import bindings produced by [LocationTable::snapshot].
    pub fn hydrate<I>(&self, entries: I) -> Result<()>
    where I: IntoIterator<Item = (Key, NetAddress)> {
        for (key, addr) in entries {
            self.add_or_find(key, &addr)?;
        }
        Ok(())
    }
}
