//! Registry of live connections.
//!
//! An entry exists exactly while a protocol handler's session loop is running
//! for that connection. Entries are keyed by remote address; each stores the
//! connection id so cleanup from an older session can never remove an entry
//! created by a newer one.

use crate::connection::Connection;
use crate::error::ServerError;
use crate::stream::CloseHandle;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug)]
struct RegistryEntry {
    id: u64,
    handle: CloseHandle,
}

/// Concurrent map from remote address to live connection.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: DashMap<SocketAddr, RegistryEntry>,
    sealed: AtomicBool,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a connection whose session is about to start.
    ///
    /// Fails with [`ServerError::DuplicateConnection`] if the address already
    /// has a live entry (the earlier session is left alone), or with
    /// [`ServerError::ShuttingDown`] once the registry is sealed.
    pub fn insert(self: &Arc<Self>, conn: &Connection) -> Result<Registration, ServerError> {
        let addr = conn.remote_addr();
        match self.connections.entry(addr) {
            Entry::Occupied(_) => return Err(ServerError::DuplicateConnection(addr)),
            Entry::Vacant(slot) => {
                slot.insert(RegistryEntry {
                    id: conn.id(),
                    handle: conn.close_handle(),
                });
            }
        }

        // Checked after inserting: a concurrent seal + close_all either sees
        // this entry or we see the seal and back out.
        if self.sealed.load(Ordering::SeqCst) {
            self.remove(addr, conn.id());
            return Err(ServerError::ShuttingDown);
        }

        Ok(Registration {
            registry: Arc::clone(self),
            addr,
            id: conn.id(),
        })
    }

    /// Removes the entry for `addr` if it still belongs to connection `id`.
    ///
    /// Returns whether an entry was removed.
    pub fn remove(&self, addr: SocketAddr, id: u64) -> bool {
        self.connections
            .remove_if(&addr, |_, entry| entry.id == id)
            .is_some()
    }

    /// Force-closes every registered connection.
    ///
    /// Safe to call while other tasks insert and remove. Every entry present
    /// while its shard is visited is closed; entries added behind the sweep
    /// may be missed. Entries are not removed here: each session removes its
    /// own entry when its loop unwinds.
    ///
    /// Returns the number of connections this call closed.
    pub fn close_all(&self) -> usize {
        let mut closed = 0;
        for entry in self.connections.iter() {
            if entry.handle.close() {
                tracing::debug!("[{}] Force-closed connection {}", entry.key(), entry.id);
                closed += 1;
            }
        }
        closed
    }

    /// Rejects all future inserts.
    pub fn seal(&self) {
        self.sealed.store(true, Ordering::SeqCst);
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::SeqCst)
    }

    pub fn contains(&self, addr: &SocketAddr) -> bool {
        self.connections.contains_key(addr)
    }

    /// Returns the id of the connection registered under `addr`.
    pub fn connection_id(&self, addr: &SocketAddr) -> Option<u64> {
        self.connections.get(addr).map(|entry| entry.id)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

/// Proof of registration. Dropping it removes the entry, exactly once.
#[derive(Debug)]
#[must_use = "dropping a Registration unregisters the connection"]
pub struct Registration {
    registry: Arc<ConnectionRegistry>,
    addr: SocketAddr,
    id: u64,
}

impl Registration {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if !self.registry.remove(self.addr, self.id) {
            tracing::warn!(
                "[{}] Registry entry for connection {} was already gone",
                self.addr,
                self.id
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn conn(id: u64, addr: &str) -> (Connection, tokio::io::DuplexStream) {
        let (client, server) = tokio::io::duplex(64);
        (
            Connection::new(id, addr.parse().unwrap(), Box::new(server)),
            client,
        )
    }

    #[test]
    fn test_insert_and_drop_registration() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (c, _peer) = conn(1, "10.0.0.1:4000");

        let reg = registry.insert(&c).unwrap();
        assert!(registry.contains(&c.remote_addr()));
        assert_eq!(registry.len(), 1);
        assert_eq!(reg.id(), 1);

        drop(reg);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_duplicate_key_rejected_without_corrupting_first() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (first, _p1) = conn(1, "10.0.0.1:4000");
        let (second, _p2) = conn(2, "10.0.0.1:4000");

        let reg = registry.insert(&first).unwrap();
        let err = registry.insert(&second).unwrap_err();
        assert!(matches!(err, ServerError::DuplicateConnection(_)));
        assert_eq!(registry.connection_id(&first.remote_addr()), Some(1));

        drop(reg);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_stale_removal_keeps_newer_entry() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (old, _p1) = conn(1, "10.0.0.1:4000");
        let (new, _p2) = conn(2, "10.0.0.1:4000");

        drop(registry.insert(&old).unwrap());
        let _reg = registry.insert(&new).unwrap();

        assert!(!registry.remove(old.remote_addr(), old.id()));
        assert_eq!(registry.connection_id(&new.remote_addr()), Some(2));
    }

    #[test]
    fn test_sealed_registry_rejects_inserts() {
        let registry = Arc::new(ConnectionRegistry::new());
        registry.seal();
        assert!(registry.is_sealed());

        let (c, _peer) = conn(1, "10.0.0.1:4000");
        assert!(matches!(
            registry.insert(&c),
            Err(ServerError::ShuttingDown)
        ));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_close_all_closes_every_entry() {
        let registry = Arc::new(ConnectionRegistry::new());
        let mut conns = Vec::new();
        let mut regs = Vec::new();
        for i in 0..5u64 {
            let (c, peer) = conn(i, &format!("10.0.0.{}:4000", i + 1));
            regs.push(registry.insert(&c).unwrap());
            conns.push((c, peer));
        }

        assert_eq!(registry.close_all(), 5);
        // Entries stay until their sessions unwind.
        assert_eq!(registry.len(), 5);
        // A second sweep finds nothing new to close.
        assert_eq!(registry.close_all(), 0);

        for (c, _) in conns.iter_mut() {
            let mut buf = [0u8; 1];
            let err = c.read(&mut buf).await.unwrap_err();
            assert_eq!(err.kind(), std::io::ErrorKind::ConnectionAborted);
        }

        regs.clear();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_concurrent_insert_remove_with_sweep() {
        let registry = Arc::new(ConnectionRegistry::new());
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(4)
            .build()
            .unwrap();

        rt.block_on(async {
            let mut tasks = Vec::new();
            for t in 0..8u64 {
                let registry = registry.clone();
                tasks.push(tokio::spawn(async move {
                    for i in 0..200u64 {
                        let id = t * 1000 + i;
                        let (c, _peer) = conn(id, &format!("10.1.{}.{}:4000", t, i % 250));
                        if let Ok(reg) = registry.insert(&c) {
                            tokio::task::yield_now().await;
                            drop(reg);
                        }
                    }
                }));
            }
            for _ in 0..50 {
                registry.close_all();
                tokio::task::yield_now().await;
            }
            for task in tasks {
                task.await.unwrap();
            }
        });

        assert!(registry.is_empty());
    }
}
