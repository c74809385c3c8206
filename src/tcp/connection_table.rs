use super::ConnectionId;
use crate::{FxDashMap, TcpError};
use dashmap::mapref::entry::Entry;
use std::{
    ops::RangeInclusive,
    sync::{Arc, Mutex, PoisonError},
};
use tracing::trace;

/// Connections keyed by their endpoint pair. Bound and listening connections
/// are keyed with an unspecified remote endpoint.
///
/// Entries are compared by pointer on removal, so a connection can only remove
/// itself and never a successor that reused its endpoints.
pub struct ConnectionTable<T> {
    connections: FxDashMap<ConnectionId, Arc<T>>,
    ephemeral_ports: RangeInclusive<u16>,
    next_ephemeral: Mutex<u16>,
}

impl<T> ConnectionTable<T> {
    pub fn new(ephemeral_ports: RangeInclusive<u16>) -> Self {
        Self {
            connections: Default::default(),
            next_ephemeral: Mutex::new(*ephemeral_ports.start()),
            ephemeral_ports,
        }
    }

    /// Claims `id` for `connection`. A zero local port is replaced with a free
    /// ephemeral port. Returns the identifier actually claimed.
    pub fn bind(&self, id: ConnectionId, connection: &Arc<T>) -> Result<ConnectionId, TcpError> {
        let id = self.assign_port(id)?;
        self.insert(id, connection.clone())?;
        Ok(id)
    }

    /// Gives up the claim on `id` if `connection` holds it.
    pub fn unbind(&self, id: ConnectionId, connection: &Arc<T>) -> bool {
        self.remove(id, connection)
    }

    /// Moves `connection` from `old` to `new`, assigning an ephemeral port if
    /// `new` has none. The old entry is left alone if the new one is taken.
    pub fn set_connection(
        &self,
        old: ConnectionId,
        new: ConnectionId,
        connection: &Arc<T>,
    ) -> Result<ConnectionId, TcpError> {
        let new = self.assign_port(new)?;
        if new != old {
            self.insert(new, connection.clone())?;
            self.remove(old, connection);
        }
        Ok(new)
    }

    pub fn insert(&self, id: ConnectionId, connection: Arc<T>) -> Result<(), TcpError> {
        match self.connections.entry(id) {
            Entry::Occupied(_) => Err(TcpError::AddressInUse),
            Entry::Vacant(entry) => {
                trace!(local = %id.local, remote = %id.remote, "connection table insert");
                entry.insert(connection);
                Ok(())
            }
        }
    }

    pub fn lookup(&self, id: &ConnectionId) -> Option<Arc<T>> {
        self.connections.get(id).map(|entry| entry.value().clone())
    }

    /// Removes the entry for `id` only if it is `connection`.
    pub fn remove(&self, id: ConnectionId, connection: &Arc<T>) -> bool {
        self.connections
            .remove_if(&id, |_, held| Arc::ptr_eq(held, connection))
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// The connections held right now. No table lock is held once this
    /// returns.
    pub fn snapshot(&self) -> Vec<Arc<T>> {
        self.connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    fn assign_port(&self, id: ConnectionId) -> Result<ConnectionId, TcpError> {
        if id.local.port != 0 {
            return Ok(id);
        }
        let mut next = self
            .next_ephemeral
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let (first, last) = (*self.ephemeral_ports.start(), *self.ephemeral_ports.end());
        let count = usize::from(last - first) + 1;
        for _ in 0..count {
            let port = *next;
            *next = if port >= last { first } else { port + 1 };
            if !self.port_in_use(port) {
                return Ok(ConnectionId {
                    local: id.local.with_port(port),
                    remote: id.remote,
                });
            }
        }
        Err(TcpError::AddressInUse)
    }

    fn port_in_use(&self, port: u16) -> bool {
        self.connections
            .iter()
            .any(|entry| entry.key().local.port == port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Endpoint, Ipv4Address};

    const HOST: Ipv4Address = Ipv4Address::new([10, 0, 0, 1]);
    const PEER: Endpoint = Endpoint::new(Ipv4Address::new([10, 0, 0, 2]), 80);

    fn id(local_port: u16, remote: Endpoint) -> ConnectionId {
        ConnectionId::new(Endpoint::new(HOST, local_port), remote)
    }

    #[test]
    fn exact_tuple_conflicts() {
        let table = ConnectionTable::new(49152..=65535);
        let first = Arc::new(1);
        let second = Arc::new(2);

        table.bind(id(8080, Endpoint::UNSPECIFIED), &first).unwrap();
        assert_eq!(
            table.bind(id(8080, Endpoint::UNSPECIFIED), &second),
            Err(TcpError::AddressInUse)
        );
        // A different peer on the same local port is a different connection
        table.bind(id(8080, PEER), &second).unwrap();
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn removal_checks_identity() {
        let table = ConnectionTable::new(49152..=65535);
        let owner = Arc::new(1);
        let stranger = Arc::new(1);
        let key = id(8080, PEER);

        table.insert(key, owner.clone()).unwrap();
        assert!(!table.remove(key, &stranger));
        assert!(Arc::ptr_eq(&table.lookup(&key).unwrap(), &owner));
        assert!(table.remove(key, &owner));
        assert!(table.lookup(&key).is_none());
    }

    #[test]
    fn ephemeral_ports_skip_ports_in_use() {
        let table = ConnectionTable::new(50000..=50002);
        let a = Arc::new('a');
        let b = Arc::new('b');
        let c = Arc::new('c');

        table.bind(id(50001, Endpoint::UNSPECIFIED), &b).unwrap();
        let first = table.bind(id(0, PEER), &a).unwrap();
        assert_eq!(first.local.port, 50000);
        let second = table.bind(id(0, PEER), &c).unwrap();
        assert_eq!(second.local.port, 50002);
        assert_eq!(
            table.bind(id(0, PEER), &Arc::new('d')),
            Err(TcpError::AddressInUse)
        );

        // The counter wraps around to ports freed since
        table.remove(first, &a);
        assert_eq!(table.bind(id(0, PEER), &a).unwrap().local.port, 50000);
    }

    #[test]
    fn set_connection_moves_entry() {
        let table = ConnectionTable::new(49152..=65535);
        let connection = Arc::new(());
        let bound = table
            .bind(id(8080, Endpoint::UNSPECIFIED), &connection)
            .unwrap();

        let connected = table
            .set_connection(bound, id(8080, PEER), &connection)
            .unwrap();
        assert_eq!(connected, id(8080, PEER));
        assert!(table.lookup(&bound).is_none());
        assert!(table.lookup(&connected).is_some());

        // Refused when the destination is taken, and the old entry stays
        let other = Arc::new(());
        let other_id = table
            .bind(id(9090, Endpoint::UNSPECIFIED), &other)
            .unwrap();
        assert_eq!(
            table.set_connection(other_id, connected, &other),
            Err(TcpError::AddressInUse)
        );
        assert!(table.lookup(&other_id).is_some());
        assert_eq!(table.snapshot().len(), 2);
    }
}
