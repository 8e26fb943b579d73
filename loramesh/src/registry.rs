//! Child-node and multicast-group registries.
//!
//! Both are fixed-capacity `Pool`s keyed by device or group address. Records
//! own copies of their session keys, so removing a child never touches the
//! parent's own keys.

use crate::collections::{Key, Pool};
use crate::scheduler::HandlerKey;
use crate::time::Duration;
use crate::types::{DevAddr, DeviceClass, Error, Result, SessionKeys};

/// Records addressable by a 32-bit device or group address.
pub trait Addressed {
    fn address(&self) -> DevAddr;
}

/// A node that joined the mesh below us.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChildNode {
    pub dev_addr: DevAddr,
    pub keys: SessionKeys,
    /// Next uplink counter expected from the child.
    pub uplink_counter: u32,
    /// Next downlink counter to send to the child.
    pub downlink_counter: u32,
    pub channel: usize,
    pub datarate: u8,
    pub tx_power: u8,
    pub class: DeviceClass,
    pub periodicity: Duration,
    pub slot_duration: Duration,
    /// Synchronized receive reservation for this child, if any.
    pub sync_handler: Option<HandlerKey>,
    /// Requester address and nonce of the join-mesh request that created it.
    pub join_request: Option<(DevAddr, u16)>,
}

impl ChildNode {
    pub fn new(dev_addr: DevAddr, keys: SessionKeys) -> Self {
        Self {
            dev_addr,
            keys,
            uplink_counter: 0,
            downlink_counter: 0,
            channel: 0,
            datarate: 0,
            tx_power: 0,
            class: DeviceClass::A,
            periodicity: Duration::ZERO,
            slot_duration: Duration::ZERO,
            sync_handler: None,
            join_request: None,
        }
    }
}

impl Addressed for ChildNode {
    fn address(&self) -> DevAddr {
        self.dev_addr
    }
}

/// A multicast group this node sends to or listens on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MulticastGroup {
    pub address: DevAddr,
    pub keys: SessionKeys,
    /// Downlink counter: next to send, or next expected when listening.
    pub downlink_counter: u32,
    pub channel: usize,
    pub datarate: u8,
    pub periodicity: Duration,
    pub handler: Option<HandlerKey>,
}

impl MulticastGroup {
    pub fn new(address: DevAddr, keys: SessionKeys) -> Self {
        Self {
            address,
            keys,
            downlink_counter: 0,
            channel: 0,
            datarate: 0,
            periodicity: Duration::ZERO,
            handler: None,
        }
    }
}

impl Addressed for MulticastGroup {
    fn address(&self) -> DevAddr {
        self.address
    }
}

/// Address-unique registry over a fixed pool.
pub struct Registry<T> {
    pool: Pool<T>,
}

pub type ChildRegistry = Registry<ChildNode>;
pub type MulticastRegistry = Registry<MulticastGroup>;

impl<T: Addressed> Registry<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            pool: Pool::with_capacity(capacity),
        }
    }

    /// Register a record. Fails on a duplicate address or a full pool.
    pub fn add(&mut self, record: T) -> Result<Key<T>> {
        if self.contains(record.address()) {
            return Err(Error::Failed);
        }
        self.pool.insert(record).map_err(|_| Error::NotAvail)
    }

    /// Remove the record with this address.
    pub fn remove(&mut self, addr: DevAddr) -> Result<T> {
        let (key, _) = self
            .pool
            .find(|r| r.address() == addr)
            .ok_or(Error::Failed)?;
        self.pool.remove(key).ok_or(Error::Failed)
    }

    pub fn find(&self, addr: DevAddr) -> Option<&T> {
        self.pool.find(|r| r.address() == addr).map(|(_, r)| r)
    }

    pub fn find_mut(&mut self, addr: DevAddr) -> Option<&mut T> {
        self.pool
            .iter_mut()
            .find(|(_, r)| r.address() == addr)
            .map(|(_, r)| r)
    }

    pub fn contains(&self, addr: DevAddr) -> bool {
        self.find(addr).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.pool.iter().map(|(_, r)| r)
    }

    pub fn len(&self) -> usize {
        self.pool.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pool.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.pool.capacity()
    }

    pub fn available(&self) -> usize {
        self.pool.available()
    }
}

#[cfg(test)]
mod tests {
    use alloc::vec::Vec;

    use super::*;

    fn keys() -> SessionKeys {
        SessionKeys::new([1; 16], [2; 16])
    }

    #[test]
    fn test_add_find_remove_is_idempotent() {
        let mut reg = ChildRegistry::with_capacity(4);
        reg.add(ChildNode::new(0x0100_0001, keys())).unwrap();
        let before: Vec<DevAddr> = reg.iter().map(|c| c.dev_addr).collect();

        reg.add(ChildNode::new(0x0100_0002, keys())).unwrap();
        assert!(reg.find(0x0100_0002).is_some());
        let removed = reg.remove(0x0100_0002).unwrap();
        assert_eq!(removed.dev_addr, 0x0100_0002);

        let after: Vec<DevAddr> = reg.iter().map(|c| c.dev_addr).collect();
        assert_eq!(before, after);
        assert_eq!(reg.len(), 1);
        assert!(reg.find(0x0100_0002).is_none());
    }

    #[test]
    fn test_duplicate_rejected() {
        let mut reg = ChildRegistry::with_capacity(4);
        reg.add(ChildNode::new(7, keys())).unwrap();
        assert_eq!(reg.add(ChildNode::new(7, keys())), Err(Error::Failed));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_full_registry() {
        let mut reg = MulticastRegistry::with_capacity(1);
        reg.add(MulticastGroup::new(0xff00_0001, keys())).unwrap();
        assert_eq!(
            reg.add(MulticastGroup::new(0xff00_0002, keys())),
            Err(Error::NotAvail)
        );
    }

    #[test]
    fn test_remove_unknown_fails() {
        let mut reg = ChildRegistry::with_capacity(2);
        assert_eq!(reg.remove(9), Err(Error::Failed));
    }

    #[test]
    fn test_find_mut_updates_counter() {
        let mut reg = ChildRegistry::with_capacity(2);
        reg.add(ChildNode::new(5, keys())).unwrap();
        reg.find_mut(5).unwrap().uplink_counter = 42;
        assert_eq!(reg.find(5).map(|c| c.uplink_counter), Some(42));
    }
}
