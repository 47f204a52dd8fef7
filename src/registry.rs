//! Address-keyed registry of live allocations.
//!
//! Every allocation handed out by the manager is recorded here under its
//! user address together with what is needed to release it later. The
//! registry owns its records; removing one hands ownership back to the caller,
//! which then disposes of the backend allocation.

use crate::error::RegistryError;
use crate::types::{AllocHandle, BackendKind, BusAddr, UserAddr};
use std::collections::HashMap;

/// Capacity reserved by a freshly initialized registry.
pub const DEFAULT_REGISTRY_CAPACITY: usize = 16;

/// One live allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationRecord {
    /// Backend that produced the allocation.
    pub kind: BackendKind,
    /// Requested length in bytes.
    pub size: usize,
    /// Backend-opaque handle used to release it.
    pub handle: AllocHandle,
    /// Device-visible address.
    pub bus_addr: BusAddr,
    /// Process-visible address (the registry key).
    pub user_addr: UserAddr,
}

/// Registry of live allocations keyed by user address.
///
/// Iteration order is unspecified.
#[derive(Debug, Default)]
pub struct AllocationRegistry {
    records: HashMap<UserAddr, AllocationRecord>,
}

impl AllocationRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty registry with room for `capacity` records.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::OutOfMemory`] if the storage cannot be reserved.
    pub fn with_capacity(capacity: usize) -> Result<Self, RegistryError> {
        let mut records = HashMap::new();
        records
            .try_reserve(capacity)
            .map_err(|_| RegistryError::OutOfMemory)?;
        Ok(Self { records })
    }

    /// Insert a record unless its address is already registered.
    pub fn insert(&mut self, record: AllocationRecord) -> Result<(), RegistryError> {
        if self.records.contains_key(&record.user_addr) {
            return Err(RegistryError::DuplicateKey(record.user_addr));
        }
        self.records
            .try_reserve(1)
            .map_err(|_| RegistryError::OutOfMemory)?;
        self.records.insert(record.user_addr, record);
        Ok(())
    }

    /// Look up the record registered at exactly `addr`.
    pub fn find(&self, addr: UserAddr) -> Result<&AllocationRecord, RegistryError> {
        self.records.get(&addr).ok_or(RegistryError::NotFound(addr))
    }

    /// Remove and return the record registered at `addr`.
    pub fn remove(&mut self, addr: UserAddr) -> Result<AllocationRecord, RegistryError> {
        self.records
            .remove(&addr)
            .ok_or(RegistryError::NotFound(addr))
    }

    /// Remove and return an arbitrary record, or `None` once empty.
    pub fn take_any(&mut self) -> Option<AllocationRecord> {
        let addr = *self.records.keys().next()?;
        self.records.remove(&addr)
    }

    /// Whether a record is registered at `addr`.
    #[inline]
    pub fn contains(&self, addr: UserAddr) -> bool {
        self.records.contains_key(&addr)
    }

    /// Number of live records.
    #[inline]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns true if no records are registered.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Iterate over the live records.
    pub fn iter(&self) -> impl Iterator<Item = &AllocationRecord> {
        self.records.values()
    }

    /// Addresses of all live records.
    pub fn addresses(&self) -> impl Iterator<Item = UserAddr> + '_ {
        self.records.keys().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(addr: usize, kind: BackendKind) -> AllocationRecord {
        AllocationRecord {
            kind,
            size: 4096,
            handle: AllocHandle(addr as u32 >> 12),
            bus_addr: BusAddr(0xC000_0000 | addr as u32),
            user_addr: UserAddr(addr),
        }
    }

    #[test]
    fn test_insert_and_find() {
        let mut registry = AllocationRegistry::new();
        registry
            .insert(record(0x1000, BackendKind::SharedMemory))
            .unwrap();

        let found = registry.find(UserAddr(0x1000)).unwrap();
        assert_eq!(found.kind, BackendKind::SharedMemory);
        assert_eq!(found.bus_addr, BusAddr(0xC000_1000));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_duplicate_key_rejected() {
        let mut registry = AllocationRegistry::new();
        registry.insert(record(0x2000, BackendKind::Mailbox)).unwrap();

        let err = registry
            .insert(record(0x2000, BackendKind::SharedMemory))
            .unwrap_err();
        assert_eq!(err, RegistryError::DuplicateKey(UserAddr(0x2000)));

        // The original record is untouched
        assert_eq!(
            registry.find(UserAddr(0x2000)).unwrap().kind,
            BackendKind::Mailbox
        );
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_find_is_exact() {
        let mut registry = AllocationRegistry::new();
        registry.insert(record(0x3000, BackendKind::Mailbox)).unwrap();

        assert_eq!(
            registry.find(UserAddr(0x3001)).unwrap_err(),
            RegistryError::NotFound(UserAddr(0x3001))
        );
        assert!(registry.find(UserAddr(0x2fff)).is_err());
    }

    #[test]
    fn test_remove() {
        let mut registry = AllocationRegistry::new();
        registry.insert(record(0x4000, BackendKind::Mailbox)).unwrap();

        let removed = registry.remove(UserAddr(0x4000)).unwrap();
        assert_eq!(removed.user_addr, UserAddr(0x4000));
        assert!(registry.is_empty());
        assert_eq!(
            registry.remove(UserAddr(0x4000)).unwrap_err(),
            RegistryError::NotFound(UserAddr(0x4000))
        );
    }

    #[test]
    fn test_take_any_drains() {
        let mut registry = AllocationRegistry::with_capacity(4).unwrap();
        for addr in [0x1000, 0x5000, 0x3000, 0x9000] {
            registry.insert(record(addr, BackendKind::Mailbox)).unwrap();
        }

        let mut drained: Vec<_> = std::iter::from_fn(|| registry.take_any())
            .map(|r| r.user_addr.0)
            .collect();
        drained.sort_unstable();

        assert_eq!(drained, vec![0x1000, 0x3000, 0x5000, 0x9000]);
        assert!(registry.is_empty());
        assert!(registry.take_any().is_none());
    }

    #[test]
    fn test_addresses() {
        let mut registry = AllocationRegistry::new();
        registry.insert(record(0x1000, BackendKind::Mailbox)).unwrap();
        registry
            .insert(record(0x2000, BackendKind::SharedMemory))
            .unwrap();

        let mut addrs: Vec<_> = registry.addresses().collect();
        addrs.sort();
        assert_eq!(addrs, vec![UserAddr(0x1000), UserAddr(0x2000)]);
        assert!(registry.contains(UserAddr(0x2000)));
        assert_eq!(registry.iter().count(), 2);
    }
}
