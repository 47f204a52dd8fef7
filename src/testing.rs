//! In-process fake backends for exercising the manager without VideoCore hardware.
//!
//! Both fakes hand out addresses from disjoint synthetic ranges, keep their
//! own live-allocation table, count every call and can be told to fail any
//! step. Their state lives behind an `Rc<RefCell<_>>` so a test can keep a
//! probe after moving the fake into a manager.
//!
//! # Example
//!
//! ```rust
//! use busmem::testing::{FakeMailbox, FakeSharedMemory};
//! use busmem::{CacheMode, MemoryManager};
//!
//! let shared = FakeSharedMemory::new();
//! let probe = shared.state();
//! let mut manager = MemoryManager::init(shared, FakeMailbox::new()).unwrap();
//!
//! let a = manager.alloc_via_shared_strategy(4096, 4096, CacheMode::Host).unwrap();
//! assert_eq!(probe.borrow().live.len(), 1);
//! manager.free(a.user_addr).unwrap();
//! manager.finalize().unwrap();
//! assert_eq!(probe.borrow().exit_calls, 1);
//! ```

use crate::backend::{MailboxBackend, SharedMemoryBackend, close_fd, page_round_up};
use crate::error::{BackendError, BackendResult};
use crate::types::{AllocHandle, BackendAllocation, BusAddr, CacheMode, MailboxFlags, UserAddr};
use rustix::fd::{BorrowedFd, OwnedFd};
use std::cell::RefCell;
use std::collections::{BTreeMap, HashSet};
use std::rc::Rc;

const FAKE_PAGE: usize = 4096;

/// Shared handle to a fake's state.
pub type Probe<T> = Rc<RefCell<T>>;

/// A live allocation inside a fake backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FakeBuffer {
    /// Handle returned at allocation time.
    pub handle: AllocHandle,
    /// Bus address returned at allocation time.
    pub bus_addr: BusAddr,
    /// Requested size.
    pub size: usize,
}

/// Hands out page-aligned synthetic addresses.
#[derive(Debug)]
struct AddressSpace {
    next_user: usize,
    next_bus: u32,
    next_handle: u32,
}

impl AddressSpace {
    fn new(user_base: usize, bus_base: u32) -> Self {
        Self {
            next_user: user_base,
            next_bus: bus_base,
            next_handle: 1,
        }
    }

    fn take(&mut self, size: usize) -> BackendAllocation {
        let len = page_round_up(size.max(1), FAKE_PAGE);
        let allocation = BackendAllocation {
            handle: AllocHandle(self.next_handle),
            bus_addr: BusAddr(self.next_bus),
            user_addr: UserAddr(self.next_user),
        };
        self.next_user += len;
        self.next_bus = self.next_bus.wrapping_add(len as u32);
        self.next_handle += 1;
        allocation
    }
}

/// State of a [`FakeSharedMemory`].
#[derive(Debug)]
pub struct SharedState {
    /// Calls to `subsystem_init`.
    pub init_calls: usize,
    /// Calls to `subsystem_exit`.
    pub exit_calls: usize,
    /// Calls to `allocate`.
    pub alloc_calls: usize,
    /// Calls to `release`.
    pub release_calls: usize,
    /// Live allocations by user address.
    pub live: BTreeMap<UserAddr, FakeBuffer>,
    /// Cache mode of the most recent allocation.
    pub last_cache: Option<CacheMode>,
    /// Fail `subsystem_init`.
    pub fail_init: bool,
    /// Fail `allocate`.
    pub fail_alloc: bool,
    /// Fail `release` for these addresses (the buffer stays live).
    pub fail_release: HashSet<UserAddr>,
    /// Make the next allocation report this user address.
    pub force_next_addr: Option<UserAddr>,
    space: AddressSpace,
}

impl Default for SharedState {
    fn default() -> Self {
        Self {
            init_calls: 0,
            exit_calls: 0,
            alloc_calls: 0,
            release_calls: 0,
            live: BTreeMap::new(),
            last_cache: None,
            fail_init: false,
            fail_alloc: false,
            fail_release: HashSet::new(),
            force_next_addr: None,
            space: AddressSpace::new(0x1000_0000, 0xC100_0000),
        }
    }
}

/// Fake shared-memory backend.
#[derive(Debug, Default)]
pub struct FakeSharedMemory {
    state: Probe<SharedState>,
}

impl FakeSharedMemory {
    /// Create a fake with no failures configured.
    pub fn new() -> Self {
        Self::default()
    }

    /// Probe sharing this fake's state.
    pub fn state(&self) -> Probe<SharedState> {
        Rc::clone(&self.state)
    }
}

impl SharedMemoryBackend for FakeSharedMemory {
    fn subsystem_init(&mut self) -> BackendResult<()> {
        let mut state = self.state.borrow_mut();
        state.init_calls += 1;
        if state.fail_init {
            return Err(BackendError::Injected("subsystem init".into()));
        }
        Ok(())
    }

    fn subsystem_exit(&mut self) {
        self.state.borrow_mut().exit_calls += 1;
    }

    fn allocate(
        &mut self,
        size: usize,
        _align: usize,
        cache: CacheMode,
    ) -> BackendResult<BackendAllocation> {
        let mut state = self.state.borrow_mut();
        state.alloc_calls += 1;
        if state.fail_alloc {
            return Err(BackendError::Injected("shared allocate".into()));
        }

        let mut allocation = state.space.take(size);
        if let Some(addr) = state.force_next_addr.take() {
            allocation.user_addr = addr;
        }
        state.last_cache = Some(cache);
        // A forced address may shadow an existing buffer; keep the older one.
        state
            .live
            .entry(allocation.user_addr)
            .or_insert(FakeBuffer {
                handle: allocation.handle,
                bus_addr: allocation.bus_addr,
                size,
            });
        Ok(allocation)
    }

    fn release(&mut self, handle: AllocHandle, user_addr: UserAddr) -> BackendResult<()> {
        let mut state = self.state.borrow_mut();
        state.release_calls += 1;
        if state.fail_release.contains(&user_addr) {
            return Err(BackendError::Injected(format!("shared release {}", user_addr)));
        }
        let known = state
            .live
            .get(&user_addr)
            .is_some_and(|buffer| buffer.handle == handle);
        if !known {
            return Err(BackendError::UnknownHandle(handle.0));
        }
        state.live.remove(&user_addr);
        Ok(())
    }
}

/// State of a [`FakeMailbox`].
#[derive(Debug)]
pub struct MailboxState {
    /// Calls to `open_control`.
    pub control_opens: usize,
    /// Calls to `close_control`.
    pub control_closes: usize,
    /// Calls to `open_mapping`.
    pub mapping_opens: usize,
    /// Calls to `close_mapping`.
    pub mapping_closes: usize,
    /// Calls to `allocate`.
    pub alloc_calls: usize,
    /// Calls to `release`.
    pub release_calls: usize,
    /// Live allocations by user address.
    pub live: BTreeMap<UserAddr, FakeBuffer>,
    /// Flags of the most recent allocation.
    pub last_flags: Option<MailboxFlags>,
    /// Fail `open_control`.
    pub fail_open_control: bool,
    /// Fail `open_mapping`.
    pub fail_open_mapping: bool,
    /// Fail `allocate`.
    pub fail_alloc: bool,
    /// Fail `close_control` (the descriptor is still released).
    pub fail_close_control: bool,
    /// Fail `close_mapping` (the descriptor is still released).
    pub fail_close_mapping: bool,
    /// Fail `release` for these addresses (the buffer stays live).
    pub fail_release: HashSet<UserAddr>,
    /// Make the next allocation report this user address.
    pub force_next_addr: Option<UserAddr>,
    space: AddressSpace,
}

impl Default for MailboxState {
    fn default() -> Self {
        Self {
            control_opens: 0,
            control_closes: 0,
            mapping_opens: 0,
            mapping_closes: 0,
            alloc_calls: 0,
            release_calls: 0,
            live: BTreeMap::new(),
            last_flags: None,
            fail_open_control: false,
            fail_open_mapping: false,
            fail_alloc: false,
            fail_close_control: false,
            fail_close_mapping: false,
            fail_release: HashSet::new(),
            force_next_addr: None,
            space: AddressSpace::new(0x2000_0000, 0xC200_0000),
        }
    }
}

/// Fake mailbox backend.
///
/// Control and mapping resources are real memfd descriptors so that the
/// manager's fd handling is exercised end to end.
#[derive(Debug, Default)]
pub struct FakeMailbox {
    state: Probe<MailboxState>,
}

impl FakeMailbox {
    /// Create a fake with no failures configured.
    pub fn new() -> Self {
        Self::default()
    }

    /// Probe sharing this fake's state.
    pub fn state(&self) -> Probe<MailboxState> {
        Rc::clone(&self.state)
    }
}

fn fake_fd(name: &str) -> BackendResult<OwnedFd> {
    Ok(rustix::fs::memfd_create(name, rustix::fs::MemfdFlags::CLOEXEC)?)
}

impl MailboxBackend for FakeMailbox {
    fn open_control(&mut self) -> BackendResult<OwnedFd> {
        let mut state = self.state.borrow_mut();
        state.control_opens += 1;
        if state.fail_open_control {
            return Err(BackendError::Injected("open control".into()));
        }
        fake_fd("fake-vcio")
    }

    fn close_control(&mut self, fd: OwnedFd) -> BackendResult<()> {
        let mut state = self.state.borrow_mut();
        state.control_closes += 1;
        if state.fail_close_control {
            drop(fd);
            return Err(BackendError::Injected("close control".into()));
        }
        close_fd(fd)
    }

    fn open_mapping(&mut self) -> BackendResult<OwnedFd> {
        let mut state = self.state.borrow_mut();
        state.mapping_opens += 1;
        if state.fail_open_mapping {
            return Err(BackendError::Injected("open mapping".into()));
        }
        fake_fd("fake-mem")
    }

    fn close_mapping(&mut self, fd: OwnedFd) -> BackendResult<()> {
        let mut state = self.state.borrow_mut();
        state.mapping_closes += 1;
        if state.fail_close_mapping {
            drop(fd);
            return Err(BackendError::Injected("close mapping".into()));
        }
        close_fd(fd)
    }

    fn allocate(
        &mut self,
        _control: BorrowedFd<'_>,
        _mapping: BorrowedFd<'_>,
        size: usize,
        _align: usize,
        flags: MailboxFlags,
    ) -> BackendResult<BackendAllocation> {
        let mut state = self.state.borrow_mut();
        state.alloc_calls += 1;
        if state.fail_alloc {
            return Err(BackendError::Injected("mailbox allocate".into()));
        }

        let mut allocation = state.space.take(size);
        if let Some(addr) = state.force_next_addr.take() {
            allocation.user_addr = addr;
        }
        state.last_flags = Some(flags);
        state
            .live
            .entry(allocation.user_addr)
            .or_insert(FakeBuffer {
                handle: allocation.handle,
                bus_addr: allocation.bus_addr,
                size,
            });
        Ok(allocation)
    }

    fn release(
        &mut self,
        _control: BorrowedFd<'_>,
        size: usize,
        handle: AllocHandle,
        bus_addr: BusAddr,
        user_addr: UserAddr,
    ) -> BackendResult<()> {
        let mut state = self.state.borrow_mut();
        state.release_calls += 1;
        if state.fail_release.contains(&user_addr) {
            return Err(BackendError::Injected(format!("mailbox release {}", user_addr)));
        }
        let expected = FakeBuffer {
            handle,
            bus_addr,
            size,
        };
        if state.live.get(&user_addr) != Some(&expected) {
            return Err(BackendError::UnknownHandle(handle.0));
        }
        state.live.remove(&user_addr);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustix::fd::AsFd;

    #[test]
    fn test_address_space_is_page_aligned() {
        let mut space = AddressSpace::new(0x1000_0000, 0xC000_0000);
        let a = space.take(100);
        let b = space.take(8192);
        let c = space.take(1);
        assert_eq!(a.user_addr, UserAddr(0x1000_0000));
        assert_eq!(b.user_addr, UserAddr(0x1000_1000));
        assert_eq!(c.user_addr, UserAddr(0x1000_3000));
        assert_ne!(a.handle, b.handle);
    }

    #[test]
    fn test_fake_mailbox_release_checks_record() {
        let mut mailbox = FakeMailbox::new();
        let control = mailbox.open_control().unwrap();
        let mapping = mailbox.open_mapping().unwrap();

        let a = mailbox
            .allocate(control.as_fd(), mapping.as_fd(), 4096, 4096, MailboxFlags::DIRECT)
            .unwrap();

        // Wrong size is rejected
        assert!(
            mailbox
                .release(control.as_fd(), 8192, a.handle, a.bus_addr, a.user_addr)
                .is_err()
        );
        mailbox
            .release(control.as_fd(), 4096, a.handle, a.bus_addr, a.user_addr)
            .unwrap();
        assert!(mailbox.state().borrow().live.is_empty());
    }

    #[test]
    fn test_fake_shared_injected_failures() {
        let mut shared = FakeSharedMemory::new();
        let probe = shared.state();

        probe.borrow_mut().fail_init = true;
        assert!(shared.subsystem_init().is_err());

        let a = shared.allocate(4096, 4096, CacheMode::None).unwrap();
        probe.borrow_mut().fail_release.insert(a.user_addr);
        assert!(shared.release(a.handle, a.user_addr).is_err());
        assert_eq!(probe.borrow().live.len(), 1);
    }
}
