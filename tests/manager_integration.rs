//! Integration tests for the allocation manager.
//!
//! These drive `MemoryManager` through the fake backends and check that the
//! registry, the backends' own live sets and the lazily opened resources stay
//! consistent across allocation, free and failure paths.

use busmem::testing::{FakeMailbox, FakeSharedMemory};
use busmem::{BackendKind, CacheMode, Error, MailboxFlags, MemoryManager, Resource, UserAddr};
use std::collections::BTreeSet;

type FakeManager = MemoryManager<FakeSharedMemory, FakeMailbox>;

fn manager() -> FakeManager {
    MemoryManager::init(FakeSharedMemory::new(), FakeMailbox::new()).unwrap()
}

fn registered(manager: &FakeManager) -> BTreeSet<UserAddr> {
    manager.addresses().collect()
}

// ============================================================================
// Registry / Backend Correspondence
// ============================================================================

/// Test that the registry tracks exactly the successful, unfreed allocations.
#[test]
fn test_registry_matches_outstanding_allocations() {
    let mut manager = manager();
    let shared = manager.shared_backend().state();
    let mailbox = manager.mailbox_backend().state();

    let mut expected = BTreeSet::new();
    let mut seed: u32 = 0x1234_5678;
    let mut next = || {
        seed = seed.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
        seed >> 8
    };

    for _ in 0..500 {
        let roll = next();
        let size = 1 + (next() as usize % (64 * 1024));
        match roll % 3 {
            0 => {
                let a = manager
                    .alloc_via_shared_strategy(size, 4096, CacheMode::None)
                    .unwrap();
                assert!(expected.insert(a.user_addr));
            }
            1 => {
                let a = manager
                    .alloc_via_mailbox_strategy(size, 4096, MailboxFlags::DIRECT)
                    .unwrap();
                assert!(expected.insert(a.user_addr));
            }
            _ => {
                if let Some(&addr) = expected.iter().nth(next() as usize % expected.len().max(1)) {
                    manager.free(addr).unwrap();
                    expected.remove(&addr);
                }
            }
        }

        assert_eq!(registered(&manager), expected);
    }

    // The backends agree with the registry
    let backend_live: BTreeSet<_> = shared
        .borrow()
        .live
        .keys()
        .chain(mailbox.borrow().live.keys())
        .copied()
        .collect();
    assert_eq!(backend_live, expected);
}

/// Test that alloc followed by free restores the previous registry content.
#[test]
fn test_alloc_free_round_trip() {
    let mut manager = manager();
    manager
        .alloc_via_shared_strategy(4096, 4096, CacheMode::Both)
        .unwrap();
    let before = registered(&manager);
    let stats_before = manager.stats();

    let m = manager
        .alloc_via_mailbox_strategy(12_288, 4096, MailboxFlags::COHERENT | MailboxFlags::ZERO)
        .unwrap();
    assert_eq!(manager.find(m.user_addr).unwrap().kind, BackendKind::Mailbox);
    manager.free(m.user_addr).unwrap();

    assert_eq!(registered(&manager), before);
    assert_eq!(manager.stats(), stats_before);
}

/// Test the documented cached shared-memory example.
#[test]
fn test_shared_alloc_free_then_double_free() {
    let mut manager = manager();

    let a = manager
        .alloc_via_shared_strategy(4096, 4096, CacheMode::Host)
        .unwrap();
    assert_ne!(a.user_addr.0, 0);

    manager.free(a.user_addr).unwrap();
    assert!(matches!(manager.free(a.user_addr), Err(Error::NotFound(addr)) if addr == a.user_addr));
}

/// Test that freeing an unknown address leaves the registry untouched.
#[test]
fn test_free_unknown_address() {
    let mut manager = manager();
    let a = manager
        .alloc_via_mailbox_strategy(4096, 4096, MailboxFlags::DIRECT)
        .unwrap();
    let before = registered(&manager);

    // Off by one byte from a live address
    let bogus = UserAddr(a.user_addr.0 + 1);
    assert!(matches!(manager.free(bogus), Err(Error::NotFound(addr)) if addr == bogus));
    assert_eq!(registered(&manager), before);

    // The manager keeps working
    manager.free(a.user_addr).unwrap();
    manager.finalize().unwrap();
}

// ============================================================================
// Lazy Resources
// ============================================================================

/// Test that mailbox resources are opened once across many allocations.
#[test]
fn test_mailbox_resources_opened_once() {
    let mut manager = manager();
    let probe = manager.mailbox_backend().state();

    assert_eq!(probe.borrow().control_opens, 0);
    manager
        .alloc_via_mailbox_strategy(4096, 4096, MailboxFlags::DIRECT)
        .unwrap();
    manager
        .alloc_via_mailbox_strategy(4096, 4096, MailboxFlags::DIRECT)
        .unwrap();

    assert_eq!(probe.borrow().control_opens, 1);
    assert_eq!(probe.borrow().mapping_opens, 1);
    assert!(manager.is_control_open());
    assert!(manager.is_mapping_open());
    assert_eq!(probe.borrow().last_flags, Some(MailboxFlags::DIRECT));
}

/// Test that the shared strategy never touches mailbox resources.
#[test]
fn test_shared_strategy_leaves_mailbox_closed() {
    let mut manager = manager();
    let probe = manager.mailbox_backend().state();

    manager
        .alloc_via_shared_strategy(4096, 4096, CacheMode::VideoCore)
        .unwrap();
    assert!(!manager.is_control_open());
    assert!(!manager.is_mapping_open());
    assert_eq!(probe.borrow().control_opens, 0);
}

/// Test that a failed first mailbox allocation closes what it opened.
#[test]
fn test_mailbox_alloc_failure_rolls_back_resources() {
    let mut manager = manager();
    let probe = manager.mailbox_backend().state();
    probe.borrow_mut().fail_alloc = true;

    let err = manager
        .alloc_via_mailbox_strategy(4096, 4096, MailboxFlags::DIRECT)
        .unwrap_err();
    assert!(matches!(
        err,
        Error::BackendAllocFailed {
            kind: BackendKind::Mailbox,
            ..
        }
    ));

    assert!(!manager.is_control_open());
    assert!(!manager.is_mapping_open());
    assert!(manager.is_empty());
    assert_eq!(probe.borrow().control_closes, 1);
    assert_eq!(probe.borrow().mapping_closes, 1);

    // A later request reopens both
    probe.borrow_mut().fail_alloc = false;
    manager
        .alloc_via_mailbox_strategy(4096, 4096, MailboxFlags::DIRECT)
        .unwrap();
    assert_eq!(probe.borrow().control_opens, 2);
    assert_eq!(probe.borrow().mapping_opens, 2);
}

/// Test that live mailbox allocations survive a later failed allocation.
#[test]
fn test_live_mailbox_allocation_freed_after_rollback() {
    let mut manager = manager();
    let probe = manager.mailbox_backend().state();

    let a = manager
        .alloc_via_mailbox_strategy(4096, 4096, MailboxFlags::DIRECT)
        .unwrap();
    probe.borrow_mut().fail_alloc = true;
    assert!(
        manager
            .alloc_via_mailbox_strategy(4096, 4096, MailboxFlags::DIRECT)
            .is_err()
    );
    assert!(!manager.is_control_open());
    assert_eq!(registered(&manager), BTreeSet::from([a.user_addr]));

    manager.free(a.user_addr).unwrap();
    assert!(probe.borrow().live.is_empty());
    assert!(manager.is_control_open());
    assert!(!manager.is_mapping_open());

    manager.finalize().unwrap();
    assert_eq!(probe.borrow().control_closes, 2);
}

/// Test that a shared-memory backend failure creates no record.
#[test]
fn test_shared_alloc_failure_creates_no_record() {
    let mut manager = manager();
    let probe = manager.shared_backend().state();
    probe.borrow_mut().fail_alloc = true;

    assert!(matches!(
        manager.alloc_via_shared_strategy(4096, 4096, CacheMode::None),
        Err(Error::BackendAllocFailed {
            kind: BackendKind::SharedMemory,
            ..
        })
    ));
    assert!(manager.is_empty());
    // The subsystem itself came up and stays up
    assert!(manager.is_shared_initialized());
}

/// Test that a mapping open failure keeps a control channel opened earlier.
#[test]
fn test_mapping_failure_keeps_preexisting_control() {
    let mut manager = manager();
    let probe = manager.mailbox_backend().state();

    let a = manager
        .alloc_via_mailbox_strategy(4096, 4096, MailboxFlags::DIRECT)
        .unwrap();
    probe.borrow_mut().fail_alloc = true;
    let _ = manager.alloc_via_mailbox_strategy(4096, 4096, MailboxFlags::DIRECT);
    probe.borrow_mut().fail_alloc = false;

    // Reopen only the control channel through a free
    manager.free(a.user_addr).unwrap();
    assert!(manager.is_control_open());

    probe.borrow_mut().fail_open_mapping = true;
    assert!(matches!(
        manager.alloc_via_mailbox_strategy(4096, 4096, MailboxFlags::DIRECT),
        Err(Error::ResourceOpenFailed {
            resource: Resource::Mapping,
            ..
        })
    ));
    assert!(manager.is_control_open());
    assert!(!manager.is_mapping_open());
}
