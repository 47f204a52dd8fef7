//! Allocation manager.
//!
//! [`MemoryManager`] ties the two backends to the [`AllocationRegistry`]:
//!
//! - the shared-memory subsystem is initialized on first use and exited on
//!   teardown;
//! - the mailbox control channel and mapping device are opened on first use
//!   and closed on teardown;
//! - every successful allocation is registered under its user address, and
//!   `free` dispatches back to the backend that produced it.
//!
//! A failed `alloc_*` call rolls back everything it did. [`MemoryManager::finalize`]
//! is the one fail-soft path: it runs every cleanup step and reports all
//! failures together.

use crate::backend::{MailboxBackend, SharedMemoryBackend, VcioMailbox, VcsmBackend};
use crate::config::DeviceConfig;
use crate::error::{BackendResult, Error, Resource, Result};
use crate::registry::{AllocationRecord, AllocationRegistry, DEFAULT_REGISTRY_CAPACITY};
use crate::types::{Allocation, BackendAllocation, BackendKind, CacheMode, MailboxFlags, UserAddr};
use rustix::fd::{AsFd, OwnedFd};

/// Snapshot of what a manager currently holds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ManagerStats {
    /// Live allocations across both backends.
    pub live_allocations: usize,
    /// Sum of the requested sizes of live allocations.
    pub live_bytes: usize,
    /// Live shared-memory allocations.
    pub shared_allocations: usize,
    /// Live mailbox allocations.
    pub mailbox_allocations: usize,
}

/// Tracks VideoCore allocations made through either backend.
///
/// The manager is single-threaded: wrap it in a mutex to share it.
///
/// # Example
///
/// ```rust,ignore
/// use busmem::{CacheMode, DeviceConfig, MailboxFlags, MemoryManager};
///
/// let mut manager = MemoryManager::open(&DeviceConfig::default())?;
///
/// let frame = manager.alloc_via_shared_strategy(4096, 4096, CacheMode::Host)?;
/// let code = manager.alloc_via_mailbox_strategy(8192, 4096, MailboxFlags::DIRECT)?;
/// println!("code at bus {}", code.bus_addr);
///
/// manager.free(frame.user_addr)?;
/// // Releases `code` and closes every device.
/// manager.finalize()?;
/// ```
pub struct MemoryManager<S: SharedMemoryBackend, M: MailboxBackend> {
    shared: S,
    mailbox: M,
    shared_initialized: bool,
    control: Option<OwnedFd>,
    mapping: Option<OwnedFd>,
    registry: AllocationRegistry,
}

impl MemoryManager<VcsmBackend, VcioMailbox> {
    /// Create a manager over the hardware backends.
    ///
    /// No device is opened until the first allocation.
    pub fn open(config: &DeviceConfig) -> Result<Self> {
        Self::init(VcsmBackend::new(config), VcioMailbox::new(config))
    }
}

impl<S: SharedMemoryBackend, M: MailboxBackend> MemoryManager<S, M> {
    /// Create a manager with every resource closed and an empty registry.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfMemory`] if the registry cannot be allocated.
    pub fn init(shared: S, mailbox: M) -> Result<Self> {
        let registry = AllocationRegistry::with_capacity(DEFAULT_REGISTRY_CAPACITY)
            .map_err(|_| Error::OutOfMemory)?;

        Ok(Self {
            shared,
            mailbox,
            shared_initialized: false,
            control: None,
            mapping: None,
            registry,
        })
    }

    /// Allocate through the shared-memory backend.
    ///
    /// Initializes the shared-memory subsystem on first use.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] for a zero size or non power-of-two alignment.
    /// - [`Error::BackendInitFailed`] if the subsystem cannot be initialized.
    /// - [`Error::BackendAllocFailed`] if the backend refuses the request.
    /// - [`Error::RegistrationFailed`] if the result cannot be registered; the
    ///   backend allocation is released before returning.
    pub fn alloc_via_shared_strategy(
        &mut self,
        size: usize,
        align: usize,
        cache: CacheMode,
    ) -> Result<Allocation> {
        validate_request(size, align)?;

        if !self.shared_initialized {
            self.shared.subsystem_init().map_err(|e| {
                tracing::warn!(error = %e, "shared-memory subsystem init failed");
                Error::BackendInitFailed(e)
            })?;
            self.shared_initialized = true;
            tracing::debug!("shared-memory subsystem initialized");
        }

        let allocation = self
            .shared
            .allocate(size, align, cache)
            .map_err(|source| Error::BackendAllocFailed {
                kind: BackendKind::SharedMemory,
                source,
            })?;

        if let Err(e) = self.register(BackendKind::SharedMemory, size, &allocation) {
            if let Err(free_err) = self.shared.release(allocation.handle, allocation.user_addr) {
                tracing::warn!(
                    addr = %allocation.user_addr,
                    error = %free_err,
                    "failed to release unregistered shared-memory allocation"
                );
            }
            return Err(e);
        }

        Ok(Allocation {
            user_addr: allocation.user_addr,
            bus_addr: allocation.bus_addr,
        })
    }

    /// Allocate through the mailbox backend.
    ///
    /// Opens the control channel and the mapping device on first use.
    ///
    /// If the backend refuses the request, or the result cannot be registered,
    /// both resources are closed, including ones opened by earlier calls.
    /// Live mailbox allocations reopen the control channel when freed.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] for a zero size or non power-of-two alignment.
    /// - [`Error::ResourceOpenFailed`] if a resource cannot be opened; a control
    ///   channel opened by this call is closed again.
    /// - [`Error::BackendAllocFailed`] if the backend refuses the request.
    /// - [`Error::RegistrationFailed`] if the result cannot be registered; the
    ///   backend allocation is released before returning.
    pub fn alloc_via_mailbox_strategy(
        &mut self,
        size: usize,
        align: usize,
        flags: MailboxFlags,
    ) -> Result<Allocation> {
        validate_request(size, align)?;

        let (control, opened_control) = match self.control.take() {
            Some(fd) => (fd, false),
            None => {
                let fd = self
                    .mailbox
                    .open_control()
                    .map_err(|source| Error::ResourceOpenFailed {
                        resource: Resource::Control,
                        source,
                    })?;
                tracing::debug!("mailbox control channel opened");
                (fd, true)
            }
        };

        let mapping = match self.mapping.take() {
            Some(fd) => fd,
            None => match self.mailbox.open_mapping() {
                Ok(fd) => {
                    tracing::debug!("memory mapping device opened");
                    fd
                }
                Err(source) => {
                    if opened_control {
                        self.discard(Resource::Control, control);
                    } else {
                        self.control = Some(control);
                    }
                    return Err(Error::ResourceOpenFailed {
                        resource: Resource::Mapping,
                        source,
                    });
                }
            },
        };

        let allocation =
            match self
                .mailbox
                .allocate(control.as_fd(), mapping.as_fd(), size, align, flags)
            {
                Ok(allocation) => allocation,
                Err(source) => {
                    self.discard(Resource::Control, control);
                    self.discard(Resource::Mapping, mapping);
                    return Err(Error::BackendAllocFailed {
                        kind: BackendKind::Mailbox,
                        source,
                    });
                }
            };

        if let Err(e) = self.register(BackendKind::Mailbox, size, &allocation) {
            if let Err(free_err) = self.mailbox.release(
                control.as_fd(),
                size,
                allocation.handle,
                allocation.bus_addr,
                allocation.user_addr,
            ) {
                tracing::warn!(
                    addr = %allocation.user_addr,
                    error = %free_err,
                    "failed to release unregistered mailbox allocation"
                );
            }
            self.discard(Resource::Control, control);
            self.discard(Resource::Mapping, mapping);
            return Err(e);
        }

        self.control = Some(control);
        self.mapping = Some(mapping);

        Ok(Allocation {
            user_addr: allocation.user_addr,
            bus_addr: allocation.bus_addr,
        })
    }

    /// Release the allocation registered at `addr`.
    ///
    /// The record leaves the registry before the backend is called, so a
    /// backend failure still counts as released and the address is not
    /// retried.
    ///
    /// # Errors
    ///
    /// - [`Error::NotFound`] if nothing is registered at `addr`; the manager is
    ///   unchanged.
    /// - [`Error::BackendFreeFailed`] if the backend reports a failure.
    pub fn free(&mut self, addr: UserAddr) -> Result<()> {
        let record = self.registry.remove(addr).map_err(|_| {
            tracing::warn!(addr = %addr, "free of unregistered address");
            Error::NotFound(addr)
        })?;
        self.release_record(&record)
    }

    /// Release every live allocation and close every resource.
    ///
    /// All steps run even if earlier ones fail.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FinalizeFailed`] carrying each failed step.
    pub fn finalize(mut self) -> Result<()> {
        let failures = self.teardown();
        if failures.is_empty() {
            tracing::debug!("memory manager finalized");
            Ok(())
        } else {
            tracing::warn!(failures = failures.len(), "memory manager finalized with errors");
            Err(Error::FinalizeFailed(failures))
        }
    }

    /// The live allocation registered at `addr`, if any.
    pub fn find(&self, addr: UserAddr) -> Option<&AllocationRecord> {
        self.registry.find(addr).ok()
    }

    /// Number of live allocations.
    pub fn len(&self) -> usize {
        self.registry.len()
    }

    /// Returns true if there are no live allocations.
    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }

    /// User addresses of all live allocations, in no particular order.
    pub fn addresses(&self) -> impl Iterator<Item = UserAddr> + '_ {
        self.registry.addresses()
    }

    /// Summarize the live allocations.
    pub fn stats(&self) -> ManagerStats {
        self.registry
            .iter()
            .fold(ManagerStats::default(), |mut stats, record| {
                stats.live_allocations += 1;
                stats.live_bytes += record.size;
                match record.kind {
                    BackendKind::SharedMemory => stats.shared_allocations += 1,
                    BackendKind::Mailbox => stats.mailbox_allocations += 1,
                }
                stats
            })
    }

    /// Whether the shared-memory subsystem has been initialized.
    pub fn is_shared_initialized(&self) -> bool {
        self.shared_initialized
    }

    /// Whether the mailbox control channel is open.
    pub fn is_control_open(&self) -> bool {
        self.control.is_some()
    }

    /// Whether the memory mapping device is open.
    pub fn is_mapping_open(&self) -> bool {
        self.mapping.is_some()
    }

    /// The shared-memory backend.
    pub fn shared_backend(&self) -> &S {
        &self.shared
    }

    /// The mailbox backend.
    pub fn mailbox_backend(&self) -> &M {
        &self.mailbox
    }

    fn register(
        &mut self,
        kind: BackendKind,
        size: usize,
        allocation: &BackendAllocation,
    ) -> Result<()> {
        let record = AllocationRecord {
            kind,
            size,
            handle: allocation.handle,
            bus_addr: allocation.bus_addr,
            user_addr: allocation.user_addr,
        };
        self.registry.insert(record).map_err(|e| {
            tracing::error!(addr = %allocation.user_addr, %kind, error = %e, "registration failed");
            Error::RegistrationFailed(e)
        })?;
        tracing::debug!(
            addr = %allocation.user_addr,
            bus = %allocation.bus_addr,
            handle = %allocation.handle,
            size,
            %kind,
            "allocation registered"
        );
        Ok(())
    }

    /// Hand an unregistered record back to its backend.
    fn release_record(&mut self, record: &AllocationRecord) -> Result<()> {
        let outcome = match record.kind {
            BackendKind::SharedMemory => self.shared.release(record.handle, record.user_addr),
            BackendKind::Mailbox => self.release_mailbox(record),
        };

        match outcome {
            Ok(()) => {
                tracing::debug!(addr = %record.user_addr, kind = %record.kind, "allocation released");
                Ok(())
            }
            Err(source) => {
                tracing::warn!(
                    addr = %record.user_addr,
                    kind = %record.kind,
                    error = %source,
                    "backend release failed"
                );
                Err(Error::BackendFreeFailed {
                    kind: record.kind,
                    addr: record.user_addr,
                    source,
                })
            }
        }
    }

    fn release_mailbox(&mut self, record: &AllocationRecord) -> BackendResult<()> {
        let control = match self.control.take() {
            Some(fd) => fd,
            None => {
                let fd = self.mailbox.open_control()?;
                tracing::debug!("mailbox control channel reopened for release");
                fd
            }
        };
        let outcome = self.mailbox.release(
            control.as_fd(),
            record.size,
            record.handle,
            record.bus_addr,
            record.user_addr,
        );
        self.control = Some(control);
        outcome
    }

    /// Close a resource during rollback, logging rather than reporting failure.
    fn discard(&mut self, resource: Resource, fd: OwnedFd) {
        let closed = match resource {
            Resource::Control => self.mailbox.close_control(fd),
            Resource::Mapping => self.mailbox.close_mapping(fd),
        };
        match closed {
            Ok(()) => tracing::debug!(%resource, "closed during rollback"),
            Err(e) => tracing::warn!(%resource, error = %e, "close failed during rollback"),
        }
    }

    fn is_torn_down(&self) -> bool {
        self.registry.is_empty()
            && !self.shared_initialized
            && self.control.is_none()
            && self.mapping.is_none()
    }

    /// Run every cleanup step and collect the failures.
    fn teardown(&mut self) -> Vec<Error> {
        let mut failures = Vec::new();

        while let Some(record) = self.registry.take_any() {
            if let Err(e) = self.release_record(&record) {
                failures.push(e);
            }
        }

        if self.shared_initialized {
            self.shared.subsystem_exit();
            self.shared_initialized = false;
        }

        if let Some(fd) = self.control.take() {
            if let Err(source) = self.mailbox.close_control(fd) {
                tracing::warn!(error = %source, "failed to close mailbox control channel");
                failures.push(Error::ResourceCloseFailed {
                    resource: Resource::Control,
                    source,
                });
            }
        }

        if let Some(fd) = self.mapping.take() {
            if let Err(source) = self.mailbox.close_mapping(fd) {
                tracing::warn!(error = %source, "failed to close memory mapping device");
                failures.push(Error::ResourceCloseFailed {
                    resource: Resource::Mapping,
                    source,
                });
            }
        }

        failures
    }
}

impl<S: SharedMemoryBackend, M: MailboxBackend> Drop for MemoryManager<S, M> {
    fn drop(&mut self) {
        if self.is_torn_down() {
            return;
        }
        tracing::warn!(
            live = self.registry.len(),
            "memory manager dropped without finalize"
        );
        for failure in self.teardown() {
            tracing::warn!(error = %failure, "cleanup on drop failed");
        }
    }
}

impl<S: SharedMemoryBackend, M: MailboxBackend> std::fmt::Debug for MemoryManager<S, M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryManager")
            .field("shared_initialized", &self.shared_initialized)
            .field("control_open", &self.control.is_some())
            .field("mapping_open", &self.mapping.is_some())
            .field("live", &self.registry.len())
            .finish()
    }
}

fn validate_request(size: usize, align: usize) -> Result<()> {
    if size == 0 {
        return Err(Error::InvalidArgument("size must be greater than 0".into()));
    }
    if !align.is_power_of_two() {
        return Err(Error::InvalidArgument(format!(
            "alignment must be a power of 2, got {}",
            align
        )));
    }
    Ok(())
}
