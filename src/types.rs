//! Address, handle and backend types shared across the crate.

use bitflags::bitflags;
use std::fmt;

/// Process-visible address of an allocation.
///
/// This is the registry key: at most one live allocation exists per address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UserAddr(pub usize);

impl UserAddr {
    /// Build an address from a mapped pointer.
    #[inline]
    pub fn from_ptr<T>(ptr: *mut T) -> Self {
        Self(ptr as usize)
    }

    /// The address as a raw pointer.
    #[inline]
    pub fn as_ptr(self) -> *mut u8 {
        self.0 as *mut u8
    }
}

impl fmt::Display for UserAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Address at which the VideoCore side sees an allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BusAddr(pub u32);

impl BusAddr {
    /// Mask clearing the VideoCore cache-alias bits of a bus address.
    pub const ALIAS_MASK: u32 = 0x3FFF_FFFF;

    /// ARM physical address of this bus address (alias bits stripped).
    #[inline]
    pub fn to_phys(self) -> u64 {
        u64::from(self.0 & Self::ALIAS_MASK)
    }
}

impl fmt::Display for BusAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// Backend-opaque allocation handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AllocHandle(pub u32);

impl fmt::Display for AllocHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Which backend produced an allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BackendKind {
    /// VideoCore shared-memory manager (dma-buf backed).
    SharedMemory,
    /// Firmware mailbox allocator mapped through `/dev/mem`.
    Mailbox,
}

impl BackendKind {
    /// Short lowercase name used in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::SharedMemory => "shared-memory",
            BackendKind::Mailbox => "mailbox",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// CPU/VideoCore caching for shared-memory allocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CacheMode {
    /// Uncached on both sides.
    #[default]
    None,
    /// Cached on the ARM host only.
    Host,
    /// Cached on the VideoCore only.
    VideoCore,
    /// Cached on both sides.
    Both,
}

impl CacheMode {
    /// Value of the `cached` field in the shared-memory allocation request.
    #[inline]
    pub fn as_raw(self) -> u32 {
        match self {
            CacheMode::None => 0,
            CacheMode::Host => 1,
            CacheMode::VideoCore => 2,
            CacheMode::Both => 3,
        }
    }

    /// Whether the ARM side sees this memory through its cache.
    #[inline]
    pub fn is_host_cached(self) -> bool {
        matches!(self, CacheMode::Host | CacheMode::Both)
    }
}

bitflags! {
    /// Flags for firmware mailbox allocations.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MailboxFlags: u32 {
        /// Can be resized to 0 at any time. Use for cached data.
        const DISCARDABLE = 1 << 0;
        /// Normal allocating alias. Don't use from ARM.
        const NORMAL = 0 << 2;
        /// 0xC alias, uncached.
        const DIRECT = 1 << 2;
        /// 0x8 alias, non-allocating in L2 but coherent.
        const COHERENT = 2 << 2;
        /// Allocating in L2.
        const L1_NONALLOCATING = Self::DIRECT.bits() | Self::COHERENT.bits();
        /// Initialise buffer to all zeros.
        const ZERO = 1 << 4;
        /// Don't initialise (default is initialise to all ones).
        const NO_INIT = 1 << 5;
        /// Likely to be locked for long periods of time.
        const HINT_PERMALOCK = 1 << 6;
    }
}

impl Default for MailboxFlags {
    fn default() -> Self {
        MailboxFlags::DIRECT
    }
}

/// What a backend hands back for a successful allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendAllocation {
    /// Handle needed to release the allocation.
    pub handle: AllocHandle,
    /// Device-visible address.
    pub bus_addr: BusAddr,
    /// Process-visible address.
    pub user_addr: UserAddr,
}

/// Addresses returned to the caller of an `alloc_*` operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    /// Process-visible address; pass it to `free`.
    pub user_addr: UserAddr,
    /// Device-visible address.
    pub bus_addr: BusAddr,
}
