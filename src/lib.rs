//! # busmem
//!
//! Bus-memory allocation tracking for the Raspberry Pi VideoCore.
//!
//! busmem hands out memory the VideoCore can see, through either of two
//! allocators, and remembers how to give every allocation back:
//!
//! - **Shared memory** (`/dev/vcsm-cma`): CMA buffers exported as DMA-BUF and
//!   mapped into the process, with selectable caching.
//! - **Mailbox** (`/dev/vcio` + `/dev/mem`): firmware allocations locked to a
//!   bus address and mapped uncached through the physical memory device.
//!
//! Every allocation is recorded under its user address, so callers only ever
//! need that address to free it. Finalizing the manager releases whatever is
//! left and closes every device.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use busmem::prelude::*;
//!
//! let mut manager = MemoryManager::open(&DeviceConfig::default())?;
//!
//! let buf = manager.alloc_via_mailbox_strategy(1 << 20, 4096, MailboxFlags::DIRECT)?;
//! // Hand `buf.bus_addr` to the VideoCore, use `buf.user_addr` from the ARM side.
//! manager.free(buf.user_addr)?;
//!
//! manager.finalize()?;
//! ```
//!
//! ## Testing without hardware
//!
//! [`testing`] provides fake backends with call counters and failure
//! injection; [`MemoryManager::init`] accepts any pair of backends.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod backend;
pub mod config;
pub mod error;
pub mod manager;
pub mod registry;
pub mod testing;
pub mod types;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::backend::{MailboxBackend, SharedMemoryBackend};
    pub use crate::config::DeviceConfig;
    pub use crate::error::{Error, Result};
    pub use crate::manager::{ManagerStats, MemoryManager};
    pub use crate::types::{Allocation, BusAddr, CacheMode, MailboxFlags, UserAddr};
}

pub use config::DeviceConfig;
pub use error::{BackendError, Error, RegistryError, Resource, Result};
pub use manager::{ManagerStats, MemoryManager};
pub use registry::{AllocationRecord, AllocationRegistry};
pub use types::{
    AllocHandle, Allocation, BackendAllocation, BackendKind, BusAddr, CacheMode, MailboxFlags,
    UserAddr,
};
