//! Error types for busmem.

use crate::types::{BackendKind, UserAddr};
use thiserror::Error;

/// Result type alias using busmem's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Result type returned by backend adapters.
pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Main error type for manager operations.
#[derive(Error, Debug)]
pub enum Error {
    /// An argument was rejected before reaching any backend.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Local bookkeeping memory could not be allocated.
    #[error("out of memory")]
    OutOfMemory,

    /// One-time shared-memory subsystem initialization failed.
    #[error("shared-memory subsystem init failed: {0}")]
    BackendInitFailed(#[source] BackendError),

    /// A lazily-opened device resource could not be opened.
    #[error("failed to open {resource}: {source}")]
    ResourceOpenFailed {
        /// Which resource failed to open.
        resource: Resource,
        /// Underlying backend failure.
        #[source]
        source: BackendError,
    },

    /// The backend rejected an allocation request.
    #[error("{kind} allocation failed: {source}")]
    BackendAllocFailed {
        /// Backend that was asked to allocate.
        kind: BackendKind,
        /// Underlying backend failure.
        #[source]
        source: BackendError,
    },

    /// The allocation could not be recorded in the registry.
    #[error("failed to register allocation: {0}")]
    RegistrationFailed(#[source] RegistryError),

    /// No live allocation is registered at this address.
    #[error("no allocation registered at {0}")]
    NotFound(UserAddr),

    /// The backend reported a failure while releasing an allocation.
    ///
    /// The record has already been dropped from the registry when this is returned.
    #[error("{kind} release of {addr} failed: {source}")]
    BackendFreeFailed {
        /// Backend that owned the allocation.
        kind: BackendKind,
        /// User address of the released allocation.
        addr: UserAddr,
        /// Underlying backend failure.
        #[source]
        source: BackendError,
    },

    /// Closing a device resource failed.
    #[error("failed to close {resource}: {source}")]
    ResourceCloseFailed {
        /// Which resource failed to close.
        resource: Resource,
        /// Underlying backend failure.
        #[source]
        source: BackendError,
    },

    /// Finalization ran every cleanup step but at least one of them failed.
    #[error("finalize completed with {} failed cleanup step(s)", .0.len())]
    FinalizeFailed(Vec<Error>),
}

impl Error {
    /// Number of individual failures carried by this error.
    ///
    /// Returns 1 for every variant except [`Error::FinalizeFailed`].
    pub fn failure_count(&self) -> usize {
        match self {
            Error::FinalizeFailed(failures) => failures.len(),
            _ => 1,
        }
    }
}

/// Device resources held lazily by the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resource {
    /// Mailbox property channel (`/dev/vcio`).
    Control,
    /// Physical memory mapping device (`/dev/mem`).
    Mapping,
}

impl std::fmt::Display for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Resource::Control => f.write_str("mailbox control channel"),
            Resource::Mapping => f.write_str("memory mapping device"),
        }
    }
}

/// Failures reported by a backend adapter.
#[derive(Error, Debug)]
pub enum BackendError {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// System call error (via rustix).
    #[error("system error: {0}")]
    System(#[from] rustix::io::Errno),

    /// The firmware answered a property request with an error.
    #[error("firmware rejected tag {tag:#07x}: code {code:#010x}")]
    Firmware {
        /// Property tag of the request.
        tag: u32,
        /// Response or status code returned.
        code: u32,
    },

    /// The backend does not know the handle it was asked to operate on.
    #[error("unknown handle {0}")]
    UnknownHandle(u32),

    /// The request cannot be expressed to this backend.
    #[error("unsupported request: {0}")]
    Unsupported(String),

    /// Failure injected by a test backend.
    #[error("injected failure: {0}")]
    Injected(String),
}

/// Failures of the allocation registry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// A record with the same user address is already registered.
    #[error("duplicate user address {0}")]
    DuplicateKey(UserAddr),

    /// No record is registered at this address.
    #[error("no record at {0}")]
    NotFound(UserAddr),

    /// Registry storage could not grow.
    #[error("registry storage exhausted")]
    OutOfMemory,
}
