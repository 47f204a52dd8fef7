//! Allocation backends.
//!
//! The manager talks to two interchangeable allocators through the traits in
//! this module:
//!
//! - [`SharedMemoryBackend`]: the VideoCore shared-memory manager. Needs a
//!   one-time subsystem init and a matching exit.
//! - [`MailboxBackend`]: the firmware mailbox allocator. Needs a control
//!   channel and a physical-memory mapping device, both opened lazily by the
//!   manager and closed on teardown.
//!
//! Hardware implementations are [`VcsmBackend`] and [`VcioMailbox`]. Tests use
//! the fakes in [`crate::testing`].

mod mailbox;
mod vcsm;

pub use mailbox::VcioMailbox;
pub use vcsm::VcsmBackend;

use crate::error::BackendResult;
use crate::types::{AllocHandle, BackendAllocation, BusAddr, CacheMode, MailboxFlags, UserAddr};
use rustix::fd::{BorrowedFd, OwnedFd};
use std::os::fd::IntoRawFd;
use std::path::Path;

/// VideoCore shared-memory allocator.
pub trait SharedMemoryBackend {
    /// Bring up the shared-memory subsystem.
    ///
    /// The manager calls this at most once before the first allocation.
    fn subsystem_init(&mut self) -> BackendResult<()>;

    /// Tear down the shared-memory subsystem.
    fn subsystem_exit(&mut self);

    /// Allocate `size` bytes aligned to `align` and map them into the process.
    fn allocate(
        &mut self,
        size: usize,
        align: usize,
        cache: CacheMode,
    ) -> BackendResult<BackendAllocation>;

    /// Unmap and release an allocation made by [`allocate`](Self::allocate).
    fn release(&mut self, handle: AllocHandle, user_addr: UserAddr) -> BackendResult<()>;
}

/// Firmware mailbox allocator.
///
/// The manager owns the control and mapping resources; the backend only ever
/// borrows them for the duration of a call.
pub trait MailboxBackend {
    /// Open the mailbox control channel.
    fn open_control(&mut self) -> BackendResult<OwnedFd>;

    /// Close the mailbox control channel.
    fn close_control(&mut self, fd: OwnedFd) -> BackendResult<()> {
        close_fd(fd)
    }

    /// Open the device used to map mailbox memory into the process.
    fn open_mapping(&mut self) -> BackendResult<OwnedFd>;

    /// Close the mapping device.
    fn close_mapping(&mut self, fd: OwnedFd) -> BackendResult<()> {
        close_fd(fd)
    }

    /// Allocate, lock and map `size` bytes of VideoCore memory.
    fn allocate(
        &mut self,
        control: BorrowedFd<'_>,
        mapping: BorrowedFd<'_>,
        size: usize,
        align: usize,
        flags: MailboxFlags,
    ) -> BackendResult<BackendAllocation>;

    /// Unmap, unlock and release an allocation made by [`allocate`](Self::allocate).
    fn release(
        &mut self,
        control: BorrowedFd<'_>,
        size: usize,
        handle: AllocHandle,
        bus_addr: BusAddr,
        user_addr: UserAddr,
    ) -> BackendResult<()>;
}

/// Close a descriptor and report what `close(2)` returned.
///
/// Dropping an [`OwnedFd`] swallows close errors, which would hide a failed
/// teardown.
pub fn close_fd(fd: OwnedFd) -> BackendResult<()> {
    let raw = fd.into_raw_fd();
    // SAFETY: `raw` was owned by the OwnedFd we just consumed and is not used again.
    let ret = unsafe { libc::close(raw) };
    if ret < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(())
}

/// Open a physical memory device for mapping uncached memory.
///
/// Mailbox memory is not coherent with the ARM caches, so the device is
/// opened with `O_SYNC`.
pub fn open_mapping_device(path: &Path) -> BackendResult<OwnedFd> {
    use rustix::fs::{Mode, OFlags};
    let fd = rustix::fs::open(
        path,
        OFlags::RDWR | OFlags::SYNC | OFlags::CLOEXEC,
        Mode::empty(),
    )?;
    Ok(fd)
}

/// Open a character device read/write.
pub(crate) fn open_device(path: &Path) -> BackendResult<OwnedFd> {
    use rustix::fs::{Mode, OFlags};
    let fd = rustix::fs::open(path, OFlags::RDWR | OFlags::CLOEXEC, Mode::empty())?;
    Ok(fd)
}

const IOC_NRBITS: u32 = 8;
const IOC_TYPEBITS: u32 = 8;
const IOC_SIZEBITS: u32 = 14;
const IOC_NRSHIFT: u32 = 0;
const IOC_TYPESHIFT: u32 = IOC_NRSHIFT + IOC_NRBITS;
const IOC_SIZESHIFT: u32 = IOC_TYPESHIFT + IOC_TYPEBITS;
const IOC_DIRSHIFT: u32 = IOC_SIZESHIFT + IOC_SIZEBITS;
const IOC_WRITE: libc::c_ulong = 1;
const IOC_READ: libc::c_ulong = 2;

const fn ioc(dir: libc::c_ulong, ty: u8, nr: u8, size: usize) -> libc::c_ulong {
    (dir << IOC_DIRSHIFT)
        | ((ty as libc::c_ulong) << IOC_TYPESHIFT)
        | ((nr as libc::c_ulong) << IOC_NRSHIFT)
        | ((size as libc::c_ulong) << IOC_SIZESHIFT)
}

/// `_IOR(ty, nr, size)`
pub(crate) const fn ior(ty: u8, nr: u8, size: usize) -> libc::c_ulong {
    ioc(IOC_READ, ty, nr, size)
}

/// `_IOWR(ty, nr, size)`
pub(crate) const fn iowr(ty: u8, nr: u8, size: usize) -> libc::c_ulong {
    ioc(IOC_READ | IOC_WRITE, ty, nr, size)
}

/// Round `len` up to a multiple of `page`, which must be a power of two.
#[inline]
pub(crate) fn page_round_up(len: usize, page: usize) -> usize {
    (len + page - 1) & !(page - 1)
}
