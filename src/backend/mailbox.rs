//! Firmware mailbox backend over `/dev/vcio`.
//!
//! Memory is requested from the VideoCore firmware through the mailbox
//! property interface:
//!
//! 1. `ALLOCATE_MEMORY` returns a handle.
//! 2. `LOCK_MEMORY` pins it and returns its bus address.
//! 3. The bus address is converted to an ARM physical address and mapped
//!    through the physical memory device (`/dev/mem`).
//!
//! Release undoes the three steps in reverse order.

use super::{MailboxBackend, iowr, open_device, open_mapping_device};
use crate::config::DeviceConfig;
use crate::error::{BackendError, BackendResult};
use crate::types::{AllocHandle, BackendAllocation, BusAddr, MailboxFlags, UserAddr};
use rustix::fd::{AsRawFd, BorrowedFd, OwnedFd};
use rustix::mm::{MapFlags, ProtFlags};
use std::path::PathBuf;

/// IOCTL_MBOX_PROPERTY: _IOWR(100, 0, char *)
const IOCTL_MBOX_PROPERTY: libc::c_ulong =
    iowr(100, 0, std::mem::size_of::<*mut libc::c_char>());

const PROCESS_REQUEST: u32 = 0x0000_0000;
const RESPONSE_SUCCESS: u32 = 0x8000_0000;
const TAG_END: u32 = 0x0000_0000;

/// Property tags used by the allocator.
const TAG_ALLOCATE_MEMORY: u32 = 0x0003_000c;
const TAG_LOCK_MEMORY: u32 = 0x0003_000d;
const TAG_UNLOCK_MEMORY: u32 = 0x0003_000e;
const TAG_RELEASE_MEMORY: u32 = 0x0003_000f;

const BUFFER_WORDS: usize = 32;

/// Mailbox property message buffer.
#[repr(C, align(16))]
struct PropertyBuffer([u32; BUFFER_WORDS]);

impl PropertyBuffer {
    /// Build a single-tag request carrying `args` with room for `response_words`.
    fn request(tag: u32, args: &[u32], response_words: usize) -> Self {
        let value_words = args.len().max(response_words);
        debug_assert!(6 + value_words <= BUFFER_WORDS);

        let mut buf = [0u32; BUFFER_WORDS];
        let mut i = 1;
        buf[i] = PROCESS_REQUEST;
        i += 1;
        buf[i] = tag;
        i += 1;
        buf[i] = (value_words * 4) as u32;
        i += 1;
        buf[i] = (args.len() * 4) as u32;
        i += 1;
        buf[i..i + args.len()].copy_from_slice(args);
        i += value_words;
        buf[i] = TAG_END;
        i += 1;
        buf[0] = (i * 4) as u32;
        Self(buf)
    }

    fn response_code(&self) -> u32 {
        self.0[1]
    }

    /// First word of the tag's value buffer.
    fn value(&self) -> u32 {
        self.0[5]
    }
}

/// Send one property request and return the first response word.
fn property(control: BorrowedFd<'_>, tag: u32, args: &[u32]) -> BackendResult<u32> {
    let mut buf = PropertyBuffer::request(tag, args, 1);

    // SAFETY: the control fd is an open mailbox channel and `buf` is a
    // properly sized, terminated property message that outlives the call.
    let ret = unsafe { libc::ioctl(control.as_raw_fd(), IOCTL_MBOX_PROPERTY, buf.0.as_mut_ptr()) };
    if ret < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    if buf.response_code() != RESPONSE_SUCCESS {
        return Err(BackendError::Firmware {
            tag,
            code: buf.response_code(),
        });
    }
    Ok(buf.value())
}

/// Firmware status words are zero on success.
fn status(tag: u32, code: u32) -> BackendResult<()> {
    if code == 0 {
        Ok(())
    } else {
        Err(BackendError::Firmware { tag, code })
    }
}

/// Page-aligned window of `/dev/mem` covering a bus allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PhysWindow {
    /// Page-aligned physical offset to map.
    base: u64,
    /// Offset of the allocation inside the window.
    offset: usize,
    /// Length of the window.
    len: usize,
}

impl PhysWindow {
    fn new(bus_addr: BusAddr, size: usize, page: usize) -> Self {
        let phys = bus_addr.to_phys();
        let base = phys & !(page as u64 - 1);
        let offset = (phys - base) as usize;
        Self {
            base,
            offset,
            len: size + offset,
        }
    }
}

/// Mailbox backend talking to the firmware through `/dev/vcio`.
#[derive(Debug, Clone)]
pub struct VcioMailbox {
    vcio_path: PathBuf,
    mem_path: PathBuf,
}

impl VcioMailbox {
    /// Create a backend for the devices named in `config`.
    pub fn new(config: &DeviceConfig) -> Self {
        Self {
            vcio_path: config.vcio_path.clone(),
            mem_path: config.mem_path.clone(),
        }
    }

    fn unlock_and_release(control: BorrowedFd<'_>, handle: u32) -> BackendResult<()> {
        let unlocked = property(control, TAG_UNLOCK_MEMORY, &[handle])
            .and_then(|code| status(TAG_UNLOCK_MEMORY, code));
        let released = property(control, TAG_RELEASE_MEMORY, &[handle])
            .and_then(|code| status(TAG_RELEASE_MEMORY, code));
        unlocked.and(released)
    }
}

impl MailboxBackend for VcioMailbox {
    fn open_control(&mut self) -> BackendResult<OwnedFd> {
        open_device(&self.vcio_path)
    }

    fn open_mapping(&mut self) -> BackendResult<OwnedFd> {
        open_mapping_device(&self.mem_path)
    }

    fn allocate(
        &mut self,
        control: BorrowedFd<'_>,
        mapping: BorrowedFd<'_>,
        size: usize,
        align: usize,
        flags: MailboxFlags,
    ) -> BackendResult<BackendAllocation> {
        let req_size = u32::try_from(size)
            .map_err(|_| BackendError::Unsupported(format!("size {} too large", size)))?;
        let req_align = u32::try_from(align)
            .map_err(|_| BackendError::Unsupported(format!("alignment {} too large", align)))?;

        let handle = property(
            control,
            TAG_ALLOCATE_MEMORY,
            &[req_size, req_align, flags.bits()],
        )?;
        if handle == 0 {
            return Err(BackendError::Firmware {
                tag: TAG_ALLOCATE_MEMORY,
                code: 0,
            });
        }

        let bus = match property(control, TAG_LOCK_MEMORY, &[handle]) {
            Ok(0) => Err(BackendError::Firmware {
                tag: TAG_LOCK_MEMORY,
                code: 0,
            }),
            Ok(bus) => Ok(BusAddr(bus)),
            Err(e) => Err(e),
        };
        let bus_addr = match bus {
            Ok(bus_addr) => bus_addr,
            Err(e) => {
                let _ = property(control, TAG_RELEASE_MEMORY, &[handle]);
                return Err(e);
            }
        };

        let window = PhysWindow::new(bus_addr, size, rustix::param::page_size());
        let mapped = unsafe {
            rustix::mm::mmap(
                std::ptr::null_mut(),
                window.len,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                mapping,
                window.base,
            )
        };
        let ptr = match mapped {
            Ok(ptr) => ptr.cast::<u8>(),
            Err(e) => {
                let _ = Self::unlock_and_release(control, handle);
                return Err(e.into());
            }
        };

        // SAFETY: `offset` is inside the window we just mapped.
        let user = unsafe { ptr.add(window.offset) };
        tracing::trace!(handle, bus = %bus_addr, phys = window.base, "mailbox memory mapped");

        Ok(BackendAllocation {
            handle: AllocHandle(handle),
            bus_addr,
            user_addr: UserAddr::from_ptr(user),
        })
    }

    fn release(
        &mut self,
        control: BorrowedFd<'_>,
        size: usize,
        handle: AllocHandle,
        bus_addr: BusAddr,
        user_addr: UserAddr,
    ) -> BackendResult<()> {
        let window = PhysWindow::new(bus_addr, size, rustix::param::page_size());
        let base = user_addr.0.wrapping_sub(window.offset) as *mut libc::c_void;

        let unmapped = unsafe { rustix::mm::munmap(base, window.len) };
        let returned = Self::unlock_and_release(control, handle.0);

        unmapped?;
        returned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_request_encoding() {
        let buf = PropertyBuffer::request(TAG_ALLOCATE_MEMORY, &[4096, 4096, 0x4], 1);
        assert_eq!(
            &buf.0[..9],
            &[36, PROCESS_REQUEST, TAG_ALLOCATE_MEMORY, 12, 12, 4096, 4096, 0x4, TAG_END]
        );
    }

    #[test]
    fn test_lock_request_encoding() {
        let buf = PropertyBuffer::request(TAG_LOCK_MEMORY, &[7], 1);
        assert_eq!(&buf.0[..7], &[28, PROCESS_REQUEST, TAG_LOCK_MEMORY, 4, 4, 7, TAG_END]);
    }

    #[test]
    fn test_status() {
        assert!(status(TAG_UNLOCK_MEMORY, 0).is_ok());
        assert!(matches!(
            status(TAG_RELEASE_MEMORY, 1),
            Err(BackendError::Firmware {
                tag: TAG_RELEASE_MEMORY,
                code: 1
            })
        ));
    }

    #[test]
    fn test_phys_window_alignment() {
        let window = PhysWindow::new(BusAddr(0xC012_3010), 4096, 4096);
        assert_eq!(window.base, 0x0012_3000);
        assert_eq!(window.offset, 0x10);
        assert_eq!(window.len, 4096 + 0x10);

        let aligned = PhysWindow::new(BusAddr(0x4000_8000), 8192, 4096);
        assert_eq!(aligned.base, 0x8000);
        assert_eq!(aligned.offset, 0);
        assert_eq!(aligned.len, 8192);
    }

    #[test]
    fn test_open_control_missing_device() {
        let dir = tempfile::tempdir().unwrap();
        let config = DeviceConfig::default().with_vcio_path(dir.path().join("vcio"));
        let mut mailbox = VcioMailbox::new(&config);
        assert!(mailbox.open_control().is_err());
    }

    #[test]
    fn test_property_on_non_mailbox_fd_fails() {
        // A memfd does not understand the mailbox ioctl.
        let fd = rustix::fs::memfd_create("not-vcio", rustix::fs::MemfdFlags::CLOEXEC).unwrap();
        let err = property(rustix::fd::AsFd::as_fd(&fd), TAG_LOCK_MEMORY, &[1]).unwrap_err();
        assert!(matches!(err, BackendError::Io(_)));
    }
}
