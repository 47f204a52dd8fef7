//! VideoCore shared-memory backend over the `vcsm-cma` driver.
//!
//! Each allocation is a CMA buffer exported by the driver as a DMA-BUF file
//! descriptor. The buffer is mapped into the process with `mmap`, and released
//! by unmapping it and closing the DMA-BUF.

use super::{SharedMemoryBackend, ior, open_device, page_round_up};
use crate::config::DeviceConfig;
use crate::error::{BackendError, BackendResult};
use crate::types::{AllocHandle, BackendAllocation, BusAddr, CacheMode, UserAddr};
use rustix::fd::{AsRawFd, FromRawFd, OwnedFd};
use rustix::mm::{MapFlags, ProtFlags};
use std::collections::HashMap;
use std::path::PathBuf;
use std::ptr::NonNull;

const VC_SM_CMA_RESOURCE_NAME: usize = 32;
const VC_SM_CMA_MAGIC_TYPE: u8 = b'J';
const VC_SM_CMA_CMD_ALLOC: u8 = 0x5A;

/// Name attached to every buffer (visible in the driver's debugfs).
const RESOURCE_NAME: &[u8] = b"busmem";

/// vc_sm_cma_ioctl_alloc structure for VC_SM_CMA_IOCTL_MEM_ALLOC.
#[repr(C)]
struct VcSmCmaIoctlAlloc {
    /// Requested size in bytes.
    size: u32,
    /// Number of buffers (always 1).
    num: u32,
    /// Cache mode (`CacheMode::as_raw`).
    cached: u32,
    pad: u32,
    /// Resource name, NUL padded.
    name: [u8; VC_SM_CMA_RESOURCE_NAME],
    /// OUTPUT: exported DMA-BUF file descriptor.
    handle: i32,
    /// OUTPUT: VideoCore handle.
    vc_handle: u32,
    /// OUTPUT: bus address of the buffer.
    dma_addr: u64,
}

/// VC_SM_CMA_IOCTL_MEM_ALLOC: _IOR('J', 0x5A, struct vc_sm_cma_ioctl_alloc)
const VC_SM_CMA_IOCTL_MEM_ALLOC: libc::c_ulong = ior(
    VC_SM_CMA_MAGIC_TYPE,
    VC_SM_CMA_CMD_ALLOC,
    std::mem::size_of::<VcSmCmaIoctlAlloc>(),
);

/// A live buffer: the DMA-BUF keeps the CMA memory alive until closed.
struct MappedBuffer {
    dmabuf: OwnedFd,
    ptr: NonNull<u8>,
    len: usize,
}

/// Shared-memory backend talking to `/dev/vcsm-cma`.
///
/// The device is opened by [`subsystem_init`](SharedMemoryBackend::subsystem_init)
/// and closed by [`subsystem_exit`](SharedMemoryBackend::subsystem_exit).
pub struct VcsmBackend {
    path: PathBuf,
    device: Option<OwnedFd>,
    buffers: HashMap<u32, MappedBuffer>,
}

impl VcsmBackend {
    /// Create a backend for the device named in `config`.
    pub fn new(config: &DeviceConfig) -> Self {
        Self {
            path: config.vcsm_path.clone(),
            device: None,
            buffers: HashMap::new(),
        }
    }

    /// Whether the device is currently open.
    pub fn is_open(&self) -> bool {
        self.device.is_some()
    }

    /// Number of buffers currently mapped through this backend.
    pub fn live_buffers(&self) -> usize {
        self.buffers.len()
    }
}

impl SharedMemoryBackend for VcsmBackend {
    fn subsystem_init(&mut self) -> BackendResult<()> {
        if self.device.is_none() {
            self.device = Some(open_device(&self.path)?);
            tracing::debug!(path = %self.path.display(), "opened shared-memory device");
        }
        Ok(())
    }

    fn subsystem_exit(&mut self) {
        if !self.buffers.is_empty() {
            tracing::warn!(
                live = self.buffers.len(),
                "shared-memory subsystem exiting with mapped buffers"
            );
        }
        for (_, buffer) in self.buffers.drain() {
            unsafe {
                let _ = rustix::mm::munmap(buffer.ptr.as_ptr().cast(), buffer.len);
            }
            drop(buffer.dmabuf);
        }
        self.device = None;
    }

    fn allocate(
        &mut self,
        size: usize,
        align: usize,
        cache: CacheMode,
    ) -> BackendResult<BackendAllocation> {
        let device = self
            .device
            .as_ref()
            .ok_or_else(|| BackendError::Unsupported("shared-memory device not open".into()))?;

        let page = rustix::param::page_size();
        if align > page {
            return Err(BackendError::Unsupported(format!(
                "alignment {} exceeds page size {}",
                align, page
            )));
        }
        let len = page_round_up(size, page);
        let request_size = u32::try_from(len)
            .map_err(|_| BackendError::Unsupported(format!("size {} too large", size)))?;

        let mut name = [0u8; VC_SM_CMA_RESOURCE_NAME];
        name[..RESOURCE_NAME.len()].copy_from_slice(RESOURCE_NAME);

        let mut req = VcSmCmaIoctlAlloc {
            size: request_size,
            num: 1,
            cached: cache.as_raw(),
            pad: 0,
            name,
            handle: -1,
            vc_handle: 0,
            dma_addr: 0,
        };

        // SAFETY: the device fd is open and `req` is a properly initialized
        // vc_sm_cma_ioctl_alloc that outlives the call.
        let ret = unsafe { libc::ioctl(device.as_raw_fd(), VC_SM_CMA_IOCTL_MEM_ALLOC, &mut req) };
        if ret < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        if req.handle < 0 {
            return Err(BackendError::Unsupported(
                "driver returned no dma-buf".into(),
            ));
        }

        // SAFETY: on success the driver hands us a fresh DMA-BUF fd.
        let dmabuf = unsafe { OwnedFd::from_raw_fd(req.handle) };

        let bus_addr = u32::try_from(req.dma_addr).map_err(|_| {
            BackendError::Unsupported(format!("dma address {:#x} out of range", req.dma_addr))
        })?;

        let ptr = unsafe {
            rustix::mm::mmap(
                std::ptr::null_mut(),
                len,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &dmabuf,
                0,
            )?
        };
        let ptr = NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| BackendError::Unsupported("mmap returned null".into()))?;

        let allocation = BackendAllocation {
            handle: AllocHandle(req.vc_handle),
            bus_addr: BusAddr(bus_addr),
            user_addr: UserAddr::from_ptr(ptr.as_ptr()),
        };
        self.buffers
            .insert(req.vc_handle, MappedBuffer { dmabuf, ptr, len });

        tracing::trace!(
            handle = req.vc_handle,
            bus = %allocation.bus_addr,
            len,
            "vcsm buffer mapped"
        );
        Ok(allocation)
    }

    fn release(&mut self, handle: AllocHandle, user_addr: UserAddr) -> BackendResult<()> {
        let buffer = self
            .buffers
            .remove(&handle.0)
            .ok_or(BackendError::UnknownHandle(handle.0))?;

        if UserAddr::from_ptr(buffer.ptr.as_ptr()) != user_addr {
            let mapped = UserAddr::from_ptr(buffer.ptr.as_ptr());
            self.buffers.insert(handle.0, buffer);
            return Err(BackendError::Unsupported(format!(
                "handle {} is mapped at {}, not {}",
                handle, mapped, user_addr
            )));
        }

        let unmapped = unsafe { rustix::mm::munmap(buffer.ptr.as_ptr().cast(), buffer.len) };
        // Closing the DMA-BUF drops the last reference to the CMA buffer
        super::close_fd(buffer.dmabuf)?;
        unmapped?;
        Ok(())
    }
}

// SAFETY: the mapped pointers are only dereferenced by callers; the backend
// itself just hands them to munmap, which is valid from any thread.
unsafe impl Send for VcsmBackend {}

impl Drop for VcsmBackend {
    fn drop(&mut self) {
        if self.device.is_some() || !self.buffers.is_empty() {
            self.subsystem_exit();
        }
    }
}

impl std::fmt::Debug for VcsmBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VcsmBackend")
            .field("path", &self.path)
            .field("open", &self.device.is_some())
            .field("live_buffers", &self.buffers.len())
            .finish()
    }
}
