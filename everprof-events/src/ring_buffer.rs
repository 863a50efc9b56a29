use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::ptr;
use std::sync::atomic::{AtomicU32, AtomicU64};

use libc::{c_void, off_t};

pub const PAGE_SIZE: usize = 4096;

/// Which producer discipline a shared ring buffer uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum RingBufferKind {
    /// Single writer, single reader, perf-style head/tail counters.
    Perf = 0,
    /// Many user-space writers behind a spinlock, single reader.
    Mpsc = 1,
}

impl RingBufferKind {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(RingBufferKind::Perf),
            1 => Some(RingBufferKind::Mpsc),
            _ => None,
        }
    }
}

/// What the profiler tells the agent about a ring buffer during the
/// handshake. The two file descriptors travel separately via `SCM_RIGHTS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingBufferInfo {
    pub mem_size: i64,
    pub ring_buffer_type: u32,
    pub allocation_interval: u64,
}

/// Metadata page of the perf variant, laid out compatibly with the kernel's
/// `perf_event_mmap_page` so the same reader works against kernel-mapped
/// buffers. `data_head` sits at byte offset 1024.
#[repr(C)]
pub struct PerfEventMmapPage {
    pub version: u32,
    pub compat_version: u32,
    pub lock: u32,
    pub index: u32,
    pub offset: i64,
    pub time_enabled: u64,
    pub time_running: u64,
    pub capabilities: u64,
    pub pmc_width: u16,
    pub time_shift: u16,
    pub time_mult: u32,
    pub time_offset: u64,
    pub time_zero: u64,
    pub size: u32,
    pub reserved: [u8; 118 * 8 + 4],
    pub data_head: u64,
    pub data_tail: u64,
    pub data_offset: u64,
    pub data_size: u64,
    pub aux_head: u64,
    pub aux_tail: u64,
    pub aux_offset: u64,
    pub aux_size: u64,
}

/// Metadata page of the MPSC variant.
#[repr(C)]
pub struct MpscMetadataPage {
    pub head: u64,
    pub tail: u64,
    pub spinlock: u32,
    pub ring_buffer_type: u32,
    pub mask: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum RingBufferError {
    #[error("memfd_create failed: {0}")]
    MemfdCreate(#[source] io::Error),
    #[error("ftruncate failed: {0}")]
    Truncate(#[source] io::Error),
    #[error("eventfd failed: {0}")]
    Eventfd(#[source] io::Error),
    #[error("mmap failed: {0}")]
    Mmap(#[source] io::Error),
    #[error("ring buffer size {0} is not a power-of-two page multiple")]
    BadSize(usize),
    #[error("unknown ring buffer type {0}")]
    BadKind(u32),
}

/// A shared ring buffer: one metadata page followed by `2^k` data pages,
/// with the data pages mapped a second time immediately after themselves so
/// that a record wrapping the end of the buffer stays contiguous.
pub struct RingBuffer {
    base: *mut u8,
    data_size: u64,
    kind: RingBufferKind,
    ring_fd: OwnedFd,
    event_fd: OwnedFd,
}

// The raw pointers refer to a shared mapping owned by this value. All
// mutation of the mapping goes through atomics or regions reserved under
// the head/tail protocol, so sharing across threads is sound as long as the
// single-consumer discipline is upheld.
unsafe impl Send for RingBuffer {}
unsafe impl Sync for RingBuffer {}

impl RingBuffer {
    /// Create a memfd-backed ring buffer with `2^page_order` data pages.
    pub fn create(page_order: u32, kind: RingBufferKind) -> Result<Self, RingBufferError> {
        let data_size = PAGE_SIZE << page_order;
        let file_size = PAGE_SIZE + data_size;

        let ring_fd = unsafe {
            let fd = libc::memfd_create(
                c"everprof-ring-buffer".as_ptr(),
                libc::MFD_CLOEXEC,
            );
            if fd < 0 {
                return Err(RingBufferError::MemfdCreate(io::Error::last_os_error()));
            }
            OwnedFd::from_raw_fd(fd)
        };
        let rc = unsafe { libc::ftruncate(ring_fd.as_raw_fd(), file_size as off_t) };
        if rc < 0 {
            return Err(RingBufferError::Truncate(io::Error::last_os_error()));
        }

        let event_fd = unsafe {
            let fd = libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK);
            if fd < 0 {
                return Err(RingBufferError::Eventfd(io::Error::last_os_error()));
            }
            OwnedFd::from_raw_fd(fd)
        };

        let base = map_double(ring_fd.as_raw_fd(), data_size)?;
        let rb = RingBuffer {
            base,
            data_size: data_size as u64,
            kind,
            ring_fd,
            event_fd,
        };
        rb.init_metadata();
        Ok(rb)
    }

    /// Map a ring buffer created by the peer process from the fds and size it
    /// sent during the handshake.
    pub fn attach(
        ring_fd: OwnedFd,
        event_fd: OwnedFd,
        mem_size: usize,
        kind: RingBufferKind,
    ) -> Result<Self, RingBufferError> {
        if mem_size <= PAGE_SIZE {
            return Err(RingBufferError::BadSize(mem_size));
        }
        let data_size = mem_size - PAGE_SIZE;
        if !data_size.is_power_of_two() || data_size % PAGE_SIZE != 0 {
            return Err(RingBufferError::BadSize(mem_size));
        }
        let base = map_double(ring_fd.as_raw_fd(), data_size)?;
        Ok(RingBuffer {
            base,
            data_size: data_size as u64,
            kind,
            ring_fd,
            event_fd,
        })
    }

    fn init_metadata(&self) {
        unsafe {
            // The file starts zeroed; only non-zero fields need stores.
            match self.kind {
                RingBufferKind::Perf => {
                    let page = &mut *(self.base as *mut PerfEventMmapPage);
                    page.data_offset = PAGE_SIZE as u64;
                    page.data_size = self.data_size;
                }
                RingBufferKind::Mpsc => {
                    let page = &mut *(self.base as *mut MpscMetadataPage);
                    page.ring_buffer_type = RingBufferKind::Mpsc as u32;
                    page.mask = self.data_size - 1;
                }
            }
        }
    }

    pub fn kind(&self) -> RingBufferKind {
        self.kind
    }

    pub fn data_size(&self) -> u64 {
        self.data_size
    }

    pub fn mask(&self) -> u64 {
        self.data_size - 1
    }

    /// First byte of the (double-mapped) data region.
    pub(crate) fn data_ptr(&self) -> *mut u8 {
        unsafe { self.base.add(PAGE_SIZE) }
    }

    pub(crate) fn perf_head(&self) -> &AtomicU64 {
        unsafe {
            let page = self.base as *mut PerfEventMmapPage;
            AtomicU64::from_ptr(ptr::addr_of_mut!((*page).data_head))
        }
    }

    pub(crate) fn perf_tail(&self) -> &AtomicU64 {
        unsafe {
            let page = self.base as *mut PerfEventMmapPage;
            AtomicU64::from_ptr(ptr::addr_of_mut!((*page).data_tail))
        }
    }

    pub(crate) fn mpsc_head(&self) -> &AtomicU64 {
        unsafe {
            let page = self.base as *mut MpscMetadataPage;
            AtomicU64::from_ptr(ptr::addr_of_mut!((*page).head))
        }
    }

    pub(crate) fn mpsc_tail(&self) -> &AtomicU64 {
        unsafe {
            let page = self.base as *mut MpscMetadataPage;
            AtomicU64::from_ptr(ptr::addr_of_mut!((*page).tail))
        }
    }

    /// The MPSC producer spinlock word. Public so tests can hold the lock
    /// from outside a writer.
    pub fn mpsc_spinlock(&self) -> &AtomicU32 {
        unsafe {
            let page = self.base as *mut MpscMetadataPage;
            AtomicU32::from_ptr(ptr::addr_of_mut!((*page).spinlock))
        }
    }

    pub fn info(&self, allocation_interval: u64) -> RingBufferInfo {
        RingBufferInfo {
            mem_size: (PAGE_SIZE as u64 + self.data_size) as i64,
            ring_buffer_type: self.kind as u32,
            allocation_interval,
        }
    }

    pub fn ring_fd(&self) -> BorrowedFd<'_> {
        self.ring_fd.as_fd()
    }

    pub fn event_fd(&self) -> BorrowedFd<'_> {
        self.event_fd.as_fd()
    }

    /// Wake the consumer. Fire-and-forget: losing the wake is fine because
    /// the next committed record re-triggers it.
    pub fn notify(&self) {
        let value: u64 = 1;
        unsafe {
            libc::write(
                self.event_fd.as_raw_fd(),
                &value as *const u64 as *const c_void,
                8,
            );
        }
    }

    /// Reset the eventfd counter after an epoll wake.
    pub fn drain_notifications(&self) {
        let mut value: u64 = 0;
        unsafe {
            libc::read(
                self.event_fd.as_raw_fd(),
                &mut value as *mut u64 as *mut c_void,
                8,
            );
        }
    }
}

impl Drop for RingBuffer {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(
                self.base as *mut c_void,
                PAGE_SIZE + 2 * self.data_size as usize,
            );
        }
    }
}

/// Reserve one contiguous region, then map the file's metadata+data pages at
/// its start and the data pages a second time right after, so byte
/// `i & mask` of the data region is also readable at `data_size + (i & mask)`.
fn map_double(fd: i32, data_size: usize) -> Result<*mut u8, RingBufferError> {
    let total = PAGE_SIZE + 2 * data_size;
    unsafe {
        let base = libc::mmap(
            ptr::null_mut(),
            total,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
            -1,
            0,
        );
        if base == libc::MAP_FAILED {
            return Err(RingBufferError::Mmap(io::Error::last_os_error()));
        }
        let base = base as *mut u8;

        let first = libc::mmap(
            base as *mut c_void,
            PAGE_SIZE + data_size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED | libc::MAP_FIXED,
            fd,
            0,
        );
        if first == libc::MAP_FAILED {
            let err = io::Error::last_os_error();
            libc::munmap(base as *mut c_void, total);
            return Err(RingBufferError::Mmap(err));
        }

        let second = libc::mmap(
            base.add(PAGE_SIZE + data_size) as *mut c_void,
            data_size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED | libc::MAP_FIXED,
            fd,
            PAGE_SIZE as off_t,
        );
        if second == libc::MAP_FAILED {
            let err = io::Error::last_os_error();
            libc::munmap(base as *mut c_void, total);
            return Err(RingBufferError::Mmap(err));
        }

        Ok(base)
    }
}
