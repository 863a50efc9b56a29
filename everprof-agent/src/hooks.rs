//! Allocator interposition.
//!
//! Each entry point resolves the next definition in link order once, calls
//! it, and feeds the result to the tracker. Nothing here may allocate
//! through the interposed symbols while resolution is in flight; `calloc`
//! gets a static bootstrap arena because glibc's `dlsym` calls it.

use std::ffi::CStr;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use libc::{c_void, size_t};

use crate::tracker;

static REAL_MALLOC: AtomicUsize = AtomicUsize::new(0);
static REAL_FREE: AtomicUsize = AtomicUsize::new(0);
static REAL_CALLOC: AtomicUsize = AtomicUsize::new(0);
static REAL_REALLOC: AtomicUsize = AtomicUsize::new(0);
static REAL_POSIX_MEMALIGN: AtomicUsize = AtomicUsize::new(0);
static REAL_ALIGNED_ALLOC: AtomicUsize = AtomicUsize::new(0);

unsafe fn resolve(cache: &AtomicUsize, name: &CStr) -> usize {
    let cached = cache.load(Ordering::Relaxed);
    if cached != 0 {
        return cached;
    }
    let addr = libc::dlsym(libc::RTLD_NEXT, name.as_ptr()) as usize;
    cache.store(addr, Ordering::Relaxed);
    addr
}

/// Arena serving `calloc` while `dlsym` is still resolving it.
const BOOTSTRAP_SIZE: usize = 8192;
static mut BOOTSTRAP_ARENA: [u8; BOOTSTRAP_SIZE] = [0; BOOTSTRAP_SIZE];
static BOOTSTRAP_USED: AtomicUsize = AtomicUsize::new(0);
static CALLOC_RESOLVING: AtomicBool = AtomicBool::new(false);

unsafe fn bootstrap_alloc(size: usize) -> *mut c_void {
    let size = (size + 15) & !15;
    let offset = BOOTSTRAP_USED.fetch_add(size, Ordering::Relaxed);
    if offset + size > BOOTSTRAP_SIZE {
        return ptr::null_mut();
    }
    let base = ptr::addr_of_mut!(BOOTSTRAP_ARENA) as *mut u8;
    base.add(offset) as *mut c_void
}

unsafe fn is_bootstrap_ptr(ptr: *mut c_void) -> bool {
    let base = ptr::addr_of!(BOOTSTRAP_ARENA) as usize;
    let addr = ptr as usize;
    addr >= base && addr < base + BOOTSTRAP_SIZE
}

#[no_mangle]
pub unsafe extern "C" fn malloc(size: size_t) -> *mut c_void {
    let real = resolve(&REAL_MALLOC, c"malloc");
    if real == 0 {
        return ptr::null_mut();
    }
    let real: unsafe extern "C" fn(size_t) -> *mut c_void = std::mem::transmute(real);
    let ptr = real(size);
    if !ptr.is_null() {
        tracker::track_allocation(ptr as u64, size as u64);
    }
    ptr
}

#[no_mangle]
pub unsafe extern "C" fn calloc(nmemb: size_t, size: size_t) -> *mut c_void {
    if REAL_CALLOC.load(Ordering::Relaxed) == 0 {
        if CALLOC_RESOLVING.swap(true, Ordering::Relaxed) {
            // dlsym reentered us; serve it from the arena.
            return bootstrap_alloc(nmemb.saturating_mul(size));
        }
        resolve(&REAL_CALLOC, c"calloc");
        CALLOC_RESOLVING.store(false, Ordering::Relaxed);
    }
    let real = REAL_CALLOC.load(Ordering::Relaxed);
    if real == 0 {
        return ptr::null_mut();
    }
    let real: unsafe extern "C" fn(size_t, size_t) -> *mut c_void = std::mem::transmute(real);
    let ptr = real(nmemb, size);
    if !ptr.is_null() {
        tracker::track_allocation(ptr as u64, nmemb.saturating_mul(size) as u64);
    }
    ptr
}

#[no_mangle]
pub unsafe extern "C" fn free(ptr: *mut c_void) {
    if ptr.is_null() || is_bootstrap_ptr(ptr) {
        return;
    }
    let real = resolve(&REAL_FREE, c"free");
    if real == 0 {
        return;
    }
    tracker::track_deallocation(ptr as u64);
    let real: unsafe extern "C" fn(*mut c_void) = std::mem::transmute(real);
    real(ptr);
}

#[no_mangle]
pub unsafe extern "C" fn realloc(old: *mut c_void, size: size_t) -> *mut c_void {
    let real = resolve(&REAL_REALLOC, c"realloc");
    if real == 0 {
        return ptr::null_mut();
    }
    let real: unsafe extern "C" fn(*mut c_void, size_t) -> *mut c_void = std::mem::transmute(real);
    let new = real(old, size);
    if !new.is_null() {
        if !old.is_null() {
            tracker::track_deallocation(old as u64);
        }
        if size > 0 {
            tracker::track_allocation(new as u64, size as u64);
        }
    }
    new
}

#[no_mangle]
pub unsafe extern "C" fn posix_memalign(
    out: *mut *mut c_void,
    alignment: size_t,
    size: size_t,
) -> i32 {
    let real = resolve(&REAL_POSIX_MEMALIGN, c"posix_memalign");
    if real == 0 {
        return libc::ENOMEM;
    }
    let real: unsafe extern "C" fn(*mut *mut c_void, size_t, size_t) -> i32 =
        std::mem::transmute(real);
    let rc = real(out, alignment, size);
    if rc == 0 && !(*out).is_null() {
        tracker::track_allocation(*out as u64, size as u64);
    }
    rc
}

#[no_mangle]
pub unsafe extern "C" fn aligned_alloc(alignment: size_t, size: size_t) -> *mut c_void {
    let real = resolve(&REAL_ALIGNED_ALLOC, c"aligned_alloc");
    if real == 0 {
        return ptr::null_mut();
    }
    let real: unsafe extern "C" fn(size_t, size_t) -> *mut c_void = std::mem::transmute(real);
    let ptr = real(alignment, size);
    if !ptr.is_null() {
        tracker::track_allocation(ptr as u64, size as u64);
    }
    ptr
}
