//! Registered memory pool.
//!
//! Serves page-rounded blocks out of large regions registered with the
//! protection domain (`LOCAL_WRITE | REMOTE_WRITE`), so every block handed
//! out is immediately usable as a local scatter entry or a remote landing
//! area. Freed blocks go to exact-size free lists; when the current region
//! is exhausted a fresh one is allocated and registered. Registration
//! failure is unrecoverable hardware state and aborts.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use rdma_sys::*;

/// Granularity of new region allocations (64 MB).
const REGION_BYTES: usize = 1 << 26;

/// System page size.
pub fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

struct Region {
    base: u64,
    len: usize,
    mr: *mut ibv_mr,
}

/// Carving state, independent of registration so it can be exercised
/// without a device.
struct Arena {
    /// Regions keyed by exclusive end address, for owner lookup.
    regions: BTreeMap<u64, Region>,
    /// Free blocks by exact size.
    free: HashMap<usize, Vec<u64>>,
    /// Live blocks and their sizes.
    used: HashMap<u64, usize>,
    /// Bump pointer in the newest region.
    tail: u64,
    tail_end: u64,
}

impl Arena {
    fn new() -> Self {
        Self {
            regions: BTreeMap::new(),
            free: HashMap::new(),
            used: HashMap::new(),
            tail: 0,
            tail_end: 0,
        }
    }

    /// Adds a region and makes it the bump target. Any unused remainder of
    /// the previous region stays behind its free blocks.
    fn add_region(&mut self, base: u64, len: usize, mr: *mut ibv_mr) {
        self.tail = base;
        self.tail_end = base + len as u64;
        self.regions.insert(base + len as u64, Region { base, len, mr });
    }

    /// Allocates `size` bytes (caller pre-rounds to page size).
    fn alloc(&mut self, size: usize) -> Option<u64> {
        if let Some(list) = self.free.get_mut(&size) {
            if let Some(ptr) = list.pop() {
                self.used.insert(ptr, size);
                return Some(ptr);
            }
        }
        if self.tail + size as u64 <= self.tail_end {
            let ptr = self.tail;
            self.tail += size as u64;
            self.used.insert(ptr, size);
            return Some(ptr);
        }
        None
    }

    fn free(&mut self, ptr: u64) {
        let size = self
            .used
            .remove(&ptr)
            .unwrap_or_else(|| panic!("free of unknown block {:#x}", ptr));
        self.free.entry(size).or_default().push(ptr);
    }

    /// The region containing `addr`, if any.
    fn find(&self, addr: u64) -> Option<&Region> {
        let (_, region) = self.regions.range(addr + 1..).next()?;
        (region.base <= addr).then_some(region)
    }
}

/// A registered mempool bound to one protection domain.
pub struct Mempool {
    pd: *mut ibv_pd,
    arena: Mutex<Arena>,
    page: usize,
}

unsafe impl Send for Mempool {}
unsafe impl Sync for Mempool {}

impl Mempool {
    pub fn new(pd: *mut ibv_pd) -> Self {
        assert!(!pd.is_null());
        Self {
            pd,
            arena: Mutex::new(Arena::new()),
            page: page_size(),
        }
    }

    /// Allocates at least `n` bytes, rounded up to the page size.
    pub fn alloc(&self, n: usize) -> *mut u8 {
        let size = crate::encoding::align_ceil(n.max(1), self.page);
        let mut arena = self.arena.lock().unwrap();
        if let Some(ptr) = arena.alloc(size) {
            return ptr as usize as *mut u8;
        }

        let region_len = size.max(REGION_BYTES);
        let layout = Layout::from_size_align(region_len, self.page)
            .expect("mempool region layout");
        let base = unsafe { alloc_zeroed(layout) };
        assert!(!base.is_null(), "mempool region allocation failed");

        let access = ibv_access_flags::IBV_ACCESS_LOCAL_WRITE.0
            | ibv_access_flags::IBV_ACCESS_REMOTE_WRITE.0;
        let mr = unsafe {
            ibv_reg_mr(
                self.pd,
                base as *mut libc::c_void,
                region_len,
                access as i32,
            )
        };
        assert!(
            !mr.is_null(),
            "memory registration failed: {}",
            std::io::Error::last_os_error()
        );

        arena.add_region(base as u64, region_len, mr);
        let ptr = arena.alloc(size).expect("fresh region must satisfy alloc");
        ptr as usize as *mut u8
    }

    /// Returns a block obtained from [`alloc`](Self::alloc).
    pub fn free(&self, ptr: *mut u8) {
        self.arena.lock().unwrap().free(ptr as u64);
    }

    /// Local key of the region containing `ptr`.
    pub fn local_key(&self, ptr: *const u8) -> u32 {
        let arena = self.arena.lock().unwrap();
        let region = arena
            .find(ptr as u64)
            .unwrap_or_else(|| panic!("address {:p} is not in the mempool", ptr));
        unsafe { (*region.mr).lkey }
    }

    /// Remote key of the region containing `ptr`.
    pub fn remote_key(&self, ptr: *const u8) -> u32 {
        let arena = self.arena.lock().unwrap();
        let region = arena
            .find(ptr as u64)
            .unwrap_or_else(|| panic!("address {:p} is not in the mempool", ptr));
        unsafe { (*region.mr).rkey }
    }

    pub fn pd(&self) -> *mut ibv_pd {
        self.pd
    }
}

impl Drop for Mempool {
    fn drop(&mut self) {
        let arena = self.arena.get_mut().unwrap();
        for (_, region) in std::mem::take(&mut arena.regions) {
            unsafe {
                ibv_dereg_mr(region.mr);
                let layout = Layout::from_size_align(region.len, self.page)
                    .expect("mempool region layout");
                dealloc(region.base as usize as *mut u8, layout);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: u64 = 4096;

    fn arena_with_region(pages: u64) -> Arena {
        let mut arena = Arena::new();
        // Synthetic region; the carving logic never dereferences it.
        arena.add_region(PAGE * 100, (pages * PAGE) as usize, std::ptr::null_mut());
        arena
    }

    #[test]
    fn bump_allocation_is_disjoint() {
        let mut arena = arena_with_region(4);
        let a = arena.alloc(PAGE as usize).unwrap();
        let b = arena.alloc(PAGE as usize).unwrap();
        let c = arena.alloc(2 * PAGE as usize).unwrap();
        assert_eq!(b, a + PAGE);
        assert_eq!(c, b + PAGE);
        assert!(arena.alloc(PAGE as usize).is_none());
    }

    #[test]
    fn freed_blocks_are_reused_by_size() {
        let mut arena = arena_with_region(4);
        let a = arena.alloc(2 * PAGE as usize).unwrap();
        let _b = arena.alloc(2 * PAGE as usize).unwrap();
        arena.free(a);
        // Exhausted bump space; the freed 2-page block satisfies the
        // same-size request.
        assert_eq!(arena.alloc(2 * PAGE as usize), Some(a));
        // A different size cannot use it.
        assert!(arena.alloc(PAGE as usize).is_none());
    }

    #[test]
    fn find_resolves_owner_region() {
        let mut arena = Arena::new();
        arena.add_region(0x10000, 0x1000, std::ptr::null_mut());
        arena.add_region(0x30000, 0x2000, std::ptr::null_mut());

        assert_eq!(arena.find(0x10000).map(|r| r.base), Some(0x10000));
        assert_eq!(arena.find(0x10fff).map(|r| r.base), Some(0x10000));
        assert_eq!(arena.find(0x31000).map(|r| r.base), Some(0x30000));
        assert!(arena.find(0xffff).is_none());
        assert!(arena.find(0x11000).is_none());
        assert!(arena.find(0x32000).is_none());
    }

    #[test]
    #[should_panic(expected = "free of unknown block")]
    fn double_free_panics() {
        let mut arena = arena_with_region(2);
        let a = arena.alloc(PAGE as usize).unwrap();
        arena.free(a);
        arena.free(a);
    }
}
