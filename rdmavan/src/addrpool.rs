//! Address pool: compact indices for in-flight receive buffers.
//!
//! A one-sided write cannot name its landing buffer in the completion, so the
//! sender embeds a 32-bit pool index in the immediate and the receiver maps
//! it back to the buffer context it reserved at rendezvous time. Indices are
//! recycled FIFO to keep reuse windows wide for debugging.

use std::collections::VecDeque;
use std::sync::Mutex;

/// Default pool capacity. Must dominate the number of concurrently live
/// receive buffers; overflow is a sizing bug and fatal.
pub const ADDRESS_POOL_SIZE: usize = 512;

pub struct AddressPool<T> {
    inner: Mutex<State<T>>,
}

struct State<T> {
    table: Vec<*mut T>,
    free: VecDeque<u32>,
}

unsafe impl<T> Send for AddressPool<T> {}
unsafe impl<T> Sync for AddressPool<T> {}

impl<T> AddressPool<T> {
    pub fn new() -> Self {
        Self::with_capacity(ADDRESS_POOL_SIZE)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(State {
                table: vec![std::ptr::null_mut(); capacity],
                free: (0..capacity as u32).collect(),
            }),
        }
    }

    /// Stores `ptr` in a free slot and returns its index.
    ///
    /// Panics when the pool is exhausted: capacity must be sized above the
    /// peak number of in-flight receives.
    pub fn store(&self, ptr: *mut T) -> u32 {
        assert!(!ptr.is_null());
        let mut state = self.inner.lock().unwrap();
        let capacity = state.table.len();
        let idx = state
            .free
            .pop_front()
            .unwrap_or_else(|| panic!("address pool exhausted ({} slots)", capacity));
        debug_assert!(state.table[idx as usize].is_null());
        state.table[idx as usize] = ptr;
        idx
    }

    /// Returns the pointer stored at `idx` without releasing the slot.
    ///
    /// Steady-state one-sided writes re-deliver into the same slot for the
    /// lifetime of the connection, so receipt must not free it.
    pub fn get(&self, idx: u32) -> *mut T {
        let state = self.inner.lock().unwrap();
        let ptr = state.table[idx as usize];
        assert!(!ptr.is_null(), "address pool slot {} is empty", idx);
        ptr
    }

    /// Takes the pointer stored at `idx`, freeing the slot for reuse.
    pub fn take(&self, idx: u32) -> *mut T {
        let mut state = self.inner.lock().unwrap();
        let ptr = state.table[idx as usize];
        assert!(!ptr.is_null(), "address pool slot {} is empty", idx);
        state.table[idx as usize] = std::ptr::null_mut();
        state.free.push_back(idx);
        ptr
    }
}

impl<T> Default for AddressPool<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn marker(n: usize) -> *mut u32 {
        n as *mut u32
    }

    #[test]
    fn store_take_roundtrip() {
        let pool: AddressPool<u32> = AddressPool::with_capacity(4);
        let idx = pool.store(marker(0x1000));
        assert_eq!(pool.get(idx), marker(0x1000));
        assert_eq!(pool.take(idx), marker(0x1000));
    }

    #[test]
    fn live_indices_are_unique() {
        let pool: AddressPool<u32> = AddressPool::with_capacity(8);
        let indices: Vec<u32> = (1..=8).map(|n| pool.store(marker(n))).collect();
        let mut sorted = indices.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), indices.len());
    }

    #[test]
    fn indices_recycle_fifo() {
        let pool: AddressPool<u32> = AddressPool::with_capacity(4);
        let a = pool.store(marker(1));
        let b = pool.store(marker(2));
        pool.take(a);
        pool.take(b);
        // Remaining fresh indices are handed out before the recycled ones.
        let c = pool.store(marker(3));
        let d = pool.store(marker(4));
        assert_eq!(pool.store(marker(5)), a);
        assert_eq!(pool.store(marker(6)), b);
        let _ = (c, d);
    }

    #[test]
    #[should_panic(expected = "address pool exhausted")]
    fn overflow_panics() {
        let pool: AddressPool<u32> = AddressPool::with_capacity(2);
        pool.store(marker(1));
        pool.store(marker(2));
        pool.store(marker(3));
    }

    #[test]
    #[should_panic(expected = "slot 0 is empty")]
    fn take_of_empty_slot_panics() {
        let pool: AddressPool<u32> = AddressPool::with_capacity(2);
        pool.take(0);
    }
}
