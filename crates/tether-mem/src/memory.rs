//! Shared linear memory region.
//!
//! All execution contexts share one [`LinearMemory`]; cloning it clones the handle, not the
//! bytes. Plain byte access is unsynchronized (the same contract as a `SharedArrayBuffer` viewed
//! through a `Uint8Array`): callers coordinate through the atomic words and the wait/notify
//! primitives below.

use core::ops::Range;
use core::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::error::MemoryError;

/// Result of [`LinearMemory::wait_i32`], mirroring the strings returned by `Atomics.wait`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Woken by a matching [`LinearMemory::notify`] (`"ok"`).
    Woken,
    /// The word did not hold the expected value when the wait started (`"not-equal"`).
    NotEqual,
    /// The timeout elapsed before a notify arrived (`"timed-out"`).
    TimedOut,
}

#[derive(Clone)]
pub struct LinearMemory {
    inner: Arc<MemoryInner>,
}

struct MemoryInner {
    len: usize,
    data_ptr: *mut u8,
    // Backed by `u64`s so the base pointer is 8-byte aligned; offsets then carry the alignment
    // of typed views and atomic words.
    _storage: Box<[u64]>,
    waiters: WaitTable,
}

// The raw pointer only ever addresses `_storage`, which lives as long as the `Arc`.
unsafe impl Send for MemoryInner {}
unsafe impl Sync for MemoryInner {}

impl LinearMemory {
    /// Zeroed memory of `len_bytes` bytes. The size must be nonzero and addressable with
    /// 32-bit offsets.
    pub fn new(len_bytes: usize) -> Result<Self, MemoryError> {
        if len_bytes == 0 || len_bytes > u32::MAX as usize {
            return Err(MemoryError::InvalidSize(len_bytes));
        }
        let words = len_bytes.div_ceil(8);
        let mut storage = vec![0u64; words].into_boxed_slice();
        let data_ptr = storage.as_mut_ptr().cast::<u8>();
        Ok(Self {
            inner: Arc::new(MemoryInner {
                len: len_bytes,
                data_ptr,
                _storage: storage,
                waiters: WaitTable::default(),
            }),
        })
    }

    pub fn len(&self) -> usize {
        self.inner.len
    }

    pub fn is_empty(&self) -> bool {
        self.inner.len == 0
    }

    /// Whether both handles refer to the same region.
    pub fn same_region(&self, other: &LinearMemory) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn check_range(&self, ptr: u32, len: usize) -> Result<Range<usize>, MemoryError> {
        let start = ptr as usize;
        match start.checked_add(len) {
            Some(end) if end <= self.inner.len => Ok(start..end),
            _ => Err(MemoryError::OutOfBounds {
                ptr,
                len,
                memory_len: self.inner.len,
            }),
        }
    }

    pub fn read(&self, ptr: u32, out: &mut [u8]) -> Result<(), MemoryError> {
        let range = self.check_range(ptr, out.len())?;
        unsafe {
            core::ptr::copy_nonoverlapping(
                self.inner.data_ptr.add(range.start),
                out.as_mut_ptr(),
                out.len(),
            );
        }
        Ok(())
    }

    pub fn read_vec(&self, ptr: u32, len: usize) -> Result<Vec<u8>, MemoryError> {
        let mut out = vec![0u8; len];
        self.read(ptr, &mut out)?;
        Ok(out)
    }

    pub fn write(&self, ptr: u32, data: &[u8]) -> Result<(), MemoryError> {
        let range = self.check_range(ptr, data.len())?;
        unsafe {
            core::ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.inner.data_ptr.add(range.start),
                data.len(),
            );
        }
        Ok(())
    }

    /// `memmove` inside the region (used by message reallocation).
    pub fn copy_within(&self, src: u32, dst: u32, len: usize) -> Result<(), MemoryError> {
        let src = self.check_range(src, len)?;
        let dst = self.check_range(dst, len)?;
        unsafe {
            core::ptr::copy(
                self.inner.data_ptr.add(src.start),
                self.inner.data_ptr.add(dst.start),
                len,
            );
        }
        Ok(())
    }

    pub fn read_u32(&self, ptr: u32) -> Result<u32, MemoryError> {
        let mut tmp = [0u8; 4];
        self.read(ptr, &mut tmp)?;
        Ok(u32::from_le_bytes(tmp))
    }

    pub fn write_u32(&self, ptr: u32, value: u32) -> Result<(), MemoryError> {
        self.write(ptr, &value.to_le_bytes())
    }

    pub fn atomic_u32(&self, ptr: u32) -> Result<&AtomicU32, MemoryError> {
        let range = self.check_aligned_word(ptr)?;
        Ok(unsafe { &*self.inner.data_ptr.add(range.start).cast::<AtomicU32>() })
    }

    pub fn atomic_i32(&self, ptr: u32) -> Result<&AtomicI32, MemoryError> {
        let range = self.check_aligned_word(ptr)?;
        Ok(unsafe { &*self.inner.data_ptr.add(range.start).cast::<AtomicI32>() })
    }

    /// Block the calling thread while the `i32` at `ptr` equals `expected`.
    ///
    /// Semantics follow `Atomics.wait`: the comparison and the enqueue happen atomically with
    /// respect to [`LinearMemory::notify`], so a store followed by a notify is never missed.
    pub fn wait_i32(
        &self,
        ptr: u32,
        expected: i32,
        timeout: Option<Duration>,
    ) -> Result<WaitOutcome, MemoryError> {
        let word = self.atomic_i32(ptr)?;
        Ok(self.inner.waiters.wait(ptr, timeout, || {
            word.load(Ordering::SeqCst) == expected
        }))
    }

    /// Wake up to `count` threads blocked in [`LinearMemory::wait_i32`] on `ptr`.
    ///
    /// Returns the number of waiters woken.
    pub fn notify(&self, ptr: u32, count: u32) -> Result<u32, MemoryError> {
        self.check_aligned_word(ptr)?;
        Ok(self.inner.waiters.notify(ptr, count))
    }

    pub(crate) fn base_ptr(&self) -> *mut u8 {
        self.inner.data_ptr
    }

    fn check_aligned_word(&self, ptr: u32) -> Result<Range<usize>, MemoryError> {
        if ptr % 4 != 0 {
            return Err(MemoryError::Misaligned { ptr, align: 4 });
        }
        self.check_range(ptr, 4)
    }
}

impl core::fmt::Debug for LinearMemory {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("LinearMemory")
            .field("len", &self.inner.len)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct WaitSlot {
    waiting: u32,
    wakeups: u32,
}

/// Parking table keyed by word offset.
#[derive(Default)]
struct WaitTable {
    slots: Mutex<HashMap<u32, WaitSlot>>,
    cond: Condvar,
}

impl WaitTable {
    fn wait(
        &self,
        ptr: u32,
        timeout: Option<Duration>,
        still_expected: impl FnOnce() -> bool,
    ) -> WaitOutcome {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        if !still_expected() {
            return WaitOutcome::NotEqual;
        }
        slots.entry(ptr).or_default().waiting += 1;

        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let slot = slots.entry(ptr).or_default();
            if slot.wakeups > 0 {
                slot.wakeups -= 1;
                slot.waiting -= 1;
                Self::release_slot(&mut slots, ptr);
                return WaitOutcome::Woken;
            }

            match deadline {
                None => {
                    slots = self
                        .cond
                        .wait(slots)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        slot.waiting -= 1;
                        Self::release_slot(&mut slots, ptr);
                        return WaitOutcome::TimedOut;
                    }
                    slots = self
                        .cond
                        .wait_timeout(slots, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
            }
        }
    }

    fn notify(&self, ptr: u32, count: u32) -> u32 {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(slot) = slots.get_mut(&ptr) else {
            return 0;
        };
        let sleeping = slot.waiting - slot.wakeups;
        let woken = sleeping.min(count);
        if woken > 0 {
            slot.wakeups += woken;
            self.cond.notify_all();
        }
        woken
    }

    fn release_slot(slots: &mut HashMap<u32, WaitSlot>, ptr: u32) {
        if slots
            .get(&ptr)
            .is_some_and(|slot| slot.waiting == 0 && slot.wakeups == 0)
        {
            slots.remove(&ptr);
        }
    }
}
