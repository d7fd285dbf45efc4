use std::sync::atomic::Ordering;
use std::time::Duration;

use tether_mem::{LinearMemory, WaitOutcome};

use crate::error::{QueueError, Result};
use crate::layout::{slot_capacity, word_offset, COUNT_WORD, HEADER_WORDS, MUTEX_WORD, WORD_BYTES};
use crate::mutex::ShmMutex;

/// Fixed-capacity queue of message addresses in shared memory.
///
/// Any number of contexts may submit; one helper context drains. The pending count is only
/// written with the mutex held, but it doubles as the wait/notify word the helper parks on.
#[derive(Debug, Clone)]
pub struct WorkQueue {
    memory: LinearMemory,
    base: u32,
    capacity: u32,
    mutex: ShmMutex,
}

impl WorkQueue {
    /// Lay out a fresh, empty queue of `bytes` bytes at `base`.
    pub fn init(memory: LinearMemory, base: u32, bytes: u32) -> Result<Self> {
        let queue = Self::attach(memory, base, bytes)?;
        queue.memory.write(base, &vec![0u8; (HEADER_WORDS * WORD_BYTES) as usize])?;
        Ok(queue)
    }

    /// Queue on a dedicated memory region of `bytes` bytes.
    pub fn with_capacity_bytes(bytes: u32) -> Result<Self> {
        Self::init(LinearMemory::new(bytes.max(1) as usize)?, 0, bytes)
    }

    /// Use a queue another context already laid out.
    pub fn attach(memory: LinearMemory, base: u32, bytes: u32) -> Result<Self> {
        if base % WORD_BYTES != 0 {
            return Err(QueueError::InvalidLayout("base offset must be 4-byte aligned"));
        }
        let capacity = slot_capacity(bytes);
        if capacity == 0 {
            return Err(QueueError::InvalidLayout("region too small for any item slot"));
        }
        memory.check_range(base, bytes as usize)?;
        let mutex = ShmMutex::new(memory.clone(), word_offset(base, MUTEX_WORD))?;
        Ok(Self {
            memory,
            base,
            capacity,
            mutex,
        })
    }

    pub fn memory(&self) -> &LinearMemory {
        &self.memory
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Append `item_ptr` and wake the draining context.
    pub fn submit(&self, item_ptr: u32) -> Result<()> {
        self.mutex.lock();
        let count = self.count_word().load(Ordering::Acquire) as u32;
        if count >= self.capacity {
            self.mutex.unlock()?;
            return Err(QueueError::QueueFull {
                capacity: self.capacity,
            });
        }
        let written = self
            .memory
            .write_u32(self.slot_offset(count), item_ptr);
        if written.is_ok() {
            self.count_word().store(count as i32 + 1, Ordering::Release);
        }
        self.mutex.unlock()?;
        written?;
        self.memory.notify(self.count_offset(), 1)?;
        Ok(())
    }

    /// Pending item count, read without the mutex. Only a hint.
    pub fn peek_count(&self) -> u32 {
        self.count_word().load(Ordering::Acquire) as u32
    }

    /// Take every pending item, in submission order, and hand each to `f`.
    ///
    /// The items are copied out and the count reset while the mutex is held; `f` runs after the
    /// mutex is released so slow handlers never stall submitters.
    pub fn drain_with(&self, mut f: impl FnMut(u32)) -> Result<usize> {
        if self.peek_count() == 0 {
            return Ok(0);
        }

        self.mutex.lock();
        // Re-read now that submitters are excluded.
        let count = (self.count_word().load(Ordering::Acquire) as u32).min(self.capacity);
        let items: std::result::Result<Vec<u32>, _> = (0..count)
            .map(|i| self.memory.read_u32(self.slot_offset(i)))
            .collect();
        if items.is_ok() {
            self.count_word().store(0, Ordering::Release);
        }
        self.mutex.unlock()?;

        let items = items?;
        for &item in &items {
            f(item);
        }
        Ok(items.len())
    }

    /// Block until the pending count is nonzero, a submitter notifies, or `timeout` elapses.
    pub fn wait_for_items(&self, timeout: Option<Duration>) -> Result<WaitOutcome> {
        Ok(self.memory.wait_i32(self.count_offset(), 0, timeout)?)
    }

    /// Wake a context blocked in [`WorkQueue::wait_for_items`] without submitting anything.
    pub fn wake(&self) -> Result<()> {
        self.memory.notify(self.count_offset(), u32::MAX)?;
        Ok(())
    }

    fn count_offset(&self) -> u32 {
        word_offset(self.base, COUNT_WORD)
    }

    fn slot_offset(&self, index: u32) -> u32 {
        word_offset(self.base, HEADER_WORDS + index)
    }

    fn count_word(&self) -> &std::sync::atomic::AtomicI32 {
        match self.memory.atomic_i32(self.count_offset()) {
            Ok(word) => word,
            // The whole region was bounds-checked in `attach`.
            Err(err) => unreachable!("queue count word became invalid: {err}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn items_drain_in_submission_order() {
        let queue = WorkQueue::with_capacity_bytes(64).unwrap();
        for ptr in [40, 8, 24] {
            queue.submit(ptr).unwrap();
        }
        assert_eq!(queue.peek_count(), 3);

        let mut seen = Vec::new();
        assert_eq!(queue.drain_with(|p| seen.push(p)).unwrap(), 3);
        assert_eq!(seen, vec![40, 8, 24]);
        assert_eq!(queue.peek_count(), 0);
        assert_eq!(queue.drain_with(|_| unreachable!()).unwrap(), 0);
    }

    #[test]
    fn full_queue_rejects_submissions_until_drained() {
        // Two header words plus two slots.
        let queue = WorkQueue::with_capacity_bytes(16).unwrap();
        queue.submit(1).unwrap();
        queue.submit(2).unwrap();
        assert!(matches!(
            queue.submit(3),
            Err(QueueError::QueueFull { capacity: 2 })
        ));
        assert!(!queue.mutex.is_locked());

        queue.drain_with(|_| {}).unwrap();
        queue.submit(3).unwrap();
    }

    #[test]
    fn layout_is_validated() {
        let memory = LinearMemory::new(64).unwrap();
        assert!(matches!(
            WorkQueue::init(memory.clone(), 2, 32),
            Err(QueueError::InvalidLayout(_))
        ));
        assert!(matches!(
            WorkQueue::init(memory.clone(), 0, 8),
            Err(QueueError::InvalidLayout(_))
        ));
        assert!(matches!(
            WorkQueue::init(memory, 48, 32),
            Err(QueueError::Memory(_))
        ));
    }

    #[test]
    fn attached_handles_share_state() {
        let memory = LinearMemory::new(256).unwrap();
        let owner = WorkQueue::init(memory.clone(), 64, 128).unwrap();
        let other = WorkQueue::attach(memory, 64, 128).unwrap();
        other.submit(99).unwrap();
        let mut seen = Vec::new();
        owner.drain_with(|p| seen.push(p)).unwrap();
        assert_eq!(seen, vec![99]);
    }

    #[test]
    fn waiting_returns_immediately_when_items_are_pending() {
        let queue = WorkQueue::with_capacity_bytes(64).unwrap();
        queue.submit(8).unwrap();
        assert_eq!(
            queue.wait_for_items(Some(Duration::from_secs(5))).unwrap(),
            WaitOutcome::NotEqual
        );
    }
}
