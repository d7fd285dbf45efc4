//! Mutex built on one `i32` word and wait/notify.
//!
//! The locking algorithm is written against [`LockWord`] so that it can be model-checked with
//! Loom; [`ShmMutex`] is the instance that lives in linear memory.

use std::sync::atomic::Ordering;

use tether_mem::LinearMemory;

use crate::error::{QueueError, Result};

pub const UNLOCKED: i32 = 0;
pub const LOCKED: i32 = 1;

/// Compare-and-swap attempts before parking on the word.
pub const SPIN_LIMIT: u32 = 64;

/// A 32-bit word that supports compare-and-swap plus futex-style parking.
pub trait LockWord {
    fn compare_exchange(
        &self,
        current: i32,
        new: i32,
        success: Ordering,
    ) -> core::result::Result<i32, i32>;

    fn load(&self) -> i32;

    /// Park while the word holds `value`. Spurious returns are allowed.
    fn wait_while(&self, value: i32);

    fn wake_one(&self);
}

pub fn lock<W: LockWord + ?Sized>(word: &W, spins: u32) {
    loop {
        for _ in 0..=spins {
            if word
                .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
            core::hint::spin_loop();
        }
        word.wait_while(LOCKED);
    }
}

pub fn try_lock<W: LockWord + ?Sized>(word: &W) -> bool {
    word.compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire)
        .is_ok()
}

pub fn unlock<W: LockWord + ?Sized>(word: &W) -> Result<()> {
    word.compare_exchange(LOCKED, UNLOCKED, Ordering::Release)
        .map_err(|_| QueueError::MutexNotLocked)?;
    word.wake_one();
    Ok(())
}

/// Mutex word at a fixed offset of a [`LinearMemory`].
#[derive(Debug, Clone)]
pub struct ShmMutex {
    memory: LinearMemory,
    ptr: u32,
}

impl ShmMutex {
    /// Validates that `ptr` is an aligned in-bounds word.
    pub fn new(memory: LinearMemory, ptr: u32) -> Result<Self> {
        memory.atomic_i32(ptr)?;
        Ok(Self { memory, ptr })
    }

    pub fn lock(&self) {
        lock(self, SPIN_LIMIT)
    }

    pub fn try_lock(&self) -> bool {
        try_lock(self)
    }

    pub fn unlock(&self) -> Result<()> {
        unlock(self)
    }

    pub fn is_locked(&self) -> bool {
        self.load() != UNLOCKED
    }

    fn word(&self) -> &std::sync::atomic::AtomicI32 {
        match self.memory.atomic_i32(self.ptr) {
            Ok(word) => word,
            // Checked in `ShmMutex::new`, and memories never shrink.
            Err(err) => unreachable!("mutex word became invalid: {err}"),
        }
    }
}

impl LockWord for ShmMutex {
    fn compare_exchange(
        &self,
        current: i32,
        new: i32,
        success: Ordering,
    ) -> core::result::Result<i32, i32> {
        self.word()
            .compare_exchange(current, new, success, Ordering::Relaxed)
    }

    fn load(&self) -> i32 {
        self.word().load(Ordering::Acquire)
    }

    fn wait_while(&self, value: i32) {
        if let Err(err) = self.memory.wait_i32(self.ptr, value, None) {
            unreachable!("mutex word became invalid: {err}");
        }
    }

    fn wake_one(&self) {
        if let Err(err) = self.memory.notify(self.ptr, 1) {
            unreachable!("mutex word became invalid: {err}");
        }
    }
}


#[cfg(all(test, feature = "loom"))]
mod loom_tests {
    use super::*;
    use loom::sync::atomic::{AtomicI32, AtomicUsize};
    use loom::sync::Arc;
    use loom::thread;

    struct ModelWord(AtomicI32);

    impl LockWord for ModelWord {
        fn compare_exchange(
            &self,
            current: i32,
            new: i32,
            success: Ordering,
        ) -> core::result::Result<i32, i32> {
            self.0.compare_exchange(current, new, success, Ordering::Relaxed)
        }

        fn load(&self) -> i32 {
            self.0.load(Ordering::Acquire)
        }

        fn wait_while(&self, _value: i32) {
            thread::yield_now();
        }

        fn wake_one(&self) {}
    }

    #[test]
    fn lock_provides_mutual_exclusion() {
        loom::model(|| {
            let word = Arc::new(ModelWord(AtomicI32::new(UNLOCKED)));
            let counter = Arc::new(AtomicUsize::new(0));

            let handles: Vec<_> = (0..2)
                .map(|_| {
                    let word = word.clone();
                    let counter = counter.clone();
                    thread::spawn(move || {
                        lock(&*word, 0);
                        let v = counter.load(Ordering::Relaxed);
                        counter.store(v + 1, Ordering::Relaxed);
                        unlock(&*word).unwrap();
                    })
                })
                .collect();
            for handle in handles {
                handle.join().unwrap();
            }

            assert_eq!(counter.load(Ordering::Relaxed), 2);
            assert!(matches!(unlock(&*word), Err(QueueError::MutexNotLocked)));
        });
    }
}
