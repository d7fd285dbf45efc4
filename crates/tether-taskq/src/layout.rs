//! Shared memory layout of a work queue.
//!
//! The queue is a run of little-endian 32-bit words starting at a 4-byte aligned base offset:
//!
//! | word | meaning |
//! |------|---------|
//! | 0    | mutex (0 = unlocked, 1 = locked) |
//! | 1    | number of pending items, only written with the mutex held |
//! | 2..  | item slots, each the address of a serialized task message |

pub const MUTEX_WORD: u32 = 0;
pub const COUNT_WORD: u32 = 1;
pub const HEADER_WORDS: u32 = 2;

pub const WORD_BYTES: u32 = 4;

/// Size of the queue region when none is configured.
pub const DEFAULT_QUEUE_BYTES: u32 = 10_000;

/// Number of item slots that fit in `bytes` bytes.
pub const fn slot_capacity(bytes: u32) -> u32 {
    (bytes / WORD_BYTES).saturating_sub(HEADER_WORDS)
}

/// Byte offset of word `index` of a queue based at `base`.
pub const fn word_offset(base: u32, index: u32) -> u32 {
    base + index * WORD_BYTES
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_queue_holds_2498_items() {
        assert_eq!(slot_capacity(DEFAULT_QUEUE_BYTES), 2498);
        assert_eq!(slot_capacity(8), 0);
        assert_eq!(slot_capacity(0), 0);
    }

    #[test]
    fn slots_follow_the_header() {
        assert_eq!(word_offset(64, MUTEX_WORD), 64);
        assert_eq!(word_offset(64, COUNT_WORD), 68);
        assert_eq!(word_offset(64, HEADER_WORDS), 72);
    }
}
