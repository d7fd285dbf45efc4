//! `i32` return words written by the helper and awaited by blocked submitters.

use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use tether_mem::{LinearMemory, WaitOutcome};

use crate::error::{QueueError, Result};

/// Value a return word holds until the helper writes the result.
pub const RETURN_INITIAL: i32 = -1;

/// Result reported for failed operations.
pub const RETURN_ERROR: i32 = -2;

/// Store `value` at `ptr` and wake whoever waits on it.
pub fn send_i32_return_value(memory: &LinearMemory, ptr: u32, value: i32) -> Result<()> {
    if value == RETURN_INITIAL {
        return Err(QueueError::InitialReturnValue(value));
    }
    memory.atomic_i32(ptr)?.store(value, Ordering::SeqCst);
    memory.notify(ptr, u32::MAX)?;
    Ok(())
}

/// Block until the word at `ptr` leaves [`RETURN_INITIAL`].
pub fn wait_for_return_value(
    memory: &LinearMemory,
    ptr: u32,
    timeout: Option<Duration>,
) -> Result<i32> {
    let word = memory.atomic_i32(ptr)?;
    let deadline = timeout.map(|t| Instant::now() + t);
    loop {
        let value = word.load(Ordering::SeqCst);
        if value != RETURN_INITIAL {
            return Ok(value);
        }
        let remaining = match deadline {
            Some(deadline) => match deadline.checked_duration_since(Instant::now()) {
                Some(remaining) => Some(remaining),
                None => return Err(QueueError::TimedOut),
            },
            None => None,
        };
        if memory.wait_i32(ptr, RETURN_INITIAL, remaining)? == WaitOutcome::TimedOut {
            return Err(QueueError::TimedOut);
        }
    }
}
