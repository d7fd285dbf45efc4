use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tether_mem::ModuleAllocator;
use tracing::warn;

use crate::error::{QueueError, Result};
use crate::message::{StreamRequest, TaskMessage};
use crate::queue::WorkQueue;
use crate::retval::{wait_for_return_value, RETURN_ERROR, RETURN_INITIAL};

/// Submitting side of the task queue, for contexts that block instead of receiving messages.
///
/// Every call serializes a [`TaskMessage`] into module memory, submits its address and blocks
/// until the worker writes the return word.
#[derive(Clone)]
pub struct TaskClient {
    module: Arc<dyn ModuleAllocator>,
    queue: WorkQueue,
    timeout: Option<Duration>,
}

impl TaskClient {
    pub fn new(module: Arc<dyn ModuleAllocator>, queue: WorkQueue) -> Self {
        Self {
            module,
            queue,
            timeout: None,
        }
    }

    /// Give up on a call after `timeout`. The call's allocations are leaked in that case, since
    /// the worker may still write to them.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Open a stream and return its id.
    pub fn stream_new(&self, request: &StreamRequest) -> Result<i32> {
        self.call(|ret_ptr| TaskMessage::StreamNew {
            ret_ptr,
            request: request.clone(),
        })
    }

    /// Read the next bytes of a stream into `buf`. Returns 0 at end of stream.
    pub fn stream_read(&self, stream_id: i32, buf: &mut [u8]) -> Result<usize> {
        let len = u32::try_from(buf.len()).unwrap_or(u32::MAX);
        let buf_ptr = self.module.alloc_message(len)?;
        let read = self.call(|ret_ptr| TaskMessage::StreamRead {
            ret_ptr,
            stream_id,
            buf_ptr,
            buf_len: len,
        });
        let n = match read {
            Ok(n) => (n as usize).min(buf.len()),
            Err(QueueError::TimedOut) => return Err(QueueError::TimedOut),
            Err(err) => {
                self.free(buf_ptr);
                return Err(err);
            }
        };
        let copied = self.module.memory().read(buf_ptr, &mut buf[..n]);
        self.free(buf_ptr);
        copied?;
        Ok(n)
    }

    fn call(&self, message: impl FnOnce(u32) -> TaskMessage) -> Result<i32> {
        let memory = self.module.memory();
        let ret_ptr = self.module.alloc_message(4)?;
        memory
            .atomic_i32(ret_ptr)?
            .store(RETURN_INITIAL, Ordering::SeqCst);

        let msg_ptr = match message(ret_ptr).encode().write_to_module(&*self.module) {
            Ok(ptr) => ptr,
            Err(err) => {
                self.free(ret_ptr);
                return Err(err.into());
            }
        };
        if let Err(err) = self.queue.submit(msg_ptr) {
            self.free(msg_ptr);
            self.free(ret_ptr);
            return Err(err);
        }

        let value = wait_for_return_value(memory, ret_ptr, self.timeout)?;
        self.free(msg_ptr);
        self.free(ret_ptr);
        if value == RETURN_ERROR {
            return Err(QueueError::TaskFailed);
        }
        Ok(value)
    }

    fn free(&self, ptr: u32) {
        if let Err(err) = self.module.dealloc_message(ptr) {
            warn!(ptr, %err, "failed to free task message memory");
        }
    }
}
