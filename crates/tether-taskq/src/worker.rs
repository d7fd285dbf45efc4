//! The helper context that drains a [`WorkQueue`].
//!
//! The worker owns a dedicated OS thread running a single-threaded tokio runtime. Each cycle it
//! drains the queue, starts or serves the decoded operations, then either sleeps for the poll
//! interval (letting outstanding operations make progress) or, when nothing is outstanding,
//! blocks on the queue's count word.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use futures_util::StreamExt;
use tether_ipc::wire::read_message;
use tether_mem::LinearMemory;
use tokio::task::LocalSet;
use tracing::{debug, error, warn};

use crate::error::Result;
use crate::message::{StreamRequest, TaskMessage};
use crate::queue::WorkQueue;
use crate::retval::{send_i32_return_value, RETURN_ERROR};
use crate::source::StreamSource;
use crate::stream::StreamTable;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskWorkerConfig {
    /// How long to yield to outstanding operations before draining again.
    pub poll_interval: Duration,
    /// Upper bound on one blocking wait, so shutdown is noticed even without a wake.
    pub idle_wait: Duration,
}

impl Default for TaskWorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1),
            idle_wait: Duration::from_millis(500),
        }
    }
}

/// What the drain loop does between cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainMode {
    /// Nothing outstanding: block on the count word.
    Blocked,
    /// Asynchronous operations are in flight: yield to them, then drain again.
    Polling,
}

impl DrainMode {
    pub fn for_outstanding(outstanding: usize) -> Self {
        if outstanding == 0 {
            DrainMode::Blocked
        } else {
            DrainMode::Polling
        }
    }
}

/// Counts one in-flight asynchronous operation for as long as it is alive.
struct OpGuard(Rc<Cell<usize>>);

impl OpGuard {
    fn new(outstanding: &Rc<Cell<usize>>) -> Self {
        outstanding.set(outstanding.get() + 1);
        Self(outstanding.clone())
    }
}

impl Drop for OpGuard {
    fn drop(&mut self) {
        self.0.set(self.0.get() - 1);
    }
}

/// Handle to a running task worker. Dropping it stops the worker and joins its thread.
pub struct TaskWorker {
    queue: WorkQueue,
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl TaskWorker {
    /// Start draining `queue` on a new thread.
    ///
    /// `memory` is where task messages, return words and read buffers live; it is usually the
    /// memory the queue itself is laid out in.
    pub fn spawn(
        queue: WorkQueue,
        memory: LinearMemory,
        source: Arc<dyn StreamSource>,
        config: TaskWorkerConfig,
    ) -> Result<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let thread = thread::Builder::new().name("tether-task-worker".into()).spawn({
            let queue = queue.clone();
            let shutdown = shutdown.clone();
            move || run(queue, memory, source, config, shutdown)
        })?;
        Ok(Self {
            queue,
            shutdown,
            thread: Some(thread),
        })
    }

    pub fn queue(&self) -> &WorkQueue {
        &self.queue
    }

    /// Stop the drain loop and wait for the thread to exit. Streams still open are dropped.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        self.shutdown.store(true, Ordering::SeqCst);
        if let Err(err) = self.queue.wake() {
            warn!(%err, "failed to wake task worker");
        }
        if thread.join().is_err() {
            error!("task worker thread panicked");
        }
    }
}

impl Drop for TaskWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(
    queue: WorkQueue,
    memory: LinearMemory,
    source: Arc<dyn StreamSource>,
    config: TaskWorkerConfig,
    shutdown: Arc<AtomicBool>,
) {
    let rt = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(err) => {
            error!(%err, "failed to build task worker runtime");
            return;
        }
    };
    let local = LocalSet::new();
    local.block_on(&rt, async move {
        let worker = DrainLoop {
            streams: Rc::new(RefCell::new(StreamTable::new(memory.clone()))),
            outstanding: Rc::new(Cell::new(0)),
            queue,
            memory,
            source,
        };
        worker.run(config, &shutdown).await;
    });
    debug!("task worker stopped");
}

struct DrainLoop {
    queue: WorkQueue,
    memory: LinearMemory,
    source: Arc<dyn StreamSource>,
    streams: Rc<RefCell<StreamTable>>,
    outstanding: Rc<Cell<usize>>,
}

impl DrainLoop {
    async fn run(&self, config: TaskWorkerConfig, shutdown: &AtomicBool) {
        while !shutdown.load(Ordering::SeqCst) {
            let mut items = Vec::new();
            match self.queue.drain_with(|ptr| items.push(ptr)) {
                Ok(0) => {}
                Ok(n) => debug!(items = n, "drained task queue"),
                Err(err) => error!(%err, "failed to drain task queue"),
            }
            for ptr in items {
                self.dispatch(ptr);
            }

            match DrainMode::for_outstanding(self.outstanding.get()) {
                DrainMode::Polling => tokio::time::sleep(config.poll_interval).await,
                DrainMode::Blocked => {
                    if let Err(err) = self.queue.wait_for_items(Some(config.idle_wait)) {
                        error!(%err, "failed to wait on task queue");
                        return;
                    }
                }
            }
        }
    }

    fn dispatch(&self, ptr: u32) {
        let message = match read_message(&self.memory, ptr).and_then(|b| TaskMessage::decode(&b))
        {
            Ok(message) => message,
            Err(err) => {
                warn!(ptr, %err, "skipping undecodable task message");
                return;
            }
        };
        match message {
            TaskMessage::StreamNew { ret_ptr, request } => self.stream_new(ret_ptr, request),
            TaskMessage::StreamRead {
                ret_ptr,
                stream_id,
                buf_ptr,
                buf_len,
            } => self
                .streams
                .borrow_mut()
                .read(ret_ptr, stream_id, buf_ptr, buf_len),
        }
    }

    fn stream_new(&self, ret_ptr: u32, request: StreamRequest) {
        // Counted before the task starts so this cycle already switches to polling.
        let guard = OpGuard::new(&self.outstanding);
        let opening = self.source.open(request.clone());
        let streams = self.streams.clone();
        let memory = self.memory.clone();
        tokio::task::spawn_local(async move {
            let _guard = guard;
            let mut chunks = match opening.await {
                Ok(chunks) => chunks,
                Err(err) => {
                    error!(url = %request.url, %err, "failed to open stream");
                    respond(&memory, ret_ptr, RETURN_ERROR);
                    return;
                }
            };

            let id = streams.borrow_mut().open();
            debug!(stream_id = id, url = %request.url, "opened stream");
            respond(&memory, ret_ptr, id);

            while let Some(chunk) = chunks.next().await {
                match chunk {
                    Ok(chunk) => streams.borrow_mut().push_chunk(id, chunk),
                    Err(err) => {
                        error!(stream_id = id, %err, "stream failed");
                        streams.borrow_mut().finish(id, Some(err));
                        return;
                    }
                }
            }
            streams.borrow_mut().finish(id, None);
        });
    }
}

fn respond(memory: &LinearMemory, ret_ptr: u32, value: i32) {
    if let Err(err) = send_i32_return_value(memory, ret_ptr, value) {
        error!(ret_ptr, value, %err, "failed to write task return value");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_mode_follows_outstanding_operations() {
        let outstanding = Rc::new(Cell::new(0));
        assert_eq!(DrainMode::for_outstanding(outstanding.get()), DrainMode::Blocked);

        let a = OpGuard::new(&outstanding);
        let b = OpGuard::new(&outstanding);
        assert_eq!(DrainMode::for_outstanding(outstanding.get()), DrainMode::Polling);
        drop(a);
        assert_eq!(outstanding.get(), 1);
        drop(b);
        assert_eq!(DrainMode::for_outstanding(outstanding.get()), DrainMode::Blocked);
    }
}
