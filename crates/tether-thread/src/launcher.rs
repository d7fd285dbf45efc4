use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use tether_mem::{ModuleAllocator, ModuleInstance};
use tracing::{error, info};

use crate::bootstrap::ThreadRegion;
use crate::error::Result;

/// What a spawning context hands to the host: the function to run and the storage to run it in.
#[derive(Debug)]
pub struct SpawnRequest {
    pub ctx_ptr: u32,
    pub region: ThreadRegion,
}

/// Host facility that starts an execution context for a [`SpawnRequest`].
pub trait ThreadLauncher: Send + Sync {
    fn launch(&self, request: SpawnRequest) -> Result<()>;
}

type InstanceFactory<I> = Arc<dyn Fn() -> I + Send + Sync>;

/// Launches each request on a new OS thread with a fresh module instance.
pub struct StdThreadLauncher<I> {
    module: Arc<dyn ModuleAllocator>,
    new_instance: InstanceFactory<I>,
    next_index: AtomicUsize,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl<I: ModuleInstance + 'static> StdThreadLauncher<I> {
    pub fn new(
        module: Arc<dyn ModuleAllocator>,
        new_instance: impl Fn() -> I + Send + Sync + 'static,
    ) -> Self {
        Self {
            module,
            new_instance: Arc::new(new_instance),
            next_index: AtomicUsize::new(0),
            threads: Mutex::new(Vec::new()),
        }
    }

    /// Wait for every thread launched so far. Returns how many exited by panicking.
    pub fn join_all(&self) -> usize {
        let threads = std::mem::take(
            &mut *self.threads.lock().unwrap_or_else(PoisonError::into_inner),
        );
        threads
            .into_iter()
            .map(JoinHandle::join)
            .filter(|joined| joined.is_err())
            .count()
    }
}

impl<I: ModuleInstance + 'static> ThreadLauncher for StdThreadLauncher<I> {
    fn launch(&self, request: SpawnRequest) -> Result<()> {
        let index = self.next_index.fetch_add(1, Ordering::Relaxed);
        let module = self.module.clone();
        let new_instance = self.new_instance.clone();
        let handle = thread::Builder::new()
            .name(format!("tether-thread-{index}"))
            .spawn(move || {
                let SpawnRequest { ctx_ptr, region } = request;
                let ran = region
                    .initialize_on_new_thread(module, new_instance())
                    .and_then(|mut thread| thread.run_function_pointer(ctx_ptr));
                match ran {
                    Ok(()) => info!(index, "spawned thread finished"),
                    Err(err) => error!(index, ctx_ptr, %err, "spawned thread failed"),
                }
            })?;
        self.threads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);
        Ok(())
    }
}
