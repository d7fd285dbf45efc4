use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use tether_ipc::{Channel, LinkedTransport, Payload, Relay, RemoteError};
use tether_mem::{HostInstance, HostModule, LinearMemory, ModuleAllocator};
use tether_taskq::{StreamSource, TaskClient, TaskWorker, TaskWorkerConfig, WorkQueue};
use tether_thread::{InitializedThread, SpawnRequest, StdThreadLauncher, ThreadLauncher};
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use crate::client::HostClient;
use crate::codec::SpawnMessage;
use crate::config::RuntimeConfig;
use crate::error::{Result, RuntimeError};
use crate::module_host::{CallTable, ModuleHost};
use crate::spawner::ThreadSpawner;
use crate::topics::{MODULE_TOPICS, THREAD_SPAWN};

/// Error name reported when the main context cannot start a requested thread.
pub const THREAD_SPAWN_FAILED: &str = "ThreadSpawnFailed";

/// What a worker context gets from [`Runtime::connect_worker`].
#[derive(Debug, Clone)]
pub struct WorkerContext {
    /// Module calls and buffers, relayed through the main context.
    pub client: HostClient,
    /// Thread launches, served by the main context.
    pub spawner: ThreadSpawner,
}

/// One module instance with its host, task worker and thread launcher.
///
/// The main context talks to the module over a channel pair; each worker context gets its own
/// channel to the main context, which relays module topics and serves thread spawns.
pub struct Runtime {
    config: RuntimeConfig,
    memory: LinearMemory,
    module: Arc<HostModule>,
    main: InitializedThread<HostInstance>,
    host: HostClient,
    launcher: Arc<StdThreadLauncher<HostInstance>>,
    task_client: TaskClient,
    worker: Option<TaskWorker>,
    runtime: Handle,
    /// Every channel the runtime created, so shutdown can disconnect pending calls.
    channels: Mutex<Vec<Channel>>,
}

impl Runtime {
    /// Bring up a module and everything around it. Must be called inside a tokio runtime,
    /// which runs the channel handlers.
    pub fn start(
        config: RuntimeConfig,
        calls: CallTable,
        source: Arc<dyn StreamSource>,
    ) -> Result<Self> {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|_| RuntimeError::NoRuntime)?;
        let memory = LinearMemory::new(config.memory_bytes)?;
        let module = HostModule::new(memory.clone(), config.tls_size)?;
        let main = InitializedThread::init_main(module.clone(), module.main_instance())?
            .with_stack_size(config.thread_stack_size);

        let (host_end, module_end) = LinkedTransport::pair();
        let module_channel = Channel::with_runtime(runtime.clone());
        ModuleHost::new(module.clone(), calls).serve(&module_channel)?;
        module_channel.attach(Arc::new(module_end))?;
        let host_channel = Channel::with_runtime(runtime.clone());
        host_channel.attach(Arc::new(host_end))?;
        let host = HostClient::new(
            host_channel.clone(),
            memory.clone(),
            runtime.clone(),
            config.strict_ledger,
        );

        let queue_base = module.alloc_message(config.task_queue_bytes)?;
        let queue = WorkQueue::init(memory.clone(), queue_base, config.task_queue_bytes)?;
        let worker = TaskWorker::spawn(
            queue.clone(),
            memory.clone(),
            source,
            TaskWorkerConfig {
                poll_interval: config.drain_poll_interval,
                idle_wait: config.idle_wait,
            },
        )?;
        let task_client = TaskClient::new(module.clone(), queue);

        let launcher = Arc::new(StdThreadLauncher::new(module.clone(), {
            let module = module.clone();
            move || module.new_instance()
        }));

        info!(
            memory_bytes = config.memory_bytes,
            queue_base,
            tls_base = main.tls_base(),
            "runtime started"
        );
        Ok(Self {
            config,
            memory,
            module,
            main,
            host,
            launcher,
            task_client,
            worker: Some(worker),
            runtime,
            channels: Mutex::new(vec![module_channel, host_channel]),
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn memory(&self) -> &LinearMemory {
        &self.memory
    }

    pub fn module(&self) -> &Arc<HostModule> {
        &self.module
    }

    /// The main context's client.
    pub fn host(&self) -> &HostClient {
        &self.host
    }

    /// The main context's thread, which owns the module's main stack.
    pub fn main_thread(&self) -> &InitializedThread<HostInstance> {
        &self.main
    }

    /// Task queue client for contexts that block instead of awaiting.
    pub fn task_client(&self) -> &TaskClient {
        &self.task_client
    }

    /// Connect a new worker context to the main context.
    pub fn connect_worker(&self) -> Result<WorkerContext> {
        let (main_end, worker_end) = LinkedTransport::pair();

        let main_side = Channel::with_runtime(self.runtime.clone());
        Relay::new(self.host.channel().clone()).forward_all(&main_side, MODULE_TOPICS)?;
        let launcher = self.launcher.clone();
        let memory_len = self.memory.len();
        main_side.receive_sync(THREAD_SPAWN, move |payload: Payload| {
            let SpawnMessage { ctx_ptr, region } = SpawnMessage::decode(&payload.data, memory_len)
                .map_err(|err| RemoteError::from_error(THREAD_SPAWN_FAILED, &err))?;
            launcher
                .launch(SpawnRequest { ctx_ptr, region })
                .map_err(|err| RemoteError::from_error(THREAD_SPAWN_FAILED, &err))?;
            Ok(Payload::empty())
        })?;
        main_side.attach(Arc::new(main_end))?;

        let worker_side = Channel::with_runtime(self.runtime.clone());
        worker_side.attach(Arc::new(worker_end))?;
        self.channels()
            .extend([main_side, worker_side.clone()]);
        debug!("worker context connected");

        Ok(WorkerContext {
            client: HostClient::new(
                worker_side.clone(),
                self.memory.clone(),
                self.runtime.clone(),
                self.config.strict_ledger,
            ),
            spawner: ThreadSpawner::new(worker_side),
        })
    }

    /// Start a thread from the main context that runs the function registered as `ctx_ptr`.
    pub fn spawn_thread(&self, ctx_ptr: u32) -> Result<()> {
        Ok(self.main.spawn(&*self.launcher, ctx_ptr)?)
    }

    /// Wait for every thread spawned so far. Returns how many panicked.
    pub fn join_threads(&self) -> usize {
        self.launcher.join_all()
    }

    /// Disconnect every channel, stop the task worker and join spawned threads.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        for channel in std::mem::take(&mut *self.channels()) {
            channel.close();
        }
        if let Some(worker) = self.worker.take() {
            worker.shutdown();
        }
        let panicked = self.launcher.join_all();
        if panicked > 0 {
            warn!(panicked, "spawned threads panicked");
        }
        info!("runtime stopped");
    }

    fn channels(&self) -> std::sync::MutexGuard<'_, Vec<Channel>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        if self.worker.is_some() {
            self.stop();
        }
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("config", &self.config)
            .field("host", &self.host)
            .finish_non_exhaustive()
    }
}
