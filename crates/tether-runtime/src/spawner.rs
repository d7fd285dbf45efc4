use std::future::Future;

use tether_ipc::{Channel, Payload};
use tether_mem::ModuleInstance;
use tether_thread::InitializedThread;

use crate::codec::SpawnMessage;
use crate::error::Result;
use crate::topics::THREAD_SPAWN;

/// Asks the main context to start threads for a worker context.
///
/// Workers cannot create threads themselves, but they can allocate: the region is carved out
/// on the calling thread and only the launch is delegated.
#[derive(Debug, Clone)]
pub struct ThreadSpawner {
    channel: Channel,
}

impl ThreadSpawner {
    pub fn new(channel: Channel) -> Self {
        Self { channel }
    }

    /// Allocate a region from `thread` and request a thread that runs `ctx_ptr` in it.
    ///
    /// The allocation happens before this returns. The region is not reclaimed if the launch
    /// fails.
    pub fn spawn<I: ModuleInstance>(
        &self,
        thread: &InitializedThread<I>,
        ctx_ptr: u32,
    ) -> impl Future<Output = Result<()>> + Send + 'static {
        let message = thread
            .allocate_for_spawn()
            .map(|region| SpawnMessage { ctx_ptr, region }.encode());
        let channel = self.channel.clone();
        async move {
            let response = channel.send(THREAD_SPAWN, Payload::new(message?));
            response.await?;
            Ok(())
        }
    }
}
