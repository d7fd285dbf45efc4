//! Host-side access to the module over a channel.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::future::{self, BoxFuture, FutureExt, Shared};
use tether_buffer::{
    BufferDescriptor, BufferError, BufferRegistry, BufferReleaser, BufferView, ElementType,
    Ownership, SharedBuffer,
};
use tether_ipc::{Channel, Payload};
use tether_mem::{LinearMemory, RefHandle};
use tokio::runtime::Handle;
use tracing::{error, warn};

use crate::codec::{self, BufferRequest, CallRequest, WireValue};
use crate::error::{Result, RuntimeError};
use crate::topics::{
    CALL_MODULE, CREATE_BUFFER, CREATE_READ_ONLY_BUFFER, DEALLOC_VEC, DECREMENT_ARC,
    INCREMENT_ARC,
};

/// Releaser that sends ownership changes to the module as channel requests.
///
/// Increments keep their wrapper alive until the module acknowledges them; decrements and
/// frees are fire-and-forget.
pub struct ChannelReleaser {
    channel: Channel,
    runtime: Handle,
    /// Acknowledgements of sent increments. Shared so concurrent flushes all observe them.
    increments: Mutex<Vec<Shared<BoxFuture<'static, ()>>>>,
}

impl ChannelReleaser {
    pub fn new(channel: Channel, runtime: Handle) -> Self {
        Self {
            channel,
            runtime,
            increments: Mutex::new(Vec::new()),
        }
    }

    /// Wait until every increment sent so far has been acknowledged.
    pub async fn flush(&self) {
        let pending = {
            let mut increments = self.increments();
            increments.retain(|ack| ack.peek().is_none());
            increments.clone()
        };
        future::join_all(pending).await;
    }

    pub fn pending_increments(&self) -> usize {
        let mut increments = self.increments();
        increments.retain(|ack| ack.peek().is_none());
        increments.len()
    }

    fn increments(&self) -> MutexGuard<'_, Vec<Shared<BoxFuture<'static, ()>>>> {
        self.increments.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn fire(&self, topic: &'static str, data: Vec<u8>) {
        let response = self.channel.send(topic, Payload::new(data));
        self.runtime.spawn(async move {
            if let Err(err) = response.await {
                warn!(topic, %err, "module rejected buffer release");
            }
        });
    }
}

impl BufferReleaser for ChannelReleaser {
    fn increment_ref(&self, handle: RefHandle, keepalive: SharedBuffer) {
        let response = self
            .channel
            .send(INCREMENT_ARC, Payload::new(codec::encode_handle(handle)));
        let task = self.runtime.spawn(async move {
            if let Err(err) = response.await {
                error!(%handle, %err, "module rejected reference increment");
            }
            drop(keepalive);
        });
        let ack = task
            .map(|joined| {
                if let Err(err) = joined {
                    error!(%err, "reference increment task failed");
                }
            })
            .boxed()
            .shared();
        self.increments().push(ack);
    }

    fn decrement_ref(&self, handle: RefHandle) {
        self.fire(DECREMENT_ARC, codec::encode_handle(handle));
    }

    fn dealloc_exclusive(&self, descriptor: &BufferDescriptor) {
        self.fire(DEALLOC_VEC, codec::encode_descriptor(descriptor));
    }
}

impl fmt::Debug for ChannelReleaser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelReleaser")
            .field("channel", &self.channel)
            .finish_non_exhaustive()
    }
}

/// Argument of [`HostClient::call_module`].
#[derive(Debug)]
pub enum CallArg {
    Str(String),
    /// Copied into a fresh module buffer for the duration of the call.
    Bytes {
        data: Vec<u8>,
        element_type: ElementType,
    },
    /// Handed to the module. The view must cover its whole buffer with the buffer's own
    /// element type; exclusive buffers are unusable on the host afterwards.
    Buffer(BufferView),
}

impl CallArg {
    pub fn bytes(data: impl Into<Vec<u8>>) -> Self {
        CallArg::Bytes {
            data: data.into(),
            element_type: ElementType::U8,
        }
    }
}

impl From<&str> for CallArg {
    fn from(s: &str) -> Self {
        CallArg::Str(s.to_owned())
    }
}

impl From<SharedBuffer> for CallArg {
    fn from(buffer: SharedBuffer) -> Self {
        CallArg::Buffer(buffer.view())
    }
}

/// Return value of [`HostClient::call_module`].
#[derive(Debug, Clone)]
pub enum CallValue {
    Str(String),
    Buffer(SharedBuffer),
}

impl CallValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            CallValue::Str(s) => Some(s),
            CallValue::Buffer(_) => None,
        }
    }

    pub fn as_buffer(&self) -> Option<&SharedBuffer> {
        match self {
            CallValue::Buffer(buffer) => Some(buffer),
            CallValue::Str(_) => None,
        }
    }
}

/// A context's handle to the module: calls, buffer creation and the buffer registry.
#[derive(Clone)]
pub struct HostClient {
    channel: Channel,
    registry: BufferRegistry,
    releaser: Arc<ChannelReleaser>,
}

impl HostClient {
    /// Client over `channel`, whose far end is served by a module host (directly or through
    /// relays) on `memory`. Release requests are spawned on `runtime`.
    pub fn new(
        channel: Channel,
        memory: LinearMemory,
        runtime: Handle,
        strict_ledger: bool,
    ) -> Self {
        let releaser = Arc::new(ChannelReleaser::new(channel.clone(), runtime));
        let registry = BufferRegistry::with_strict(memory, releaser.clone(), strict_ledger);
        Self {
            channel,
            registry,
            releaser,
        }
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    pub fn registry(&self) -> &BufferRegistry {
        &self.registry
    }

    pub fn releaser(&self) -> &ChannelReleaser {
        &self.releaser
    }

    /// Copy `data` into a new module vector owned by the returned wrapper.
    pub async fn create_buffer(
        &self,
        data: &[u8],
        element_type: ElementType,
    ) -> Result<SharedBuffer> {
        self.create(CREATE_BUFFER, data, element_type).await
    }

    /// Copy `data` into a new immutable refcounted module allocation.
    pub async fn create_read_only_buffer(
        &self,
        data: &[u8],
        element_type: ElementType,
    ) -> Result<SharedBuffer> {
        self.create(CREATE_READ_ONLY_BUFFER, data, element_type)
            .await
    }

    async fn create(
        &self,
        topic: &'static str,
        data: &[u8],
        element_type: ElementType,
    ) -> Result<SharedBuffer> {
        let request = BufferRequest {
            element_type,
            data: data.to_vec(),
        };
        let reply = self
            .channel
            .send(topic, Payload::new(request.encode()))
            .await?;
        let descriptor = codec::decode_descriptor(&reply.data)?;
        Ok(self.registry.reclaim(descriptor, element_type)?)
    }

    /// Call the module function `name`.
    ///
    /// Buffer arguments are validated before any of them is handed over, so a rejected call
    /// leaves every argument usable. Once the request is posted the module owns every buffer
    /// argument, whether or not the call succeeds.
    pub async fn call_module(&self, name: &str, args: Vec<CallArg>) -> Result<Vec<CallValue>> {
        validate_buffer_args(&args)?;

        // Buffers handed over for a request that cannot be posted could only be freed through
        // this same channel.
        self.channel.ensure_open()?;

        let mut wire_args = Vec::with_capacity(args.len());
        let mut handed_over = Vec::new();
        for arg in args {
            wire_args.push(match arg {
                CallArg::Str(s) => WireValue::Str(s),
                CallArg::Bytes { data, element_type } => WireValue::Bytes { element_type, data },
                CallArg::Buffer(view) => {
                    let element_type = view.element_type();
                    let descriptor = match view.transfer() {
                        Ok(descriptor) => descriptor,
                        Err(err) => {
                            // Another clone won a race for the same buffer.
                            self.take_back(&handed_over);
                            return Err(err.into());
                        }
                    };
                    handed_over.push(descriptor);
                    WireValue::Buffer {
                        descriptor,
                        element_type,
                    }
                }
            });
        }
        // Refcounted arguments must hold their extra reference before the module sees the call.
        self.releaser.flush().await;

        let request = CallRequest {
            name: name.to_owned(),
            args: wire_args,
        };
        let response = match self
            .channel
            .try_send(CALL_MODULE, Payload::new(request.encode()))
        {
            Ok(response) => response,
            Err(err) => {
                self.take_back(&handed_over);
                return Err(err.into());
            }
        };
        let reply = response.await?;

        codec::decode_values(&reply.data)?
            .into_iter()
            .map(|value| match value {
                WireValue::Str(s) => Ok(CallValue::Str(s)),
                WireValue::Buffer {
                    descriptor,
                    element_type,
                } => Ok(CallValue::Buffer(
                    self.registry.reclaim(descriptor, element_type)?,
                )),
                WireValue::Bytes { .. } => Err(RuntimeError::Decode(
                    tether_ipc::DecodeError::InvalidValue {
                        field: "return value kind",
                        value: 1,
                    },
                )),
            })
            .collect()
    }
}

impl HostClient {
    /// Release buffers that were handed over for a call the module never received.
    fn take_back(&self, descriptors: &[BufferDescriptor]) {
        for descriptor in descriptors {
            match descriptor.ownership {
                Ownership::Exclusive { .. } => self.releaser.dealloc_exclusive(descriptor),
                Ownership::SharedRefcounted { handle } => self.releaser.decrement_ref(handle),
            }
        }
    }
}

/// Checks every buffer argument before any is handed over.
fn validate_buffer_args(args: &[CallArg]) -> Result<()> {
    let mut exclusive: Vec<(usize, &SharedBuffer)> = Vec::new();
    for (index, arg) in args.iter().enumerate() {
        let CallArg::Buffer(view) = arg else {
            continue;
        };
        view.covers_whole()?;
        view.validate_type_tag()?;
        let buffer = view.buffer();
        if buffer.is_transferred() {
            return Err(BufferError::Transferred.into());
        }
        if let Ownership::Exclusive { .. } = buffer.ownership() {
            if let Some(&(first, _)) = exclusive.iter().find(|(_, seen)| seen.same_buffer(buffer))
            {
                return Err(RuntimeError::DuplicateBufferArgument {
                    first,
                    second: index,
                });
            }
            exclusive.push((index, buffer));
        }
    }
    Ok(())
}

impl fmt::Debug for HostClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostClient")
            .field("channel", &self.channel)
            .field("registry", &self.registry)
            .finish()
    }
}
