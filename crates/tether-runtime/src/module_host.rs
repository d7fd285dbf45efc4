//! The module's side of the buffer and call topics.
//!
//! [`ModuleHost`] answers requests on the channel connected to the module context: it applies
//! refcount changes, frees vectors handed back by the host, materializes host data as module
//! buffers and dispatches named calls through a [`CallTable`].

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tether_buffer::{BufferDescriptor, ElementType, Ownership};
use tether_ipc::{Channel, ChannelError, Payload, RemoteError};
use tether_mem::{ModuleAllocator, ModuleError};
use tracing::{debug, warn};

use crate::codec::{self, BufferRequest, CallRequest, WireValue};
use crate::topics::{
    CALL_MODULE, CREATE_BUFFER, CREATE_READ_ONLY_BUFFER, DEALLOC_VEC, DECREMENT_ARC,
    INCREMENT_ARC,
};

/// Error name reported for calls to functions the module does not export.
pub const UNKNOWN_FUNCTION: &str = "UnknownFunction";

/// Argument or return value of a module function, as the module sees it.
#[derive(Debug, Clone, PartialEq)]
pub enum ModuleValue {
    Str(String),
    Buffer {
        descriptor: BufferDescriptor,
        element_type: ElementType,
    },
}

impl ModuleValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ModuleValue::Str(s) => Some(s),
            ModuleValue::Buffer { .. } => None,
        }
    }
}

/// What a module function can do besides reading its arguments.
pub struct CallContext<'a> {
    module: &'a dyn ModuleAllocator,
}

impl<'a> CallContext<'a> {
    pub(crate) fn new(module: &'a dyn ModuleAllocator) -> Self {
        Self { module }
    }

    pub fn module(&self) -> &dyn ModuleAllocator {
        self.module
    }

    /// Copy the bytes of a buffer argument.
    pub fn read(&self, value: &ModuleValue) -> Result<Vec<u8>, RemoteError> {
        match value {
            ModuleValue::Buffer { descriptor, .. } => self
                .module
                .memory()
                .read_vec(descriptor.ptr, descriptor.len as usize)
                .map_err(|err| RemoteError::from_error("MemoryError", &err)),
            ModuleValue::Str(_) => Err(RemoteError::new(
                "TypeError",
                "expected a buffer argument, got a string",
            )),
        }
    }

    /// A new mutable buffer, owned by whoever receives it.
    pub fn new_buffer(
        &self,
        data: &[u8],
        element_type: ElementType,
    ) -> Result<ModuleValue, RemoteError> {
        let descriptor = alloc_vec(self.module, data).map_err(module_error)?;
        Ok(ModuleValue::Buffer {
            descriptor,
            element_type,
        })
    }

    /// A new immutable refcounted buffer. The receiver holds its only reference.
    pub fn new_read_only_buffer(
        &self,
        data: &[u8],
        element_type: ElementType,
    ) -> Result<ModuleValue, RemoteError> {
        let descriptor = alloc_arc_vec(self.module, data).map_err(module_error)?;
        Ok(ModuleValue::Buffer {
            descriptor,
            element_type,
        })
    }
}

pub type ModuleFn = Arc<
    dyn Fn(&CallContext<'_>, &[ModuleValue]) -> Result<Vec<ModuleValue>, RemoteError>
        + Send
        + Sync,
>;

/// Functions the module exports by name.
#[derive(Clone, Default)]
pub struct CallTable {
    functions: HashMap<String, ModuleFn>,
}

impl CallTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        f: impl Fn(&CallContext<'_>, &[ModuleValue]) -> Result<Vec<ModuleValue>, RemoteError>
            + Send
            + Sync
            + 'static,
    ) -> &mut Self {
        self.functions.insert(name.into(), Arc::new(f));
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    fn get(&self, name: &str) -> Option<ModuleFn> {
        self.functions.get(name).cloned()
    }
}

impl fmt::Debug for CallTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.functions.keys().collect();
        names.sort();
        f.debug_struct("CallTable").field("functions", &names).finish()
    }
}

fn module_error(err: ModuleError) -> RemoteError {
    RemoteError::from_error("ModuleError", &err)
}

fn decode_error(err: tether_ipc::DecodeError) -> RemoteError {
    ChannelError::Decode(err).into_remote()
}

fn alloc_vec(module: &dyn ModuleAllocator, data: &[u8]) -> Result<BufferDescriptor, ModuleError> {
    let len = data.len() as u32;
    let ptr = module.alloc_vec(len)?;
    if let Err(err) = module.memory().write(ptr, data) {
        module.dealloc_vec(ptr, len, len)?;
        return Err(err.into());
    }
    Ok(BufferDescriptor::exclusive(ptr, len, len))
}

fn alloc_arc_vec(
    module: &dyn ModuleAllocator,
    data: &[u8],
) -> Result<BufferDescriptor, ModuleError> {
    let vec = alloc_vec(module, data)?;
    match module.create_arc_vec(vec.ptr, vec.len) {
        Ok(handle) => Ok(BufferDescriptor::refcounted(vec.ptr, vec.len, handle)),
        Err(err) => {
            module.dealloc_vec(vec.ptr, vec.len, vec.len)?;
            Err(err)
        }
    }
}

/// Drop the module's hold on a value it received as a call argument.
fn release(module: &dyn ModuleAllocator, value: &ModuleValue) {
    let ModuleValue::Buffer { descriptor, .. } = value else {
        return;
    };
    let released = match descriptor.ownership {
        Ownership::Exclusive { capacity } => {
            module.dealloc_vec(descriptor.ptr, descriptor.len, capacity)
        }
        Ownership::SharedRefcounted { handle } => module.decrement_arc(handle),
    };
    if let Err(err) = released {
        warn!(ptr = descriptor.ptr, %err, "failed to release call argument");
    }
}

/// Serves the module topics on behalf of one module instance.
#[derive(Clone)]
pub struct ModuleHost {
    module: Arc<dyn ModuleAllocator>,
    calls: Arc<CallTable>,
}

impl ModuleHost {
    pub fn new(module: Arc<dyn ModuleAllocator>, calls: CallTable) -> Self {
        Self {
            module,
            calls: Arc::new(calls),
        }
    }

    /// Register receivers for every module topic on `channel`.
    pub fn serve(&self, channel: &Channel) -> Result<(), ChannelError> {
        let module = self.module.clone();
        channel.receive_sync(INCREMENT_ARC, move |payload| {
            let handle = codec::decode_handle(&payload.data).map_err(decode_error)?;
            module.increment_arc(handle).map_err(module_error)?;
            Ok(Payload::empty())
        })?;

        let module = self.module.clone();
        channel.receive_sync(DECREMENT_ARC, move |payload| {
            let handle = codec::decode_handle(&payload.data).map_err(decode_error)?;
            module.decrement_arc(handle).map_err(module_error)?;
            Ok(Payload::empty())
        })?;

        let module = self.module.clone();
        channel.receive_sync(DEALLOC_VEC, move |payload| {
            let descriptor = codec::decode_descriptor(&payload.data).map_err(decode_error)?;
            let Ownership::Exclusive { capacity } = descriptor.ownership else {
                return Err(RemoteError::new(
                    "TypeError",
                    "DeallocVec needs an exclusive buffer",
                ));
            };
            module
                .dealloc_vec(descriptor.ptr, descriptor.len, capacity)
                .map_err(module_error)?;
            Ok(Payload::empty())
        })?;

        let module = self.module.clone();
        channel.receive_sync(CREATE_BUFFER, move |payload| {
            let request = BufferRequest::decode(&payload.data).map_err(decode_error)?;
            let descriptor = alloc_vec(&*module, &request.data).map_err(module_error)?;
            Ok(Payload::new(codec::encode_descriptor(&descriptor)))
        })?;

        let module = self.module.clone();
        channel.receive_sync(CREATE_READ_ONLY_BUFFER, move |payload| {
            let request = BufferRequest::decode(&payload.data).map_err(decode_error)?;
            let descriptor = alloc_arc_vec(&*module, &request.data).map_err(module_error)?;
            Ok(Payload::new(codec::encode_descriptor(&descriptor)))
        })?;

        let host = self.clone();
        channel.receive_sync(CALL_MODULE, move |payload| {
            let request = CallRequest::decode(&payload.data).map_err(decode_error)?;
            host.call(request).map(|values| Payload::new(codec::encode_values(&values)))
        })?;

        Ok(())
    }

    fn call(&self, request: CallRequest) -> Result<Vec<WireValue>, RemoteError> {
        let module = &*self.module;
        let mut args = Vec::with_capacity(request.args.len());
        let mut failed = None;
        for arg in request.args {
            let value = match arg {
                WireValue::Str(s) => ModuleValue::Str(s),
                WireValue::Buffer {
                    descriptor,
                    element_type,
                } => ModuleValue::Buffer {
                    descriptor,
                    element_type,
                },
                WireValue::Bytes { element_type, data } => match alloc_vec(module, &data) {
                    Ok(descriptor) => ModuleValue::Buffer {
                        descriptor,
                        element_type,
                    },
                    Err(err) => {
                        failed = Some(module_error(err));
                        continue;
                    }
                },
            };
            args.push(value);
        }

        let result = match (failed, self.calls.get(&request.name)) {
            (Some(err), _) => Err(err),
            (None, None) => Err(RemoteError::new(
                UNKNOWN_FUNCTION,
                format!("module does not export {:?}", request.name),
            )),
            (None, Some(f)) => {
                debug!(name = %request.name, args = args.len(), "calling module function");
                f(&CallContext::new(module), &args)
            }
        };
        // Arguments are consumed by the call, successful or not.
        for arg in &args {
            release(module, arg);
        }

        Ok(result?
            .into_iter()
            .map(|value| match value {
                ModuleValue::Str(s) => WireValue::Str(s),
                ModuleValue::Buffer {
                    descriptor,
                    element_type,
                } => WireValue::Buffer {
                    descriptor,
                    element_type,
                },
            })
            .collect())
    }
}

impl fmt::Debug for ModuleHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleHost")
            .field("calls", &self.calls)
            .finish_non_exhaustive()
    }
}
