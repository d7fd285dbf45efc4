//! Point-to-point message pipes.

use core::fmt;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tether_mem::LinearMemory;
use thiserror::Error;

/// Object moved (never copied) along with a message.
pub enum Transferable {
    Bytes(Vec<u8>),
    Memory(LinearMemory),
    /// One end of a transport pair, e.g. for wiring a freshly spawned context.
    Port(LinkedTransport),
}

impl fmt::Debug for Transferable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transferable::Bytes(bytes) => f.debug_tuple("Bytes").field(&bytes.len()).finish(),
            Transferable::Memory(memory) => f.debug_tuple("Memory").field(memory).finish(),
            Transferable::Port(_) => f.write_str("Port"),
        }
    }
}

#[derive(Debug, Default)]
pub struct Message {
    pub data: Vec<u8>,
    pub transfer: Vec<Transferable>,
}

impl Message {
    pub fn new(data: Vec<u8>, transfer: Vec<Transferable>) -> Self {
        Self { data, transfer }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("a channel is already attached to this transport endpoint")]
    AlreadyAttached,
    #[error("transport is closed")]
    Closed,
}

pub type OnMessage = Arc<dyn Fn(Message) + Send + Sync>;

pub trait Transport: Send + Sync {
    /// Deliver `message` to the other end. Messages arrive in posting order.
    fn post_message(&self, message: Message) -> Result<(), TransportError>;

    /// Install the inbound callback. Only one may ever be installed per endpoint.
    fn set_onmessage(&self, handler: OnMessage) -> Result<(), TransportError>;
}

/// One end of an in-process transport pair.
///
/// Delivery is synchronous on the posting thread. Messages posted before the receiving end has
/// a callback are queued and delivered, in order, once one is installed. A callback that posts
/// to its own endpoint (directly or through the peer) never re-enters itself; the message is
/// delivered after the current callback returns.
#[derive(Clone)]
pub struct LinkedTransport {
    local: Arc<Endpoint>,
    remote: Arc<Endpoint>,
}

#[derive(Default)]
struct Endpoint {
    state: Mutex<EndpointState>,
}

#[derive(Default)]
struct EndpointState {
    handler: Option<OnMessage>,
    queue: VecDeque<Message>,
    delivering: bool,
    closed: bool,
}

impl Endpoint {
    fn state(&self) -> MutexGuard<'_, EndpointState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn deliver(&self, message: Option<Message>) -> Result<(), TransportError> {
        let mut state = self.state();
        if state.closed {
            return Err(TransportError::Closed);
        }
        if let Some(message) = message {
            state.queue.push_back(message);
        }
        if state.delivering {
            return Ok(());
        }
        let Some(handler) = state.handler.clone() else {
            return Ok(());
        };

        state.delivering = true;
        let mut unwind = UnwindGuard {
            endpoint: self,
            armed: true,
        };
        loop {
            let Some(next) = state.queue.pop_front() else {
                // Cleared under the same lock that observed the empty queue.
                state.delivering = false;
                unwind.armed = false;
                return Ok(());
            };
            drop(state);
            handler(next);
            state = self.state();
        }
    }
}

/// Clears the `delivering` flag if a callback unwinds out of the delivery loop.
struct UnwindGuard<'a> {
    endpoint: &'a Endpoint,
    armed: bool,
}

impl Drop for UnwindGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.endpoint.state().delivering = false;
        }
    }
}

impl LinkedTransport {
    pub fn pair() -> (LinkedTransport, LinkedTransport) {
        let a = Arc::new(Endpoint::default());
        let b = Arc::new(Endpoint::default());
        (
            LinkedTransport {
                local: a.clone(),
                remote: b.clone(),
            },
            LinkedTransport {
                local: b,
                remote: a,
            },
        )
    }

    /// Close both directions. Queued messages are discarded and later posts fail.
    pub fn close(&self) {
        for endpoint in [&self.local, &self.remote] {
            let mut state = endpoint.state();
            state.closed = true;
            state.queue.clear();
        }
    }

    /// Messages waiting for this end's callback.
    pub fn queued(&self) -> usize {
        self.local.state().queue.len()
    }
}

impl Transport for LinkedTransport {
    fn post_message(&self, message: Message) -> Result<(), TransportError> {
        self.remote.deliver(Some(message))
    }

    fn set_onmessage(&self, handler: OnMessage) -> Result<(), TransportError> {
        {
            let mut state = self.local.state();
            if state.handler.is_some() {
                return Err(TransportError::AlreadyAttached);
            }
            state.handler = Some(handler);
        }
        self.local.deliver(None)
    }
}

impl fmt::Debug for LinkedTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkedTransport")
            .field("queued", &self.queued())
            .finish()
    }
}
