//! Topic-addressed request/response calls over a [`Transport`].
//!
//! Each side of a transport gets one [`Channel`]. [`Channel::send`] posts a request immediately
//! and returns a future for its response; [`Channel::receive`] installs the handler for a topic.
//! Handlers run as tasks on the tokio runtime the channel was created on, so calls complete
//! in whatever order their handlers finish.

use core::future::Future;
use core::panic::AssertUnwindSafe;
use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use futures_channel::oneshot;
use futures_util::future::{self, BoxFuture, FutureExt};
use thiserror::Error;
use tokio::runtime::Handle;

use crate::protocol::{Envelope, RemoteError};
use crate::transport::{Message, Transferable, Transport, TransportError};
use crate::wire::DecodeError;

/// Error name reported when a request names a topic nobody receives.
pub const NO_RECEIVER_FOR_TOPIC: &str = "NoReceiverForTopic";

/// Error name reported when a handler panics.
pub const HANDLER_PANIC: &str = "HandlerPanic";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("a receiver is already registered for topic {0:?}")]
    DuplicateReceiver(String),
    #[error("channels must be created from within a tokio runtime")]
    NoRuntime,
    #[error("channel is not attached to a transport")]
    NotAttached,
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("remote handler failed: {0}")]
    Remote(RemoteError),
    #[error("channel was closed before the response arrived")]
    Disconnected,
    #[error("failed to decode payload: {0}")]
    Decode(#[from] DecodeError),
}

impl ChannelError {
    /// Convert into the error reported to a remote caller, keeping remote errors verbatim.
    pub fn into_remote(self) -> RemoteError {
        match self {
            ChannelError::Remote(remote) => remote,
            other => RemoteError::from_error("ChannelError", &other),
        }
    }
}

pub type Result<T> = std::result::Result<T, ChannelError>;

/// Request or response body plus the objects moved along with it.
#[derive(Debug, Default)]
pub struct Payload {
    pub data: Vec<u8>,
    pub transfer: Vec<Transferable>,
}

impl Payload {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            transfer: Vec::new(),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_transfer(mut self, transfer: Vec<Transferable>) -> Self {
        self.transfer = transfer;
        self
    }
}

/// What a handler produces: the response payload or the error reported to the caller.
pub type HandlerResult = std::result::Result<Payload, RemoteError>;
type Handler = Arc<dyn Fn(Payload) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

struct State {
    transport: Option<Arc<dyn Transport>>,
    next_id: u32,
    pending: HashMap<u32, oneshot::Sender<HandlerResult>>,
    receivers: HashMap<String, Handler>,
    closed: bool,
}

struct ChannelInner {
    runtime: Handle,
    state: Mutex<State>,
}

#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl Channel {
    /// Unattached channel whose handlers run on the current tokio runtime.
    ///
    /// Register receivers before [`Channel::attach`] so that requests already queued on the
    /// transport find them.
    pub fn new() -> Result<Self> {
        let runtime = Handle::try_current().map_err(|_| ChannelError::NoRuntime)?;
        Ok(Self::with_runtime(runtime))
    }

    pub fn with_runtime(runtime: Handle) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                runtime,
                state: Mutex::new(State {
                    transport: None,
                    next_id: 0,
                    pending: HashMap::new(),
                    receivers: HashMap::new(),
                    closed: false,
                }),
            }),
        }
    }

    /// Create a channel on the current runtime and attach it to `transport` right away.
    pub fn connect(transport: Arc<dyn Transport>) -> Result<Self> {
        let channel = Self::new()?;
        channel.attach(transport)?;
        Ok(channel)
    }

    /// Start exchanging messages over `transport`.
    ///
    /// Fails with [`TransportError::AlreadyAttached`] if either the channel or the transport
    /// endpoint is already attached. Inbound messages are dropped once every clone of the
    /// channel is gone.
    pub fn attach(&self, transport: Arc<dyn Transport>) -> Result<()> {
        {
            let mut state = self.inner.state();
            if state.transport.is_some() {
                return Err(TransportError::AlreadyAttached.into());
            }
            state.transport = Some(transport.clone());
        }
        let weak: Weak<ChannelInner> = Arc::downgrade(&self.inner);
        let attached = transport.set_onmessage(Arc::new(move |message: Message| {
            match weak.upgrade() {
                Some(inner) => inner.on_message(message),
                None => tracing::debug!("dropping message for a released channel"),
            }
        }));
        if let Err(err) = attached {
            self.inner.state().transport = None;
            return Err(err.into());
        }
        Ok(())
    }

    /// Post a request for `topic`.
    ///
    /// The request is on the transport by the time this returns; the future only waits for the
    /// response. Dropping the future does not cancel the remote handler.
    pub fn send(
        &self,
        topic: &str,
        payload: Payload,
    ) -> impl Future<Output = Result<Payload>> + Send + 'static {
        let posted = self.try_send(topic, payload);
        async move { posted?.await }
    }

    /// Like [`Channel::send`], but reports a request that never reached the transport
    /// separately from failures after it was posted.
    pub fn try_send(
        &self,
        topic: &str,
        payload: Payload,
    ) -> Result<impl Future<Output = Result<Payload>> + Send + 'static> {
        let response = self.inner.post_request(topic, payload)?;
        Ok(async move {
            match response.await {
                Ok(Ok(payload)) => Ok(payload),
                Ok(Err(remote)) => Err(ChannelError::Remote(remote)),
                Err(oneshot::Canceled) => Err(ChannelError::Disconnected),
            }
        })
    }

    /// Install the handler for `topic`.
    pub fn receive<F, Fut>(&self, topic: &str, handler: F) -> Result<()>
    where
        F: Fn(Payload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.inner
            .add_receiver(topic, Arc::new(move |payload| handler(payload).boxed()))
    }

    /// Install a handler that completes without awaiting anything.
    pub fn receive_sync<F>(&self, topic: &str, handler: F) -> Result<()>
    where
        F: Fn(Payload) -> HandlerResult + Send + Sync + 'static,
    {
        self.inner.add_receiver(
            topic,
            Arc::new(move |payload| future::ready(handler(payload)).boxed()),
        )
    }

    pub fn has_receiver(&self, topic: &str) -> bool {
        self.inner.state().receivers.contains_key(topic)
    }

    /// Calls still waiting for a response.
    pub fn pending_calls(&self) -> usize {
        self.inner.state().pending.len()
    }

    /// Fails the way [`Channel::send`] would if nothing could be posted right now.
    pub fn ensure_open(&self) -> Result<()> {
        let state = self.inner.state();
        if state.closed {
            return Err(ChannelError::Disconnected);
        }
        if state.transport.is_none() {
            return Err(ChannelError::NotAttached);
        }
        Ok(())
    }

    /// Fail every pending call with [`ChannelError::Disconnected`] and stop serving requests.
    pub fn close(&self) {
        let (pending, receivers) = {
            let mut state = self.inner.state();
            state.closed = true;
            (
                std::mem::take(&mut state.pending),
                std::mem::take(&mut state.receivers),
            )
        };
        tracing::debug!(pending = pending.len(), "closing channel");
        drop(pending);
        drop(receivers);
    }
}

impl core::fmt::Debug for Channel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let state = self.inner.state();
        f.debug_struct("Channel")
            .field("pending", &state.pending.len())
            .field("receivers", &state.receivers.len())
            .field("closed", &state.closed)
            .finish()
    }
}

impl ChannelInner {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transport(&self) -> Option<Arc<dyn Transport>> {
        self.state().transport.clone()
    }

    fn add_receiver(&self, topic: &str, handler: Handler) -> Result<()> {
        let mut state = self.state();
        if state.receivers.contains_key(topic) {
            return Err(ChannelError::DuplicateReceiver(topic.to_owned()));
        }
        state.receivers.insert(topic.to_owned(), handler);
        Ok(())
    }

    fn post_request(
        &self,
        topic: &str,
        payload: Payload,
    ) -> Result<oneshot::Receiver<HandlerResult>> {
        let (tx, rx) = oneshot::channel();
        let (id, transport) = {
            let mut state = self.state();
            if state.closed {
                return Err(ChannelError::Disconnected);
            }
            let transport = state.transport.clone().ok_or(ChannelError::NotAttached)?;
            // Ids wrap; skip any still in flight.
            let id = loop {
                let id = state.next_id;
                state.next_id = id.wrapping_add(1);
                if !state.pending.contains_key(&id) {
                    break id;
                }
            };
            state.pending.insert(id, tx);
            (id, transport)
        };

        let envelope = Envelope::Request {
            id,
            topic: topic.to_owned(),
            payload: payload.data,
        };
        tracing::trace!(id, topic, "posting request");
        if let Err(err) = transport.post_message(Message::new(envelope.encode(), payload.transfer))
        {
            self.state().pending.remove(&id);
            return Err(err.into());
        }
        Ok(rx)
    }

    fn on_message(self: Arc<Self>, message: Message) {
        let envelope = match Envelope::decode(&message.data) {
            Ok(envelope) => envelope,
            Err(err) => {
                tracing::warn!(%err, "dropping undecodable channel message");
                return;
            }
        };
        match envelope {
            Envelope::Request { id, topic, payload } => {
                let payload = Payload {
                    data: payload,
                    transfer: message.transfer,
                };
                self.dispatch(id, topic, payload);
            }
            Envelope::Response { id, payload } => {
                let payload = Payload {
                    data: payload,
                    transfer: message.transfer,
                };
                self.complete(id, Ok(payload));
            }
            Envelope::Error { id, error } => self.complete(id, Err(error)),
        }
    }

    fn dispatch(self: Arc<Self>, id: u32, topic: String, payload: Payload) {
        let handler = self.state().receivers.get(&topic).cloned();
        let Some(handler) = handler else {
            tracing::debug!(id, topic = %topic, "request for topic without a receiver");
            let err = RemoteError::new(
                NO_RECEIVER_FOR_TOPIC,
                format!("no receiver registered for topic {topic:?}"),
            );
            self.respond(id, Err(err));
            return;
        };

        let runtime = self.runtime.clone();
        runtime.spawn(async move {
            // The handler is invoked inside the guarded future so a panic while building the
            // future is caught as well.
            let result = AssertUnwindSafe(async move { handler(payload).await })
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| Err(panic_to_remote(panic)));
            self.respond(id, result);
        });
    }

    fn respond(&self, id: u32, result: HandlerResult) {
        let message = match result {
            Ok(payload) => Message::new(
                Envelope::Response {
                    id,
                    payload: payload.data,
                }
                .encode(),
                payload.transfer,
            ),
            Err(error) => Message::new(Envelope::Error { id, error }.encode(), Vec::new()),
        };
        let Some(transport) = self.transport() else {
            tracing::warn!(id, "dropping response for a detached channel");
            return;
        };
        if let Err(err) = transport.post_message(message) {
            tracing::warn!(id, %err, "failed to post response");
        }
    }

    fn complete(&self, id: u32, result: HandlerResult) {
        let pending = self.state().pending.remove(&id);
        match pending {
            // The receiver is gone if the caller dropped its future.
            Some(tx) => drop(tx.send(result)),
            None => tracing::debug!(id, "dropping response for unknown call"),
        }
    }
}

fn panic_to_remote(panic: Box<dyn Any + Send>) -> RemoteError {
    let message = if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_owned()
    };
    RemoteError::new(HANDLER_PANIC, message)
}
