//! Request/response messaging between execution contexts.
//!
//! The layers, bottom up:
//! - [`wire`]: the field-tagged binary encoding shared with the module;
//! - [`protocol`]: the request/response/error envelope a [`Channel`] exchanges;
//! - [`transport`]: the point-to-point message pipe a [`Channel`] is attached to;
//! - [`channel`]: topic-addressed calls with per-call completion, plus [`Relay`] for
//!   forwarding topics across a second hop.

pub mod channel;
pub mod protocol;
pub mod relay;
pub mod transport;
pub mod wire;

pub use channel::{Channel, ChannelError, HandlerResult, Payload};
pub use protocol::{Envelope, RemoteError};
pub use relay::Relay;
pub use transport::{LinkedTransport, Message, OnMessage, Transferable, Transport, TransportError};
pub use wire::{DecodeError, WireBuilder, WireParser};
