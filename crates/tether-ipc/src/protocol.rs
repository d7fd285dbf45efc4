//! Envelope exchanged between two attached channels.

use thiserror::Error;

use crate::wire::{DecodeError, WireBuilder, WireParser};

const KIND_REQUEST: u32 = 0;
const KIND_RESPONSE: u32 = 1;
const KIND_ERROR: u32 = 2;

/// Error raised by a remote handler, carried back verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{name}: {message}")]
pub struct RemoteError {
    pub name: String,
    pub message: String,
    pub trace: Option<String>,
}

impl RemoteError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            trace: None,
        }
    }

    pub fn with_trace(mut self, trace: impl Into<String>) -> Self {
        self.trace = Some(trace.into());
        self
    }

    /// Report a local error under `name`, keeping its source chain as the trace.
    pub fn from_error(name: impl Into<String>, err: &(dyn std::error::Error + 'static)) -> Self {
        let mut trace = String::new();
        let mut source = err.source();
        while let Some(cause) = source {
            if !trace.is_empty() {
                trace.push('\n');
            }
            trace.push_str("caused by: ");
            trace.push_str(&cause.to_string());
            source = cause.source();
        }
        let remote = Self::new(name, err.to_string());
        if trace.is_empty() {
            remote
        } else {
            remote.with_trace(trace)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Envelope {
    Request {
        id: u32,
        topic: String,
        payload: Vec<u8>,
    },
    Response {
        id: u32,
        payload: Vec<u8>,
    },
    Error {
        id: u32,
        error: RemoteError,
    },
}

impl Envelope {
    pub fn id(&self) -> u32 {
        match self {
            Envelope::Request { id, .. } | Envelope::Response { id, .. } | Envelope::Error { id, .. } => *id,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut b = WireBuilder::new();
        match self {
            Envelope::Request { id, topic, payload } => {
                b.push_u32(KIND_REQUEST)
                    .push_u32(*id)
                    .push_str(topic)
                    .push_bytes(payload);
            }
            Envelope::Response { id, payload } => {
                b.push_u32(KIND_RESPONSE).push_u32(*id).push_bytes(payload);
            }
            Envelope::Error { id, error } => {
                b.push_u32(KIND_ERROR)
                    .push_u32(*id)
                    .push_str(&error.name)
                    .push_str(&error.message);
                match &error.trace {
                    Some(trace) => b.push_u32(1).push_str(trace),
                    None => b.push_u32(0),
                };
            }
        }
        b.finish()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut p = WireParser::new(bytes)?;
        let kind = p.read_u32()?;
        let id = p.read_u32()?;
        let envelope = match kind {
            KIND_REQUEST => Envelope::Request {
                id,
                topic: p.read_str()?.to_owned(),
                payload: p.read_bytes()?.to_vec(),
            },
            KIND_RESPONSE => Envelope::Response {
                id,
                payload: p.read_bytes()?.to_vec(),
            },
            KIND_ERROR => {
                let name = p.read_str()?.to_owned();
                let message = p.read_str()?.to_owned();
                let trace = match p.read_u32()? {
                    0 => None,
                    1 => Some(p.read_str()?.to_owned()),
                    other => {
                        return Err(DecodeError::InvalidValue {
                            field: "trace flag",
                            value: other.into(),
                        })
                    }
                };
                Envelope::Error {
                    id,
                    error: RemoteError {
                        name,
                        message,
                        trace,
                    },
                }
            }
            other => {
                return Err(DecodeError::InvalidValue {
                    field: "envelope kind",
                    value: other.into(),
                })
            }
        };
        p.finish()?;
        Ok(envelope)
    }
}
