//! Task messages submitted through the work queue.
//!
//! Every message starts with its type and the address of its `i32` return word, so the helper
//! can report a result for any message it understands.

use tether_ipc::{DecodeError, WireBuilder, WireParser};

const STREAM_NEW: u32 = 1;
const STREAM_READ: u32 = 2;

/// Request that opens a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRequest {
    pub url: String,
    pub method: String,
    pub body: Vec<u8>,
    pub headers: Vec<(String, String)>,
}

impl StreamRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: "GET".to_owned(),
            body: Vec::new(),
            headers: Vec::new(),
        }
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into();
        self
    }

    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskMessage {
    /// Open a stream; the return word receives the stream id or the error sentinel.
    StreamNew { ret_ptr: u32, request: StreamRequest },
    /// Read up to `buf_len` bytes into `buf_ptr`; the return word receives the byte count
    /// (0 at end of stream) or the error sentinel.
    StreamRead {
        ret_ptr: u32,
        stream_id: i32,
        buf_ptr: u32,
        buf_len: u32,
    },
}

impl TaskMessage {
    pub fn ret_ptr(&self) -> u32 {
        match self {
            TaskMessage::StreamNew { ret_ptr, .. } | TaskMessage::StreamRead { ret_ptr, .. } => {
                *ret_ptr
            }
        }
    }

    pub fn encode(&self) -> WireBuilder {
        let mut b = WireBuilder::new();
        match self {
            TaskMessage::StreamNew { ret_ptr, request } => {
                b.push_u32(STREAM_NEW)
                    .push_u32(*ret_ptr)
                    .push_str(&request.url)
                    .push_str(&request.method)
                    .push_bytes(&request.body)
                    .push_u32(request.headers.len() as u32);
                for (name, value) in &request.headers {
                    b.push_str(name).push_str(value);
                }
            }
            TaskMessage::StreamRead {
                ret_ptr,
                stream_id,
                buf_ptr,
                buf_len,
            } => {
                b.push_u32(STREAM_READ)
                    .push_u32(*ret_ptr)
                    .push_i32(*stream_id)
                    .push_u32(*buf_ptr)
                    .push_u32(*buf_len);
            }
        }
        b
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut p = WireParser::new(bytes)?;
        let ty = p.read_u32()?;
        let ret_ptr = p.read_u32()?;
        let msg = match ty {
            STREAM_NEW => {
                let url = p.read_str()?.to_owned();
                let method = p.read_str()?.to_owned();
                let body = p.read_bytes()?.to_vec();
                let count = p.read_u32()?;
                let mut headers = Vec::new();
                for _ in 0..count {
                    let name = p.read_str()?.to_owned();
                    let value = p.read_str()?.to_owned();
                    headers.push((name, value));
                }
                TaskMessage::StreamNew {
                    ret_ptr,
                    request: StreamRequest {
                        url,
                        method,
                        body,
                        headers,
                    },
                }
            }
            STREAM_READ => TaskMessage::StreamRead {
                ret_ptr,
                stream_id: p.read_i32()?,
                buf_ptr: p.read_u32()?,
                buf_len: p.read_u32()?,
            },
            other => {
                return Err(DecodeError::InvalidValue {
                    field: "task message type",
                    value: other.into(),
                })
            }
        };
        p.finish()?;
        Ok(msg)
    }
}
