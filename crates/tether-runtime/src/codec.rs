//! Payload encodings of the runtime topics, on top of the wire format.
//!
//! A value is a kind word followed by its fields:
//! - `0` string: the string;
//! - `1` bytes: element type, bytes (copied into a fresh module vector by the receiver);
//! - `2` buffer: element type, ownership kind (`0` exclusive, `1` refcounted), ptr, len and
//!   capacity or refcount handle.

use tether_buffer::{BufferDescriptor, ElementType, Ownership};
use tether_ipc::{DecodeError, WireBuilder, WireParser};
use tether_mem::RefHandle;
use tether_thread::ThreadRegion;

const VALUE_STR: u32 = 0;
const VALUE_BYTES: u32 = 1;
const VALUE_BUFFER: u32 = 2;

const OWNERSHIP_EXCLUSIVE: u32 = 0;
const OWNERSHIP_REFCOUNTED: u32 = 1;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum WireValue {
    Str(String),
    Bytes {
        element_type: ElementType,
        data: Vec<u8>,
    },
    Buffer {
        descriptor: BufferDescriptor,
        element_type: ElementType,
    },
}

fn push_element_type(b: &mut WireBuilder, element_type: ElementType) {
    b.push_u32(element_type.tag().into());
}

fn read_element_type(p: &mut WireParser<'_>) -> Result<ElementType, DecodeError> {
    let tag = p.read_u32()?;
    u8::try_from(tag)
        .ok()
        .and_then(ElementType::from_tag)
        .ok_or(DecodeError::InvalidValue {
            field: "element type",
            value: tag.into(),
        })
}

fn push_descriptor(b: &mut WireBuilder, descriptor: &BufferDescriptor) {
    let (kind, extra) = match descriptor.ownership {
        Ownership::Exclusive { capacity } => (OWNERSHIP_EXCLUSIVE, capacity),
        Ownership::SharedRefcounted { handle } => (OWNERSHIP_REFCOUNTED, handle.0),
    };
    b.push_u32(kind)
        .push_u32(descriptor.ptr)
        .push_u32(descriptor.len)
        .push_u32(extra);
}

fn read_descriptor(p: &mut WireParser<'_>) -> Result<BufferDescriptor, DecodeError> {
    let kind = p.read_u32()?;
    let ptr = p.read_u32()?;
    let len = p.read_u32()?;
    let extra = p.read_u32()?;
    match kind {
        OWNERSHIP_EXCLUSIVE => Ok(BufferDescriptor::exclusive(ptr, len, extra)),
        OWNERSHIP_REFCOUNTED => Ok(BufferDescriptor::refcounted(ptr, len, RefHandle(extra))),
        other => Err(DecodeError::InvalidValue {
            field: "buffer ownership",
            value: other.into(),
        }),
    }
}

fn push_values(b: &mut WireBuilder, values: &[WireValue]) {
    b.push_u32(values.len() as u32);
    for value in values {
        match value {
            WireValue::Str(s) => {
                b.push_u32(VALUE_STR).push_str(s);
            }
            WireValue::Bytes { element_type, data } => {
                b.push_u32(VALUE_BYTES);
                push_element_type(b, *element_type);
                b.push_bytes(data);
            }
            WireValue::Buffer {
                descriptor,
                element_type,
            } => {
                b.push_u32(VALUE_BUFFER);
                push_element_type(b, *element_type);
                push_descriptor(b, descriptor);
            }
        }
    }
}

fn read_values(p: &mut WireParser<'_>) -> Result<Vec<WireValue>, DecodeError> {
    let count = p.read_u32()?;
    let mut values = Vec::new();
    for _ in 0..count {
        let value = match p.read_u32()? {
            VALUE_STR => WireValue::Str(p.read_str()?.to_owned()),
            VALUE_BYTES => WireValue::Bytes {
                element_type: read_element_type(p)?,
                data: p.read_bytes()?.to_vec(),
            },
            VALUE_BUFFER => WireValue::Buffer {
                element_type: read_element_type(p)?,
                descriptor: read_descriptor(p)?,
            },
            other => {
                return Err(DecodeError::InvalidValue {
                    field: "value kind",
                    value: other.into(),
                })
            }
        };
        values.push(value);
    }
    Ok(values)
}

pub(crate) fn encode_values(values: &[WireValue]) -> Vec<u8> {
    let mut b = WireBuilder::new();
    push_values(&mut b, values);
    b.finish()
}

pub(crate) fn decode_values(bytes: &[u8]) -> Result<Vec<WireValue>, DecodeError> {
    let mut p = WireParser::new(bytes)?;
    let values = read_values(&mut p)?;
    p.finish()?;
    Ok(values)
}

pub(crate) fn encode_handle(handle: RefHandle) -> Vec<u8> {
    let mut b = WireBuilder::new();
    b.push_u32(handle.0);
    b.finish()
}

pub(crate) fn decode_handle(bytes: &[u8]) -> Result<RefHandle, DecodeError> {
    let mut p = WireParser::new(bytes)?;
    let handle = RefHandle(p.read_u32()?);
    p.finish()?;
    Ok(handle)
}

pub(crate) fn encode_descriptor(descriptor: &BufferDescriptor) -> Vec<u8> {
    let mut b = WireBuilder::new();
    push_descriptor(&mut b, descriptor);
    b.finish()
}

pub(crate) fn decode_descriptor(bytes: &[u8]) -> Result<BufferDescriptor, DecodeError> {
    let mut p = WireParser::new(bytes)?;
    let descriptor = read_descriptor(&mut p)?;
    p.finish()?;
    Ok(descriptor)
}

/// Body of `CreateBuffer` and `CreateReadOnlyBuffer`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct BufferRequest {
    pub element_type: ElementType,
    pub data: Vec<u8>,
}

impl BufferRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut b = WireBuilder::new();
        push_element_type(&mut b, self.element_type);
        b.push_bytes(&self.data);
        b.finish()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut p = WireParser::new(bytes)?;
        let element_type = read_element_type(&mut p)?;
        let data = p.read_bytes()?.to_vec();
        p.finish()?;
        Ok(Self { element_type, data })
    }
}

/// Body of `CallModule`.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct CallRequest {
    pub name: String,
    pub args: Vec<WireValue>,
}

impl CallRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut b = WireBuilder::new();
        b.push_str(&self.name);
        push_values(&mut b, &self.args);
        b.finish()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut p = WireParser::new(bytes)?;
        let name = p.read_str()?.to_owned();
        let args = read_values(&mut p)?;
        p.finish()?;
        Ok(Self { name, args })
    }
}

/// Body of `ThreadSpawn`.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct SpawnMessage {
    pub ctx_ptr: u32,
    pub region: ThreadRegion,
}

impl SpawnMessage {
    pub fn encode(self) -> Vec<u8> {
        let (ptr, size, tls_size) = self.region.into_parts();
        let mut b = WireBuilder::new();
        b.push_u32(self.ctx_ptr)
            .push_u32(ptr)
            .push_u32(size)
            .push_u32(tls_size);
        b.finish()
    }

    /// Decode a spawn request for a module whose memory is `memory_len` bytes.
    pub fn decode(bytes: &[u8], memory_len: usize) -> crate::error::Result<Self> {
        let mut p = WireParser::new(bytes)?;
        let ctx_ptr = p.read_u32()?;
        let (ptr, size, tls_size) = (p.read_u32()?, p.read_u32()?, p.read_u32()?);
        p.finish()?;
        let region = ThreadRegion::from_parts(ptr, size, tls_size, memory_len)?;
        Ok(Self { ctx_ptr, region })
    }
}

#[cfg(test)]
mod tests {
    use tether_thread::BootstrapError;

    use super::*;
    use crate::error::RuntimeError;

    #[test]
    fn call_request_keeps_every_value_kind() {
        let request = CallRequest {
            name: "arrayMultiply".into(),
            args: vec![
                WireValue::Str("10".into()),
                WireValue::Bytes {
                    element_type: ElementType::U8,
                    data: vec![1, 2, 3],
                },
                WireValue::Buffer {
                    descriptor: BufferDescriptor::refcounted(256, 8, RefHandle(512)),
                    element_type: ElementType::F32,
                },
                WireValue::Buffer {
                    descriptor: BufferDescriptor::exclusive(1024, 3, 16),
                    element_type: ElementType::U8,
                },
            ],
        };
        assert_eq!(CallRequest::decode(&request.encode()).unwrap(), request);
    }

    #[test]
    fn unknown_tags_are_rejected() {
        let mut b = WireBuilder::new();
        b.push_u32(11).push_bytes(&[]);
        assert_eq!(
            BufferRequest::decode(b.as_bytes()),
            Err(DecodeError::InvalidValue {
                field: "element type",
                value: 11
            })
        );

        let mut b = WireBuilder::new();
        b.push_u32(7).push_u32(0).push_u32(0).push_u32(0);
        assert!(matches!(
            decode_descriptor(b.as_bytes()),
            Err(DecodeError::InvalidValue {
                field: "buffer ownership",
                ..
            })
        ));
    }

    #[test]
    fn spawn_message_carries_the_region() {
        let message = SpawnMessage {
            ctx_ptr: 0x4000,
            region: ThreadRegion::from_parts(0x8000, 4120, 24, 1 << 20).unwrap(),
        };
        let decoded = SpawnMessage::decode(&message.encode(), 1 << 20).unwrap();
        assert_eq!(decoded.ctx_ptr, 0x4000);
        assert_eq!(decoded.region.into_parts(), (0x8000, 4120, 24));
    }

    #[test]
    fn spawn_message_with_a_bad_region_is_rejected() {
        let mut b = WireBuilder::new();
        b.push_u32(0x4000).push_u32(0x8000).push_u32(8).push_u32(24);
        let err = SpawnMessage::decode(&b.finish(), 1 << 20).unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::Bootstrap(BootstrapError::InvalidRegion { size: 8, .. })
        ));

        // Fits the sender's idea of memory but not this one.
        let message = SpawnMessage {
            ctx_ptr: 0x4000,
            region: ThreadRegion::from_parts(0x8000, 4120, 24, 1 << 20).unwrap(),
        };
        assert!(SpawnMessage::decode(&message.encode(), 0x8000).is_err());
    }
}
