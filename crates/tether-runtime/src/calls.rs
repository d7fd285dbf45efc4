//! Demo functions exported by the in-process module.

use tether_buffer::ElementType;
use tether_ipc::RemoteError;

use crate::module_host::{CallContext, CallTable, ModuleValue};

pub const COMPUTE_SUM: &str = "computeSum";
pub const ARRAY_MULTIPLY: &str = "arrayMultiply";
pub const MAKE_BUFFER: &str = "makeBuffer";
pub const NO_RETURN: &str = "noReturn";

fn type_error(message: impl Into<String>) -> RemoteError {
    RemoteError::new("TypeError", message)
}

fn arg<'a>(args: &'a [ModuleValue], index: usize) -> Result<&'a ModuleValue, RemoteError> {
    args.get(index)
        .ok_or_else(|| type_error(format!("missing argument {index}")))
}

fn buffer_type(value: &ModuleValue) -> Result<ElementType, RemoteError> {
    match value {
        ModuleValue::Buffer { element_type, .. } => Ok(*element_type),
        ModuleValue::Str(_) => Err(type_error("expected a buffer argument, got a string")),
    }
}

fn f32_elements(bytes: &[u8]) -> impl Iterator<Item = f32> + '_ {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
}

/// `computeSum(data)`: the sum of a `u8` or `f32` array, as a decimal string.
fn compute_sum(
    cx: &CallContext<'_>,
    args: &[ModuleValue],
) -> Result<Vec<ModuleValue>, RemoteError> {
    let data = arg(args, 0)?;
    let bytes = cx.read(data)?;
    let sum = match buffer_type(data)? {
        ElementType::U8 | ElementType::U8Clamped => {
            bytes.iter().map(|&b| u64::from(b)).sum::<u64>().to_string()
        }
        ElementType::F32 => f32_elements(&bytes).sum::<f32>().to_string(),
        other => return Err(type_error(format!("computeSum does not support {other} arrays"))),
    };
    Ok(vec![ModuleValue::Str(sum)])
}

/// `arrayMultiply(multiplier, data)`: a new array with every element scaled.
fn array_multiply(
    cx: &CallContext<'_>,
    args: &[ModuleValue],
) -> Result<Vec<ModuleValue>, RemoteError> {
    let multiplier: f64 = arg(args, 0)?
        .as_str()
        .and_then(|s| s.trim().parse().ok())
        .ok_or_else(|| type_error("multiplier must be a numeric string"))?;
    let data = arg(args, 1)?;
    let element_type = buffer_type(data)?;
    let bytes = cx.read(data)?;
    let scaled: Vec<u8> = match element_type {
        // Float to int casts saturate.
        ElementType::U8 | ElementType::U8Clamped => bytes
            .iter()
            .map(|&b| (f64::from(b) * multiplier) as u8)
            .collect(),
        ElementType::F32 => f32_elements(&bytes)
            .flat_map(|v| ((f64::from(v) * multiplier) as f32).to_le_bytes())
            .collect(),
        other => {
            return Err(type_error(format!(
                "arrayMultiply does not support {other} arrays"
            )))
        }
    };
    Ok(vec![cx.new_buffer(&scaled, element_type)?])
}

/// `makeBuffer()`: a read-only `u8` array `[1..=8]`.
fn make_buffer(
    cx: &CallContext<'_>,
    _: &[ModuleValue],
) -> Result<Vec<ModuleValue>, RemoteError> {
    let data: Vec<u8> = (1..=8).collect();
    Ok(vec![cx.new_read_only_buffer(&data, ElementType::U8)?])
}

/// The functions the demo module exports.
pub fn demo_calls() -> CallTable {
    let mut calls = CallTable::new();
    calls
        .register(COMPUTE_SUM, compute_sum)
        .register(ARRAY_MULTIPLY, array_multiply)
        .register(MAKE_BUFFER, make_buffer)
        .register(NO_RETURN, |_, _| Ok(Vec::new()));
    calls
}
