//! Binary codec for mutations and operations.
//!
//! bincode (standard config) over serde. Payload floats are rounded to
//! three decimals before encoding, so `decode(encode(m))` equals the
//! normalized form of `m` exactly.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::op::{Mutation, Operation};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CodecError {
    #[error("encode failed: {0}")]
    Encode(String),
    #[error("decode failed: {0}")]
    Decode(String),
}

pub(crate) fn to_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| CodecError::Encode(e.to_string()))
}

pub(crate) fn from_bytes<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| CodecError::Decode(e.to_string()))?;
    Ok(value)
}

pub fn encode_mutation(mutation: &Mutation) -> Result<Vec<u8>, CodecError> {
    to_bytes(&mutation.clone().normalized())
}

pub fn decode_mutation(bytes: &[u8]) -> Result<Mutation, CodecError> {
    from_bytes(bytes)
}

pub fn encode_operation(op: &Operation) -> Result<Vec<u8>, CodecError> {
    let normalized = Operation {
        mutation: op.mutation.clone().normalized(),
        ..op.clone()
    };
    to_bytes(&normalized)
}

pub fn decode_operation(bytes: &[u8]) -> Result<Operation, CodecError> {
    from_bytes(bytes)
}

/// Encode each operation separately so a corrupt entry can be dropped on
/// its own.
pub fn encode_operations(ops: &[Operation]) -> Result<Vec<Vec<u8>>, CodecError> {
    ops.iter().map(encode_operation).collect()
}
