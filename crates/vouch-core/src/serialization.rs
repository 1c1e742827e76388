//! Canonical binary serialization (bincode) for stored and transmitted values.

use crate::errors::CoreError;
use serde::{de::DeserializeOwned, Serialize};

pub fn to_vec<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, CoreError> {
    bincode::serialize(value).map_err(|e| CoreError::serialization(e.to_string()))
}

pub fn from_slice<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CoreError> {
    bincode::deserialize(bytes).map_err(|e| CoreError::malformed(e.to_string()))
}
