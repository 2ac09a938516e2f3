//! CBOR codec for message bodies.

use crate::error::{CodecError, Result};
use bytes::Bytes;
use serde::{Serialize, de::DeserializeOwned};

/// Encode a message into CBOR bytes.
///
/// # Errors
///
/// Returns an error if the message cannot be serialized.
pub fn encode<T: Serialize>(msg: &T) -> Result<Bytes> {
    let mut vec = Vec::new();
    ciborium::ser::into_writer(msg, &mut vec).map_err(CodecError::from)?;
    Ok(Bytes::from(vec))
}

/// Decode CBOR bytes into a message.
///
/// # Errors
///
/// Returns an error if the data is invalid or the message cannot be deserialized.
pub fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
    ciborium::de::from_reader(data)
        .map_err(CodecError::from)
        .map_err(Into::into)
}
