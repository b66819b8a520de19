//! The interface contract with generated DSDL types
//!
//! An external code generator produces record types; the presentation layer
//! only needs them to serialize into bytes and back. The marker traits keep
//! messages out of service slots and vice versa at compile time.

use core::fmt;

/// A type that can be written to the wire
pub trait Serialize {
    /// The exact number of bytes `serialize` will produce
    fn size_bytes(&self) -> usize;

    /// Writes the record into `buffer`, which is `size_bytes()` long
    fn serialize(&self, buffer: &mut [u8]);
}

/// A type that can be read back from the wire
pub trait Deserialize: Sized {
    /// The largest serialized size this type declares; receive buffers are
    /// dimensioned to it
    const EXTENT_BYTES: usize;

    /// Interprets a received payload
    ///
    /// Implementations must tolerate payloads shorter or longer than the
    /// nominal size (implicit zero extension and truncation).
    fn deserialize(bytes: &[u8]) -> Result<Self, DeserializeError>;
}

/// Marker: a record published over a subject
pub trait Message {}

/// Marker: the request half of a service
pub trait Request {}

/// Marker: the response half of a service
pub trait Response {}

/// A payload that could not be interpreted as its DSDL type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeserializeError(pub &'static str);

impl fmt::Display for DeserializeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "malformed payload: {}", self.0)
    }
}

impl std::error::Error for DeserializeError {}

/// Serializes a record into a freshly sized buffer
pub(crate) fn do_serialize<T: Serialize + ?Sized>(record: &T) -> Vec<u8> {
    let mut buffer = vec![0u8; record.size_bytes()];
    record.serialize(&mut buffer);
    buffer
}

/// Raw bytes as a message, for tooling that works below the DSDL layer
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RawBytes(pub Vec<u8>);

impl Message for RawBytes {}

impl Serialize for RawBytes {
    fn size_bytes(&self) -> usize {
        self.0.len()
    }
    fn serialize(&self, buffer: &mut [u8]) {
        buffer.copy_from_slice(&self.0);
    }
}

impl Deserialize for RawBytes {
    const EXTENT_BYTES: usize = 1 << 16;

    fn deserialize(bytes: &[u8]) -> Result<Self, DeserializeError> {
        Ok(RawBytes(bytes.to_vec()))
    }
}
