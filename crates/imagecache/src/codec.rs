//! Conversion between cached values and the bytes stored on disk.

use bytes::Bytes;

use crate::caching::DecodeError;

/// Encodes and decodes the values held by the caches.
///
/// The same codec is used to decode freshly downloaded bytes and to persist values in the
/// [`DiskCache`](crate::caching::DiskCache), so everything that is written can be read back.
pub trait ValueCodec: Send + Sync + 'static {
    /// The decoded value type.
    type Value: Clone + Send + Sync + 'static;

    /// Serializes `value` into the bytes written to a cache file.
    fn encode(&self, value: &Self::Value) -> Bytes;

    /// Parses bytes that were downloaded or read from a cache file.
    fn decode(&self, bytes: Bytes) -> Result<Self::Value, DecodeError>;

    /// The cost of keeping `value` in the in-memory cache, in bytes.
    ///
    /// This is a best-effort approximation. The default only accounts for the value's inline
    /// size and should be overridden for anything that owns heap memory.
    fn weight(&self, value: &Self::Value) -> u64 {
        std::mem::size_of_val(value) as u64
    }
}

/// A codec that keeps the raw bytes as they are.
///
/// This is what callers use when they want to cache the encoded image and decode it themselves.
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesCodec;

impl ValueCodec for BytesCodec {
    type Value = Bytes;

    fn encode(&self, value: &Bytes) -> Bytes {
        value.clone()
    }

    fn decode(&self, bytes: Bytes) -> Result<Bytes, DecodeError> {
        Ok(bytes)
    }

    fn weight(&self, value: &Bytes) -> u64 {
        value.len() as u64
    }
}
