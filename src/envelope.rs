//! Envelope framing and payload codec
//!
//! Every segment starts with a fixed little-endian header followed by the
//! payload:
//!
//! ```text
//! offset 0   magic            u32  0x524D454D ("RMEM")
//! offset 4   format version   u8
//! offset 5   generation       u64
//! offset 13  payload length   u64
//! offset 21  payload bytes
//! ```
//!
//! Payloads are `bincode` with fixed-width little-endian integers. Decoding
//! rejects trailing bytes and never allocates more than the payload length.

use crate::error::{RememoryError, Result};
use bincode::Options;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Magic number at offset 0
pub const MAGIC: u32 = 0x524D_454D; // "RMEM"

/// Current envelope format version
pub const FORMAT_VERSION: u8 = 1;

/// Size of the fixed header in bytes
pub const HEADER_SIZE: usize = 21;

const MAGIC_OFFSET: usize = 0;
const VERSION_OFFSET: usize = 4;
const GENERATION_OFFSET: usize = 5;
const LENGTH_OFFSET: usize = 13;

/// Fixed-size envelope header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvelopeHeader {
    pub version: u8,
    pub generation: u64,
    pub payload_len: u64,
}

impl EnvelopeHeader {
    pub fn new(generation: u64, payload_len: usize) -> Self {
        Self {
            version: FORMAT_VERSION,
            generation,
            payload_len: payload_len as u64,
        }
    }

    /// Serialize the header into the first [`HEADER_SIZE`] bytes of `buf`
    pub fn write_to(&self, buf: &mut [u8]) {
        buf[MAGIC_OFFSET..VERSION_OFFSET].copy_from_slice(&MAGIC.to_le_bytes());
        buf[VERSION_OFFSET] = self.version;
        buf[GENERATION_OFFSET..LENGTH_OFFSET].copy_from_slice(&self.generation.to_le_bytes());
        buf[LENGTH_OFFSET..HEADER_SIZE].copy_from_slice(&self.payload_len.to_le_bytes());
    }

    /// Parse the header at the start of `buf`
    ///
    /// An all-zero header belongs to a region nobody has written yet and
    /// parses as `Ok(None)`.
    pub fn read_from(buf: &[u8]) -> Result<Option<Self>> {
        if buf.len() < HEADER_SIZE {
            return Err(RememoryError::corrupted(format!(
                "buffer of {} bytes is shorter than the {} byte header",
                buf.len(),
                HEADER_SIZE
            )));
        }
        if buf[..HEADER_SIZE].iter().all(|&b| b == 0) {
            return Ok(None);
        }

        let magic = u32::from_le_bytes(read_array(buf, MAGIC_OFFSET));
        if magic != MAGIC {
            return Err(RememoryError::corrupted(format!(
                "invalid magic 0x{:08X}, expected 0x{:08X}",
                magic, MAGIC
            )));
        }

        let version = buf[VERSION_OFFSET];
        if version != FORMAT_VERSION {
            return Err(RememoryError::corrupted(format!(
                "unsupported format version {}, expected {}",
                version, FORMAT_VERSION
            )));
        }

        Ok(Some(Self {
            version,
            generation: u64::from_le_bytes(read_array(buf, GENERATION_OFFSET)),
            payload_len: u64::from_le_bytes(read_array(buf, LENGTH_OFFSET)),
        }))
    }
}

fn read_array<const N: usize>(buf: &[u8], offset: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&buf[offset..offset + N]);
    out
}

/// A parsed envelope borrowing its payload from the segment
#[derive(Debug)]
pub struct Envelope<'a> {
    pub header: EnvelopeHeader,
    pub payload: &'a [u8],
}

impl<'a> Envelope<'a> {
    /// Locate header and payload inside `buf`
    pub fn parse(buf: &'a [u8]) -> Result<Option<Self>> {
        let Some(header) = EnvelopeHeader::read_from(buf)? else {
            return Ok(None);
        };

        let available = (buf.len() - HEADER_SIZE) as u64;
        if header.payload_len > available {
            return Err(RememoryError::corrupted(format!(
                "payload length {} exceeds the {} bytes after the header",
                header.payload_len, available
            )));
        }

        let end = HEADER_SIZE + header.payload_len as usize;
        Ok(Some(Self {
            header,
            payload: &buf[HEADER_SIZE..end],
        }))
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        decode_payload(self.payload)
    }
}

fn options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
}

/// Serialize a value to payload bytes
pub fn encode_payload<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    Ok(options().serialize(value)?)
}

/// Deserialize payload bytes produced by [`encode_payload`]
pub fn decode_payload<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
    Ok(options()
        .with_limit(payload.len() as u64)
        .reject_trailing_bytes()
        .deserialize(payload)?)
}

/// Frame an already encoded payload
pub fn frame(generation: u64, payload: &[u8]) -> Vec<u8> {
    let mut buf = vec![0u8; HEADER_SIZE + payload.len()];
    EnvelopeHeader::new(generation, payload.len()).write_to(&mut buf);
    buf[HEADER_SIZE..].copy_from_slice(payload);
    buf
}

/// Encode `value` into a complete envelope
pub fn encode<T: Serialize + ?Sized>(generation: u64, value: &T) -> Result<Vec<u8>> {
    Ok(frame(generation, &encode_payload(value)?))
}

/// Decode a complete envelope; `Ok(None)` for a never-written region
pub fn decode<T: DeserializeOwned>(buf: &[u8]) -> Result<Option<(EnvelopeHeader, T)>> {
    match Envelope::parse(buf)? {
        Some(envelope) => Ok(Some((envelope.header, envelope.decode()?))),
        None => Ok(None),
    }
}
