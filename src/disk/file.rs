//! Spill file format
//!
//! ```text
//! ┌──────────────────────────┬───────────┐
//! │ Payload (value bytes)    │ CRC32 (4) │
//! └──────────────────────────┴───────────┘
//! ```

use std::io;

use bytes::Bytes;

/// Size of the CRC32 trailer
pub const TRAILER_SIZE: usize = 4;

/// Frame a value for writing to disk
pub fn encode(value: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(value.len() + TRAILER_SIZE);
    buf.extend_from_slice(value);
    buf.extend_from_slice(&crc32fast::hash(value).to_le_bytes());
    buf
}

/// Verify and strip the trailer of a spill file
pub fn decode(mut raw: Vec<u8>) -> io::Result<Bytes> {
    if raw.len() < TRAILER_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("spill file truncated to {} bytes", raw.len()),
        ));
    }

    let payload_len = raw.len() - TRAILER_SIZE;
    let mut trailer = [0u8; TRAILER_SIZE];
    trailer.copy_from_slice(&raw[payload_len..]);
    let expected = u32::from_le_bytes(trailer);
    let actual = crc32fast::hash(&raw[..payload_len]);

    if expected != actual {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "spill file checksum mismatch: expected {:08x}, got {:08x}",
                expected, actual
            ),
        ));
    }

    raw.truncate(payload_len);
    Ok(Bytes::from(raw))
}
