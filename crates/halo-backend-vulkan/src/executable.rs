//! Packed executable definition records.
//!
//! ```text
//! +--------+-------------+------------+---------------------------+
//! | "HSPV" | version u32 | length u32 | SpirVExecutableDef bytes  |
//! +--------+-------------+------------+---------------------------+
//! ```
//!
//! Integers are little-endian. The runtime checks the header before decoding.

use prost::Message;

use crate::proto::SpirVExecutableDef;

/// Record magic.
pub const MAGIC: [u8; 4] = *b"HSPV";
/// Current record version.
pub const VERSION: u32 = 1;
/// Size of the header preceding the payload.
pub const HEADER_LEN: usize = 12;

/// Errors validating or decoding a packed record.
#[derive(Debug, thiserror::Error)]
pub enum ExecutableError {
    #[error("record is {0} bytes, shorter than its header")]
    Truncated(usize),
    #[error("bad magic {0:02x?}")]
    BadMagic([u8; 4]),
    #[error("unsupported record version {0}")]
    UnsupportedVersion(u32),
    #[error("header declares {declared} payload bytes, found {actual}")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("payload too large to pack ({0} bytes)")]
    TooLarge(usize),
    #[error("failed to decode executable definition: {0}")]
    Decode(#[from] prost::DecodeError),
}

/// Encodes `def` behind the record header.
pub fn pack(def: &SpirVExecutableDef) -> Result<Vec<u8>, ExecutableError> {
    let payload = def.encode_to_vec();
    let length = u32::try_from(payload.len()).map_err(|_| ExecutableError::TooLarge(payload.len()))?;
    let mut bytes = Vec::with_capacity(HEADER_LEN + payload.len());
    bytes.extend_from_slice(&MAGIC);
    bytes.extend_from_slice(&VERSION.to_le_bytes());
    bytes.extend_from_slice(&length.to_le_bytes());
    bytes.extend_from_slice(&payload);
    Ok(bytes)
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_le_bytes(word)
}

/// Validates the header of `bytes` and decodes the definition.
pub fn unpack(bytes: &[u8]) -> Result<SpirVExecutableDef, ExecutableError> {
    if bytes.len() < HEADER_LEN {
        return Err(ExecutableError::Truncated(bytes.len()));
    }
    let mut magic = [0u8; 4];
    magic.copy_from_slice(&bytes[..4]);
    if magic != MAGIC {
        return Err(ExecutableError::BadMagic(magic));
    }
    let version = read_u32(bytes, 4);
    if version != VERSION {
        return Err(ExecutableError::UnsupportedVersion(version));
    }
    let declared = read_u32(bytes, 8) as usize;
    let payload = &bytes[HEADER_LEN..];
    if declared != payload.len() {
        return Err(ExecutableError::LengthMismatch {
            declared,
            actual: payload.len(),
        });
    }
    Ok(SpirVExecutableDef::decode(payload)?)
}

impl SpirVExecutableDef {
    /// Ordinal the runtime dispatches `name` through.
    pub fn entry_point_ordinal(&self, name: &str) -> Option<usize> {
        self.entry_points.iter().position(|ep| ep == name)
    }

    /// SPIR-V code as little-endian bytes.
    pub fn code_bytes(&self) -> Vec<u8> {
        crate::spirv::words_to_bytes(&self.code)
    }
}
