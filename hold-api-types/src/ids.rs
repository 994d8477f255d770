use std::fmt;
use std::str::FromStr;

use anyhow::{bail, format_err, Error};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// 128 bit chunk identifier.
///
/// Rendered as 32 lowercase hex digits. The first byte selects the shard
/// subdirectory a chunk lives in on disk.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChunkId([u8; 16]);

impl ChunkId {
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// First byte of the id; selects the `00`..`ff` shard directory.
    pub fn shard_byte(&self) -> u8 {
        self.0[0]
    }

    pub fn shard_name(&self) -> String {
        format!("{:02x}", self.0[0])
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ChunkId({})", self)
    }
}

impl FromStr for ChunkId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        if s.len() != 32 {
            bail!("invalid chunk id '{}' - expected 32 hex digits", s);
        }
        let bytes = hex::decode(s)
            .map_err(|err| format_err!("invalid chunk id '{}' - {}", s, err))?;
        let mut id = [0u8; 16];
        id.copy_from_slice(&bytes);
        Ok(Self(id))
    }
}

impl Serialize for ChunkId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ChunkId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Addresses one block inside a chunk.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockId {
    pub chunk_id: ChunkId,
    pub block_index: u32,
}

impl BlockId {
    pub fn new(chunk_id: ChunkId, block_index: u32) -> Self {
        Self {
            chunk_id,
            block_index,
        }
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.chunk_id, self.block_index)
    }
}

/// Identifier of the cluster cell a location belongs to.
///
/// Persisted as hex in the `cell_guid` tag file at the location root.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CellGuid([u8; 16]);

impl CellGuid {
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for CellGuid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for CellGuid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "CellGuid({})", self)
    }
}

impl FromStr for CellGuid {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        let s = s.trim();
        if s.len() != 32 {
            bail!("invalid cell guid '{}' - expected 32 hex digits", s);
        }
        let bytes =
            hex::decode(s).map_err(|err| format_err!("invalid cell guid '{}' - {}", s, err))?;
        let mut guid = [0u8; 16];
        guid.copy_from_slice(&bytes);
        Ok(Self(guid))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_chunk_id_roundtrip() {
        let id: ChunkId = "00112233445566778899aabbccddeeff".parse().unwrap();
        assert_eq!(id.shard_byte(), 0x00);
        assert_eq!(id.shard_name(), "00");
        assert_eq!(id.to_string(), "00112233445566778899aabbccddeeff");

        let other: ChunkId = "ff112233445566778899aabbccddeeff".parse().unwrap();
        assert_eq!(other.shard_name(), "ff");
        assert!(id < other);

        assert!("00112233".parse::<ChunkId>().is_err());
        assert!("zz112233445566778899aabbccddeeff".parse::<ChunkId>().is_err());
    }

    #[test]
    fn test_block_id_display() {
        let id: ChunkId = "00112233445566778899aabbccddeeff".parse().unwrap();
        let block = BlockId::new(id, 7);
        assert_eq!(block.to_string(), "00112233445566778899aabbccddeeff:7");
    }
}
