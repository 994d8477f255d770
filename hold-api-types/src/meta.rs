use anyhow::{bail, format_err, Error};
use bytes::Bytes;

/// Extension carrying the per-block sizes of a chunk. Canonical encoding,
/// written on every new chunk.
pub const BLOCK_SIZES_EXT_TAG: i32 = 1;

/// Synonymous legacy encoding of [`BLOCK_SIZES_EXT_TAG`]; accepted when
/// reading, never written.
pub const LEGACY_BLOCK_SIZES_EXT_TAG: i32 = 2;

/// Extension with per-partition row/byte accounting of partitioned chunks.
pub const PARTITIONS_EXT_TAG: i32 = 3;

/// One opaque typed extension of a chunk meta.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetaExtension {
    pub tag: i32,
    pub body: Bytes,
}

/// Chunk meta: a type, a format version and a bag of typed extensions.
///
/// Persisted in the `<id>.meta` sidecar as a length-prefixed binary record,
/// see [`ChunkMeta::encode`]. Unknown tags are preserved verbatim.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChunkMeta {
    pub chunk_type: i32,
    pub version: i32,
    pub extensions: Vec<MetaExtension>,
}

impl ChunkMeta {
    pub fn new(chunk_type: i32, version: i32) -> Self {
        Self {
            chunk_type,
            version,
            extensions: Vec::new(),
        }
    }

    pub fn find_extension(&self, tag: i32) -> Option<&MetaExtension> {
        self.extensions.iter().find(|ext| ext.tag == tag)
    }

    /// Insert or replace the extension with the given tag.
    pub fn set_extension(&mut self, tag: i32, body: Bytes) {
        match self.extensions.iter_mut().find(|ext| ext.tag == tag) {
            Some(ext) => ext.body = body,
            None => self.extensions.push(MetaExtension { tag, body }),
        }
    }

    pub fn remove_extension(&mut self, tag: i32) -> Option<MetaExtension> {
        let pos = self.extensions.iter().position(|ext| ext.tag == tag)?;
        Some(self.extensions.remove(pos))
    }

    /// Copy of this meta keeping only the extensions with the listed tags.
    pub fn filtered(&self, tags: &[i32]) -> Self {
        Self {
            chunk_type: self.chunk_type,
            version: self.version,
            extensions: self
                .extensions
                .iter()
                .filter(|ext| tags.contains(&ext.tag))
                .cloned()
                .collect(),
        }
    }

    /// Serialized sidecar form: `u32` total length, then `type`, `version`
    /// and the repeated `{tag, len, body}` extension records, all
    /// little-endian.
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&self.chunk_type.to_le_bytes());
        body.extend_from_slice(&self.version.to_le_bytes());
        for ext in &self.extensions {
            body.extend_from_slice(&ext.tag.to_le_bytes());
            body.extend_from_slice(&(ext.body.len() as i32).to_le_bytes());
            body.extend_from_slice(&ext.body);
        }

        let mut data = Vec::with_capacity(4 + body.len());
        data.extend_from_slice(&(body.len() as u32).to_le_bytes());
        data.extend_from_slice(&body);
        data
    }

    pub fn decode(data: &[u8]) -> Result<Self, Error> {
        let mut cursor = Cursor::new(data);
        let length = cursor.read_u32()? as usize;
        if cursor.remaining() != length {
            bail!(
                "chunk meta length mismatch - header says {}, got {}",
                length,
                cursor.remaining()
            );
        }

        let chunk_type = cursor.read_i32()?;
        let version = cursor.read_i32()?;

        let mut extensions = Vec::new();
        while cursor.remaining() > 0 {
            let tag = cursor.read_i32()?;
            let len = cursor.read_i32()?;
            if len < 0 {
                bail!("chunk meta extension {} has negative length", tag);
            }
            let body = cursor.read_bytes(len as usize)?;
            extensions.push(MetaExtension { tag, body });
        }

        Ok(Self {
            chunk_type,
            version,
            extensions,
        })
    }
}

/// Per-block sizes of a chunk, in block index order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BlockSizesExt {
    pub block_sizes: Vec<u64>,
}

impl BlockSizesExt {
    pub fn new(block_sizes: Vec<u64>) -> Self {
        Self { block_sizes }
    }

    pub fn encode(&self) -> Bytes {
        let mut data = Vec::with_capacity(4 + 8 * self.block_sizes.len());
        data.extend_from_slice(&(self.block_sizes.len() as u32).to_le_bytes());
        for size in &self.block_sizes {
            data.extend_from_slice(&size.to_le_bytes());
        }
        data.into()
    }

    pub fn decode(body: &[u8]) -> Result<Self, Error> {
        let mut cursor = Cursor::new(body);
        let count = cursor.read_u32()? as usize;
        let mut block_sizes = Vec::with_capacity(count);
        for _ in 0..count {
            block_sizes.push(cursor.read_u64()?);
        }
        if cursor.remaining() != 0 {
            bail!("trailing data in block sizes extension");
        }
        Ok(Self { block_sizes })
    }

    /// Reads the canonical extension, falling back to the legacy synonym tag.
    pub fn from_meta(meta: &ChunkMeta) -> Result<Self, Error> {
        let ext = meta
            .find_extension(BLOCK_SIZES_EXT_TAG)
            .or_else(|| meta.find_extension(LEGACY_BLOCK_SIZES_EXT_TAG))
            .ok_or_else(|| format_err!("chunk meta carries no block sizes extension"))?;
        Self::decode(&ext.body)
    }

    /// Writes the canonical encoding, dropping a legacy copy if present.
    pub fn store(&self, meta: &mut ChunkMeta) {
        meta.remove_extension(LEGACY_BLOCK_SIZES_EXT_TAG);
        meta.set_extension(BLOCK_SIZES_EXT_TAG, self.encode());
    }
}

/// One partition's share of a partitioned chunk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PartitionSlice {
    pub partition_tag: i32,
    pub row_count: i64,
    pub data_size: i64,
}

/// Per-partition accounting, filterable in place by partition tag.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PartitionsExt {
    pub slices: Vec<PartitionSlice>,
}

impl PartitionsExt {
    pub fn encode(&self) -> Bytes {
        let mut data = Vec::with_capacity(4 + 20 * self.slices.len());
        data.extend_from_slice(&(self.slices.len() as u32).to_le_bytes());
        for slice in &self.slices {
            data.extend_from_slice(&slice.partition_tag.to_le_bytes());
            data.extend_from_slice(&slice.row_count.to_le_bytes());
            data.extend_from_slice(&slice.data_size.to_le_bytes());
        }
        data.into()
    }

    pub fn decode(body: &[u8]) -> Result<Self, Error> {
        let mut cursor = Cursor::new(body);
        let count = cursor.read_u32()? as usize;
        let mut slices = Vec::with_capacity(count);
        for _ in 0..count {
            slices.push(PartitionSlice {
                partition_tag: cursor.read_i32()?,
                row_count: cursor.read_i64()?,
                data_size: cursor.read_i64()?,
            });
        }
        if cursor.remaining() != 0 {
            bail!("trailing data in partitions extension");
        }
        Ok(Self { slices })
    }

    pub fn retain_partition(&mut self, partition_tag: i32) {
        self.slices.retain(|slice| slice.partition_tag == partition_tag);
    }
}

struct Cursor<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }

    fn read_bytes(&mut self, len: usize) -> Result<Bytes, Error> {
        if self.remaining() < len {
            bail!("unexpected end of chunk meta data");
        }
        let bytes = Bytes::copy_from_slice(&self.data[self.offset..self.offset + len]);
        self.offset += len;
        Ok(bytes)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N], Error> {
        if self.remaining() < N {
            bail!("unexpected end of chunk meta data");
        }
        let mut array = [0u8; N];
        array.copy_from_slice(&self.data[self.offset..self.offset + N]);
        self.offset += N;
        Ok(array)
    }

    fn read_u32(&mut self) -> Result<u32, Error> {
        Ok(u32::from_le_bytes(self.read_array()?))
    }

    fn read_i32(&mut self) -> Result<i32, Error> {
        Ok(i32::from_le_bytes(self.read_array()?))
    }

    fn read_u64(&mut self) -> Result<u64, Error> {
        Ok(u64::from_le_bytes(self.read_array()?))
    }

    fn read_i64(&mut self) -> Result<i64, Error> {
        Ok(i64::from_le_bytes(self.read_array()?))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_meta_codec() {
        let mut meta = ChunkMeta::new(1, 0);
        BlockSizesExt::new(vec![10, 20, 30]).store(&mut meta);
        meta.set_extension(42, Bytes::from_static(b"opaque"));

        let encoded = meta.encode();
        let decoded = ChunkMeta::decode(&encoded).unwrap();
        assert_eq!(decoded, meta);

        let sizes = BlockSizesExt::from_meta(&decoded).unwrap();
        assert_eq!(sizes.block_sizes, vec![10, 20, 30]);

        // unknown tags survive filtering when listed
        let filtered = decoded.filtered(&[42]);
        assert_eq!(filtered.extensions.len(), 1);
        assert_eq!(filtered.extensions[0].tag, 42);
    }

    #[test]
    fn test_legacy_block_sizes_accepted() {
        let mut meta = ChunkMeta::new(1, 0);
        meta.set_extension(
            LEGACY_BLOCK_SIZES_EXT_TAG,
            BlockSizesExt::new(vec![7]).encode(),
        );

        let sizes = BlockSizesExt::from_meta(&meta).unwrap();
        assert_eq!(sizes.block_sizes, vec![7]);

        // storing rewrites to the canonical tag only
        sizes.store(&mut meta);
        assert!(meta.find_extension(LEGACY_BLOCK_SIZES_EXT_TAG).is_none());
        assert!(meta.find_extension(BLOCK_SIZES_EXT_TAG).is_some());
    }

    #[test]
    fn test_meta_decode_rejects_garbage() {
        assert!(ChunkMeta::decode(&[]).is_err());
        assert!(ChunkMeta::decode(&[1, 2, 3]).is_err());

        let mut encoded = ChunkMeta::new(1, 0).encode();
        encoded.push(0xff);
        assert!(ChunkMeta::decode(&encoded).is_err());
    }

    #[test]
    fn test_partition_filter() {
        let mut ext = PartitionsExt {
            slices: vec![
                PartitionSlice { partition_tag: 1, row_count: 5, data_size: 100 },
                PartitionSlice { partition_tag: 2, row_count: 7, data_size: 200 },
            ],
        };
        let decoded = PartitionsExt::decode(&ext.encode()).unwrap();
        assert_eq!(decoded, ext);

        ext.retain_partition(2);
        assert_eq!(ext.slices.len(), 1);
        assert_eq!(ext.slices[0].row_count, 7);
    }
}
