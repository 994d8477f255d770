//! Chunk files on disk: an append-only data file plus an atomically written
//! `.meta` sidecar.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use anyhow::{bail, format_err, Error};
use bytes::Bytes;

use hold_api_types::{BlockSizesExt, ChunkId, ChunkInfo, ChunkMeta, CHUNK_META_SUFFIX};

pub fn meta_file_path(data_path: &Path) -> PathBuf {
    let mut os = data_path.as_os_str().to_os_string();
    os.push(CHUNK_META_SUFFIX);
    os.into()
}

fn tmp_file_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".tmp");
    os.into()
}

/// Read and decode a meta sidecar. A zero length sidecar means the rename
/// that should have made it visible never completed consistently; that is
/// not recoverable.
pub fn read_meta_file(data_path: &Path) -> Result<ChunkMeta, Error> {
    let meta_path = meta_file_path(data_path);
    let mut file = File::open(&meta_path)
        .map_err(|err| format_err!("unable to open chunk meta {:?} - {}", meta_path, err))?;
    let mut data = Vec::new();
    file.read_to_end(&mut data)
        .map_err(|err| format_err!("unable to read chunk meta {:?} - {}", meta_path, err))?;
    if data.is_empty() {
        bail!("chunk meta {:?} is empty", meta_path);
    }
    ChunkMeta::decode(&data)
        .map_err(|err| format_err!("corrupt chunk meta {:?} - {}", meta_path, err))
}

/// Write the sidecar atomically: write to a `.tmp` neighbor, fsync, rename,
/// fsync the directory handle to persist the rename.
pub fn write_meta_file(data_path: &Path, meta: &ChunkMeta) -> Result<(), Error> {
    let meta_path = meta_file_path(data_path);
    let tmp_path = tmp_file_path(&meta_path);

    let encoded = meta.encode();

    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&tmp_path)
        .map_err(|err| format_err!("unable to create {:?} - {}", tmp_path, err))?;
    file.write_all(&encoded)?;
    file.sync_all()?;
    drop(file);

    std::fs::rename(&tmp_path, &meta_path)
        .map_err(|err| format_err!("unable to rename {:?} into place - {}", tmp_path, err))?;

    if let Some(dir_path) = meta_path.parent() {
        let dir = File::open(dir_path)?;
        dir.sync_all()
            .map_err(|err| format_err!("fsync of {:?} failed - {}", dir_path, err))?;
    }

    Ok(())
}

/// Sequential writer for one chunk. Blocks are appended in index order; the
/// sidecar is produced on close with the observed block sizes stored in the
/// canonical extension.
pub struct ChunkFileWriter {
    chunk_id: ChunkId,
    path: PathBuf,
    file: Option<File>,
    block_sizes: Vec<u64>,
    data_size: u64,
}

impl ChunkFileWriter {
    pub fn create(chunk_id: ChunkId, path: PathBuf) -> Result<Self, Error> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|err| format_err!("unable to create {:?} - {}", parent, err))?;
        }
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|err| format_err!("unable to create chunk file {:?} - {}", path, err))?;
        Ok(Self {
            chunk_id,
            path,
            file: Some(file),
            block_sizes: Vec::new(),
            data_size: 0,
        })
    }

    pub fn chunk_id(&self) -> ChunkId {
        self.chunk_id
    }

    pub fn block_count(&self) -> u32 {
        self.block_sizes.len() as u32
    }

    pub fn data_size(&self) -> u64 {
        self.data_size
    }

    pub fn write_block(&mut self, data: &[u8]) -> Result<(), Error> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| format_err!("chunk file {:?} already closed", self.path))?;
        file.write_all(data)?;
        self.block_sizes.push(data.len() as u64);
        self.data_size += data.len() as u64;
        Ok(())
    }

    /// Flush the data file and write the meta sidecar. Consumes the writer;
    /// the chunk is complete once this returns.
    pub fn close(mut self, meta: &ChunkMeta) -> Result<ChunkInfo, Error> {
        let file = self
            .file
            .take()
            .ok_or_else(|| format_err!("chunk file {:?} already closed", self.path))?;
        file.sync_all()
            .map_err(|err| format_err!("fsync of chunk {} failed - {}", self.chunk_id, err))?;
        drop(file);

        let mut final_meta = meta.clone();
        BlockSizesExt::new(std::mem::take(&mut self.block_sizes)).store(&mut final_meta);
        write_meta_file(&self.path, &final_meta)?;

        Ok(ChunkInfo::new(self.data_size))
    }

    /// Delete whatever this writer produced. Used on session cancellation.
    pub fn abort(mut self) -> Result<(), Error> {
        self.file.take();
        remove_if_exists(&self.path)?;
        remove_if_exists(&meta_file_path(&self.path))?;
        remove_if_exists(&tmp_file_path(&meta_file_path(&self.path)))?;
        Ok(())
    }
}

fn remove_if_exists(path: &Path) -> Result<(), Error> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => bail!("unable to remove {:?} - {}", path, err),
    }
}

/// Reader over a complete chunk. Opens both files, decodes the meta once
/// and serves positioned block reads. Safe for concurrent use.
pub struct ChunkFileReader {
    chunk_id: ChunkId,
    file: File,
    meta: ChunkMeta,
    block_offsets: Vec<u64>,
    block_sizes: Vec<u64>,
}

impl ChunkFileReader {
    pub fn open(chunk_id: ChunkId, path: &Path) -> Result<Self, Error> {
        let meta = read_meta_file(path)?;
        let block_sizes = BlockSizesExt::from_meta(&meta)?.block_sizes;

        let mut block_offsets = Vec::with_capacity(block_sizes.len());
        let mut offset = 0;
        for size in &block_sizes {
            block_offsets.push(offset);
            offset += size;
        }

        let file = File::open(path)
            .map_err(|err| format_err!("unable to open chunk file {:?} - {}", path, err))?;

        Ok(Self {
            chunk_id,
            file,
            meta,
            block_offsets,
            block_sizes,
        })
    }

    pub fn chunk_id(&self) -> ChunkId {
        self.chunk_id
    }

    pub fn meta(&self) -> &ChunkMeta {
        &self.meta
    }

    pub fn block_count(&self) -> u32 {
        self.block_sizes.len() as u32
    }

    pub fn block_size(&self, block_index: u32) -> Option<u64> {
        self.block_sizes.get(block_index as usize).copied()
    }

    pub fn data_size(&self) -> u64 {
        self.block_sizes.iter().sum()
    }

    pub fn read_block(&self, block_index: u32) -> Result<Bytes, Error> {
        let index = block_index as usize;
        if index >= self.block_sizes.len() {
            bail!(
                "chunk {} has no block {} ({} blocks total)",
                self.chunk_id,
                block_index,
                self.block_sizes.len()
            );
        }
        let mut buffer = vec![0u8; self.block_sizes[index] as usize];
        self.file
            .read_exact_at(&mut buffer, self.block_offsets[index])
            .map_err(|err| {
                format_err!(
                    "error reading block {} of chunk {} - {}",
                    block_index,
                    self.chunk_id,
                    err
                )
            })?;
        Ok(buffer.into())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn test_id() -> ChunkId {
        "0badc0de0badc0de0badc0de0badc0de".parse().unwrap()
    }

    #[test]
    fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("0b").join(test_id().to_string());

        let mut writer = ChunkFileWriter::create(test_id(), path.clone()).unwrap();
        writer.write_block(b"alpha").unwrap();
        writer.write_block(b"bb").unwrap();
        writer.write_block(b"gamma!").unwrap();
        let info = writer.close(&ChunkMeta::new(1, 0)).unwrap();
        assert_eq!(info.size, 13);

        let reader = ChunkFileReader::open(test_id(), &path).unwrap();
        assert_eq!(reader.block_count(), 3);
        assert_eq!(reader.block_size(1), Some(2));
        assert_eq!(reader.read_block(0).unwrap(), Bytes::from_static(b"alpha"));
        assert_eq!(reader.read_block(2).unwrap(), Bytes::from_static(b"gamma!"));
        assert!(reader.read_block(3).is_err());
    }

    #[test]
    fn test_abort_removes_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("0b").join(test_id().to_string());

        let mut writer = ChunkFileWriter::create(test_id(), path.clone()).unwrap();
        writer.write_block(b"partial").unwrap();
        writer.abort().unwrap();

        assert!(!path.exists());
        assert!(!meta_file_path(&path).exists());
    }

    #[test]
    fn test_empty_meta_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("0b").join(test_id().to_string());
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"data").unwrap();
        std::fs::write(meta_file_path(&path), b"").unwrap();

        assert!(ChunkFileReader::open(test_id(), &path).is_err());
    }

    #[test]
    fn test_create_refuses_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("0b").join(test_id().to_string());

        let writer = ChunkFileWriter::create(test_id(), path.clone()).unwrap();
        drop(writer);
        assert!(ChunkFileWriter::create(test_id(), path).is_err());
    }
}
