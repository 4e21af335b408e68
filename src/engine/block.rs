//! STRATA - Block Store
//! Fixed-size, block-addressed file I/O shared by the WAL and SSTables.
//!
//! Every file managed by the engine is a sequence of `block_size` blocks.
//! Logical records are zero-padded up to, or spread across, whole blocks.
//!
//! The store is handed to every component as a [`SharedBlockStore`] so that
//! tests can swap the disk for [`MemoryBlockStore`].

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::error::{Result, StrataError};

/// Block-addressed storage over named files.
pub trait BlockStore: Send + Sync {
    /// Size of every block in bytes.
    fn block_size(&self) -> usize;

    /// Read block `block` of `path`.
    ///
    /// Returns `Ok(None)` past the end of the file. A missing file is an I/O
    /// error, a trailing partial block is corruption.
    fn read_block(&self, path: &Path, block: u64) -> Result<Option<Vec<u8>>>;

    /// Read block `block` from the underlying storage, skipping any cache
    /// layer in between.
    fn read_block_direct(&self, path: &Path, block: u64) -> Result<Option<Vec<u8>>> {
        self.read_block(path, block)
    }

    /// Write `data` (at most one block, zero-padded) at block `block`.
    /// Creates the file if needed and leaves other blocks untouched.
    fn write_block(&self, path: &Path, block: u64, data: &[u8]) -> Result<()>;

    /// Write one block after the last block of `path`; returns its number.
    fn append_block(&self, path: &Path, data: &[u8]) -> Result<u64>;

    /// Spread `data` over consecutive new blocks; returns the first one.
    fn append(&self, path: &Path, data: &[u8]) -> Result<u64>;

    /// Number of whole blocks in `path`; zero if it does not exist.
    fn block_count(&self, path: &Path) -> Result<u64>;

    /// Flush `path` to stable storage.
    fn sync(&self, path: &Path) -> Result<()>;

    /// Delete one file. Deleting a missing file is not an error.
    fn remove_file(&self, path: &Path) -> Result<()>;

    /// Delete a directory and everything below it. Missing is not an error.
    fn remove_dir(&self, dir: &Path) -> Result<()>;

    /// Rename a file or a directory.
    fn rename(&self, from: &Path, to: &Path) -> Result<()>;
}

/// Handle to the block store shared by all engine components.
pub type SharedBlockStore = Arc<dyn BlockStore>;

/// Number of blocks needed to hold `len` bytes.
pub fn blocks_for(len: usize, block_size: usize) -> usize {
    len.div_ceil(block_size).max(1)
}

fn pad_block(data: &[u8], block_size: usize) -> Result<Vec<u8>> {
    if data.len() > block_size {
        return Err(StrataError::Corruption(format!(
            "block payload of {} bytes exceeds block size {}",
            data.len(),
            block_size
        )));
    }
    let mut block = vec![0u8; block_size];
    block[..data.len()].copy_from_slice(data);
    Ok(block)
}

/// Disk-backed block store.
///
/// A single mutex serializes all block I/O across every file.
pub struct FileBlockManager {
    block_size: usize,
    lock: Mutex<()>,
}

impl FileBlockManager {
    /// Create a block manager with the given block size.
    pub fn new(block_size: usize) -> Self {
        Self {
            block_size,
            lock: Mutex::new(()),
        }
    }

    fn file_blocks(&self, path: &Path) -> Result<u64> {
        match fs::metadata(path) {
            Ok(meta) => Ok(meta.len() / self.block_size as u64),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn write_at(&self, path: &Path, block: u64, data: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)?;
        file.seek(SeekFrom::Start(block * self.block_size as u64))?;
        file.write_all(data)?;
        Ok(())
    }
}

impl BlockStore for FileBlockManager {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn read_block(&self, path: &Path, block: u64) -> Result<Option<Vec<u8>>> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut file = File::open(path)?;
        let len = file.metadata()?.len();
        let offset = block * self.block_size as u64;
        if offset >= len {
            return Ok(None);
        }
        if offset + self.block_size as u64 > len {
            return Err(StrataError::Corruption(format!(
                "short block {} in {:?}: file is {} bytes",
                block, path, len
            )));
        }
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; self.block_size];
        file.read_exact(&mut buf)?;
        Ok(Some(buf))
    }

    fn write_block(&self, path: &Path, block: u64, data: &[u8]) -> Result<()> {
        let padded = pad_block(data, self.block_size)?;
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        self.write_at(path, block, &padded)
    }

    fn append_block(&self, path: &Path, data: &[u8]) -> Result<u64> {
        let padded = pad_block(data, self.block_size)?;
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let block = self.file_blocks(path)?;
        self.write_at(path, block, &padded)?;
        Ok(block)
    }

    fn append(&self, path: &Path, data: &[u8]) -> Result<u64> {
        let total = blocks_for(data.len(), self.block_size) * self.block_size;
        let mut padded = data.to_vec();
        padded.resize(total, 0);
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let start = self.file_blocks(path)?;
        self.write_at(path, start, &padded)?;
        Ok(start)
    }

    fn block_count(&self, path: &Path) -> Result<u64> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        self.file_blocks(path)
    }

    fn sync(&self, path: &Path) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        match File::open(path) {
            Ok(file) => file.sync_all().map_err(Into::into),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn remove_file(&self, path: &Path) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn remove_dir(&self, dir: &Path) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        match fs::remove_dir_all(dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        fs::rename(from, to)?;
        Ok(())
    }
}

/// In-memory block store. Paths are plain map keys; nothing touches disk.
pub struct MemoryBlockStore {
    block_size: usize,
    files: Mutex<HashMap<PathBuf, Vec<u8>>>,
}

impl MemoryBlockStore {
    pub fn new(block_size: usize) -> Self {
        Self {
            block_size,
            files: Mutex::new(HashMap::new()),
        }
    }

    fn write_at(files: &mut HashMap<PathBuf, Vec<u8>>, path: &Path, offset: usize, data: &[u8]) {
        let file = files.entry(path.to_path_buf()).or_default();
        if file.len() < offset + data.len() {
            file.resize(offset + data.len(), 0);
        }
        file[offset..offset + data.len()].copy_from_slice(data);
    }
}

impl BlockStore for MemoryBlockStore {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn read_block(&self, path: &Path, block: u64) -> Result<Option<Vec<u8>>> {
        let files = self.files.lock().unwrap_or_else(|e| e.into_inner());
        let file = files.get(path).ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, format!("{:?}", path))
        })?;
        let offset = block as usize * self.block_size;
        if offset >= file.len() {
            return Ok(None);
        }
        Ok(Some(file[offset..offset + self.block_size].to_vec()))
    }

    fn write_block(&self, path: &Path, block: u64, data: &[u8]) -> Result<()> {
        let padded = pad_block(data, self.block_size)?;
        let mut files = self.files.lock().unwrap_or_else(|e| e.into_inner());
        Self::write_at(&mut files, path, block as usize * self.block_size, &padded);
        Ok(())
    }

    fn append_block(&self, path: &Path, data: &[u8]) -> Result<u64> {
        let padded = pad_block(data, self.block_size)?;
        let mut files = self.files.lock().unwrap_or_else(|e| e.into_inner());
        let block = files.get(path).map_or(0, |f| f.len() / self.block_size);
        Self::write_at(&mut files, path, block * self.block_size, &padded);
        Ok(block as u64)
    }

    fn append(&self, path: &Path, data: &[u8]) -> Result<u64> {
        let mut padded = data.to_vec();
        padded.resize(blocks_for(data.len(), self.block_size) * self.block_size, 0);
        let mut files = self.files.lock().unwrap_or_else(|e| e.into_inner());
        let start = files.get(path).map_or(0, |f| f.len() / self.block_size);
        Self::write_at(&mut files, path, start * self.block_size, &padded);
        Ok(start as u64)
    }

    fn block_count(&self, path: &Path) -> Result<u64> {
        let files = self.files.lock().unwrap_or_else(|e| e.into_inner());
        Ok(files.get(path).map_or(0, |f| (f.len() / self.block_size) as u64))
    }

    fn sync(&self, _path: &Path) -> Result<()> {
        Ok(())
    }

    fn remove_file(&self, path: &Path) -> Result<()> {
        let mut files = self.files.lock().unwrap_or_else(|e| e.into_inner());
        files.remove(path);
        Ok(())
    }

    fn remove_dir(&self, dir: &Path) -> Result<()> {
        let mut files = self.files.lock().unwrap_or_else(|e| e.into_inner());
        files.retain(|path, _| !path.starts_with(dir));
        Ok(())
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        let mut files = self.files.lock().unwrap_or_else(|e| e.into_inner());
        let moved: Vec<PathBuf> = files
            .keys()
            .filter(|path| path.starts_with(from))
            .cloned()
            .collect();
        if moved.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{:?}", from),
            )
            .into());
        }
        for path in moved {
            if let Some(data) = files.remove(&path) {
                let suffix = path.strip_prefix(from).unwrap_or(Path::new(""));
                let target = if suffix.as_os_str().is_empty() {
                    to.to_path_buf()
                } else {
                    to.join(suffix)
                };
                files.insert(target, data);
            }
        }
        Ok(())
    }
}
