//! Positioned block I/O on a shared file.
//!
//! Blocks complete in any order across workers, so every access seeks to the
//! absolute offset `index * block_size`; nothing relies on the file cursor
//! between calls.

use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::protocol_core::ensure_parent_exists;

#[derive(Debug)]
pub struct BlockFile {
    file: Mutex<File>,
    length: u64,
}

impl BlockFile {
    /// Open an existing file for reading blocks.
    pub fn open_read(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        let meta = file.metadata()?;
        if meta.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is a directory", path.display()),
            ));
        }
        Ok(Self {
            length: meta.len(),
            file: Mutex::new(file),
        })
    }

    /// Open or create a file for writing blocks without truncating existing
    /// content, then size it to `length`.
    pub fn open_write(path: &Path, length: u64) -> io::Result<Self> {
        ensure_parent_exists(path)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        if file.metadata()?.len() != length {
            file.set_len(length)?;
        }
        Ok(Self {
            file: Mutex::new(file),
            length,
        })
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    /// Byte length of block `index`, clipped at end of file.
    pub fn block_len(&self, index: u64, block_size: u64) -> u64 {
        let start = index.saturating_mul(block_size);
        self.length.saturating_sub(start).min(block_size)
    }

    pub fn read_block(&self, index: u64, block_size: u64) -> io::Result<Vec<u8>> {
        let len = self.checked_len(index, block_size)?;
        let mut buf = vec![0u8; len as usize];
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(index * block_size))?;
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    pub fn write_block(&self, index: u64, block_size: u64, data: &[u8]) -> io::Result<()> {
        let len = self.checked_len(index, block_size)?;
        if data.len() as u64 != len {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("block {index} expects {len} bytes, got {}", data.len()),
            ));
        }
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(index * block_size))?;
        file.write_all(data)
    }

    pub fn sync(&self) -> io::Result<()> {
        self.file.lock().sync_data()
    }

    fn checked_len(&self, index: u64, block_size: u64) -> io::Result<u64> {
        if block_size == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "zero block size"));
        }
        let len = self.block_len(index, block_size);
        if len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("block {index} is past end of file ({} bytes)", self.length),
            ));
        }
        Ok(len)
    }
}
