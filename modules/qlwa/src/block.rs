use std::cell::RefCell;
use std::fs::{File, OpenOptions, TryLockError};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::rc::Rc;

use log::{trace, warn};
use qlvfs::{VfsError, VfsResult};

use crate::config::SECTOR_SIZE;

pub type BlockId = u64;

pub trait BlockDevice {
    fn block_size(&self) -> usize;
    fn block_count(&self) -> u64;
    fn read_block(&self, block_id: BlockId, buf: &mut [u8]) -> VfsResult<()>;
    fn write_block(&self, block_id: BlockId, buf: &[u8]) -> VfsResult<()>;
    fn flush(&self) -> VfsResult<()>;

    fn is_writable(&self) -> bool {
        true
    }

    /// Grow or shrink the device; only `format` asks for this.
    fn resize(&self, _blocks: u64) -> VfsResult<()> {
        Err(VfsError::InvalidParameter)
    }
}

pub struct BlockCache {
    device: Box<dyn BlockDevice>,
    block_size: usize,
}

impl BlockCache {
    pub fn new(device: Box<dyn BlockDevice>) -> Self {
        let block_size = device.block_size();
        Self { device, block_size }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn block_count(&self) -> u64 {
        self.device.block_count()
    }

    pub fn is_writable(&self) -> bool {
        self.device.is_writable()
    }

    pub fn resize(&self, blocks: u64) -> VfsResult<()> {
        self.device.resize(blocks)
    }

    pub fn read_block(&self, block_id: BlockId, buf: &mut [u8]) -> VfsResult<()> {
        if buf.len() < self.block_size {
            return Err(VfsError::InvalidParameter);
        }
        self.device.read_block(block_id, &mut buf[..self.block_size])
    }

    pub fn write_block(&self, block_id: BlockId, buf: &[u8]) -> VfsResult<()> {
        if buf.len() < self.block_size {
            return Err(VfsError::InvalidParameter);
        }
        self.device.write_block(block_id, &buf[..self.block_size])
    }

    /// Read `buf.len()` bytes starting at byte `offset`.
    pub fn read_bytes(&self, offset: u64, buf: &mut [u8]) -> VfsResult<()> {
        let block_size = self.block_size as u64;
        let mut scratch = vec![0u8; self.block_size];
        let mut done = 0usize;
        while done < buf.len() {
            let pos = offset + done as u64;
            let block = pos / block_size;
            let in_block = (pos % block_size) as usize;
            let chunk = core::cmp::min(buf.len() - done, self.block_size - in_block);
            if in_block == 0 && chunk == self.block_size {
                self.device.read_block(block, &mut buf[done..done + chunk])?;
            } else {
                self.device.read_block(block, &mut scratch)?;
                buf[done..done + chunk].copy_from_slice(&scratch[in_block..in_block + chunk]);
            }
            done += chunk;
        }
        Ok(())
    }

    /// Write `buf` starting at byte `offset`; partial sectors are merged.
    pub fn write_bytes(&self, offset: u64, buf: &[u8]) -> VfsResult<()> {
        let block_size = self.block_size as u64;
        let mut scratch = vec![0u8; self.block_size];
        let mut done = 0usize;
        while done < buf.len() {
            let pos = offset + done as u64;
            let block = pos / block_size;
            let in_block = (pos % block_size) as usize;
            let chunk = core::cmp::min(buf.len() - done, self.block_size - in_block);
            if in_block == 0 && chunk == self.block_size {
                self.device.write_block(block, &buf[done..done + chunk])?;
            } else {
                self.device.read_block(block, &mut scratch)?;
                scratch[in_block..in_block + chunk].copy_from_slice(&buf[done..done + chunk]);
                self.device.write_block(block, &scratch)?;
            }
            done += chunk;
        }
        Ok(())
    }

    pub fn flush(&self) -> VfsResult<()> {
        self.device.flush()
    }
}

pub(crate) fn io_error(err: io::Error) -> VfsError {
    warn!("backing store i/o failed: {err}");
    match err.kind() {
        io::ErrorKind::NotFound => VfsError::NotFound,
        io::ErrorKind::PermissionDenied => VfsError::ReadOnly,
        io::ErrorKind::OutOfMemory => VfsError::OutOfMemory,
        io::ErrorKind::UnexpectedEof => VfsError::CorruptVolume,
        _ => VfsError::Io,
    }
}

pub struct FileDevice {
    file: File,
    writable: bool,
}

impl FileDevice {
    pub fn open(path: &Path, writable: bool) -> VfsResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(writable)
            .open(path)
            .map_err(io_error)?;
        Ok(Self { file, writable })
    }

    pub fn create(path: &Path, blocks: u64) -> VfsResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(io_error)?;
        file.set_len(blocks * SECTOR_SIZE as u64).map_err(io_error)?;
        Ok(Self {
            file,
            writable: true,
        })
    }

    /// Take the advisory exclusive lock on the whole file. The lock is
    /// released when the device is dropped.
    pub fn try_lock(&self) -> VfsResult<()> {
        match self.file.try_lock() {
            Ok(()) => Ok(()),
            Err(TryLockError::WouldBlock) => Err(VfsError::LockUnavailable),
            Err(TryLockError::Error(err)) => Err(io_error(err)),
        }
    }

    /// Stop writing through this device, used when the lock could not be had.
    pub fn downgrade(&mut self) {
        self.writable = false;
    }
}

impl BlockDevice for FileDevice {
    fn block_size(&self) -> usize {
        SECTOR_SIZE
    }

    fn block_count(&self) -> u64 {
        self.file
            .metadata()
            .map(|meta| meta.len() / SECTOR_SIZE as u64)
            .unwrap_or(0)
    }

    fn read_block(&self, block_id: BlockId, buf: &mut [u8]) -> VfsResult<()> {
        trace!("read sector {block_id}");
        let mut file = &self.file;
        file.seek(SeekFrom::Start(block_id * SECTOR_SIZE as u64))
            .map_err(io_error)?;
        file.read_exact(&mut buf[..SECTOR_SIZE]).map_err(io_error)
    }

    fn write_block(&self, block_id: BlockId, buf: &[u8]) -> VfsResult<()> {
        if !self.writable {
            return Err(VfsError::ReadOnly);
        }
        trace!("write sector {block_id}");
        let mut file = &self.file;
        file.seek(SeekFrom::Start(block_id * SECTOR_SIZE as u64))
            .map_err(io_error)?;
        file.write_all(&buf[..SECTOR_SIZE]).map_err(io_error)
    }

    fn flush(&self) -> VfsResult<()> {
        if !self.writable {
            return Ok(());
        }
        self.file.sync_data().map_err(io_error)
    }

    fn is_writable(&self) -> bool {
        self.writable
    }

    fn resize(&self, blocks: u64) -> VfsResult<()> {
        if !self.writable {
            return Err(VfsError::ReadOnly);
        }
        self.file
            .set_len(blocks * SECTOR_SIZE as u64)
            .map_err(io_error)
    }
}

/// A volume image held in host memory. Clones share the same image, so a
/// test can keep a handle while a volume owns another.
#[derive(Clone)]
pub struct MemDevice {
    data: Rc<RefCell<Vec<u8>>>,
    writable: bool,
}

impl MemDevice {
    pub fn new(blocks: u64) -> Self {
        Self::from_image(vec![0u8; blocks as usize * SECTOR_SIZE])
    }

    pub fn from_image(mut image: Vec<u8>) -> Self {
        let rem = image.len() % SECTOR_SIZE;
        if rem != 0 {
            image.resize(image.len() + SECTOR_SIZE - rem, 0);
        }
        Self {
            data: Rc::new(RefCell::new(image)),
            writable: true,
        }
    }

    pub fn read_only(mut self) -> Self {
        self.writable = false;
        self
    }

    pub fn image(&self) -> Vec<u8> {
        self.data.borrow().clone()
    }

    pub fn with_image_mut<R>(&self, edit: impl FnOnce(&mut [u8]) -> R) -> R {
        edit(&mut self.data.borrow_mut())
    }
}

impl BlockDevice for MemDevice {
    fn block_size(&self) -> usize {
        SECTOR_SIZE
    }

    fn block_count(&self) -> u64 {
        (self.data.borrow().len() / SECTOR_SIZE) as u64
    }

    fn read_block(&self, block_id: BlockId, buf: &mut [u8]) -> VfsResult<()> {
        let offset = block_id as usize * SECTOR_SIZE;
        let data = self.data.borrow();
        if offset + SECTOR_SIZE > data.len() {
            return Err(VfsError::NotFound);
        }
        buf[..SECTOR_SIZE].copy_from_slice(&data[offset..offset + SECTOR_SIZE]);
        Ok(())
    }

    fn write_block(&self, block_id: BlockId, buf: &[u8]) -> VfsResult<()> {
        if !self.writable {
            return Err(VfsError::ReadOnly);
        }
        let offset = block_id as usize * SECTOR_SIZE;
        let mut data = self.data.borrow_mut();
        if offset + SECTOR_SIZE > data.len() {
            return Err(VfsError::NotFound);
        }
        data[offset..offset + SECTOR_SIZE].copy_from_slice(&buf[..SECTOR_SIZE]);
        Ok(())
    }

    fn flush(&self) -> VfsResult<()> {
        Ok(())
    }

    fn is_writable(&self) -> bool {
        self.writable
    }

    fn resize(&self, blocks: u64) -> VfsResult<()> {
        if !self.writable {
            return Err(VfsError::ReadOnly);
        }
        self.data
            .borrow_mut()
            .resize(blocks as usize * SECTOR_SIZE, 0);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_cache_passthrough() {
        let dev = MemDevice::new(2);
        let cache = BlockCache::new(Box::new(dev.clone()));
        let buf = [7u8; SECTOR_SIZE];
        cache.write_block(1, &buf).unwrap();
        let mut read = [0u8; SECTOR_SIZE];
        cache.read_block(1, &mut read).unwrap();
        assert_eq!(read, buf);
        assert_eq!(dev.image()[SECTOR_SIZE], 7);
    }

    #[test]
    fn byte_access_spans_sectors() {
        let dev = MemDevice::new(3);
        let cache = BlockCache::new(Box::new(dev.clone()));
        cache.write_bytes(500, &[1u8; 40]).unwrap();
        let image = dev.image();
        assert_eq!(image[499], 0);
        assert!(image[500..540].iter().all(|b| *b == 1));
        assert_eq!(image[540], 0);
        let mut back = [0u8; 42];
        cache.read_bytes(499, &mut back).unwrap();
        assert_eq!(back[0], 0);
        assert!(back[1..41].iter().all(|b| *b == 1));
        assert_eq!(back[41], 0);
    }

    #[test]
    fn read_only_device_refuses_writes() {
        let dev = MemDevice::new(1).read_only();
        let cache = BlockCache::new(Box::new(dev));
        assert_eq!(
            cache.write_block(0, &[0u8; SECTOR_SIZE]),
            Err(VfsError::ReadOnly)
        );
        assert!(!cache.is_writable());
    }

    #[test]
    fn out_of_range_block() {
        let cache = BlockCache::new(Box::new(MemDevice::new(1)));
        let mut buf = [0u8; SECTOR_SIZE];
        assert_eq!(cache.read_block(1, &mut buf), Err(VfsError::NotFound));
    }
}
