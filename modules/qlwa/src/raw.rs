use qlvfs::{VfsError, VfsResult};

use crate::config::SECTOR_SIZE;
use crate::drive::Drive;

#[derive(Debug, Default)]
pub struct RawHandle {
    written: bool,
}

impl RawHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether cached volume state is stale once this handle closes.
    pub fn written(&self) -> bool {
        self.written
    }

    /// Out-of-range sectors are pulled back to the last one.
    fn clamp(drive: &Drive, sector: u64) -> VfsResult<u64> {
        match drive.sector_count() {
            0 => Err(VfsError::InvalidParameter),
            count => Ok(sector.min(count - 1)),
        }
    }

    pub fn read_sector(&self, drive: &Drive, sector: u64, buf: &mut [u8]) -> VfsResult<u64> {
        if buf.len() < SECTOR_SIZE {
            return Err(VfsError::InvalidParameter);
        }
        let sector = Self::clamp(drive, sector)?;
        drive.cache().read_block(sector, buf)?;
        Ok(sector)
    }

    pub fn write_sector(&mut self, drive: &Drive, sector: u64, data: &[u8]) -> VfsResult<u64> {
        drive.ensure_writable()?;
        if data.len() < SECTOR_SIZE {
            return Err(VfsError::InvalidParameter);
        }
        let sector = Self::clamp(drive, sector)?;
        self.written = true;
        drive.cache().write_block(sector, data)?;
        Ok(sector)
    }

    fn span(drive: &Drive, pos: u64, len: usize) -> VfsResult<(u64, usize)> {
        let sector = Self::clamp(drive, pos / SECTOR_SIZE as u64)?;
        let end = drive.sector_count() * SECTOR_SIZE as u64;
        let start = if pos >= end {
            sector * SECTOR_SIZE as u64
        } else {
            pos
        };
        let count = (len as u64).min(end - start) as usize;
        Ok((start, count))
    }

    pub fn read_at(&self, drive: &Drive, pos: u64, buf: &mut [u8]) -> VfsResult<usize> {
        let (start, count) = Self::span(drive, pos, buf.len())?;
        drive.cache().read_bytes(start, &mut buf[..count])?;
        Ok(count)
    }

    pub fn write_at(&mut self, drive: &Drive, pos: u64, data: &[u8]) -> VfsResult<usize> {
        drive.ensure_writable()?;
        let (start, count) = Self::span(drive, pos, data.len())?;
        self.written = true;
        drive.cache().write_bytes(start, &data[..count])?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{BlockCache, MemDevice};
    use crate::config::{FormatOptions, MountOptions};
    use crate::format::format_device;

    fn drive(options: &MountOptions) -> Drive {
        let dev = MemDevice::new(0);
        let opts = FormatOptions::new(b"RAW").sectors_per_cluster(2).clusters(16);
        format_device(&BlockCache::new(Box::new(dev.clone())), &opts).unwrap();
        Drive::open(Box::new(dev), options).unwrap()
    }

    #[test]
    fn sector_numbers_are_clamped() {
        let drive = drive(&MountOptions::default());
        let mut raw = RawHandle::new();
        assert_eq!(drive.sector_count(), 32);
        let mut buf = [0u8; SECTOR_SIZE];
        assert_eq!(raw.read_sector(&drive, 0, &mut buf).unwrap(), 0);
        assert_eq!(&buf[..4], b"QLWA");
        assert_eq!(raw.write_sector(&drive, 1000, &[0x5a; SECTOR_SIZE]).unwrap(), 31);
        assert!(raw.written());
        assert_eq!(raw.read_sector(&drive, 31, &mut buf).unwrap(), 31);
        assert!(buf.iter().all(|b| *b == 0x5a));
    }

    #[test]
    fn byte_reads_stop_at_volume_end() {
        let drive = drive(&MountOptions::default());
        let raw = RawHandle::new();
        let mut buf = [0u8; 2 * SECTOR_SIZE];
        let end = 32 * SECTOR_SIZE as u64;
        assert_eq!(raw.read_at(&drive, end - 100, &mut buf).unwrap(), 100);
        assert_eq!(raw.read_at(&drive, 0, &mut buf[..4]).unwrap(), 4);
        assert_eq!(&buf[..4], b"QLWA");
    }

    #[test]
    fn read_only_volume_refuses_sector_writes() {
        let drive = drive(&MountOptions::read_only());
        let mut raw = RawHandle::new();
        assert_eq!(
            raw.write_sector(&drive, 0, &[0; SECTOR_SIZE]),
            Err(VfsError::ReadOnly)
        );
        assert!(!raw.written());
    }
}
