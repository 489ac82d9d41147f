use log::debug;
use qlvfs::{VfsError, VfsResult};

use crate::directory::NodeId;
use crate::drive::Drive;
use crate::entry::{qdos_now, DirEntry, ENTRY_SIZE};

/// An open file held entirely in memory.
///
/// The buffer mirrors the file's clusters, so it is always a whole number
/// of clusters long. Its first 64 bytes are the file's own copy of its
/// directory entry; positions handed to `read_at`/`write_at` start after it.
pub struct File {
    node: NodeId,
    read_only: bool,
    chain: Vec<u16>,
    buf: Vec<u8>,
    length: usize,
    dirty: bool,
}

impl File {
    pub fn open(drive: &Drive, node: NodeId, entry: &DirEntry, read_only: bool) -> VfsResult<Self> {
        let chain = drive.fat().file_chain(entry.first_cluster)?;
        let length = (entry.length as usize).max(ENTRY_SIZE);
        let buf = drive.read_chain(&chain, length)?;
        Ok(Self {
            node,
            read_only,
            chain,
            buf,
            length,
            dirty: false,
        })
    }

    /// A new, empty file over a freshly allocated `chain`. The header is
    /// written through to the first cluster straight away.
    pub fn create(drive: &Drive, node: NodeId, chain: Vec<u16>, entry: &DirEntry) -> VfsResult<Self> {
        let size = chain.len() * drive.cluster_size();
        let mut buf = Vec::new();
        buf.try_reserve_exact(size)
            .map_err(|_| VfsError::OutOfMemory)?;
        buf.resize(size, 0);
        entry.encode(&mut buf);
        drive.write_chain(&chain, &buf, ENTRY_SIZE)?;
        Ok(Self {
            node,
            read_only: false,
            chain,
            buf,
            length: ENTRY_SIZE,
            dirty: false,
        })
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn read_only(&self) -> bool {
        self.read_only
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn touch(&mut self) {
        self.dirty = true;
    }

    pub fn chain_len(&self) -> usize {
        self.chain.len()
    }

    pub fn len(&self) -> usize {
        self.length - ENTRY_SIZE
    }

    pub fn is_empty(&self) -> bool {
        self.length == ENTRY_SIZE
    }

    pub fn read_at(&self, pos: u64, out: &mut [u8]) -> usize {
        let len = self.len() as u64;
        if pos >= len {
            return 0;
        }
        let start = ENTRY_SIZE + pos as usize;
        let count = out.len().min(self.length - start);
        out[..count].copy_from_slice(&self.buf[start..start + count]);
        count
    }

    /// Write `data` at `pos`, growing the chain when the buffer runs out.
    /// Writing may start at the end of the file but not past it.
    pub fn write_at(&mut self, drive: &mut Drive, pos: u64, data: &[u8]) -> VfsResult<usize> {
        if self.read_only {
            return Err(VfsError::ReadOnly);
        }
        let pos = usize::try_from(pos).map_err(|_| VfsError::InvalidParameter)?;
        if pos > self.len() {
            return Err(VfsError::InvalidParameter);
        }
        let start = ENTRY_SIZE + pos;
        let end = start
            .checked_add(data.len())
            .ok_or(VfsError::InvalidParameter)?;
        if end > u32::MAX as usize {
            return Err(VfsError::InsufficientSpace);
        }
        if end > self.buf.len() {
            self.grow(drive, end)?;
        }
        self.buf[start..end].copy_from_slice(data);
        self.length = self.length.max(end);
        self.dirty = true;
        Ok(data.len())
    }

    fn grow(&mut self, drive: &mut Drive, end: usize) -> VfsResult<()> {
        let clusters = drive.clusters_for(end);
        let more = clusters - self.chain.len();
        let size = clusters * drive.cluster_size();
        self.buf
            .try_reserve_exact(size - self.buf.len())
            .map_err(|_| VfsError::OutOfMemory)?;
        drive.extend(&mut self.chain, more)?;
        self.buf.resize(size, 0);
        debug!("file at cluster {} grew by {more} clusters", self.chain[0]);
        Ok(())
    }

    /// Cut the data down to `len` bytes. Clusters are only given back when
    /// the cluster count changes.
    pub fn truncate(&mut self, drive: &mut Drive, len: u64) -> VfsResult<()> {
        if self.read_only {
            return Err(VfsError::ReadOnly);
        }
        let len = usize::try_from(len).map_err(|_| VfsError::InvalidParameter)?;
        if len > self.len() {
            return Err(VfsError::InvalidParameter);
        }
        let length = ENTRY_SIZE + len;
        let keep = drive.clusters_for(length);
        if keep < self.chain.len() {
            drive.shorten(&mut self.chain, keep)?;
            self.buf.truncate(keep * drive.cluster_size());
        }
        self.buf[length..].fill(0);
        self.length = length;
        self.dirty = true;
        Ok(())
    }

    /// Write the buffer back if it changed, stamping `entry` with the new
    /// length, date and version. Returns whether anything was written.
    pub fn sync(&mut self, drive: &Drive, entry: &mut DirEntry) -> VfsResult<bool> {
        if !self.dirty {
            return Ok(false);
        }
        entry.length = self.length as u32;
        entry.first_cluster = self.chain[0];
        entry.update_date = qdos_now();
        entry.version = entry.version.wrapping_add(1);
        entry.encode(&mut self.buf);
        drive.write_chain(&self.chain, &self.buf, self.length)?;
        self.dirty = false;
        Ok(true)
    }

    pub fn into_parts(self) -> (Vec<u16>, Vec<u8>) {
        (self.chain, self.buf)
    }
}
