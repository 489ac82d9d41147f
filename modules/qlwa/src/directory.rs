//! In-memory directories.
//!
//! A directory is a file whose content is an array of 64-byte entries.
//! Entry 0 is the directory's own header and is never a child. The logical
//! size is one past the last slot ever used; deleting an entry leaves a hole
//! for reuse and never shrinks the directory.

use std::collections::BTreeMap;

use log::debug;
use qlvfs::{VfsError, VfsResult};

use crate::drive::Drive;
use crate::entry::{self, DirEntry, EntryName, ENTRY_SIZE, SEPARATOR};

pub type DirId = usize;
pub type NodeId = usize;

pub const ROOT: DirId = 0;

/// Open-channel accounting for one entry. Channels point at the node, and
/// the node records where the entry currently lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OpenNode {
    pub dir: DirId,
    pub slot: usize,
    pub count: u16,
    pub writer: bool,
}

pub struct Directory {
    pub(crate) parent: Option<DirId>,
    pub(crate) slot: usize,
    /// Full name, the prefix of every child's name. Empty for the root.
    pub(crate) path: EntryName,
    pub(crate) chain: Vec<u16>,
    buf: Vec<u8>,
    len: usize,
    pub(crate) subdirs: BTreeMap<usize, DirId>,
    pub(crate) open: BTreeMap<usize, NodeId>,
    pub(crate) handles: u16,
}

impl Directory {
    pub fn load(
        drive: &Drive,
        first_cluster: u16,
        length: usize,
        parent: Option<(DirId, usize)>,
        path: &[u8],
    ) -> VfsResult<Self> {
        let chain = drive.fat().file_chain(first_cluster)?;
        let length = length.max(ENTRY_SIZE);
        let buf = drive.read_chain(&chain, length)?;
        let mut dir = Self::from_parts(parent, path, chain, buf)?;
        dir.len = length - length % ENTRY_SIZE;
        Ok(dir)
    }

    /// A directory over `chain` whose buffer already holds entry 0.
    pub fn from_parts(
        parent: Option<(DirId, usize)>,
        path: &[u8],
        chain: Vec<u16>,
        buf: Vec<u8>,
    ) -> VfsResult<Self> {
        let path = EntryName::from_slice(path).map_err(|_| VfsError::CorruptVolume)?;
        Ok(Self {
            parent: parent.map(|(dir, _)| dir),
            slot: parent.map(|(_, slot)| slot).unwrap_or(0),
            path,
            chain,
            buf,
            len: ENTRY_SIZE,
            subdirs: BTreeMap::new(),
            open: BTreeMap::new(),
            handles: 0,
        })
    }

    pub fn path(&self) -> &[u8] {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        (1..self.slots()).all(|idx| entry::slot_is_free(self.slot(idx)))
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    pub fn slots(&self) -> usize {
        self.len / ENTRY_SIZE
    }

    pub fn slot(&self, idx: usize) -> &[u8] {
        &self.buf[idx * ENTRY_SIZE..(idx + 1) * ENTRY_SIZE]
    }

    pub fn slot_mut(&mut self, idx: usize) -> &mut [u8] {
        &mut self.buf[idx * ENTRY_SIZE..(idx + 1) * ENTRY_SIZE]
    }

    pub fn entry(&self, idx: usize) -> DirEntry {
        DirEntry::parse(self.slot(idx))
    }

    pub fn set_entry(&mut self, idx: usize, entry: &DirEntry) {
        entry.encode(self.slot_mut(idx));
    }

    pub fn clear(&mut self, idx: usize) {
        self.slot_mut(idx).fill(0);
    }

    pub fn entries(&self) -> impl Iterator<Item = (usize, DirEntry)> + '_ {
        (1..self.slots())
            .filter(|idx| !entry::slot_is_free(self.slot(*idx)))
            .map(|idx| (idx, self.entry(idx)))
    }

    /// Linear search for `name`; lengths are compared before bytes.
    pub fn find(&self, name: &[u8]) -> Option<usize> {
        (1..self.slots()).find(|idx| {
            let slot = self.slot(*idx);
            !entry::slot_is_free(slot) && entry::names_equal(entry::slot_name(slot), name)
        })
    }

    /// First subdirectory entry whose name is a proper prefix of `name`.
    pub fn owning_child(&self, name: &[u8]) -> Option<usize> {
        (1..self.slots()).find(|idx| {
            let slot = self.slot(*idx);
            !entry::slot_is_free(slot)
                && entry::slot_type(slot).is_dir()
                && entry::is_under(name, entry::slot_name(slot))
        })
    }

    pub fn hole(&self) -> Option<usize> {
        (1..self.slots()).find(|idx| entry::slot_is_free(self.slot(*idx)))
    }

    pub fn growth_needed(&self) -> usize {
        if self.hole().is_some() || self.len + ENTRY_SIZE <= self.buf.len() {
            0
        } else {
            1
        }
    }

    /// Reserve capacity for `extra` more slots beyond the logical end,
    /// allocating clusters as needed.
    pub fn reserve(&mut self, drive: &mut Drive, extra: usize) -> VfsResult<usize> {
        let wanted = self.len + extra * ENTRY_SIZE;
        let clusters = drive.clusters_for(wanted);
        let more = clusters.saturating_sub(self.chain.len());
        if more > 0 {
            let bytes = clusters * drive.cluster_size();
            self.buf
                .try_reserve_exact(bytes - self.buf.len())
                .map_err(|_| VfsError::OutOfMemory)?;
            drive.extend(&mut self.chain, more)?;
            self.buf.resize(bytes, 0);
            debug!("directory {:?} grew by {more} clusters", String::from_utf8_lossy(&self.path));
        }
        Ok(more)
    }

    /// Take a free slot: a hole if there is one, else the next slot past the
    /// logical end. Returns the slot and whether the logical size changed.
    pub fn take_slot(&mut self, drive: &mut Drive) -> VfsResult<(usize, bool)> {
        if let Some(idx) = self.hole() {
            return Ok((idx, false));
        }
        self.reserve(drive, 1)?;
        let idx = self.slots();
        self.len += ENTRY_SIZE;
        self.slot_mut(idx).fill(0);
        self.sync_own_length();
        Ok((idx, true))
    }

    /// Append a copy of a raw entry at the logical end; capacity must
    /// already be reserved.
    pub fn push_raw(&mut self, raw: &[u8]) -> usize {
        let idx = self.slots();
        self.len += ENTRY_SIZE;
        self.slot_mut(idx).copy_from_slice(&raw[..ENTRY_SIZE]);
        self.sync_own_length();
        idx
    }

    fn sync_own_length(&mut self) {
        let len = self.len as u32;
        entry::set_slot_length(self.slot_mut(0), len);
    }

    pub fn flush(&self, drive: &Drive) -> VfsResult<()> {
        drive.write_chain(&self.chain, &self.buf, self.len)
    }

    pub fn child_name(&self, leaf: &[u8]) -> VfsResult<EntryName> {
        let mut name = EntryName::new();
        if !self.path.is_empty() {
            name.extend_from_slice(&self.path)
                .map_err(|_| VfsError::InvalidParameter)?;
            name.push(SEPARATOR)
                .map_err(|_| VfsError::InvalidParameter)?;
        }
        name.extend_from_slice(leaf)
            .map_err(|_| VfsError::InvalidParameter)?;
        Ok(name)
    }

    /// Hang this directory under a new parent. Full names stay as they are.
    pub fn reparent(&mut self, parent: DirId, slot: usize) {
        self.parent = Some(parent);
        self.slot = slot;
    }

    pub fn leaf<'a>(&self, name: &'a [u8]) -> &'a [u8] {
        if self.path.is_empty() {
            name
        } else {
            name.get(self.path.len() + 1..).unwrap_or(name)
        }
    }
}
