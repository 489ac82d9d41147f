use std::path::Path;

use log::{debug, error, info, warn};
use qlvfs::{
    ChannelId, DriveOps, FileType, FreeSpace, OpenMode, VfsError, VfsResult, VolumeInfo,
    VOLUME_NAME_LEN,
};

use crate::block::{BlockCache, BlockDevice, FileDevice};
use crate::config::{FormatOptions, LockPolicy, MountOptions, MAX_CHANNELS, SECTOR_SIZE};
use crate::directory::{DirId, Directory, NodeId, OpenNode, ROOT};
use crate::drive::Drive;
use crate::entry::{self, DirEntry, EntryName, ENTRY_SIZE};
use crate::file::File;
use crate::format::format_device;
use crate::raw::RawHandle;
use crate::slots::Slots;

pub struct DirHandle {
    dir: DirId,
}

pub enum Channel {
    File(File),
    Dir(DirHandle),
    Raw(RawHandle),
}

#[derive(Clone, Copy, Debug)]
struct FileStatus {
    slot: usize,
    is_dir: bool,
    writer: bool,
    open: u16,
}

pub struct Volume {
    drive: Drive,
    dirs: Vec<Option<Directory>>,
    nodes: Slots<OpenNode>,
    channels: Slots<Channel>,
    /// Set when a structural update failed half way; disk and memory can no
    /// longer be trusted to agree.
    poisoned: bool,
}

fn dir_mut(dirs: &mut [Option<Directory>], id: DirId) -> VfsResult<&mut Directory> {
    dirs.get_mut(id)
        .and_then(Option::as_mut)
        .ok_or(VfsError::CorruptVolume)
}

fn load_root(drive: &Drive) -> VfsResult<Directory> {
    let header = drive.header();
    Directory::load(
        drive,
        header.root_cluster,
        header.root_length as usize,
        None,
        b"",
    )
}

fn read_slice(data: &[u8], pos: u64, out: &mut [u8]) -> usize {
    let Ok(pos) = usize::try_from(pos) else {
        return 0;
    };
    if pos >= data.len() {
        return 0;
    }
    let count = out.len().min(data.len() - pos);
    out[..count].copy_from_slice(&data[pos..pos + count]);
    count
}

impl Volume {
    pub fn mount(device: Box<dyn BlockDevice>, options: &MountOptions) -> VfsResult<Self> {
        Self::with_drive(Drive::open(device, options)?)
    }

    /// Mount the volume stored in the host file at `path`. A writable mount
    /// takes an advisory lock on the file first.
    pub fn open_path(path: &Path, options: &MountOptions) -> VfsResult<Self> {
        let mut device = FileDevice::open(path, !options.read_only)?;
        if !options.read_only {
            match device.try_lock() {
                Ok(()) => {}
                Err(VfsError::LockUnavailable) if options.lock == LockPolicy::ReadOnly => {
                    warn!(
                        "{} is locked by another process, mounting read only",
                        path.display()
                    );
                    device.downgrade();
                }
                Err(err) => return Err(err),
            }
        }
        Self::mount(Box::new(device), options)
    }

    pub fn create(path: &Path, options: &FormatOptions<'_>) -> VfsResult<Self> {
        let device = FileDevice::create(path, 0)?;
        device.try_lock()?;
        Self::format_new(Box::new(device), options)
    }

    pub fn format_new(device: Box<dyn BlockDevice>, options: &FormatOptions<'_>) -> VfsResult<Self> {
        let cache = BlockCache::new(device);
        format_device(&cache, options)?;
        Self::with_drive(Drive::with_cache(cache, &MountOptions::default())?)
    }

    fn with_drive(drive: Drive) -> VfsResult<Self> {
        let root = load_root(&drive)?;
        Ok(Self {
            drive,
            dirs: vec![Some(root)],
            nodes: Slots::with_capacity(MAX_CHANNELS),
            channels: Slots::with_capacity(MAX_CHANNELS),
            poisoned: false,
        })
    }

    pub fn unmount(mut self) -> VfsResult<()> {
        self.close_all()
    }

    fn close_all(&mut self) -> VfsResult<()> {
        let open: Vec<ChannelId> = self.channels.iter().map(|(id, _)| id).collect();
        let mut result = Ok(());
        for channel in open {
            if let Err(err) = self.close(channel) {
                result = result.and(Err(err));
            }
        }
        info!(
            "unmounted volume {:?}",
            String::from_utf8_lossy(self.drive.info().name())
        );
        result
    }

    pub fn drive(&self) -> &Drive {
        &self.drive
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    pub fn dir_path(&self, id: DirId) -> VfsResult<&[u8]> {
        Ok(self.dir(id)?.path())
    }

    fn dir(&self, id: DirId) -> VfsResult<&Directory> {
        self.dirs
            .get(id)
            .and_then(Option::as_ref)
            .ok_or(VfsError::CorruptVolume)
    }

    fn check(&self) -> VfsResult<()> {
        if self.poisoned {
            Err(VfsError::CorruptVolume)
        } else {
            Ok(())
        }
    }

    fn ready(&self) -> VfsResult<()> {
        self.check()?;
        if self
            .channels
            .iter()
            .any(|(_, channel)| matches!(channel, Channel::Raw(_)))
        {
            return Err(VfsError::Busy);
        }
        Ok(())
    }

    fn poison<T>(&mut self, result: VfsResult<T>) -> VfsResult<T> {
        if let Err(err) = &result {
            error!("volume update failed part way ({err}), refusing further access");
            self.poisoned = true;
        }
        result
    }

    /// Persist a structural change: the table, then the directories whose
    /// entries changed, then the backing store.
    fn write_back(&mut self, dirs: &[DirId]) -> VfsResult<()> {
        self.drive.flush()?;
        for id in dirs {
            self.dir(*id)?.flush(&self.drive)?;
        }
        self.drive.sync()
    }

    fn commit(&mut self, dirs: &[DirId]) -> VfsResult<()> {
        let result = self.write_back(dirs);
        self.poison(result)
    }

    /// Record a directory's logical size where its owner keeps it: the
    /// header for the root, the parent's entry otherwise. Returns the
    /// parent when it needs flushing too.
    fn note_length(&mut self, id: DirId) -> VfsResult<Option<DirId>> {
        let (length, parent, slot) = {
            let dir = self.dir(id)?;
            (dir.len() as u32, dir.parent, dir.slot)
        };
        match parent {
            None => {
                self.drive.set_root_length(length);
                Ok(None)
            }
            Some(parent) => {
                entry::set_slot_length(dir_mut(&mut self.dirs, parent)?.slot_mut(slot), length);
                Ok(Some(parent))
            }
        }
    }

    /// The directory that owns `name`: descend while some subdirectory's
    /// name followed by the separator prefixes it.
    pub fn resolve(&mut self, name: &[u8]) -> VfsResult<DirId> {
        self.check()?;
        let mut current = ROOT;
        loop {
            let dir = self.dir(current)?;
            let Some(slot) = dir.owning_child(name) else {
                return Ok(current);
            };
            let depth = dir.path().len();
            let next = self.subdir(current, slot)?;
            if self.dir(next)?.path().len() <= depth {
                return Err(VfsError::CorruptVolume);
            }
            current = next;
        }
    }

    fn subdir(&mut self, parent: DirId, slot: usize) -> VfsResult<DirId> {
        let dir = self.dir(parent)?;
        if let Some(id) = dir.subdirs.get(&slot) {
            return Ok(*id);
        }
        let entry = dir.entry(slot);
        let child = Directory::load(
            &self.drive,
            entry.first_cluster,
            entry.length as usize,
            Some((parent, slot)),
            &entry.name,
        )?;
        debug!("loaded directory {:?}", String::from_utf8_lossy(child.path()));
        let id = self.add_dir(child);
        dir_mut(&mut self.dirs, parent)?.subdirs.insert(slot, id);
        Ok(id)
    }

    fn add_dir(&mut self, dir: Directory) -> DirId {
        match self.dirs.iter().position(Option::is_none) {
            Some(id) => {
                self.dirs[id] = Some(dir);
                id
            }
            None => {
                self.dirs.push(Some(dir));
                self.dirs.len() - 1
            }
        }
    }

    fn check_file(&self, dir: DirId, name: &[u8]) -> VfsResult<Option<FileStatus>> {
        let dir = self.dir(dir)?;
        let Some(slot) = dir.find(name) else {
            return Ok(None);
        };
        let node = dir.open.get(&slot).and_then(|id| self.nodes.get(*id));
        let mut open = node.map_or(0, |node| node.count);
        if let Some(child) = dir.subdirs.get(&slot) {
            open += self.dir(*child)?.handles;
        }
        Ok(Some(FileStatus {
            slot,
            is_dir: entry::slot_type(dir.slot(slot)).is_dir(),
            writer: node.is_some_and(|node| node.writer),
            open,
        }))
    }

    fn acquire(&mut self, dir: DirId, slot: usize, writer: bool) -> VfsResult<NodeId> {
        let existing = self.dir(dir)?.open.get(&slot).copied();
        if let Some(id) = existing {
            let node = self.nodes.get_mut(id).ok_or(VfsError::CorruptVolume)?;
            node.count += 1;
            node.writer |= writer;
            return Ok(id);
        }
        let id = self
            .nodes
            .insert(OpenNode {
                dir,
                slot,
                count: 1,
                writer,
            })
            .map_err(|_| VfsError::OutOfMemory)?;
        dir_mut(&mut self.dirs, dir)?.open.insert(slot, id);
        Ok(id)
    }

    fn release_node(&mut self, id: NodeId, writer: bool) {
        let Some(node) = self.nodes.get_mut(id) else {
            return;
        };
        node.count = node.count.saturating_sub(1);
        if writer {
            node.writer = false;
        }
        if node.count > 0 {
            return;
        }
        let node = *node;
        self.nodes.remove(id);
        if let Ok(dir) = dir_mut(&mut self.dirs, node.dir) {
            dir.open.remove(&node.slot);
        }
    }

    fn add_file_channel(&mut self, file: File) -> VfsResult<ChannelId> {
        let node = file.node();
        let writer = !file.read_only();
        match self.channels.insert(Channel::File(file)) {
            Ok(id) => Ok(id),
            Err(_) => {
                self.release_node(node, writer);
                Err(VfsError::OutOfMemory)
            }
        }
    }

    pub fn open(&mut self, name: &[u8], mode: OpenMode) -> VfsResult<ChannelId> {
        self.ready()?;
        if self.channels.is_full() {
            return Err(VfsError::OutOfMemory);
        }
        if mode == OpenMode::Directory {
            let dir = self.find_directory(entry::strip_dir_name(name))?;
            return self.open_handle(dir);
        }
        let owner = self.resolve(name)?;
        let status = self.check_file(owner, name)?;
        match mode {
            OpenMode::CreateNew => match status {
                Some(_) => Err(VfsError::AlreadyExists),
                None => self.create_file(owner, name),
            },
            OpenMode::Overwrite => {
                if let Some(status) = status {
                    if status.is_dir {
                        return Err(VfsError::Busy);
                    }
                    self.drive.ensure_writable()?;
                    self.delete_entry(owner, status)?;
                }
                self.create_file(owner, name)
            }
            OpenMode::Shared => {
                let status = status.ok_or(VfsError::NotFound)?;
                if status.is_dir {
                    let dir = self.subdir(owner, status.slot)?;
                    return self.open_handle(dir);
                }
                if status.writer {
                    return Err(VfsError::Busy);
                }
                self.open_file(owner, status.slot, false)
            }
            OpenMode::Exclusive | OpenMode::Directory => {
                let status = status.ok_or(VfsError::NotFound)?;
                if status.is_dir || status.open > 0 {
                    return Err(VfsError::Busy);
                }
                self.drive.ensure_writable()?;
                self.open_file(owner, status.slot, true)
            }
        }
    }

    /// The directory called `name`, or the one that would contain it when
    /// there is no such directory.
    fn find_directory(&mut self, name: &[u8]) -> VfsResult<DirId> {
        if name.is_empty() {
            return Ok(ROOT);
        }
        let owner = self.resolve(name)?;
        match self.check_file(owner, name)? {
            Some(status) if status.is_dir => self.subdir(owner, status.slot),
            _ => Ok(owner),
        }
    }

    fn open_handle(&mut self, dir: DirId) -> VfsResult<ChannelId> {
        dir_mut(&mut self.dirs, dir)?;
        let id = self
            .channels
            .insert(Channel::Dir(DirHandle { dir }))
            .map_err(|_| VfsError::OutOfMemory)?;
        dir_mut(&mut self.dirs, dir)?.handles += 1;
        Ok(id)
    }

    fn open_file(&mut self, dir: DirId, slot: usize, writer: bool) -> VfsResult<ChannelId> {
        let entry = self.dir(dir)?.entry(slot);
        let node = self.acquire(dir, slot, writer)?;
        match File::open(&self.drive, node, &entry, !writer) {
            Ok(file) => self.add_file_channel(file),
            Err(err) => {
                self.release_node(node, writer);
                Err(err)
            }
        }
    }

    fn create_file(&mut self, dir: DirId, name: &[u8]) -> VfsResult<ChannelId> {
        self.drive.ensure_writable()?;
        let name = entry::entry_name(name)?;
        let growth = self.dir(dir)?.growth_needed();
        if self.drive.free_count() < 1 + growth {
            return Err(VfsError::InsufficientSpace);
        }
        let (slot, grew) = dir_mut(&mut self.dirs, dir)?.take_slot(&mut self.drive)?;
        let result = self.place_new_file(dir, slot, grew, &name);
        let file = self.poison(result)?;
        debug!("created {:?}", String::from_utf8_lossy(&name));
        self.add_file_channel(file)
    }

    fn place_new_file(&mut self, dir: DirId, slot: usize, grew: bool, name: &[u8]) -> VfsResult<File> {
        let chain = self.drive.allocate(1)?;
        let entry = DirEntry::new(name, chain[0])?;
        dir_mut(&mut self.dirs, dir)?.set_entry(slot, &entry);
        let node = self.acquire(dir, slot, true)?;
        let file = File::create(&self.drive, node, chain, &entry)?;
        let mut dirty = vec![dir];
        if grew {
            dirty.extend(self.note_length(dir)?);
        }
        self.write_back(&dirty)?;
        Ok(file)
    }

    pub fn close(&mut self, channel: ChannelId) -> VfsResult<()> {
        let dirty = match self.channels.get(channel) {
            Some(Channel::File(file)) => file.is_dirty(),
            Some(_) => false,
            None => return Err(VfsError::NotOpen),
        };
        let mut result = if dirty {
            self.sync_file(channel)
        } else {
            Ok(())
        };
        match self.channels.remove(channel) {
            Some(Channel::File(file)) => self.release_node(file.node(), !file.read_only()),
            Some(Channel::Dir(handle)) => {
                if let Ok(dir) = dir_mut(&mut self.dirs, handle.dir) {
                    dir.handles = dir.handles.saturating_sub(1);
                }
            }
            Some(Channel::Raw(raw)) => {
                if raw.written() {
                    result = self.reload();
                }
            }
            None => {}
        }
        result
    }

    /// Write an open file back: data clusters, then its entry.
    fn sync_file(&mut self, channel: ChannelId) -> VfsResult<()> {
        self.check()?;
        let Some(Channel::File(file)) = self.channels.get_mut(channel) else {
            return Err(VfsError::NotOpen);
        };
        if !file.is_dirty() {
            return Ok(());
        }
        let node = *self.nodes.get(file.node()).ok_or(VfsError::CorruptVolume)?;
        let dir = dir_mut(&mut self.dirs, node.dir)?;
        let mut entry = dir.entry(node.slot);
        let written = file.sync(&self.drive, &mut entry);
        if written.is_ok() {
            dir.set_entry(node.slot, &entry);
        }
        let result = written.and_then(|_| self.write_back(&[node.dir]));
        self.poison(result)
    }

    /// Re-read header, table and root after raw writes. Only called with no
    /// other channel open.
    fn reload(&mut self) -> VfsResult<()> {
        let result = self
            .drive
            .reload()
            .and_then(|_| load_root(&self.drive));
        match result {
            Ok(root) => {
                self.dirs = vec![Some(root)];
                self.nodes.clear();
                info!("reloaded volume state after raw sector writes");
                Ok(())
            }
            Err(err) => self.poison(Err(err)),
        }
    }

    pub fn read(&self, channel: ChannelId, pos: u64, buf: &mut [u8]) -> VfsResult<usize> {
        self.check()?;
        match self.channels.get(channel).ok_or(VfsError::NotOpen)? {
            Channel::File(file) => Ok(file.read_at(pos, buf)),
            Channel::Dir(handle) => {
                let bytes = self.dir(handle.dir)?.bytes();
                Ok(read_slice(&bytes[ENTRY_SIZE..], pos, buf))
            }
            Channel::Raw(raw) => raw.read_at(&self.drive, pos, buf),
        }
    }

    pub fn write(&mut self, channel: ChannelId, pos: u64, data: &[u8]) -> VfsResult<usize> {
        self.check()?;
        let (written, grew) = match self.channels.get_mut(channel) {
            Some(Channel::File(file)) => {
                let before = file.chain_len();
                let written = file.write_at(&mut self.drive, pos, data);
                (written, file.chain_len() != before)
            }
            Some(Channel::Raw(raw)) => return raw.write_at(&self.drive, pos, data),
            Some(Channel::Dir(_)) => return Err(VfsError::ReadOnly),
            None => return Err(VfsError::NotOpen),
        };
        if grew {
            self.commit(&[])?;
        }
        written
    }

    pub fn truncate(&mut self, channel: ChannelId, len: u64) -> VfsResult<()> {
        self.check()?;
        let shrunk = match self.channels.get_mut(channel) {
            Some(Channel::File(file)) => {
                let before = file.chain_len();
                file.truncate(&mut self.drive, len)?;
                file.chain_len() != before
            }
            Some(Channel::Dir(_)) => return Err(VfsError::ReadOnly),
            Some(Channel::Raw(_)) => return Err(VfsError::InvalidParameter),
            None => return Err(VfsError::NotOpen),
        };
        // Freed clusters must not stay reachable from the entry on disk.
        if shrunk {
            self.sync_file(channel)?;
        }
        Ok(())
    }

    pub fn length(&self, channel: ChannelId) -> VfsResult<u64> {
        self.check()?;
        match self.channels.get(channel).ok_or(VfsError::NotOpen)? {
            Channel::File(file) => Ok(file.len() as u64),
            Channel::Dir(handle) => Ok((self.dir(handle.dir)?.len() - ENTRY_SIZE) as u64),
            Channel::Raw(_) => Ok(self.drive.sector_count() * SECTOR_SIZE as u64),
        }
    }

    pub fn flush(&mut self, channel: ChannelId) -> VfsResult<()> {
        self.check()?;
        let open = self.channels.get(channel).ok_or(VfsError::NotOpen)?;
        if matches!(open, Channel::File(_)) {
            self.sync_file(channel)
        } else {
            self.drive.sync()
        }
    }

    pub fn header(&self, channel: ChannelId) -> VfsResult<DirEntry> {
        self.check()?;
        match self.channels.get(channel).ok_or(VfsError::NotOpen)? {
            Channel::File(file) => {
                let node = self.nodes.get(file.node()).ok_or(VfsError::CorruptVolume)?;
                let mut entry = self.dir(node.dir)?.entry(node.slot);
                entry.length = (file.len() + ENTRY_SIZE) as u32;
                Ok(entry)
            }
            Channel::Dir(handle) => Ok(self.dir(handle.dir)?.entry(0)),
            Channel::Raw(_) => Err(VfsError::InvalidParameter),
        }
    }

    /// Change the file type and type-specific info of an open file.
    /// Directories are only made through `make_directory`.
    pub fn set_header(&mut self, channel: ChannelId, file_type: FileType, info: [u8; 8]) -> VfsResult<()> {
        self.check()?;
        self.drive.ensure_writable()?;
        if file_type.is_dir() {
            return Err(VfsError::InvalidParameter);
        }
        let node = match self.channels.get_mut(channel) {
            Some(Channel::File(file)) if file.read_only() => return Err(VfsError::ReadOnly),
            Some(Channel::File(file)) => {
                file.touch();
                file.node()
            }
            Some(_) => return Err(VfsError::InvalidParameter),
            None => return Err(VfsError::NotOpen),
        };
        let node = *self.nodes.get(node).ok_or(VfsError::CorruptVolume)?;
        let dir = dir_mut(&mut self.dirs, node.dir)?;
        let mut entry = dir.entry(node.slot);
        entry.file_type = file_type;
        entry.info = info;
        dir.set_entry(node.slot, &entry);
        self.commit(&[node.dir])
    }

    pub fn delete(&mut self, name: &[u8]) -> VfsResult<()> {
        self.ready()?;
        self.drive.ensure_writable()?;
        let owner = self.resolve(name)?;
        match self.check_file(owner, name)? {
            Some(status) => self.delete_entry(owner, status),
            None => {
                // `NAME_` may name the directory NAME.
                let stripped = entry::strip_dir_name(name);
                if stripped.is_empty() || stripped.len() == name.len() {
                    return Err(VfsError::NotFound);
                }
                self.delete(stripped)
            }
        }
    }

    fn delete_entry(&mut self, dir: DirId, status: FileStatus) -> VfsResult<()> {
        if status.open > 0 {
            return Err(VfsError::Busy);
        }
        if status.is_dir {
            let child = self.subdir(dir, status.slot)?;
            let sub = self.dir(child)?;
            if !sub.is_empty() || sub.handles > 0 {
                return Err(VfsError::Busy);
            }
            if let Some(slot) = self.dirs.get_mut(child) {
                *slot = None;
            }
            dir_mut(&mut self.dirs, dir)?.subdirs.remove(&status.slot);
        }
        let entry = self.dir(dir)?.entry(status.slot);
        let result = self.unlink(dir, status.slot, entry.first_cluster);
        self.poison(result)?;
        debug!("deleted {:?}", String::from_utf8_lossy(&entry.name));
        Ok(())
    }

    fn unlink(&mut self, dir: DirId, slot: usize, first_cluster: u16) -> VfsResult<()> {
        if first_cluster != 0 {
            self.drive.release(first_cluster)?;
        }
        dir_mut(&mut self.dirs, dir)?.clear(slot);
        self.write_back(&[dir])
    }

    /// Give the file open on `channel` a new name, moving its entry when the
    /// name belongs in another directory.
    pub fn rename(&mut self, channel: ChannelId, new_name: &[u8]) -> VfsResult<()> {
        self.check()?;
        self.drive.ensure_writable()?;
        let node_id = match self.channels.get(channel) {
            Some(Channel::File(file)) if file.read_only() => return Err(VfsError::ReadOnly),
            Some(Channel::File(file)) => file.node(),
            Some(_) => return Err(VfsError::InvalidParameter),
            None => return Err(VfsError::NotOpen),
        };
        let name = entry::entry_name(new_name)?;
        let node = *self.nodes.get(node_id).ok_or(VfsError::CorruptVolume)?;
        let target = self.resolve(&name)?;
        if let Some(status) = self.check_file(target, &name)? {
            if (target, status.slot) != (node.dir, node.slot) {
                return Err(VfsError::AlreadyExists);
            }
        }
        let dest = self.dir(target)?;
        let full = dest.child_name(dest.leaf(&name))?;
        let growth = dest.growth_needed();
        if target == node.dir {
            let dir = dir_mut(&mut self.dirs, target)?;
            let mut entry = dir.entry(node.slot);
            entry.name = full;
            dir.set_entry(node.slot, &entry);
            return self.commit(&[target]);
        }
        if self.drive.free_count() < growth {
            return Err(VfsError::InsufficientSpace);
        }
        let (slot, grew) = dir_mut(&mut self.dirs, target)?.take_slot(&mut self.drive)?;
        let result = self.move_entry(node_id, node, target, slot, grew, full);
        self.poison(result)
    }

    fn move_entry(
        &mut self,
        node_id: NodeId,
        node: OpenNode,
        target: DirId,
        slot: usize,
        grew: bool,
        name: EntryName,
    ) -> VfsResult<()> {
        let source = dir_mut(&mut self.dirs, node.dir)?;
        let mut entry = source.entry(node.slot);
        source.clear(node.slot);
        source.open.remove(&node.slot);
        entry.name = name;
        let dest = dir_mut(&mut self.dirs, target)?;
        dest.set_entry(slot, &entry);
        dest.open.insert(slot, node_id);
        if let Some(open) = self.nodes.get_mut(node_id) {
            open.dir = target;
            open.slot = slot;
        }
        let mut dirty = vec![target, node.dir];
        if grew {
            dirty.extend(self.note_length(target)?);
        }
        self.write_back(&dirty)?;
        debug!("moved {:?} to directory {target}", String::from_utf8_lossy(&entry.name));
        Ok(())
    }

    /// Turn the empty file open on `channel` into a directory in place. Every
    /// other entry of the parent whose name continues the new directory's
    /// name with a separator moves into it. The channel is consumed.
    pub fn make_directory(&mut self, channel: ChannelId) -> VfsResult<DirId> {
        self.check()?;
        self.drive.ensure_writable()?;
        let (node_id, have) = match self.channels.get(channel) {
            Some(Channel::File(file)) if file.read_only() => return Err(VfsError::ReadOnly),
            Some(Channel::File(file)) if !file.is_empty() => {
                return Err(VfsError::InvalidParameter)
            }
            Some(Channel::File(file)) => (file.node(), file.chain_len()),
            Some(_) => return Err(VfsError::InvalidParameter),
            None => return Err(VfsError::NotOpen),
        };
        let node = *self.nodes.get(node_id).ok_or(VfsError::CorruptVolume)?;
        if node.count > 1 {
            return Err(VfsError::Busy);
        }
        let parent = self.dir(node.dir)?;
        let entry = parent.entry(node.slot);
        let name = entry::entry_name(entry::strip_dir_name(&entry.name))?;
        let movers: Vec<usize> = parent
            .entries()
            .filter(|(idx, child)| *idx != node.slot && entry::is_under(&child.name, &name))
            .map(|(idx, _)| idx)
            .collect();
        // Everything the conversion can allocate is checked up front.
        let needed = self.drive.clusters_for((movers.len() + 1) * ENTRY_SIZE);
        if self.drive.free_count() < needed.saturating_sub(have) {
            return Err(VfsError::InsufficientSpace);
        }
        let Some(Channel::File(file)) = self.channels.remove(channel) else {
            return Err(VfsError::NotOpen);
        };
        let result = self.convert(file, node_id, node, entry, name, &movers);
        self.poison(result)
    }

    fn convert(
        &mut self,
        file: File,
        node_id: NodeId,
        node: OpenNode,
        mut entry: DirEntry,
        name: EntryName,
        movers: &[usize],
    ) -> VfsResult<DirId> {
        let parent_id = node.dir;
        let (chain, buf) = file.into_parts();
        self.release_node(node_id, true);

        entry.file_type = FileType::Directory;
        entry.length = ENTRY_SIZE as u32;
        entry.name = name.clone();
        let mut dir = Directory::from_parts(
            Some((parent_id, node.slot)),
            &name,
            chain,
            buf,
        )?;
        dir.set_entry(0, &entry);
        dir.reserve(&mut self.drive, movers.len())?;
        let id = self.add_dir(dir);

        for &idx in movers {
            let parent = dir_mut(&mut self.dirs, parent_id)?;
            let mut raw = [0u8; ENTRY_SIZE];
            raw.copy_from_slice(parent.slot(idx));
            parent.clear(idx);
            let open = parent.open.remove(&idx);
            let sub = parent.subdirs.remove(&idx);

            let new_dir = dir_mut(&mut self.dirs, id)?;
            let new_idx = new_dir.push_raw(&raw);
            if let Some(open) = open {
                new_dir.open.insert(new_idx, open);
                if let Some(node) = self.nodes.get_mut(open) {
                    node.dir = id;
                    node.slot = new_idx;
                }
            }
            if let Some(sub) = sub {
                new_dir.subdirs.insert(new_idx, sub);
                dir_mut(&mut self.dirs, sub)?.reparent(id, new_idx);
            }
        }

        entry.length = self.dir(id)?.len() as u32;
        let parent = dir_mut(&mut self.dirs, parent_id)?;
        parent.set_entry(node.slot, &entry);
        parent.subdirs.insert(node.slot, id);
        self.write_back(&[parent_id, id])?;
        debug!(
            "made directory {:?}, {} entries moved in",
            String::from_utf8_lossy(&name),
            movers.len()
        );
        Ok(id)
    }

    pub fn list(&mut self, name: &[u8]) -> VfsResult<Vec<DirEntry>> {
        self.ready()?;
        let dir = self.find_directory(entry::strip_dir_name(name))?;
        Ok(self.dir(dir)?.entries().map(|(_, entry)| entry).collect())
    }

    /// Open the volume-wide sector handle. Refused while anything else is
    /// open, and everything else is refused while it is.
    pub fn open_raw(&mut self) -> VfsResult<ChannelId> {
        self.check()?;
        if !self.channels.is_empty() {
            return Err(VfsError::Busy);
        }
        self.channels
            .insert(Channel::Raw(RawHandle::new()))
            .map_err(|_| VfsError::OutOfMemory)
    }

    pub fn read_sector(&self, channel: ChannelId, sector: u64, buf: &mut [u8]) -> VfsResult<u64> {
        self.check()?;
        match self.channels.get(channel).ok_or(VfsError::NotOpen)? {
            Channel::Raw(raw) => raw.read_sector(&self.drive, sector, buf),
            _ => Err(VfsError::InvalidParameter),
        }
    }

    pub fn write_sector(&mut self, channel: ChannelId, sector: u64, data: &[u8]) -> VfsResult<u64> {
        self.check()?;
        match self.channels.get_mut(channel).ok_or(VfsError::NotOpen)? {
            Channel::Raw(raw) => raw.write_sector(&self.drive, sector, data),
            _ => Err(VfsError::InvalidParameter),
        }
    }

    /// Re-initialise the volume in place, keeping its geometry. Clears a
    /// poisoned session.
    pub fn format(&mut self, name: &[u8]) -> VfsResult<()> {
        if !self.channels.is_empty() {
            return Err(VfsError::Busy);
        }
        self.drive.ensure_writable()?;
        if name.len() > VOLUME_NAME_LEN {
            return Err(VfsError::InvalidParameter);
        }
        let header = self.drive.header();
        let options = FormatOptions::new(name)
            .sectors_per_cluster(header.sectors_per_cluster)
            .clusters(header.total_clusters);
        let result = format_device(self.drive.cache(), &options)
            .and_then(|_| self.drive.reload())
            .and_then(|_| load_root(&self.drive));
        match result {
            Ok(root) => {
                self.dirs = vec![Some(root)];
                self.nodes.clear();
                self.poisoned = false;
                Ok(())
            }
            Err(err) => {
                error!("format failed ({err}), volume left unusable");
                self.poisoned = true;
                Err(err)
            }
        }
    }

    pub fn free_space(&self) -> FreeSpace {
        self.drive.free_space()
    }

    pub fn info(&self) -> VolumeInfo {
        self.drive.info()
    }
}

impl DriveOps for Volume {
    fn open(&mut self, name: &[u8], mode: OpenMode) -> VfsResult<ChannelId> {
        Volume::open(self, name, mode)
    }

    fn close(&mut self, channel: ChannelId) -> VfsResult<()> {
        Volume::close(self, channel)
    }

    fn read(&mut self, channel: ChannelId, pos: u64, buf: &mut [u8]) -> VfsResult<usize> {
        Volume::read(self, channel, pos, buf)
    }

    fn write(&mut self, channel: ChannelId, pos: u64, buf: &[u8]) -> VfsResult<usize> {
        Volume::write(self, channel, pos, buf)
    }

    fn delete(&mut self, name: &[u8]) -> VfsResult<()> {
        Volume::delete(self, name)
    }

    fn rename(&mut self, channel: ChannelId, new_name: &[u8]) -> VfsResult<()> {
        Volume::rename(self, channel, new_name)
    }

    fn length(&self, channel: ChannelId) -> VfsResult<u64> {
        Volume::length(self, channel)
    }

    fn free_space(&self) -> VfsResult<FreeSpace> {
        Ok(Volume::free_space(self))
    }

    fn info(&self) -> VfsResult<VolumeInfo> {
        Ok(Volume::info(self))
    }

    fn truncate(&mut self, channel: ChannelId, len: u64) -> VfsResult<()> {
        Volume::truncate(self, channel, len)
    }

    fn format(&mut self, name: &[u8]) -> VfsResult<()> {
        Volume::format(self, name)
    }

    fn unmount(&mut self) -> VfsResult<()> {
        self.close_all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::MemDevice;
    use std::cell::Cell;
    use std::rc::Rc;

    fn volume(clusters: u16) -> (Volume, MemDevice) {
        let dev = MemDevice::new(0);
        let opts = FormatOptions::new(b"UNIT").sectors_per_cluster(1).clusters(clusters);
        let volume = Volume::format_new(Box::new(dev.clone()), &opts).unwrap();
        (volume, dev)
    }

    fn create(volume: &mut Volume, name: &[u8], data: &[u8]) {
        let ch = volume.open(name, OpenMode::CreateNew).unwrap();
        volume.write(ch, 0, data).unwrap();
        volume.close(ch).unwrap();
    }

    fn mkdir(volume: &mut Volume, name: &[u8]) -> DirId {
        let ch = volume.open(name, OpenMode::CreateNew).unwrap();
        volume.make_directory(ch).unwrap()
    }

    fn assert_conserved(volume: &Volume) {
        let fat = volume.drive().fat();
        assert!(fat.check().is_ok());
        let free = fat.free_list().unwrap();
        assert!(free.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[test]
    fn create_write_and_reopen() {
        let (mut volume, dev) = volume(64);
        create(&mut volume, b"notes", b"hello world");
        drop(volume);

        let mut volume = Volume::mount(Box::new(dev), &MountOptions::default()).unwrap();
        let ch = volume.open(b"NOTES", OpenMode::Shared).unwrap();
        assert_eq!(volume.length(ch).unwrap(), 11);
        let mut buf = [0u8; 32];
        assert_eq!(volume.read(ch, 0, &mut buf).unwrap(), 11);
        assert_eq!(&buf[..11], b"hello world");
        let header = volume.header(ch).unwrap();
        assert_eq!(header.version, 1);
        assert_eq!(&header.name[..], b"notes");
        volume.close(ch).unwrap();
        assert_conserved(&volume);
    }

    #[test]
    fn open_modes_enforce_one_writer() {
        let (mut volume, _) = volume(64);
        create(&mut volume, b"shared", b"x");
        let reader = volume.open(b"shared", OpenMode::Shared).unwrap();
        let second = volume.open(b"shared", OpenMode::Shared).unwrap();
        assert_eq!(volume.open(b"shared", OpenMode::Exclusive), Err(VfsError::Busy));
        volume.close(reader).unwrap();
        volume.close(second).unwrap();

        let writer = volume.open(b"shared", OpenMode::Exclusive).unwrap();
        assert_eq!(volume.open(b"shared", OpenMode::Shared), Err(VfsError::Busy));
        assert_eq!(volume.open(b"shared", OpenMode::Exclusive), Err(VfsError::Busy));
        assert_eq!(volume.open(b"shared", OpenMode::CreateNew), Err(VfsError::AlreadyExists));
        assert_eq!(volume.delete(b"shared"), Err(VfsError::Busy));
        volume.close(writer).unwrap();
        assert_eq!(volume.open(b"missing", OpenMode::Shared), Err(VfsError::NotFound));
    }

    #[test]
    fn overwrite_replaces_content() {
        let (mut volume, _) = volume(64);
        create(&mut volume, b"log", &[1u8; 1500]);
        let free = volume.free_space().free_clusters;
        let ch = volume.open(b"log", OpenMode::Overwrite).unwrap();
        assert_eq!(volume.length(ch).unwrap(), 0);
        volume.close(ch).unwrap();
        assert_eq!(volume.free_space().free_clusters, free + 3);
        assert_conserved(&volume);
    }

    #[test]
    fn nested_directories_resolve_by_prefix() {
        let (mut volume, _) = volume(128);
        let a = mkdir(&mut volume, b"A");
        let ab = mkdir(&mut volume, b"A_B");
        let abc = mkdir(&mut volume, b"A_B_C");
        assert_eq!(volume.dir_path(abc).unwrap(), b"A_B_C");
        assert_eq!(volume.resolve(b"A_B_C_file").unwrap(), abc);
        assert_eq!(volume.resolve(b"A_Bfile").unwrap(), a);
        assert_eq!(volume.resolve(b"a_b_x").unwrap(), ab);
        assert_eq!(volume.resolve(b"Afile").unwrap(), ROOT);
    }

    #[test]
    fn conversion_moves_prefixed_entries() {
        let (mut volume, _) = volume(64);
        create(&mut volume, b"NAME_X", b"child");
        create(&mut volume, b"NAMEX", b"sibling");
        let keep = volume.open(b"NAME_X", OpenMode::Shared).unwrap();
        let dir = mkdir(&mut volume, b"NAME");

        assert_eq!(volume.resolve(b"NAME_X").unwrap(), dir);
        let root: Vec<_> = volume.list(b"").unwrap();
        let names: Vec<&[u8]> = root.iter().map(|entry| &entry.name[..]).collect();
        assert_eq!(names, vec![&b"NAMEX"[..], &b"NAME"[..]]);
        let inside = volume.list(b"NAME").unwrap();
        assert_eq!(inside.len(), 1);
        assert_eq!(&inside[0].name[..], b"NAME_X");

        // The channel opened before the move still reads and closes cleanly.
        let mut buf = [0u8; 8];
        assert_eq!(volume.read(keep, 0, &mut buf).unwrap(), 5);
        volume.close(keep).unwrap();
        assert_eq!(volume.open(b"NAME_X", OpenMode::Exclusive).map(|_| ()), Ok(()));
    }

    #[test]
    fn deleting_leaves_a_hole() {
        let (mut volume, _) = volume(64);
        create(&mut volume, b"one", b"1");
        create(&mut volume, b"two", b"2");
        let dir = volume.open(b"", OpenMode::Directory).unwrap();
        let before = volume.length(dir).unwrap();
        volume.delete(b"two").unwrap();
        assert_eq!(volume.length(dir).unwrap(), before);
        create(&mut volume, b"three", b"3");
        assert_eq!(volume.length(dir).unwrap(), before);
        volume.close(dir).unwrap();
        assert_conserved(&volume);
    }

    #[test]
    fn non_empty_directory_is_not_deleted() {
        let (mut volume, _) = volume(64);
        mkdir(&mut volume, b"work");
        create(&mut volume, b"work_file", b"data");
        assert_eq!(volume.delete(b"work"), Err(VfsError::Busy));
        volume.delete(b"work_file").unwrap();
        volume.delete(b"work_").unwrap();
        assert_eq!(volume.list(b"").unwrap().len(), 0);
        assert_conserved(&volume);
    }

    #[test]
    fn rename_moves_between_directories() {
        let (mut volume, _) = volume(64);
        let docs = mkdir(&mut volume, b"docs");
        create(&mut volume, b"draft", b"text");
        let ch = volume.open(b"draft", OpenMode::Exclusive).unwrap();
        volume.rename(ch, b"DOCS_final").unwrap();
        volume.close(ch).unwrap();
        assert_eq!(volume.resolve(b"docs_final").unwrap(), docs);
        let inside = volume.list(b"docs").unwrap();
        assert_eq!(&inside[0].name[..], b"docs_final");
        assert_eq!(volume.open(b"draft", OpenMode::Shared), Err(VfsError::NotFound));

        create(&mut volume, b"other", b"");
        let ch = volume.open(b"other", OpenMode::Exclusive).unwrap();
        assert_eq!(volume.rename(ch, b"docs_final"), Err(VfsError::AlreadyExists));
        volume.close(ch).unwrap();
    }

    #[test]
    fn directory_open_falls_back_to_container() {
        let (mut volume, _) = volume(64);
        mkdir(&mut volume, b"src");
        create(&mut volume, b"src_main", b"fn");
        let ch = volume.open(b"src_nothing", OpenMode::Directory).unwrap();
        let entry = volume.header(ch).unwrap();
        assert_eq!(entry.length, 2 * ENTRY_SIZE as u32);
        let mut buf = [0u8; ENTRY_SIZE];
        assert_eq!(volume.read(ch, 0, &mut buf).unwrap(), ENTRY_SIZE);
        assert_eq!(entry::slot_name(&buf), b"src_main");
        assert_eq!(volume.write(ch, 0, b"x"), Err(VfsError::ReadOnly));
        assert_eq!(volume.open(b"src", OpenMode::Exclusive), Err(VfsError::Busy));
        volume.close(ch).unwrap();
    }

    #[test]
    fn full_volume_refuses_without_side_effects() {
        let (mut volume, _) = volume(8);
        let free = volume.free_space().free_clusters;
        let ch = volume.open(b"big", OpenMode::CreateNew).unwrap();
        let data = vec![0xeeu8; 512 * free as usize];
        assert_eq!(volume.write(ch, 0, &data), Err(VfsError::InsufficientSpace));
        assert_eq!(volume.length(ch).unwrap(), 0);
        volume.close(ch).unwrap();
        assert!(!volume.is_poisoned());
        assert_conserved(&volume);
    }

    #[test]
    fn raw_handle_excludes_everything() {
        let (mut volume, _) = volume(32);
        create(&mut volume, b"file", b"abc");
        let ch = volume.open(b"file", OpenMode::Shared).unwrap();
        assert_eq!(volume.open_raw(), Err(VfsError::Busy));
        volume.close(ch).unwrap();

        let raw = volume.open_raw().unwrap();
        assert_eq!(volume.open(b"file", OpenMode::Shared), Err(VfsError::Busy));
        let mut sector = [0u8; SECTOR_SIZE];
        assert_eq!(volume.read_sector(raw, 9999, &mut sector).unwrap(), 31);
        assert_eq!(volume.read_sector(raw, 0, &mut sector).unwrap(), 0);
        assert_eq!(&sector[..4], b"QLWA");
        volume.close(raw).unwrap();
        assert!(volume.open(b"file", OpenMode::Shared).is_ok());
    }

    #[test]
    fn raw_writes_are_seen_after_close() {
        let (mut volume, _) = volume(32);
        let raw = volume.open_raw().unwrap();
        let mut sector = [0u8; SECTOR_SIZE];
        volume.read_sector(raw, 0, &mut sector).unwrap();
        sector[4..8].copy_from_slice(b"DISK");
        volume.write_sector(raw, 0, &sector).unwrap();
        volume.close(raw).unwrap();
        assert_eq!(volume.info().name(), b"DISK");
    }

    #[test]
    fn format_needs_closed_channels() {
        let (mut volume, _) = volume(32);
        create(&mut volume, b"old", b"data");
        let ch = volume.open(b"old", OpenMode::Shared).unwrap();
        assert_eq!(volume.format(b"NEW"), Err(VfsError::Busy));
        volume.close(ch).unwrap();
        volume.format(b"NEW").unwrap();
        assert_eq!(volume.info().name(), b"NEW");
        assert!(volume.list(b"").unwrap().is_empty());
        assert_eq!(volume.free_space().free_clusters, 30);
    }

    #[test]
    fn header_changes_stick() {
        let (mut volume, _) = volume(32);
        let ch = volume.open(b"prog", OpenMode::CreateNew).unwrap();
        volume.write(ch, 0, &[0x4e, 0x75]).unwrap();
        volume
            .set_header(ch, FileType::Executable, [0, 0, 0, 0x10, 0, 0, 0, 0])
            .unwrap();
        assert_eq!(
            volume.set_header(ch, FileType::Directory, [0; 8]),
            Err(VfsError::InvalidParameter)
        );
        volume.close(ch).unwrap();
        let entry = &volume.list(b"").unwrap()[0];
        assert_eq!(entry.file_type, FileType::Executable);
        assert_eq!(entry.info[3], 0x10);
        assert_eq!(entry.length, 66);
    }

    struct Flaky {
        inner: MemDevice,
        failing: Rc<Cell<bool>>,
    }

    impl BlockDevice for Flaky {
        fn block_size(&self) -> usize {
            self.inner.block_size()
        }

        fn block_count(&self) -> u64 {
            self.inner.block_count()
        }

        fn read_block(&self, block_id: u64, buf: &mut [u8]) -> VfsResult<()> {
            self.inner.read_block(block_id, buf)
        }

        fn write_block(&self, block_id: u64, buf: &[u8]) -> VfsResult<()> {
            if self.failing.get() {
                return Err(VfsError::Io);
            }
            self.inner.write_block(block_id, buf)
        }

        fn flush(&self) -> VfsResult<()> {
            self.inner.flush()
        }

        fn resize(&self, blocks: u64) -> VfsResult<()> {
            self.inner.resize(blocks)
        }
    }

    #[test]
    fn failed_update_poisons_until_format() {
        let failing = Rc::new(Cell::new(false));
        let dev = Flaky {
            inner: MemDevice::new(0),
            failing: failing.clone(),
        };
        let opts = FormatOptions::new(b"FLAKY").sectors_per_cluster(1).clusters(32);
        let mut volume = Volume::format_new(Box::new(dev), &opts).unwrap();
        create(&mut volume, b"before", b"data");

        failing.set(true);
        assert_eq!(volume.open(b"after", OpenMode::CreateNew), Err(VfsError::Io));
        assert!(volume.is_poisoned());
        assert_eq!(volume.open(b"before", OpenMode::Shared), Err(VfsError::CorruptVolume));
        assert_eq!(volume.delete(b"before"), Err(VfsError::CorruptVolume));
        assert_eq!(volume.list(b""), Err(VfsError::CorruptVolume));

        failing.set(false);
        volume.format(b"AGAIN").unwrap();
        assert!(!volume.is_poisoned());
        assert_eq!(volume.open(b"before", OpenMode::Shared), Err(VfsError::NotFound));
        create(&mut volume, b"after", b"ok");
        assert_conserved(&volume);
    }

    #[test]
    fn conversion_without_room_changes_nothing() {
        let (mut volume, _) = volume(16);
        for idx in 1..=8 {
            create(&mut volume, format!("d_{idx}").as_bytes(), b"");
        }
        create(&mut volume, b"pad", &[0u8; 4 * 512 - 64]);
        let ch = volume.open(b"d", OpenMode::CreateNew).unwrap();
        assert_eq!(volume.free_space().free_clusters, 0);

        // Eight adopted entries plus the header need a second cluster.
        assert_eq!(volume.make_directory(ch), Err(VfsError::InsufficientSpace));
        assert!(!volume.is_poisoned());
        assert!(!volume.header(ch).unwrap().is_dir());
        volume.close(ch).unwrap();
        let entries = volume.list(b"").unwrap();
        assert_eq!(entries.len(), 10);
        assert!(entries.iter().all(|entry| !entry.is_dir()));
        assert_conserved(&volume);
    }

    #[test]
    fn full_channel_table_is_out_of_memory() {
        let (mut volume, _) = volume(32);
        create(&mut volume, b"popular", b"x");
        let channels: Vec<ChannelId> = (0..MAX_CHANNELS)
            .map(|_| volume.open(b"popular", OpenMode::Shared).unwrap())
            .collect();
        assert_eq!(volume.open(b"popular", OpenMode::Shared), Err(VfsError::OutOfMemory));
        assert_eq!(volume.open(b"", OpenMode::Directory), Err(VfsError::OutOfMemory));
        volume.close(channels[0]).unwrap();
        let ch = volume.open(b"popular", OpenMode::Shared).unwrap();
        volume.close(ch).unwrap();
    }

    #[test]
    fn bad_channels() {
        let (mut volume, _) = volume(32);
        let mut buf = [0u8; 4];
        assert_eq!(volume.read(7, 0, &mut buf), Err(VfsError::NotOpen));
        assert_eq!(volume.close(7), Err(VfsError::NotOpen));
        assert_eq!(volume.make_directory(7), Err(VfsError::NotOpen));
    }
}
