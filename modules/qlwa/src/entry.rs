use std::time::{SystemTime, UNIX_EPOCH};

use qlvfs::{FileType, VfsError, VfsResult, MAX_NAME_LEN};

use crate::config::QDOS_EPOCH_OFFSET;
use crate::header::{read_u16, read_u32, write_u16, write_u32};

pub const ENTRY_SIZE: usize = 0x40;
pub const SEPARATOR: u8 = b'_';

const LENGTH_OFFSET: usize = 0x00;
const ACCESS_OFFSET: usize = 0x04;
const TYPE_OFFSET: usize = 0x05;
const INFO_OFFSET: usize = 0x06;
const INFO_LEN: usize = 8;
const NAME_LEN_OFFSET: usize = 0x0e;
const NAME_OFFSET: usize = 0x10;
const UPDATE_DATE_OFFSET: usize = 0x34;
const VERSION_OFFSET: usize = 0x38;
const FIRST_CLUSTER_OFFSET: usize = 0x3a;
const BACKUP_DATE_OFFSET: usize = 0x3c;

pub type EntryName = heapless::Vec<u8, MAX_NAME_LEN>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntry {
    /// File length including the 64-byte header.
    pub length: u32,
    pub access: u8,
    pub file_type: FileType,
    pub info: [u8; INFO_LEN],
    pub name: EntryName,
    pub update_date: u32,
    pub version: u16,
    pub first_cluster: u16,
    pub backup_date: u32,
}

impl DirEntry {
    pub fn new(name: &[u8], first_cluster: u16) -> VfsResult<Self> {
        Ok(Self {
            length: ENTRY_SIZE as u32,
            access: 0,
            file_type: FileType::Plain,
            info: [0; INFO_LEN],
            name: entry_name(name)?,
            update_date: qdos_now(),
            version: 0,
            first_cluster,
            backup_date: 0,
        })
    }

    pub fn parse(buf: &[u8]) -> Self {
        let name_len = (read_u16(buf, NAME_LEN_OFFSET) & 0xff) as usize;
        let name_len = name_len.min(MAX_NAME_LEN);
        let name =
            EntryName::from_slice(&buf[NAME_OFFSET..NAME_OFFSET + name_len]).unwrap_or_default();
        let mut info = [0u8; INFO_LEN];
        info.copy_from_slice(&buf[INFO_OFFSET..INFO_OFFSET + INFO_LEN]);
        Self {
            length: read_u32(buf, LENGTH_OFFSET),
            access: buf[ACCESS_OFFSET],
            file_type: FileType::from_byte(buf[TYPE_OFFSET]),
            info,
            name,
            update_date: read_u32(buf, UPDATE_DATE_OFFSET),
            version: read_u16(buf, VERSION_OFFSET),
            first_cluster: read_u16(buf, FIRST_CLUSTER_OFFSET),
            backup_date: read_u32(buf, BACKUP_DATE_OFFSET),
        }
    }

    pub fn encode(&self, buf: &mut [u8]) {
        let slot = &mut buf[..ENTRY_SIZE];
        slot.fill(0);
        write_u32(slot, LENGTH_OFFSET, self.length);
        slot[ACCESS_OFFSET] = self.access;
        slot[TYPE_OFFSET] = self.file_type.to_byte();
        slot[INFO_OFFSET..INFO_OFFSET + INFO_LEN].copy_from_slice(&self.info);
        write_u16(slot, NAME_LEN_OFFSET, self.name.len() as u16);
        slot[NAME_OFFSET..NAME_OFFSET + self.name.len()].copy_from_slice(&self.name);
        write_u32(slot, UPDATE_DATE_OFFSET, self.update_date);
        write_u16(slot, VERSION_OFFSET, self.version);
        write_u16(slot, FIRST_CLUSTER_OFFSET, self.first_cluster);
        write_u32(slot, BACKUP_DATE_OFFSET, self.backup_date);
    }

    pub fn is_dir(&self) -> bool {
        self.file_type.is_dir()
    }
}

/// An entry slot is reusable iff its length and name length are both zero.
pub fn slot_is_free(slot: &[u8]) -> bool {
    read_u32(slot, LENGTH_OFFSET) == 0 && slot[NAME_LEN_OFFSET + 1] == 0
}

pub fn slot_name(slot: &[u8]) -> &[u8] {
    let len = (slot[NAME_LEN_OFFSET + 1] as usize).min(MAX_NAME_LEN);
    &slot[NAME_OFFSET..NAME_OFFSET + len]
}

pub fn slot_type(slot: &[u8]) -> FileType {
    FileType::from_byte(slot[TYPE_OFFSET])
}

pub fn slot_length(slot: &[u8]) -> u32 {
    read_u32(slot, LENGTH_OFFSET)
}

pub fn set_slot_length(slot: &mut [u8], length: u32) {
    write_u32(slot, LENGTH_OFFSET, length);
}

pub fn entry_name(name: &[u8]) -> VfsResult<EntryName> {
    if name.is_empty() {
        return Err(VfsError::InvalidParameter);
    }
    EntryName::from_slice(name).map_err(|_| VfsError::InvalidParameter)
}

fn fold(ch: u8) -> u8 {
    ch.to_ascii_uppercase()
}

/// Case-insensitive name equality; lengths are compared first.
pub fn names_equal(left: &[u8], right: &[u8]) -> bool {
    if left.len() != right.len() {
        return false;
    }
    left.iter().zip(right).all(|(a, b)| fold(*a) == fold(*b))
}

/// Whether `name` starts with `prefix` followed by the separator.
pub fn is_under(name: &[u8], prefix: &[u8]) -> bool {
    if prefix.is_empty() {
        return true;
    }
    name.len() > prefix.len()
        && name[prefix.len()] == SEPARATOR
        && names_equal(&name[..prefix.len()], prefix)
}

/// A directory's name as given by the user may carry trailing separators
/// or padding; neither belongs to the stored name.
pub fn strip_dir_name(name: &[u8]) -> &[u8] {
    let end = name
        .iter()
        .rposition(|ch| *ch != SEPARATOR && *ch != b' ')
        .map(|idx| idx + 1)
        .unwrap_or(0);
    &name[..end]
}

pub fn qdos_from_unix(secs: u64) -> u32 {
    (secs + QDOS_EPOCH_OFFSET) as u32
}

pub fn unix_from_qdos(date: u32) -> u64 {
    (date as u64).saturating_sub(QDOS_EPOCH_OFFSET)
}

pub fn qdos_now() -> u32 {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0);
    qdos_from_unix(secs)
}
