#![no_std]

// Vocabulary shared by the storage drivers and the trap dispatcher. Kept
// allocation-free so the dispatcher can use it without a heap.

pub type ChannelId = usize;

/// Longest name a directory entry can carry.
pub const MAX_NAME_LEN: usize = 36;
/// Width of the space-padded volume name in the volume header.
pub const VOLUME_NAME_LEN: usize = 20;

#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum VfsError {
    #[error("not found")]
    NotFound,
    #[error("already exists")]
    AlreadyExists,
    #[error("in use")]
    Busy,
    #[error("read only")]
    ReadOnly,
    #[error("drive full")]
    InsufficientSpace,
    #[error("bad parameter")]
    InvalidParameter,
    #[error("out of memory")]
    OutOfMemory,
    #[error("corrupt volume")]
    CorruptVolume,
    #[error("backing store is locked by another process")]
    LockUnavailable,
    #[error("unsupported volume format")]
    UnsupportedFormat,
    #[error("channel not open")]
    NotOpen,
    #[error("end of file")]
    EndOfFile,
    #[error("host i/o error")]
    Io,
}

impl VfsError {
    /// Guest OS error code reported back through the trap interface.
    pub const fn qdos_code(self) -> i32 {
        match self {
            Self::OutOfMemory => -3,
            Self::NotOpen => -6,
            Self::NotFound => -7,
            Self::AlreadyExists => -8,
            Self::Busy | Self::LockUnavailable => -9,
            Self::EndOfFile => -10,
            Self::InsufficientSpace => -11,
            Self::UnsupportedFormat => -14,
            Self::InvalidParameter => -15,
            Self::CorruptVolume | Self::Io => -16,
            Self::ReadOnly => -20,
        }
    }
}

pub type VfsResult<T> = core::result::Result<T, VfsError>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileType {
    Plain,
    Executable,
    Relocatable,
    Loader,
    Directory,
    Other(u8),
}

impl FileType {
    pub const fn from_byte(value: u8) -> Self {
        match value {
            0 => Self::Plain,
            1 => Self::Executable,
            2 => Self::Relocatable,
            3 => Self::Loader,
            0xff => Self::Directory,
            other => Self::Other(other),
        }
    }

    pub const fn to_byte(self) -> u8 {
        match self {
            Self::Plain => 0,
            Self::Executable => 1,
            Self::Relocatable => 2,
            Self::Loader => 3,
            Self::Directory => 0xff,
            Self::Other(other) => other,
        }
    }

    pub const fn is_dir(self) -> bool {
        matches!(self, Self::Directory)
    }
}

/// How a name is opened. The discriminants are the guest's open keys.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpenMode {
    /// Existing file, read/write, no other channel may be open on it.
    Exclusive = 0,
    /// Existing file, read only, refused only while a writer is open.
    Shared = 1,
    /// New file; fails if the name already exists.
    CreateNew = 2,
    /// New file; an existing file of the same name is deleted first.
    Overwrite = 3,
    /// Directory; falls back to the containing directory.
    Directory = 4,
}

impl OpenMode {
    pub const fn from_key(key: u8) -> VfsResult<Self> {
        match key {
            0 => Ok(Self::Exclusive),
            1 => Ok(Self::Shared),
            2 => Ok(Self::CreateNew),
            3 => Ok(Self::Overwrite),
            4 => Ok(Self::Directory),
            _ => Err(VfsError::InvalidParameter),
        }
    }

    pub const fn is_read_only(self) -> bool {
        matches!(self, Self::Shared | Self::Directory)
    }

    pub const fn creates(self) -> bool {
        matches!(self, Self::CreateNew | Self::Overwrite)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FreeSpace {
    pub free_clusters: u32,
    pub total_clusters: u32,
    pub cluster_size: u32,
}

impl FreeSpace {
    pub const fn free_bytes(&self) -> u64 {
        self.free_clusters as u64 * self.cluster_size as u64
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VolumeInfo {
    pub name: [u8; VOLUME_NAME_LEN],
    pub sector_size: u16,
    pub sectors_per_cluster: u16,
    pub total_clusters: u32,
    pub free_clusters: u32,
    pub read_only: bool,
}

impl VolumeInfo {
    /// Volume name without its space padding.
    pub fn name(&self) -> &[u8] {
        let len = self
            .name
            .iter()
            .rposition(|ch| *ch != b' ')
            .map(|idx| idx + 1)
            .unwrap_or(0);
        &self.name[..len]
    }

    pub const fn cluster_size(&self) -> u32 {
        self.sector_size as u32 * self.sectors_per_cluster as u32
    }
}

/// Operations the trap dispatcher issues against a mounted drive.
pub trait DriveOps {
    fn open(&mut self, name: &[u8], mode: OpenMode) -> VfsResult<ChannelId>;
    fn close(&mut self, channel: ChannelId) -> VfsResult<()>;
    fn read(&mut self, channel: ChannelId, pos: u64, buf: &mut [u8]) -> VfsResult<usize>;
    fn write(&mut self, channel: ChannelId, pos: u64, buf: &[u8]) -> VfsResult<usize>;
    fn delete(&mut self, name: &[u8]) -> VfsResult<()>;
    fn rename(&mut self, channel: ChannelId, new_name: &[u8]) -> VfsResult<()>;
    fn length(&self, channel: ChannelId) -> VfsResult<u64>;
    fn free_space(&self) -> VfsResult<FreeSpace>;
    fn info(&self) -> VfsResult<VolumeInfo>;
    fn truncate(&mut self, _channel: ChannelId, _len: u64) -> VfsResult<()> {
        Err(VfsError::InvalidParameter)
    }
    fn format(&mut self, _name: &[u8]) -> VfsResult<()> {
        Err(VfsError::InvalidParameter)
    }
    /// Close every channel before the drive is detached.
    fn unmount(&mut self) -> VfsResult<()> {
        Ok(())
    }
}

/// Guest memory as seen by the CPU emulator. Multi-byte values are
/// big-endian, matching the guest CPU.
pub trait GuestMemory {
    fn read_byte(&self, addr: u32) -> u8;
    fn write_byte(&mut self, addr: u32, value: u8);

    fn read_word(&self, addr: u32) -> u16 {
        u16::from_be_bytes([self.read_byte(addr), self.read_byte(addr.wrapping_add(1))])
    }

    fn read_long(&self, addr: u32) -> u32 {
        ((self.read_word(addr) as u32) << 16) | self.read_word(addr.wrapping_add(2)) as u32
    }

    fn write_word(&mut self, addr: u32, value: u16) {
        let bytes = value.to_be_bytes();
        self.write_byte(addr, bytes[0]);
        self.write_byte(addr.wrapping_add(1), bytes[1]);
    }

    fn write_long(&mut self, addr: u32, value: u32) {
        self.write_word(addr, (value >> 16) as u16);
        self.write_word(addr.wrapping_add(2), value as u16);
    }
}
