//! QLWA hard-disk volumes stored as a single host file.

pub mod block;
pub mod config;
pub mod directory;
pub mod drive;
pub mod drives;
pub mod entry;
pub mod fat;
pub mod file;
pub mod format;
pub mod header;
pub mod raw;
mod slots;
pub mod trap;
pub mod volume;

pub use qlvfs::{
    ChannelId, DriveOps, FileType, FreeSpace, GuestMemory, OpenMode, VfsError, VfsResult,
    VolumeInfo,
};

pub use block::{BlockDevice, FileDevice, MemDevice};
pub use config::{FormatOptions, LockPolicy, MountOptions, RepairPolicy};
pub use directory::DirId;
pub use drives::DriveTable;
pub use entry::DirEntry;
pub use volume::Volume;
