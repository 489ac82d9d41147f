use log::info;
use qlvfs::{DriveOps, VfsError, VfsResult};

use crate::config::MAX_DRIVES;

pub const DEVICE_PREFIX: &[u8] = b"WIN";

pub struct DriveTable {
    drives: [Option<Box<dyn DriveOps>>; MAX_DRIVES],
}

impl Default for DriveTable {
    fn default() -> Self {
        Self::new()
    }
}

impl DriveTable {
    pub fn new() -> Self {
        Self {
            drives: Default::default(),
        }
    }

    fn index(number: usize) -> VfsResult<usize> {
        if (1..=MAX_DRIVES).contains(&number) {
            Ok(number - 1)
        } else {
            Err(VfsError::InvalidParameter)
        }
    }

    /// Attach `drive` as `WIN<number>_`.
    pub fn mount(&mut self, number: usize, drive: Box<dyn DriveOps>) -> VfsResult<()> {
        let slot = &mut self.drives[Self::index(number)?];
        if slot.is_some() {
            return Err(VfsError::Busy);
        }
        *slot = Some(drive);
        info!("mounted drive WIN{number}_");
        Ok(())
    }

    /// Close everything open on drive `number` and detach it. A drive whose
    /// channels fail to close stays mounted.
    pub fn unmount(&mut self, number: usize) -> VfsResult<Box<dyn DriveOps>> {
        let slot = &mut self.drives[Self::index(number)?];
        slot.as_mut().ok_or(VfsError::NotFound)?.unmount()?;
        let drive = slot.take().ok_or(VfsError::NotFound)?;
        info!("unmounted drive WIN{number}_");
        Ok(drive)
    }

    pub fn drive_mut(&mut self, number: usize) -> VfsResult<&mut dyn DriveOps> {
        match self.drives[Self::index(number)?].as_mut() {
            Some(drive) => Ok(drive.as_mut()),
            None => Err(VfsError::NotFound),
        }
    }

    pub fn drive(&self, number: usize) -> VfsResult<&dyn DriveOps> {
        match self.drives[Self::index(number)?].as_ref() {
            Some(drive) => Ok(drive.as_ref()),
            None => Err(VfsError::NotFound),
        }
    }

    /// Split a guest name into a mounted drive number and the name on that
    /// drive.
    pub fn resolve<'a>(&self, name: &'a [u8]) -> VfsResult<(usize, &'a [u8])> {
        let (number, rest) = split_device(name).ok_or(VfsError::NotFound)?;
        if self.drives[Self::index(number)?].is_none() {
            return Err(VfsError::NotFound);
        }
        Ok((number, rest))
    }
}

/// `WINn_rest` to `(n, rest)`, ignoring case in the prefix.
pub fn split_device(name: &[u8]) -> Option<(usize, &[u8])> {
    let prefix = DEVICE_PREFIX.len();
    if name.len() < prefix + 2 || !name[..prefix].eq_ignore_ascii_case(DEVICE_PREFIX) {
        return None;
    }
    let digit = name[prefix];
    if !digit.is_ascii_digit() || name[prefix + 1] != b'_' {
        return None;
    }
    Some(((digit - b'0') as usize, &name[prefix + 2..]))
}
