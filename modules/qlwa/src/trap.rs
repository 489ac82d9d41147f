use qlvfs::{ChannelId, GuestMemory, OpenMode, VfsError, VfsResult, MAX_NAME_LEN, VOLUME_NAME_LEN};

use crate::drives::{DriveTable, DEVICE_PREFIX};

pub const GUEST_NAME_LEN: usize = MAX_NAME_LEN + 8;

pub type GuestName = heapless::Vec<u8, GUEST_NAME_LEN>;

pub const INFO_BLOCK_LEN: u32 = 0x24;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GuestChannel {
    pub drive: usize,
    pub channel: ChannelId,
}

fn code(err: VfsError) -> i32 {
    err.qdos_code()
}

/// Read a guest string: a length word followed by that many bytes.
pub fn read_string(mem: &impl GuestMemory, addr: u32) -> VfsResult<GuestName> {
    let len = mem.read_word(addr) as usize;
    if len > GUEST_NAME_LEN {
        return Err(VfsError::InvalidParameter);
    }
    let mut name = GuestName::new();
    for idx in 0..len as u32 {
        name.push(mem.read_byte(addr.wrapping_add(2 + idx)))
            .map_err(|_| VfsError::InvalidParameter)?;
    }
    Ok(name)
}

pub fn trap_open(
    table: &mut DriveTable,
    mem: &impl GuestMemory,
    name_addr: u32,
    key: u8,
) -> Result<GuestChannel, i32> {
    let name = read_string(mem, name_addr).map_err(code)?;
    let mode = OpenMode::from_key(key).map_err(code)?;
    let (drive, rest) = table.resolve(&name).map_err(code)?;
    let channel = table
        .drive_mut(drive)
        .and_then(|ops| ops.open(rest, mode))
        .map_err(code)?;
    Ok(GuestChannel { drive, channel })
}

pub fn trap_close(table: &mut DriveTable, chan: GuestChannel) -> Result<(), i32> {
    table
        .drive_mut(chan.drive)
        .and_then(|ops| ops.close(chan.channel))
        .map_err(code)
}

pub fn trap_delete(table: &mut DriveTable, mem: &impl GuestMemory, name_addr: u32) -> Result<(), i32> {
    let name = read_string(mem, name_addr).map_err(code)?;
    let (drive, rest) = table.resolve(&name).map_err(code)?;
    table
        .drive_mut(drive)
        .and_then(|ops| ops.delete(rest))
        .map_err(code)
}

/// Rename within the channel's own drive; the new name carries the device
/// prefix like any other guest name.
pub fn trap_rename(
    table: &mut DriveTable,
    chan: GuestChannel,
    mem: &impl GuestMemory,
    name_addr: u32,
) -> Result<(), i32> {
    let name = read_string(mem, name_addr).map_err(code)?;
    let (drive, rest) = table.resolve(&name).map_err(code)?;
    if drive != chan.drive {
        return Err(code(VfsError::InvalidParameter));
    }
    table
        .drive_mut(drive)
        .and_then(|ops| ops.rename(chan.channel, rest))
        .map_err(code)
}

pub fn trap_read(
    table: &mut DriveTable,
    chan: GuestChannel,
    pos: u32,
    mem: &mut impl GuestMemory,
    buf_addr: u32,
    len: u32,
) -> Result<u32, i32> {
    let ops = table.drive_mut(chan.drive).map_err(code)?;
    let left = ops
        .length(chan.channel)
        .map_err(code)?
        .saturating_sub(pos as u64);
    let want = left.min(len as u64) as usize;
    let mut buf = Vec::new();
    buf.try_reserve_exact(want)
        .map_err(|_| code(VfsError::OutOfMemory))?;
    buf.resize(want, 0);
    let count = ops
        .read(chan.channel, pos as u64, &mut buf)
        .map_err(code)?;
    if count == 0 && len > 0 {
        return Err(code(VfsError::EndOfFile));
    }
    for (idx, byte) in buf[..count].iter().enumerate() {
        mem.write_byte(buf_addr.wrapping_add(idx as u32), *byte);
    }
    Ok(count as u32)
}

pub fn trap_write(
    table: &mut DriveTable,
    chan: GuestChannel,
    pos: u32,
    mem: &impl GuestMemory,
    buf_addr: u32,
    len: u32,
) -> Result<u32, i32> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(len as usize)
        .map_err(|_| code(VfsError::OutOfMemory))?;
    buf.extend((0..len).map(|idx| mem.read_byte(buf_addr.wrapping_add(idx))));
    let count = table
        .drive_mut(chan.drive)
        .and_then(|ops| ops.write(chan.channel, pos as u64, &buf))
        .map_err(code)?;
    Ok(count as u32)
}

pub fn trap_truncate(table: &mut DriveTable, chan: GuestChannel, len: u32) -> Result<(), i32> {
    table
        .drive_mut(chan.drive)
        .and_then(|ops| ops.truncate(chan.channel, len as u64))
        .map_err(code)
}

pub fn trap_format(table: &mut DriveTable, mem: &impl GuestMemory, name_addr: u32) -> Result<(), i32> {
    let name = read_string(mem, name_addr).map_err(code)?;
    let (drive, rest) = table.resolve(&name).map_err(code)?;
    if rest.len() > VOLUME_NAME_LEN {
        return Err(code(VfsError::InvalidParameter));
    }
    table
        .drive_mut(drive)
        .and_then(|ops| ops.format(rest))
        .map_err(code)
}

/// Fill the extended-info block at `addr`:
///
/// | offset | size | field |
/// |--------|------|-------|
/// | 0x00 | 2+20 | volume name as a guest string, space padded |
/// | 0x16 | 1 | drive number |
/// | 0x17 | 1 | non-zero when read only |
/// | 0x18 | 2 | sector size |
/// | 0x1a | 2 | sectors per cluster |
/// | 0x1c | 4 | total clusters |
/// | 0x20 | 4 | free clusters |
pub fn trap_info(
    table: &DriveTable,
    drive: usize,
    mem: &mut impl GuestMemory,
    addr: u32,
) -> Result<(), i32> {
    let info = table
        .drive(drive)
        .and_then(|ops| ops.info())
        .map_err(code)?;
    mem.write_word(addr, VOLUME_NAME_LEN as u16);
    for (idx, byte) in info.name.iter().enumerate() {
        mem.write_byte(addr.wrapping_add(2 + idx as u32), *byte);
    }
    mem.write_byte(addr.wrapping_add(0x16), drive as u8);
    mem.write_byte(addr.wrapping_add(0x17), info.read_only as u8);
    mem.write_word(addr.wrapping_add(0x18), info.sector_size);
    mem.write_word(addr.wrapping_add(0x1a), info.sectors_per_cluster);
    mem.write_long(addr.wrapping_add(0x1c), info.total_clusters);
    mem.write_long(addr.wrapping_add(0x20), info.free_clusters);
    Ok(())
}

/// Write `WINn_` as a guest string at `addr`, for directory listings that
/// show the device.
pub fn write_device_name(mem: &mut impl GuestMemory, addr: u32, drive: usize) {
    mem.write_word(addr, DEVICE_PREFIX.len() as u16 + 2);
    for (idx, byte) in DEVICE_PREFIX.iter().enumerate() {
        mem.write_byte(addr.wrapping_add(2 + idx as u32), *byte);
    }
    let at = addr.wrapping_add(2 + DEVICE_PREFIX.len() as u32);
    mem.write_byte(at, b'0' + drive as u8);
    mem.write_byte(at.wrapping_add(1), b'_');
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::MemDevice;
    use crate::config::FormatOptions;
    use crate::volume::Volume;

    struct Ram(Vec<u8>);

    impl GuestMemory for Ram {
        fn read_byte(&self, addr: u32) -> u8 {
            self.0[addr as usize]
        }

        fn write_byte(&mut self, addr: u32, value: u8) {
            self.0[addr as usize] = value;
        }
    }

    impl Ram {
        fn put_string(&mut self, addr: u32, text: &[u8]) {
            self.write_word(addr, text.len() as u16);
            for (idx, byte) in text.iter().enumerate() {
                self.write_byte(addr + 2 + idx as u32, *byte);
            }
        }
    }

    fn table() -> DriveTable {
        let opts = FormatOptions::new(b"GUEST").sectors_per_cluster(1).clusters(64);
        let volume = Volume::format_new(Box::new(MemDevice::new(0)), &opts).unwrap();
        let mut table = DriveTable::new();
        table.mount(1, Box::new(volume)).unwrap();
        table
    }

    #[test]
    fn open_write_read_through_guest_memory() {
        let mut table = table();
        let mut ram = Ram(vec![0; 0x400]);
        ram.put_string(0x10, b"win1_hello");
        ram.0[0x100..0x105].copy_from_slice(b"howdy");

        let chan = trap_open(&mut table, &ram, 0x10, OpenMode::CreateNew as u8).unwrap();
        assert_eq!(trap_write(&mut table, chan, 0, &ram, 0x100, 5), Ok(5));
        assert_eq!(trap_read(&mut table, chan, 1, &mut ram, 0x200, 16), Ok(4));
        assert_eq!(&ram.0[0x200..0x204], b"owdy");
        assert_eq!(
            trap_read(&mut table, chan, 5, &mut ram, 0x200, 16),
            Err(VfsError::EndOfFile.qdos_code())
        );
        trap_close(&mut table, chan).unwrap();

        assert_eq!(trap_open(&mut table, &ram, 0x10, OpenMode::CreateNew as u8), Err(-8));
        assert_eq!(trap_open(&mut table, &ram, 0x10, 9), Err(-15));
        trap_delete(&mut table, &ram, 0x10).unwrap();
        assert_eq!(trap_delete(&mut table, &ram, 0x10), Err(-7));
    }

    #[test]
    fn huge_read_is_cut_to_the_data() {
        let mut table = table();
        let mut ram = Ram(vec![0; 0x100]);
        ram.put_string(0x10, b"WIN1_small");
        ram.0[0x80..0x83].copy_from_slice(b"abc");
        let chan = trap_open(&mut table, &ram, 0x10, OpenMode::CreateNew as u8).unwrap();
        trap_write(&mut table, chan, 0, &ram, 0x80, 3).unwrap();
        assert_eq!(trap_read(&mut table, chan, 1, &mut ram, 0xc0, u32::MAX), Ok(2));
        assert_eq!(&ram.0[0xc0..0xc2], b"bc");
        assert_eq!(
            trap_read(&mut table, chan, u32::MAX, &mut ram, 0xc0, u32::MAX),
            Err(VfsError::EndOfFile.qdos_code())
        );
    }

    #[test]
    fn device_name_wraps_at_the_top_of_memory() {
        struct Wrap(Vec<u8>);

        impl GuestMemory for Wrap {
            fn read_byte(&self, addr: u32) -> u8 {
                self.0[addr as usize % 8]
            }

            fn write_byte(&mut self, addr: u32, value: u8) {
                self.0[addr as usize % 8] = value;
            }
        }

        let mut mem = Wrap(vec![0; 8]);
        write_device_name(&mut mem, u32::MAX - 1, 2);
        assert_eq!(&mem.0[..5], b"WIN2_");
    }

    #[test]
    fn unknown_device_is_not_found() {
        let mut table = table();
        let mut ram = Ram(vec![0; 0x100]);
        ram.put_string(0, b"WIN4_x");
        assert_eq!(trap_open(&mut table, &ram, 0, 1), Err(-7));
        ram.put_string(0, &[b'x'; GUEST_NAME_LEN + 1]);
        assert_eq!(trap_open(&mut table, &ram, 0, 1), Err(-15));
    }

    #[test]
    fn info_block_layout() {
        let table = table();
        let mut ram = Ram(vec![0; 0x100]);
        trap_info(&table, 1, &mut ram, 0x40).unwrap();
        assert_eq!(ram.read_word(0x40), 20);
        assert_eq!(&ram.0[0x42..0x47], b"GUEST");
        assert_eq!(ram.0[0x47], b' ');
        assert_eq!(ram.0[0x56], 1);
        assert_eq!(ram.0[0x57], 0);
        assert_eq!(ram.read_word(0x58), 512);
        assert_eq!(ram.read_word(0x5a), 1);
        assert_eq!(ram.read_long(0x5c), 64);
        assert_eq!(ram.read_long(0x60), 62);
        assert_eq!(trap_info(&table, 2, &mut ram, 0), Err(-7));
    }

    #[test]
    fn format_by_device_name() {
        let mut table = table();
        let mut ram = Ram(vec![0; 0x100]);
        ram.put_string(0, b"WIN1_Fresh");
        trap_format(&mut table, &ram, 0).unwrap();
        let mut info = Ram(vec![0; 0x40]);
        trap_info(&table, 1, &mut info, 0).unwrap();
        assert_eq!(&info.0[2..7], b"Fresh");
    }

    #[test]
    fn device_name_string() {
        let mut ram = Ram(vec![0; 0x10]);
        write_device_name(&mut ram, 0, 3);
        assert_eq!(ram.read_word(0), 5);
        assert_eq!(&ram.0[2..7], b"WIN3_");
    }
}
