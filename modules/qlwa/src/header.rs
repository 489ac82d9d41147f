use qlvfs::{VfsError, VfsResult, VOLUME_NAME_LEN};

use crate::config::SECTOR_SIZE;

pub const MAGIC: [u8; 4] = *b"QLWA";
pub const HEADER_SIZE: usize = 0x40;

const MAGIC_OFFSET: usize = 0x00;
const NAME_OFFSET: usize = 0x04;
const UPDATE_CHECK_OFFSET: usize = 0x1a;
const INTERLEAVE_OFFSET: usize = 0x1e;
const SECTORS_PER_CLUSTER_OFFSET: usize = 0x20;
const SECTORS_PER_TRACK_OFFSET: usize = 0x22;
const TRACKS_PER_CYLINDER_OFFSET: usize = 0x24;
const CYLINDERS_OFFSET: usize = 0x26;
const TOTAL_CLUSTERS_OFFSET: usize = 0x28;
const FREE_CLUSTERS_OFFSET: usize = 0x2a;
const SECTORS_PER_TABLE_OFFSET: usize = 0x2c;
const TABLE_COUNT_OFFSET: usize = 0x2e;
const FIRST_FREE_OFFSET: usize = 0x30;
const ROOT_CLUSTER_OFFSET: usize = 0x32;
const ROOT_LENGTH_OFFSET: usize = 0x34;
const FIRST_SECTOR_OFFSET: usize = 0x38;
const PARK_CYLINDER_OFFSET: usize = 0x3c;

/// Decoded volume header. Geometry fields the engine never uses are kept
/// so that a flush writes them back untouched.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VolumeHeader {
    pub name: [u8; VOLUME_NAME_LEN],
    pub update_check: u32,
    pub interleave: u16,
    pub sectors_per_cluster: u16,
    pub sectors_per_track: u16,
    pub tracks_per_cylinder: u16,
    pub cylinders: u16,
    pub total_clusters: u16,
    pub free_clusters: u16,
    pub sectors_per_table: u16,
    pub table_count: u16,
    pub first_free: u16,
    pub root_cluster: u16,
    pub root_length: u32,
    pub first_sector: u32,
    pub park_cylinder: u16,
}

impl VolumeHeader {
    pub fn parse(buf: &[u8]) -> VfsResult<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(VfsError::UnsupportedFormat);
        }
        if buf[MAGIC_OFFSET..MAGIC_OFFSET + 4] != MAGIC {
            return Err(VfsError::UnsupportedFormat);
        }
        let mut name = [b' '; VOLUME_NAME_LEN];
        name.copy_from_slice(&buf[NAME_OFFSET..NAME_OFFSET + VOLUME_NAME_LEN]);
        let header = Self {
            name,
            update_check: read_u32(buf, UPDATE_CHECK_OFFSET),
            interleave: read_u16(buf, INTERLEAVE_OFFSET),
            sectors_per_cluster: read_u16(buf, SECTORS_PER_CLUSTER_OFFSET),
            sectors_per_track: read_u16(buf, SECTORS_PER_TRACK_OFFSET),
            tracks_per_cylinder: read_u16(buf, TRACKS_PER_CYLINDER_OFFSET),
            cylinders: read_u16(buf, CYLINDERS_OFFSET),
            total_clusters: read_u16(buf, TOTAL_CLUSTERS_OFFSET),
            free_clusters: read_u16(buf, FREE_CLUSTERS_OFFSET),
            sectors_per_table: read_u16(buf, SECTORS_PER_TABLE_OFFSET),
            table_count: read_u16(buf, TABLE_COUNT_OFFSET),
            first_free: read_u16(buf, FIRST_FREE_OFFSET),
            root_cluster: read_u16(buf, ROOT_CLUSTER_OFFSET),
            root_length: read_u32(buf, ROOT_LENGTH_OFFSET),
            first_sector: read_u32(buf, FIRST_SECTOR_OFFSET),
            park_cylinder: read_u16(buf, PARK_CYLINDER_OFFSET),
        };
        if header.sectors_per_cluster == 0
            || header.total_clusters == 0
            || header.sectors_per_table == 0
            || header.root_cluster >= header.total_clusters
            || header.first_free >= header.total_clusters
            || header.free_clusters >= header.total_clusters
        {
            return Err(VfsError::UnsupportedFormat);
        }
        Ok(header)
    }

    pub fn encode(&self, buf: &mut [u8]) {
        buf[..HEADER_SIZE].fill(0);
        buf[MAGIC_OFFSET..MAGIC_OFFSET + 4].copy_from_slice(&MAGIC);
        buf[NAME_OFFSET..NAME_OFFSET + VOLUME_NAME_LEN].copy_from_slice(&self.name);
        write_u32(buf, UPDATE_CHECK_OFFSET, self.update_check);
        write_u16(buf, INTERLEAVE_OFFSET, self.interleave);
        write_u16(buf, SECTORS_PER_CLUSTER_OFFSET, self.sectors_per_cluster);
        write_u16(buf, SECTORS_PER_TRACK_OFFSET, self.sectors_per_track);
        write_u16(buf, TRACKS_PER_CYLINDER_OFFSET, self.tracks_per_cylinder);
        write_u16(buf, CYLINDERS_OFFSET, self.cylinders);
        write_u16(buf, TOTAL_CLUSTERS_OFFSET, self.total_clusters);
        write_u16(buf, FREE_CLUSTERS_OFFSET, self.free_clusters);
        write_u16(buf, SECTORS_PER_TABLE_OFFSET, self.sectors_per_table);
        write_u16(buf, TABLE_COUNT_OFFSET, self.table_count);
        write_u16(buf, FIRST_FREE_OFFSET, self.first_free);
        write_u16(buf, ROOT_CLUSTER_OFFSET, self.root_cluster);
        write_u32(buf, ROOT_LENGTH_OFFSET, self.root_length);
        write_u32(buf, FIRST_SECTOR_OFFSET, self.first_sector);
        write_u16(buf, PARK_CYLINDER_OFFSET, self.park_cylinder);
    }

    pub fn cluster_size(&self) -> usize {
        self.sectors_per_cluster as usize * SECTOR_SIZE
    }

    /// Clusters the header plus table should occupy, per the header.
    pub fn table_clusters(&self) -> usize {
        let spc = self.sectors_per_cluster as usize;
        (self.sectors_per_table as usize + spc - 1) / spc
    }

    /// Sectors needed to hold the header and a table of `clusters` slots.
    pub fn sectors_for_table(clusters: usize) -> usize {
        let bytes = HEADER_SIZE + clusters * 2;
        (bytes + SECTOR_SIZE - 1) / SECTOR_SIZE
    }

    pub fn set_name(&mut self, name: &[u8]) -> VfsResult<()> {
        if name.len() > VOLUME_NAME_LEN {
            return Err(VfsError::InvalidParameter);
        }
        self.name = [b' '; VOLUME_NAME_LEN];
        self.name[..name.len()].copy_from_slice(name);
        Ok(())
    }
}

pub(crate) fn read_u16(buf: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([buf[offset], buf[offset + 1]])
}

pub(crate) fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    ])
}

pub(crate) fn write_u16(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
}

pub(crate) fn write_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
}
