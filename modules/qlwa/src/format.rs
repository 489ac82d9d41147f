use log::info;
use qlvfs::{FileType, VfsError, VfsResult, VOLUME_NAME_LEN};

use crate::block::BlockCache;
use crate::config::{FormatOptions, MAX_CLUSTERS, SECTOR_SIZE};
use crate::entry::{qdos_now, DirEntry, EntryName, ENTRY_SIZE};
use crate::fat::AllocationTable;
use crate::header::{VolumeHeader, HEADER_SIZE};

/// Lay down an empty volume: header and table in the clusters from 0, a
/// one-cluster root directory right after them, and every other cluster on
/// an ascending free list.
pub fn format_device(cache: &BlockCache, options: &FormatOptions<'_>) -> VfsResult<()> {
    if !cache.is_writable() {
        return Err(VfsError::ReadOnly);
    }
    let spc = options.sectors_per_cluster as usize;
    if spc == 0 || options.name.len() > VOLUME_NAME_LEN {
        return Err(VfsError::InvalidParameter);
    }
    let cluster_size = spc * SECTOR_SIZE;
    let clusters = match options.clusters {
        Some(count) => count as usize,
        None => ((cache.block_count() as usize) / spc).min(MAX_CLUSTERS),
    };
    let table_sectors = VolumeHeader::sectors_for_table(clusters);
    let table_clusters = (table_sectors + spc - 1) / spc;
    if clusters < table_clusters + 1 {
        return Err(VfsError::InsufficientSpace);
    }
    let blocks = (clusters * spc) as u64;
    if cache.block_count() < blocks {
        cache.resize(blocks)?;
    }

    let root_cluster = table_clusters as u16;
    let free_from = root_cluster as usize + 1;
    let mut slots = vec![0u16; clusters];
    for cluster in 0..table_clusters - 1 {
        slots[cluster] = cluster as u16 + 1;
    }
    for cluster in free_from..clusters.saturating_sub(1) {
        slots[cluster] = cluster as u16 + 1;
    }
    let free_count = clusters - free_from;
    let first_free = if free_count == 0 { 0 } else { free_from as u16 };
    let fat = AllocationTable::new(slots, first_free, free_count as u16);

    let mut header = VolumeHeader {
        name: [b' '; VOLUME_NAME_LEN],
        update_check: qdos_now(),
        interleave: 0,
        sectors_per_cluster: options.sectors_per_cluster,
        sectors_per_track: 0,
        tracks_per_cylinder: 0,
        cylinders: 0,
        total_clusters: clusters as u16,
        free_clusters: free_count as u16,
        sectors_per_table: table_sectors as u16,
        table_count: 1,
        first_free,
        root_cluster,
        root_length: ENTRY_SIZE as u32,
        first_sector: 0,
        park_cylinder: 0,
    };
    header.set_name(options.name)?;

    let mut region = vec![0u8; table_clusters * cluster_size];
    header.encode(&mut region);
    fat.encode(&mut region[HEADER_SIZE..]);
    cache.write_bytes(0, &region)?;

    let mut root = vec![0u8; cluster_size];
    root_header().encode(&mut root);
    cache.write_bytes(root_cluster as u64 * cluster_size as u64, &root)?;
    cache.flush()?;
    info!(
        "formatted volume {:?}: {clusters} clusters of {cluster_size} bytes",
        String::from_utf8_lossy(options.name)
    );
    Ok(())
}

/// Entry 0 of a directory: its own header, never scanned as a child.
pub(crate) fn root_header() -> DirEntry {
    DirEntry {
        length: ENTRY_SIZE as u32,
        access: 0,
        file_type: FileType::Directory,
        info: [0; 8],
        name: EntryName::new(),
        update_date: qdos_now(),
        version: 0,
        first_cluster: 0,
        backup_date: 0,
    }
}
