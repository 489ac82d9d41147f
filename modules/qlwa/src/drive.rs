use log::{debug, info, warn};
use qlvfs::{FreeSpace, VfsError, VfsResult, VolumeInfo};

use crate::block::{BlockCache, BlockDevice};
use crate::config::{MountOptions, RepairPolicy, SECTOR_SIZE};
use crate::fat::{AllocationTable, SLOT_SIZE};
use crate::header::{read_u16, VolumeHeader, HEADER_SIZE};

pub struct Drive {
    cache: BlockCache,
    header: VolumeHeader,
    fat: AllocationTable,
    /// Clusters holding the header and table, starting at cluster 0.
    table_chain: Vec<u16>,
    read_only: bool,
    repair: RepairPolicy,
}

struct Loaded {
    header: VolumeHeader,
    fat: AllocationTable,
    table_chain: Vec<u16>,
}

impl Drive {
    pub fn open(device: Box<dyn BlockDevice>, options: &MountOptions) -> VfsResult<Self> {
        Self::with_cache(BlockCache::new(device), options)
    }

    pub fn with_cache(cache: BlockCache, options: &MountOptions) -> VfsResult<Self> {
        if cache.block_size() != SECTOR_SIZE {
            return Err(VfsError::UnsupportedFormat);
        }
        let loaded = load(&cache, options.repair)?;
        let read_only = options.read_only || !cache.is_writable();
        info!(
            "mounted volume {:?}: {} clusters of {} bytes, {} free{}",
            String::from_utf8_lossy(&loaded.header.name).trim_end(),
            loaded.header.total_clusters,
            loaded.header.cluster_size(),
            loaded.header.free_clusters,
            if read_only { ", read only" } else { "" }
        );
        Ok(Self {
            cache,
            header: loaded.header,
            fat: loaded.fat,
            table_chain: loaded.table_chain,
            read_only,
            repair: options.repair,
        })
    }

    /// Re-read header and table from the backing store, dropping any
    /// unflushed allocation state.
    pub fn reload(&mut self) -> VfsResult<()> {
        let loaded = load(&self.cache, self.repair)?;
        self.header = loaded.header;
        self.fat = loaded.fat;
        self.table_chain = loaded.table_chain;
        Ok(())
    }

    pub fn cache(&self) -> &BlockCache {
        &self.cache
    }

    pub fn header(&self) -> &VolumeHeader {
        &self.header
    }

    pub fn fat(&self) -> &AllocationTable {
        &self.fat
    }

    pub fn cluster_size(&self) -> usize {
        self.header.cluster_size()
    }

    pub fn read_only(&self) -> bool {
        self.read_only
    }

    pub fn ensure_writable(&self) -> VfsResult<()> {
        if self.read_only {
            Err(VfsError::ReadOnly)
        } else {
            Ok(())
        }
    }

    pub fn free_count(&self) -> usize {
        self.fat.free_count() as usize
    }

    pub fn clusters_for(&self, bytes: usize) -> usize {
        let cluster_size = self.cluster_size();
        ((bytes + cluster_size - 1) / cluster_size).max(1)
    }

    pub fn allocate(&mut self, count: usize) -> VfsResult<Vec<u16>> {
        self.ensure_writable()?;
        self.fat.allocate(count)
    }

    pub fn extend(&mut self, chain: &mut Vec<u16>, count: usize) -> VfsResult<()> {
        self.ensure_writable()?;
        self.fat.extend(chain, count)
    }

    /// Return a chain to the free list. Only the in-memory table changes;
    /// the caller flushes.
    pub fn release(&mut self, first: u16) -> VfsResult<usize> {
        self.ensure_writable()?;
        self.fat.release(first)
    }

    pub fn shorten(&mut self, chain: &mut Vec<u16>, keep: usize) -> VfsResult<()> {
        self.ensure_writable()?;
        self.fat.shorten(chain, keep)
    }

    pub fn set_root_length(&mut self, length: u32) {
        self.header.root_length = length;
    }

    pub fn flush(&mut self) -> VfsResult<()> {
        self.ensure_writable()?;
        self.header.free_clusters = self.fat.free_count();
        self.header.first_free = self.fat.first_free();
        let mut region = vec![0u8; self.table_chain.len() * self.cluster_size()];
        self.header.encode(&mut region);
        self.fat.encode(&mut region[HEADER_SIZE..]);
        let length = region.len();
        self.write_chain(&self.table_chain, &region, length)?;
        debug!(
            "flushed table: {} free, first free {}",
            self.header.free_clusters, self.header.first_free
        );
        Ok(())
    }

    pub fn sync(&self) -> VfsResult<()> {
        if self.read_only {
            return Ok(());
        }
        self.cache.flush()
    }

    fn cluster_offset(&self, cluster: u16) -> u64 {
        cluster as u64 * self.cluster_size() as u64
    }

    /// Read the clusters of `chain` into a buffer sized to the whole chain.
    /// Bytes past `length` are zero.
    pub fn read_chain(&self, chain: &[u16], length: usize) -> VfsResult<Vec<u8>> {
        let cluster_size = self.cluster_size();
        let capacity = chain.len() * cluster_size;
        if length > capacity {
            return Err(VfsError::CorruptVolume);
        }
        let mut buf = Vec::new();
        buf.try_reserve_exact(capacity)
            .map_err(|_| VfsError::OutOfMemory)?;
        buf.resize(capacity, 0);
        let used = (length + cluster_size - 1) / cluster_size;
        for (idx, cluster) in chain.iter().take(used).enumerate() {
            let start = idx * cluster_size;
            self.cache
                .read_bytes(self.cluster_offset(*cluster), &mut buf[start..start + cluster_size])?;
        }
        buf[length..].fill(0);
        Ok(buf)
    }

    /// Write the first `length` bytes of `buf` over the clusters of `chain`.
    pub fn write_chain(&self, chain: &[u16], buf: &[u8], length: usize) -> VfsResult<()> {
        self.ensure_writable()?;
        let cluster_size = self.cluster_size();
        if length > chain.len() * cluster_size || length > buf.len() {
            return Err(VfsError::InvalidParameter);
        }
        let mut done = 0usize;
        for cluster in chain {
            if done >= length {
                break;
            }
            let chunk = core::cmp::min(cluster_size, length - done);
            self.cache
                .write_bytes(self.cluster_offset(*cluster), &buf[done..done + chunk])?;
            done += chunk;
        }
        Ok(())
    }

    pub fn sector_count(&self) -> u64 {
        let sectors = self.header.total_clusters as u64 * self.header.sectors_per_cluster as u64;
        sectors.min(self.cache.block_count())
    }

    pub fn free_space(&self) -> FreeSpace {
        FreeSpace {
            free_clusters: self.fat.free_count() as u32,
            total_clusters: self.header.total_clusters as u32,
            cluster_size: self.cluster_size() as u32,
        }
    }

    pub fn info(&self) -> VolumeInfo {
        VolumeInfo {
            name: self.header.name,
            sector_size: SECTOR_SIZE as u16,
            sectors_per_cluster: self.header.sectors_per_cluster,
            total_clusters: self.header.total_clusters as u32,
            free_clusters: self.fat.free_count() as u32,
            read_only: self.read_only,
        }
    }
}

fn load(cache: &BlockCache, repair: RepairPolicy) -> VfsResult<Loaded> {
    let mut first = vec![0u8; SECTOR_SIZE];
    cache.read_block(0, &mut first)?;
    let header = VolumeHeader::parse(&first)?;
    let cluster_size = header.cluster_size();
    let total = header.total_clusters as usize;
    let needed = HEADER_SIZE + total * SLOT_SIZE;
    let expected = header.table_clusters();

    let read_cluster = |cluster: u16, region: &mut Vec<u8>| -> VfsResult<()> {
        let start = region.len();
        region.resize(start + cluster_size, 0);
        cache.read_bytes(cluster as u64 * cluster_size as u64, &mut region[start..])
    };

    // The table describes its own chain, so follow it one cluster at a time.
    let mut region = Vec::new();
    let mut table_chain = vec![0u16];
    read_cluster(0, &mut region)?;
    let mut consistent = true;
    loop {
        let last = *table_chain.last().unwrap_or(&0) as usize;
        let offset = HEADER_SIZE + last * SLOT_SIZE;
        if offset + SLOT_SIZE > region.len() {
            consistent = false;
            break;
        }
        let next = read_u16(&region, offset);
        if next == 0 {
            break;
        }
        if next as usize >= total || table_chain.contains(&next) {
            consistent = false;
            break;
        }
        table_chain.push(next);
        read_cluster(next, &mut region)?;
    }
    if !consistent || table_chain.len() != expected || region.len() < needed {
        warn!(
            "table chain of {} clusters disagrees with header ({} sectors, {} clusters)",
            table_chain.len(),
            header.sectors_per_table,
            expected
        );
        if repair != RepairPolicy::AcceptNonStandard {
            return Err(VfsError::UnsupportedFormat);
        }
        warn!("mounting non-standard volume with a contiguous table at cluster 0");
        table_chain = (0..expected as u16).collect();
        region.clear();
        for cluster in table_chain.clone() {
            read_cluster(cluster, &mut region)?;
        }
        if region.len() < needed {
            return Err(VfsError::UnsupportedFormat);
        }
    }

    let fat = AllocationTable::decode(
        &region[HEADER_SIZE..],
        total,
        header.first_free,
        header.free_clusters,
    )?;
    fat.check()?;
    Ok(Loaded {
        header,
        fat,
        table_chain,
    })
}
