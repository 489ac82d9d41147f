pub const SECTOR_SIZE: usize = 512;
pub const DEFAULT_SECTORS_PER_CLUSTER: u16 = 4;
pub const MAX_CLUSTERS: usize = 0xffff;
pub const MAX_CHANNELS: usize = 128;
pub const MAX_DRIVES: usize = 8;

/// Seconds from the guest epoch (1961-01-01) to the Unix epoch.
pub const QDOS_EPOCH_OFFSET: u64 = 283_996_800;

/// What to do when the table length recorded in the header disagrees with
/// the table's own cluster chain.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RepairPolicy {
    /// Refuse to mount.
    #[default]
    Reject,
    /// Assume a contiguous table from cluster 0 and mount anyway.
    AcceptNonStandard,
}

/// What to do when the advisory lock on the backing store is held elsewhere.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LockPolicy {
    #[default]
    Fail,
    /// Continue, but refuse every mutation.
    ReadOnly,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MountOptions {
    pub read_only: bool,
    pub repair: RepairPolicy,
    pub lock: LockPolicy,
}

impl MountOptions {
    pub fn read_only() -> Self {
        Self {
            read_only: true,
            ..Self::default()
        }
    }

    pub fn with_repair(mut self, repair: RepairPolicy) -> Self {
        self.repair = repair;
        self
    }

    pub fn with_lock(mut self, lock: LockPolicy) -> Self {
        self.lock = lock;
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FormatOptions<'a> {
    pub name: &'a [u8],
    pub sectors_per_cluster: u16,
    /// Cluster count; `None` sizes the volume to the device.
    pub clusters: Option<u16>,
}

impl<'a> FormatOptions<'a> {
    pub fn new(name: &'a [u8]) -> Self {
        Self {
            name,
            sectors_per_cluster: DEFAULT_SECTORS_PER_CLUSTER,
            clusters: None,
        }
    }

    pub fn sectors_per_cluster(mut self, sectors: u16) -> Self {
        self.sectors_per_cluster = sectors;
        self
    }

    pub fn clusters(mut self, clusters: u16) -> Self {
        self.clusters = Some(clusters);
        self
    }
}
