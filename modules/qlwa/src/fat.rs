use log::debug;
use qlvfs::{VfsError, VfsResult};

use crate::header::{read_u16, write_u16};

pub const SLOT_SIZE: usize = 2;

pub struct AllocationTable {
    slots: Vec<u16>,
    first_free: u16,
    free_count: u16,
}

impl AllocationTable {
    pub fn new(slots: Vec<u16>, first_free: u16, free_count: u16) -> Self {
        Self {
            slots,
            first_free,
            free_count,
        }
    }

    pub fn decode(buf: &[u8], clusters: usize, first_free: u16, free_count: u16) -> VfsResult<Self> {
        if buf.len() < clusters * SLOT_SIZE {
            return Err(VfsError::CorruptVolume);
        }
        let slots = (0..clusters)
            .map(|idx| read_u16(buf, idx * SLOT_SIZE))
            .collect();
        Ok(Self::new(slots, first_free, free_count))
    }

    pub fn encode(&self, buf: &mut [u8]) {
        for (idx, slot) in self.slots.iter().enumerate() {
            write_u16(buf, idx * SLOT_SIZE, *slot);
        }
    }

    pub fn clusters(&self) -> usize {
        self.slots.len()
    }

    pub fn first_free(&self) -> u16 {
        self.first_free
    }

    pub fn free_count(&self) -> u16 {
        self.free_count
    }

    /// Walk the chain starting at `first`. Any cluster out of range or seen
    /// twice means the table is damaged.
    pub fn chain(&self, first: u16) -> VfsResult<Vec<u16>> {
        let mut seen = vec![false; self.slots.len()];
        let mut chain = Vec::new();
        let mut current = first;
        loop {
            let idx = current as usize;
            if idx >= self.slots.len() || seen[idx] {
                return Err(VfsError::CorruptVolume);
            }
            seen[idx] = true;
            chain.push(current);
            current = self.slots[idx];
            if current == 0 {
                return Ok(chain);
            }
        }
    }

    /// Chain of a file or directory. Cluster 0 always belongs to the table,
    /// so no file can start there.
    pub fn file_chain(&self, first: u16) -> VfsResult<Vec<u16>> {
        if first == 0 || first as usize >= self.slots.len() {
            return Err(VfsError::NotFound);
        }
        self.chain(first)
    }

    pub fn free_list(&self) -> VfsResult<Vec<u16>> {
        if self.first_free == 0 {
            return Ok(Vec::new());
        }
        self.chain(self.first_free)
    }

    pub fn check(&self) -> VfsResult<()> {
        let free = self.free_list()?;
        if free.len() != self.free_count as usize {
            debug!(
                "free count {} disagrees with free list of {}",
                self.free_count,
                free.len()
            );
            return Err(VfsError::CorruptVolume);
        }
        Ok(())
    }

    /// Take `count` clusters off the head of the free list and link them into
    /// a new chain. Nothing changes if there is not enough room.
    pub fn allocate(&mut self, count: usize) -> VfsResult<Vec<u16>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        if count > self.free_count as usize {
            return Err(VfsError::InsufficientSpace);
        }
        let mut taken = Vec::with_capacity(count);
        let mut current = self.first_free;
        for _ in 0..count {
            if current == 0 || current as usize >= self.slots.len() {
                return Err(VfsError::CorruptVolume);
            }
            taken.push(current);
            current = self.slots[current as usize];
        }
        for pair in taken.windows(2) {
            self.slots[pair[0] as usize] = pair[1];
        }
        if let Some(last) = taken.last() {
            self.slots[*last as usize] = 0;
        }
        self.first_free = current;
        self.free_count -= count as u16;
        debug!("allocated {count} clusters from {}", taken[0]);
        Ok(taken)
    }

    pub fn extend(&mut self, chain: &mut Vec<u16>, count: usize) -> VfsResult<()> {
        let fresh = self.allocate(count)?;
        if let (Some(last), Some(first)) = (chain.last(), fresh.first()) {
            self.slots[*last as usize] = *first;
        }
        chain.extend_from_slice(&fresh);
        Ok(())
    }

    /// Return every cluster of the chain starting at `first` to the free list,
    /// keeping it sorted. Returns the number of clusters freed.
    pub fn release(&mut self, first: u16) -> VfsResult<usize> {
        let mut freed = self.chain(first)?;
        freed.sort_unstable();
        let existing = self.free_list()?;
        let mut merged = Vec::with_capacity(existing.len() + freed.len());
        let (mut a, mut b) = (0usize, 0usize);
        while a < existing.len() || b < freed.len() {
            let take_existing = match (existing.get(a), freed.get(b)) {
                (Some(x), Some(y)) if x == y => return Err(VfsError::CorruptVolume),
                (Some(x), Some(y)) => x < y,
                (Some(_), None) => true,
                _ => false,
            };
            if take_existing {
                merged.push(existing[a]);
                a += 1;
            } else {
                merged.push(freed[b]);
                b += 1;
            }
        }
        for pair in merged.windows(2) {
            self.slots[pair[0] as usize] = pair[1];
        }
        if let Some(last) = merged.last() {
            self.slots[*last as usize] = 0;
        }
        self.first_free = merged.first().copied().unwrap_or(0);
        self.free_count = merged.len() as u16;
        debug!("freed {} clusters from {first}", freed.len());
        Ok(freed.len())
    }

    /// Cut `chain` down to its first `keep` clusters (at least one) and free
    /// the rest.
    pub fn shorten(&mut self, chain: &mut Vec<u16>, keep: usize) -> VfsResult<()> {
        let keep = keep.max(1);
        if keep >= chain.len() {
            return Ok(());
        }
        let tail = chain[keep];
        self.slots[chain[keep - 1] as usize] = 0;
        self.release(tail)?;
        chain.truncate(keep);
        Ok(())
    }
}
