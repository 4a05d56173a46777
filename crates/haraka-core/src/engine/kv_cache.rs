//! Paged KV-cache block management.
//!
//! Physical blocks are an arena of integer ids per pool (GPU, CPU) with
//! explicit reference counts. Sequences never hold owning handles to
//! blocks; they are mapped through per-sequence block tables kept here.
//! Forking a sequence bumps refcounts, writing into a shared block emits a
//! copy-on-write directive, and a block returns to its free list exactly
//! when its refcount reaches zero.

use std::collections::{HashMap, VecDeque};

use tracing::debug;

use super::sequence::{Sequence, SequenceGroup, SequenceStatus};
use super::types::{BlockId, SeqId};
use crate::error::{Error, Result};

/// Pool a physical block lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Device {
    Gpu,
    Cpu,
}

/// Whether a group's prompt can be admitted right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocStatus {
    /// Fits in the current free space.
    Ok,
    /// Does not fit now, but can once other sequences release blocks.
    Later,
    /// Can never fit; the prompt exceeds the whole pool.
    Never,
}

/// Free-list allocator over one pool of physical blocks.
struct BlockAllocator {
    device: Device,
    num_blocks: usize,
    free_list: VecDeque<BlockId>,
    ref_counts: Vec<u32>,
}

impl BlockAllocator {
    fn new(device: Device, num_blocks: usize) -> Self {
        Self {
            device,
            num_blocks,
            free_list: (0..num_blocks).collect(),
            ref_counts: vec![0; num_blocks],
        }
    }

    fn allocate(&mut self) -> Result<BlockId> {
        let block = self.free_list.pop_front().ok_or_else(|| {
            Error::BlockManager(format!("{:?} block pool exhausted", self.device))
        })?;
        self.ref_counts[block] = 1;
        Ok(block)
    }

    fn incref(&mut self, block: BlockId) -> Result<()> {
        if self.ref_counts[block] == 0 {
            return Err(Error::BlockManager(format!(
                "refcount increment on free {:?} block {}",
                self.device, block
            )));
        }
        self.ref_counts[block] += 1;
        Ok(())
    }

    fn free(&mut self, block: BlockId) -> Result<()> {
        if self.ref_counts[block] == 0 {
            return Err(Error::BlockManager(format!(
                "double free of {:?} block {}",
                self.device, block
            )));
        }
        self.ref_counts[block] -= 1;
        if self.ref_counts[block] == 0 {
            self.free_list.push_back(block);
        }
        Ok(())
    }

    fn ref_count(&self, block: BlockId) -> u32 {
        self.ref_counts[block]
    }

    fn num_free(&self) -> usize {
        self.free_list.len()
    }

    /// Referenced blocks plus the free list must cover the pool exactly.
    fn check_integrity(&self) -> Result<()> {
        let referenced = self.ref_counts.iter().filter(|c| **c > 0).count();
        if referenced + self.free_list.len() != self.num_blocks {
            return Err(Error::BlockManager(format!(
                "{:?} pool accounting broken: {} referenced + {} free != {}",
                self.device,
                referenced,
                self.free_list.len(),
                self.num_blocks
            )));
        }
        if self.free_list.iter().any(|b| self.ref_counts[*b] > 0) {
            return Err(Error::BlockManager(format!(
                "{:?} pool has a referenced block on the free list",
                self.device
            )));
        }
        Ok(())
    }
}

/// Per-sequence mapping from logical slots to physical blocks.
///
/// A table lives wholly in one pool; swapping moves the entire table.
#[derive(Debug, Clone)]
struct BlockTable {
    device: Device,
    blocks: Vec<BlockId>,
}

/// KV cache manager over the GPU and CPU block pools.
pub struct KVCacheManager {
    block_size: usize,
    num_gpu_blocks: usize,
    watermark_blocks: usize,
    gpu: BlockAllocator,
    cpu: BlockAllocator,
    tables: HashMap<SeqId, BlockTable>,
}

impl KVCacheManager {
    /// GPU headroom held back from prompt admission so running sequences
    /// can keep appending slots.
    const WATERMARK: f32 = 0.01;

    pub fn new(block_size: usize, num_gpu_blocks: usize, num_cpu_blocks: usize) -> Self {
        let watermark_blocks = (Self::WATERMARK * num_gpu_blocks as f32) as usize;
        Self {
            block_size,
            num_gpu_blocks,
            watermark_blocks,
            gpu: BlockAllocator::new(Device::Gpu, num_gpu_blocks),
            cpu: BlockAllocator::new(Device::Cpu, num_cpu_blocks),
            tables: HashMap::new(),
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Can this group's prompt be allocated on the GPU?
    pub fn can_allocate(&self, group: &SequenceGroup) -> AllocStatus {
        // All member sequences share the prompt at admission time.
        let required = match group.get_seqs(None).first() {
            Some(seq) => seq.num_logical_blocks(),
            None => return AllocStatus::Ok,
        };
        if required > self.num_gpu_blocks {
            AllocStatus::Never
        } else if self.gpu.num_free() >= required + self.watermark_blocks {
            AllocStatus::Ok
        } else {
            AllocStatus::Later
        }
    }

    /// Assign fresh GPU blocks to every logical slot of the group's
    /// sequences. The sequences share one table; each shared block carries
    /// one reference per member.
    pub fn allocate(&mut self, group: &SequenceGroup) -> Result<()> {
        let seqs = group.get_seqs(None);
        let Some(first) = seqs.first() else {
            return Ok(());
        };

        let mut blocks = Vec::with_capacity(first.num_logical_blocks());
        for _ in 0..first.num_logical_blocks() {
            let block = self.gpu.allocate()?;
            for _ in 1..seqs.len() {
                self.gpu.incref(block)?;
            }
            blocks.push(block);
        }
        debug!(
            request_id = %group.request_id,
            num_blocks = blocks.len(),
            "allocated prompt blocks"
        );
        for seq in seqs {
            self.tables.insert(
                seq.seq_id,
                BlockTable {
                    device: Device::Gpu,
                    blocks: blocks.clone(),
                },
            );
        }
        Ok(())
    }

    /// Conservative check that each running sequence in the group could
    /// claim one more block this step.
    pub fn can_append_slot(&self, group: &SequenceGroup) -> bool {
        let num_running = group.num_seqs(Some(SequenceStatus::Running));
        self.gpu.num_free() >= num_running
    }

    /// Extend a sequence by one token's slot.
    ///
    /// Returns a `(src, dst)` copy-on-write pair when the write would land
    /// in a block shared with a forked sibling.
    pub fn append_slot(&mut self, seq: &Sequence) -> Result<Option<(BlockId, BlockId)>> {
        let num_logical = seq.num_logical_blocks();
        let table = self.tables.get_mut(&seq.seq_id).ok_or_else(|| {
            Error::BlockManager(format!("append_slot on unmapped seq {}", seq.seq_id))
        })?;
        if table.device != Device::Gpu {
            return Err(Error::BlockManager(format!(
                "append_slot on swapped seq {}",
                seq.seq_id
            )));
        }

        if num_logical > table.blocks.len() {
            // The appended token starts a new logical block.
            debug_assert_eq!(num_logical, table.blocks.len() + 1);
            let block = self.gpu.allocate()?;
            table.blocks.push(block);
            return Ok(None);
        }

        let last = *table.blocks.last().ok_or_else(|| {
            Error::BlockManager(format!("append_slot on empty table for seq {}", seq.seq_id))
        })?;
        if self.gpu.ref_count(last) == 1 {
            // Not shared; write in place.
            Ok(None)
        } else {
            // The last block is shared with a fork: copy it, then write.
            let new_block = self.gpu.allocate()?;
            self.gpu.free(last)?;
            *table.blocks.last_mut().expect("checked above") = new_block;
            Ok(Some((last, new_block)))
        }
    }

    /// Register a fork: the child's table is a by-reference copy of the
    /// parent's. Must run before any free touching the shared blocks.
    pub fn fork(&mut self, parent: SeqId, child: SeqId) -> Result<()> {
        let table = self
            .tables
            .get(&parent)
            .ok_or_else(|| Error::BlockManager(format!("fork of unmapped seq {parent}")))?
            .clone();
        let allocator = match table.device {
            Device::Gpu => &mut self.gpu,
            Device::Cpu => &mut self.cpu,
        };
        for block in &table.blocks {
            allocator.incref(*block)?;
        }
        debug_assert!(!self.tables.contains_key(&child));
        self.tables.insert(child, table);
        Ok(())
    }

    /// Release a sequence's blocks. No-op for sequences that were never
    /// allocated or are already freed.
    pub fn free(&mut self, seq_id: SeqId) -> Result<()> {
        let Some(table) = self.tables.remove(&seq_id) else {
            return Ok(());
        };
        let allocator = match table.device {
            Device::Gpu => &mut self.gpu,
            Device::Cpu => &mut self.cpu,
        };
        for block in &table.blocks {
            allocator.free(*block)?;
        }
        debug!(seq_id, num_blocks = table.blocks.len(), "freed blocks");
        Ok(())
    }

    pub fn can_swap_out(&self, group: &SequenceGroup) -> bool {
        self.blocks_in_use(group, SequenceStatus::Running) <= self.cpu.num_free()
    }

    /// Move every running sequence of the group to the CPU pool.
    ///
    /// Returns the GPU-to-CPU block mapping the workers must apply.
    pub fn swap_out(&mut self, group: &SequenceGroup) -> Result<HashMap<BlockId, BlockId>> {
        let mut mapping: HashMap<BlockId, BlockId> = HashMap::new();
        for seq in group.get_seqs(Some(SequenceStatus::Running)) {
            self.swap_table(seq.seq_id, Device::Gpu, Device::Cpu, &mut mapping)?;
        }
        Ok(mapping)
    }

    pub fn can_swap_in(&self, group: &SequenceGroup) -> bool {
        // One extra block per sequence so the next decode can append.
        let required = self.blocks_in_use(group, SequenceStatus::Swapped)
            + group.num_seqs(Some(SequenceStatus::Swapped));
        self.gpu.num_free() >= required + self.watermark_blocks
    }

    /// Move every swapped sequence of the group back to the GPU pool.
    pub fn swap_in(&mut self, group: &SequenceGroup) -> Result<HashMap<BlockId, BlockId>> {
        let mut mapping: HashMap<BlockId, BlockId> = HashMap::new();
        for seq in group.get_seqs(Some(SequenceStatus::Swapped)) {
            self.swap_table(seq.seq_id, Device::Cpu, Device::Gpu, &mut mapping)?;
        }
        Ok(mapping)
    }

    fn swap_table(
        &mut self,
        seq_id: SeqId,
        from: Device,
        to: Device,
        mapping: &mut HashMap<BlockId, BlockId>,
    ) -> Result<()> {
        let table = self
            .tables
            .get(&seq_id)
            .ok_or_else(|| Error::BlockManager(format!("swap of unmapped seq {seq_id}")))?
            .clone();
        if table.device != from {
            return Err(Error::BlockManager(format!(
                "seq {seq_id} is not resident in {from:?}"
            )));
        }

        let mut new_blocks = Vec::with_capacity(table.blocks.len());
        for src in &table.blocks {
            let dst = match mapping.get(src) {
                // Shared across the group's forks: reuse the moved block.
                Some(dst) => {
                    let dst = *dst;
                    self.allocator_mut(to).incref(dst)?;
                    dst
                }
                None => {
                    let dst = self.allocator_mut(to).allocate()?;
                    mapping.insert(*src, dst);
                    dst
                }
            };
            new_blocks.push(dst);
            self.allocator_mut(from).free(*src)?;
        }
        self.tables.insert(
            seq_id,
            BlockTable {
                device: to,
                blocks: new_blocks,
            },
        );
        Ok(())
    }

    fn allocator_mut(&mut self, device: Device) -> &mut BlockAllocator {
        match device {
            Device::Gpu => &mut self.gpu,
            Device::Cpu => &mut self.cpu,
        }
    }

    fn blocks_in_use(&self, group: &SequenceGroup, status: SequenceStatus) -> usize {
        group
            .get_seqs(Some(status))
            .iter()
            .filter_map(|seq| self.tables.get(&seq.seq_id))
            .map(|table| table.blocks.len())
            .sum()
    }

    pub fn get_block_table(&self, seq_id: SeqId) -> Option<&[BlockId]> {
        self.tables.get(&seq_id).map(|t| t.blocks.as_slice())
    }

    pub fn get_num_free_gpu_blocks(&self) -> usize {
        self.gpu.num_free()
    }

    pub fn get_num_free_cpu_blocks(&self) -> usize {
        self.cpu.num_free()
    }

    /// Refcount of a mapped block, for tests and assertions.
    pub fn block_ref_count(&self, device: Device, block: BlockId) -> u32 {
        match device {
            Device::Gpu => self.gpu.ref_count(block),
            Device::Cpu => self.cpu.ref_count(block),
        }
    }

    /// Full accounting check: every block is either free or referenced,
    /// never both, in each pool. Cheap enough to run after every step in
    /// debug builds.
    pub fn check_integrity(&self) -> Result<()> {
        self.gpu.check_integrity()?;
        self.cpu.check_integrity()?;
        for (seq_id, table) in &self.tables {
            let allocator = match table.device {
                Device::Gpu => &self.gpu,
                Device::Cpu => &self.cpu,
            };
            if table.blocks.iter().any(|b| allocator.ref_count(*b) == 0) {
                return Err(Error::BlockManager(format!(
                    "seq {seq_id} maps a free block"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap as StdHashMap;
    use std::time::{Instant, SystemTime};

    use super::*;
    use crate::engine::sampling::SamplingParams;
    use crate::engine::sequence::Sequence;

    const BLOCK_SIZE: usize = 4;

    fn group_with_prompt(prompt_len: usize) -> SequenceGroup {
        let seq = Sequence::new(0, None, vec![1; prompt_len], BLOCK_SIZE, Instant::now());
        SequenceGroup::new(
            "r0".to_string(),
            vec![seq],
            SamplingParams::default(),
            SystemTime::now(),
            Instant::now(),
        )
    }

    fn running(group: &mut SequenceGroup) {
        for seq in group.seqs_mut() {
            seq.set_status(SequenceStatus::Running);
        }
    }

    #[test]
    fn allocate_and_free_restores_pool() {
        let mut manager = KVCacheManager::new(BLOCK_SIZE, 16, 16);
        let group = group_with_prompt(10);

        assert_eq!(manager.can_allocate(&group), AllocStatus::Ok);
        manager.allocate(&group).unwrap();
        assert_eq!(manager.get_num_free_gpu_blocks(), 13);
        manager.check_integrity().unwrap();

        manager.free(0).unwrap();
        assert_eq!(manager.get_num_free_gpu_blocks(), 16);
        manager.check_integrity().unwrap();

        // Freeing again is a no-op, not a double free.
        manager.free(0).unwrap();
        assert_eq!(manager.get_num_free_gpu_blocks(), 16);
    }

    #[test]
    fn can_allocate_later_and_never() {
        let manager = KVCacheManager::new(BLOCK_SIZE, 4, 0);
        // 5 blocks of prompt in a 4-block pool can never fit.
        assert_eq!(manager.can_allocate(&group_with_prompt(17)), AllocStatus::Never);

        let mut manager = KVCacheManager::new(BLOCK_SIZE, 8, 0);
        manager.allocate(&group_with_prompt(24)).unwrap();
        // Fits the pool, but not the current free space.
        let second = {
            let seq = Sequence::new(1, None, vec![1; 16], BLOCK_SIZE, Instant::now());
            SequenceGroup::new(
                "r1".to_string(),
                vec![seq],
                SamplingParams::default(),
                SystemTime::now(),
                Instant::now(),
            )
        };
        assert_eq!(manager.can_allocate(&second), AllocStatus::Later);
    }

    #[test]
    fn fork_free_symmetry() {
        let mut manager = KVCacheManager::new(BLOCK_SIZE, 16, 16);
        let group = group_with_prompt(8);
        manager.allocate(&group).unwrap();
        let free_after_alloc = manager.get_num_free_gpu_blocks();

        manager.fork(0, 1).unwrap();
        assert_eq!(manager.get_num_free_gpu_blocks(), free_after_alloc);
        assert_eq!(manager.block_ref_count(Device::Gpu, manager.get_block_table(0).unwrap()[0]), 2);

        manager.free(1).unwrap();
        manager.free(0).unwrap();
        let via_fork = manager.get_num_free_gpu_blocks();

        // Same end state as never forking at all.
        let mut plain = KVCacheManager::new(BLOCK_SIZE, 16, 16);
        plain.allocate(&group_with_prompt(8)).unwrap();
        plain.free(0).unwrap();
        assert_eq!(via_fork, plain.get_num_free_gpu_blocks());
    }

    #[test]
    fn append_slot_grows_table_on_block_boundary() {
        let mut manager = KVCacheManager::new(BLOCK_SIZE, 16, 0);
        let mut group = group_with_prompt(4);
        manager.allocate(&group).unwrap();
        running(&mut group);

        // 5th token crosses into a second logical block.
        group.seqs_mut()[0].append_token_id(7, StdHashMap::new(), None, 4);
        group.seqs_mut()[0].append_token_id(8, StdHashMap::new(), None, 0);
        let seq = &group.get_seqs(None)[0];
        assert_eq!(seq.num_logical_blocks(), 2);

        let cow = manager.append_slot(seq).unwrap();
        assert!(cow.is_none());
        assert_eq!(manager.get_block_table(0).unwrap().len(), 2);
    }

    #[test]
    fn append_slot_emits_cow_on_shared_block() {
        let mut manager = KVCacheManager::new(BLOCK_SIZE, 16, 0);
        // 6-token prompt: blocks [0, 1], the last one partially filled.
        let mut group = group_with_prompt(6);
        manager.allocate(&group).unwrap();
        running(&mut group);

        let child = group.get(0).unwrap().fork(1);
        group.add(child);
        manager.fork(0, 1).unwrap();
        assert_eq!(manager.block_ref_count(Device::Gpu, 1), 2);

        // The parent's next token lands in the shared partial block, so the
        // worker must copy it before writing.
        group.seqs_mut()[0].append_token_id(7, StdHashMap::new(), None, 6);
        let cow = manager.append_slot(group.get(0).unwrap()).unwrap();
        let (src, dst) = cow.expect("shared last block must trigger copy-on-write");
        assert_eq!(src, 1);
        assert_ne!(src, dst);
        assert_eq!(manager.block_ref_count(Device::Gpu, src), 1);
        assert_eq!(manager.block_ref_count(Device::Gpu, dst), 1);
        assert_ne!(
            manager.get_block_table(0).unwrap(),
            manager.get_block_table(1).unwrap()
        );
        manager.check_integrity().unwrap();
    }

    #[test]
    fn swap_out_and_in_round_trip() {
        let mut manager = KVCacheManager::new(BLOCK_SIZE, 16, 16);
        let mut group = group_with_prompt(8);
        manager.allocate(&group).unwrap();
        running(&mut group);

        assert!(manager.can_swap_out(&group));
        let mapping = manager.swap_out(&group).unwrap();
        assert_eq!(mapping.len(), 2);
        assert_eq!(manager.get_num_free_gpu_blocks(), 16);
        assert_eq!(manager.get_num_free_cpu_blocks(), 14);
        manager.check_integrity().unwrap();

        for seq in group.seqs_mut() {
            seq.set_status(SequenceStatus::Swapped);
        }
        assert!(manager.can_swap_in(&group));
        let mapping = manager.swap_in(&group).unwrap();
        assert_eq!(mapping.len(), 2);
        assert_eq!(manager.get_num_free_cpu_blocks(), 16);
        assert_eq!(manager.get_num_free_gpu_blocks(), 14);
        manager.check_integrity().unwrap();
    }

    #[test]
    fn double_free_is_fatal() {
        let mut allocator = BlockAllocator::new(Device::Gpu, 2);
        let block = allocator.allocate().unwrap();
        allocator.free(block).unwrap();
        assert!(allocator.free(block).is_err());
    }
}
