//! Distributed KV cache coordinator: block table, sequence tracking, MESI
//! coherency, eviction policies, prefix sharing, and replication (spec.md
//! §3, §4.3).
//!
//! Grounded on `original_source/fabric-os/kv-cache/distributed_kv_cache.h`
//! for the data model and function surface, and on `knhk-accelerate`'s
//! lock-per-concern style for the concurrency primitives (see SPEC_FULL.md
//! §5): the block table and eviction queue are separate `parking_lot::Mutex`
//! guards, acquired in the fixed order `block_table` then `eviction`, with
//! hot per-block counters kept as atomics on `CacheBlock` so a cache hit
//! never needs the table lock to update access bookkeeping.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{Coherency, EvictionPolicy};
use crate::device::DeviceHandle;
use crate::error::{CacheError, Result};

pub const PAGE_SIZE_BYTES: u32 = 4096;
pub const MAX_BLOCKS_PER_SEQUENCE: usize = 2048;

pub type BlockId = u64;
pub type SequenceId = u64;

/// MESI-style coherency state for a single cache block (spec.md §3, §4.3).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockState {
    Invalid,
    Shared,
    Exclusive,
    Modified,
}

/// A single page of cached key/value tensors for one position in a sequence.
///
/// Hot fields (`ref_count`, `access_count`, `last_access_ns`) are atomics so
/// `touch()` on a cache hit never needs the block-table lock.
pub struct CacheBlock {
    pub block_id: BlockId,
    pub sequence_id: SequenceId,
    pub position: u32,
    pub state: Mutex<BlockState>,
    pub node: DeviceHandle,

    pub key_size_bytes: u32,
    pub value_size_bytes: u32,
    recompute_cost_ms: AtomicU32,

    pub dirty: std::sync::atomic::AtomicBool,
    pub locked: std::sync::atomic::AtomicBool,

    ref_count: AtomicU32,
    access_count: AtomicU64,
    last_access_ns: AtomicU64,
}

impl CacheBlock {
    fn new(block_id: BlockId, sequence_id: SequenceId, position: u32, node: DeviceHandle) -> Self {
        Self {
            block_id,
            sequence_id,
            position,
            state: Mutex::new(BlockState::Exclusive),
            node,
            key_size_bytes: PAGE_SIZE_BYTES / 2,
            value_size_bytes: PAGE_SIZE_BYTES / 2,
            recompute_cost_ms: AtomicU32::new(0.0f32.to_bits()),
            dirty: std::sync::atomic::AtomicBool::new(false),
            locked: std::sync::atomic::AtomicBool::new(false),
            ref_count: AtomicU32::new(0),
            access_count: AtomicU64::new(0),
            last_access_ns: AtomicU64::new(0),
        }
    }

    pub fn size_bytes(&self) -> u64 {
        (self.key_size_bytes + self.value_size_bytes) as u64
    }

    /// Estimated cost in milliseconds of recomputing this block's tensors
    /// from scratch rather than keeping it cached, used by the `CostAware`
    /// eviction policy (spec.md §4.3).
    pub fn recompute_cost_ms(&self) -> f32 {
        f32::from_bits(self.recompute_cost_ms.load(Ordering::Acquire))
    }

    pub fn set_recompute_cost_ms(&self, cost_ms: f32) {
        self.recompute_cost_ms.store(cost_ms.to_bits(), Ordering::Release);
    }

    pub fn is_cached(&self) -> bool {
        !matches!(*self.state.lock(), BlockState::Invalid)
    }

    pub fn ref_count(&self) -> u32 {
        self.ref_count.load(Ordering::Acquire)
    }

    pub fn access_count(&self) -> u64 {
        self.access_count.load(Ordering::Acquire)
    }

    pub fn last_access_ns(&self) -> u64 {
        self.last_access_ns.load(Ordering::Acquire)
    }

    /// Records a logical access. `clock_ns` is supplied by the caller (the
    /// control loop's monotonic tick counter) rather than read from the wall
    /// clock here, keeping this module free of a direct `SystemTime`
    /// dependency and trivially testable.
    pub fn touch(&self, clock_ns: u64) {
        self.access_count.fetch_add(1, Ordering::AcqRel);
        self.last_access_ns.store(clock_ns, Ordering::Release);
    }

    pub fn pin(&self) {
        self.ref_count.fetch_add(1, Ordering::AcqRel);
    }

    pub fn unpin(&self) {
        self.ref_count.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Tracks a single inference sequence's allocated blocks and prefix-sharing
/// metadata (spec.md §3 Sequence).
#[derive(Clone, Debug)]
pub struct Sequence {
    pub sequence_id: SequenceId,
    pub block_ids: Vec<BlockId>,
    pub sequence_length: u32,
    pub created_ns: u64,
    pub last_access_ns: u64,

    pub prefix_hash: Option<u64>,
    pub prefix_length: u32,

    pub preferred_node: Option<DeviceHandle>,
    pub cache_hit_rate: f32,
}

impl Sequence {
    fn new(sequence_id: SequenceId, created_ns: u64) -> Self {
        Self {
            sequence_id,
            block_ids: Vec::new(),
            sequence_length: 0,
            created_ns,
            last_access_ns: created_ns,
            prefix_hash: None,
            prefix_length: 0,
            preferred_node: None,
            cache_hit_rate: 0.0,
        }
    }
}

struct EvictionQueue {
    order: VecDeque<BlockId>,
}

impl EvictionQueue {
    fn new() -> Self {
        Self { order: VecDeque::new() }
    }

    fn push(&mut self, block_id: BlockId) {
        self.order.push_back(block_id);
    }

    fn remove(&mut self, block_id: BlockId) {
        self.order.retain(|&b| b != block_id);
    }
}

/// Coordinates cache block allocation, eviction, and prefix sharing across
/// the fleet (spec.md §4.3).
pub struct KvCacheCoordinator {
    eviction_policy: EvictionPolicy,
    coherency: Coherency,
    total_capacity_bytes: u64,
    replication_factor: u32,

    used_bytes: AtomicU64,
    next_block_id: AtomicU64,

    blocks: Mutex<HashMap<BlockId, Arc<CacheBlock>>>,
    sequences: Mutex<HashMap<SequenceId, Sequence>>,
    eviction: Mutex<EvictionQueue>,
    replicas: Mutex<HashMap<BlockId, Vec<DeviceHandle>>>,

    total_requests: AtomicU64,
    total_hits: AtomicU64,
    total_evictions: AtomicU64,
}

impl KvCacheCoordinator {
    pub fn new(
        total_capacity_bytes: u64,
        eviction_policy: EvictionPolicy,
        coherency: Coherency,
        replication_factor: u32,
    ) -> Self {
        Self {
            eviction_policy,
            coherency,
            total_capacity_bytes,
            replication_factor: replication_factor.max(1),
            used_bytes: AtomicU64::new(0),
            next_block_id: AtomicU64::new(1),
            blocks: Mutex::new(HashMap::new()),
            sequences: Mutex::new(HashMap::new()),
            eviction: Mutex::new(EvictionQueue::new()),
            replicas: Mutex::new(HashMap::new()),
            total_requests: AtomicU64::new(0),
            total_hits: AtomicU64::new(0),
            total_evictions: AtomicU64::new(0),
        }
    }

    pub fn create_sequence(&self, sequence_id: SequenceId, created_ns: u64) -> Result<()> {
        let mut sequences = self.sequences.lock();
        if sequences.contains_key(&sequence_id) {
            return Err(CacheError::DuplicateSequence(sequence_id).into());
        }
        sequences.insert(sequence_id, Sequence::new(sequence_id, created_ns));
        Ok(())
    }

    /// Allocates a new block for `sequence_id` on `node`, evicting via the
    /// configured policy if capacity is exhausted (spec.md §4.3). Returns the
    /// new block's id.
    #[tracing::instrument(skip(self))]
    pub fn allocate(&self, sequence_id: SequenceId, node: DeviceHandle, clock_ns: u64) -> Result<BlockId> {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        let needed = PAGE_SIZE_BYTES as u64;

        if self.used_bytes.load(Ordering::Acquire) + needed > self.total_capacity_bytes {
            self.evict(needed)?;
        }

        let block_id = self.next_block_id.fetch_add(1, Ordering::AcqRel);
        let position = {
            let mut sequences = self.sequences.lock();
            let sequence = sequences
                .get_mut(&sequence_id)
                .ok_or(CacheError::SequenceNotFound(sequence_id))?;
            if sequence.block_ids.len() >= MAX_BLOCKS_PER_SEQUENCE {
                return Err(CacheError::OutOfCapacity.into());
            }
            let position = sequence.block_ids.len() as u32;
            sequence.block_ids.push(block_id);
            sequence.last_access_ns = clock_ns;
            sequence.preferred_node.get_or_insert(node);
            position
        };

        let block = Arc::new(CacheBlock::new(block_id, sequence_id, position, node));
        block.touch(clock_ns);
        self.blocks.lock().insert(block_id, block);
        self.eviction.lock().push(block_id);
        self.used_bytes.fetch_add(needed, Ordering::AcqRel);

        if self.replication_factor > 1 {
            self.replicas.lock().insert(block_id, Vec::new());
        }

        debug!(block_id, sequence_id, "block allocated");
        Ok(block_id)
    }

    /// Sets the recompute cost used by the `CostAware` eviction policy for an
    /// already-allocated block (spec.md §4.3 "recompute-vs-keep economic
    /// choice"). Callers with a per-job recompute estimate (e.g. the
    /// scheduler, from `WorkloadProfile::compute_ops`) call this right after
    /// `allocate`.
    pub fn set_recompute_cost_ms(&self, block_id: BlockId, recompute_cost_ms: f32) -> Result<()> {
        let blocks = self.blocks.lock();
        let block = blocks.get(&block_id).ok_or(CacheError::BlockNotFound(block_id))?;
        block.set_recompute_cost_ms(recompute_cost_ms);
        Ok(())
    }

    pub fn get(&self, block_id: BlockId, clock_ns: u64) -> Result<Arc<CacheBlock>> {
        let block = self
            .blocks
            .lock()
            .get(&block_id)
            .cloned()
            .ok_or(CacheError::BlockNotFound(block_id))?;
        block.touch(clock_ns);
        self.total_hits.fetch_add(1, Ordering::Relaxed);
        Ok(block)
    }

    pub fn free_block(&self, block_id: BlockId) -> Result<()> {
        let block = self
            .blocks
            .lock()
            .remove(&block_id)
            .ok_or(CacheError::BlockNotFound(block_id))?;
        self.eviction.lock().remove(block_id);
        self.used_bytes.fetch_sub(block.size_bytes(), Ordering::AcqRel);
        self.replicas.lock().remove(&block_id);
        Ok(())
    }

    pub fn free_sequence(&self, sequence_id: SequenceId) -> Result<()> {
        let block_ids = {
            let mut sequences = self.sequences.lock();
            let sequence = sequences
                .remove(&sequence_id)
                .ok_or(CacheError::SequenceNotFound(sequence_id))?;
            sequence.block_ids
        };
        for block_id in block_ids {
            let _ = self.free_block(block_id);
        }
        Ok(())
    }

    /// Evicts blocks by the configured policy until at least `num_bytes_needed`
    /// bytes of capacity are free. Minimality (spec.md §8 property 4): never
    /// frees more than `num_bytes_needed + max_block_size - 1` bytes beyond
    /// what was already free.
    #[tracing::instrument(skip(self))]
    fn evict(&self, num_bytes_needed: u64) -> Result<()> {
        let available = self.total_capacity_bytes.saturating_sub(self.used_bytes.load(Ordering::Acquire));
        if available >= num_bytes_needed {
            return Ok(());
        }
        let mut to_free = num_bytes_needed - available;

        loop {
            let victim = self.select_victim()?;
            let Some(victim) = victim else {
                return Err(CacheError::OutOfCapacity.into());
            };
            let size = victim.size_bytes();
            self.free_block(victim.block_id)?;
            self.total_evictions.fetch_add(1, Ordering::Relaxed);
            warn!(block_id = victim.block_id, "evicted");
            to_free = to_free.saturating_sub(size);
            if to_free == 0 {
                break;
            }
        }
        Ok(())
    }

    /// Selects the next eviction victim per the configured policy. A block is
    /// only a candidate when it is neither `locked` (pinned for active
    /// compute) nor referenced (`ref_count() == 0`) — spec.md §3 invariant
    /// "`ref_count > 0` => not evictable" and §4.3 invariant (i) both forbid
    /// evicting a block still shared via `share_prefix`'s `pin()`.
    fn select_victim(&self) -> Result<Option<Arc<CacheBlock>>> {
        let blocks = self.blocks.lock();
        let candidates: Vec<Arc<CacheBlock>> = blocks
            .values()
            .filter(|b| !b.locked.load(Ordering::Acquire) && b.ref_count() == 0)
            .cloned()
            .collect();
        drop(blocks);

        if candidates.is_empty() {
            return Ok(None);
        }

        let victim = match self.eviction_policy {
            EvictionPolicy::Lru => candidates
                .into_iter()
                .min_by_key(|b| b.last_access_ns()),
            EvictionPolicy::Lfu => candidates
                .into_iter()
                .min_by_key(|b| b.access_count()),
            EvictionPolicy::Fifo => {
                let order = self.eviction.lock();
                order
                    .order
                    .iter()
                    .find_map(|id| candidates.iter().find(|b| b.block_id == *id).cloned())
            }
            EvictionPolicy::CostAware => candidates.into_iter().min_by(|a, b| {
                let score_a = a.recompute_cost_ms() / a.size_bytes() as f32;
                let score_b = b.recompute_cost_ms() / b.size_bytes() as f32;
                score_a.partial_cmp(&score_b).unwrap_or(std::cmp::Ordering::Equal)
            }),
        };
        Ok(victim)
    }

    /// Finds a sequence sharing a cached prefix identified by `prefix_hash`
    /// (spec.md §4.3 prefix sharing), grounded on `kv_cache_find_prefix`.
    pub fn find_prefix(&self, prefix_hash: u64, min_length: u32) -> Option<SequenceId> {
        self.sequences
            .lock()
            .values()
            .find(|s| s.prefix_hash == Some(prefix_hash) && s.prefix_length >= min_length)
            .map(|s| s.sequence_id)
    }

    /// Marks `seq_id_2` as sharing `seq_id_1`'s prefix blocks, promoting the
    /// shared blocks to `Shared` state under MESI coherency.
    pub fn share_prefix(&self, seq_id_1: SequenceId, seq_id_2: SequenceId, prefix_len: u32) -> Result<()> {
        let shared_hash = {
            let sequences = self.sequences.lock();
            let source = sequences.get(&seq_id_1).ok_or(CacheError::SequenceNotFound(seq_id_1))?;
            source.prefix_hash.unwrap_or(seq_id_1)
        };

        let shared_block_ids: Vec<BlockId> = {
            let mut sequences = self.sequences.lock();
            let source_blocks = sequences
                .get(&seq_id_1)
                .ok_or(CacheError::SequenceNotFound(seq_id_1))?
                .block_ids
                .iter()
                .take(prefix_len as usize)
                .cloned()
                .collect::<Vec<_>>();

            let target = sequences.get_mut(&seq_id_2).ok_or(CacheError::SequenceNotFound(seq_id_2))?;
            target.prefix_hash = Some(shared_hash);
            target.prefix_length = prefix_len;
            source_blocks
        };

        if self.coherency != Coherency::None {
            let blocks = self.blocks.lock();
            for block_id in &shared_block_ids {
                if let Some(block) = blocks.get(block_id) {
                    block.pin();
                    let mut state = block.state.lock();
                    if *state == BlockState::Exclusive || *state == BlockState::Modified {
                        *state = BlockState::Shared;
                    }
                }
            }
        }

        info!(seq_id_1, seq_id_2, prefix_len, "prefix shared");
        Ok(())
    }

    /// Returns the node with the most cached blocks for a sequence, used by
    /// the routing engine's cache-affinity scoring (spec.md §4.5 scoring).
    pub fn preferred_node(&self, sequence_id: SequenceId) -> Option<DeviceHandle> {
        self.sequences.lock().get(&sequence_id).and_then(|s| s.preferred_node)
    }

    /// Replicates `block_id` onto `target_node`, respecting `replication_factor`.
    pub fn replicate_block(&self, block_id: BlockId, target_node: DeviceHandle) -> Result<()> {
        if !self.blocks.lock().contains_key(&block_id) {
            return Err(CacheError::BlockNotFound(block_id).into());
        }
        let mut replicas = self.replicas.lock();
        let targets = replicas.entry(block_id).or_default();
        if targets.len() + 1 >= self.replication_factor as usize {
            debug!(block_id, "replication factor already satisfied");
        }
        if !targets.contains(&target_node) {
            targets.push(target_node);
        }
        Ok(())
    }

    pub fn replica_count(&self, block_id: BlockId) -> usize {
        self.replicas.lock().get(&block_id).map(|v| v.len()).unwrap_or(0)
    }

    pub fn hit_rate(&self) -> f32 {
        let total = self.total_requests.load(Ordering::Relaxed);
        if total == 0 {
            return 0.0;
        }
        self.total_hits.load(Ordering::Relaxed) as f32 / total as f32 * 100.0
    }

    pub fn used_bytes(&self) -> u64 {
        self.used_bytes.load(Ordering::Acquire)
    }

    pub fn total_capacity_bytes(&self) -> u64 {
        self.total_capacity_bytes
    }

    pub fn total_evictions(&self) -> u64 {
        self.total_evictions.load(Ordering::Relaxed)
    }

    pub fn block_count(&self) -> usize {
        self.blocks.lock().len()
    }
}
