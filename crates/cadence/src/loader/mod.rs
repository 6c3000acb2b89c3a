//! # Streaming Loader
//!
//! Moves sequences and banks from the transfer device into the session
//! pools and tracks where each one is in its load lifecycle.
//!
//! ## Design
//!
//! ```text
//!                 sync load                       async load
//!   ┌────────┐  allocate + copy_blocking   ┌────────┐  allocate + header copy
//!   │ NOT    │────────────────────────────▶│COMPLETE│◀──────────────┐
//!   │ LOADED │──────────┐                  └────────┘               │
//!   └────────┘          │ allocate, copy header        last chunk lands,
//!        ▲              ▼                              relocate
//!        │        ┌───────────┐  one chunk in flight  ┌──────────┐
//!        └─evict──│IN_PROGRESS│──────────────────────▶│StreamJob │
//!                 └───────────┘   per tick            └──────────┘
//! ```
//!
//! Every allocation goes through the persistent-then-temporary policy.
//! Content evicted by an allocation is recorded so the engine can stop the
//! voices and players still pointing at it.

mod archive;
mod bank;

pub use archive::{ArchiveIndex, Directory};
pub use bank::{BankEntry, Relocator};

use cadence_core::{
    ArenaPool, Block, ContentKind, ContentPool, Heap, LoadStatus, LoadStatusTable, Side,
    TierPolicy,
};
use cadence_shared::archive::{read_record, BankHeader, BankSet};
use cadence_shared::constants::{
    BANK_HEADER_SIZE, MAX_BANKS, MAX_SEQUENCES, SEQUENCE_HEADER_SIZE, TRANSFER_CHUNK_SIZE,
};

use crate::error::{EngineError, EngineResult};
use crate::transfer::{CompletionQueue, DeviceAddr, TransferDevice, TransferRequest};

/// Completions the loader queue holds before the device has to drop some.
const LOADER_QUEUE_DEPTH: usize = 16;

/// Content displaced by an allocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Eviction {
    /// Kind of the evicted content.
    pub kind: ContentKind,
    /// Its id.
    pub id: u8,
}

/// Pools a session hands to the loader.
#[derive(Clone, Debug)]
pub struct SessionPools {
    /// Notes-and-buffers arena: cache slots and resident samples.
    pub misc: ArenaPool,
    /// Sequence tiers.
    pub sequences: ContentPool,
    /// Bank tiers.
    pub banks: ContentPool,
}

/// An asynchronous load in progress.
#[derive(Clone, Copy, Debug)]
struct StreamJob {
    kind: ContentKind,
    id: u8,
    player: Option<u8>,
    tag: u32,
    source: DeviceAddr,
    dest: Block,
    cursor: usize,
    remaining: usize,
    in_flight: bool,
    abandoned: bool,
    /// Instrument and drum counts from the bank header.
    tables: (u32, u32),
}

/// Loads content and owns everything describing what is resident.
pub struct Loader {
    archive: ArchiveIndex,
    pools: SessionPools,
    seq_status: LoadStatusTable,
    bank_status: LoadStatusTable,
    bank_entries: Vec<Option<BankEntry>>,
    seq_lens: Vec<usize>,
    jobs: Vec<StreamJob>,
    queue: CompletionQueue,
    next_tag: u32,
    evictions: Vec<Eviction>,
}

impl Loader {
    /// Creates a loader over `archive` using the pools of the first session.
    #[must_use]
    pub fn new(archive: ArchiveIndex, pools: SessionPools, players: u8) -> Self {
        Self {
            archive,
            pools,
            seq_status: LoadStatusTable::new(ContentKind::Sequence, MAX_SEQUENCES),
            bank_status: LoadStatusTable::new(ContentKind::Bank, MAX_BANKS),
            bank_entries: vec![None; MAX_BANKS],
            seq_lens: vec![0; MAX_SEQUENCES],
            jobs: Vec::with_capacity(usize::from(players) * 2),
            queue: CompletionQueue::new(LOADER_QUEUE_DEPTH),
            next_tag: 0,
            evictions: Vec::with_capacity(8),
        }
    }

    /// Replaces the session pools, forgetting every loaded item.
    ///
    /// Streaming jobs are dropped; the engine only calls this once no
    /// transfer is in flight or the drain bound has passed.
    pub fn install(&mut self, pools: SessionPools) {
        self.pools = pools;
        self.forget();
    }

    /// Forgets every loaded item and rewinds the content pools, keeping
    /// the current layout. Used when a session rebuild fails part way and
    /// the bytes behind the old entries can no longer be trusted.
    pub fn forget(&mut self) {
        self.pools.sequences.clear();
        self.pools.banks.clear();
        self.seq_status.clear();
        self.bank_status.clear();
        self.bank_entries.fill(None);
        if !self.jobs.is_empty() {
            tracing::warn!(jobs = self.jobs.len(), "dropping streaming jobs on session rebuild");
        }
        self.jobs.clear();
        let stale = self.queue.drain();
        if stale > 0 {
            tracing::debug!(stale, "discarded stale loader completions");
        }
        self.evictions.clear();
    }

    /// The archive index.
    #[inline]
    #[must_use]
    pub const fn archive(&self) -> &ArchiveIndex {
        &self.archive
    }

    /// The notes-and-buffers arena.
    #[inline]
    pub fn misc_mut(&mut self) -> &mut ArenaPool {
        &mut self.pools.misc
    }

    /// The session's content pools for `kind`.
    #[inline]
    #[must_use]
    pub const fn pool(&self, kind: ContentKind) -> &ContentPool {
        match kind {
            ContentKind::Sequence => &self.pools.sequences,
            ContentKind::Bank => &self.pools.banks,
        }
    }

    /// Load status table for `kind`.
    #[inline]
    #[must_use]
    pub const fn statuses(&self, kind: ContentKind) -> &LoadStatusTable {
        match kind {
            ContentKind::Sequence => &self.seq_status,
            ContentKind::Bank => &self.bank_status,
        }
    }

    /// Load status of content `id`.
    #[inline]
    #[must_use]
    pub fn status(&self, kind: ContentKind, id: u8) -> LoadStatus {
        self.statuses(kind).get(id)
    }

    /// Marks loaded content `id` as in use again.
    pub fn retain(&mut self, kind: ContentKind, id: u8) {
        let table = self.statuses_mut(kind);
        if table.get(id).is_loaded() {
            table.set(id, LoadStatus::Complete);
        }
    }

    /// Marks complete content `id` as first in line for eviction.
    pub fn release(&mut self, kind: ContentKind, id: u8) {
        self.statuses_mut(kind).release(id);
    }

    /// Points the next bank eviction at the temporary side holding `bank`.
    pub fn steer_bank_eviction(&mut self, bank: u8) {
        if let Some(side) = self.pools.banks.temporary_side_of(bank) {
            self.pools.banks.temporary_mut().set_next_side(side);
        }
    }

    /// Temporary side holding content `id`, if any.
    #[must_use]
    pub fn temporary_side(&self, kind: ContentKind, id: u8) -> Option<Side> {
        self.pool(kind).temporary_side_of(id)
    }

    /// Relocated bank `id`, if it is loaded.
    #[must_use]
    pub fn bank(&self, id: u8) -> Option<&BankEntry> {
        if !self.bank_status.get(id).is_loaded() {
            return None;
        }
        self.bank_entries.get(usize::from(id))?.as_ref()
    }

    /// Returns true if bank `id` is loaded and can be found in its pools.
    pub fn bank_cached(&mut self, id: u8) -> bool {
        self.bank_status.get(id).is_loaded()
            && self.pools.banks.lookup(id, TierPolicy::PersistentFirst).is_some()
    }

    /// Heap block of loaded sequence `id`.
    pub fn sequence_block(&mut self, id: u8) -> Option<Block> {
        if !self.seq_status.get(id).is_loaded() {
            return None;
        }
        let block = self.pools.sequences.lookup(id, TierPolicy::PersistentFirst)?;
        let len = self.seq_lens[usize::from(id)];
        block.sub(0, len.min(block.len()))
    }

    /// Banks used by sequence `seq`.
    #[must_use]
    pub fn bank_set(&self, heap: &Heap, seq: u8) -> Option<BankSet> {
        self.archive.bank_set(heap, seq)
    }

    /// Counts the banks of `set` that are not loaded, returning the count
    /// and the last missing bank.
    #[must_use]
    pub fn missing_banks(&self, set: &BankSet) -> (usize, Option<u8>) {
        set.banks()
            .iter()
            .filter(|&&bank| !self.bank_status.get(bank).is_loaded())
            .fold((0, None), |(count, _), &bank| (count + 1, Some(bank)))
    }

    /// Returns true if `player` is waiting on a streaming job.
    #[must_use]
    pub fn has_active_job(&self, player: u8) -> bool {
        self.jobs
            .iter()
            .any(|job| job.player == Some(player) && !job.abandoned)
    }

    /// Returns true if `player` has any job whose transfer has not landed.
    #[must_use]
    pub fn has_job(&self, player: u8) -> bool {
        self.jobs.iter().any(|job| job.player == Some(player))
    }

    /// Streaming jobs not yet finished.
    #[inline]
    #[must_use]
    pub fn pending_jobs(&self) -> usize {
        self.jobs.len()
    }

    /// Takes the next recorded eviction.
    pub fn pop_eviction(&mut self) -> Option<Eviction> {
        self.evictions.pop()
    }

    /// Loads bank `id` with blocking transfers.
    ///
    /// # Errors
    ///
    /// Missing content, allocation failure, a malformed bank or a transfer
    /// error; the bank is left not loaded.
    pub fn load_bank_sync(
        &mut self,
        heap: &mut Heap,
        device: &mut dyn TransferDevice,
        id: u8,
    ) -> EngineResult<BankEntry> {
        let (source, len) = self.locate(heap, ContentKind::Bank, id)?;
        let (instruments, drums) = read_bank_header(device, source, len)?;
        let body_len = len - BANK_HEADER_SIZE;
        let block = self.place(heap, ContentKind::Bank, id, body_len)?;
        let body = Block::new(block.offset(), body_len);

        device.copy_blocking(source + BANK_HEADER_SIZE as u32, heap.slice_mut(body))?;
        let entry = self.relocate(heap, device, id, body, (instruments, drums))?;

        self.bank_entries[usize::from(id)] = Some(entry);
        self.bank_status.set(id, LoadStatus::Complete);
        tracing::debug!(bank = id, len, "bank loaded");
        Ok(entry)
    }

    /// Starts streaming bank `id` on behalf of `player`.
    ///
    /// # Errors
    ///
    /// As [`Loader::load_bank_sync`]; a failed start leaves the bank not
    /// loaded.
    pub fn load_bank_async(
        &mut self,
        heap: &mut Heap,
        device: &mut dyn TransferDevice,
        id: u8,
        player: u8,
    ) -> EngineResult<()> {
        let (source, len) = self.locate(heap, ContentKind::Bank, id)?;
        let tables = read_bank_header(device, source, len)?;
        let body_len = len - BANK_HEADER_SIZE;
        let block = self.place(heap, ContentKind::Bank, id, body_len)?;

        self.bank_entries[usize::from(id)] = None;
        self.bank_status.set(id, LoadStatus::InProgress);
        self.start_job(
            heap,
            device,
            StreamJob {
                kind: ContentKind::Bank,
                id,
                player: Some(player),
                tag: 0,
                source: source + BANK_HEADER_SIZE as u32,
                dest: Block::new(block.offset(), body_len),
                cursor: 0,
                remaining: body_len,
                in_flight: false,
                abandoned: false,
                tables,
            },
        )
    }

    /// Loads sequence `id` with a blocking transfer.
    ///
    /// # Errors
    ///
    /// Missing content, allocation failure or a transfer error.
    pub fn load_sequence_sync(
        &mut self,
        heap: &mut Heap,
        device: &mut dyn TransferDevice,
        id: u8,
    ) -> EngineResult<Block> {
        let (source, len) = self.locate(heap, ContentKind::Sequence, id)?;
        let block = self.place(heap, ContentKind::Sequence, id, len)?;
        let data = Block::new(block.offset(), len);
        self.seq_lens[usize::from(id)] = len;
        device.copy_blocking(source, heap.slice_mut(data))?;
        self.seq_status.set(id, LoadStatus::Complete);
        tracing::debug!(seq = id, len, "sequence loaded");
        Ok(data)
    }

    /// Starts streaming sequence `id` on behalf of `player`. Short
    /// sequences complete immediately.
    ///
    /// # Errors
    ///
    /// As [`Loader::load_sequence_sync`].
    pub fn load_sequence_async(
        &mut self,
        heap: &mut Heap,
        device: &mut dyn TransferDevice,
        id: u8,
        player: u8,
    ) -> EngineResult<Block> {
        let (source, len) = self.locate(heap, ContentKind::Sequence, id)?;
        let block = self.place(heap, ContentKind::Sequence, id, len)?;
        let data = Block::new(block.offset(), len);
        self.seq_lens[usize::from(id)] = len;

        if len <= SEQUENCE_HEADER_SIZE {
            device.copy_blocking(source, heap.slice_mut(data))?;
            self.seq_status.set(id, LoadStatus::Complete);
            return Ok(data);
        }

        let header = Block::new(data.offset(), SEQUENCE_HEADER_SIZE);
        device.copy_blocking(source, heap.slice_mut(header))?;
        self.seq_status.set(id, LoadStatus::InProgress);
        self.start_job(
            heap,
            device,
            StreamJob {
                kind: ContentKind::Sequence,
                id,
                player: Some(player),
                tag: 0,
                source: source + SEQUENCE_HEADER_SIZE as u32,
                dest: Block::new(data.offset() + SEQUENCE_HEADER_SIZE, len - SEQUENCE_HEADER_SIZE),
                cursor: 0,
                remaining: len - SEQUENCE_HEADER_SIZE,
                in_flight: false,
                abandoned: false,
                tables: (0, 0),
            },
        )?;
        Ok(data)
    }

    /// Loads every missing bank of `set` synchronously and returns the
    /// set's default bank.
    ///
    /// # Errors
    ///
    /// [`EngineError::LoadFailure`] for an empty set or a bank still
    /// streaming, or the first bank load error.
    pub fn load_banks_sync(
        &mut self,
        heap: &mut Heap,
        device: &mut dyn TransferDevice,
        seq: u8,
        set: &BankSet,
    ) -> EngineResult<u8> {
        let default = set.default_bank().ok_or(EngineError::LoadFailure {
            kind: ContentKind::Sequence,
            id: seq,
            reason: "sequence has no banks",
        })?;
        for &bank in set.banks() {
            match self.bank_status.get(bank) {
                LoadStatus::InProgress => {
                    tracing::warn!(bank, seq, "bank is streaming for another player");
                    return Err(EngineError::LoadFailure {
                        kind: ContentKind::Bank,
                        id: bank,
                        reason: "bank already streaming",
                    });
                }
                status if status.is_loaded() && self.bank_cached(bank) => {}
                _ => {
                    self.load_bank_sync(heap, device, bank)?;
                }
            }
        }
        Ok(default)
    }

    /// Advances every streaming job by the completions that have landed.
    pub fn service(&mut self, heap: &mut Heap, device: &mut dyn TransferDevice) {
        while let Some(done) = self.queue.poll() {
            let Some(index) = self.jobs.iter().position(|job| job.tag == done.tag) else {
                tracing::debug!(tag = done.tag, "completion for unknown job");
                continue;
            };

            let job = &mut self.jobs[index];
            job.in_flight = false;
            job.cursor += done.dest.len();
            job.remaining = job.remaining.saturating_sub(done.dest.len());

            if job.abandoned {
                let job = self.jobs.swap_remove(index);
                tracing::debug!(kind = ?job.kind, id = job.id, "abandoned stream dropped");
                continue;
            }

            if job.remaining > 0 {
                if let Err(err) = self.submit_chunk(device, index) {
                    self.fail_job(index, &err);
                }
                continue;
            }

            let job = self.jobs.swap_remove(index);
            self.finish_job(heap, device, job);
        }
    }

    /// Preloads banks and/or sequence `seq` without binding a player.
    ///
    /// # Errors
    ///
    /// The first load error.
    pub fn preload(
        &mut self,
        heap: &mut Heap,
        device: &mut dyn TransferDevice,
        seq: u8,
        banks: bool,
        sequence: bool,
    ) -> EngineResult<()> {
        if usize::from(seq) >= self.archive.sequence_count() {
            return Err(EngineError::MissingContent {
                what: "sequence",
                id: u32::from(seq),
            });
        }
        if banks {
            let set = self.bank_set(heap, seq).ok_or(EngineError::MissingContent {
                what: "bank set",
                id: u32::from(seq),
            })?;
            self.load_banks_sync(heap, device, seq, &set)?;
        }
        if sequence && self.sequence_block(seq).is_none() {
            if self.seq_status.get(seq) == LoadStatus::InProgress {
                return Err(EngineError::LoadFailure {
                    kind: ContentKind::Sequence,
                    id: seq,
                    reason: "sequence already streaming",
                });
            }
            self.load_sequence_sync(heap, device, seq)?;
        }
        Ok(())
    }

    fn statuses_mut(&mut self, kind: ContentKind) -> &mut LoadStatusTable {
        match kind {
            ContentKind::Sequence => &mut self.seq_status,
            ContentKind::Bank => &mut self.bank_status,
        }
    }

    fn locate(&self, heap: &Heap, kind: ContentKind, id: u8) -> EngineResult<(DeviceAddr, usize)> {
        let what = match kind {
            ContentKind::Sequence => "sequence",
            ContentKind::Bank => "bank",
        };
        self.archive
            .entry(heap, kind, id)
            .ok_or(EngineError::MissingContent {
                what,
                id: u32::from(id),
            })
    }

    /// Allocates room for content `id`, recording whatever was evicted.
    fn place(&mut self, heap: &mut Heap, kind: ContentKind, id: u8, size: usize) -> EngineResult<Block> {
        let (pool, statuses) = match kind {
            ContentKind::Sequence => (&mut self.pools.sequences, &mut self.seq_status),
            ContentKind::Bank => (&mut self.pools.banks, &mut self.bank_status),
        };
        let placement = pool
            .alloc(heap, statuses, size, id, TierPolicy::PersistentFirst)
            .map_err(|err| {
                tracing::warn!(?kind, id, size, %err, "no room for content");
                EngineError::from(err)
            })?;

        for victim in [placement.evicted, placement.overlapped].into_iter().flatten() {
            self.evict(kind, victim);
        }
        tracing::trace!(?kind, id, tier = ?placement.tier, offset = placement.block.offset(), "content placed");
        Ok(placement.block)
    }

    fn evict(&mut self, kind: ContentKind, id: u8) {
        if kind == ContentKind::Bank {
            self.bank_entries[usize::from(id)] = None;
        }
        for job in self.jobs.iter_mut().filter(|job| job.kind == kind && job.id == id) {
            job.abandoned = true;
        }
        tracing::debug!(?kind, id, "content evicted");
        self.evictions.push(Eviction { kind, id });
    }

    fn relocate(
        &mut self,
        heap: &mut Heap,
        device: &mut dyn TransferDevice,
        id: u8,
        body: Block,
        (instruments, drums): (u32, u32),
    ) -> EngineResult<BankEntry> {
        let base = self.archive.sample_base(heap, id).ok_or(EngineError::MissingContent {
            what: "sample directory entry",
            id: u32::from(id),
        })?;
        Relocator::new(heap, body, base).run(instruments, drums, &mut self.pools.misc, device)
    }

    fn start_job(
        &mut self,
        heap: &mut Heap,
        device: &mut dyn TransferDevice,
        mut job: StreamJob,
    ) -> EngineResult<()> {
        if job.remaining == 0 {
            self.finish_job(heap, device, job);
            return Ok(());
        }

        job.tag = self.next_tag;
        self.next_tag = self.next_tag.wrapping_add(1);
        self.jobs.push(job);
        let index = self.jobs.len() - 1;
        if let Err(err) = self.submit_chunk(device, index) {
            self.fail_job(index, &err);
            return Err(err);
        }
        tracing::debug!(kind = ?job.kind, id = job.id, len = job.remaining, "stream started");
        Ok(())
    }

    fn submit_chunk(&mut self, device: &mut dyn TransferDevice, index: usize) -> EngineResult<()> {
        let job = &mut self.jobs[index];
        let len = job.remaining.min(TRANSFER_CHUNK_SIZE);
        let offset = u32::try_from(job.cursor).unwrap_or(u32::MAX);
        device.submit(TransferRequest {
            source: job.source.saturating_add(offset),
            dest: Block::new(job.dest.offset() + job.cursor, len),
            tag: job.tag,
            reply: self.queue.reply_to(),
        })?;
        job.in_flight = true;
        Ok(())
    }

    fn fail_job(&mut self, index: usize, err: &EngineError) {
        let job = self.jobs.swap_remove(index);
        self.statuses_mut(job.kind).set(job.id, LoadStatus::NotLoaded);
        tracing::warn!(kind = ?job.kind, id = job.id, %err, "stream abandoned");
    }

    fn finish_job(&mut self, heap: &mut Heap, device: &mut dyn TransferDevice, job: StreamJob) {
        match job.kind {
            ContentKind::Sequence => {
                self.seq_status.set(job.id, LoadStatus::Complete);
            }
            ContentKind::Bank => match self.relocate(heap, device, job.id, job.dest, job.tables) {
                Ok(entry) => {
                    self.bank_entries[usize::from(job.id)] = Some(entry);
                    self.bank_status.set(job.id, LoadStatus::Complete);
                }
                Err(err) => {
                    tracing::warn!(bank = job.id, %err, "streamed bank failed to relocate");
                    self.bank_status.set(job.id, LoadStatus::NotLoaded);
                    return;
                }
            },
        }
        tracing::debug!(kind = ?job.kind, id = job.id, player = ?job.player, "stream complete");
    }
}

/// Reads the instrument and drum counts of the bank at `source`.
fn read_bank_header(
    device: &mut dyn TransferDevice,
    source: DeviceAddr,
    len: usize,
) -> EngineResult<(u32, u32)> {
    if len < BANK_HEADER_SIZE {
        return Err(EngineError::InvalidArchive("bank shorter than its header"));
    }
    let mut raw = [0u8; BANK_HEADER_SIZE];
    device.copy_blocking(source, &mut raw)?;
    let header = read_record::<BankHeader>(&raw, 0)
        .ok_or(EngineError::InvalidArchive("truncated bank header"))?;
    Ok((header.instruments, header.drums))
}
