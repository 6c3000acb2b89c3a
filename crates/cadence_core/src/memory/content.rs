//! # Content Pool
//!
//! The persistent and temporary tiers for one content kind, addressed
//! together with a tier policy.

use super::heap::{Block, Heap};
use super::persistent::PersistentPool;
use super::temporary::{Side, TemporaryPool};
use crate::error::MemoryResult;
use crate::status::{ContentKind, LoadStatusTable};

/// Which tiers an allocation or lookup may use.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum TierPolicy {
    /// Only the two-sided temporary tier.
    TemporaryOnly,
    /// Only the persistent tier. Running out is a hard overflow.
    PersistentOnly,
    /// Persistent tier first, falling back to the temporary tier.
    #[default]
    PersistentFirst,
}

/// Tier a piece of content was placed in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Tier {
    /// Session-lifetime tier.
    Persistent,
    /// One side of the temporary tier.
    Temporary(Side),
}

/// Outcome of a content allocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Placement {
    /// Destination block.
    pub block: Block,
    /// Tier it landed in.
    pub tier: Tier,
    /// Content evicted from the chosen temporary side.
    pub evicted: Option<u8>,
    /// Content evicted because the new block overran it.
    pub overlapped: Option<u8>,
}

/// Persistent plus temporary pools for one content kind.
#[derive(Clone, Debug)]
pub struct ContentPool {
    kind: ContentKind,
    persistent: PersistentPool,
    temporary: TemporaryPool,
}

impl ContentPool {
    /// Pairs a persistent and a temporary pool.
    #[must_use]
    pub const fn new(kind: ContentKind, persistent: PersistentPool, temporary: TemporaryPool) -> Self {
        Self {
            kind,
            persistent,
            temporary,
        }
    }

    /// Content kind stored here.
    #[inline]
    #[must_use]
    pub const fn kind(&self) -> ContentKind {
        self.kind
    }

    /// The persistent tier.
    #[inline]
    #[must_use]
    pub const fn persistent(&self) -> &PersistentPool {
        &self.persistent
    }

    /// The temporary tier.
    #[inline]
    #[must_use]
    pub const fn temporary(&self) -> &TemporaryPool {
        &self.temporary
    }

    /// The temporary tier, mutably.
    #[inline]
    pub fn temporary_mut(&mut self) -> &mut TemporaryPool {
        &mut self.temporary
    }

    /// Allocates room for content `id` following `policy`.
    ///
    /// # Errors
    ///
    /// The error of the last tier tried.
    pub fn alloc(
        &mut self,
        heap: &mut Heap,
        statuses: &mut LoadStatusTable,
        size: usize,
        id: u8,
        policy: TierPolicy,
    ) -> MemoryResult<Placement> {
        if policy != TierPolicy::TemporaryOnly {
            match self.persistent.alloc(heap, size, id) {
                Ok(block) => {
                    return Ok(Placement {
                        block,
                        tier: Tier::Persistent,
                        evicted: None,
                        overlapped: None,
                    })
                }
                Err(err) if policy == TierPolicy::PersistentOnly => {
                    tracing::warn!(kind = ?self.kind, id, %err, "persistent overflow");
                    return Err(err);
                }
                Err(err) => {
                    tracing::debug!(kind = ?self.kind, id, %err, "persistent tier full, using temporary");
                }
            }
        }

        let placed = self.temporary.alloc(statuses, size, id)?;
        Ok(Placement {
            block: placed.block,
            tier: Tier::Temporary(placed.side),
            evicted: placed.evicted,
            overlapped: placed.overlapped,
        })
    }

    /// Finds content `id` following `policy`.
    ///
    /// A temporary hit steers the next round-robin eviction to the other
    /// side, so content that was just looked up is not the next to go.
    pub fn lookup(&mut self, id: u8, policy: TierPolicy) -> Option<Block> {
        if policy != TierPolicy::TemporaryOnly {
            if let Some(block) = self.persistent.find(id) {
                return Some(block);
            }
            if policy == TierPolicy::PersistentOnly {
                return None;
            }
        }

        let (side, block) = self.temporary.find(id)?;
        self.temporary.set_next_side(side.other());
        Some(block)
    }

    /// Side of the temporary tier holding `id`, if any.
    #[must_use]
    pub fn temporary_side_of(&self, id: u8) -> Option<Side> {
        self.temporary.find(id).map(|(side, _)| side)
    }

    /// Empties both tiers.
    pub fn clear(&mut self) {
        self.persistent.clear();
        self.temporary.clear();
    }
}
