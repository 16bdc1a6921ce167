//! Deferred release of data-file space.
//!
//! Freeing space in the data file while dirty cache entries may still
//! reference it would let a crash (or a lagging reader) observe recycled
//! bytes. When the metadata cache is not clean, the free is parked: a
//! freed-space record is pinned in the cache as a flush-dependency parent
//! of every dirty entry that could reference the space, and the actual free
//! happens only after the record has aged out of a FIFO holding tank.

use std::{collections::VecDeque, time::Duration};

use tokio::time::Instant;

use crate::{
	collab::{CacheEntryInfo, DataFile, EntryKind, EntryStatus, EntryVisitor, MetaCache, Ring},
	error::Result,
	monotonic,
};

/// What kind of data-file space is being freed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocKind {
	RawData,
	Metadata,
}

/// Cache clients that can hold references into raw data space: the chunk
/// index structures and object headers.
const RAW_DATA_REFERRERS: &[EntryKind] = &[
	EntryKind::BtreeHeader,
	EntryKind::BtreeInternal,
	EntryKind::BtreeLeaf,
	EntryKind::ExtArrayHeader,
	EntryKind::ExtArrayIndexBlock,
	EntryKind::ExtArraySuperBlock,
	EntryKind::ExtArrayDataBlock,
	EntryKind::ExtArrayDataBlockPage,
	EntryKind::FixedArrayHeader,
	EntryKind::FixedArrayDataBlock,
	EntryKind::FixedArrayDataBlockPage,
	EntryKind::ObjectHeader,
	EntryKind::ObjectHeaderChunk,
];

/// Cache-internal clients; never made dependent on freed space.
const CACHE_INTERNAL: &[EntryKind] = &[
	EntryKind::FreedSpace,
	EntryKind::ProxyEntry,
	EntryKind::EpochMarker,
	EntryKind::Prefetched,
];

/// Whether an entry of `kind` may legitimately reference space of the
/// freed `alloc` kind.
fn may_reference(kind: EntryKind, alloc: AllocKind) -> bool {
	match alloc {
		AllocKind::RawData => RAW_DATA_REFERRERS.contains(&kind),
		AllocKind::Metadata => !CACHE_INTERNAL.contains(&kind),
	}
}

/// A deferred free, parked until its dependent cache entries have flushed
/// and its holding time has elapsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FreedSpace {
	pub kind: AllocKind,
	pub addr: u64,
	pub size: u64,
	pub ring: Ring,

	/// Temporary cache address pinning this record.
	pub pin_addr: u64,

	created: Instant,
}

impl FreedSpace {
	pub fn age(&self, now: Instant) -> Duration {
		now.duration_since(self.created)
	}
}

/// How long a record is held: two tick lengths.
pub fn holding_limit(tick_len: u32) -> Duration {
	2 * monotonic::tick_duration(tick_len)
}

/// Decide whether a free of `addr`/`size` must be deferred.
///
/// Returns `None` when the cache is clean or no dirty entry could
/// reference the space; the caller frees immediately. Otherwise every
/// dirty entry in the freed entry's ring or an earlier one whose kind may
/// reference the space becomes a flush-dependency child of a freshly
/// pinned record, and the caller parks the returned record in the
/// [`HoldingTank`].
pub fn defer_free(
	cache: &mut dyn MetaCache,
	data_file: &mut dyn DataFile,
	kind: AllocKind,
	addr: u64,
	size: u64,
	caller_ring: Ring,
) -> Result<Option<FreedSpace>> {
	if cache.is_clean(Ring::Superblock) {
		return Ok(None);
	}

	let ring = match kind {
		AllocKind::RawData => Ring::User,
		AllocKind::Metadata => {
			let status = cache.entry_status(addr)?;
			if status.contains(EntryStatus::InCache) {
				cache.entry_ring(addr)?
			} else {
				caller_ring
			}
		}
	};

	// Collect the dependents first; the dependencies are created after the
	// traversal so the cache is not re-entered mid-iteration.
	let mut dependents = Dependents {
		freed_addr: addr,
		ring,
		kind,
		matches: Vec::new(),
	};
	cache.for_each_entry(&mut dependents)?;

	if dependents.matches.is_empty() {
		return Ok(None);
	}

	let pin_addr = data_file.alloc_tmp(1)?;
	for child in &dependents.matches {
		cache.create_flush_dependency(pin_addr, *child)?;
	}

	tracing::debug!(
		addr,
		size,
		dependents = dependents.matches.len(),
		"deferring a data-file free"
	);

	Ok(Some(FreedSpace {
		kind,
		addr,
		size,
		ring,
		pin_addr,
		created: Instant::now(),
	}))
}

struct Dependents {
	freed_addr: u64,
	ring: Ring,
	kind: AllocKind,
	matches: Vec<u64>,
}

impl EntryVisitor for Dependents {
	fn visit(&mut self, entry: &CacheEntryInfo) -> Result<()> {
		if entry.addr != self.freed_addr
			&& entry.dirty
			&& entry.ring <= self.ring
			&& may_reference(entry.kind, self.kind)
		{
			self.matches.push(entry.addr);
		}
		Ok(())
	}
}

/// FIFO of parked freed-space records.
#[derive(Debug, Default)]
pub struct HoldingTank {
	queue: VecDeque<FreedSpace>,
}

impl HoldingTank {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn len(&self) -> usize {
		self.queue.len()
	}

	pub fn is_empty(&self) -> bool {
		self.queue.is_empty()
	}

	pub fn push(&mut self, freed: FreedSpace) {
		self.queue.push_back(freed);
	}

	/// Dequeue the oldest record, but only once it has been parked longer
	/// than `time_limit`.
	pub fn dequeue_expired(&mut self, now: Instant, time_limit: Duration) -> Option<FreedSpace> {
		let head = self.queue.front()?;
		if now.duration_since(head.created) > time_limit {
			self.queue.pop_front()
		} else {
			None
		}
	}
}
