//! Interfaces to the collaborators that sit above and beside the shadow
//! file: the page buffer, the metadata cache, the shadow-file free-space
//! manager, and the data file itself.
//!
//! The tick engines drive these through trait objects; none of the
//! implementations live in this crate.

use flagset::{flags, FlagSet};

use crate::{error::Result, index::Index};

flags! {
	/// Status of a metadata cache entry.
	pub enum EntryStatus: u32 {
		InCache,
		Dirty,
		Protected,
		Pinned,
		FlushDepParent,
		FlushDepChild,
	}
}

/// Metadata cache rings, in flush order.
///
/// Entries in earlier rings flush before entries in later rings; a flush
/// dependency may only point from a later ring to the same or an earlier
/// one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Ring {
	User,
	RawDataFsm,
	MetaDataFsm,
	SuperblockExt,
	Superblock,
}

/// Cache client type of a metadata cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
	ObjectHeader,
	ObjectHeaderChunk,
	BtreeHeader,
	BtreeInternal,
	BtreeLeaf,
	ExtArrayHeader,
	ExtArrayIndexBlock,
	ExtArraySuperBlock,
	ExtArrayDataBlock,
	ExtArrayDataBlockPage,
	FixedArrayHeader,
	FixedArrayDataBlock,
	FixedArrayDataBlockPage,
	LocalHeap,
	GlobalHeap,
	FractalHeapHeader,
	FractalHeapBlock,
	FreeSpaceHeader,
	SharedMessageTable,
	Superblock,
	FreedSpace,
	ProxyEntry,
	EpochMarker,
	Prefetched,
}

/// What merging the page-buffer tick list did to the index.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickListCounts {
	/// Entries newly added to the index.
	pub added: u32,

	/// Existing entries refreshed from the tick list.
	pub modified: u32,

	/// Index entries with no counterpart in the tick list.
	pub not_in_tick_list: u32,

	/// Of those, entries that have already been flushed to the data file.
	pub not_in_tick_list_flushed: u32,
}

/// The page buffer: holds page images dirtied by the application, tracks
/// which pages changed during the current tick (the tick list), and holds
/// back writes to the data file that must wait out the lag window (the
/// delayed-write list).
pub trait PageBuffer {
	/// Tell the page buffer which tick is current.
	fn set_tick(&mut self, tick_num: u64) -> Result<()>;

	/// Merge the tick list into the index, adding and refreshing entries.
	fn update_index(&mut self, index: &mut Index, tick_num: u64) -> Result<TickListCounts>;

	/// Drop the tick list once the tick's publication no longer needs the
	/// page images.
	fn release_tick_list(&mut self) -> Result<()>;

	/// Perform any delayed writes whose delay has expired.
	fn release_delayed_writes(&mut self) -> Result<()>;

	/// Evict the page at byte address `addr`, if present.
	fn remove_entry(&mut self, addr: u64) -> Result<()>;

	/// Number of writes still held on the delayed-write list.
	fn delayed_write_len(&self) -> usize;
}

/// A metadata cache entry as seen by [`MetaCache::for_each_entry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheEntryInfo {
	pub addr: u64,
	pub kind: EntryKind,
	pub ring: Ring,
	pub dirty: bool,
}

/// Visitor over metadata cache entries.
pub trait EntryVisitor {
	fn visit(&mut self, entry: &CacheEntryInfo) -> Result<()>;
}

/// The metadata cache: holds decoded metadata entries built out of pages.
pub trait MetaCache {
	/// Flush every dirty entry down into the page buffer.
	fn flush(&mut self) -> Result<()>;

	/// Evict, or refresh from the page buffer, every entry that lives in
	/// the given data-file page.
	fn evict_or_refresh_all_entries_in_page(&mut self, page: u64, tick_num: u64) -> Result<()>;

	/// Whether the cache holds no dirty entries in `ring` or any earlier
	/// ring.
	fn is_clean(&self, ring: Ring) -> bool;

	/// Visit every entry currently in the cache.
	fn for_each_entry(&mut self, visitor: &mut dyn EntryVisitor) -> Result<()>;

	/// Make `child` flush before `parent` can be evicted.
	fn create_flush_dependency(&mut self, parent: u64, child: u64) -> Result<()>;

	fn entry_status(&self, addr: u64) -> Result<FlagSet<EntryStatus>>;

	fn entry_ring(&self, addr: u64) -> Result<Ring>;
}

/// The free-space manager for the inside of the shadow file.
pub trait ShadowFreeSpace {
	/// Allocate `size` bytes, or `None` when the shadow file is exhausted.
	fn alloc(&mut self, size: u64) -> Result<Option<u64>>;

	/// Return an extent to the pool.
	fn free(&mut self, addr: u64, size: u64) -> Result<()>;

	/// Tear down the manager at file close.
	fn close(&mut self) -> Result<()>;
}

/// The data-file side operations the writer drains at every end of tick,
/// before the metadata cache flush leaves the page buffer as the sole
/// holder of pending changes.
pub trait DataFile {
	/// Flush cached dataset storage.
	fn flush_datasets(&mut self) -> Result<()>;

	/// Flush raw data to the data file.
	fn flush_raw_data(&mut self) -> Result<()>;

	/// Release the data-file block aggregators.
	fn free_aggregators(&mut self) -> Result<()>;

	/// Truncate the data file through its driver.
	fn truncate(&mut self) -> Result<()>;

	/// Allocate a temporary (never persisted) address for `pages` pages.
	fn alloc_tmp(&mut self, pages: u64) -> Result<u64>;
}
