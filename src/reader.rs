pub use file_read::AsyncShadowRead;

mod file_read;

use std::mem;

use tokio::time::Instant;

use crate::{
	collab::{MetaCache, PageBuffer},
	eot::{EotEntry, EotQueue, FileId},
	error::{Error, Result},
	header::{ShadowHeader, HEADER_SIZE},
	index::{Index, IndexFrame, OnDiskEntry},
	monotonic,
	writer::OpenOptions,
};

/// How often a load is re-attempted when it observes a publication in
/// flight before the disagreement is reported as corruption.
const TORN_LOAD_RETRIES: usize = 5;

/// Read the shadow-file header, and optionally the index, verifying both.
///
/// The tick number is encoded in both frames; the writer updates the index
/// before the header, so a reader racing a publication can observe a fresh
/// header next to a stale index (or a half-written frame that fails its
/// CRC). Both states are torn reads: the load is retried a bounded number
/// of times before [`Error::Corruption`] surfaces.
#[tracing::instrument(level = "trace", skip(io))]
pub async fn get_tick_and_idx<R: AsyncShadowRead>(
	io: &mut R,
	load_index: bool,
) -> Result<(u64, Option<Vec<OnDiskEntry>>)> {
	let mut torn = None;

	for _ in 0..TORN_LOAD_RETRIES {
		match load_once(io, load_index).await {
			Ok(loaded) => return Ok(loaded),
			Err(e @ Error::Corruption(_)) => {
				tracing::trace!(error = %e, "torn shadow file load, retrying");
				torn = Some(e);
			}
			Err(e) => return Err(e),
		}
	}

	Err(torn.unwrap_or_else(|| Error::corrupt("shadow file load retries exhausted")))
}

async fn load_once<R: AsyncShadowRead>(
	io: &mut R,
	load_index: bool,
) -> Result<(u64, Option<Vec<OnDiskEntry>>)> {
	let header = ShadowHeader::read(io).await?;
	if !load_index {
		return Ok((header.tick_num, None));
	}

	let bytes = io
		.read_exact_at(HEADER_SIZE, header.index_len as usize)
		.await?;
	let frame = IndexFrame::parse(&bytes)?;

	if frame.tick_num != header.tick_num {
		return Err(Error::corrupt(format_args!(
			"header names tick {} but the index names tick {}",
			header.tick_num, frame.tick_num
		)));
	}

	Ok((header.tick_num, Some(frame.entries)))
}

/// The collaborators a reader reconciles at every end of tick.
pub struct ReaderHooks {
	pub page_buffer: Box<dyn PageBuffer>,
	pub cache: Box<dyn MetaCache>,
}

/// The reader half of the coordination protocol.
///
/// Any number of processes hold readers open. Each polls the shadow file's
/// header on its own tick cadence; when the published tick advances, the
/// reader diffs the fresh index against the one it was using and drops or
/// refreshes every cached page whose backing moved.
pub struct ShadowReader<T> {
	io: T,
	options: OpenOptions,
	page_size: u32,
	tick_num: u64,
	end_of_tick: Instant,
	file: FileId,
	index: Index,
	old_index: Option<Index>,
	page_buffer: Box<dyn PageBuffer>,
	cache: Box<dyn MetaCache>,
}

impl<T> std::fmt::Debug for ShadowReader<T> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ShadowReader")
			.field("options", &self.options)
			.field("io", &std::any::type_name::<T>())
			.field("tick_num", &self.tick_num)
			.field("index_len", &self.index.len())
			.finish()
	}
}

impl<T> ShadowReader<T>
where
	T: AsyncShadowRead,
{
	/// Open the reader side: load the published tick and index, and
	/// schedule the first end of tick.
	///
	/// The index is sized from this reader's own configuration; a
	/// publication larger than that fails with [`Error::ShadowFull`].
	pub async fn open(
		mut io: T,
		page_size: u32,
		options: OpenOptions,
		hooks: ReaderHooks,
		queue: &mut EotQueue,
	) -> Result<Self> {
		options.validate()?;
		if options.writer {
			return Err(Error::Config("writer options handed to a reader".into()));
		}
		if !page_size.is_power_of_two() {
			return Err(Error::Config(format!(
				"page size {page_size} is not a power of two"
			)));
		}

		io.open(&options.shadow_path).await?;

		let mut index = Index::new(page_size, options.md_pages_reserved);
		let (tick_num, entries) = get_tick_and_idx(&mut io, true).await?;
		index.replace_from_disk(&entries.unwrap_or_default())?;

		let end_of_tick = monotonic::next_deadline(options.tick_len);
		let reader = Self {
			io,
			options,
			page_size,
			tick_num,
			end_of_tick,
			file: FileId::next(),
			index,
			old_index: None,
			page_buffer: hooks.page_buffer,
			cache: hooks.cache,
		};

		queue.insert(reader.eot_entry());
		Ok(reader)
	}

	pub fn tick_num(&self) -> u64 {
		self.tick_num
	}

	pub fn file_id(&self) -> FileId {
		self.file
	}

	pub fn deadline(&self) -> Instant {
		self.end_of_tick
	}

	pub fn index(&self) -> &Index {
		&self.index
	}

	/// The shadow-file channel.
	pub fn io(&self) -> &T {
		&self.io
	}

	pub fn io_mut(&mut self) -> &mut T {
		&mut self.io
	}

	fn eot_entry(&self) -> EotEntry {
		EotEntry {
			file: self.file,
			is_writer: false,
			tick_num: self.tick_num,
			deadline: self.end_of_tick,
		}
	}

	/// Run the reader's end of tick.
	///
	/// Polls the header; an unchanged tick re-schedules quietly. On a tick
	/// advance the stale pages are dropped in two ordered passes: first
	/// from the page buffer, then from the metadata cache, because a cache
	/// refresh may refetch through the page buffer. Failures surface
	/// without adopting the new tick, so the next deadline retries.
	#[tracing::instrument(level = "debug", skip_all, fields(tick_num = self.tick_num))]
	pub async fn end_of_tick(&mut self, queue: &mut EotQueue) -> Result<()> {
		let (polled_tick, _) = get_tick_and_idx(&mut self.io, false).await?;

		if polled_tick != self.tick_num {
			self.catch_up().await?;
		}

		self.end_of_tick = monotonic::next_deadline(self.options.tick_len);
		queue.remove(self.file);
		queue.insert(self.eot_entry());
		Ok(())
	}

	async fn catch_up(&mut self) -> Result<()> {
		// Stage the incoming index in the recycled spare allocation. The
		// live index and tick are committed only once every fallible step
		// has succeeded, so a failed catch-up leaves the reader exactly as
		// it was and the next deadline retries.
		let page_size = self.page_size;
		let md_pages_reserved = self.options.md_pages_reserved;
		let mut incoming = self
			.old_index
			.take()
			.unwrap_or_else(|| Index::new(page_size, md_pages_reserved));

		let loaded = get_tick_and_idx(&mut self.io, true)
			.await
			.and_then(|(new_tick, entries)| {
				incoming.replace_from_disk(&entries.unwrap_or_default())?;
				Ok(new_tick)
			});
		let new_tick = match loaded {
			Ok(new_tick) => new_tick,
			Err(e) => {
				self.old_index = Some(incoming);
				return Err(e);
			}
		};

		let diff = superseded_pages(&self.index, &incoming);
		tracing::trace!(
			new_tick,
			changed = diff.changed,
			removed = diff.removed,
			added = diff.added,
			"caught up with a publication"
		);

		if let Err(e) = self.evict_stale(&diff.pages, new_tick) {
			self.old_index = Some(incoming);
			return Err(e);
		}

		self.old_index = Some(mem::replace(&mut self.index, incoming));
		self.tick_num = new_tick;
		Ok(())
	}

	/// Two ordered passes over the stale pages: the page buffer drops them
	/// first, then the cache evicts or refreshes, because a refresh may
	/// refetch through the page buffer. Evictions are idempotent, so a
	/// failure part-way is safe to re-run on the retry.
	fn evict_stale(&mut self, pages: &[u64], new_tick: u64) -> Result<()> {
		for page in pages {
			self.page_buffer
				.remove_entry(page * u64::from(self.page_size))?;
		}
		for page in pages {
			self.cache
				.evict_or_refresh_all_entries_in_page(*page, new_tick)?;
		}
		Ok(())
	}

	/// Close the reader and drop its schedule entry.
	pub async fn close(mut self, queue: &mut EotQueue) {
		self.io.close().await;
		queue.remove(self.file);
	}
}

#[derive(Debug, Default, PartialEq, Eq)]
struct IndexDiff {
	/// Data-file pages whose shadow backing moved or vanished, ascending.
	pages: Vec<u64>,
	changed: u32,
	removed: u32,
	added: u32,
}

/// Merge walk of two sorted indexes.
///
/// A page in both with a different shadow offset was updated; a page only
/// in the old index was removed; both must be evicted. A page only in the
/// new index needs no action.
fn superseded_pages(old: &Index, new: &Index) -> IndexDiff {
	let old = old.as_slice();
	let new = new.as_slice();
	let mut diff = IndexDiff::default();

	let (mut i, mut j) = (0, 0);
	while i < old.len() && j < new.len() {
		let (o, n) = (&old[i], &new[j]);

		if o.data_page_offset == n.data_page_offset {
			if o.shadow_page_offset != n.shadow_page_offset {
				diff.changed += 1;
				diff.pages.push(o.data_page_offset);
			}
			i += 1;
			j += 1;
		} else if o.data_page_offset < n.data_page_offset {
			diff.removed += 1;
			diff.pages.push(o.data_page_offset);
			i += 1;
		} else {
			diff.added += 1;
			j += 1;
		}
	}

	while i < old.len() {
		diff.removed += 1;
		diff.pages.push(old[i].data_page_offset);
		i += 1;
	}
	diff.added += (new.len() - j) as u32;

	diff
}
