pub use file_write::AsyncShadowWrite;
pub use options::{OpenOptions, MIN_MAX_LAG};

mod file_write;
mod options;

use tokio::time::Instant;

use crate::{
	chksum,
	collab::{DataFile, MetaCache, PageBuffer, ShadowFreeSpace},
	delayed::{DelayedExtent, DelayedList},
	eot::{EotEntry, EotQueue, FileId},
	error::{Error, Result},
	header,
	index::{self, Index},
	monotonic,
};

/// The collaborators a writer drives at every end of tick.
pub struct WriterHooks {
	pub page_buffer: Box<dyn PageBuffer>,
	pub cache: Box<dyn MetaCache>,
	pub shadow_fs: Box<dyn ShadowFreeSpace>,
	pub data_file: Box<dyn DataFile>,
}

/// The writer half of the coordination protocol.
///
/// One process holds the writer open. Every tick it flushes pending
/// metadata down into the page buffer, publishes the pages dirtied during
/// the tick into the shadow file, and defers reuse of superseded shadow
/// extents until no reader within the lag window can still need them.
pub struct ShadowWriter<T> {
	io: T,
	options: OpenOptions,
	page_size: u32,
	tick_num: u64,
	end_of_tick: Instant,
	file: FileId,
	index: Option<Index>,
	delayed: DelayedList,
	page_buffer: Box<dyn PageBuffer>,
	cache: Box<dyn MetaCache>,
	shadow_fs: Box<dyn ShadowFreeSpace>,
	data_file: Box<dyn DataFile>,
}

impl<T> std::fmt::Debug for ShadowWriter<T> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ShadowWriter")
			.field("options", &self.options)
			.field("io", &std::any::type_name::<T>())
			.field("tick_num", &self.tick_num)
			.field("index_len", &self.index.as_ref().map(Index::len))
			.field("delayed_len", &self.delayed.len())
			.finish()
	}
}

impl<T> ShadowWriter<T>
where
	T: AsyncShadowWrite,
{
	/// Open the writer side: create and size the shadow file, and schedule
	/// the first end of tick.
	///
	/// `file_create` is true when the data file itself is being created;
	/// when wrapping an existing data file, a header and an empty index are
	/// published immediately so readers have something to poll.
	pub async fn open(
		mut io: T,
		page_size: u32,
		options: OpenOptions,
		hooks: WriterHooks,
		file_create: bool,
		queue: &mut EotQueue,
	) -> Result<Self> {
		options.validate()?;
		if !options.writer {
			return Err(Error::Config("reader options handed to the writer".into()));
		}
		if !page_size.is_power_of_two() {
			return Err(Error::Config(format!(
				"page size {page_size} is not a power of two"
			)));
		}

		let WriterHooks {
			mut page_buffer,
			cache,
			mut shadow_fs,
			data_file,
		} = hooks;

		page_buffer.set_tick(1)?;

		io.create(&options.shadow_path).await?;

		// The header and index occupy the reserved front of the file; claim
		// it before any page image can be placed there.
		let md_size = u64::from(options.md_pages_reserved) * u64::from(page_size);
		let reserved = shadow_fs
			.alloc(md_size)?
			.ok_or(Error::ShadowFull("cannot reserve the shadow file front"))?;
		if reserved != 0 {
			return Err(Error::ShadowFreeSpace(format!(
				"front reservation landed at {reserved}, expected offset 0"
			)));
		}
		io.set_len(md_size).await?;

		let end_of_tick = monotonic::next_deadline(options.tick_len);
		let mut writer = Self {
			io,
			options,
			page_size,
			tick_num: 1,
			end_of_tick,
			file: FileId::next(),
			index: None,
			delayed: DelayedList::new(),
			page_buffer,
			cache,
			shadow_fs,
			data_file,
		};

		if !file_create {
			writer.publish_empty().await?;
		}

		queue.insert(writer.eot_entry());
		Ok(writer)
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

	pub fn index(&self) -> Option<&Index> {
		self.index.as_ref()
	}

	/// The shadow-file channel.
	pub fn io(&self) -> &T {
		&self.io
	}

	pub fn io_mut(&mut self) -> &mut T {
		&mut self.io
	}

	pub fn delayed(&self) -> &DelayedList {
		&self.delayed
	}

	fn eot_entry(&self) -> EotEntry {
		EotEntry {
			file: self.file,
			is_writer: true,
			tick_num: self.tick_num,
			deadline: self.end_of_tick,
		}
	}

	/// Run the writer's end of tick.
	///
	/// Any step failing fails the whole tick; the header write inside
	/// [`update_shadow_file`](Self::update_shadow_file) is the publication
	/// commit point, so a failed tick is invisible to readers and the next
	/// deadline retries from a consistent state.
	#[tracing::instrument(level = "debug", skip_all, fields(tick_num = self.tick_num))]
	pub async fn end_of_tick(&mut self, queue: &mut EotQueue) -> Result<()> {
		if self.options.flush_raw_data {
			self.data_file.flush_raw_data()?;
		}

		// Drain the dataset cache and the aggregators, then flush the
		// metadata cache, leaving the page buffer's tick list as the only
		// record of this tick's changes.
		self.data_file.flush_datasets()?;
		self.data_file.free_aggregators()?;
		self.cache.flush()?;
		self.data_file.truncate()?;

		let page_size = self.page_size;
		let md_pages_reserved = self.options.md_pages_reserved;
		let index = self
			.index
			.get_or_insert_with(|| Index::new(page_size, md_pages_reserved));

		let counts = self.page_buffer.update_index(index, self.tick_num)?;
		tracing::trace!(
			added = counts.added,
			modified = counts.modified,
			not_in_tick_list = counts.not_in_tick_list,
			"merged tick list into the index"
		);

		self.update_shadow_file().await?;

		// The publication no longer needs the page images.
		self.page_buffer.release_tick_list()?;
		self.page_buffer.release_delayed_writes()?;

		self.advance_tick()?;

		queue.remove(self.file);
		queue.insert(self.eot_entry());
		Ok(())
	}

	/// Publish the current index into the shadow file.
	///
	/// Page images are written first, then the index frame, then the header
	/// frame, so a reader that loads the header last can trust everything
	/// it points at. Superseded extents go onto the delayed list before
	/// their replacement is allocated, and extents whose reservation has
	/// outlived the lag window are returned to the free-space manager.
	#[tracing::instrument(level = "trace", skip_all)]
	async fn update_shadow_file(&mut self) -> Result<()> {
		let page_size = u64::from(self.page_size);
		let page_size_u32 = self.page_size;
		let md_pages_reserved = self.options.md_pages_reserved;
		let tick_num = self.tick_num;
		let max_lag = u64::from(self.options.max_lag);

		let Self {
			io,
			index,
			delayed,
			shadow_fs,
			..
		} = self;
		let index = index.get_or_insert_with(|| Index::new(page_size_u32, md_pages_reserved));

		index.sort();

		for entry in index.iter_used_mut() {
			if entry.image.is_none() {
				continue;
			}

			if entry.shadow_page_offset != 0 {
				delayed.push_superseded(DelayedExtent {
					data_page_offset: entry.data_page_offset,
					shadow_page_offset: entry.shadow_page_offset,
					length: entry.length,
					tick_num,
				});
			}

			let addr = shadow_fs.alloc(u64::from(entry.length))?.ok_or(
				Error::ShadowFull("no space left for a page image in the shadow file"),
			)?;
			entry.shadow_page_offset = addr / page_size;

			let image = entry.image.as_deref().unwrap_or_default();
			entry.chksum = chksum::crc32(image);
			io.seek_and_write(addr, image).await?;

			entry.image = None;
			entry.tick_of_last_flush = tick_num;
		}

		index::write_index(io, tick_num, index.as_slice()).await?;
		header::write_header(
			io,
			page_size_u32,
			tick_num,
			index::index_frame_len(index.len()),
		)
		.await?;

		delayed.reclaim_expired(tick_num, max_lag, |extent| {
			tracing::trace!(
				shadow_page_offset = extent.shadow_page_offset,
				superseded_at = extent.tick_num,
				"releasing an expired shadow extent"
			);
			shadow_fs.free(extent.shadow_page_offset * page_size, u64::from(extent.length))
		})?;

		Ok(())
	}

	/// The tick at which writing over `data_page_offset` in the data file
	/// is permitted.
	///
	/// A page absent from the index is treated as overwriting content a
	/// straggling reader may still fetch from the data file, so the full
	/// lag applies. 0 means the write may proceed now.
	pub fn delay_write(&self, data_page_offset: u64) -> Result<u64> {
		delay_write_until(
			self.index.as_ref(),
			self.tick_num,
			u64::from(self.options.max_lag),
			data_page_offset,
		)
	}

	/// Force an end of tick, then keep ticking until the page buffer's
	/// delayed-write list has drained.
	///
	/// Required before the page buffer can be flushed on a data-file flush
	/// or close; otherwise held-back writes would be issued early.
	#[tracing::instrument(level = "debug", skip_all)]
	pub async fn prep_for_flush_or_close(&mut self, queue: &mut EotQueue) -> Result<()> {
		self.end_of_tick(queue).await?;

		while self.page_buffer.delayed_write_len() > 0 {
			self.wait_a_tick(queue).await?;
		}

		Ok(())
	}

	/// Sleep one tick, then run the end of tick.
	async fn wait_a_tick(&mut self, queue: &mut EotQueue) -> Result<()> {
		let deadline = Instant::now() + monotonic::tick_duration(self.options.tick_len);
		monotonic::wait_until(deadline).await;
		self.end_of_tick(queue).await
	}

	/// Publish an empty index, then start a fresh tick.
	///
	/// Used after a data-file flush: the shadow file no longer advertises
	/// any page, because everything has reached the data file.
	#[tracing::instrument(level = "debug", skip_all, fields(tick_num = self.tick_num))]
	pub async fn flush(&mut self, queue: &mut EotQueue) -> Result<()> {
		self.publish_empty().await?;
		self.advance_tick()?;

		queue.remove(self.file);
		queue.insert(self.eot_entry());
		Ok(())
	}

	/// Close the writer: publish an empty index, then tear the shadow file
	/// down.
	///
	/// The shadow file carries no recoverable state, so it is unlinked even
	/// when an earlier close step failed; the first failure is reported.
	#[tracing::instrument(level = "debug", skip_all)]
	pub async fn close(mut self, queue: &mut EotQueue) -> Result<()> {
		let mut first_failure = None;

		if let Err(e) = self.publish_empty().await {
			first_failure = Some(e);
		}
		self.tick_num += 1;

		if let Err(e) = self.io.remove().await {
			first_failure.get_or_insert(Error::ShadowIo(e));
		}
		if let Err(e) = self.shadow_fs.close() {
			first_failure.get_or_insert(e);
		}

		self.delayed.clear();
		queue.remove(self.file);

		match first_failure {
			Some(e) => Err(e),
			None => Ok(()),
		}
	}

	/// Log a summary of the index.
	pub fn dump_index(&self) {
		let Some(index) = &self.index else {
			tracing::debug!("index not yet created");
			return;
		};

		tracing::debug!(used = index.len(), capacity = index.capacity(), "index");
		for (nth, entry) in index.iter_used().enumerate() {
			tracing::debug!(
				nth,
				data_page_offset = entry.data_page_offset,
				shadow_page_offset = entry.shadow_page_offset,
				length = entry.length,
				"index entry"
			);
		}
	}

	async fn publish_empty(&mut self) -> Result<()> {
		index::write_index(&mut self.io, self.tick_num, &[]).await?;
		header::write_header(
			&mut self.io,
			self.page_size,
			self.tick_num,
			index::index_frame_len(0),
		)
		.await?;
		Ok(())
	}

	fn advance_tick(&mut self) -> Result<()> {
		self.tick_num += 1;
		self.page_buffer.set_tick(self.tick_num)?;
		self.end_of_tick = monotonic::next_deadline(self.options.tick_len);
		Ok(())
	}
}

/// The delay-write oracle, on its own for the benefit of both the method
/// above and the page buffer's bookkeeping.
pub fn delay_write_until(
	index: Option<&Index>,
	tick_num: u64,
	max_lag: u64,
	data_page_offset: u64,
) -> Result<u64> {
	let entry = index.and_then(|index| index.lookup(data_page_offset));

	let until = match entry {
		None => tick_num + max_lag,
		Some(e) if e.delayed_flush >= tick_num => e.delayed_flush,
		Some(_) => 0,
	};

	if until != 0 && !(tick_num..=tick_num + max_lag).contains(&until) {
		return Err(Error::OutOfRange {
			until,
			tick: tick_num,
		});
	}

	Ok(until)
}
