//! Whole-protocol scenarios over the in-memory backend: a writer publishing
//! ticks, readers reconciling against them, and the two meeting only
//! through the shadow-file bytes.

use std::{cell::RefCell, rc::Rc};

use futures_util::io::Cursor;
use shadow_swmr::{
	collab::{
		DataFile, EntryStatus, EntryVisitor, MetaCache, PageBuffer, Ring, ShadowFreeSpace,
		TickListCounts,
	},
	eot::{ApiDepth, EotQueue},
	error::{Error, Result},
	header::{ShadowHeader, HEADER_SIZE},
	index::{index_frame_len, Index, IndexEntry, IndexFrame},
	reader::{ReaderHooks, ShadowReader},
	writer::{OpenOptions, ShadowWriter, WriterHooks},
};

const PAGE_SIZE: u32 = 4096;

fn init_tracing() {
	use tracing_subscriber::{layer::SubscriberExt as _, util::SubscriberInitExt as _, EnvFilter};

	let _ = tracing_subscriber::registry()
		.with(
			EnvFilter::try_from_default_env()
				.unwrap_or_else(|_| EnvFilter::new("shadow_swmr=trace")),
		)
		.with(tracing_subscriber::fmt::layer().with_test_writer())
		.try_init();
}

#[derive(Default)]
struct PageBufferState {
	tick: u64,
	tick_list: Vec<(u64, Vec<u8>)>,
	delayed_writes: usize,
	removed: Vec<u64>,
	tick_list_releases: usize,
}

#[derive(Clone, Default)]
struct SharedPageBuffer(Rc<RefCell<PageBufferState>>);

impl SharedPageBuffer {
	fn stage(&self, page: u64, fill: u8) {
		self.0
			.borrow_mut()
			.tick_list
			.push((page, vec![fill; PAGE_SIZE as usize]));
	}
}

impl PageBuffer for SharedPageBuffer {
	fn set_tick(&mut self, tick_num: u64) -> Result<()> {
		self.0.borrow_mut().tick = tick_num;
		Ok(())
	}

	fn update_index(&mut self, index: &mut Index, tick_num: u64) -> Result<TickListCounts> {
		let mut state = self.0.borrow_mut();
		let mut counts = TickListCounts::default();

		let staged = std::mem::take(&mut state.tick_list);
		for (page, image) in staged {
			if let Some(entry) = index.lookup_mut(page) {
				entry.image = Some(image);
				entry.tick_of_last_change = tick_num;
				entry.clean = false;
				counts.modified += 1;
			} else {
				let length = image.len() as u32;
				let entry = index.insert(IndexEntry::new(page, length))?;
				entry.image = Some(image);
				entry.tick_of_last_change = tick_num;
				counts.added += 1;
			}
		}

		counts.not_in_tick_list =
			(index.len() as u32).saturating_sub(counts.added + counts.modified);
		Ok(counts)
	}

	fn release_tick_list(&mut self) -> Result<()> {
		let mut state = self.0.borrow_mut();
		state.tick_list.clear();
		state.tick_list_releases += 1;
		Ok(())
	}

	fn release_delayed_writes(&mut self) -> Result<()> {
		let mut state = self.0.borrow_mut();
		state.delayed_writes = state.delayed_writes.saturating_sub(1);
		Ok(())
	}

	fn remove_entry(&mut self, addr: u64) -> Result<()> {
		self.0.borrow_mut().removed.push(addr);
		Ok(())
	}

	fn delayed_write_len(&self) -> usize {
		self.0.borrow().delayed_writes
	}
}

#[derive(Default)]
struct MetaCacheState {
	flushes: usize,
	evicted: Vec<(u64, u64)>,
}

#[derive(Clone, Default)]
struct SharedMetaCache(Rc<RefCell<MetaCacheState>>);

impl MetaCache for SharedMetaCache {
	fn flush(&mut self) -> Result<()> {
		self.0.borrow_mut().flushes += 1;
		Ok(())
	}

	fn evict_or_refresh_all_entries_in_page(&mut self, page: u64, tick_num: u64) -> Result<()> {
		self.0.borrow_mut().evicted.push((page, tick_num));
		Ok(())
	}

	fn is_clean(&self, _ring: Ring) -> bool {
		true
	}

	fn for_each_entry(&mut self, _visitor: &mut dyn EntryVisitor) -> Result<()> {
		Ok(())
	}

	fn create_flush_dependency(&mut self, _parent: u64, _child: u64) -> Result<()> {
		Ok(())
	}

	fn entry_status(&self, _addr: u64) -> Result<flagset::FlagSet<EntryStatus>> {
		Ok(Default::default())
	}

	fn entry_ring(&self, _addr: u64) -> Result<Ring> {
		Ok(Ring::User)
	}
}

#[derive(Default)]
struct FreeSpaceState {
	eoa: u64,
	free: Vec<(u64, u64)>,
	allocs: Vec<(u64, u64)>,
	frees: Vec<(u64, u64)>,
	closed: bool,
}

/// First-fit allocator over the shadow file, with new space taken from the
/// end.
#[derive(Clone, Default)]
struct SharedFreeSpace(Rc<RefCell<FreeSpaceState>>);

impl ShadowFreeSpace for SharedFreeSpace {
	fn alloc(&mut self, size: u64) -> Result<Option<u64>> {
		let mut state = self.0.borrow_mut();

		let addr = if let Some(found) = state.free.iter().position(|&(_, len)| len >= size) {
			let (addr, len) = state.free[found];
			if len == size {
				state.free.remove(found);
			} else {
				state.free[found] = (addr + size, len - size);
			}
			addr
		} else {
			let addr = state.eoa;
			state.eoa += size;
			addr
		};

		state.allocs.push((addr, size));
		Ok(Some(addr))
	}

	fn free(&mut self, addr: u64, size: u64) -> Result<()> {
		let mut state = self.0.borrow_mut();
		state.free.push((addr, size));
		state.frees.push((addr, size));
		Ok(())
	}

	fn close(&mut self) -> Result<()> {
		self.0.borrow_mut().closed = true;
		Ok(())
	}
}

#[derive(Default)]
struct DataFileState {
	dataset_flushes: usize,
	aggregator_releases: usize,
	truncates: usize,
	raw_flushes: usize,
}

#[derive(Clone, Default)]
struct SharedDataFile(Rc<RefCell<DataFileState>>);

impl DataFile for SharedDataFile {
	fn flush_datasets(&mut self) -> Result<()> {
		self.0.borrow_mut().dataset_flushes += 1;
		Ok(())
	}

	fn flush_raw_data(&mut self) -> Result<()> {
		self.0.borrow_mut().raw_flushes += 1;
		Ok(())
	}

	fn free_aggregators(&mut self) -> Result<()> {
		self.0.borrow_mut().aggregator_releases += 1;
		Ok(())
	}

	fn truncate(&mut self) -> Result<()> {
		self.0.borrow_mut().truncates += 1;
		Ok(())
	}

	fn alloc_tmp(&mut self, _pages: u64) -> Result<u64> {
		Ok(1 << 40)
	}
}

#[derive(Clone, Default)]
struct Hooks {
	page_buffer: SharedPageBuffer,
	cache: SharedMetaCache,
	shadow_fs: SharedFreeSpace,
	data_file: SharedDataFile,
}

impl Hooks {
	fn for_writer(&self) -> WriterHooks {
		WriterHooks {
			page_buffer: Box::new(self.page_buffer.clone()),
			cache: Box::new(self.cache.clone()),
			shadow_fs: Box::new(self.shadow_fs.clone()),
			data_file: Box::new(self.data_file.clone()),
		}
	}

	fn for_reader(&self) -> ReaderHooks {
		ReaderHooks {
			page_buffer: Box::new(self.page_buffer.clone()),
			cache: Box::new(self.cache.clone()),
		}
	}
}

fn writer_options() -> OpenOptions {
	OpenOptions::new(true, "shadow.md")
		.with_md_pages_reserved(64)
		.with_tick_len(1)
		.with_max_lag(3)
}

async fn open_writer(
	queue: &mut EotQueue,
	options: OpenOptions,
	file_create: bool,
) -> (ShadowWriter<Cursor<Vec<u8>>>, Hooks) {
	init_tracing();
	let hooks = Hooks::default();
	let writer = ShadowWriter::open(
		Cursor::new(Vec::new()),
		PAGE_SIZE,
		options,
		hooks.for_writer(),
		file_create,
		queue,
	)
	.await
	.unwrap();
	(writer, hooks)
}

fn parse_published(image: &[u8]) -> (ShadowHeader, IndexFrame) {
	let header = ShadowHeader::parse(&image[..HEADER_SIZE as usize]).unwrap();
	let index_end = HEADER_SIZE + header.index_len;
	let frame = IndexFrame::parse(&image[HEADER_SIZE as usize..index_end as usize]).unwrap();
	(header, frame)
}

#[tokio::test(start_paused = true)]
async fn cold_writer_create_publishes_an_empty_index() {
	let mut queue = EotQueue::new();
	let (mut writer, _hooks) = open_writer(&mut queue, writer_options(), true).await;

	for _ in 0..3 {
		writer.end_of_tick(&mut queue).await.unwrap();
	}
	assert_eq!(writer.tick_num(), 4);

	// The file carries the last publication, made while tick 3 was current.
	let (header, frame) = parse_published(writer.io().get_ref());
	assert_eq!(header.page_size, PAGE_SIZE);
	assert_eq!(header.tick_num, 3);
	assert_eq!(frame.tick_num, 3);
	assert_eq!(frame.num_entries, 0);

	assert!(writer.delayed().is_empty());
	assert_eq!(queue.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn wrapping_an_existing_file_publishes_at_open() {
	let mut queue = EotQueue::new();
	let (writer, _hooks) = open_writer(&mut queue, writer_options(), false).await;

	let (header, frame) = parse_published(writer.io().get_ref());
	assert_eq!(header.tick_num, 1);
	assert_eq!(frame.num_entries, 0);
}

#[tokio::test(start_paused = true)]
async fn overwrite_keeps_the_old_extent_reserved_for_max_lag_ticks() {
	let mut queue = EotQueue::new();
	let (mut writer, hooks) = open_writer(&mut queue, writer_options(), true).await;

	// Tick 1 publishes page 100 for the first time.
	hooks.page_buffer.stage(100, 0xa1);
	writer.end_of_tick(&mut queue).await.unwrap();

	let first_shadow = writer.io().get_ref().clone();
	let offset_a = {
		let (_, frame) = parse_published(&first_shadow);
		assert_eq!(frame.entries[0].data_page_offset, 100);
		u64::from(frame.entries[0].shadow_page_offset)
	};
	// The first image lands just past the reserved region.
	assert_eq!(offset_a, 64);

	// Tick 2 dirties page 100 again.
	hooks.page_buffer.stage(100, 0xb2);
	writer.end_of_tick(&mut queue).await.unwrap();

	let offset_b = {
		let (_, frame) = parse_published(writer.io().get_ref());
		u64::from(frame.entries[0].shadow_page_offset)
	};
	assert_ne!(offset_b, offset_a);

	let superseded: Vec<(u64, u64)> = writer
		.delayed()
		.iter()
		.map(|e| (e.shadow_page_offset, e.tick_num))
		.collect();
	assert_eq!(superseded, vec![(offset_a, 2)]);

	// The published image still checksums against its index entry.
	{
		let image = writer.io().get_ref();
		let entry = writer.index().unwrap().lookup(100).unwrap();
		let start = (offset_b * u64::from(PAGE_SIZE)) as usize;
		let bytes = &image[start..start + entry.length as usize];
		assert_eq!(crc32fast::hash(bytes), entry.chksum);
		assert_eq!(bytes[0], 0xb2);
	}

	// Ticks 3 and 4: the old extent stays reserved.
	for _ in 0..2 {
		writer.end_of_tick(&mut queue).await.unwrap();
		assert!(hooks.shadow_fs.0.borrow().frees.is_empty());
		assert_eq!(writer.delayed().len(), 1);
	}

	// Tick 5 (= 2 + max_lag) releases it.
	writer.end_of_tick(&mut queue).await.unwrap();
	assert_eq!(
		hooks.shadow_fs.0.borrow().frees,
		vec![(offset_a * u64::from(PAGE_SIZE), u64::from(PAGE_SIZE))]
	);
	assert!(writer.delayed().is_empty());

	// Only now may the extent back a fresh allocation.
	hooks.page_buffer.stage(200, 0xc3);
	writer.end_of_tick(&mut queue).await.unwrap();
	let reused = writer.index().unwrap().lookup(200).unwrap().shadow_page_offset;
	assert_eq!(reused, offset_a);
}

#[tokio::test(start_paused = true)]
async fn tick_list_is_released_after_every_publication() {
	let mut queue = EotQueue::new();
	let (mut writer, hooks) = open_writer(&mut queue, writer_options(), true).await;

	hooks.page_buffer.stage(7, 0x01);
	writer.end_of_tick(&mut queue).await.unwrap();

	let state = hooks.page_buffer.0.borrow();
	assert!(state.tick_list.is_empty());
	assert_eq!(state.tick_list_releases, 1);
	assert_eq!(state.tick, 2);

	let data_file = hooks.data_file.0.borrow();
	assert_eq!(data_file.dataset_flushes, 1);
	assert_eq!(data_file.aggregator_releases, 1);
	assert_eq!(data_file.truncates, 1);
	assert_eq!(data_file.raw_flushes, 0);

	assert_eq!(hooks.cache.0.borrow().flushes, 1);
}

#[tokio::test(start_paused = true)]
async fn index_capacity_overflow_fails_the_tick_with_shadow_full() {
	let mut queue = EotQueue::new();
	let options = writer_options().with_md_pages_reserved(1);
	let (mut writer, hooks) = open_writer(&mut queue, options, true).await;

	// One reserved page caps the index at (4096 - 36) / 16 = 253 entries.
	for page in 0..254u64 {
		hooks.page_buffer.stage(page, 0x11);
	}

	assert!(matches!(
		writer.end_of_tick(&mut queue).await,
		Err(Error::ShadowFull(_))
	));
	// The failed tick was never published nor advanced.
	assert_eq!(writer.tick_num(), 1);
}

#[tokio::test(start_paused = true)]
async fn prep_for_flush_drains_the_delayed_write_list() {
	let mut queue = EotQueue::new();
	let (mut writer, hooks) = open_writer(&mut queue, writer_options(), true).await;

	hooks.page_buffer.0.borrow_mut().delayed_writes = 5;

	writer.prep_for_flush_or_close(&mut queue).await.unwrap();

	assert_eq!(hooks.page_buffer.0.borrow().delayed_writes, 0);
	// One forced end of tick plus one per waited tick.
	assert_eq!(writer.tick_num(), 6);
}

#[tokio::test(start_paused = true)]
async fn close_publishes_empty_then_unlinks() {
	let mut queue = EotQueue::new();
	let (mut writer, hooks) = open_writer(&mut queue, writer_options(), true).await;

	hooks.page_buffer.stage(3, 0x44);
	writer.end_of_tick(&mut queue).await.unwrap();
	assert_eq!(queue.len(), 1);

	writer.close(&mut queue).await.unwrap();

	assert!(queue.is_empty());
	assert!(hooks.shadow_fs.0.borrow().closed);
}

async fn publish_image(tick_num: u64, entries: &[(u64, u64)]) -> Vec<u8> {
	let mut io = Cursor::new(Vec::new());

	let entries: Vec<IndexEntry> = entries
		.iter()
		.map(|&(page, shadow)| {
			let mut entry = IndexEntry::new(page, PAGE_SIZE);
			entry.shadow_page_offset = shadow;
			entry
		})
		.collect();

	shadow_swmr::index::write_index(&mut io, tick_num, &entries)
		.await
		.unwrap();
	shadow_swmr::header::write_header(&mut io, PAGE_SIZE, tick_num, index_frame_len(entries.len()))
		.await
		.unwrap();
	io.into_inner()
}

fn reader_options() -> OpenOptions {
	OpenOptions::new(false, "shadow.md")
		.with_md_pages_reserved(64)
		.with_tick_len(1)
		.with_max_lag(3)
}

#[tokio::test(start_paused = true)]
async fn reader_catches_up_and_evicts_in_two_passes() {
	init_tracing();
	let mut queue = EotQueue::new();
	let hooks = Hooks::default();

	// The writer published page 42 at tick 7...
	let at_seven = publish_image(7, &[(42, 64), (90, 65)]).await;
	let mut reader = ShadowReader::open(
		Cursor::new(at_seven),
		PAGE_SIZE,
		reader_options(),
		hooks.for_reader(),
		&mut queue,
	)
	.await
	.unwrap();
	assert_eq!(reader.tick_num(), 7);

	// ...then moved it to a new shadow extent at tick 8.
	*reader.io_mut() = Cursor::new(publish_image(8, &[(42, 66), (90, 65)]).await);
	reader.end_of_tick(&mut queue).await.unwrap();

	assert_eq!(reader.tick_num(), 8);
	assert_eq!(
		hooks.page_buffer.0.borrow().removed,
		vec![42 * u64::from(PAGE_SIZE)]
	);
	assert_eq!(hooks.cache.0.borrow().evicted, vec![(42, 8)]);
	assert_eq!(queue.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn reader_with_an_unchanged_tick_reschedules_quietly() {
	let mut queue = EotQueue::new();
	let hooks = Hooks::default();

	let image = publish_image(3, &[(10, 64)]).await;
	let mut reader = ShadowReader::open(
		Cursor::new(image),
		PAGE_SIZE,
		reader_options(),
		hooks.for_reader(),
		&mut queue,
	)
	.await
	.unwrap();

	let before = reader.deadline();
	tokio::time::advance(std::time::Duration::from_millis(150)).await;
	reader.end_of_tick(&mut queue).await.unwrap();

	assert_eq!(reader.tick_num(), 3);
	assert!(hooks.page_buffer.0.borrow().removed.is_empty());
	assert!(reader.deadline() > before);
	assert_eq!(queue.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn reader_survives_a_torn_header_and_recovers() {
	let mut queue = EotQueue::new();
	let hooks = Hooks::default();

	let good = publish_image(7, &[(42, 64)]).await;
	let mut reader = ShadowReader::open(
		Cursor::new(good.clone()),
		PAGE_SIZE,
		reader_options(),
		hooks.for_reader(),
		&mut queue,
	)
	.await
	.unwrap();

	// Corrupt the header body under the reader.
	let mut torn = good.clone();
	torn[10] ^= 0xff;
	*reader.io_mut() = Cursor::new(torn);

	assert!(matches!(
		reader.end_of_tick(&mut queue).await,
		Err(Error::Corruption(_))
	));
	// Nothing was adopted or evicted.
	assert_eq!(reader.tick_num(), 7);
	assert_eq!(reader.index().len(), 1);
	assert!(hooks.page_buffer.0.borrow().removed.is_empty());

	// The next poll, over a repaired file, succeeds.
	*reader.io_mut() = Cursor::new(publish_image(8, &[(42, 66)]).await);
	reader.end_of_tick(&mut queue).await.unwrap();
	assert_eq!(reader.tick_num(), 8);
}

#[tokio::test(start_paused = true)]
async fn failed_catch_up_adopts_nothing() {
	let mut queue = EotQueue::new();
	let hooks = Hooks::default();

	let good = publish_image(7, &[(42, 64)]).await;
	let mut reader = ShadowReader::open(
		Cursor::new(good),
		PAGE_SIZE,
		reader_options(),
		hooks.for_reader(),
		&mut queue,
	)
	.await
	.unwrap();

	// The header now names tick 8, so the header-only poll succeeds, but
	// the index frame behind it is corrupt.
	let mut torn = publish_image(8, &[(42, 66)]).await;
	torn[HEADER_SIZE as usize + 4] ^= 0xff;
	*reader.io_mut() = Cursor::new(torn);

	assert!(matches!(
		reader.end_of_tick(&mut queue).await,
		Err(Error::Corruption(_))
	));

	// The reader still serves the tick it had, untouched.
	assert_eq!(reader.tick_num(), 7);
	assert_eq!(reader.index().lookup(42).unwrap().shadow_page_offset, 64);
	assert!(hooks.page_buffer.0.borrow().removed.is_empty());

	// A later, coherent publication is adopted normally.
	*reader.io_mut() = Cursor::new(publish_image(9, &[(42, 70)]).await);
	reader.end_of_tick(&mut queue).await.unwrap();
	assert_eq!(reader.tick_num(), 9);
	assert_eq!(reader.index().lookup(42).unwrap().shadow_page_offset, 70);
	assert_eq!(
		hooks.page_buffer.0.borrow().removed,
		vec![42 * u64::from(PAGE_SIZE)]
	);
}

#[tokio::test(start_paused = true)]
async fn an_oversized_publication_does_not_clobber_the_reader() {
	let mut queue = EotQueue::new();
	let hooks = Hooks::default();

	// Capacity from one reserved page is 253 entries.
	let mut reader = ShadowReader::open(
		Cursor::new(publish_image(4, &[(42, 64)]).await),
		PAGE_SIZE,
		reader_options().with_md_pages_reserved(1),
		hooks.for_reader(),
		&mut queue,
	)
	.await
	.unwrap();

	let entries: Vec<(u64, u64)> = (0..254u64).map(|page| (page, page + 64)).collect();
	*reader.io_mut() = Cursor::new(publish_image(5, &entries).await);

	assert!(matches!(
		reader.end_of_tick(&mut queue).await,
		Err(Error::ShadowFull(_))
	));
	assert_eq!(reader.tick_num(), 4);
	assert_eq!(reader.index().len(), 1);
	assert_eq!(reader.index().lookup(42).unwrap().shadow_page_offset, 64);
}

#[tokio::test(start_paused = true)]
async fn reader_rejects_a_publication_larger_than_its_index() {
	let mut queue = EotQueue::new();
	let hooks = Hooks::default();

	// 254 entries cannot fit an index sized from one reserved page.
	let entries: Vec<(u64, u64)> = (0..254u64).map(|page| (page, page + 64)).collect();
	let image = publish_image(2, &entries).await;

	let result = ShadowReader::open(
		Cursor::new(image),
		PAGE_SIZE,
		reader_options().with_md_pages_reserved(1),
		hooks.for_reader(),
		&mut queue,
	)
	.await;

	assert!(matches!(result, Err(Error::ShadowFull(_))));
	assert!(queue.is_empty());
}

#[tokio::test(start_paused = true)]
async fn due_files_process_in_deadline_order_and_reschedule() {
	let mut queue = EotQueue::new();

	let (mut writer, _writer_hooks) =
		open_writer(&mut queue, writer_options().with_tick_len(1), true).await;

	let reader_hooks = Hooks::default();
	let image = publish_image(1, &[]).await;
	let mut reader = ShadowReader::open(
		Cursor::new(image),
		PAGE_SIZE,
		reader_options().with_tick_len(2),
		reader_hooks.for_reader(),
		&mut queue,
	)
	.await
	.unwrap();

	assert_eq!(queue.len(), 2);
	assert!(queue.writer_at_head());

	// Let both deadlines pass, then enter the library the way a public
	// entry point does: acquire the re-entrance scope and drain the due
	// entries only from the outermost one.
	tokio::time::advance(std::time::Duration::from_millis(250)).await;
	let now = tokio::time::Instant::now();

	let depth = ApiDepth::new();
	let scope = depth.enter();

	{
		// A nested call sees due deadlines but must not fire ticks.
		let nested = depth.enter();
		assert!(queue.pop_due_scoped(&nested, now).is_none());
		assert_eq!(queue.len(), 2);
	}

	let mut processed = vec![];
	while let Some(due) = queue.pop_due_scoped(&scope, now) {
		processed.push(due.is_writer);
		if due.is_writer {
			writer.end_of_tick(&mut queue).await.unwrap();
		} else {
			reader.end_of_tick(&mut queue).await.unwrap();
		}
	}

	// The writer's deadline (1 tick) came before the reader's (2 ticks),
	// and both re-inserted themselves for the future.
	assert_eq!(processed, vec![true, false]);
	assert_eq!(queue.len(), 2);
	assert!(queue.head_deadline().unwrap() > now);
}
