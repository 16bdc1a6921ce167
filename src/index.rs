use deku::prelude::*;

use crate::{
	chksum,
	error::{Error, Result},
	header::HEADER_SIZE,
	writer::AsyncShadowWrite,
};

/// Size of one index entry as encoded in the index frame.
pub const INDEX_ENTRY_SIZE: u64 = 16;

/// Fixed bytes of an index frame: magic, tick number, entry count, checksum.
const INDEX_FRAME_OVERHEAD: u64 = 4 + 8 + 4 + 4;

/// Length in bytes of an index frame holding `num_entries` entries.
pub fn index_frame_len(num_entries: usize) -> u64 {
	INDEX_FRAME_OVERHEAD + INDEX_ENTRY_SIZE * num_entries as u64
}

/// One index entry as published in the shadow file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, DekuRead, DekuWrite)]
#[deku(endian = "endian", ctx = "endian: deku::ctx::Endian")]
pub struct OnDiskEntry {
	/// Page offset of the entry in the data file.
	pub data_page_offset: u32,

	/// Page offset of the entry's current image in the shadow file.
	pub shadow_page_offset: u32,

	/// Length of the entry in bytes; a multiple of the page size.
	pub length: u32,

	/// CRC-32 of the entry bytes as written to the shadow file.
	pub chksum: u32,
}

/// The index frame, written immediately after the header on every
/// publication.
///
/// The tick number must equal the header's; a disagreement marks a torn
/// publication in progress.
#[derive(Debug, Clone, PartialEq, Eq, DekuRead, DekuWrite)]
#[deku(endian = "little", magic = b"IDX\0")]
pub struct IndexFrame {
	pub tick_num: u64,

	pub num_entries: u32,

	#[deku(count = "num_entries")]
	pub entries: Vec<OnDiskEntry>,

	/// CRC-32 of the preceding bytes.
	pub chksum: u32,
}

impl IndexFrame {
	/// Encode and seal the frame.
	pub fn to_frame(&self) -> Result<Vec<u8>> {
		let mut bytes = self
			.to_bytes()
			.map_err(|e| Error::ShadowIo(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;
		chksum::seal(&mut bytes);
		Ok(bytes)
	}

	/// Decode a frame, verifying checksum and magic.
	pub fn parse(bytes: &[u8]) -> Result<Self> {
		if !chksum::verify(bytes) {
			return Err(Error::corrupt("index checksum mismatch"));
		}

		let ((rest, _), frame) = Self::from_bytes((bytes, 0))
			.map_err(|e| Error::corrupt(format_args!("index frame: {e}")))?;

		if !rest.is_empty() || bytes.len() as u64 != index_frame_len(frame.entries.len()) {
			return Err(Error::corrupt(format_args!(
				"index frame is {} bytes, expected {} for {} entries",
				bytes.len(),
				index_frame_len(frame.entries.len()),
				frame.entries.len()
			)));
		}

		Ok(frame)
	}
}

/// One entry of the in-memory index.
///
/// The published fields are widened to `u64`; `image` holds bytes the writer
/// has yet to publish, and is consumed the moment the entry is written to
/// the shadow file.
#[derive(Debug, Clone, Default)]
pub struct IndexEntry {
	/// Page offset of the entry in the data file. Unique within the index.
	pub data_page_offset: u64,

	/// Page offset of the entry's current image in the shadow file, or 0
	/// before first publication.
	pub shadow_page_offset: u64,

	/// Length of the entry in bytes; a multiple of the page size.
	pub length: u32,

	/// CRC-32 of the image as last published.
	pub chksum: u32,

	/// Bytes awaiting publication this tick, if any.
	pub image: Option<Vec<u8>>,

	pub tick_of_last_change: u64,
	pub tick_of_last_flush: u64,

	/// The earliest tick at which writing over the data-file page is
	/// permitted, when a delay is in force.
	pub delayed_flush: u64,

	pub clean: bool,
	pub moved_to_data_file: bool,
}

impl IndexEntry {
	pub fn new(data_page_offset: u64, length: u32) -> Self {
		Self {
			data_page_offset,
			length,
			..Self::default()
		}
	}

	/// Whether the writer holds bytes to publish for this entry.
	pub fn is_pending(&self) -> bool {
		self.image.is_some()
	}

	fn to_disk(&self) -> Result<OnDiskEntry> {
		let narrow = |v: u64| {
			u32::try_from(v).map_err(|_| {
				Error::ShadowIo(std::io::Error::new(
					std::io::ErrorKind::InvalidData,
					format!("page offset {v} does not fit the on-disk entry"),
				))
			})
		};

		Ok(OnDiskEntry {
			data_page_offset: narrow(self.data_page_offset)?,
			shadow_page_offset: narrow(self.shadow_page_offset)?,
			length: self.length,
			chksum: self.chksum,
		})
	}

	fn from_disk(disk: &OnDiskEntry) -> Self {
		Self {
			data_page_offset: disk.data_page_offset.into(),
			shadow_page_offset: disk.shadow_page_offset.into(),
			length: disk.length,
			chksum: disk.chksum,
			..Self::default()
		}
	}
}

/// The in-memory index: a fixed-capacity vector of entries, sorted by
/// data-file page offset whenever a reader can observe a publication built
/// from it.
///
/// Capacity is what fits in the reserved front of the shadow file after the
/// header. Exceeding it fails with [`Error::ShadowFull`]; growing the index
/// past its reservation is out of scope for this cut.
#[derive(Debug)]
pub struct Index {
	entries: Vec<IndexEntry>,
	capacity: usize,
}

impl Index {
	pub fn new(page_size: u32, md_pages_reserved: u32) -> Self {
		let bytes_available =
			(u64::from(page_size) * u64::from(md_pages_reserved)).saturating_sub(HEADER_SIZE);
		let capacity = (bytes_available / INDEX_ENTRY_SIZE) as usize;

		Self {
			entries: Vec::new(),
			capacity,
		}
	}

	pub fn capacity(&self) -> usize {
		self.capacity
	}

	pub fn len(&self) -> usize {
		self.entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	/// Binary search by data-file page offset.
	///
	/// Valid whenever the sorted invariant holds, which is everywhere
	/// outside a bulk merge that has not been followed by [`sort`](Self::sort).
	pub fn lookup(&self, data_page_offset: u64) -> Option<&IndexEntry> {
		self.position(data_page_offset).map(|at| &self.entries[at])
	}

	pub fn lookup_mut(&mut self, data_page_offset: u64) -> Option<&mut IndexEntry> {
		self.position(data_page_offset)
			.map(|at| &mut self.entries[at])
	}

	fn position(&self, data_page_offset: u64) -> Option<usize> {
		self.entries
			.binary_search_by_key(&data_page_offset, |e| e.data_page_offset)
			.ok()
	}

	/// Append an entry, failing with [`Error::ShadowFull`] at capacity.
	///
	/// Appends do not maintain the sort; call [`sort`](Self::sort) after a
	/// bulk update.
	pub fn insert(&mut self, entry: IndexEntry) -> Result<&mut IndexEntry> {
		if self.entries.len() >= self.capacity {
			return Err(Error::ShadowFull("index is at capacity"));
		}

		let at = self.entries.len();
		self.entries.push(entry);
		Ok(&mut self.entries[at])
	}

	/// Restore the sorted-ascending invariant after a bulk update.
	pub fn sort(&mut self) {
		self.entries.sort_by_key(|e| e.data_page_offset);
	}

	pub fn iter_used(&self) -> impl Iterator<Item = &IndexEntry> {
		self.entries.iter()
	}

	pub fn iter_used_mut(&mut self) -> impl Iterator<Item = &mut IndexEntry> {
		self.entries.iter_mut()
	}

	pub fn as_slice(&self) -> &[IndexEntry] {
		&self.entries
	}

	/// Replace the contents with a published index, as loaded by a reader.
	///
	/// Fails with [`Error::ShadowFull`] when the publication holds more
	/// entries than this index was configured for.
	pub fn replace_from_disk(&mut self, disk: &[OnDiskEntry]) -> Result<()> {
		if disk.len() > self.capacity {
			return Err(Error::ShadowFull(
				"published index exceeds this reader's configured capacity",
			));
		}

		self.entries.clear();
		self.entries.extend(disk.iter().map(IndexEntry::from_disk));
		Ok(())
	}

	pub fn clear(&mut self) {
		self.entries.clear();
	}
}

/// Seek past the header and write a sealed index frame for `entries`.
#[tracing::instrument(level = "trace", skip(io, entries))]
pub async fn write_index<W: AsyncShadowWrite>(
	io: &mut W,
	tick_num: u64,
	entries: &[IndexEntry],
) -> Result<()> {
	let disk = entries
		.iter()
		.map(IndexEntry::to_disk)
		.collect::<Result<Vec<_>>>()?;

	let frame = IndexFrame {
		tick_num,
		num_entries: disk.len() as u32,
		entries: disk,
		chksum: 0,
	}
	.to_frame()?;

	io.seek_and_write(HEADER_SIZE, &frame).await?;
	Ok(())
}
