use deku::prelude::*;

use crate::{
	chksum,
	error::{Error, Result},
	reader::AsyncShadowRead,
	writer::AsyncShadowWrite,
};

/// Size of the header frame in bytes: magic, page size, tick number, header
/// size, index length, checksum.
pub const HEADER_SIZE: u64 = 4 + 4 + 8 + 8 + 8 + 4;

/// The shadow-file header frame, written at offset 0 on every publication.
///
/// The header is the commit point of a tick: the writer publishes page
/// images first, then the index frame, then this header, so a reader that
/// loads the header last observes an index whose referenced extents are
/// already persisted. The tick number appears in both the header and the
/// index frame; a reader that races a publication detects the torn state by
/// the disagreement and re-reads.
#[derive(Debug, Clone, PartialEq, Eq, DekuRead, DekuWrite)]
#[deku(endian = "little", magic = b"HDR\0")]
pub struct ShadowHeader {
	/// Page size shared by the data file and the shadow file.
	pub page_size: u32,

	/// The tick this header publishes.
	pub tick_num: u64,

	/// Size of this frame; always [`HEADER_SIZE`].
	pub header_size: u64,

	/// Length in bytes of the index frame that follows the header.
	pub index_len: u64,

	/// CRC-32 of the preceding 32 bytes.
	pub chksum: u32,
}

impl ShadowHeader {
	pub fn new(page_size: u32, tick_num: u64, index_len: u64) -> Self {
		Self {
			page_size,
			tick_num,
			header_size: HEADER_SIZE,
			index_len,
			chksum: 0,
		}
	}

	/// Encode and seal the frame.
	pub fn to_frame(&self) -> Result<Vec<u8>> {
		let mut bytes = self
			.to_bytes()
			.map_err(|e| Error::ShadowIo(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;
		chksum::seal(&mut bytes);
		Ok(bytes)
	}

	/// Decode a frame, verifying checksum, magic, and the size constant.
	pub fn parse(bytes: &[u8]) -> Result<Self> {
		if bytes.len() != HEADER_SIZE as usize {
			return Err(Error::corrupt(format_args!(
				"header frame is {} bytes, expected {HEADER_SIZE}",
				bytes.len()
			)));
		}
		if !chksum::verify(bytes) {
			return Err(Error::corrupt("header checksum mismatch"));
		}

		let (_, header) = Self::from_bytes((bytes, 0))
			.map_err(|e| Error::corrupt(format_args!("header frame: {e}")))?;

		if header.header_size != HEADER_SIZE {
			return Err(Error::corrupt(format_args!(
				"header names its own size as {}, expected {HEADER_SIZE}",
				header.header_size
			)));
		}

		Ok(header)
	}

	/// Read and decode the header at the front of the shadow file.
	#[tracing::instrument(level = "trace", skip(io))]
	pub async fn read<R: AsyncShadowRead>(io: &mut R) -> Result<Self> {
		let bytes = io.read_exact_at(0, HEADER_SIZE as usize).await?;
		Self::parse(&bytes)
	}
}

/// Seek to offset 0 and write a sealed header frame.
#[tracing::instrument(level = "trace", skip(io))]
pub async fn write_header<W: AsyncShadowWrite>(
	io: &mut W,
	page_size: u32,
	tick_num: u64,
	index_len: u64,
) -> Result<()> {
	let frame = ShadowHeader::new(page_size, tick_num, index_len).to_frame()?;
	io.seek_and_write(0, &frame).await?;
	Ok(())
}
