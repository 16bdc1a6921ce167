use std::io;

/// Errors surfaced by the tick engines and the shadow-file codec.
///
/// Every step of a writer or reader end-of-tick propagates its error to the
/// caller and leaves the file state consistent for a retry on the next
/// deadline. The header write is the commit point of a publication, so a
/// failed tick is never partially visible to readers.
#[derive(Debug, thiserror::Error)]
pub enum Error {
	/// Open, seek, read, write, truncate, or unlink of the shadow file failed.
	#[error("shadow file i/o: {0}")]
	ShadowIo(#[from] io::Error),

	/// The index or the shadow-file space is exhausted.
	#[error("shadow file full: {0}")]
	ShadowFull(&'static str),

	/// A magic or checksum mismatch while decoding a shadow-file frame.
	///
	/// Readers treat this as retriable: the writer may have been mid
	/// publication. Persistent corruption surfaces as a read failure.
	#[error("shadow file corrupt: {0}")]
	Corruption(String),

	/// A page buffer operation failed.
	#[error("page buffer: {0}")]
	PageBuffer(String),

	/// A metadata cache operation failed.
	#[error("metadata cache: {0}")]
	MetaCache(String),

	/// A shadow-file free-space manager operation failed.
	#[error("shadow free-space manager: {0}")]
	ShadowFreeSpace(String),

	/// The delay-write oracle computed a tick outside the permitted window.
	#[error("write delay until tick {until} out of range for tick {tick}")]
	OutOfRange { until: u64, tick: u64 },

	/// A data-file side operation (dataset flush, aggregator release,
	/// driver truncate, temporary allocation) failed.
	#[error("data file: {0}")]
	DataFile(String),

	/// The options supplied at open time are unusable.
	#[error("invalid configuration: {0}")]
	Config(String),
}

impl Error {
	pub(crate) fn corrupt(what: impl std::fmt::Display) -> Self {
		Self::Corruption(what.to_string())
	}
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
