use std::path::PathBuf;

use crate::error::{Error, Result};

/// Fewer than 3 ticks of lag cannot cover a reader that loads the header
/// just before a publication and the index just after the next one.
pub const MIN_MAX_LAG: u32 = 3;

/// Options consumed when opening a file under shadow coordination.
///
/// The shadow path, the reserved size, and the cadence are required; the
/// writer flag decides which engine the open builds. Readers and the writer
/// of one data file must agree on `shadow_path` and should agree on
/// `md_pages_reserved`, since a reader sizes its index from its own
/// configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenOptions {
	/// Open as the single writer. Required for read-write opens.
	pub writer: bool,

	/// Path to the shadow metadata file; created by the writer, opened by
	/// readers.
	pub shadow_path: PathBuf,

	/// Pre-allocated size of the shadow file in pages; caps the index
	/// capacity.
	pub md_pages_reserved: u32,

	/// Tick duration in tenths of a second.
	pub tick_len: u32,

	/// How many ticks a superseded shadow extent stays reserved, and how
	/// long an overwrite of published data-file content is delayed.
	pub max_lag: u32,

	/// Also flush raw data to the data file on every tick.
	pub flush_raw_data: bool,
}

impl OpenOptions {
	pub fn new(writer: bool, shadow_path: impl Into<PathBuf>) -> Self {
		Self {
			writer,
			shadow_path: shadow_path.into(),
			md_pages_reserved: 32,
			tick_len: 4,
			max_lag: 7,
			flush_raw_data: false,
		}
	}

	pub fn with_md_pages_reserved(mut self, md_pages_reserved: u32) -> Self {
		self.md_pages_reserved = md_pages_reserved;
		self
	}

	pub fn with_tick_len(mut self, tick_len: u32) -> Self {
		self.tick_len = tick_len;
		self
	}

	pub fn with_max_lag(mut self, max_lag: u32) -> Self {
		self.max_lag = max_lag;
		self
	}

	pub fn with_flush_raw_data(mut self, flush_raw_data: bool) -> Self {
		self.flush_raw_data = flush_raw_data;
		self
	}

	/// Check the option set at open time.
	pub fn validate(&self) -> Result<()> {
		if self.max_lag < MIN_MAX_LAG {
			return Err(Error::Config(format!(
				"max_lag {} is below the minimum of {MIN_MAX_LAG}",
				self.max_lag
			)));
		}
		if self.tick_len == 0 {
			return Err(Error::Config("tick_len must be at least 1".into()));
		}
		if self.md_pages_reserved == 0 {
			return Err(Error::Config(
				"md_pages_reserved must be at least 1".into(),
			));
		}
		Ok(())
	}
}
