use std::{io::SeekFrom, path::Path};

use futures_util::io::{AsyncReadExt, AsyncSeekExt};

/// Byte-level read access to a shadow metadata file.
///
/// Readers poll the shadow file through this trait. The header and index
/// codecs sit on top of it; implementations only provide positioned reads
/// plus open/close of the backing file.
pub trait AsyncShadowRead: AsyncReadExt + AsyncSeekExt + Unpin {
	/// Open a shadow file for reading.
	///
	/// This should close the current file (if any).
	fn open(
		&mut self,
		path: &Path,
	) -> impl std::future::Future<Output = std::io::Result<()>> + Send;

	/// Close the current file (if any).
	fn close(&mut self) -> impl std::future::Future<Output = ()> + Send;

	/// The path to the current file, if one is open.
	fn current(&self) -> Option<&Path>;

	/// For internal use only.
	#[allow(async_fn_in_trait)]
	#[doc(hidden)]
	async fn read_exact_at(&mut self, offset: u64, len: usize) -> std::io::Result<Vec<u8>>
	where
		Self: Unpin,
	{
		self.seek(SeekFrom::Start(offset)).await?;
		let mut buf = vec![0; len];
		self.read_exact(&mut buf).await?;
		Ok(buf)
	}
}
