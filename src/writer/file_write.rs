use std::{io::SeekFrom, path::Path};

use futures_io::AsyncWrite;
use futures_util::io::{AsyncSeekExt, AsyncWriteExt};

use crate::reader::AsyncShadowRead;

/// Byte-level write access to a shadow metadata file.
///
/// The writer owns the shadow file for the lifetime of the open: it creates
/// the file, publishes into it every tick, and unlinks it on close.
pub trait AsyncShadowWrite: AsyncShadowRead + AsyncWrite {
	/// Create (or truncate) the shadow file and open it read-write.
	fn create(
		&mut self,
		path: &Path,
	) -> impl std::future::Future<Output = std::io::Result<()>> + Send;

	/// Resize the shadow file to exactly `len` bytes.
	fn set_len(&mut self, len: u64) -> impl std::future::Future<Output = std::io::Result<()>> + Send;

	/// Close and unlink the shadow file.
	fn remove(&mut self) -> impl std::future::Future<Output = std::io::Result<()>> + Send;

	/// Whether the current file is writable.
	///
	/// `None` if no file is open.
	fn writeable(&self) -> Option<bool>;

	/// Positioned write of a frame or page image.
	///
	/// A short write surfaces as an error rather than partial success.
	#[allow(async_fn_in_trait)]
	async fn seek_and_write(&mut self, offset: u64, bytes: &[u8]) -> std::io::Result<()>
	where
		Self: Unpin,
	{
		self.seek(SeekFrom::Start(offset)).await?;
		self.write_all(bytes).await?;
		Ok(())
	}
}
