use std::{
	io,
	path::{Path, PathBuf},
	pin::Pin,
	task::Poll,
};

use futures_io::{AsyncRead, AsyncSeek, AsyncWrite};
use tokio::{fs::File, io::ReadBuf};

use crate::{reader::AsyncShadowRead, writer::AsyncShadowWrite};

struct OpenFile {
	path: PathBuf,
	file: File,
	writeable: bool,
}

/// A shadow file on the local file system, via tokio.
#[derive(Default)]
pub struct ShadowOnDisk {
	open: Option<OpenFile>,
}

impl ShadowOnDisk {
	pub fn new() -> Self {
		Self::default()
	}

	fn require_open(&mut self) -> io::Result<&mut OpenFile> {
		self.open
			.as_mut()
			.ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "no shadow file open"))
	}
}

impl AsyncShadowRead for ShadowOnDisk {
	fn open(&mut self, path: &Path) -> impl std::future::Future<Output = io::Result<()>> + Send {
		async move {
			let file = File::open(path).await?;
			self.open = Some(OpenFile {
				path: path.to_path_buf(),
				file,
				writeable: false,
			});
			Ok(())
		}
	}

	fn close(&mut self) -> impl std::future::Future<Output = ()> + Send {
		async move {
			self.open = None;
		}
	}

	fn current(&self) -> Option<&Path> {
		self.open.as_ref().map(|open| open.path.as_ref())
	}
}

impl AsyncShadowWrite for ShadowOnDisk {
	fn create(&mut self, path: &Path) -> impl std::future::Future<Output = io::Result<()>> + Send {
		async move {
			let file = tokio::fs::OpenOptions::new()
				.read(true)
				.write(true)
				.create(true)
				.truncate(true)
				.open(path)
				.await?;
			self.open = Some(OpenFile {
				path: path.to_path_buf(),
				file,
				writeable: true,
			});
			Ok(())
		}
	}

	fn set_len(&mut self, len: u64) -> impl std::future::Future<Output = io::Result<()>> + Send {
		async move { self.require_open()?.file.set_len(len).await }
	}

	fn remove(&mut self) -> impl std::future::Future<Output = io::Result<()>> + Send {
		async move {
			let Some(open) = self.open.take() else {
				return Err(io::Error::new(
					io::ErrorKind::NotConnected,
					"no shadow file open",
				));
			};

			drop(open.file);
			tokio::fs::remove_file(&open.path).await
		}
	}

	fn writeable(&self) -> Option<bool> {
		self.open.as_ref().map(|open| open.writeable)
	}
}

impl AsyncSeek for ShadowOnDisk {
	fn poll_seek(
		mut self: Pin<&mut Self>,
		cx: &mut std::task::Context<'_>,
		pos: io::SeekFrom,
	) -> Poll<io::Result<u64>> {
		use tokio::io::AsyncSeek as _;

		self.open.as_mut().map_or_else(
			|| {
				Poll::Ready(Err(io::Error::new(
					io::ErrorKind::NotConnected,
					"no shadow file open",
				)))
			},
			|open| {
				if let Err(err) = Pin::new(&mut open.file).start_seek(pos) {
					return Poll::Ready(Err(err));
				}

				Pin::new(&mut open.file).poll_complete(cx)
			},
		)
	}
}

impl AsyncRead for ShadowOnDisk {
	fn poll_read(
		mut self: Pin<&mut Self>,
		cx: &mut std::task::Context<'_>,
		buf: &mut [u8],
	) -> Poll<io::Result<usize>> {
		use tokio::io::AsyncRead as _;

		self.open.as_mut().map_or_else(
			|| {
				Poll::Ready(Err(io::Error::new(
					io::ErrorKind::NotConnected,
					"no shadow file open",
				)))
			},
			|open| {
				let mut buf = ReadBuf::new(buf);
				match Pin::new(&mut open.file).poll_read(cx, &mut buf) {
					Poll::Ready(Ok(())) => Poll::Ready(Ok(buf.filled().len())),
					Poll::Ready(Err(err)) => Poll::Ready(Err(err)),
					Poll::Pending => Poll::Pending,
				}
			},
		)
	}
}

impl AsyncWrite for ShadowOnDisk {
	fn poll_write(
		mut self: Pin<&mut Self>,
		cx: &mut std::task::Context<'_>,
		buf: &[u8],
	) -> Poll<io::Result<usize>> {
		use tokio::io::AsyncWrite as _;

		self.open.as_mut().map_or_else(
			|| {
				Poll::Ready(Err(io::Error::new(
					io::ErrorKind::NotConnected,
					"no shadow file open",
				)))
			},
			|open| Pin::new(&mut open.file).poll_write(cx, buf),
		)
	}

	fn poll_flush(mut self: Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> Poll<io::Result<()>> {
		use tokio::io::AsyncWrite as _;

		self.open.as_mut().map_or_else(
			|| Poll::Ready(Ok(())),
			|open| Pin::new(&mut open.file).poll_flush(cx),
		)
	}

	fn poll_close(mut self: Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> Poll<io::Result<()>> {
		use tokio::io::AsyncWrite as _;

		self.open.as_mut().map_or_else(
			|| Poll::Ready(Ok(())),
			|open| Pin::new(&mut open.file).poll_shutdown(cx),
		)
	}
}
