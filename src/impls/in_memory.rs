use std::path::Path;

use futures_util::io::Cursor;

use crate::{reader::AsyncShadowRead, writer::AsyncShadowWrite};

impl AsyncShadowRead for Cursor<Vec<u8>> {
	fn open(
		&mut self,
		_path: &Path,
	) -> impl std::future::Future<Output = std::io::Result<()>> + Send {
		async move { Ok(()) }
	}

	fn close(&mut self) -> impl std::future::Future<Output = ()> + Send {
		async move {}
	}

	fn current(&self) -> Option<&Path> {
		None
	}
}

impl AsyncShadowWrite for Cursor<Vec<u8>> {
	fn create(
		&mut self,
		_path: &Path,
	) -> impl std::future::Future<Output = std::io::Result<()>> + Send {
		async move {
			self.get_mut().clear();
			self.set_position(0);
			Ok(())
		}
	}

	fn set_len(&mut self, len: u64) -> impl std::future::Future<Output = std::io::Result<()>> + Send {
		async move {
			self.get_mut().resize(len as usize, 0);
			Ok(())
		}
	}

	fn remove(&mut self) -> impl std::future::Future<Output = std::io::Result<()>> + Send {
		async move {
			self.get_mut().clear();
			self.set_position(0);
			Ok(())
		}
	}

	fn writeable(&self) -> Option<bool> {
		Some(true)
	}
}
