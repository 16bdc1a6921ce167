//! The end-of-tick (EOT) scheduler.
//!
//! Every open file, writer or reader, keeps one entry on a process-scoped
//! queue ordered by deadline. Tick processing is cooperative: it runs on
//! whichever application task entered the library while the head deadline
//! had passed, never on a background thread. After a file's end of tick it
//! re-inserts itself with a fresh deadline.

use std::{
	cell::Cell,
	collections::VecDeque,
	sync::atomic::{AtomicU64, Ordering},
};

use tokio::time::Instant;

/// Identity of an open file for the lifetime of the open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileId(u64);

impl FileId {
	pub fn next() -> Self {
		static NEXT: AtomicU64 = AtomicU64::new(1);
		Self(NEXT.fetch_add(1, Ordering::Relaxed))
	}
}

/// One scheduled end of tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EotEntry {
	pub file: FileId,
	pub is_writer: bool,
	pub tick_num: u64,
	pub deadline: Instant,
}

/// The process-scoped EOT queue, ascending by deadline.
///
/// The queue also mirrors its head: whether a writer is due next and at
/// what deadline, so the outermost library entry can decide cheaply whether
/// any tick processing is owed. An empty queue reports no writer at head.
#[derive(Debug)]
pub struct EotQueue {
	entries: VecDeque<EotEntry>,
	writer_at_head: bool,
	head_deadline: Option<Instant>,
}

impl Default for EotQueue {
	fn default() -> Self {
		Self::new()
	}
}

impl EotQueue {
	pub fn new() -> Self {
		Self {
			entries: VecDeque::new(),
			writer_at_head: false,
			head_deadline: None,
		}
	}

	pub fn len(&self) -> usize {
		self.entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	/// Splice an entry in after the last entry with an equal or earlier
	/// deadline, walking from the tail.
	///
	/// Files sharing a deadline keep their insertion order.
	pub fn insert(&mut self, entry: EotEntry) {
		let at = self
			.entries
			.iter()
			.rposition(|e| e.deadline <= entry.deadline)
			.map_or(0, |found| found + 1);

		self.entries.insert(at, entry);
		self.sync_head();
	}

	/// Unlink the entry for `file`, if present.
	pub fn remove(&mut self, file: FileId) -> bool {
		let Some(at) = self.entries.iter().position(|e| e.file == file) else {
			return false;
		};

		self.entries.remove(at);
		self.sync_head();
		true
	}

	/// The next file whose tick is due.
	pub fn head(&self) -> Option<&EotEntry> {
		self.entries.front()
	}

	/// Pop the head if its deadline has passed.
	///
	/// The popped file is expected to run its end of tick and re-insert
	/// itself.
	pub fn pop_due(&mut self, now: Instant) -> Option<EotEntry> {
		if self.head_deadline? > now {
			return None;
		}

		let entry = self.entries.pop_front();
		self.sync_head();
		entry
	}

	/// Pop the next due entry, but only for the outermost library entry.
	///
	/// This is the gate every public entry point drives tick processing
	/// through: a nested call holds a non-outermost [`ApiScope`] and gets
	/// nothing back, so ticks never fire recursively.
	pub fn pop_due_scoped(&mut self, scope: &ApiScope<'_>, now: Instant) -> Option<EotEntry> {
		if !scope.is_outermost() {
			return None;
		}
		self.pop_due(now)
	}

	/// Whether the next due file is the writer.
	pub fn writer_at_head(&self) -> bool {
		self.writer_at_head
	}

	pub fn head_deadline(&self) -> Option<Instant> {
		self.head_deadline
	}

	fn sync_head(&mut self) {
		match self.entries.front() {
			Some(head) => {
				self.writer_at_head = head.is_writer;
				self.head_deadline = Some(head.deadline);
			}
			None => {
				self.writer_at_head = false;
				self.head_deadline = None;
			}
		}
	}

	/// Log the queue contents.
	pub fn dump(&self) {
		if self.entries.is_empty() {
			tracing::debug!("EOT queue is empty");
		}
		for (nth, entry) in self.entries.iter().enumerate() {
			tracing::debug!(
				nth,
				file = entry.file.0,
				is_writer = entry.is_writer,
				tick_num = entry.tick_num,
				deadline = ?entry.deadline,
				"EOT queue entry"
			);
		}
	}
}

/// Library re-entrance depth.
///
/// Public entry points acquire a scope and drain due ticks through
/// [`EotQueue::pop_due_scoped`]; only the outermost scope gets entries
/// back, so nested library calls never fire ticks recursively.
#[derive(Debug, Default)]
pub struct ApiDepth {
	depth: Cell<u32>,
}

impl ApiDepth {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn enter(&self) -> ApiScope<'_> {
		let depth = self.depth.get() + 1;
		self.depth.set(depth);
		ApiScope {
			owner: self,
			outermost: depth == 1,
		}
	}

	pub fn depth(&self) -> u32 {
		self.depth.get()
	}
}

/// Guard for one library entry; releases the depth on drop.
#[derive(Debug)]
pub struct ApiScope<'a> {
	owner: &'a ApiDepth,
	outermost: bool,
}

impl ApiScope<'_> {
	/// Whether this scope is the outermost library entry, and so the one
	/// that may process due ticks.
	pub fn is_outermost(&self) -> bool {
		self.outermost
	}
}

impl Drop for ApiScope<'_> {
	fn drop(&mut self) {
		self.owner.depth.set(self.owner.depth.get() - 1);
	}
}
