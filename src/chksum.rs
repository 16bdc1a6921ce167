//! Frame checksums.
//!
//! Every shadow-file frame ends in a CRC-32 of all bytes that precede it.
//! The CRC field itself is encoded as zero while the digest is computed,
//! then patched in place.

pub(crate) const CHKSUM_SIZE: usize = 4;

/// CRC-32 (IEEE) of a byte slice.
pub(crate) fn crc32(bytes: &[u8]) -> u32 {
	let mut hasher = crc32fast::Hasher::new();
	hasher.update(bytes);
	hasher.finalize()
}

/// Patch the trailing checksum field of an encoded frame.
pub(crate) fn seal(frame: &mut [u8]) {
	debug_assert!(frame.len() > CHKSUM_SIZE);
	let body = frame.len() - CHKSUM_SIZE;
	let chksum = crc32(&frame[..body]);
	frame[body..].copy_from_slice(&chksum.to_le_bytes());
}

/// Whether the trailing checksum of a frame matches its body.
pub(crate) fn verify(frame: &[u8]) -> bool {
	if frame.len() <= CHKSUM_SIZE {
		return false;
	}
	let body = frame.len() - CHKSUM_SIZE;
	let stored = u32::from_le_bytes([
		frame[body],
		frame[body + 1],
		frame[body + 2],
		frame[body + 3],
	]);
	crc32(&frame[..body]) == stored
}
