//! Chunked AEAD encryption stages.
//!
//! The stream is cut into fixed-size plaintext frames; each frame is sealed
//! independently as `nonce || ciphertext || tag` with XChaCha20-Poly1305. All
//! ciphertext frames are exactly `chunk_size + METADATA_SIZE` bytes except
//! the last, so the decrypt stage can delimit frames without buffering the
//! stream and the encrypted length of any input is known up front.

use bytes::{Bytes, BytesMut};
use chacha20poly1305::{
	aead::{Aead as _, AeadCore as _, KeyInit as _, OsRng},
	Key, XChaCha20Poly1305, XNonce,
};

use crate::error::{Error, Result};

use super::{ChunkRx, ChunkTx};

/// Nonce (24) + Poly1305 tag (16) carried by every encrypted frame.
pub const METADATA_SIZE: usize = 40;

const NONCE_SIZE: usize = 24;

/// Exact size of the encrypt stage's output for `plain` input bytes.
pub fn encrypted_size(plain: u64, chunk_size: usize) -> u64 {
	plain + plain.div_ceil(chunk_size as u64) * METADATA_SIZE as u64
}

/// A frame cipher; cheap to clone per pipeline.
#[derive(Clone)]
pub struct Cipher {
	aead: XChaCha20Poly1305,
	chunk_size: usize,
}

impl std::fmt::Debug for Cipher {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Cipher")
			.field("chunk_size", &self.chunk_size)
			.finish_non_exhaustive()
	}
}

impl Cipher {
	pub fn new(key: [u8; 32], chunk_size: usize) -> Self {
		Self {
			aead: XChaCha20Poly1305::new(Key::from_slice(&key)),
			chunk_size,
		}
	}

	pub fn encrypted_size(&self, plain: u64) -> u64 {
		encrypted_size(plain, self.chunk_size)
	}

	fn seal(&self, plain: &[u8]) -> Result<Bytes> {
		let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
		let sealed = self
			.aead
			.encrypt(&nonce, plain)
			.map_err(|_| Error::validation("sealing an encrypted frame failed"))?;

		let mut frame = BytesMut::with_capacity(NONCE_SIZE + sealed.len());
		frame.extend_from_slice(&nonce);
		frame.extend_from_slice(&sealed);
		Ok(frame.freeze())
	}

	fn open(&self, frame: &[u8]) -> Result<Bytes> {
		if frame.len() <= METADATA_SIZE {
			return Err(Error::validation("truncated encrypted frame"));
		}
		let nonce = XNonce::from_slice(&frame[..NONCE_SIZE]);
		let plain = self
			.aead
			.decrypt(nonce, &frame[NONCE_SIZE..])
			.map_err(|_| Error::validation("decryption failed: wrong key or corrupted data"))?;
		Ok(Bytes::from(plain))
	}
}

/// Transform: plaintext chunks in, encrypted frames out.
pub async fn encrypt(cipher: Cipher, mut rx: ChunkRx, tx: ChunkTx) -> Result<()> {
	let chunk_size = cipher.chunk_size;
	let mut buffer = BytesMut::new();

	while let Some(chunk) = rx.next().await? {
		buffer.extend_from_slice(&chunk);
		while buffer.len() >= chunk_size {
			let plain = buffer.split_to(chunk_size);
			tx.send(cipher.seal(&plain)?).await?;
		}
	}
	if !buffer.is_empty() {
		tx.send(cipher.seal(&buffer)?).await?;
	}
	Ok(())
}

/// Transform: encrypted frames in, plaintext chunks out. Fails hard on tag
/// mismatch.
pub async fn decrypt(cipher: Cipher, mut rx: ChunkRx, tx: ChunkTx) -> Result<()> {
	let frame_size = cipher.chunk_size + METADATA_SIZE;
	let mut buffer = BytesMut::new();

	while let Some(chunk) = rx.next().await? {
		buffer.extend_from_slice(&chunk);
		while buffer.len() >= frame_size {
			let frame = buffer.split_to(frame_size);
			tx.send(cipher.open(&frame)?).await?;
		}
	}
	if !buffer.is_empty() {
		tx.send(cipher.open(&buffer)?).await?;
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::pipeline::{io, Pipeline};
	use tokio::sync::oneshot;
	use tokio_util::sync::CancellationToken;

	fn cipher(chunk_size: usize) -> Cipher {
		Cipher::new([7u8; 32], chunk_size)
	}

	async fn run_stream(
		input: Vec<Bytes>,
		stages: impl FnOnce(Pipeline) -> Pipeline,
	) -> Result<Bytes> {
		let cancel = CancellationToken::new();
		let (done_tx, done_rx) = oneshot::channel();
		let pipeline = Pipeline::new(4, &cancel).source(|tx| io::emit(input, tx));
		stages(pipeline)
			.sink(|rx| io::collect_into(rx, done_tx))
			.run()
			.await?;
		Ok(done_rx.await.expect("pipeline succeeded"))
	}

	#[tokio::test]
	async fn round_trip_across_uneven_chunk_boundaries() {
		let payload: Vec<u8> = (0..20_000u32).map(|i| (i * 31 % 256) as u8).collect();
		// Feed in chunks that do not line up with the 4096-byte frames.
		let input: Vec<Bytes> = payload.chunks(999).map(Bytes::copy_from_slice).collect();

		let c = cipher(4096);
		let sealed = run_stream(input, |p| {
			let c = c.clone();
			p.then(move |rx, tx| encrypt(c, rx, tx))
		})
		.await
		.unwrap();

		assert_eq!(sealed.len() as u64, encrypted_size(payload.len() as u64, 4096));

		let c2 = cipher(4096);
		let opened = run_stream(vec![sealed], |p| {
			let c2 = c2.clone();
			p.then(move |rx, tx| decrypt(c2, rx, tx))
		})
		.await
		.unwrap();

		assert_eq!(&opened[..], &payload[..]);
	}

	#[tokio::test]
	async fn corrupted_frame_fails_hard() {
		let c = cipher(1024);
		let mut sealed = BytesMut::from(
			&run_stream(vec![Bytes::from_static(b"sensitive bytes")], |p| {
				let c = c.clone();
				p.then(move |rx, tx| encrypt(c, rx, tx))
			})
			.await
			.unwrap()[..],
		);
		let last = sealed.len() - 1;
		sealed[last] ^= 0xff;

		let c2 = cipher(1024);
		let err = run_stream(vec![sealed.freeze()], |p| {
			let c2 = c2.clone();
			p.then(move |rx, tx| decrypt(c2, rx, tx))
		})
		.await
		.unwrap_err();
		assert!(matches!(err, Error::Validation(_)), "got {err:?}");
	}

	#[test]
	fn encrypted_size_counts_short_final_frame() {
		assert_eq!(encrypted_size(0, 8192), 0);
		assert_eq!(encrypted_size(1, 8192), 1 + 40);
		assert_eq!(encrypted_size(8192, 8192), 8192 + 40);
		assert_eq!(encrypted_size(8193, 8192), 8193 + 80);
		// Scenario from the test plan: 10 MiB at 8 KiB frames.
		let plain = 10 * 1024 * 1024_u64;
		assert_eq!(encrypted_size(plain, 8192), plain + 1280 * 40);
	}
}
