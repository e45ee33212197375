//! Local-filesystem and in-memory pipeline stages.

use std::path::PathBuf;

use bytes::{Bytes, BytesMut};
use tokio::{
	fs,
	io::{AsyncReadExt as _, AsyncWriteExt as _},
	sync::oneshot,
};
use tracing::{debug, trace};

use crate::error::{Error, Result};

use super::{ChunkRx, ChunkTx};

/// Generator: emit the given chunks. Used for small in-memory payloads
/// (DDL statements, serialized metadata).
pub async fn emit(chunks: Vec<Bytes>, tx: ChunkTx) -> Result<()> {
	for chunk in chunks {
		tx.send(chunk).await?;
	}
	Ok(())
}

/// Generator: emit a local file as fixed-size chunks; the last chunk may be
/// short.
pub async fn read_file(path: PathBuf, chunk_size: usize, tx: ChunkTx) -> Result<()> {
	let mut file = fs::File::open(&path).await?;
	loop {
		let mut chunk = BytesMut::with_capacity(chunk_size);
		let mut read = file.read_buf(&mut chunk).await?;
		while read > 0 && chunk.len() < chunk_size {
			let more = file.read_buf(&mut chunk).await?;
			if more == 0 {
				break;
			}
			read += more;
		}
		if chunk.is_empty() {
			break;
		}
		trace!(bytes = chunk.len(), path = %path.display(), "read file chunk");
		tx.send(chunk.freeze()).await?;
	}
	Ok(())
}

/// Sink: write the stream to a local file, creating parent directories.
pub async fn write_file(path: PathBuf, mut rx: ChunkRx) -> Result<()> {
	if let Some(parent) = path.parent() {
		fs::create_dir_all(parent).await?;
	}
	let mut file = fs::File::create(&path).await?;
	while let Some(chunk) = rx.next().await? {
		file.write_all(&chunk).await?;
	}
	file.flush().await?;
	Ok(())
}

/// Sink: buffer the whole stream and hand it over at EOF.
pub async fn collect_into(mut rx: ChunkRx, out: oneshot::Sender<Bytes>) -> Result<()> {
	let mut buffer = BytesMut::new();
	while let Some(chunk) = rx.next().await? {
		buffer.extend_from_slice(&chunk);
	}
	out.send(buffer.freeze()).map_err(|_| Error::StageClosed)
}

/// Sink: digest the whole stream, handing over the lowercase hex checksum.
pub async fn hash_into(mut rx: ChunkRx, out: oneshot::Sender<String>) -> Result<()> {
	let mut hasher = blake3::Hasher::new();
	while let Some(chunk) = rx.next().await? {
		hasher.update(&chunk);
	}
	out.send(hasher.finalize().to_hex().to_string())
		.map_err(|_| Error::StageClosed)
}

/// Sink: discard chunks until EOF.
pub async fn drain(mut rx: ChunkRx) -> Result<()> {
	while rx.next().await?.is_some() {}
	Ok(())
}

/// Transform: pass chunks through, advancing a progress bar.
pub async fn progress(bar: indicatif::ProgressBar, mut rx: ChunkRx, tx: ChunkTx) -> Result<()> {
	while let Some(chunk) = rx.next().await? {
		bar.inc(chunk.len() as u64);
		tx.send(chunk).await?;
	}
	bar.abandon(); // finish, leaving the completed bar in place
	Ok(())
}

/// Sink: drain the stream, then remove the named local files. Reached only
/// when every upstream stage succeeded, so the files are deleted exactly
/// when their bytes are safely elsewhere.
pub async fn delete_files(paths: Vec<PathBuf>, mut rx: ChunkRx) -> Result<()> {
	while rx.next().await?.is_some() {}
	for path in paths {
		debug!(path = %path.display(), "removing local file");
		match fs::remove_file(&path).await {
			Ok(()) => {}
			Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
			Err(err) => return Err(err.into()),
		}
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::pipeline::Pipeline;
	use tokio_util::sync::CancellationToken;

	#[tokio::test]
	async fn read_file_chunks_and_collect_round_trip() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("blob");
		let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
		std::fs::write(&path, &payload).unwrap();

		let cancel = CancellationToken::new();
		let (done_tx, done_rx) = oneshot::channel();
		Pipeline::new(4, &cancel)
			.source(|tx| read_file(path, 1024, tx))
			.sink(|rx| collect_into(rx, done_tx))
			.run()
			.await
			.unwrap();

		assert_eq!(&done_rx.await.unwrap()[..], &payload[..]);
	}

	#[tokio::test]
	async fn delete_files_runs_after_success_and_ignores_missing() {
		let dir = tempfile::tempdir().unwrap();
		let keep = dir.path().join("keep");
		let gone = dir.path().join("gone");
		std::fs::write(&gone, b"x").unwrap();
		std::fs::write(&keep, b"y").unwrap();

		let cancel = CancellationToken::new();
		Pipeline::new(1, &cancel)
			.source(|tx| emit(vec![Bytes::from_static(b"payload")], tx))
			.sink(|rx| delete_files(vec![gone.clone(), dir.path().join("never-existed")], rx))
			.run()
			.await
			.unwrap();

		assert!(!gone.exists());
		assert!(keep.exists());
	}
}
