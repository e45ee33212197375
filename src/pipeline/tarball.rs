//! Tar archive pipeline stages.
//!
//! Parts travel as plain ustar archives: regular files only, no compression,
//! entries appended in lexicographic relative-path order so that the same
//! input tree always produces the same bytes (part checksums and dedup
//! depend on this).

use std::path::{Path, PathBuf};

use bytes::BytesMut;
use tokio::{
	fs,
	io::{AsyncReadExt as _, AsyncWriteExt as _},
};
use tracing::trace;

use crate::error::{Error, Result};

use super::{ChunkRx, ChunkTx};

const BLOCK: u64 = 512;

/// Size of a tar archive holding regular files of the given sizes: one
/// header block plus block-aligned data per file, then the two-block
/// end-of-archive marker.
pub fn tar_size(file_sizes: impl IntoIterator<Item = u64>) -> u64 {
	file_sizes
		.into_iter()
		.map(|size| BLOCK + size.div_ceil(BLOCK) * BLOCK)
		.sum::<u64>()
		+ 2 * BLOCK
}

/// Generator: emit a well-formed tar archive of `files` (paths relative to
/// `base`) as a chunked byte stream.
pub async fn pack(
	base: PathBuf,
	mut files: Vec<PathBuf>,
	chunk_size: usize,
	tx: ChunkTx,
) -> Result<()> {
	files.sort();

	let (writer, mut reader) = tokio::io::duplex(chunk_size.max(16 * 1024));

	let build = async move {
		let mut builder = tokio_tar::Builder::new(writer);
		for relative in files {
			let path = base.join(&relative);
			let file = fs::File::open(&path).await?;
			let metadata = file.metadata().await?;
			trace!(path = %path.display(), size = metadata.len(), "adding tar entry");

			let mut header = tokio_tar::Header::new_ustar();
			header.set_metadata(&metadata);
			builder.append_data(&mut header, &relative, file).await?;
		}
		let mut writer = builder.into_inner().await?;
		writer.shutdown().await?;
		Ok::<_, Error>(())
	};

	let pump = async {
		loop {
			let mut chunk = BytesMut::with_capacity(chunk_size);
			let read = reader.read_buf(&mut chunk).await?;
			if read == 0 {
				break;
			}
			tx.send(chunk.freeze()).await?;
		}
		Ok::<_, Error>(())
	};

	tokio::try_join!(build, pump)?;
	Ok(())
}

/// Sink: interpret the stream as a tar archive and extract it into `dest`.
pub async fn unpack(dest: PathBuf, rx: ChunkRx) -> Result<()> {
	fs::create_dir_all(&dest).await?;

	let stream = futures::stream::unfold(rx, |mut rx| async move {
		match rx.next().await {
			Ok(Some(chunk)) => Some((Ok(chunk), rx)),
			Ok(None) => None,
			Err(err) => Some((Err(std::io::Error::other(err)), rx)),
		}
	});
	let reader = Box::pin(tokio_util::io::StreamReader::new(stream));

	let mut archive = tokio_tar::Archive::new(reader);
	archive.unpack(&dest).await?;
	Ok(())
}

/// Relative paths of all regular files under `dir`, sorted.
pub fn list_files(dir: &Path) -> Result<Vec<PathBuf>> {
	let mut files = Vec::new();
	for entry in walkdir::WalkDir::new(dir).follow_links(false) {
		let entry = entry.map_err(|err| Error::validation(format!("walking {}: {err}", dir.display())))?;
		if entry.file_type().is_file() {
			// UNWRAP: walkdir yields paths under the root it was given
			files.push(entry.path().strip_prefix(dir).unwrap().to_path_buf());
		}
	}
	files.sort();
	Ok(files)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::pipeline::{io, Pipeline};
	use tokio::sync::oneshot;
	use tokio_util::sync::CancellationToken;

	#[test]
	fn tar_size_matches_block_alignment() {
		// One empty file: header + trailer only.
		assert_eq!(tar_size([0]), 512 + 1024);
		// A one-byte file occupies a whole data block.
		assert_eq!(tar_size([1]), 512 + 512 + 1024);
		assert_eq!(tar_size([512]), 512 + 512 + 1024);
		assert_eq!(tar_size([513]), 512 + 1024 + 1024);
		assert_eq!(tar_size([1, 600]), (512 + 512) + (512 + 1024) + 1024);
	}

	#[tokio::test]
	async fn pack_then_unpack_restores_files_byte_for_byte() {
		let src = tempfile::tempdir().unwrap();
		let dst = tempfile::tempdir().unwrap();
		std::fs::create_dir_all(src.path().join("nested")).unwrap();
		std::fs::write(src.path().join("a.bin"), vec![1u8; 700]).unwrap();
		std::fs::write(src.path().join("nested/b.bin"), vec![2u8; 4096]).unwrap();
		std::fs::write(src.path().join("empty"), b"").unwrap();

		let files = list_files(src.path()).unwrap();
		assert_eq!(
			files,
			vec![
				PathBuf::from("a.bin"),
				PathBuf::from("empty"),
				PathBuf::from("nested/b.bin"),
			]
		);

		let cancel = CancellationToken::new();
		let src_path = src.path().to_path_buf();
		let dst_path = dst.path().to_path_buf();
		Pipeline::new(4, &cancel)
			.source(|tx| pack(src_path, files.clone(), 1024, tx))
			.sink(|rx| unpack(dst_path, rx))
			.run()
			.await
			.unwrap();

		for file in &files {
			assert_eq!(
				std::fs::read(src.path().join(file)).unwrap(),
				std::fs::read(dst.path().join(file)).unwrap(),
				"{file:?} differs"
			);
		}
	}

	#[tokio::test]
	async fn packed_stream_length_matches_the_estimate() {
		let src = tempfile::tempdir().unwrap();
		std::fs::write(src.path().join("x"), vec![9u8; 1000]).unwrap();
		std::fs::write(src.path().join("y"), vec![9u8; 513]).unwrap();

		let files = list_files(src.path()).unwrap();
		let sizes: Vec<u64> = files
			.iter()
			.map(|f| std::fs::metadata(src.path().join(f)).unwrap().len())
			.collect();

		let cancel = CancellationToken::new();
		let (done_tx, done_rx) = oneshot::channel();
		let base = src.path().to_path_buf();
		Pipeline::new(4, &cancel)
			.source(|tx| pack(base, files, 512, tx))
			.sink(|rx| io::collect_into(rx, done_tx))
			.run()
			.await
			.unwrap();

		let archive = done_rx.await.unwrap();
		assert_eq!(archive.len() as u64, tar_size(sizes));
	}
}
