//! Storage layout: the mapping from backup artifacts to remote keys, and
//! the pipelines that move them.
//!
//! Key scheme, rooted at the configured prefix:
//!
//! ```text
//! <prefix>/<backup>/backup_struct.json
//! <prefix>/<backup>/metadata/<db>.sql
//! <prefix>/<backup>/metadata/<db>/<table>.sql
//! <prefix>/<backup>/data/<db>/<table>/<part>.tar        tarball parts
//! <prefix>/<backup>/data/<db>/<table>/<part>/<file>     per-file parts
//! <prefix>/<backup>/cloud_storage/<disk>/shadow.tar
//! ```
//!
//! `backup_struct.json` is plaintext; everything else respects the
//! encryption config. Part uploads run in the background behind a
//! semaphore; [`BackupLayout::wait`] must be called before the backup
//! metadata is finalized.

use std::{path::Path, sync::Arc};

use bytes::Bytes;
use indicatif::MultiProgress;
use tokio::{
	io::AsyncReadExt as _,
	sync::{oneshot, Mutex, Semaphore},
	task::JoinSet,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::{
	clickhouse::FrozenPart,
	config::Config,
	error::{Error, Result},
	metadata::{BackupMetadata, PartMetadata, BACKUP_STRUCT},
	pipeline::{crypto, crypto::Cipher, io, tarball, Pipeline},
	storage::ObjectStorage,
	util,
};

/// Escape a name for use as one path segment of a remote key.
fn escape_segment(name: &str) -> String {
	name.replace('%', "%25").replace('/', "%2F")
}

pub struct BackupLayout {
	storage: ObjectStorage,
	prefix: String,
	cipher: Option<Cipher>,
	queue_capacity: usize,
	chunk_size: usize,
	cancel: CancellationToken,
	progress: MultiProgress,
	upload_slots: Arc<Semaphore>,
	uploads: Mutex<JoinSet<Result<()>>>,
}

impl BackupLayout {
	pub async fn new(
		config: &Config,
		cancel: CancellationToken,
		progress: MultiProgress,
	) -> Result<Self> {
		let storage = ObjectStorage::new(&config.storage).await?;
		let cipher = if config.encryption.enabled() {
			Some(Cipher::new(
				config.encryption.key_bytes()?,
				config.encryption.chunk_size,
			))
		} else {
			None
		};

		Ok(Self {
			storage,
			prefix: config.storage.path.trim_matches('/').to_string(),
			cipher,
			queue_capacity: config.storage.queue_capacity,
			chunk_size: config.storage.chunk_size,
			cancel,
			progress,
			upload_slots: Arc::new(Semaphore::new(config.storage.concurrency)),
			uploads: Mutex::new(JoinSet::new()),
		})
	}

	pub fn encryption_enabled(&self) -> bool {
		self.cipher.is_some()
	}

	// Key scheme.

	pub fn backup_path(&self, backup_name: &str) -> String {
		if self.prefix.is_empty() {
			escape_segment(backup_name)
		} else {
			format!("{}/{}", self.prefix, escape_segment(backup_name))
		}
	}

	fn metadata_key(&self, backup_name: &str) -> String {
		format!("{}/{BACKUP_STRUCT}", self.backup_path(backup_name))
	}

	fn database_ddl_key(&self, backup_name: &str, database: &str) -> String {
		format!(
			"{}/metadata/{}.sql",
			self.backup_path(backup_name),
			escape_segment(database)
		)
	}

	fn table_ddl_key(&self, backup_name: &str, database: &str, table: &str) -> String {
		format!(
			"{}/metadata/{}/{}.sql",
			self.backup_path(backup_name),
			escape_segment(database),
			escape_segment(table)
		)
	}

	/// Keys for a part's objects, rooted at the owning backup's path (which
	/// differs from this backup's for linked parts).
	pub fn part_keys(backup_path: &str, part: &PartMetadata) -> Vec<String> {
		let root = format!(
			"{backup_path}/data/{}/{}/{}",
			escape_segment(&part.database),
			escape_segment(&part.table),
			escape_segment(&part.name)
		);
		if part.tarball {
			vec![format!("{root}.tar")]
		} else {
			part.files
				.iter()
				.map(|file| format!("{root}/{}", escape_segment(file)))
				.collect()
		}
	}

	fn cloud_storage_key(&self, backup_name: &str, disk: &str) -> String {
		format!(
			"{}/cloud_storage/{}/shadow.tar",
			self.backup_path(backup_name),
			escape_segment(disk)
		)
	}

	fn maybe_encrypted_size(&self, plain: u64) -> u64 {
		match &self.cipher {
			Some(cipher) => cipher.encrypted_size(plain),
			None => plain,
		}
	}

	/// Add the encrypt stage when encryption is on.
	fn encrypting(&self, pipeline: Pipeline) -> Pipeline {
		match self.cipher.clone() {
			Some(cipher) => pipeline.then(move |rx, tx| crypto::encrypt(cipher, rx, tx)),
			None => pipeline,
		}
	}

	/// Add the decrypt stage when the stored object is `encrypted`. The
	/// flag comes from the backup or part metadata, not from the current
	/// config, so old plaintext backups stay readable after a key is
	/// configured.
	fn decrypting(&self, encrypted: bool, pipeline: Pipeline) -> Pipeline {
		match (encrypted, self.cipher.clone()) {
			(true, Some(cipher)) => pipeline.then(move |rx, tx| crypto::decrypt(cipher, rx, tx)),
			(true, None) => pipeline.then(|_, _| async {
				Err(Error::config(
					"object is encrypted but no encryption key is configured",
				))
			}),
			(false, _) => pipeline,
		}
	}

	// Backup metadata.

	#[instrument(skip(self, backup), fields(backup = %backup.name()))]
	pub async fn upload_backup_metadata(&self, backup: &BackupMetadata) -> Result<()> {
		let body = backup.to_json()?;
		debug!(bytes = body.len(), "uploading backup metadata");
		self.storage
			.put(&self.metadata_key(backup.name()), Bytes::from(body))
			.await
	}

	pub async fn get_backup_metadata(&self, backup_name: &str) -> Result<BackupMetadata> {
		let bytes = self.storage.get(&self.metadata_key(backup_name)).await?;
		BackupMetadata::from_json(&bytes)
	}

	pub async fn get_backup_names(&self) -> Result<Vec<String>> {
		let prefix = if self.prefix.is_empty() {
			String::new()
		} else {
			format!("{}/", self.prefix)
		};
		self.storage.list_dirs(&prefix).await
	}

	/// All backups with readable metadata, newest first.
	pub async fn get_backups(&self) -> Result<Vec<BackupMetadata>> {
		let mut backups = Vec::new();
		for name in self.get_backup_names().await? {
			match self.get_backup_metadata(&name).await {
				Ok(backup) => backups.push(backup),
				Err(err) if err.is_not_found() => {
					debug!(%name, "prefix without metadata, skipping");
				}
				Err(err) => {
					warn!(%name, %err, "unreadable backup metadata, skipping");
				}
			}
		}
		backups.sort_by(|a, b| b.meta.start_time.cmp(&a.meta.start_time));
		Ok(backups)
	}

	// DDL.

	pub async fn upload_database_create_statement(
		&self,
		backup_name: &str,
		database: &str,
		ddl: Bytes,
	) -> Result<()> {
		let key = self.database_ddl_key(backup_name, database);
		self.upload_small(&key, ddl).await
	}

	pub async fn upload_table_create_statement(
		&self,
		backup_name: &str,
		database: &str,
		table: &str,
		ddl: Bytes,
	) -> Result<()> {
		let key = self.table_ddl_key(backup_name, database, table);
		self.upload_small(&key, ddl).await
	}

	pub async fn get_database_create_statement(
		&self,
		backup: &BackupMetadata,
		database: &str,
	) -> Result<String> {
		let key = self.database_ddl_key(backup.name(), database);
		let bytes = self.download_small(&key, backup.meta.encrypted).await?;
		String::from_utf8(bytes.to_vec())
			.map_err(|_| Error::validation(format!("{key} is not valid UTF-8")))
	}

	pub async fn get_table_create_statement(
		&self,
		backup: &BackupMetadata,
		database: &str,
		table: &str,
	) -> Result<String> {
		let key = self.table_ddl_key(backup.name(), database, table);
		let bytes = self.download_small(&key, backup.meta.encrypted).await?;
		String::from_utf8(bytes.to_vec())
			.map_err(|_| Error::validation(format!("{key} is not valid UTF-8")))
	}

	/// Encrypted single-object upload for small payloads.
	async fn upload_small(&self, key: &str, body: Bytes) -> Result<()> {
		let estimated = self.maybe_encrypted_size(body.len() as u64);
		let storage = self.storage.clone();
		let key = key.to_string();
		self.encrypting(
			Pipeline::new(self.queue_capacity, &self.cancel)
				.source(move |tx| io::emit(vec![body], tx)),
		)
		.then(move |rx, tx| async move {
			storage.upload_stream(&key, rx, estimated).await?;
			drop(tx);
			Ok(())
		})
		.drain()
		.run()
		.await
	}

	async fn download_small(&self, key: &str, encrypted: bool) -> Result<Bytes> {
		let storage = self.storage.clone();
		let key_owned = key.to_string();
		let (done_tx, done_rx) = oneshot::channel();
		self.decrypting(
			encrypted,
			Pipeline::new(self.queue_capacity, &self.cancel)
				.source(move |tx| async move { storage.download_stream(&key_owned, tx).await }),
		)
		.sink(|rx| io::collect_into(rx, done_tx))
		.run()
		.await?;
		done_rx.await.map_err(|_| Error::StageClosed)
	}

	// Part data.

	/// Checksum of a frozen part as it will be stored: over the tar bytes
	/// for tarball parts, over the file bytes in lexicographic order
	/// otherwise.
	pub async fn frozen_part_checksum(&self, part: &FrozenPart, tarball: bool) -> Result<String> {
		if tarball {
			let (done_tx, done_rx) = oneshot::channel();
			let base = part.path.clone();
			let files = part.file_paths();
			let chunk_size = self.chunk_size;
			Pipeline::new(self.queue_capacity, &self.cancel)
				.source(move |tx| tarball::pack(base, files, chunk_size, tx))
				.sink(|rx| io::hash_into(rx, done_tx))
				.run()
				.await?;
			done_rx.await.map_err(|_| Error::StageClosed)
		} else {
			file_concat_checksum(&part.path, &part.file_paths()).await
		}
	}

	/// Schedule a frozen part's bytes for upload. Runs in the background;
	/// failures surface from [`Self::wait`]. The returned metadata is
	/// complete (including the checksum computed by the caller).
	pub async fn upload_data_part(
		&self,
		backup_name: &str,
		part: &FrozenPart,
		tarball: bool,
		checksum: String,
		encrypted: bool,
	) -> Result<PartMetadata> {
		let meta = PartMetadata {
			database: part.database.clone(),
			table: part.table.clone(),
			name: part.name.clone(),
			checksum,
			size: part.total_size(),
			files: part.file_names(),
			tarball,
			disk_name: part.disk_name.clone(),
			link: None,
			encrypted,
			extra: Default::default(),
		};

		let keys = Self::part_keys(&self.backup_path(backup_name), &meta);
		let storage = self.storage.clone();
		let cipher = self.cipher.clone();
		let queue_capacity = self.queue_capacity;
		let chunk_size = self.chunk_size;
		let cancel = self.cancel.clone();
		let slots = self.upload_slots.clone();
		let base = part.path.clone();
		let files = part.files.clone();
		let label = format!("{}.{}/{}", part.database, part.table, part.name);
		let bar = util::data_bar(
			&self.progress,
			maybe_encrypted_size_with(&cipher, upload_bytes_estimate(&files, tarball)),
		);
		bar.set_message(label.clone());

		self.uploads.lock().await.spawn(async move {
			let _slot = slots
				.acquire_owned()
				.await
				.map_err(|_| Error::StageClosed)?;
			debug!(part = %label, "uploading part data");

			if tarball {
				let plain = tarball::tar_size(files.iter().map(|(_, size)| *size));
				let estimated = maybe_encrypted_size_with(&cipher, plain);
				let paths: Vec<_> = files.iter().map(|(path, _)| path.clone()).collect();
				// The frozen copy is hard links; once the bytes are in
				// storage the local copy has served its purpose.
				let locals: Vec<_> = files.iter().map(|(path, _)| base.join(path)).collect();
				// UNWRAP: tarball parts have exactly one key
				let key = keys.into_iter().next().unwrap();

				let mut pipeline = Pipeline::new(queue_capacity, &cancel)
					.source(move |tx| tarball::pack(base, paths, chunk_size, tx));
				if let Some(cipher) = cipher {
					pipeline = pipeline.then(move |rx, tx| crypto::encrypt(cipher, rx, tx));
				}
				let bar_stage = bar.clone();
				pipeline
					.then(move |rx, tx| io::progress(bar_stage, rx, tx))
					.then(move |rx, tx| async move {
						storage.upload_stream(&key, rx, estimated).await?;
						drop(tx);
						Ok(())
					})
					.sink(move |rx| io::delete_files(locals, rx))
					.run()
					.await
			} else {
				for ((path, size), key) in files.into_iter().zip(keys) {
					let estimated = maybe_encrypted_size_with(&cipher, size);
					let source = base.join(&path);
					let local = source.clone();
					let storage = storage.clone();
					let mut pipeline = Pipeline::new(queue_capacity, &cancel)
						.source(move |tx| io::read_file(source, chunk_size, tx));
					if let Some(cipher) = cipher.clone() {
						pipeline = pipeline.then(move |rx, tx| crypto::encrypt(cipher, rx, tx));
					}
					let bar_stage = bar.clone();
					pipeline
						.then(move |rx, tx| io::progress(bar_stage, rx, tx))
						.then(move |rx, tx| async move {
							storage.upload_stream(&key, rx, estimated).await?;
							drop(tx);
							Ok(())
						})
						.sink(move |rx| io::delete_files(vec![local], rx))
						.run()
						.await?;
				}
				Ok(())
			}
		});

		Ok(meta)
	}

	/// Download a part into a local directory (the table's `detached/`
	/// directory on restore).
	#[instrument(skip(self, backup, part), fields(part = %part.name))]
	pub async fn download_data_part(
		&self,
		backup: &BackupMetadata,
		part: &PartMetadata,
		destination: &Path,
	) -> Result<()> {
		let owner_path = part.link.as_deref().unwrap_or(&backup.meta.path);
		let keys = Self::part_keys(owner_path, part);

		if part.tarball {
			// UNWRAP: tarball parts have exactly one key
			let key = keys.into_iter().next().unwrap();
			let storage = self.storage.clone();
			let dest = destination.to_path_buf();
			self.decrypting(
				part.encrypted,
				Pipeline::new(self.queue_capacity, &self.cancel)
					.source(move |tx| async move { storage.download_stream(&key, tx).await }),
			)
			.sink(move |rx| tarball::unpack(dest, rx))
			.run()
			.await
		} else {
			for (file, key) in part.files.iter().zip(keys) {
				let storage = self.storage.clone();
				let dest = destination.join(file);
				self.decrypting(
					part.encrypted,
					Pipeline::new(self.queue_capacity, &self.cancel)
						.source(move |tx| async move { storage.download_stream(&key, tx).await }),
				)
				.sink(move |rx| io::write_file(dest, rx))
				.run()
				.await?;
			}
			Ok(())
		}
	}

	/// Re-read a part from storage and verify its checksum.
	#[instrument(skip(self, part), fields(part = %part.name))]
	pub async fn check_data_part(&self, backup_path: &str, part: &PartMetadata) -> Result<bool> {
		let owner_path = part.link.as_deref().unwrap_or(backup_path);
		let keys = Self::part_keys(owner_path, part);

		let checksum = if part.tarball {
			// UNWRAP: tarball parts have exactly one key
			let key = keys.into_iter().next().unwrap();
			let storage = self.storage.clone();
			let (done_tx, done_rx) = oneshot::channel();
			self.decrypting(
				part.encrypted,
				Pipeline::new(self.queue_capacity, &self.cancel)
					.source(move |tx| async move { storage.download_stream(&key, tx).await }),
			)
			.sink(|rx| io::hash_into(rx, done_tx))
			.run()
			.await?;
			done_rx.await.map_err(|_| Error::StageClosed)?
		} else {
			let mut hasher = blake3::Hasher::new();
			for key in keys {
				let bytes = self.download_small(&key, part.encrypted).await?;
				hasher.update(&bytes);
			}
			hasher.finalize().to_hex().to_string()
		};

		Ok(checksum == part.checksum)
	}

	// Cloud storage shadows.

	/// Upload the shadow tree of a cloud-storage disk as one tarball.
	/// Returns false when the disk froze no data for this backup.
	pub async fn upload_cloud_storage_metadata(
		&self,
		backup_name: &str,
		disk_name: &str,
		shadow_dir: &Path,
		encrypt: bool,
	) -> Result<bool> {
		if !shadow_dir.is_dir() {
			return Ok(false);
		}
		let files = tarball::list_files(shadow_dir)?;
		if files.is_empty() {
			return Ok(false);
		}

		let sizes: Vec<u64> = files
			.iter()
			.map(|file| {
				std::fs::metadata(shadow_dir.join(file))
					.map(|meta| meta.len())
					.unwrap_or(0)
			})
			.collect();
		let plain = tarball::tar_size(sizes);
		let cipher = if encrypt { self.cipher.clone() } else { None };
		let estimated = maybe_encrypted_size_with(&cipher, plain);

		let key = self.cloud_storage_key(backup_name, disk_name);
		let storage = self.storage.clone();
		let base = shadow_dir.to_path_buf();
		let chunk_size = self.chunk_size;

		let mut pipeline = Pipeline::new(self.queue_capacity, &self.cancel)
			.source(move |tx| tarball::pack(base, files, chunk_size, tx));
		if let Some(cipher) = cipher {
			pipeline = pipeline.then(move |rx, tx| crypto::encrypt(cipher, rx, tx));
		}
		pipeline
			.then(move |rx, tx| async move {
				storage.upload_stream(&key, rx, estimated).await?;
				drop(tx);
				Ok(())
			})
			.drain()
			.run()
			.await?;
		Ok(true)
	}

	/// Download and extract a disk's shadow tarball.
	pub async fn download_cloud_storage_metadata(
		&self,
		backup: &BackupMetadata,
		disk_name: &str,
		destination: &Path,
	) -> Result<()> {
		let key = self.cloud_storage_key(backup.name(), disk_name);
		let storage = self.storage.clone();
		let dest = destination.to_path_buf();

		let pipeline = Pipeline::new(self.queue_capacity, &self.cancel)
			.source(move |tx| async move { storage.download_stream(&key, tx).await });
		self.decrypting(backup.cloud_storage.encrypted, pipeline)
			.sink(move |rx| tarball::unpack(dest, rx))
			.run()
			.await
	}

	// Deletion.

	/// Remove a backup's entire prefix. Idempotent.
	pub async fn delete_backup(&self, backup_name: &str) -> Result<()> {
		let keys = self
			.storage
			.list_keys(&format!("{}/", self.backup_path(backup_name)))
			.await?;
		if keys.is_empty() {
			return Ok(());
		}
		self.storage.delete_keys(&keys).await
	}

	/// Remove the objects of specific parts stored under this backup.
	pub async fn delete_data_parts(
		&self,
		backup: &BackupMetadata,
		parts: &[PartMetadata],
	) -> Result<()> {
		let keys: Vec<String> = parts
			.iter()
			.filter(|part| !part.is_link())
			.flat_map(|part| Self::part_keys(&backup.meta.path, part))
			.collect();
		if keys.is_empty() {
			return Ok(());
		}
		self.storage.delete_keys(&keys).await
	}

	/// Block until all background part uploads are done; surface the first
	/// failure. Must be called before the backup metadata is finalized.
	pub async fn wait(&self) -> Result<()> {
		let mut uploads = self.uploads.lock().await;
		let mut first_error = None;
		while let Some(joined) = uploads.join_next().await {
			let result = joined
				.unwrap_or_else(|err| Err(Error::Pipeline(format!("upload task panicked: {err}"))));
			if let Err(err) = result {
				first_error.get_or_insert(err);
			}
		}
		match first_error {
			Some(err) => Err(err),
			None => Ok(()),
		}
	}
}

fn maybe_encrypted_size_with(cipher: &Option<Cipher>, plain: u64) -> u64 {
	match cipher {
		Some(cipher) => cipher.encrypted_size(plain),
		None => plain,
	}
}

fn upload_bytes_estimate(files: &[(std::path::PathBuf, u64)], tarball: bool) -> u64 {
	if tarball {
		tarball::tar_size(files.iter().map(|(_, size)| *size))
	} else {
		files.iter().map(|(_, size)| size).sum()
	}
}

/// blake3 over the concatenation of files in their given (sorted) order.
pub async fn file_concat_checksum(base: &Path, files: &[std::path::PathBuf]) -> Result<String> {
	let mut hasher = blake3::Hasher::new();
	let mut buffer = vec![0u8; 128 * 1024];
	for file in files {
		let mut handle = tokio::fs::File::open(base.join(file)).await?;
		loop {
			let read = handle.read(&mut buffer).await?;
			if read == 0 {
				break;
			}
			hasher.update(&buffer[..read]);
		}
	}
	Ok(hasher.finalize().to_hex().to_string())
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::collections::BTreeMap;

	fn part(tarball: bool) -> PartMetadata {
		PartMetadata {
			database: "db1".into(),
			table: "t1".into(),
			name: "all_1_1_0".into(),
			checksum: "00".repeat(32),
			size: 10,
			files: vec!["checksums.txt".into(), "data.bin".into()],
			tarball,
			disk_name: "default".into(),
			link: None,
			encrypted: false,
			extra: BTreeMap::new(),
		}
	}

	#[test]
	fn part_keys_follow_the_layout() {
		assert_eq!(
			BackupLayout::part_keys("backups/b1", &part(true)),
			vec!["backups/b1/data/db1/t1/all_1_1_0.tar"]
		);
		assert_eq!(
			BackupLayout::part_keys("backups/b1", &part(false)),
			vec![
				"backups/b1/data/db1/t1/all_1_1_0/checksums.txt",
				"backups/b1/data/db1/t1/all_1_1_0/data.bin",
			]
		);
	}

	#[test]
	fn key_segments_are_escaped() {
		assert_eq!(escape_segment("plain"), "plain");
		assert_eq!(escape_segment("we/ird"), "we%2Fird");
		assert_eq!(escape_segment("100%"), "100%25");
	}

	#[tokio::test]
	async fn concat_checksum_is_order_sensitive() {
		let dir = tempfile::tempdir().unwrap();
		std::fs::write(dir.path().join("a"), b"one").unwrap();
		std::fs::write(dir.path().join("b"), b"two").unwrap();

		let forward = file_concat_checksum(dir.path(), &["a".into(), "b".into()])
			.await
			.unwrap();
		let reverse = file_concat_checksum(dir.path(), &["b".into(), "a".into()])
			.await
			.unwrap();
		assert_ne!(forward, reverse);
		assert_eq!(forward, blake3::hash(b"onetwo").to_hex().to_string());
	}
}
