//! S3-compatible object storage, wrapped to the few operations the backup
//! layout needs: single and multipart streaming uploads, resumable streaming
//! downloads, prefix listing, and batched deletes.

use std::{
	sync::{
		atomic::{AtomicU32, Ordering},
		Arc,
	},
	time::Duration,
};

use aws_config::{retry::RetryConfig, BehaviorVersion, ConfigLoader, Region};
use aws_credential_types::Credentials;
use aws_sdk_s3::{
	error::DisplayErrorContext,
	primitives::ByteStream,
	types::{CompletedMultipartUpload, CompletedPart, Delete, ObjectIdentifier},
	Client as S3Client,
};
use bytes::{Bytes, BytesMut};
use tokio::{sync::Semaphore, task::JoinSet};
use tracing::{debug, instrument, warn};

use crate::{
	config::StorageConfig,
	error::{Error, Result},
	pipeline::{ChunkRx, ChunkTx},
};

/// The minimum size of a part in a multipart upload (excluding the last
/// part). S3 rejects anything smaller, and in practice "5 MiB" needs a
/// little headroom.
pub const MINIMUM_MULTIPART_PART_SIZE: u64 = 6 * 1024 * 1024;

/// Hard S3 limit on parts per multipart upload.
const MAX_PARTS: u64 = 10_000;

#[derive(Debug, Clone, Copy)]
struct RetrySettings {
	max_attempts: u32,
	base: Duration,
	cap: Duration,
}

impl RetrySettings {
	fn policy(&self) -> backoff::ExponentialBackoff {
		backoff::ExponentialBackoffBuilder::new()
			.with_initial_interval(self.base)
			.with_max_interval(self.cap)
			.with_max_elapsed_time(None)
			.build()
	}
}

/// Retry `op` with exponential backoff until it succeeds, returns a
/// permanent error (NotFound), or the attempt budget runs out.
async fn with_retry<T, F, Fut>(settings: RetrySettings, what: &str, op: F) -> Result<T>
where
	F: Fn() -> Fut,
	Fut: std::future::Future<Output = Result<T>>,
{
	let attempts = AtomicU32::new(0);
	backoff::future::retry(settings.policy(), || async {
		match op().await {
			Ok(value) => Ok(value),
			Err(err @ Error::NotFound(_)) => Err(backoff::Error::permanent(err)),
			Err(err) => {
				let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
				if attempt >= settings.max_attempts {
					Err(backoff::Error::permanent(err))
				} else {
					warn!(%err, attempt, what, "storage call failed, will retry");
					Err(backoff::Error::transient(err))
				}
			}
		}
	})
	.await
}

#[derive(Clone)]
pub struct ObjectStorage {
	client: S3Client,
	bucket: String,
	part_size: u64,
	multipart_threshold: u64,
	concurrency: usize,
	bulk_delete_chunk_size: usize,
	retry: RetrySettings,
}

impl std::fmt::Debug for ObjectStorage {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ObjectStorage")
			.field("bucket", &self.bucket)
			.finish_non_exhaustive()
	}
}

impl ObjectStorage {
	pub async fn new(config: &StorageConfig) -> Result<Self> {
		if config.bucket.is_empty() {
			return Err(Error::config("storage.bucket is required"));
		}

		let mut loader = ConfigLoader::default()
			.behavior_version(BehaviorVersion::v2023_11_09())
			.retry_config(RetryConfig::standard().with_max_attempts(config.max_attempts));
		if let Some(region) = &config.region {
			loader = loader.region(Region::new(region.clone()));
		}
		if let Some(endpoint) = &config.endpoint {
			loader = loader.endpoint_url(endpoint);
		}
		if let (Some(access_key), Some(secret_key)) =
			(&config.access_key_id, &config.secret_access_key)
		{
			loader = loader.credentials_provider(Credentials::from_keys(
				access_key.clone(),
				secret_key.clone(),
				None,
			));
		}
		let sdk_config = loader.load().await;

		let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
			.force_path_style(config.force_path_style)
			.build();

		Ok(Self {
			client: S3Client::from_conf(s3_config),
			bucket: config.bucket.clone(),
			part_size: config.part_size,
			multipart_threshold: config.multipart_threshold,
			concurrency: config.concurrency,
			bulk_delete_chunk_size: config.bulk_delete_chunk_size.clamp(1, 1000),
			retry: RetrySettings {
				max_attempts: config.max_attempts.max(1),
				base: config.retry_base,
				cap: config.retry_cap,
			},
		})
	}

	/// Part size for an upload of `estimated` bytes: the configured size,
	/// grown to stay under the part-count limit.
	pub fn part_size_for(&self, estimated: u64) -> u64 {
		self.part_size
			.max(MINIMUM_MULTIPART_PART_SIZE)
			.max(estimated.div_ceil(MAX_PARTS))
	}

	pub fn uses_multipart(&self, estimated: u64) -> bool {
		estimated > self.multipart_threshold
	}

	/// Upload a small object in one PUT.
	#[instrument(skip(self, data), fields(bytes = data.len()))]
	pub async fn put(&self, key: &str, data: Bytes) -> Result<()> {
		with_retry(self.retry, "put object", || {
			let data = data.clone();
			async move {
				self.client
					.put_object()
					.bucket(&self.bucket)
					.key(key)
					.body(ByteStream::from(data))
					.send()
					.await
					.map_err(|err| {
						Error::storage(format!("putting {key}: {}", DisplayErrorContext(&err)))
					})?;
				Ok(())
			}
		})
		.await
	}

	/// Fetch a small object fully into memory.
	#[instrument(skip(self))]
	pub async fn get(&self, key: &str) -> Result<Bytes> {
		with_retry(self.retry, "get object", || async {
			let output = self
				.client
				.get_object()
				.bucket(&self.bucket)
				.key(key)
				.send()
				.await
				.map_err(|err| {
					let service = err.into_service_error();
					if service.is_no_such_key() {
						Error::not_found(format!("object {key}"))
					} else {
						Error::storage(format!("getting {key}: {}", DisplayErrorContext(&service)))
					}
				})?;
			let data = output.body.collect().await.map_err(|err| {
				Error::storage(format!("reading body of {key}: {err}"))
			})?;
			Ok(data.into_bytes())
		})
		.await
	}

	/// Immediate child "directories" of a prefix (common prefixes), without
	/// the trailing slash.
	pub async fn list_dirs(&self, prefix: &str) -> Result<Vec<String>> {
		let mut dirs = Vec::new();
		let mut token: Option<String> = None;
		loop {
			let response = with_retry(self.retry, "list objects", || {
				let token = token.clone();
				async move {
					let mut request = self
						.client
						.list_objects_v2()
						.bucket(&self.bucket)
						.prefix(prefix)
						.delimiter("/");
					if let Some(token) = token {
						request = request.continuation_token(token);
					}
					request.send().await.map_err(|err| {
						Error::storage(format!(
							"listing {prefix}: {}",
							DisplayErrorContext(&err)
						))
					})
				}
			})
			.await?;

			dirs.extend(response.common_prefixes().iter().filter_map(|p| {
				p.prefix().map(|full| {
					full.trim_start_matches(prefix)
						.trim_end_matches('/')
						.to_string()
				})
			}));

			if response.is_truncated() == Some(true) {
				token = response.next_continuation_token().map(String::from);
			} else {
				return Ok(dirs);
			}
		}
	}

	/// All keys under a prefix.
	pub async fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
		let mut keys = Vec::new();
		let mut token: Option<String> = None;
		loop {
			let response = with_retry(self.retry, "list objects", || {
				let token = token.clone();
				async move {
					let mut request = self
						.client
						.list_objects_v2()
						.bucket(&self.bucket)
						.prefix(prefix);
					if let Some(token) = token {
						request = request.continuation_token(token);
					}
					request.send().await.map_err(|err| {
						Error::storage(format!(
							"listing {prefix}: {}",
							DisplayErrorContext(&err)
						))
					})
				}
			})
			.await?;

			keys.extend(
				response
					.contents()
					.iter()
					.filter_map(|object| object.key().map(String::from)),
			);

			if response.is_truncated() == Some(true) {
				token = response.next_continuation_token().map(String::from);
			} else {
				return Ok(keys);
			}
		}
	}

	/// Delete objects in batches. Missing keys are not an error.
	pub async fn delete_keys(&self, keys: &[String]) -> Result<()> {
		for batch in keys.chunks(self.bulk_delete_chunk_size) {
			debug!(count = batch.len(), "deleting object batch");
			with_retry(self.retry, "delete objects", || async {
				let objects = batch
					.iter()
					.map(|key| {
						ObjectIdentifier::builder()
							.key(key)
							.build()
							.map_err(Error::storage)
					})
					.collect::<Result<Vec<_>>>()?;
				let delete = Delete::builder()
					.set_objects(Some(objects))
					.build()
					.map_err(Error::storage)?;
				self.client
					.delete_objects()
					.bucket(&self.bucket)
					.delete(delete)
					.send()
					.await
					.map_err(|err| {
						Error::storage(format!(
							"deleting batch: {}",
							DisplayErrorContext(&err)
						))
					})?;
				Ok(())
			})
			.await?;
		}
		Ok(())
	}

	/// Sink stage: upload the stream to `key`.
	///
	/// `estimated` must be the exact stream length for single-PUT uploads to
	/// be chosen correctly and for the part size to hold the part-count
	/// limit; it is computed by the caller before the pipeline starts.
	pub async fn upload_stream(&self, key: &str, mut rx: ChunkRx, estimated: u64) -> Result<()> {
		if !self.uses_multipart(estimated) {
			let mut buffer = BytesMut::with_capacity(estimated as usize);
			while let Some(chunk) = rx.next().await? {
				buffer.extend_from_slice(&chunk);
			}
			return self.put(key, buffer.freeze()).await;
		}

		self.upload_multipart(key, rx, estimated).await
	}

	#[instrument(skip(self, rx))]
	async fn upload_multipart(&self, key: &str, mut rx: ChunkRx, estimated: u64) -> Result<()> {
		let part_size = self.part_size_for(estimated) as usize;
		debug!(part_size, estimated, "starting multipart upload");

		let created = with_retry(self.retry, "create multipart upload", || async {
			self.client
				.create_multipart_upload()
				.bucket(&self.bucket)
				.key(key)
				.metadata("Uploader", crate::APP_NAME)
				.send()
				.await
				.map_err(|err| {
					Error::storage(format!(
						"creating multipart upload for {key}: {}",
						DisplayErrorContext(&err)
					))
				})
		})
		.await?;
		let upload_id = created
			.upload_id()
			.ok_or_else(|| Error::storage("no upload ID returned from storage"))?
			.to_string();

		let semaphore = Arc::new(Semaphore::new(self.concurrency));
		let mut tasks: JoinSet<Result<CompletedPart>> = JoinSet::new();
		let mut part_number = 0i32;

		let feed: Result<()> = async {
			let mut buffer = BytesMut::new();
			loop {
				let chunk = rx.next().await?;
				if let Some(chunk) = &chunk {
					buffer.extend_from_slice(chunk);
				}
				let at_eof = chunk.is_none();

				while buffer.len() >= part_size || (at_eof && !buffer.is_empty()) {
					let body = buffer.split_to(buffer.len().min(part_size)).freeze();
					part_number += 1;

					// Acquiring before spawn bounds buffered parts to the
					// worker count.
					let permit = semaphore
						.clone()
						.acquire_owned()
						.await
						.map_err(|_| Error::StageClosed)?;
					let client = self.client.clone();
					let bucket = self.bucket.clone();
					let key = key.to_string();
					let upload_id = upload_id.clone();
					let retry = self.retry;
					let number = part_number;
					tasks.spawn(async move {
						let _permit = permit;
						with_retry(retry, "upload part", || {
							let body = body.clone();
							let client = client.clone();
							let bucket = bucket.clone();
							let key = key.clone();
							let upload_id = upload_id.clone();
							async move {
								let uploaded = client
									.upload_part()
									.bucket(bucket)
									.key(&key)
									.upload_id(upload_id)
									.part_number(number)
									.body(ByteStream::from(body))
									.send()
									.await
									.map_err(|err| {
										Error::storage(format!(
											"uploading part {number} of {key}: {}",
											DisplayErrorContext(&err)
										))
									})?;
								Ok(CompletedPart::builder()
									.set_e_tag(uploaded.e_tag)
									.part_number(number)
									.build())
							}
						})
						.await
					});
				}

				if at_eof {
					return Ok(());
				}
			}
		}
		.await;

		let mut parts = Vec::new();
		let mut failure = feed.err();
		while let Some(joined) = tasks.join_next().await {
			match joined
				.unwrap_or_else(|err| Err(Error::Pipeline(format!("upload worker panicked: {err}"))))
			{
				Ok(part) => parts.push(part),
				Err(err) => {
					failure.get_or_insert(err);
				}
			}
		}

		if let Some(err) = failure {
			debug!(%err, "aborting multipart upload");
			if let Err(abort_err) = self
				.client
				.abort_multipart_upload()
				.bucket(&self.bucket)
				.key(key)
				.upload_id(&upload_id)
				.send()
				.await
			{
				warn!(
					error = %DisplayErrorContext(&abort_err),
					"failed to abort multipart upload; it may linger until bucket lifecycle cleanup"
				);
			}
			return Err(err);
		}

		parts.sort_by_key(|part| part.part_number());
		with_retry(self.retry, "complete multipart upload", || {
			let parts = parts.clone();
			let upload_id = upload_id.clone();
			async move {
				self.client
					.complete_multipart_upload()
					.bucket(&self.bucket)
					.key(key)
					.upload_id(upload_id)
					.multipart_upload(
						CompletedMultipartUpload::builder()
							.set_parts(Some(parts))
							.build(),
					)
					.send()
					.await
					.map_err(|err| {
						Error::storage(format!(
							"completing multipart upload for {key}: {}",
							DisplayErrorContext(&err)
						))
					})?;
				Ok(())
			}
		})
		.await
	}

	/// Generator stage: stream `key`'s bytes, resuming with a ranged read
	/// after transient failures.
	#[instrument(skip(self, tx))]
	pub async fn download_stream(&self, key: &str, tx: ChunkTx) -> Result<()> {
		let mut offset = 0u64;
		let mut attempt = 0u32;

		loop {
			let request = {
				let request = self.client.get_object().bucket(&self.bucket).key(key);
				if offset > 0 {
					request.range(format!("bytes={offset}-"))
				} else {
					request
				}
			};

			let failed = match request.send().await {
				Ok(output) => {
					let mut body = output.body;
					loop {
						match body.try_next().await {
							Ok(Some(chunk)) => {
								offset += chunk.len() as u64;
								attempt = 0;
								tx.send(chunk).await?;
							}
							Ok(None) => return Ok(()),
							Err(err) => {
								break Error::storage(format!(
									"reading {key} at offset {offset}: {err}"
								));
							}
						}
					}
				}
				Err(err) => {
					let service = err.into_service_error();
					if service.is_no_such_key() {
						return Err(Error::not_found(format!("object {key}")));
					}
					Error::storage(format!(
						"downloading {key}: {}",
						DisplayErrorContext(&service)
					))
				}
			};

			attempt += 1;
			if attempt >= self.retry.max_attempts {
				return Err(failed);
			}
			let delay = self
				.retry
				.cap
				.min(self.retry.base.saturating_mul(1 << attempt.min(16)));
			warn!(%failed, attempt, ?delay, "download interrupted, resuming");
			tokio::time::sleep(delay).await;
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn part_size_respects_minimum_and_part_count_limit() {
		let part_size = 8 * 1024 * 1024_u64;
		let pick = |estimated: u64| {
			part_size
				.max(MINIMUM_MULTIPART_PART_SIZE)
				.max(estimated.div_ceil(MAX_PARTS))
		};

		assert_eq!(pick(100), 8 * 1024 * 1024);
		// A 1 TiB object cannot fit in 10k parts of 8 MiB.
		let huge = 1024_u64 * 1024 * 1024 * 1024;
		assert!(pick(huge) >= huge.div_ceil(MAX_PARTS));
	}
}
