use std::{
	collections::BTreeMap,
	path::{Path, PathBuf},
	time::Duration,
};

use serde::{Deserialize, Deserializer};
use tracing::debug;

use crate::error::{Error, Result};

/// Default config file location.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/chbak/chbak.toml";

/// Tool configuration, loaded from a sectioned TOML file.
///
/// Every key has a default, so an empty (or missing-section) file is valid.
/// Unknown keys are ignored to keep old configs working across releases.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
	#[serde(default)]
	pub main: MainConfig,
	#[serde(default)]
	pub clickhouse: ClickhouseConfig,
	#[serde(default)]
	pub storage: StorageConfig,
	#[serde(default)]
	pub encryption: EncryptionConfig,
	#[serde(default)]
	pub backup: BackupConfig,
	#[serde(default)]
	pub restore: RestoreConfig,
	#[serde(default)]
	pub zookeeper: ZookeeperConfig,
	#[serde(default)]
	pub cloud_storage: CloudStorageConfig,
	#[serde(default)]
	pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MainConfig {
	/// System user the DB files belong to. The privilege drop itself happens
	/// outside the engine; the name is kept for operators' reference.
	pub user: String,
	pub group: String,
}

impl Default for MainConfig {
	fn default() -> Self {
		Self {
			user: "clickhouse".into(),
			group: "clickhouse".into(),
		}
	}
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClickhouseConfig {
	pub host: String,
	pub port: u16,
	pub protocol: Protocol,
	pub user: Option<String>,
	pub password: Option<String>,
	pub ca_path: Option<PathBuf>,
	pub insecure: bool,
	#[serde(deserialize_with = "duration")]
	pub timeout: Duration,
	/// FREEZE can take much longer than a regular statement on large tables.
	#[serde(deserialize_with = "duration")]
	pub freeze_timeout: Duration,
	/// Root of the server's local data directory.
	pub data_path: PathBuf,
}

impl Default for ClickhouseConfig {
	fn default() -> Self {
		Self {
			host: "localhost".into(),
			port: 8123,
			protocol: Protocol::Http,
			user: None,
			password: None,
			ca_path: None,
			insecure: false,
			timeout: Duration::from_secs(180),
			freeze_timeout: Duration::from_secs(45 * 60),
			data_path: "/var/lib/clickhouse".into(),
		}
	}
}

impl ClickhouseConfig {
	pub fn base_url(&self) -> String {
		let scheme = match self.protocol {
			Protocol::Http => "http",
			Protocol::Https => "https",
		};
		format!("{scheme}://{}:{}/", self.host, self.port)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
	Http,
	Https,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
	/// Object storage vendor. Only `s3` (and S3-compatible endpoints) is
	/// supported.
	pub r#type: String,
	pub endpoint: Option<String>,
	pub region: Option<String>,
	pub bucket: String,
	/// Key prefix all backups live under.
	pub path: String,
	pub access_key_id: Option<String>,
	pub secret_access_key: Option<String>,
	/// Most non-AWS endpoints require path-style addressing.
	pub force_path_style: bool,
	/// Multipart part size. Grown automatically when an upload would
	/// otherwise exceed the part-count limit.
	pub part_size: u64,
	/// Uploads with an estimated size up to this use a single PUT.
	pub multipart_threshold: u64,
	/// Concurrent part-upload workers per upload.
	pub concurrency: usize,
	pub max_attempts: u32,
	#[serde(deserialize_with = "duration")]
	pub retry_base: Duration,
	#[serde(deserialize_with = "duration")]
	pub retry_cap: Duration,
	/// Bounded-queue capacity between pipeline stages, in chunks.
	pub queue_capacity: usize,
	/// Chunk size for local file reads and download streams.
	pub chunk_size: usize,
	/// Objects per DeleteObjects request.
	pub bulk_delete_chunk_size: usize,
}

impl Default for StorageConfig {
	fn default() -> Self {
		Self {
			r#type: "s3".into(),
			endpoint: None,
			region: None,
			bucket: String::new(),
			path: String::new(),
			access_key_id: None,
			secret_access_key: None,
			force_path_style: true,
			part_size: 8 * 1024 * 1024,
			multipart_threshold: 32 * 1024 * 1024,
			concurrency: 4,
			max_attempts: 5,
			retry_base: Duration::from_secs(1),
			retry_cap: Duration::from_secs(30),
			queue_capacity: 8,
			chunk_size: 1024 * 1024,
			bulk_delete_chunk_size: 1000,
		}
	}
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EncryptionConfig {
	pub r#type: EncryptionKind,
	/// 64 hex characters, or a raw 32-byte string.
	pub key: Option<String>,
	/// Plaintext bytes sealed per encrypted frame.
	pub chunk_size: usize,
}

impl Default for EncryptionConfig {
	fn default() -> Self {
		Self {
			r#type: EncryptionKind::None,
			key: None,
			chunk_size: 8 * 1024 * 1024,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncryptionKind {
	#[default]
	None,
	#[serde(rename = "xchacha20poly1305")]
	XChaCha20Poly1305,
}

impl EncryptionConfig {
	pub fn enabled(&self) -> bool {
		self.r#type != EncryptionKind::None
	}

	/// Decode the configured key.
	pub fn key_bytes(&self) -> Result<[u8; 32]> {
		let key = self
			.key
			.as_deref()
			.ok_or_else(|| Error::config("encryption.key is required when encryption is on"))?;

		let bytes = if key.len() == 64 {
			hex::decode(key)
				.map_err(|err| Error::config(format!("encryption.key is not valid hex: {err}")))?
		} else {
			key.as_bytes().to_vec()
		};

		<[u8; 32]>::try_from(bytes.as_slice()).map_err(|_| {
			Error::config("encryption.key must be 32 bytes (or 64 hex characters)")
		})
	}
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
	/// Skip the backup (returning the latest one) when the last successful
	/// backup on this host is younger than this.
	#[serde(deserialize_with = "opt_duration")]
	pub min_interval: Option<Duration>,
	/// Only backups started within this window are considered for dedup.
	#[serde(deserialize_with = "duration")]
	pub deduplication_age_limit: Duration,
	pub validate_part_after_upload: bool,
	/// Number of newest backups `purge` always keeps. 0 keeps them all.
	pub retain_count: usize,
	#[serde(deserialize_with = "opt_duration")]
	pub retain_time: Option<Duration>,
	/// Parts with at least this many files upload as one tar object.
	pub tarball_file_threshold: usize,
	/// Labels applied to every backup, merged under CLI `-l` pairs.
	pub labels: BTreeMap<String, String>,
}

impl Default for BackupConfig {
	fn default() -> Self {
		Self {
			min_interval: None,
			deduplication_age_limit: Duration::from_secs(7 * 24 * 3600),
			validate_part_after_upload: false,
			retain_count: 0,
			retain_time: None,
			tarball_file_threshold: 10,
			labels: BTreeMap::new(),
		}
	}
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RestoreConfig {
	/// Rewrite Replicated*MergeTree engines to their plain counterparts.
	pub force_non_replicated: bool,
	/// Replica name written into replicated engine definitions.
	pub override_replica_name: Option<String>,
	/// Crash-resume progress index.
	pub state_file: PathBuf,
}

impl Default for RestoreConfig {
	fn default() -> Self {
		Self {
			force_non_replicated: false,
			override_replica_name: Some("{replica}".into()),
			state_file: "/var/lib/chbak/restore-state.json".into(),
		}
	}
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ZookeeperConfig {
	/// `host:port` pairs. Empty disables ZooKeeper-dependent steps.
	pub hosts: Vec<String>,
	/// Chroot prefix applied to all paths.
	pub root_path: String,
	#[serde(deserialize_with = "duration")]
	pub timeout: Duration,
}

impl Default for ZookeeperConfig {
	fn default() -> Self {
		Self {
			hosts: Vec::new(),
			root_path: String::new(),
			timeout: Duration::from_secs(10),
		}
	}
}

impl ZookeeperConfig {
	pub fn connect_string(&self) -> String {
		let mut s = self.hosts.join(",");
		if !self.root_path.is_empty() {
			s.push_str(&self.root_path);
		}
		s
	}
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CloudStorageConfig {
	/// Encrypt cloud-storage shadow tarballs.
	pub encryption: bool,
}

impl Default for CloudStorageConfig {
	fn default() -> Self {
		Self { encryption: true }
	}
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
	/// Baseline level when no `-v` flags and no $RUST_LOG are given.
	pub level: String,
}

impl Default for LoggingConfig {
	fn default() -> Self {
		Self {
			level: "info".into(),
		}
	}
}

impl Config {
	pub fn load(path: &Path) -> Result<Self> {
		debug!(?path, "loading config");
		let text = std::fs::read_to_string(path)
			.map_err(|err| Error::config(format!("reading {}: {err}", path.display())))?;
		let config: Config = toml::from_str(&text)
			.map_err(|err| Error::config(format!("parsing {}: {err}", path.display())))?;
		config.validate()?;
		Ok(config)
	}

	fn validate(&self) -> Result<()> {
		if self.storage.r#type != "s3" {
			return Err(Error::config(format!(
				"unsupported storage.type {:?} (only \"s3\" is supported)",
				self.storage.r#type
			)));
		}
		if self.encryption.enabled() {
			self.encryption.key_bytes()?;
			if self.encryption.chunk_size == 0 {
				return Err(Error::config("encryption.chunk_size must be non-zero"));
			}
		}
		if self.storage.concurrency == 0 || self.storage.queue_capacity == 0 {
			return Err(Error::config(
				"storage.concurrency and storage.queue_capacity must be non-zero",
			));
		}
		Ok(())
	}

	/// Apply the global connection override flags on top of the file.
	pub fn apply_overrides(
		&mut self,
		protocol: Option<Protocol>,
		port: Option<u16>,
		ca_path: Option<PathBuf>,
		insecure: bool,
	) {
		if let Some(protocol) = protocol {
			self.clickhouse.protocol = protocol;
		}
		if let Some(port) = port {
			self.clickhouse.port = port;
		}
		if let Some(ca_path) = ca_path {
			self.clickhouse.ca_path = Some(ca_path);
		}
		if insecure {
			self.clickhouse.insecure = true;
		}
	}
}

fn duration<'de, D: Deserializer<'de>>(de: D) -> Result<Duration, D::Error> {
	let text = String::deserialize(de)?;
	humantime::parse_duration(&text).map_err(serde::de::Error::custom)
}

fn opt_duration<'de, D: Deserializer<'de>>(de: D) -> Result<Option<Duration>, D::Error> {
	let text = Option::<String>::deserialize(de)?;
	text.map(|t| humantime::parse_duration(&t).map_err(serde::de::Error::custom))
		.transpose()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn empty_config_gets_defaults() {
		let config: Config = toml::from_str("").unwrap();
		assert_eq!(config.clickhouse.port, 8123);
		assert_eq!(config.storage.part_size, 8 * 1024 * 1024);
		assert_eq!(
			config.backup.deduplication_age_limit,
			Duration::from_secs(7 * 24 * 3600)
		);
		assert!(!config.encryption.enabled());
	}

	#[test]
	fn sections_parse_with_humantime_durations() {
		let config: Config = toml::from_str(
			r#"
			[clickhouse]
			host = "ch1.example.net"
			timeout = "30s"

			[backup]
			min_interval = "1h"
			retain_count = 2

			[storage]
			bucket = "backups"
			path = "cluster-a"

			[encryption]
			type = "xchacha20poly1305"
			key = "0000000000000000000000000000000000000000000000000000000000000000"
			chunk_size = 8192
			"#,
		)
		.unwrap();

		assert_eq!(config.clickhouse.host, "ch1.example.net");
		assert_eq!(config.clickhouse.timeout, Duration::from_secs(30));
		assert_eq!(config.backup.min_interval, Some(Duration::from_secs(3600)));
		assert_eq!(config.backup.retain_count, 2);
		assert!(config.encryption.enabled());
		assert_eq!(config.encryption.key_bytes().unwrap(), [0u8; 32]);
	}

	#[test]
	fn raw_key_must_be_32_bytes() {
		let enc = EncryptionConfig {
			r#type: EncryptionKind::XChaCha20Poly1305,
			key: Some("too short".into()),
			chunk_size: 8192,
		};
		assert!(enc.key_bytes().is_err());

		let enc = EncryptionConfig {
			key: Some("0123456789abcdef0123456789abcdef".into()),
			..enc
		};
		assert_eq!(enc.key_bytes().unwrap(), *b"0123456789abcdef0123456789abcdef");
	}

	#[test]
	fn non_s3_storage_is_rejected() {
		let config: Config = toml::from_str("[storage]\ntype = \"gcs\"").unwrap();
		assert!(config.validate().is_err());
	}
}
