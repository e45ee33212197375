//! Backup metadata: the value model serialized to `backup_struct.json`.
//!
//! The on-disk form is versioned through `meta.version`. Readers keep any
//! unknown fields they encounter and write them back untouched, so metadata
//! written by a newer release survives a round trip through an older one.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const METADATA_VERSION: u32 = 1;

/// Name of the metadata object inside a backup's prefix.
pub const BACKUP_STRUCT: &str = "backup_struct.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupState {
	Creating,
	Created,
	Deleting,
	PartiallyDeleted,
	Failed,
}

impl std::fmt::Display for BackupState {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(match self {
			Self::Creating => "creating",
			Self::Created => "created",
			Self::Deleting => "deleting",
			Self::PartiallyDeleted => "partially_deleted",
			Self::Failed => "failed",
		})
	}
}

impl BackupState {
	/// States whose part bytes may legitimately be the target of dedup
	/// links.
	pub fn holds_data(self) -> bool {
		matches!(self, Self::Created | Self::PartiallyDeleted)
	}
}

/// One immutable data part of a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartMetadata {
	pub database: String,
	pub table: String,
	pub name: String,
	/// blake3 over the tar bytes (tarball parts) or the file bytes in
	/// lexicographic relative-path order (per-file parts).
	pub checksum: String,
	pub size: u64,
	pub files: Vec<String>,
	/// Stored as a single tar object rather than one object per file.
	pub tarball: bool,
	pub disk_name: String,
	/// When set: remote path of the backup whose storage holds the bytes.
	/// Such a part is a dedup reference; link chains never exceed one hop.
	pub link: Option<String>,
	pub encrypted: bool,
	#[serde(flatten)]
	pub extra: BTreeMap<String, serde_json::Value>,
}

impl PartMetadata {
	pub fn is_link(&self) -> bool {
		self.link.as_deref().is_some_and(|link| !link.is_empty())
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableMetadata {
	pub database: String,
	pub name: String,
	pub engine: String,
	pub uuid: Option<String>,
	#[serde(default)]
	pub parts: Vec<PartMetadata>,
	#[serde(flatten)]
	pub extra: BTreeMap<String, serde_json::Value>,
}

impl TableMetadata {
	pub fn new(database: &str, name: &str, engine: &str, uuid: Option<String>) -> Self {
		Self {
			database: database.into(),
			name: name.into(),
			engine: engine.into(),
			uuid,
			parts: Vec::new(),
			extra: BTreeMap::new(),
		}
	}

	/// Part names are unique within a table; appending an existing name
	/// replaces the old entry.
	pub fn add_part(&mut self, part: PartMetadata) {
		self.parts.retain(|existing| existing.name != part.name);
		self.parts.push(part);
	}
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudStorageMetadata {
	#[serde(default)]
	pub disks: Vec<String>,
	#[serde(default)]
	pub encrypted: bool,
	#[serde(flatten)]
	pub extra: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupMeta {
	pub version: u32,
	pub name: String,
	/// Remote key prefix of this backup, e.g. `<prefix>/<name>`.
	pub path: String,
	pub state: BackupState,
	pub start_time: DateTime<Utc>,
	pub end_time: Option<DateTime<Utc>>,
	pub hostname: String,
	pub clickhouse_version: String,
	pub schema_only: bool,
	pub encrypted: bool,
	#[serde(default)]
	pub labels: BTreeMap<String, String>,
	/// Bytes referenced by this backup, links included.
	pub size: u64,
	/// Bytes physically stored under this backup's own prefix.
	pub real_size: u64,
	#[serde(flatten)]
	pub extra: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupMetadata {
	pub meta: BackupMeta,
	#[serde(default)]
	pub tables: Vec<TableMetadata>,
	#[serde(default)]
	pub cloud_storage: CloudStorageMetadata,
	#[serde(default)]
	pub s3_revisions: BTreeMap<String, u64>,
	#[serde(flatten)]
	pub extra: BTreeMap<String, serde_json::Value>,
}

impl BackupMetadata {
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		name: String,
		path: String,
		hostname: String,
		clickhouse_version: String,
		schema_only: bool,
		encrypted: bool,
		labels: BTreeMap<String, String>,
	) -> Self {
		Self {
			meta: BackupMeta {
				version: METADATA_VERSION,
				name,
				path,
				state: BackupState::Creating,
				start_time: Utc::now(),
				end_time: None,
				hostname,
				clickhouse_version,
				schema_only,
				encrypted,
				labels,
				size: 0,
				real_size: 0,
				extra: BTreeMap::new(),
			},
			tables: Vec::new(),
			cloud_storage: CloudStorageMetadata::default(),
			s3_revisions: BTreeMap::new(),
			extra: BTreeMap::new(),
		}
	}

	pub fn name(&self) -> &str {
		&self.meta.name
	}

	pub fn state(&self) -> BackupState {
		self.meta.state
	}

	/// Append (or replace) a table and refresh the size accounting.
	pub fn add_table(&mut self, table: TableMetadata) {
		self.tables
			.retain(|existing| !(existing.database == table.database && existing.name == table.name));
		self.tables.push(table);
		self.recalculate_sizes();
	}

	fn recalculate_sizes(&mut self) {
		let mut size = 0;
		let mut real_size = 0;
		for part in self.parts() {
			size += part.size;
			if !part.is_link() {
				real_size += part.size;
			}
		}
		self.meta.size = size;
		self.meta.real_size = real_size;
	}

	pub fn parts(&self) -> impl Iterator<Item = &PartMetadata> {
		self.tables.iter().flat_map(|table| table.parts.iter())
	}

	pub fn has_s3_data(&self) -> bool {
		!self.s3_revisions.is_empty()
	}

	pub fn set_state(&mut self, state: BackupState) {
		self.meta.state = state;
	}

	pub fn mark_created(&mut self) {
		self.meta.state = BackupState::Created;
		self.meta.end_time = Some(Utc::now());
	}

	/// Age relative to now, from the start timestamp.
	pub fn age(&self) -> chrono::Duration {
		Utc::now() - self.meta.start_time
	}

	pub fn to_json(&self) -> Result<Vec<u8>> {
		Ok(serde_json::to_vec_pretty(self)?)
	}

	pub fn from_json(bytes: &[u8]) -> Result<Self> {
		let parsed: Self = serde_json::from_slice(bytes)?;
		if parsed.meta.version > METADATA_VERSION {
			tracing::warn!(
				version = parsed.meta.version,
				supported = METADATA_VERSION,
				backup = %parsed.meta.name,
				"backup metadata written by a newer release; unknown fields are preserved"
			);
		}
		if parsed.meta.name.is_empty() {
			return Err(Error::validation("backup metadata has an empty name"));
		}
		Ok(parsed)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn sample_part(name: &str, size: u64, link: Option<&str>) -> PartMetadata {
		PartMetadata {
			database: "db1".into(),
			table: "t1".into(),
			name: name.into(),
			checksum: "ab".repeat(32),
			size,
			files: vec!["checksums.txt".into(), "data.bin".into()],
			tarball: true,
			disk_name: "default".into(),
			link: link.map(String::from),
			encrypted: true,
			extra: BTreeMap::new(),
		}
	}

	fn sample_backup() -> BackupMetadata {
		let mut backup = BackupMetadata::new(
			"20240101T120000".into(),
			"backups/20240101T120000".into(),
			"ch1.example.net".into(),
			"23.8.2.7".into(),
			false,
			true,
			BTreeMap::from([("purpose".to_string(), "test".to_string())]),
		);
		let mut table = TableMetadata::new("db1", "t1", "MergeTree", None);
		table.add_part(sample_part("all_1_1_0", 1000, None));
		table.add_part(sample_part("all_2_2_0", 500, Some("backups/20231231T120000")));
		backup.add_table(table);
		backup
	}

	#[test]
	fn serialization_round_trips_byte_identically() {
		let backup = sample_backup();
		let first = backup.to_json().unwrap();
		let reloaded = BackupMetadata::from_json(&first).unwrap();
		let second = reloaded.to_json().unwrap();
		assert_eq!(first, second);
		assert_eq!(backup, reloaded);
	}

	#[test]
	fn unknown_fields_survive_a_round_trip() {
		let mut value: serde_json::Value =
			serde_json::from_slice(&sample_backup().to_json().unwrap()).unwrap();
		value["meta"]["future_field"] = serde_json::json!({"nested": true});
		value["another_section"] = serde_json::json!([1, 2, 3]);

		let bytes = serde_json::to_vec_pretty(&value).unwrap();
		let reloaded = BackupMetadata::from_json(&bytes).unwrap();
		assert_eq!(
			reloaded.meta.extra["future_field"],
			serde_json::json!({"nested": true})
		);

		let dumped: serde_json::Value =
			serde_json::from_slice(&reloaded.to_json().unwrap()).unwrap();
		assert_eq!(dumped["another_section"], serde_json::json!([1, 2, 3]));
		assert_eq!(dumped["meta"]["future_field"], serde_json::json!({"nested": true}));
	}

	#[test]
	fn real_size_excludes_linked_parts() {
		let backup = sample_backup();
		assert_eq!(backup.meta.size, 1500);
		assert_eq!(backup.meta.real_size, 1000);
	}

	#[test]
	fn part_names_stay_unique_within_a_table() {
		let mut table = TableMetadata::new("db1", "t1", "MergeTree", None);
		table.add_part(sample_part("all_1_1_0", 100, None));
		table.add_part(sample_part("all_1_1_0", 200, None));
		assert_eq!(table.parts.len(), 1);
		assert_eq!(table.parts[0].size, 200);
	}

	#[test]
	fn states_serialize_snake_case() {
		assert_eq!(
			serde_json::to_string(&BackupState::PartiallyDeleted).unwrap(),
			"\"partially_deleted\""
		);
		assert!(BackupState::PartiallyDeleted.holds_data());
		assert!(!BackupState::Deleting.holds_data());
	}
}
