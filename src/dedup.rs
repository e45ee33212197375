//! Part-level deduplication against prior backups.
//!
//! Before a backup starts, recent backup metadata is folded into an index
//! from (database, table, part name) to where those bytes already live. A
//! freshly frozen part whose checksum matches the indexed entry is recorded
//! as a link instead of being uploaded.

use std::{collections::HashMap, time::Duration};

use tracing::debug;

use crate::metadata::{BackupMetadata, PartMetadata};

#[derive(Debug, Clone)]
pub struct DedupEntry {
	pub checksum: String,
	/// Remote path of the backup that physically owns the bytes. Entries
	/// that were themselves links are collapsed here, so emitted links are
	/// always a single hop.
	pub backup_path: String,
	pub size: u64,
	pub files: Vec<String>,
	pub tarball: bool,
	pub disk_name: String,
	pub encrypted: bool,
}

#[derive(Debug, Default)]
pub struct DedupIndex {
	parts: HashMap<(String, String, String), DedupEntry>,
}

impl DedupIndex {
	/// Fold eligible backups into an index. `backups` must be sorted newest
	/// first: the most recent copy of each part wins.
	pub fn build(backups: &[BackupMetadata], age_limit: Duration, encrypted: bool) -> Self {
		let age_limit = chrono::Duration::from_std(age_limit)
			.unwrap_or_else(|_| chrono::Duration::max_value());
		let mut parts = HashMap::new();

		for backup in backups {
			if !backup.state().holds_data()
				|| backup.meta.schema_only
				|| backup.meta.encrypted != encrypted
				|| backup.age() > age_limit
			{
				continue;
			}

			for table in &backup.tables {
				for part in &table.parts {
					let key = (
						part.database.clone(),
						part.table.clone(),
						part.name.clone(),
					);
					if parts.contains_key(&key) {
						continue;
					}
					let backup_path = match &part.link {
						Some(link) if !link.is_empty() => link.clone(),
						_ => backup.meta.path.clone(),
					};
					parts.insert(
						key,
						DedupEntry {
							checksum: part.checksum.clone(),
							backup_path,
							size: part.size,
							files: part.files.clone(),
							tarball: part.tarball,
							disk_name: part.disk_name.clone(),
							encrypted: part.encrypted,
						},
					);
				}
			}
		}

		debug!(parts = parts.len(), "built dedup index");
		Self { parts }
	}

	#[allow(clippy::len_without_is_empty)]
	pub fn len(&self) -> usize {
		self.parts.len()
	}

	/// Link metadata for a fresh part, when an identical copy already
	/// exists in storage.
	pub fn deduplicate(
		&self,
		database: &str,
		table: &str,
		part_name: &str,
		checksum: &str,
	) -> Option<PartMetadata> {
		let entry = self.parts.get(&(
			database.to_string(),
			table.to_string(),
			part_name.to_string(),
		))?;
		if entry.checksum != checksum {
			return None;
		}

		Some(PartMetadata {
			database: database.into(),
			table: table.into(),
			name: part_name.into(),
			checksum: entry.checksum.clone(),
			size: entry.size,
			files: entry.files.clone(),
			tarball: entry.tarball,
			disk_name: entry.disk_name.clone(),
			link: Some(entry.backup_path.clone()),
			encrypted: entry.encrypted,
			extra: Default::default(),
		})
	}
}

#[cfg(test)]
mod tests {
	use std::collections::BTreeMap;

	use super::*;
	use crate::metadata::{BackupState, TableMetadata};

	fn backup_with_part(name: &str, checksum: &str, link: Option<&str>) -> BackupMetadata {
		let mut backup = BackupMetadata::new(
			name.into(),
			format!("backups/{name}"),
			"host1".into(),
			"23.8.1.1".into(),
			false,
			true,
			BTreeMap::new(),
		);
		backup.set_state(BackupState::Created);
		let mut table = TableMetadata::new("db1", "t1", "MergeTree", None);
		table.add_part(PartMetadata {
			database: "db1".into(),
			table: "t1".into(),
			name: "all_1_1_0".into(),
			checksum: checksum.into(),
			size: 1024,
			files: vec!["data.bin".into()],
			tarball: true,
			disk_name: "default".into(),
			link: link.map(String::from),
			encrypted: true,
			extra: Default::default(),
		});
		backup.add_table(table);
		backup
	}

	#[test]
	fn matching_checksum_yields_a_link() {
		let prior = backup_with_part("b1", "cafe", None);
		let index = DedupIndex::build(&[prior], Duration::from_secs(3600), true);

		let part = index.deduplicate("db1", "t1", "all_1_1_0", "cafe").unwrap();
		assert_eq!(part.link.as_deref(), Some("backups/b1"));
		assert_eq!(part.size, 1024);

		assert!(index.deduplicate("db1", "t1", "all_1_1_0", "beef").is_none());
		assert!(index.deduplicate("db1", "t1", "all_9_9_0", "cafe").is_none());
	}

	#[test]
	fn links_collapse_to_one_hop() {
		// b2's copy of the part is itself a link to b0.
		let newer = backup_with_part("b2", "cafe", Some("backups/b0"));
		let index = DedupIndex::build(&[newer], Duration::from_secs(3600), true);

		let part = index.deduplicate("db1", "t1", "all_1_1_0", "cafe").unwrap();
		assert_eq!(part.link.as_deref(), Some("backups/b0"));
	}

	#[test]
	fn newest_copy_wins() {
		let newer = backup_with_part("b2", "cafe", None);
		let older = backup_with_part("b1", "cafe", None);
		// Sorted newest first.
		let index = DedupIndex::build(&[newer, older], Duration::from_secs(3600), true);
		let part = index.deduplicate("db1", "t1", "all_1_1_0", "cafe").unwrap();
		assert_eq!(part.link.as_deref(), Some("backups/b2"));
	}

	#[test]
	fn ineligible_backups_are_ignored() {
		let mut schema_only = backup_with_part("b1", "cafe", None);
		schema_only.meta.schema_only = true;

		let mut deleting = backup_with_part("b2", "cafe", None);
		deleting.set_state(BackupState::Deleting);

		let plaintext = backup_with_part("b3", "cafe", None);

		let index = DedupIndex::build(
			&[schema_only, deleting],
			Duration::from_secs(3600),
			true,
		);
		assert_eq!(index.len(), 0);

		// Encryption flag mismatch.
		let index = DedupIndex::build(&[plaintext], Duration::from_secs(3600), false);
		assert_eq!(index.len(), 0);
	}
}
