//! Deleting backups, with cross-backup link reference counting.
//!
//! Another backup's part that carries `link == target.path` depends on the
//! target's bytes, so those parts are retained and the target becomes
//! PARTIALLY_DELETED instead of disappearing. Every incoming link counts as
//! a hard reference.

use std::collections::HashSet;

use tracing::{debug, info, warn};

use crate::{
	error::{Error, Result},
	metadata::{BackupMetadata, BackupState, PartMetadata},
};

use super::BackupContext;

type PartKey = (String, String, String);

fn part_key(part: &PartMetadata) -> PartKey {
	(
		part.database.clone(),
		part.table.clone(),
		part.name.clone(),
	)
}

/// Delete one backup by name. Returns the deleted name and an optional
/// advisory message.
pub async fn delete(ctx: &BackupContext, name: &str) -> Result<(String, Option<String>)> {
	let backups = ctx.layout.get_backups().await?;
	let target = backups
		.iter()
		.find(|backup| backup.name() == name)
		.cloned()
		.ok_or_else(|| Error::not_found(format!("no backup named {name:?}")))?;

	delete_backup(ctx, &backups, target).await
}

/// Purge backups beyond the retention policy (newest-count and age bounds,
/// both honored when both are configured). Returns the processed names.
pub async fn purge(ctx: &BackupContext) -> Result<Vec<String>> {
	let retain_count = ctx.config.backup.retain_count;
	let retain_time = ctx
		.config
		.backup
		.retain_time
		.map(|time| chrono::Duration::from_std(time).unwrap_or_else(|_| chrono::Duration::max_value()));
	if retain_count == 0 && retain_time.is_none() {
		info!("no retention configured, nothing to purge");
		return Ok(Vec::new());
	}

	let backups = ctx.layout.get_backups().await?;
	let candidates = purge_candidates(&backups, retain_count, retain_time);

	let mut deleted = Vec::new();
	// Oldest first, with a fresh view per step: deleting an old backup can
	// change what still references the next one.
	for name in candidates.into_iter().rev() {
		ctx.check_interrupted()?;
		let backups = ctx.layout.get_backups().await?;
		let Some(target) = backups.iter().find(|backup| backup.name() == name).cloned() else {
			continue;
		};

		if target.state() == BackupState::PartiallyDeleted
			&& !referenced_parts(&backups, &target).is_empty()
		{
			debug!(backup = %name, "still referenced by dedup links, skipping purge");
			continue;
		}

		delete_backup(ctx, &backups, target).await?;
		deleted.push(name);
	}

	Ok(deleted)
}

/// Backups the retention policy no longer protects, in the given
/// (newest-first) order. Both bounds must agree when both are configured.
/// Leftovers of crashed or interrupted runs (CREATING, FAILED, DELETING)
/// never count against `retain_count`; they are reclaimed by age alone,
/// once they are old enough to be certainly dead.
fn purge_candidates(
	backups: &[BackupMetadata],
	retain_count: usize,
	retain_time: Option<chrono::Duration>,
) -> Vec<String> {
	if retain_count == 0 && retain_time.is_none() {
		return Vec::new();
	}

	let mut candidates = Vec::new();
	let mut created_seen = 0usize;

	for backup in backups {
		let beyond_age = retain_time.map(|limit| backup.age() > limit);
		match backup.state() {
			BackupState::Created | BackupState::PartiallyDeleted => {
				if backup.state() == BackupState::Created {
					created_seen += 1;
				}
				let beyond_count = if retain_count == 0 {
					None
				} else {
					Some(created_seen > retain_count)
				};
				if beyond_count.unwrap_or(true) && beyond_age.unwrap_or(true) {
					candidates.push(backup.name().to_string());
				}
			}
			BackupState::Creating | BackupState::Failed | BackupState::Deleting => {
				if beyond_age == Some(true) {
					candidates.push(backup.name().to_string());
				}
			}
		}
	}

	candidates
}

/// Part names of `target` that other backups link to.
fn referenced_parts(backups: &[BackupMetadata], target: &BackupMetadata) -> HashSet<PartKey> {
	let mut referenced = HashSet::new();
	for backup in backups {
		if backup.name() == target.name() {
			continue;
		}
		for part in backup.parts() {
			if part.link.as_deref() == Some(target.meta.path.as_str()) {
				referenced.insert(part_key(part));
			}
		}
	}
	referenced
}

/// The target's own-stored parts that nothing links to. Linked-out parts
/// hold no bytes here, so they are never deletable (nor retainable).
fn deletable_parts(target: &BackupMetadata, referenced: &HashSet<PartKey>) -> Vec<PartMetadata> {
	target
		.parts()
		.filter(|part| !part.is_link())
		.filter(|part| !referenced.contains(&part_key(part)))
		.cloned()
		.collect()
}

/// Rewrite the metadata to describe only the own-stored parts other
/// backups still need. Only meaningful when `referenced` is non-empty.
fn retain_referenced(target: &mut BackupMetadata, referenced: &HashSet<PartKey>) {
	let mut tables = std::mem::take(&mut target.tables);
	for table in &mut tables {
		table
			.parts
			.retain(|part| !part.is_link() && referenced.contains(&part_key(part)));
	}
	tables.retain(|table| !table.parts.is_empty());
	for table in tables {
		target.add_table(table);
	}
}

async fn delete_backup(
	ctx: &BackupContext,
	backups: &[BackupMetadata],
	mut target: BackupMetadata,
) -> Result<(String, Option<String>)> {
	let name = target.name().to_string();
	let referenced = referenced_parts(backups, &target);

	target.set_state(BackupState::Deleting);
	ctx.layout.upload_backup_metadata(&target).await?;

	let deletable = deletable_parts(&target, &referenced);
	debug!(
		backup = %name,
		deletable = deletable.len(),
		retained = referenced.len(),
		"deleting part data"
	);
	ctx.layout.delete_data_parts(&target, &deletable).await?;

	if referenced.is_empty() {
		ctx.layout.delete_backup(&name).await?;
		info!(backup = %name, "backup deleted");
		return Ok((name, None));
	}

	retain_referenced(&mut target, &referenced);
	target.set_state(BackupState::PartiallyDeleted);
	ctx.layout.upload_backup_metadata(&target).await?;
	warn!(
		backup = %name,
		parts = referenced.len(),
		"backup partially deleted; linked parts are retained"
	);
	Ok((
		name,
		Some(format!(
			"backup is partially deleted: {} part(s) are still linked by other backups",
			referenced.len()
		)),
	))
}

#[cfg(test)]
mod tests {
	use std::collections::BTreeMap;

	use chrono::Utc;

	use super::*;
	use crate::metadata::TableMetadata;

	fn backup(name: &str, age_hours: i64, state: BackupState) -> BackupMetadata {
		let mut backup = BackupMetadata::new(
			name.into(),
			format!("backups/{name}"),
			"host1".into(),
			"23.8.1.1".into(),
			false,
			false,
			BTreeMap::new(),
		);
		backup.set_state(state);
		backup.meta.start_time = Utc::now() - chrono::Duration::hours(age_hours);
		backup
	}

	fn part(name: &str, size: u64, link: Option<&str>) -> PartMetadata {
		PartMetadata {
			database: "db1".into(),
			table: "t1".into(),
			name: name.into(),
			checksum: "cd".repeat(32),
			size,
			files: vec!["data.bin".into()],
			tarball: true,
			disk_name: "default".into(),
			link: link.map(String::from),
			encrypted: false,
			extra: BTreeMap::new(),
		}
	}

	fn with_parts(mut backup: BackupMetadata, parts: Vec<PartMetadata>) -> BackupMetadata {
		let mut table = TableMetadata::new("db1", "t1", "MergeTree", None);
		for part in parts {
			table.add_part(part);
		}
		backup.add_table(table);
		backup
	}

	fn day() -> chrono::Duration {
		chrono::Duration::hours(24)
	}

	#[test]
	fn purge_respects_the_count_bound() {
		// Newest first; only the third created backup falls off the end.
		let backups = vec![
			backup("b3", 1, BackupState::Created),
			backup("b2", 2, BackupState::Created),
			backup("b1", 3, BackupState::Created),
		];
		assert_eq!(purge_candidates(&backups, 2, None), vec!["b1"]);
		assert!(purge_candidates(&backups, 3, None).is_empty());
	}

	#[test]
	fn purge_respects_the_age_bound() {
		let backups = vec![
			backup("b2", 1, BackupState::Created),
			backup("b1", 48, BackupState::Created),
		];
		assert_eq!(purge_candidates(&backups, 0, Some(day())), vec!["b1"]);
	}

	#[test]
	fn purge_requires_both_bounds_when_both_are_set() {
		let backups = vec![
			backup("b3", 1, BackupState::Created),
			backup("b2", 2, BackupState::Created),
			backup("b1", 48, BackupState::Created),
		];
		// b2 is beyond the count but still young; b1 is beyond both.
		assert_eq!(purge_candidates(&backups, 1, Some(day())), vec!["b1"]);
	}

	#[test]
	fn purge_reclaims_broken_backups_by_age_alone() {
		let backups = vec![
			backup("b4", 1, BackupState::Creating),
			backup("b3", 48, BackupState::Creating),
			backup("b2", 48, BackupState::Failed),
			backup("b1", 1, BackupState::Created),
		];
		// With only a count bound, broken leftovers are never touched.
		assert!(purge_candidates(&backups, 1, None).is_empty());
		// With an age bound, only the old ones are reclaimed.
		assert_eq!(purge_candidates(&backups, 0, Some(day())), vec!["b3", "b2"]);
	}

	#[test]
	fn purge_without_retention_selects_nothing() {
		let backups = vec![backup("b1", 999, BackupState::Created)];
		assert!(purge_candidates(&backups, 0, None).is_empty());
	}

	#[test]
	fn referenced_parts_tracks_incoming_links() {
		let owner = with_parts(
			backup("b1", 2, BackupState::Created),
			vec![part("all_1_1_0", 100, None), part("all_2_2_0", 50, None)],
		);
		let linker = with_parts(
			backup("b2", 1, BackupState::Created),
			vec![part("all_1_1_0", 100, Some("backups/b1"))],
		);
		let unrelated = with_parts(
			backup("b3", 1, BackupState::Created),
			vec![part("all_9_9_0", 10, Some("backups/elsewhere"))],
		);

		let all = vec![unrelated, linker, owner.clone()];
		let referenced = referenced_parts(&all, &owner);
		assert_eq!(referenced.len(), 1);
		assert!(referenced.contains(&(
			"db1".to_string(),
			"t1".to_string(),
			"all_1_1_0".to_string()
		)));
	}

	#[test]
	fn delete_partitions_own_parts_by_reference() {
		let mut target = with_parts(
			backup("b1", 2, BackupState::Created),
			vec![
				part("all_1_1_0", 100, None),
				part("all_2_2_0", 50, None),
				part("all_3_3_0", 25, Some("backups/b0")),
			],
		);
		let referenced = HashSet::from([(
			"db1".to_string(),
			"t1".to_string(),
			"all_1_1_0".to_string(),
		)]);

		// Only the unreferenced own-stored part may go; the linked-out part
		// holds no bytes here.
		let deletable = deletable_parts(&target, &referenced);
		assert_eq!(deletable.len(), 1);
		assert_eq!(deletable[0].name, "all_2_2_0");

		retain_referenced(&mut target, &referenced);
		target.set_state(BackupState::PartiallyDeleted);
		let remaining: Vec<&str> = target.parts().map(|part| part.name.as_str()).collect();
		assert_eq!(remaining, vec!["all_1_1_0"]);
		assert_eq!(target.meta.size, 100);
		assert_eq!(target.meta.real_size, 100);
		assert_eq!(target.state(), BackupState::PartiallyDeleted);
	}
}
