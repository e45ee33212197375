//! The backup orchestrator.
//!
//! Consistency comes from optimistic concurrency control: the mtime of each
//! table's on-disk DDL file is snapshotted before the freeze and re-checked
//! after it. A concurrent schema change moves the mtime, and the table is
//! skipped rather than backed up with mismatched metadata and data.

use std::{
	collections::BTreeMap,
	time::{Duration, SystemTime},
};

use bytes::Bytes;
use tracing::{debug, info, instrument, warn};

use crate::{
	clickhouse::{models::Disk, schema, Database, Table},
	dedup::DedupIndex,
	error::{Error, Result},
	layout,
	metadata::{BackupMetadata, BackupState, PartMetadata, TableMetadata},
};

use super::BackupContext;

#[derive(Debug, Clone, Default)]
pub struct BackupOptions {
	pub name: String,
	pub databases: Option<Vec<String>>,
	pub tables: Option<Vec<String>>,
	pub force: bool,
	pub labels: BTreeMap<String, String>,
	pub schema_only: bool,
}

impl BackupOptions {
	/// Database and table filters select targets in incompatible ways and
	/// cannot be combined.
	pub fn validate(&self) -> Result<()> {
		if self.databases.is_some() && self.tables.is_some() {
			return Err(Error::config(
				"database and table filters are mutually exclusive",
			));
		}
		Ok(())
	}
}

/// The prior backup that makes this run redundant under `min_interval`: the
/// most recent successfully created backup from this host, when it is still
/// younger than the interval and the run is not forced. `existing` is
/// newest first.
fn min_interval_skip<'e>(
	existing: &'e [BackupMetadata],
	hostname: &str,
	min_interval: Option<Duration>,
	force: bool,
) -> Option<&'e BackupMetadata> {
	if force {
		return None;
	}
	let min_interval = chrono::Duration::from_std(min_interval?)
		.unwrap_or_else(|_| chrono::Duration::max_value());
	existing
		.iter()
		.find(|backup| {
			backup.state() == BackupState::Created && backup.meta.hostname == hostname
		})
		.filter(|recent| recent.age() < min_interval)
}

/// Perform a backup. Returns the backup name and an optional advisory
/// message for stderr (e.g. when `min_interval` skipped the run).
pub async fn backup(
	ctx: &BackupContext,
	options: BackupOptions,
) -> Result<(String, Option<String>)> {
	options.validate()?;

	let existing = ctx.layout.get_backups().await?;
	if existing.iter().any(|backup| backup.name() == options.name) {
		return Err(Error::config(format!(
			"backup {:?} already exists",
			options.name
		)));
	}

	if let Some(recent) = min_interval_skip(
		&existing,
		&ctx.hostname,
		ctx.config.backup.min_interval,
		options.force,
	) {
		info!(last = recent.name(), "skipping backup per min_interval");
		return Ok((
			recent.name().to_string(),
			Some("backup skipped: the last backup is younger than backup.min_interval".into()),
		));
	}

	let targets = resolve_targets(ctx, &options).await?;
	let dedup = DedupIndex::build(
		&existing,
		ctx.config.backup.deduplication_age_limit,
		ctx.layout.encryption_enabled(),
	);
	debug!(indexed_parts = dedup.len(), "deduplication index ready");
	drop(existing);

	let mut labels = ctx.config.backup.labels.clone();
	labels.extend(options.labels.clone());

	let mut backup = BackupMetadata::new(
		options.name.clone(),
		ctx.layout.backup_path(&options.name),
		ctx.hostname.clone(),
		ctx.ch.version().await?,
		options.schema_only,
		ctx.layout.encryption_enabled(),
		labels,
	);

	// Upload immediately so a crashed run is discoverable (and reclaimable).
	ctx.layout.upload_backup_metadata(&backup).await?;

	let disks = ctx.ch.get_disks().await?;
	let result = backup_databases(ctx, &mut backup, &targets, &disks, &options, &dedup).await;

	match result {
		Ok(()) => {
			backup.mark_created();
			ctx.layout.upload_backup_metadata(&backup).await?;
			info!(backup = backup.name(), size = backup.meta.size, "backup created");
			Ok((options.name, None))
		}
		Err(err) => {
			// Leave the backup in CREATING state: partial data stays for
			// inspection or retry, and purge can reclaim it later.
			warn!(%err, backup = backup.name(), "backup failed, leaving metadata in creating state");
			if let Err(upload_err) = ctx.layout.upload_backup_metadata(&backup).await {
				warn!(%upload_err, "could not upload metadata of the failed backup");
			}
			Err(err)
		}
	}
}

struct Target {
	database: Database,
	tables: Option<Vec<String>>,
}

async fn resolve_targets(ctx: &BackupContext, options: &BackupOptions) -> Result<Vec<Target>> {
	let all: Vec<Database> = ctx.ch.get_databases().await?;

	if let Some(tables) = &options.tables {
		// `db.table` pairs; the database set is implied.
		let mut by_db: BTreeMap<String, Vec<String>> = BTreeMap::new();
		for spec in tables {
			let (db, table) = spec.split_once('.').ok_or_else(|| {
				Error::config(format!("table filter {spec:?} is not of the form db.table"))
			})?;
			by_db.entry(db.to_string()).or_default().push(table.to_string());
		}

		let mut targets = Vec::new();
		for (db, tables) in by_db {
			let database = all
				.iter()
				.find(|candidate| candidate.name == db)
				.cloned()
				.ok_or_else(|| Error::not_found(format!("database {db}")))?;
			targets.push(Target {
				database,
				tables: Some(tables),
			});
		}
		return Ok(targets);
	}

	let selected: Vec<Database> = match &options.databases {
		Some(names) => names
			.iter()
			.map(|name| {
				all.iter()
					.find(|candidate| candidate.name == *name)
					.cloned()
					.ok_or_else(|| Error::not_found(format!("database {name}")))
			})
			.collect::<Result<_>>()?,
		None => all,
	};

	Ok(selected
		.into_iter()
		.map(|database| Target {
			database,
			tables: None,
		})
		.collect())
}

async fn backup_databases(
	ctx: &BackupContext,
	backup: &mut BackupMetadata,
	targets: &[Target],
	disks: &[Disk],
	options: &BackupOptions,
	dedup: &DedupIndex,
) -> Result<()> {
	for target in targets {
		ctx.check_interrupted()?;
		let db = &target.database;
		debug!(database = %db.name, "backing up database");

		if !db.is_external() {
			let ddl = ctx.ch.show_create_database(&db.name).await?;
			ctx.layout
				.upload_database_create_statement(backup.name(), &db.name, Bytes::from(ddl))
				.await?;
		}

		let tables = ctx
			.ch
			.get_tables(&db.name, target.tables.as_deref())
			.await?;

		// OCC anchor: metadata mtimes observed before any freeze.
		let mut mtimes: BTreeMap<String, SystemTime> = BTreeMap::new();
		for table in &tables {
			match ddl_mtime(table) {
				Some(mtime) => {
					mtimes.insert(table.name.clone(), mtime);
				}
				None => warn!(
					table = %table.qualified_name(),
					"cannot stat table metadata, skipping"
				),
			}
		}

		for table in &tables {
			ctx.check_interrupted()?;
			let Some(observed_mtime) = mtimes.get(&table.name).copied() else {
				continue;
			};

			let outcome = backup_table(ctx, backup, table, disks, options, dedup, observed_mtime).await;

			// Scoped cleanup: frozen data never outlives the table's turn,
			// whether the body succeeded, skipped, or failed.
			if !options.schema_only && schema::is_merge_tree(&table.engine) {
				if let Err(err) = ctx.ch.unfreeze_table(backup.name(), table, disks) {
					warn!(%err, table = %table.qualified_name(), "cleaning frozen data failed");
				}
			}

			if let Some(table_meta) = outcome? {
				backup.add_table(table_meta);
				ctx.layout.upload_backup_metadata(backup).await?;
			}
		}
	}

	backup_cloud_storage(ctx, backup, disks).await?;

	if let Err(err) = ctx.ch.cleanup_shadow(backup.name(), disks) {
		warn!(%err, "cleaning shadow directories failed");
	}
	Ok(())
}

/// Back up one table. `Ok(None)` means the table was skipped (dropped
/// concurrently, or its metadata changed between freeze and re-check).
#[instrument(skip_all, fields(table = %table.qualified_name()))]
async fn backup_table(
	ctx: &BackupContext,
	backup: &BackupMetadata,
	table: &Table,
	disks: &[Disk],
	options: &BackupOptions,
	dedup: &DedupIndex,
	observed_mtime: SystemTime,
) -> Result<Option<TableMetadata>> {
	let ddl = match std::fs::read(&table.metadata_path) {
		Ok(ddl) => ddl,
		Err(err) => {
			warn!(%err, "table metadata unreadable, skipping table");
			return Ok(None);
		}
	};

	let data_wanted = !options.schema_only && schema::is_merge_tree(&table.engine);
	if data_wanted {
		if let Err(err) = ctx.ch.freeze_table(backup.name(), table).await {
			if ctx.ch.table_exists(&table.database, &table.name).await? {
				return Err(err);
			}
			warn!("table was dropped during backup, skipping");
			return Ok(None);
		}
	}

	// OCC re-check: a moved mtime means the schema changed under us; the
	// freeze is discarded by the caller's cleanup.
	if ddl_mtime(table) != Some(observed_mtime) {
		warn!("table metadata changed during backup, skipping table");
		return Ok(None);
	}

	ctx.layout
		.upload_table_create_statement(backup.name(), &table.database, &table.name, Bytes::from(ddl))
		.await?;

	let mut table_meta = TableMetadata::new(
		&table.database,
		&table.name,
		&table.engine,
		table.uuid.clone(),
	);

	if data_wanted {
		backup_frozen_parts(ctx, backup, table, disks, dedup, &mut table_meta).await?;
	}

	Ok(Some(table_meta))
}

async fn backup_frozen_parts(
	ctx: &BackupContext,
	backup: &BackupMetadata,
	table: &Table,
	disks: &[Disk],
	dedup: &DedupIndex,
	table_meta: &mut TableMetadata,
) -> Result<()> {
	let frozen = ctx.ch.list_frozen_parts(table, disks, backup.name())?;
	debug!(parts = frozen.len(), "frozen parts found");

	let mut uploaded: Vec<PartMetadata> = Vec::new();
	for part in frozen {
		ctx.check_interrupted()?;

		let on_cloud_disk = disks
			.iter()
			.find(|disk| disk.name == part.disk_name)
			.is_some_and(Disk::is_cloud);
		if on_cloud_disk {
			// Only pointer files exist locally; they travel in the disk's
			// shadow tarball, so the part is recorded without an upload.
			let checksum =
				layout::file_concat_checksum(&part.path, &part.file_paths()).await?;
			table_meta.add_part(PartMetadata {
				database: part.database.clone(),
				table: part.table.clone(),
				name: part.name.clone(),
				checksum,
				size: part.total_size(),
				files: part.file_names(),
				tarball: false,
				disk_name: part.disk_name.clone(),
				link: None,
				encrypted: false,
				extra: Default::default(),
			});
			continue;
		}

		let tarball = part.files.len() >= ctx.config.backup.tarball_file_threshold;
		let checksum = ctx.layout.frozen_part_checksum(&part, tarball).await?;

		if let Some(linked) =
			dedup.deduplicate(&part.database, &part.table, &part.name, &checksum)
		{
			debug!(part = %part.name, link = ?linked.link, "part deduplicated");
			ctx.ch.remove_frozen_part(&part)?;
			table_meta.add_part(linked);
		} else {
			let meta = ctx
				.layout
				.upload_data_part(
					backup.name(),
					&part,
					tarball,
					checksum,
					ctx.layout.encryption_enabled(),
				)
				.await?;
			uploaded.push(meta.clone());
			table_meta.add_part(meta);
		}
	}

	ctx.layout.wait().await?;

	if ctx.config.backup.validate_part_after_upload {
		let mut broken = Vec::new();
		for part in &uploaded {
			if !ctx.layout.check_data_part(&backup.meta.path, part).await? {
				warn!(part = %part.name, "uploaded part failed verification");
				broken.push(part.name.clone());
			}
		}
		if !broken.is_empty() {
			return Err(Error::validation(format!(
				"uploaded parts are broken: {}",
				broken.join(", ")
			)));
		}
	}

	Ok(())
}

async fn backup_cloud_storage(
	ctx: &BackupContext,
	backup: &mut BackupMetadata,
	disks: &[Disk],
) -> Result<()> {
	let encrypt = ctx.config.cloud_storage.encryption && ctx.layout.encryption_enabled();

	for disk in disks.iter().filter(|disk| disk.is_cloud()) {
		ctx.check_interrupted()?;
		let shadow = ctx.ch.shadow_root(disk, backup.name());

		if let Some(revision) = ctx.ch.shadow_revision(disk, backup.name()) {
			backup.s3_revisions.insert(disk.name.clone(), revision);
		}

		if ctx
			.layout
			.upload_cloud_storage_metadata(backup.name(), &disk.name, &shadow, encrypt)
			.await?
		{
			debug!(disk = %disk.name, "cloud storage shadow uploaded");
			backup.cloud_storage.disks.push(disk.name.clone());
			backup.cloud_storage.encrypted = encrypt;
		} else {
			debug!(disk = %disk.name, "no data frozen on disk, skipping");
		}
	}
	Ok(())
}

fn ddl_mtime(table: &Table) -> Option<SystemTime> {
	std::fs::metadata(&table.metadata_path)
		.and_then(|meta| meta.modified())
		.ok()
}

#[cfg(test)]
mod tests {
	use chrono::Utc;

	use super::*;

	const HOUR: Duration = Duration::from_secs(3600);

	fn created_backup(name: &str, hostname: &str, age_hours: i64) -> BackupMetadata {
		let mut backup = BackupMetadata::new(
			name.into(),
			format!("backups/{name}"),
			hostname.into(),
			"23.8.1.1".into(),
			false,
			false,
			BTreeMap::new(),
		);
		backup.set_state(BackupState::Created);
		backup.meta.start_time = Utc::now() - chrono::Duration::hours(age_hours);
		backup
	}

	#[test]
	fn database_and_table_filters_cannot_be_combined() {
		let options = BackupOptions {
			databases: Some(vec!["db1".into()]),
			tables: Some(vec!["db1.t1".into()]),
			..Default::default()
		};
		assert!(matches!(options.validate(), Err(Error::Config(_))));

		let databases_only = BackupOptions {
			databases: Some(vec!["db1".into()]),
			..Default::default()
		};
		assert!(databases_only.validate().is_ok());

		let tables_only = BackupOptions {
			tables: Some(vec!["db1.t1".into()]),
			..Default::default()
		};
		assert!(tables_only.validate().is_ok());
	}

	#[test]
	fn min_interval_skips_only_recent_backups_from_this_host() {
		let existing = vec![
			created_backup("b2", "host1", 0),
			created_backup("b1", "host1", 48),
		];

		let skipped = min_interval_skip(&existing, "host1", Some(HOUR * 2), false);
		assert_eq!(skipped.map(BackupMetadata::name), Some("b2"));

		// Force mode ignores the interval.
		assert!(min_interval_skip(&existing, "host1", Some(HOUR * 2), true).is_none());
		// Another host's backups don't count.
		assert!(min_interval_skip(&existing, "host9", Some(HOUR * 2), false).is_none());
		// No interval configured.
		assert!(min_interval_skip(&existing, "host1", None, false).is_none());
	}

	#[test]
	fn min_interval_lets_a_stale_backup_through() {
		let existing = vec![created_backup("b1", "host1", 48)];
		assert!(min_interval_skip(&existing, "host1", Some(HOUR * 2), false).is_none());
	}

	#[test]
	fn min_interval_ignores_unfinished_backups() {
		// The newest entry never completed; it must not suppress a retry.
		let mut creating = created_backup("b2", "host1", 0);
		creating.set_state(BackupState::Creating);
		let existing = vec![creating, created_backup("b1", "host1", 48)];

		assert!(min_interval_skip(&existing, "host1", Some(HOUR * 2), false).is_none());
	}
}
