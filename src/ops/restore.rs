//! The restore orchestrator.
//!
//! Tables are re-created through a FIFO retry queue: a table whose
//! dependencies (dictionaries, inner tables, distributed targets) are not
//! there yet fails, goes to the back of the queue, and is retried after the
//! rest. The loop stops once consecutive failures outnumber the remaining
//! queue, i.e. a full pass made no progress.

use std::{
	collections::{BTreeMap, BTreeSet, HashSet, VecDeque},
	path::{Path, PathBuf},
};

use tempfile::TempDir;
use tracing::{debug, info, instrument, warn};

use crate::{
	clickhouse::{models::Disk, schema, Database, Table},
	error::{Error, Result},
	metadata::{BackupMetadata, PartMetadata, TableMetadata},
	restore_state::RestoreState,
	util::quote_ident,
	zookeeper::ZookeeperClient,
};

use super::BackupContext;

#[derive(Debug, Clone, Default)]
pub struct RestoreOptions {
	pub name: String,
	pub databases: Option<Vec<String>>,
	pub schema_only: bool,
	pub include_tables: Vec<String>,
	pub exclude_tables: Vec<String>,
	pub replica_name: Option<String>,
	pub cloud_storage_source_bucket: Option<String>,
	pub cloud_storage_source_path: Option<String>,
	pub cloud_storage_source_endpoint: Option<String>,
	pub cloud_storage_latest: bool,
	pub skip_cloud_storage: bool,
	pub clean_zookeeper: bool,
	pub keep_going: bool,
}

/// A table ready to be re-created: its metadata entry plus the rewritten
/// create statement.
#[derive(Debug, Clone)]
struct RestoreTable {
	database: String,
	name: String,
	engine: String,
	ddl: String,
}

impl RestoreTable {
	fn qualified_name(&self) -> String {
		format!("{}.{}", self.database, self.name)
	}
}

/// Restore a backup. Returns the tables that could not be restored (only
/// non-empty under `keep_going`).
pub async fn restore(ctx: &BackupContext, options: RestoreOptions) -> Result<Vec<String>> {
	let backup = ctx.layout.get_backup_metadata(&options.name).await?;
	if backup.meta.encrypted && !ctx.layout.encryption_enabled() {
		return Err(Error::config(
			"backup is encrypted but no encryption key is configured",
		));
	}

	let include = parse_table_specs(&options.include_tables)?;
	let exclude = parse_table_specs(&options.exclude_tables)?;

	let mut tables_meta: Vec<&TableMetadata> = backup
		.tables
		.iter()
		.filter(|table| match &options.databases {
			Some(databases) => databases.contains(&table.database),
			None => true,
		})
		.collect();

	if !include.is_empty() {
		let present: HashSet<(String, String)> = tables_meta
			.iter()
			.map(|table| (table.database.clone(), table.name.clone()))
			.collect();
		let missing: Vec<String> = include
			.iter()
			.filter(|spec| !present.contains(*spec))
			.map(|(db, table)| format!("{db}.{table}"))
			.collect();
		if !missing.is_empty() {
			return Err(Error::validation(format!(
				"required tables were not found in backup metadata: {}",
				missing.join(", ")
			)));
		}
		tables_meta.retain(|table| {
			include.contains(&(table.database.clone(), table.name.clone()))
		});
	}
	if !exclude.is_empty() {
		tables_meta.retain(|table| {
			!exclude.contains(&(table.database.clone(), table.name.clone()))
		});
	}

	info!(
		backup = backup.name(),
		tables = tables_meta.len(),
		"restoring backup"
	);

	let database_names: Vec<String> = {
		let mut names: Vec<String> = tables_meta
			.iter()
			.map(|table| table.database.clone())
			.collect();
		names.sort();
		names.dedup();
		names
	};
	let live_databases = restore_databases(ctx, &backup, &database_names).await?;

	// Rebuild Table values from stored DDL, rewritten per config.
	let mut to_create = Vec::new();
	for table_meta in &tables_meta {
		to_create.push(build_restore_table(ctx, &backup, table_meta, &live_databases, &options).await?);
	}

	// Tables whose live schema already matches need no re-creation;
	// mismatching ones are dropped first.
	let mut creation_list = Vec::new();
	for table in to_create {
		match ctx.ch.get_table(&table.database, &table.name).await? {
			Some(existing)
				if schema::compare_schema(&existing.create_statement, &table.ddl) =>
			{
				debug!(
					table = %table.qualified_name(),
					"existing schema matches, skipping re-creation"
				);
			}
			Some(existing) => {
				warn!(
					table = %table.qualified_name(),
					"existing schema differs from the backup, re-creating"
				);
				if schema::is_dictionary(&existing.engine) {
					ctx.ch.drop_dictionary(&table.database, &table.name).await?;
				} else {
					ctx.ch.drop_table(&table.database, &table.name).await?;
				}
				creation_list.push(table);
			}
			None => creation_list.push(table),
		}
	}

	// Process merge-tree, then other, then distributed, then views:
	// dependents after their likely dependencies.
	creation_list.sort_by_key(|table| engine_order(&table.engine));

	if options.clean_zookeeper && !ctx.config.zookeeper.hosts.is_empty() {
		clean_replica_metadata(ctx, &creation_list, options.replica_name.as_deref()).await?;
	}

	let failed_tables = create_tables(ctx, creation_list, options.keep_going).await?;

	if options.schema_only {
		debug!("schema-only restore, table data is skipped");
		return Ok(failed_tables);
	}

	let failed_set: BTreeSet<&str> = failed_tables.iter().map(String::as_str).collect();
	let data_tables: Vec<&TableMetadata> = tables_meta
		.iter()
		.copied()
		.filter(|table| schema::is_merge_tree(&table.engine))
		.filter(|table| !failed_set.contains(format!("{}.{}", table.database, table.name).as_str()))
		.collect();

	let mut state = RestoreState::load(&ctx.config.restore.state_file).await;
	let disks = ctx.ch.get_disks().await?;

	if backup.has_s3_data() && !options.skip_cloud_storage {
		restore_cloud_storage_disks(ctx, &backup, &options, &disks, &mut state).await?;
	}

	restore_data(ctx, &backup, &data_tables, &options, &disks, &mut state).await?;

	info!(backup = backup.name(), "restore complete");
	Ok(failed_tables)
}

fn parse_table_specs(specs: &[String]) -> Result<HashSet<(String, String)>> {
	specs
		.iter()
		.map(|spec| {
			spec.split_once('.')
				.map(|(db, table)| (db.to_string(), table.to_string()))
				.ok_or_else(|| {
					Error::config(format!("table filter {spec:?} is not of the form db.table"))
				})
		})
		.collect()
}

fn engine_order(engine: &str) -> u8 {
	if schema::is_merge_tree(engine) {
		0
	} else if schema::is_distributed(engine) {
		2
	} else if schema::is_view(engine) {
		3
	} else {
		1
	}
}

async fn restore_databases(
	ctx: &BackupContext,
	backup: &BackupMetadata,
	databases: &[String],
) -> Result<BTreeMap<String, Database>> {
	for database in databases {
		if ctx.ch.database_exists(database).await? {
			continue;
		}
		match ctx
			.layout
			.get_database_create_statement(backup, database)
			.await
		{
			Ok(ddl) => {
				info!(%database, "creating database from backup");
				ctx.ch.create_database(&ddl).await?;
			}
			Err(err) if err.is_not_found() => {
				warn!(%database, "no database DDL in backup, creating with defaults");
				ctx.ch
					.create_database(&format!(
						"CREATE DATABASE IF NOT EXISTS {}",
						quote_ident(database)
					))
					.await?;
			}
			Err(err) => return Err(err),
		}
	}

	let mut live = BTreeMap::new();
	for database in ctx.ch.get_databases().await? {
		live.insert(database.name.clone(), database);
	}
	Ok(live)
}

async fn build_restore_table(
	ctx: &BackupContext,
	backup: &BackupMetadata,
	table_meta: &TableMetadata,
	live_databases: &BTreeMap<String, Database>,
	options: &RestoreOptions,
) -> Result<RestoreTable> {
	let mut ddl = ctx
		.layout
		.get_table_create_statement(backup, &table_meta.database, &table_meta.name)
		.await?;
	ddl = schema::qualify(&ddl, &table_meta.database, &table_meta.name);

	if ctx.config.restore.force_non_replicated {
		ddl = schema::force_non_replicated(&ddl);
	}
	let replica_override = options
		.replica_name
		.clone()
		.or_else(|| ctx.config.restore.override_replica_name.clone());
	if let Some(replica) = replica_override {
		ddl = schema::override_replica_name(&ddl, &replica);
	}

	let atomic = live_databases
		.get(&table_meta.database)
		.is_some_and(Database::is_atomic);
	if let (true, Some(uuid)) = (atomic, &table_meta.uuid) {
		ddl = schema::add_uuid(&ddl, uuid);

		// Since 21.4 materialized views must pin their inner table's UUID.
		if schema::is_materialized_view(&table_meta.engine) && ctx.ch.version_ge("21.4").await? {
			if let Some(inner) = ctx
				.ch
				.get_table(&table_meta.database, &format!(".inner_id.{uuid}"))
				.await?
			{
				if let Some(inner_uuid) = inner.uuid {
					ddl = schema::add_inner_uuid(&ddl, &inner_uuid);
				}
			}
		}
	}

	Ok(RestoreTable {
		database: table_meta.database.clone(),
		name: table_meta.name.clone(),
		engine: table_meta.engine.clone(),
		ddl,
	})
}

async fn clean_replica_metadata(
	ctx: &BackupContext,
	tables: &[RestoreTable],
	replica_name: Option<&str>,
) -> Result<()> {
	let replicated: Vec<&RestoreTable> = tables
		.iter()
		.filter(|table| schema::is_replicated_statement(&table.ddl))
		.collect();
	if replicated.is_empty() {
		return Ok(());
	}

	let mut macros = ctx.ch.get_macros().await?;
	let zk = ZookeeperClient::connect(&ctx.config.zookeeper).await?;

	for table in replicated {
		let Some((path, replica)) = schema::replicated_zookeeper_path(&table.ddl) else {
			continue;
		};
		macros.insert("database".to_string(), table.database.clone());
		macros.insert("table".to_string(), table.name.clone());

		let path = schema::resolve_macros(&path, &macros)?;
		let replica = match replica_name {
			Some(name) => name.to_string(),
			None => schema::resolve_macros(&replica, &macros)?,
		};

		let replica_path = format!("{path}/replicas/{replica}");
		info!(
			table = %table.qualified_name(),
			path = %replica_path,
			"deleting replica metadata"
		);
		zk.delete_recursive(&replica_path).await?;
	}
	Ok(())
}

/// Drive a FIFO retry queue: failed items go to the back and get another
/// try once the rest of the queue has had its turn. The loop stops when
/// consecutive failures outnumber the remaining queue, i.e. a full pass
/// made no progress. Returns the unfinished items and the errors of the
/// final failing pass.
async fn retry_queue<T, F, Fut>(items: Vec<T>, mut attempt: F) -> (Vec<T>, Vec<Error>)
where
	T: Clone,
	F: FnMut(T) -> Fut,
	Fut: std::future::Future<Output = Result<()>>,
{
	let mut queue: VecDeque<T> = items.into();
	let mut errors = Vec::new();

	while let Some(item) = queue.pop_front() {
		match attempt(item.clone()).await {
			Ok(()) => errors.clear(),
			Err(err) => {
				queue.push_back(item);
				errors.push(err);
				if errors.len() > queue.len() {
					break;
				}
			}
		}
	}

	(queue.into_iter().collect(), errors)
}

/// Re-create table objects with dependency-aware retry.
async fn create_tables(
	ctx: &BackupContext,
	tables: Vec<RestoreTable>,
	keep_going: bool,
) -> Result<Vec<String>> {
	let (unfinished, errors) = retry_queue(tables, |table| async move {
		ctx.check_interrupted()?;
		match restore_table_object(ctx, &table).await {
			Ok(()) => Ok(()),
			Err(err) => {
				warn!(
					table = %table.qualified_name(),
					%err,
					"restore failed, will retry after other tables"
				);
				Err(err)
			}
		}
	})
	.await;

	// Interruption is not a per-table failure; surface it as-is.
	if let Some(i) = errors.iter().position(|err| matches!(err, Error::Interrupted)) {
		let mut errors = errors;
		return Err(errors.swap_remove(i));
	}

	if errors.is_empty() {
		return Ok(Vec::new());
	}

	let failed: BTreeSet<String> = unfinished
		.iter()
		.map(RestoreTable::qualified_name)
		.collect();
	warn!(tables = %failed.iter().cloned().collect::<Vec<_>>().join(", "), "tables could not be restored");

	if keep_going {
		Ok(failed.into_iter().collect())
	} else {
		Err(Error::validation(format!(
			"failed to restore tables: {}",
			failed.into_iter().collect::<Vec<_>>().join(", ")
		)))
	}
}

#[instrument(skip_all, fields(table = %table.qualified_name()))]
async fn restore_table_object(ctx: &BackupContext, table: &RestoreTable) -> Result<()> {
	let attempt = async {
		debug!("trying ATTACH");
		match ctx.ch.create_table(&schema::to_attach_query(&table.ddl)).await {
			Ok(()) => {
				if schema::is_replicated_statement(&table.ddl)
					&& !schema::is_materialized_view(&table.engine)
					&& ctx.ch.version_ge("21.8").await?
				{
					ctx.ch.restore_replica(&table.database, &table.name).await?;
				}
				Ok(())
			}
			Err(attach_err) => {
				debug!(%attach_err, "ATTACH failed, falling back to CREATE");
				ctx.ch
					.create_table(&schema::to_create_query(&table.ddl))
					.await
			}
		}
	}
	.await;

	if attempt.is_err() {
		// Leave no partial object behind; the retry loop will come back to
		// a clean slate.
		let dropped = if schema::is_dictionary(&table.engine) {
			ctx.ch.drop_dictionary(&table.database, &table.name).await
		} else {
			ctx.ch.drop_table(&table.database, &table.name).await
		};
		if let Err(drop_err) = dropped {
			debug!(%drop_err, "cleanup drop failed");
		}
	}
	attempt
}

async fn restore_cloud_storage_disks(
	ctx: &BackupContext,
	backup: &BackupMetadata,
	options: &RestoreOptions,
	disks: &[Disk],
	state: &mut RestoreState,
) -> Result<()> {
	for (disk_name, revision) in &backup.s3_revisions {
		let disk = disks
			.iter()
			.find(|disk| disk.name == *disk_name)
			.ok_or_else(|| {
				Error::validation(format!("disk {disk_name} from the backup is not configured"))
			})?;

		let revision = if options.cloud_storage_latest {
			0
		} else {
			*revision
		};
		write_disk_restore_marker(disk, revision, options).await?;

		if state.disk_restarted(disk_name) {
			debug!(disk = %disk.name, "disk already restored, skipping restart");
			continue;
		}
		info!(disk = %disk_name, revision, "restarting disk");
		let restarted = ctx.ch.restart_disk(disk_name).await;
		if restarted.is_ok() {
			state.add_disk(disk_name);
		}
		state.persist().await?;
		restarted?;
	}
	Ok(())
}

/// The marker file the DB reads on `SYSTEM RESTART DISK` to re-point an
/// object-storage disk at the backed-up data. Revision 0 means "latest".
async fn write_disk_restore_marker(
	disk: &Disk,
	revision: u64,
	options: &RestoreOptions,
) -> Result<()> {
	let mut contents = format!("revision={revision}\n");
	if let Some(bucket) = &options.cloud_storage_source_bucket {
		contents.push_str(&format!("source_bucket={bucket}\n"));
	}
	if let Some(path) = &options.cloud_storage_source_path {
		contents.push_str(&format!("source_path={path}\n"));
	}
	if let Some(endpoint) = &options.cloud_storage_source_endpoint {
		contents.push_str(&format!("source_endpoint={endpoint}\n"));
	}
	contents.push_str("detached=true\n");

	crate::util::atomic_write(&disk.path.join("restore"), contents.as_bytes()).await
}

/// Lazily downloaded and extracted cloud-storage shadow trees, one per
/// disk, shared across tables of a restore run.
struct CloudShadows<'a> {
	ctx: &'a BackupContext,
	backup: &'a BackupMetadata,
	temp: Option<TempDir>,
	extracted: HashSet<String>,
}

impl<'a> CloudShadows<'a> {
	fn new(ctx: &'a BackupContext, backup: &'a BackupMetadata) -> Self {
		Self {
			ctx,
			backup,
			temp: None,
			extracted: HashSet::new(),
		}
	}

	/// Copy a part's pointer files from the disk's shadow tree into the
	/// table's detached directory.
	async fn copy_part(
		&mut self,
		live: &Table,
		disks: &[Disk],
		part: &PartMetadata,
	) -> Result<()> {
		if self.temp.is_none() {
			self.temp = Some(
				tempfile::tempdir().map_err(|err| {
					Error::validation(format!("creating temp dir for cloud shadows: {err}"))
				})?,
			);
		}
		// UNWRAP: just initialized above
		let root = self.temp.as_ref().unwrap().path().to_path_buf();
		let disk_root = root.join(&part.disk_name);

		if !self.extracted.contains(&part.disk_name) {
			debug!(disk = %part.disk_name, "downloading cloud storage shadow");
			self.ctx
				.layout
				.download_cloud_storage_metadata(self.backup, &part.disk_name, &disk_root)
				.await?;
			self.extracted.insert(part.disk_name.clone());
		}

		let source = find_part_dir(&disk_root, &part.name).ok_or_else(|| {
			Error::validation(format!(
				"part {} not present in the {} shadow tree",
				part.name, part.disk_name
			))
		})?;
		let destination = self
			.ctx
			.ch
			.detached_part_path(live, disks, &part.disk_name, &part.name)?;
		copy_dir(&source, &destination)
	}
}

/// Locate a part directory by name anywhere under a shadow tree.
fn find_part_dir(root: &Path, part_name: &str) -> Option<PathBuf> {
	walkdir::WalkDir::new(root)
		.into_iter()
		.filter_map(|entry| entry.ok())
		.find(|entry| {
			entry.file_type().is_dir() && entry.file_name().to_string_lossy() == part_name
		})
		.map(|entry| entry.into_path())
}

fn copy_dir(source: &Path, destination: &Path) -> Result<()> {
	std::fs::create_dir_all(destination)?;
	for entry in walkdir::WalkDir::new(source) {
		let entry =
			entry.map_err(|err| Error::validation(format!("walking {}: {err}", source.display())))?;
		// UNWRAP: walkdir yields paths under its root
		let relative = entry.path().strip_prefix(source).unwrap();
		let target = destination.join(relative);
		if entry.file_type().is_dir() {
			std::fs::create_dir_all(&target)?;
		} else if entry.file_type().is_file() {
			std::fs::copy(entry.path(), &target)?;
		}
	}
	Ok(())
}

async fn restore_data(
	ctx: &BackupContext,
	backup: &BackupMetadata,
	tables: &[&TableMetadata],
	options: &RestoreOptions,
	disks: &[Disk],
	state: &mut RestoreState,
) -> Result<()> {
	info!(tables = tables.len(), "restoring table data");
	let mut shadows = CloudShadows::new(ctx, backup);

	for table_meta in tables {
		let result =
			restore_table_data(ctx, backup, table_meta, options, disks, state, &mut shadows).await;
		// The progress index is persisted per table even on failure, so a
		// re-run resumes instead of repeating work.
		state.persist().await?;
		result?;
	}
	Ok(())
}

#[instrument(skip_all, fields(table = %format!("{}.{}", table_meta.database, table_meta.name)))]
async fn restore_table_data(
	ctx: &BackupContext,
	backup: &BackupMetadata,
	table_meta: &TableMetadata,
	options: &RestoreOptions,
	disks: &[Disk],
	state: &mut RestoreState,
	shadows: &mut CloudShadows<'_>,
) -> Result<()> {
	let live = ctx
		.ch
		.get_table(&table_meta.database, &table_meta.name)
		.await?
		.ok_or_else(|| {
			Error::validation(format!(
				"table {}.{} is missing after schema restore",
				table_meta.database, table_meta.name
			))
		})?;

	let mut to_attach: Vec<&PartMetadata> = Vec::new();
	for part in &table_meta.parts {
		ctx.check_interrupted()?;
		if state.part_restored(&part.database, &part.table, &part.name) {
			debug!(part = %part.name, "part already restored, skipping");
			continue;
		}

		// Parts on revision-tracked disks came back with the disk restart;
		// they only need attaching.
		let fetched: Result<()> = if backup.s3_revisions.contains_key(&part.disk_name) {
			Ok(())
		} else if backup.cloud_storage.disks.contains(&part.disk_name) {
			if options.skip_cloud_storage {
				debug!(part = %part.name, "cloud storage part skipped");
				continue;
			}
			shadows.copy_part(&live, disks, part).await
		} else {
			let destination = ctx
				.ch
				.detached_part_path(&live, disks, &part.disk_name, &part.name)?;
			ctx.layout.download_data_part(backup, part, &destination).await
		};

		match fetched {
			Ok(()) => to_attach.push(part),
			Err(err) if options.keep_going => {
				warn!(part = %part.name, %err, "part restore failed, continuing");
			}
			Err(err) => return Err(err),
		}
	}

	ctx.layout.wait().await?;

	fix_detached_ownership(&live);

	for part in to_attach {
		match ctx.ch.attach_part(&live, &part.name).await {
			Ok(()) => {
				debug!(part = %part.name, "part attached");
				state.add_part(&part.database, &part.table, &part.name);
			}
			Err(err) if options.keep_going => {
				warn!(part = %part.name, %err, "attaching part failed, continuing");
			}
			Err(err) => return Err(err),
		}
	}
	Ok(())
}

/// Downloaded files arrive owned by this process; mirror the uid/gid of the
/// table's data directory so the server can take them over. Best effort:
/// without privileges the chown fails and the operator sees the warning.
#[cfg(unix)]
fn fix_detached_ownership(table: &Table) {
	use std::os::unix::fs::MetadataExt as _;

	for data_path in &table.data_paths {
		let Ok(reference) = std::fs::metadata(data_path) else {
			continue;
		};
		let detached = data_path.join("detached");
		if !detached.is_dir() {
			continue;
		}
		for entry in walkdir::WalkDir::new(&detached)
			.into_iter()
			.filter_map(|entry| entry.ok())
		{
			if let Err(err) = std::os::unix::fs::chown(
				entry.path(),
				Some(reference.uid()),
				Some(reference.gid()),
			) {
				warn!(%err, path = %entry.path().display(), "cannot chown detached file");
				return;
			}
		}
	}
}

#[cfg(not(unix))]
fn fix_detached_ownership(_table: &Table) {}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn engine_order_puts_dependencies_first() {
		let mut engines = vec![
			"MaterializedView",
			"Distributed",
			"MergeTree",
			"Memory",
			"ReplicatedMergeTree",
			"View",
		];
		engines.sort_by_key(|engine| engine_order(engine));
		assert_eq!(
			engines,
			vec![
				"MergeTree",
				"ReplicatedMergeTree",
				"Memory",
				"Distributed",
				"MaterializedView",
				"View",
			]
		);
	}

	#[test]
	fn table_specs_parse_and_reject_bare_names() {
		let parsed = parse_table_specs(&["db1.t1".to_string(), "db2.t2".to_string()]).unwrap();
		assert!(parsed.contains(&("db1".to_string(), "t1".to_string())));
		assert!(parse_table_specs(&["just_a_table".to_string()]).is_err());
	}

	#[tokio::test]
	async fn retry_queue_converges_once_dependencies_appear() {
		use std::sync::{
			atomic::{AtomicUsize, Ordering},
			Mutex,
		};

		// The view can only be created after its inner table exists, but is
		// queued first.
		let created = Mutex::new(std::collections::HashSet::new());
		let attempts = AtomicUsize::new(0);

		let (unfinished, errors) = retry_queue(vec!["view", "table"], |item| {
			let created = &created;
			let attempts = &attempts;
			async move {
				attempts.fetch_add(1, Ordering::SeqCst);
				if item == "view" && !created.lock().unwrap().contains("table") {
					return Err(Error::validation("inner table is missing"));
				}
				created.lock().unwrap().insert(item);
				Ok(())
			}
		})
		.await;

		assert!(unfinished.is_empty());
		assert!(errors.is_empty());
		// One failed pass on the view, then both succeed: total retries
		// stay within the table count.
		assert_eq!(attempts.load(Ordering::SeqCst), 3);
	}

	#[tokio::test]
	async fn retry_queue_stops_once_progress_stalls() {
		let (unfinished, errors) =
			retry_queue(vec!["a", "b"], |_| async { Err(Error::validation("always broken")) })
				.await;

		assert_eq!(unfinished.len(), 2);
		// A full pass plus the stall check, not an unbounded loop.
		assert_eq!(errors.len(), 3);
	}
}
