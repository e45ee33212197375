use std::{
	collections::BTreeMap,
	path::PathBuf,
	time::Duration,
};

use serde::{de::DeserializeOwned, Deserialize};
use tokio::sync::OnceCell;
use tracing::{debug, instrument, warn};

use crate::{
	config::ClickhouseConfig,
	error::{Error, Result},
	util::{quote_ident, quote_str},
};

use super::models::{Database, Disk, FrozenPart, Table};

const ZERO_UUID: &str = "00000000-0000-0000-0000-000000000000";

/// Compare dot-separated integer version tuples (ClickHouse versions have
/// four components, so semver rules do not apply).
pub fn version_ge(actual: &str, target: &str) -> bool {
	let parse = |v: &str| {
		v.split('.')
			.map(|part| part.trim().parse::<u64>().unwrap_or(0))
			.collect::<Vec<_>>()
	};
	let mut actual = parse(actual);
	let mut target = parse(target);
	let len = actual.len().max(target.len());
	actual.resize(len, 0);
	target.resize(len, 0);
	actual >= target
}

#[derive(Debug, Deserialize)]
struct JsonRows<T> {
	data: Vec<T>,
}

/// ClickHouse over its HTTP interface.
pub struct ClickhouseClient {
	http: reqwest::Client,
	base_url: String,
	user: Option<String>,
	password: Option<String>,
	freeze_timeout: Duration,
	data_path: PathBuf,
	version: OnceCell<String>,
}

impl std::fmt::Debug for ClickhouseClient {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ClickhouseClient")
			.field("base_url", &self.base_url)
			.finish_non_exhaustive()
	}
}

impl ClickhouseClient {
	pub fn new(config: &ClickhouseConfig) -> Result<Self> {
		let mut builder = reqwest::Client::builder().timeout(config.timeout);
		if let Some(ca_path) = &config.ca_path {
			let pem = std::fs::read(ca_path)
				.map_err(|err| Error::config(format!("reading {}: {err}", ca_path.display())))?;
			let cert = reqwest::Certificate::from_pem(&pem)
				.map_err(|err| Error::config(format!("parsing CA bundle: {err}")))?;
			builder = builder.add_root_certificate(cert);
		}
		if config.insecure {
			builder = builder.danger_accept_invalid_certs(true);
		}

		Ok(Self {
			http: builder
				.build()
				.map_err(|err| Error::config(format!("building HTTP client: {err}")))?,
			base_url: config.base_url(),
			user: config.user.clone(),
			password: config.password.clone(),
			freeze_timeout: config.freeze_timeout,
			data_path: config.data_path.clone(),
			version: OnceCell::new(),
		})
	}

	async fn raw_query(&self, query: &str, timeout: Option<Duration>) -> Result<String> {
		debug!(query, "clickhouse query");
		let mut request = self.http.post(&self.base_url).body(query.to_string());
		if let Some(user) = &self.user {
			request = request.header("X-ClickHouse-User", user);
		}
		if let Some(password) = &self.password {
			request = request.header("X-ClickHouse-Key", password);
		}
		if let Some(timeout) = timeout {
			request = request.timeout(timeout);
		}

		let response = request
			.send()
			.await
			.map_err(|err| Error::clickhouse(format!("sending request: {err}")))?;
		let status = response.status();
		let text = response
			.text()
			.await
			.map_err(|err| Error::clickhouse(format!("reading response: {err}")))?;
		if !status.is_success() {
			return Err(Error::clickhouse(format!(
				"{status}: {}",
				text.trim_end()
			)));
		}
		Ok(text)
	}

	/// Execute a statement, discarding any output.
	pub async fn execute(&self, statement: &str) -> Result<()> {
		self.raw_query(statement, None).await.map(drop)
	}

	async fn query_rows<T: DeserializeOwned>(&self, query: &str) -> Result<Vec<T>> {
		let text = self.raw_query(&format!("{query} FORMAT JSON"), None).await?;
		let rows: JsonRows<T> = serde_json::from_str(&text)
			.map_err(|err| Error::clickhouse(format!("parsing response: {err}")))?;
		Ok(rows.data)
	}

	async fn query_scalar(&self, query: &str) -> Result<String> {
		let text = self.raw_query(query, None).await?;
		Ok(text.trim_end_matches('\n').to_string())
	}

	/// Server version, fetched once per client.
	pub async fn version(&self) -> Result<String> {
		self.version
			.get_or_try_init(|| async { self.query_scalar("SELECT version()").await })
			.await
			.cloned()
	}

	pub async fn version_ge(&self, target: &str) -> Result<bool> {
		Ok(version_ge(&self.version().await?, target))
	}

	pub async fn get_databases(&self) -> Result<Vec<Database>> {
		#[derive(Deserialize)]
		struct Row {
			name: String,
			engine: String,
		}
		let rows: Vec<Row> = self
			.query_rows(
				"SELECT name, engine FROM system.databases \
				 WHERE name NOT IN ('system', 'information_schema', 'INFORMATION_SCHEMA', \
				 '_temporary_and_external_tables') ORDER BY name",
			)
			.await?;
		Ok(rows
			.into_iter()
			.map(|row| Database {
				name: row.name,
				engine: row.engine,
			})
			.collect())
	}

	pub async fn database_exists(&self, name: &str) -> Result<bool> {
		#[derive(Deserialize)]
		struct Row {
			#[allow(dead_code)]
			name: String,
		}
		let rows: Vec<Row> = self
			.query_rows(&format!(
				"SELECT name FROM system.databases WHERE name = {}",
				quote_str(name)
			))
			.await?;
		Ok(!rows.is_empty())
	}

	pub async fn show_create_database(&self, name: &str) -> Result<String> {
		#[derive(Deserialize)]
		struct Row {
			statement: String,
		}
		let rows: Vec<Row> = self
			.query_rows(&format!("SHOW CREATE DATABASE {}", quote_ident(name)))
			.await?;
		rows.into_iter()
			.map(|row| row.statement)
			.next()
			.ok_or_else(|| Error::not_found(format!("database {name}")))
	}

	pub async fn get_tables(&self, database: &str, names: Option<&[String]>) -> Result<Vec<Table>> {
		let mut query = format!(
			"SELECT database, name, engine, toString(uuid) AS uuid, metadata_path, \
			 data_paths, create_table_query FROM system.tables WHERE database = {}",
			quote_str(database)
		);
		if let Some(names) = names {
			let list = names
				.iter()
				.map(|name| quote_str(name))
				.collect::<Vec<_>>()
				.join(", ");
			query.push_str(&format!(" AND name IN ({list})"));
		}
		query.push_str(" ORDER BY name");

		#[derive(Deserialize)]
		struct Row {
			database: String,
			name: String,
			engine: String,
			uuid: String,
			metadata_path: String,
			#[serde(default)]
			data_paths: Vec<String>,
			#[serde(default)]
			create_table_query: String,
		}

		let rows: Vec<Row> = self.query_rows(&query).await?;
		Ok(rows
			.into_iter()
			.map(|row| {
				let metadata_path = PathBuf::from(&row.metadata_path);
				let metadata_path = if metadata_path.is_absolute() {
					metadata_path
				} else {
					self.data_path.join(metadata_path)
				};
				Table {
					database: row.database,
					name: row.name,
					engine: row.engine,
					uuid: (row.uuid != ZERO_UUID && !row.uuid.is_empty()).then_some(row.uuid),
					metadata_path,
					data_paths: row.data_paths.into_iter().map(PathBuf::from).collect(),
					create_statement: row.create_table_query,
				}
			})
			.collect())
	}

	pub async fn get_table(&self, database: &str, name: &str) -> Result<Option<Table>> {
		let tables = self
			.get_tables(database, Some(&[name.to_string()]))
			.await?;
		Ok(tables.into_iter().next())
	}

	pub async fn table_exists(&self, database: &str, name: &str) -> Result<bool> {
		Ok(self.get_table(database, name).await?.is_some())
	}

	pub async fn get_disks(&self) -> Result<Vec<Disk>> {
		#[derive(Deserialize)]
		struct Row {
			name: String,
			path: String,
			r#type: String,
			cache_path: Option<String>,
		}

		// cache_path appeared in 22.3; fall back for older servers.
		let rows: Vec<Row> = match self
			.query_rows("SELECT name, path, type, cache_path FROM system.disks ORDER BY name")
			.await
		{
			Ok(rows) => rows,
			Err(_) => {
				#[derive(Deserialize)]
				struct OldRow {
					name: String,
					path: String,
					r#type: String,
				}
				let rows: Vec<OldRow> = self
					.query_rows("SELECT name, path, type FROM system.disks ORDER BY name")
					.await?;
				rows.into_iter()
					.map(|row| Row {
						name: row.name,
						path: row.path,
						r#type: row.r#type,
						cache_path: None,
					})
					.collect()
			}
		};

		Ok(rows
			.into_iter()
			.map(|row| Disk {
				name: row.name,
				path: PathBuf::from(row.path),
				r#type: row.r#type,
				cache_path: row
					.cache_path
					.filter(|p| !p.is_empty())
					.map(PathBuf::from),
			})
			.collect())
	}

	pub async fn get_macros(&self) -> Result<BTreeMap<String, String>> {
		#[derive(Deserialize)]
		struct Row {
			macro_name: String,
			substitution: String,
		}
		let rows: Vec<Row> = self
			.query_rows("SELECT macro AS macro_name, substitution FROM system.macros")
			.await?;
		Ok(rows
			.into_iter()
			.map(|row| (row.macro_name, row.substitution))
			.collect())
	}

	/// Hard-link all visible parts of a table into `shadow/<backup_name>`.
	#[instrument(skip(self, table), fields(table = %table.qualified_name()))]
	pub async fn freeze_table(&self, backup_name: &str, table: &Table) -> Result<()> {
		let statement = format!(
			"ALTER TABLE {}.{} FREEZE WITH NAME {}",
			quote_ident(&table.database),
			quote_ident(&table.name),
			quote_str(backup_name)
		);
		self.raw_query(&statement, Some(self.freeze_timeout))
			.await
			.map(drop)
	}

	/// Scan the shadow directories of a freeze for this table's parts.
	pub fn list_frozen_parts(
		&self,
		table: &Table,
		disks: &[Disk],
		backup_name: &str,
	) -> Result<Vec<FrozenPart>> {
		let mut parts = Vec::new();

		for data_path in &table.data_paths {
			let Some(disk) = Disk::owning(disks, data_path) else {
				warn!(path = %data_path.display(), "no disk owns this data path, skipping");
				continue;
			};
			// UNWRAP: the owning disk's path is a prefix of the data path
			let relative = data_path.strip_prefix(&disk.path).unwrap();
			let shadow = disk
				.path
				.join("shadow")
				.join(backup_name)
				.join(relative);
			if !shadow.is_dir() {
				continue;
			}

			for entry in std::fs::read_dir(&shadow)? {
				let entry = entry?;
				if !entry.file_type()?.is_dir() {
					continue;
				}
				let name = entry.file_name().to_string_lossy().into_owned();
				if name == "detached" {
					continue;
				}
				let part_dir = entry.path();

				let mut files = Vec::new();
				for file in walkdir::WalkDir::new(&part_dir).follow_links(false) {
					let file = file.map_err(|err| {
						Error::validation(format!("walking {}: {err}", part_dir.display()))
					})?;
					if file.file_type().is_file() {
						// UNWRAP: walkdir yields paths under its root
						let relative = file.path().strip_prefix(&part_dir).unwrap().to_path_buf();
						files.push((relative, file.metadata().map(|m| m.len()).unwrap_or(0)));
					}
				}
				files.sort();

				parts.push(FrozenPart {
					database: table.database.clone(),
					table: table.name.clone(),
					name,
					disk_name: disk.name.clone(),
					path: part_dir,
					files,
				});
			}
		}

		parts.sort_by(|a, b| a.name.cmp(&b.name));
		Ok(parts)
	}

	/// Remove this table's shadow directories for a freeze. Idempotent.
	///
	/// Cloud-disk shadows are left alone here: their pointer files are
	/// uploaded once per disk at the end of the backup, then cleaned by
	/// [`Self::cleanup_shadow`].
	pub fn unfreeze_table(&self, backup_name: &str, table: &Table, disks: &[Disk]) -> Result<()> {
		for data_path in &table.data_paths {
			let Some(disk) = Disk::owning(disks, data_path) else {
				continue;
			};
			if disk.is_cloud() {
				continue;
			}
			// UNWRAP: the owning disk's path is a prefix of the data path
			let relative = data_path.strip_prefix(&disk.path).unwrap();
			let shadow = disk
				.path
				.join("shadow")
				.join(backup_name)
				.join(relative);
			match std::fs::remove_dir_all(&shadow) {
				Ok(()) => debug!(path = %shadow.display(), "removed frozen data"),
				Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
				Err(err) => return Err(err.into()),
			}
		}
		Ok(())
	}

	/// Shadow root of a freeze on one disk.
	pub fn shadow_root(&self, disk: &Disk, backup_name: &str) -> PathBuf {
		disk.path.join("shadow").join(backup_name)
	}

	/// Remove whatever remains of a freeze on every disk. Idempotent.
	pub fn cleanup_shadow(&self, backup_name: &str, disks: &[Disk]) -> Result<()> {
		for disk in disks {
			let shadow = self.shadow_root(disk, backup_name);
			match std::fs::remove_dir_all(&shadow) {
				Ok(()) => debug!(path = %shadow.display(), "removed shadow directory"),
				Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
				Err(err) => return Err(err.into()),
			}
		}
		Ok(())
	}

	/// Storage revision counter written by a freeze on an object-storage
	/// disk, when the server produced one.
	pub fn shadow_revision(&self, disk: &Disk, backup_name: &str) -> Option<u64> {
		let path = self.shadow_root(disk, backup_name).join("revision.txt");
		let text = std::fs::read_to_string(path).ok()?;
		text.trim().parse().ok()
	}

	/// Remove a single frozen part directory (after dedup made its upload
	/// unnecessary).
	pub fn remove_frozen_part(&self, part: &FrozenPart) -> Result<()> {
		match std::fs::remove_dir_all(&part.path) {
			Ok(()) => Ok(()),
			Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
			Err(err) => Err(err.into()),
		}
	}

	/// `detached/` directory of a table on a given disk, where downloaded
	/// parts land before ATTACH.
	pub fn detached_part_path(
		&self,
		table: &Table,
		disks: &[Disk],
		disk_name: &str,
		part_name: &str,
	) -> Result<PathBuf> {
		let data_path = table
			.data_paths
			.iter()
			.find(|path| {
				Disk::owning(disks, path).is_some_and(|disk| disk.name == disk_name)
			})
			.or_else(|| table.data_paths.first())
			.ok_or_else(|| {
				Error::validation(format!(
					"table {} has no data path for disk {disk_name}",
					table.qualified_name()
				))
			})?;
		Ok(data_path.join("detached").join(part_name))
	}

	pub async fn attach_part(&self, table: &Table, part_name: &str) -> Result<()> {
		self.execute(&format!(
			"ALTER TABLE {}.{} ATTACH PART {}",
			quote_ident(&table.database),
			quote_ident(&table.name),
			quote_str(part_name)
		))
		.await
	}

	pub async fn create_database(&self, statement: &str) -> Result<()> {
		self.execute(statement).await
	}

	pub async fn create_table(&self, statement: &str) -> Result<()> {
		self.execute(statement).await
	}

	pub async fn drop_table(&self, database: &str, name: &str) -> Result<()> {
		self.execute(&format!(
			"DROP TABLE IF EXISTS {}.{} NO DELAY",
			quote_ident(database),
			quote_ident(name)
		))
		.await
	}

	pub async fn drop_dictionary(&self, database: &str, name: &str) -> Result<()> {
		self.execute(&format!(
			"DROP DICTIONARY IF EXISTS {}.{}",
			quote_ident(database),
			quote_ident(name)
		))
		.await
	}

	pub async fn restore_replica(&self, database: &str, name: &str) -> Result<()> {
		self.execute(&format!(
			"SYSTEM RESTORE REPLICA {}.{}",
			quote_ident(database),
			quote_ident(name)
		))
		.await
	}

	pub async fn restart_disk(&self, disk: &str) -> Result<()> {
		self.execute(&format!("SYSTEM RESTART DISK {}", quote_ident(disk)))
			.await
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn versions_compare_as_integer_tuples() {
		assert!(version_ge("21.8.2.7", "21.8"));
		assert!(version_ge("21.8", "21.8"));
		assert!(version_ge("22.1.1.1", "21.8"));
		assert!(!version_ge("21.7.9.99", "21.8"));
		// Numeric, not lexicographic.
		assert!(version_ge("21.10", "21.8"));
		assert!(!version_ge("9.9", "21.4"));
	}
}
