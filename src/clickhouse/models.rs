use std::path::{Path, PathBuf};

/// Database engines that live outside this server; they carry no local data
/// or metadata worth backing up beyond their create statement.
const EXTERNAL_DB_ENGINES: &[&str] = &[
	"MySQL",
	"MaterializedMySQL",
	"MaterializeMySQL",
	"PostgreSQL",
	"MaterializedPostgreSQL",
	"SQLite",
];

#[derive(Debug, Clone)]
pub struct Database {
	pub name: String,
	pub engine: String,
}

impl Database {
	pub fn is_external(&self) -> bool {
		EXTERNAL_DB_ENGINES.contains(&self.engine.as_str())
	}

	/// Atomic-family engines address tables by UUID; their create statements
	/// need explicit UUID clauses on restore.
	pub fn is_atomic(&self) -> bool {
		self.engine == "Atomic" || self.engine == "Replicated"
	}
}

#[derive(Debug, Clone)]
pub struct Table {
	pub database: String,
	pub name: String,
	pub engine: String,
	pub uuid: Option<String>,
	pub metadata_path: PathBuf,
	pub data_paths: Vec<PathBuf>,
	pub create_statement: String,
}

impl Table {
	pub fn qualified_name(&self) -> String {
		format!("{}.{}", self.database, self.name)
	}
}

#[derive(Debug, Clone)]
pub struct Disk {
	pub name: String,
	pub path: PathBuf,
	pub r#type: String,
	pub cache_path: Option<PathBuf>,
}

impl Disk {
	/// Object-storage-backed disk without a local cache: its data directory
	/// holds only pointer files.
	pub fn is_cloud(&self) -> bool {
		self.r#type == "s3" && self.cache_path.is_none()
	}

	/// The disk owning `path`, by longest path-prefix match.
	pub fn owning<'d>(disks: &'d [Disk], path: &Path) -> Option<&'d Disk> {
		disks
			.iter()
			.filter(|disk| path.starts_with(&disk.path))
			.max_by_key(|disk| disk.path.as_os_str().len())
	}
}

/// One part hard-linked into the shadow directory by a table freeze.
#[derive(Debug, Clone)]
pub struct FrozenPart {
	pub database: String,
	pub table: String,
	pub name: String,
	pub disk_name: String,
	/// Absolute path of the part directory inside the shadow tree.
	pub path: PathBuf,
	/// Relative file paths with their sizes, sorted by path.
	pub files: Vec<(PathBuf, u64)>,
}

impl FrozenPart {
	pub fn total_size(&self) -> u64 {
		self.files.iter().map(|(_, size)| size).sum()
	}

	pub fn file_names(&self) -> Vec<String> {
		self.files
			.iter()
			.map(|(path, _)| path.to_string_lossy().into_owned())
			.collect()
	}

	pub fn file_paths(&self) -> Vec<PathBuf> {
		self.files.iter().map(|(path, _)| path.clone()).collect()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn external_database_engines_are_detected() {
		let external = Database {
			name: "mysql_mirror".into(),
			engine: "MaterializedMySQL".into(),
		};
		let local = Database {
			name: "db1".into(),
			engine: "Atomic".into(),
		};
		assert!(external.is_external());
		assert!(!local.is_external());
		assert!(local.is_atomic());
	}

	#[test]
	fn owning_disk_takes_the_longest_prefix() {
		let disks = vec![
			Disk {
				name: "default".into(),
				path: "/var/lib/clickhouse".into(),
				r#type: "local".into(),
				cache_path: None,
			},
			Disk {
				name: "fast".into(),
				path: "/var/lib/clickhouse/fast".into(),
				r#type: "local".into(),
				cache_path: None,
			},
		];

		let owner = Disk::owning(&disks, Path::new("/var/lib/clickhouse/fast/store/abc")).unwrap();
		assert_eq!(owner.name, "fast");
		let owner = Disk::owning(&disks, Path::new("/var/lib/clickhouse/store/abc")).unwrap();
		assert_eq!(owner.name, "default");
		assert!(Disk::owning(&disks, Path::new("/mnt/elsewhere")).is_none());
	}
}
