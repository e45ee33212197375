//! Crash-resume index for restores.
//!
//! A small JSON file records which cloud-storage disks were already
//! restarted and which parts were already attached, so a re-run of the same
//! restore skips completed work. Writes go through a temp-file rename, so a
//! crash mid-write never corrupts the index.

use std::{
	collections::{BTreeMap, BTreeSet},
	path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{error::Result, util::atomic_write};

#[derive(Debug, Default, Serialize, Deserialize)]
struct StateData {
	#[serde(default)]
	disks: BTreeSet<String>,
	/// database → table → attached parts.
	#[serde(default)]
	parts: BTreeMap<String, BTreeMap<String, BTreeSet<String>>>,
}

#[derive(Debug)]
pub struct RestoreState {
	path: PathBuf,
	data: StateData,
}

impl RestoreState {
	/// Load the index, starting fresh when it is absent or unreadable.
	pub async fn load(path: &Path) -> Self {
		let data = match tokio::fs::read(path).await {
			Ok(bytes) => match serde_json::from_slice(&bytes) {
				Ok(data) => data,
				Err(err) => {
					warn!(%err, path = %path.display(), "restore state unreadable, starting fresh");
					StateData::default()
				}
			},
			Err(_) => StateData::default(),
		};
		Self {
			path: path.to_path_buf(),
			data,
		}
	}

	pub fn disk_restarted(&self, disk: &str) -> bool {
		self.data.disks.contains(disk)
	}

	pub fn add_disk(&mut self, disk: &str) {
		self.data.disks.insert(disk.to_string());
	}

	pub fn part_restored(&self, database: &str, table: &str, part: &str) -> bool {
		self.data
			.parts
			.get(database)
			.and_then(|tables| tables.get(table))
			.is_some_and(|parts| parts.contains(part))
	}

	pub fn add_part(&mut self, database: &str, table: &str, part: &str) {
		self.data
			.parts
			.entry(database.to_string())
			.or_default()
			.entry(table.to_string())
			.or_default()
			.insert(part.to_string());
	}

	pub async fn persist(&self) -> Result<()> {
		debug!(path = %self.path.display(), "persisting restore state");
		atomic_write(&self.path, &serde_json::to_vec_pretty(&self.data)?).await
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn state_survives_a_reload() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("restore-state.json");

		let mut state = RestoreState::load(&path).await;
		assert!(!state.disk_restarted("object_storage"));
		state.add_disk("object_storage");
		state.add_part("db1", "t1", "all_1_1_0");
		state.persist().await.unwrap();

		let state = RestoreState::load(&path).await;
		assert!(state.disk_restarted("object_storage"));
		assert!(state.part_restored("db1", "t1", "all_1_1_0"));
		assert!(!state.part_restored("db1", "t1", "all_2_2_0"));
		assert!(!state.part_restored("db2", "t1", "all_1_1_0"));
	}

	#[tokio::test]
	async fn corrupt_state_starts_fresh() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("restore-state.json");
		std::fs::write(&path, b"{not json").unwrap();

		let state = RestoreState::load(&path).await;
		assert!(!state.disk_restarted("any"));
	}
}
