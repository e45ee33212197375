use crate::{
	error::{Error, Result},
	metadata::{BackupMetadata, BackupState},
};

use super::BackupContext;

/// Backups, newest first, optionally filtered to one state.
pub async fn list(ctx: &BackupContext, state: Option<BackupState>) -> Result<Vec<BackupMetadata>> {
	let backups = ctx.layout.get_backups().await?;
	Ok(match state {
		Some(state) => backups
			.into_iter()
			.filter(|backup| backup.state() == state)
			.collect(),
		None => backups,
	})
}

/// Resolve a CLI backup argument: `LAST` means the most recent successfully
/// created backup; anything else must exist.
pub async fn resolve_name(ctx: &BackupContext, name: &str) -> Result<String> {
	let backups = ctx.layout.get_backups().await?;
	if name == "LAST" {
		return backups
			.iter()
			.find(|backup| backup.state() == BackupState::Created)
			.map(|backup| backup.name().to_string())
			.ok_or_else(|| Error::not_found("there are no backups"));
	}

	if backups.iter().any(|backup| backup.name() == name) {
		Ok(name.to_string())
	} else {
		Err(Error::not_found(format!("no backup named {name:?}")))
	}
}
