//! Orchestrators: the operations behind each CLI verb, sharing one
//! [`BackupContext`] of connected collaborators.

use indicatif::MultiProgress;
use tokio_util::sync::CancellationToken;

use crate::{
	clickhouse::ClickhouseClient,
	config::Config,
	error::{Error, Result},
	layout::BackupLayout,
	util,
};

pub mod backup;
pub mod delete;
pub mod list;
pub mod restore;

pub struct BackupContext {
	pub config: Config,
	pub ch: ClickhouseClient,
	pub layout: BackupLayout,
	pub cancel: CancellationToken,
	pub hostname: String,
}

impl BackupContext {
	pub async fn new(
		config: Config,
		cancel: CancellationToken,
		progress: MultiProgress,
	) -> Result<Self> {
		tracing::debug!(
			user = %config.main.user,
			group = %config.main.group,
			"file ownership target (privilege management is the service manager's job)"
		);
		let ch = ClickhouseClient::new(&config.clickhouse)?;
		let layout = BackupLayout::new(&config, cancel.clone(), progress).await?;
		Ok(Self {
			config,
			ch,
			layout,
			cancel,
			hostname: util::hostname(),
		})
	}

	/// Between units of work, bail out if the top-level signal fired.
	pub fn check_interrupted(&self) -> Result<()> {
		if self.cancel.is_cancelled() {
			Err(Error::Interrupted)
		} else {
			Ok(())
		}
	}
}
