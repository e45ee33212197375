use clap::Parser;
use miette::{IntoDiagnostic as _, Result};

use crate::{
	actions::Context,
	args::GlobalArgs,
	ops::{self, BackupContext},
};

/// Show details for a particular backup
#[derive(Debug, Clone, Parser)]
pub struct ShowArgs {
	/// Backup name, or LAST for the most recent created backup
	#[arg(value_name = "BACKUP")]
	pub name: String,
}

pub async fn run(ctx: Context<GlobalArgs, ShowArgs>) -> Result<()> {
	let config = ctx.args_top.load_config()?;
	let bctx = BackupContext::new(config, ctx.cancel.clone(), ctx.progress.clone()).await?;

	let name = ops::list::resolve_name(&bctx, &ctx.args_sub.name).await?;
	let backup = bctx.layout.get_backup_metadata(&name).await?;

	println!(
		"{}",
		serde_json::to_string_pretty(&backup).into_diagnostic()?
	);
	Ok(())
}
