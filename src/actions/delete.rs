use clap::Parser;
use miette::Result;

use crate::{
	actions::Context,
	args::GlobalArgs,
	ops::{self, BackupContext},
};

/// Delete a particular backup
///
/// Parts still referenced by other backups' dedup links are retained, and
/// the backup becomes partially deleted instead of disappearing.
#[derive(Debug, Clone, Parser)]
pub struct DeleteArgs {
	/// Backup name, or LAST for the most recent created backup
	#[arg(value_name = "BACKUP")]
	pub name: String,
}

pub async fn run(ctx: Context<GlobalArgs, DeleteArgs>) -> Result<()> {
	let config = ctx.args_top.load_config()?;
	let bctx = BackupContext::new(config, ctx.cancel.clone(), ctx.progress.clone()).await?;

	let name = ops::list::resolve_name(&bctx, &ctx.args_sub.name).await?;
	let (deleted, message) = ops::delete::delete(&bctx, &name).await?;

	if let Some(message) = message {
		eprintln!("{message}");
	}
	println!("{deleted}");
	Ok(())
}
