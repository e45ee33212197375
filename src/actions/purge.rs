use clap::Parser;
use miette::Result;

use crate::{
	actions::Context,
	args::GlobalArgs,
	ops::{self, BackupContext},
};

/// Purge backups beyond the retention policy
///
/// Retention is configured through backup.retain_count and
/// backup.retain_time. Prints the deleted names, one per line.
#[derive(Debug, Clone, Parser)]
pub struct PurgeArgs {}

pub async fn run(ctx: Context<GlobalArgs, PurgeArgs>) -> Result<()> {
	let config = ctx.args_top.load_config()?;
	let bctx = BackupContext::new(config, ctx.cancel.clone(), ctx.progress.clone()).await?;

	for name in ops::delete::purge(&bctx).await? {
		println!("{name}");
	}
	Ok(())
}
