use clap::Parser;
use comfy_table::{presets, Table};
use miette::Result;

use crate::{
	actions::Context,
	args::GlobalArgs,
	metadata::BackupState,
	ops::{self, BackupContext},
};

/// List existing backups
///
/// By default only successfully created backups are shown, newest first.
#[derive(Debug, Clone, Parser)]
pub struct ListArgs {
	/// List all backups, whatever their state
	#[arg(long, short = 'a')]
	pub all: bool,

	/// Tabular output with state, timing, and size details
	#[arg(long, short = 'v')]
	pub verbose: bool,
}

pub async fn run(ctx: Context<GlobalArgs, ListArgs>) -> Result<()> {
	let config = ctx.args_top.load_config()?;
	let bctx = BackupContext::new(config, ctx.cancel.clone(), ctx.progress.clone()).await?;

	let state = (!ctx.args_sub.all).then_some(BackupState::Created);
	let backups = ops::list::list(&bctx, state).await?;

	if !ctx.args_sub.verbose {
		for backup in &backups {
			println!("{}", backup.name());
		}
		return Ok(());
	}

	let mut table = Table::new();
	table.load_preset(presets::NOTHING);
	table.set_header([
		"name",
		"state",
		"start_time",
		"end_time",
		"size",
		"real_size",
		"ch_version",
	]);
	for backup in &backups {
		table.add_row([
			backup.name().to_string(),
			backup.state().to_string(),
			backup.meta.start_time.to_rfc3339(),
			backup
				.meta
				.end_time
				.map(|time| time.to_rfc3339())
				.unwrap_or_default(),
			backup.meta.size.to_string(),
			backup.meta.real_size.to_string(),
			backup.meta.clickhouse_version.clone(),
		]);
	}
	println!("{table}");
	Ok(())
}
