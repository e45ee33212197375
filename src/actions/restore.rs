use clap::Parser;
use miette::Result;

use crate::{
	actions::Context,
	args::GlobalArgs,
	ops::{self, restore::RestoreOptions, BackupContext},
};

/// Restore data from a particular backup
#[derive(Debug, Clone, Parser)]
pub struct RestoreArgs {
	/// Backup name, or LAST for the most recent created backup
	#[arg(value_name = "BACKUP")]
	pub name: String,

	/// Comma-separated list of databases to restore
	#[arg(short = 'd', long, value_delimiter = ',', value_name = "DATABASES")]
	pub databases: Option<Vec<String>>,

	/// Restore only database and table schemas
	#[arg(long)]
	pub schema_only: bool,

	/// Comma-separated list of tables (db.table) that must be restored
	#[arg(short = 't', long, value_delimiter = ',', value_name = "TABLES")]
	pub tables: Vec<String>,

	/// Comma-separated list of tables (db.table) to leave out
	#[arg(long, value_delimiter = ',', value_name = "TABLES")]
	pub exclude_tables: Vec<String>,

	/// Replica name to write into replicated engine definitions
	#[arg(long, value_name = "NAME")]
	pub replica_name: Option<String>,

	/// Source bucket for cloud-storage data, when it differs from ours
	#[arg(long, value_name = "BUCKET")]
	pub cloud_storage_source_bucket: Option<String>,

	/// Source path for cloud-storage data
	#[arg(long, value_name = "PATH")]
	pub cloud_storage_source_path: Option<String>,

	/// Source endpoint for cloud-storage data
	#[arg(long, value_name = "URL")]
	pub cloud_storage_source_endpoint: Option<String>,

	/// Restore cloud-storage disks to their latest state instead of the
	/// recorded revision
	#[arg(long)]
	pub cloud_storage_latest: bool,

	/// Do not restore data held on cloud-storage disks
	#[arg(long)]
	pub skip_cloud_storage: bool,

	/// Delete replica metadata from ZooKeeper before re-creating
	/// replicated tables
	#[arg(long)]
	pub clean_zookeeper: bool,

	/// Keep going over per-table and per-part failures, reporting them at
	/// the end instead of stopping at the first
	#[arg(long)]
	pub keep_going: bool,
}

pub async fn run(ctx: Context<GlobalArgs, RestoreArgs>) -> Result<()> {
	let config = ctx.args_top.load_config()?;
	let bctx = BackupContext::new(config, ctx.cancel.clone(), ctx.progress.clone()).await?;

	let name = ops::list::resolve_name(&bctx, &ctx.args_sub.name).await?;
	let args = &ctx.args_sub;

	let failed = ops::restore::restore(
		&bctx,
		RestoreOptions {
			name,
			databases: args.databases.clone(),
			schema_only: args.schema_only,
			include_tables: args.tables.clone(),
			exclude_tables: args.exclude_tables.clone(),
			replica_name: args.replica_name.clone(),
			cloud_storage_source_bucket: args.cloud_storage_source_bucket.clone(),
			cloud_storage_source_path: args.cloud_storage_source_path.clone(),
			cloud_storage_source_endpoint: args.cloud_storage_source_endpoint.clone(),
			cloud_storage_latest: args.cloud_storage_latest,
			skip_cloud_storage: args.skip_cloud_storage,
			clean_zookeeper: args.clean_zookeeper,
			keep_going: args.keep_going,
		},
	)
	.await?;

	if !failed.is_empty() {
		eprintln!("failed to restore tables: {}", failed.join(", "));
	}
	Ok(())
}
