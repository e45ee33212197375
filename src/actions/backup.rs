use std::{collections::BTreeMap, sync::OnceLock};

use clap::Parser;
use miette::{bail, Result};
use regex::Regex;

use crate::{
	actions::Context,
	args::GlobalArgs,
	ops::{self, backup::BackupOptions, BackupContext},
};

/// Perform a backup
///
/// Prints the name of the new backup on stdout. Advisory messages (for
/// example when backup.min_interval suppressed the run) go to stderr.
#[derive(Debug, Clone, Parser)]
pub struct BackupArgs {
	/// Name of the new backup
	///
	/// The value can contain macros: {timestamp} - current time in UTC,
	/// {uuid} - randomly generated UUID value.
	#[arg(long, default_value = "{timestamp}", value_name = "NAME")]
	pub name: String,

	/// Comma-separated list of databases to back up
	#[arg(short = 'd', long, value_delimiter = ',', value_name = "DATABASES")]
	pub databases: Option<Vec<String>>,

	/// Comma-separated list of tables (db.table) to back up
	#[arg(
		short = 't',
		long,
		value_delimiter = ',',
		value_name = "TABLES",
		conflicts_with = "databases"
	)]
	pub tables: Option<Vec<String>>,

	/// Force mode: backup.min_interval is ignored
	#[arg(short = 'f', long)]
	pub force: bool,

	/// Custom labels as key=value pairs, stored in the backup metadata
	#[arg(short = 'l', long = "label", value_name = "KEY=VALUE")]
	pub labels: Vec<String>,

	/// Back up table schemas without any data
	#[arg(long)]
	pub schema_only: bool,
}

fn name_re() -> &'static Regex {
	static RE: OnceLock<Regex> = OnceLock::new();
	// UNWRAP: static pattern
	RE.get_or_init(|| Regex::new(r"^[\w-]+$").unwrap())
}

pub async fn run(ctx: Context<GlobalArgs, BackupArgs>) -> Result<()> {
	let name = ctx.macros.expand(&ctx.args_sub.name);
	if !name_re().is_match(&name) {
		bail!("backup name {name:?} contains characters outside [a-zA-Z0-9_-]");
	}

	let mut labels = BTreeMap::new();
	for pair in &ctx.args_sub.labels {
		let (key, value) = match pair.split_once('=') {
			Some((key, value)) => (key, value),
			None => (pair.as_str(), ""),
		};
		labels.insert(key.to_string(), value.to_string());
	}

	let config = ctx.args_top.load_config()?;
	let bctx = BackupContext::new(config, ctx.cancel.clone(), ctx.progress.clone()).await?;

	let (name, message) = ops::backup::backup(
		&bctx,
		BackupOptions {
			name,
			databases: ctx.args_sub.databases.clone(),
			tables: ctx.args_sub.tables.clone(),
			force: ctx.args_sub.force,
			labels,
			schema_only: ctx.args_sub.schema_only,
		},
	)
	.await?;

	if let Some(message) = message {
		eprintln!("{message}");
	}
	println!("{name}");
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::actions::context::NameMacros;

	#[test]
	fn macro_expansion_yields_a_valid_name() {
		let macros = NameMacros {
			timestamp: "20240101T120000".into(),
			uuid: "0b5e1a3c-6f76-4d1c-bd7e-1f7a5fbe6e5f".into(),
		};
		let expanded = macros.expand("{timestamp}-{uuid}");
		assert_eq!(expanded, "20240101T120000-0b5e1a3c-6f76-4d1c-bd7e-1f7a5fbe6e5f");
		assert!(name_re().is_match(&expanded));
		assert!(!name_re().is_match("no/slashes"));
		assert!(!name_re().is_match(""));
	}
}
