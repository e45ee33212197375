use std::path::{Path, PathBuf};

use clap::Parser;
use lloggs::{LoggingArgs, PreArgs, WorkerGuard};
use miette::{miette, Result};
use tracing::debug;

use crate::config::{Config, Protocol, DEFAULT_CONFIG_PATH};

/// ClickHouse backup tooling
///
/// Creates consistent, deduplicated, optionally encrypted backups of a
/// ClickHouse server in object storage, and restores them.
#[derive(Debug, Clone, Parser)]
#[command(
	author,
	version,
	after_help = "Want more detail? Try the long '--help' flag!",
	after_long_help = "Didn't expect this much output? Use the short '-h' flag to get short help."
)]
pub struct Args {
	#[command(flatten)]
	pub logging: LoggingArgs,

	/// Configuration file path
	#[arg(
		long,
		short = 'c',
		global = true,
		default_value = DEFAULT_CONFIG_PATH,
		value_name = "PATH"
	)]
	pub config: PathBuf,

	/// Protocol used to connect to the ClickHouse server
	#[arg(long, global = true, value_name = "PROTOCOL")]
	pub protocol: Option<Protocol>,

	/// Port used to connect to the ClickHouse server
	#[arg(long, global = true, value_name = "PORT")]
	pub port: Option<u16>,

	/// Path to a custom CA bundle for the https protocol
	#[arg(long, global = true, value_name = "PATH")]
	pub ca_path: Option<PathBuf>,

	/// Disable certificate verification for the https protocol
	#[arg(long, global = true)]
	pub insecure: bool,

	/// What to do
	#[command(subcommand)]
	pub action: crate::actions::Action,
}

/// The global flags every action receives.
#[derive(Debug, Clone)]
pub struct GlobalArgs {
	pub config: PathBuf,
	pub protocol: Option<Protocol>,
	pub port: Option<u16>,
	pub ca_path: Option<PathBuf>,
	pub insecure: bool,
}

impl Args {
	pub fn split(self) -> (crate::actions::Action, GlobalArgs) {
		(
			self.action,
			GlobalArgs {
				config: self.config,
				protocol: self.protocol,
				port: self.port,
				ca_path: self.ca_path,
				insecure: self.insecure,
			},
		)
	}
}

impl GlobalArgs {
	/// Load the config file and apply the connection override flags.
	pub fn load_config(&self) -> Result<Config, crate::error::Error> {
		let mut config = Config::load(&self.config)?;
		config.apply_overrides(
			self.protocol,
			self.port,
			self.ca_path.clone(),
			self.insecure,
		);
		Ok(config)
	}
}

pub fn get_args() -> Result<(Args, WorkerGuard)> {
	let log_guard = PreArgs::parse().setup().map_err(|err| miette!("{err}"))?;

	debug!("parsing arguments");
	let args = Args::parse();

	let log_guard = match log_guard {
		Some(guard) => guard,
		None => {
			let base = config_log_level(&args.config);
			args.logging
				.setup(move |verbosity| match verbosity {
					0 => base,
					1 => "info,chbak=debug",
					2 => "debug",
					3 => "debug,chbak=trace",
					_ => "trace",
				})
				.map_err(|err| miette!("{err}"))?
		}
	};

	debug!(?args, "got arguments");
	Ok((args, log_guard))
}

/// Baseline filter from the `[logging]` config section, for when neither
/// `-v` flags nor $RUST_LOG say otherwise. Read leniently: logging must
/// come up even when the config is broken (the real load reports errors
/// later, with diagnostics).
fn config_log_level(path: &Path) -> &'static str {
	match Config::load(path) {
		Ok(config) => Box::leak(config.logging.level.into_boxed_str()),
		Err(_) => "info",
	}
}

#[test]
fn verify_cli() {
	use clap::CommandFactory;
	Args::command().debug_assert()
}

#[test]
fn database_and_table_filters_conflict() {
	let result = Args::try_parse_from(["chbak", "backup", "-d", "db1", "-t", "db1.t1"]);
	assert!(result.is_err());
}
