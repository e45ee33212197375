use clap::Parser;
use miette::Result;

use crate::{actions::Context, args::GlobalArgs};

/// Print the version
#[derive(Debug, Clone, Parser)]
pub struct VersionArgs {}

pub async fn run(_ctx: Context<GlobalArgs, VersionArgs>) -> Result<()> {
	println!("{}", env!("CARGO_PKG_VERSION"));
	Ok(())
}
