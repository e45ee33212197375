use clap::Subcommand;
use miette::Result;
use tracing::{debug, trace};

pub use context::Context;
pub mod context;

pub mod backup;
pub mod delete;
pub mod list;
pub mod purge;
pub mod restore;
pub mod show;
pub mod version;

use crate::args::Args;

#[derive(Debug, Clone, Subcommand)]
pub enum Action {
	List(list::ListArgs),
	Show(show::ShowArgs),
	Backup(backup::BackupArgs),
	Restore(restore::RestoreArgs),
	Delete(delete::DeleteArgs),
	Purge(purge::PurgeArgs),
	Version(version::VersionArgs),
}

pub async fn run(args: Args) -> Result<()> {
	debug!(version=%env!("CARGO_PKG_VERSION"), "starting up");
	let (action, global) = args.split();
	trace!(?global, "global arguments");
	let ctx = Context::new().with_top(global);
	ctx.cancel_on_ctrl_c();

	match action {
		Action::List(args) => list::run(ctx.with_sub(args)).await,
		Action::Show(args) => show::run(ctx.with_sub(args)).await,
		Action::Backup(args) => backup::run(ctx.with_sub(args)).await,
		Action::Restore(args) => restore::run(ctx.with_sub(args)).await,
		Action::Delete(args) => delete::run(ctx.with_sub(args)).await,
		Action::Purge(args) => purge::run(ctx.with_sub(args)).await,
		Action::Version(args) => version::run(ctx.with_sub(args)).await,
	}
}
