use chrono::Utc;
use indicatif::MultiProgress;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Values for the `{timestamp}` and `{uuid}` backup-name macros, fixed once
/// at startup so every expansion within a run agrees.
#[derive(Debug, Clone)]
pub struct NameMacros {
	pub timestamp: String,
	pub uuid: String,
}

impl NameMacros {
	fn generate() -> Self {
		Self {
			timestamp: Utc::now().format("%Y%m%dT%H%M%S").to_string(),
			uuid: uuid::Uuid::new_v4().to_string(),
		}
	}

	pub fn expand(&self, input: &str) -> String {
		input
			.replace("{timestamp}", &self.timestamp)
			.replace("{uuid}", &self.uuid)
	}
}

#[derive(Clone, Debug)]
pub struct Context<A = (), B = ()> {
	pub args_top: A,
	pub args_sub: B,
	pub progress: MultiProgress,
	pub cancel: CancellationToken,
	pub macros: NameMacros,
}

impl Context {
	pub fn new() -> Self {
		Self {
			args_top: (),
			args_sub: (),
			progress: MultiProgress::new(),
			cancel: CancellationToken::new(),
			macros: NameMacros::generate(),
		}
	}
}

impl<A, B> Context<A, B> {
	pub fn with_top<C>(self, args_top: C) -> Context<C, B> {
		Context::<C, B> {
			args_top,
			args_sub: self.args_sub,
			progress: self.progress,
			cancel: self.cancel,
			macros: self.macros,
		}
	}

	pub fn with_sub<C>(self, args_sub: C) -> Context<A, C> {
		Context::<A, C> {
			args_top: self.args_top,
			args_sub,
			progress: self.progress,
			cancel: self.cancel,
			macros: self.macros,
		}
	}

	/// Cancel all in-flight work on the first Ctrl-C; a second one kills
	/// the process the hard way.
	pub fn cancel_on_ctrl_c(&self) {
		let cancel = self.cancel.clone();
		tokio::spawn(async move {
			if tokio::signal::ctrl_c().await.is_ok() {
				info!("interrupt received, stopping new work");
				cancel.cancel();
				if tokio::signal::ctrl_c().await.is_ok() {
					std::process::exit(130);
				}
			}
		});
	}
}
