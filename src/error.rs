use miette::Diagnostic;
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Error kinds surfaced by the backup engine.
///
/// Components return these to the orchestrators, which decide whether to
/// retry, skip, or surface. The CLI layer converts into [`miette::Report`]
/// and exits non-zero.
#[derive(Debug, Error, Diagnostic)]
pub enum Error {
	/// Invalid configuration or flags. Fatal before any work starts.
	#[error("invalid configuration: {0}")]
	#[diagnostic(code(chbak::config))]
	Config(String),

	/// A ClickHouse request failed.
	#[error("clickhouse: {0}")]
	#[diagnostic(code(chbak::clickhouse))]
	Clickhouse(String),

	/// An object storage operation failed after its retry budget.
	#[error("storage: {0}")]
	#[diagnostic(code(chbak::storage))]
	Storage(String),

	/// Checksum mismatch, inconsistent metadata, or a missing required
	/// object. Never retried.
	#[error("validation: {0}")]
	#[diagnostic(code(chbak::validation))]
	Validation(String),

	#[error("not found: {0}")]
	#[diagnostic(code(chbak::not_found))]
	NotFound(String),

	/// The top-level cancellation signal fired.
	#[error("interrupted")]
	#[diagnostic(code(chbak::interrupted))]
	Interrupted,

	/// A pipeline stage found its output channel closed. This only happens
	/// when a downstream stage already failed; that failure is the one
	/// reported to the caller.
	#[error("pipeline stage output closed early")]
	#[diagnostic(code(chbak::pipeline))]
	StageClosed,

	/// A pipeline stage panicked or was misassembled.
	#[error("pipeline: {0}")]
	#[diagnostic(code(chbak::pipeline))]
	Pipeline(String),

	#[error(transparent)]
	#[diagnostic(code(chbak::io))]
	Io(#[from] std::io::Error),

	#[error(transparent)]
	#[diagnostic(code(chbak::json))]
	Json(#[from] serde_json::Error),
}

impl Error {
	pub fn config(msg: impl std::fmt::Display) -> Self {
		Self::Config(msg.to_string())
	}

	pub fn clickhouse(msg: impl std::fmt::Display) -> Self {
		Self::Clickhouse(msg.to_string())
	}

	pub fn storage(msg: impl std::fmt::Display) -> Self {
		Self::Storage(msg.to_string())
	}

	pub fn validation(msg: impl std::fmt::Display) -> Self {
		Self::Validation(msg.to_string())
	}

	pub fn not_found(msg: impl std::fmt::Display) -> Self {
		Self::NotFound(msg.to_string())
	}

	/// Whether a delete may silently swallow this error.
	pub fn is_not_found(&self) -> bool {
		matches!(self, Self::NotFound(_))
	}
}
