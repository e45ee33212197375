//! Linear staged pipelines over bounded channels.
//!
//! A pipeline is a chain of stages: one generator, any number of transforms,
//! one sink. Adjacent stages are connected by a bounded `mpsc` queue of
//! [`Bytes`] chunks, so memory stays bounded by queue capacity × chunk size
//! per edge regardless of stream length. Every stage runs as its own task;
//! the first stage error cancels the rest and is the error the caller sees.

use std::{future::Future, pin::Pin};

use bytes::Bytes;
use tokio::{
	sync::mpsc,
	task::JoinSet,
};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::error::{Error, Result};

pub mod crypto;
pub mod io;
pub mod tarball;

type BoxedStage = Pin<Box<dyn Future<Output = Result<()>> + Send + 'static>>;

/// Sending half of a stage edge. Checks for cancellation between chunks.
pub struct ChunkTx {
	tx: mpsc::Sender<Bytes>,
	cancel: CancellationToken,
}

impl ChunkTx {
	pub async fn send(&self, chunk: Bytes) -> Result<()> {
		if self.cancel.is_cancelled() {
			return Err(Error::Interrupted);
		}
		self.tx.send(chunk).await.map_err(|_| Error::StageClosed)
	}
}

/// Receiving half of a stage edge. `Ok(None)` is upstream EOF.
pub struct ChunkRx {
	rx: mpsc::Receiver<Bytes>,
	cancel: CancellationToken,
}

impl ChunkRx {
	pub async fn next(&mut self) -> Result<Option<Bytes>> {
		if self.cancel.is_cancelled() {
			return Err(Error::Interrupted);
		}
		Ok(self.rx.recv().await)
	}
}

pub struct Pipeline {
	capacity: usize,
	cancel: CancellationToken,
	stages: Vec<BoxedStage>,
	tail: Option<ChunkRx>,
}

impl Pipeline {
	/// Start building a pipeline. `cancel` is the caller's token; the
	/// pipeline derives a child token so an internal failure stops its own
	/// stages without cancelling anything else.
	pub fn new(capacity: usize, cancel: &CancellationToken) -> Self {
		Self {
			capacity: capacity.max(1),
			cancel: cancel.child_token(),
			stages: Vec::new(),
			tail: None,
		}
	}

	fn edge(&self) -> (ChunkTx, ChunkRx) {
		let (tx, rx) = mpsc::channel(self.capacity);
		(
			ChunkTx {
				tx,
				cancel: self.cancel.clone(),
			},
			ChunkRx {
				rx,
				cancel: self.cancel.clone(),
			},
		)
	}

	/// Add the generator stage.
	pub fn source<F, Fut>(mut self, stage: F) -> Self
	where
		F: FnOnce(ChunkTx) -> Fut,
		Fut: Future<Output = Result<()>> + Send + 'static,
	{
		assert!(self.tail.is_none(), "BUG: pipeline already has a source");
		let (tx, rx) = self.edge();
		self.stages.push(Box::pin(stage(tx)));
		self.tail = Some(rx);
		self
	}

	/// Add a transform stage (consumes chunks, emits zero or more).
	pub fn then<F, Fut>(mut self, stage: F) -> Self
	where
		F: FnOnce(ChunkRx, ChunkTx) -> Fut,
		Fut: Future<Output = Result<()>> + Send + 'static,
	{
		let upstream = self.tail.take().expect("BUG: transform before source");
		let (tx, rx) = self.edge();
		self.stages.push(Box::pin(stage(upstream, tx)));
		self.tail = Some(rx);
		self
	}

	/// Add the terminal sink stage.
	pub fn sink<F, Fut>(mut self, stage: F) -> Self
	where
		F: FnOnce(ChunkRx) -> Fut,
		Fut: Future<Output = Result<()>> + Send + 'static,
	{
		let upstream = self.tail.take().expect("BUG: sink before source");
		self.stages.push(Box::pin(stage(upstream)));
		self
	}

	/// Terminate with a sink that discards remaining chunks. Used after
	/// transforms that emit nothing (e.g. uploads).
	pub fn drain(self) -> Self {
		self.sink(io::drain)
	}

	/// Run to completion. Blocks until the sink drains or a stage fails; on
	/// failure all other stages are cancelled and the originating error is
	/// returned.
	pub async fn run(self) -> Result<()> {
		let Self {
			cancel,
			stages,
			tail,
			..
		} = self;
		assert!(tail.is_none(), "BUG: pipeline must end in a sink");

		let mut tasks = JoinSet::new();
		for stage in stages {
			tasks.spawn(stage);
		}

		let mut errors = Vec::new();
		while let Some(joined) = tasks.join_next().await {
			let result = joined
				.unwrap_or_else(|err| Err(Error::Pipeline(format!("stage panicked: {err}"))));
			if let Err(err) = result {
				trace!(%err, "pipeline stage failed");
				cancel.cancel();
				errors.push(err);
			}
		}

		// Secondary errors (closed channels, cancellations triggered by the
		// failing stage) must not mask the root cause.
		match errors
			.iter()
			.position(|err| !matches!(err, Error::StageClosed | Error::Interrupted))
		{
			Some(i) => Err(errors.swap_remove(i)),
			None => match errors.into_iter().next() {
				Some(err) => Err(err),
				None => Ok(()),
			},
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use bytes::Bytes;
	use tokio::sync::oneshot;

	#[tokio::test]
	async fn chunks_flow_in_order_through_a_transform() {
		let cancel = CancellationToken::new();
		let (done_tx, done_rx) = oneshot::channel();

		Pipeline::new(2, &cancel)
			.source(|tx| async move {
				for i in 0u8..10 {
					tx.send(Bytes::from(vec![i; 3])).await?;
				}
				Ok(())
			})
			.then(|mut rx, tx| async move {
				while let Some(chunk) = rx.next().await? {
					tx.send(chunk.slice(..1)).await?;
				}
				Ok(())
			})
			.sink(|rx| io::collect_into(rx, done_tx))
			.run()
			.await
			.unwrap();

		let collected = done_rx.await.unwrap();
		assert_eq!(&collected[..], &[0, 1, 2, 3, 4, 5, 6, 7, 8, 9]);
	}

	#[tokio::test]
	async fn sink_error_wins_over_closed_channel() {
		let cancel = CancellationToken::new();

		let err = Pipeline::new(1, &cancel)
			.source(|tx| async move {
				loop {
					tx.send(Bytes::from_static(b"data")).await?;
				}
			})
			.sink(|mut rx| async move {
				let _ = rx.next().await?;
				Err(Error::validation("sink rejected the stream"))
			})
			.run()
			.await
			.unwrap_err();

		assert!(matches!(err, Error::Validation(_)), "got {err:?}");
	}

	#[tokio::test]
	async fn cancellation_stops_stages_between_chunks() {
		let cancel = CancellationToken::new();
		cancel.cancel();

		let err = Pipeline::new(1, &cancel)
			.source(|tx| async move { tx.send(Bytes::from_static(b"x")).await })
			.drain()
			.run()
			.await
			.unwrap_err();

		assert!(matches!(err, Error::Interrupted), "got {err:?}");
	}
}
