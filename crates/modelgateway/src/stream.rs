//! The stream coupler: a bounded bridge between a provider chunk stream and
//! the downstream client. The producer suspends when the queue is full and
//! the consumer when it is empty; a keep-alive frame is emitted after
//! downstream idle periods, and dropping the consumer cancels the upstream
//! connection.

use std::future::Future;

use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{Sleep, sleep};
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::llm::ChunkStream;
use crate::types::uniform::{StreamEvent, Usage};
use crate::*;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CouplerConfig {
	#[serde(default = "default_capacity")]
	pub capacity: usize,
	#[serde(default = "default_keep_alive", with = "serde_dur")]
	pub keep_alive: Duration,
}

fn default_capacity() -> usize {
	1024
}
fn default_keep_alive() -> Duration {
	Duration::from_secs(15)
}

impl Default for CouplerConfig {
	fn default() -> Self {
		CouplerConfig {
			capacity: default_capacity(),
			keep_alive: default_keep_alive(),
		}
	}
}

/// Frames delivered to the HTTP layer. `Done` is always the final frame of a
/// well-formed stream, including after an `Error`.
#[derive(Debug, Clone)]
pub enum StreamFrame {
	Chunk(crate::types::uniform::UniformChunk),
	KeepAlive,
	Error(ErrorFrame),
	Done,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorFrame {
	pub error: ErrorBody,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
	pub r#type: String,
	pub message: String,
	pub code: String,
	pub param: Option<String>,
	pub request_id: String,
}

impl ErrorFrame {
	pub fn interrupted(request_id: &str, message: String) -> ErrorFrame {
		ErrorFrame {
			error: ErrorBody {
				r#type: "provider_error".to_string(),
				message,
				code: "stream_interrupted".to_string(),
				param: None,
				request_id: request_id.to_string(),
			},
		}
	}
}

/// How the stream ended, reported exactly once to the completion hook so the
/// dispatch layer can settle inflight counters, breaker and health state.
#[derive(Debug)]
pub enum StreamOutcome {
	/// Terminal marker observed and delivered.
	Completed { usage: Usage, chunks: u64 },
	/// Upstream failed after frames were already committed downstream.
	Failed {
		message: String,
		usage: Usage,
		chunks: u64,
	},
	/// Downstream disconnected; the upstream call was dropped. Not a
	/// provider failure.
	Cancelled { usage: Usage, chunks: u64 },
}

pub type CompletionHook = Box<dyn FnOnce(StreamOutcome) + Send>;

/// Couple an upstream chunk stream to a bounded downstream queue.
///
/// The returned stream yields frames in upstream arrival order. The
/// `cancel` token is cancelled automatically when the returned stream is
/// dropped, which tears down the producer and the upstream connection.
pub fn couple(
	request_id: Strng,
	upstream: ChunkStream,
	cfg: CouplerConfig,
	on_complete: CompletionHook,
) -> CoupledStream {
	let cancel = CancellationToken::new();
	let (tx, rx) = mpsc::channel::<StreamFrame>(cfg.capacity.max(1));

	let producer_cancel = cancel.clone();
	tokio::spawn(async move {
		let mut upstream = upstream;
		let mut chunks: u64 = 0;
		let mut content_chunks: u32 = 0;
		let mut final_usage: Option<Usage> = None;

		let usage = |final_usage: Option<Usage>, content_chunks: u32| {
			final_usage.unwrap_or(Usage {
				prompt_tokens: 0,
				completion_tokens: content_chunks,
				total_tokens: content_chunks,
			})
		};

		let outcome = loop {
			tokio::select! {
				biased;
				_ = producer_cancel.cancelled() => {
					break StreamOutcome::Cancelled {
						usage: usage(final_usage, content_chunks),
						chunks,
					};
				},
				item = upstream.next() => match item {
					Some(Ok(StreamEvent::Chunk(chunk))) => {
						chunks += 1;
						if chunk.content_delta().is_some() {
							content_chunks += 1;
						}
						if let Some(u) = chunk.usage {
							final_usage = Some(u);
						}
						if tx.send(StreamFrame::Chunk(chunk)).await.is_err() {
							break StreamOutcome::Cancelled {
								usage: usage(final_usage, content_chunks),
								chunks,
							};
						}
					},
					Some(Ok(StreamEvent::Done)) => {
						let _ = tx.send(StreamFrame::Done).await;
						break StreamOutcome::Completed {
							usage: usage(final_usage, content_chunks),
							chunks,
						};
					},
					Some(Err(e)) => {
						// The response status is already committed; surface the
						// failure inside the stream and terminate it cleanly.
						let message = e.to_string();
						let _ = tx
							.send(StreamFrame::Error(ErrorFrame::interrupted(&request_id, message.clone())))
							.await;
						let _ = tx.send(StreamFrame::Done).await;
						break StreamOutcome::Failed {
							message,
							usage: usage(final_usage, content_chunks),
							chunks,
						};
					},
					None => {
						// Codecs terminate with Done or an error; a bare end is
						// a protocol violation.
						let message = "upstream stream ended unexpectedly".to_string();
						let _ = tx
							.send(StreamFrame::Error(ErrorFrame::interrupted(&request_id, message.clone())))
							.await;
						let _ = tx.send(StreamFrame::Done).await;
						break StreamOutcome::Failed {
							message,
							usage: usage(final_usage, content_chunks),
							chunks,
						};
					},
				},
			}
		};
		on_complete(outcome);
	});

	CoupledStream {
		rx,
		keep_alive: cfg.keep_alive,
		idle: Box::pin(sleep(cfg.keep_alive)),
		finished: false,
		_cancel_guard: cancel.drop_guard(),
		_held: None,
	}
}

pub struct CoupledStream {
	rx: mpsc::Receiver<StreamFrame>,
	keep_alive: Duration,
	idle: Pin<Box<Sleep>>,
	finished: bool,
	_cancel_guard: DropGuard,
	/// Opaque state that must live as long as the stream, e.g. the dispatch
	/// layer's active-request guard.
	_held: Option<Box<dyn std::any::Any + Send>>,
}

impl CoupledStream {
	pub fn hold_guard<T: Send + 'static>(mut self, guard: T) -> Self {
		self._held = Some(Box::new(guard));
		self
	}
}

impl Stream for CoupledStream {
	type Item = StreamFrame;

	fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
		if self.finished {
			return Poll::Ready(None);
		}
		match self.rx.poll_recv(cx) {
			Poll::Ready(Some(frame)) => {
				if matches!(frame, StreamFrame::Done) {
					self.finished = true;
				}
				let deadline = tokio::time::Instant::now() + self.keep_alive;
				self.idle.as_mut().reset(deadline);
				Poll::Ready(Some(frame))
			},
			Poll::Ready(None) => {
				self.finished = true;
				Poll::Ready(None)
			},
			Poll::Pending => {
				// Downstream idle: emit a keep-alive when the timer fires.
				if self.idle.as_mut().poll(cx).is_ready() {
					let deadline = tokio::time::Instant::now() + self.keep_alive;
					self.idle.as_mut().reset(deadline);
					return Poll::Ready(Some(StreamFrame::KeepAlive));
				}
				Poll::Pending
			},
		}
	}
}
