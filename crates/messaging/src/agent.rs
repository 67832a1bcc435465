use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;

use crate::cancel::CancelToken;
use crate::fault::{self, Fault, FaultSink};
use crate::mailbox::{Mailbox, MailboxReceiver, MailboxSender, SendError};

/// Error returned when sending to a stopped or disposed agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AgentSendError {
	/// The agent has been stopped; its mailbox no longer accepts items.
	#[error("agent has been stopped")]
	Stopped,
	/// The agent has been disposed.
	#[error("agent has been disposed")]
	Disposed,
	/// A blocked send was cancelled through its token.
	#[error("send was cancelled")]
	Cancelled,
}

/// Fold applied to each dequeued item: borrows the current state and either
/// produces the next state or an error value. On error the state is left
/// untouched by that item.
pub type FoldFn<T, U> = dyn Fn(&T, U) -> Result<T, String> + Send + Sync;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExecState {
	NotStarted,
	Starting,
	Running,
	Stopping,
	Stopped,
}

/// Everything the worker thread needs; held until the first `start()`.
struct WorkerSeed<T, U> {
	rx: MailboxReceiver<U>,
	fold: Arc<FoldFn<T, U>>,
	value: Arc<Mutex<T>>,
	sink: FaultSink,
	name: String,
}

struct Lifecycle<T, U> {
	state: ExecState,
	worker: Option<JoinHandle<()>>,
	seed: Option<WorkerSeed<T, U>>,
}

/// Builder for [`Agent`].
pub struct AgentBuilder<T, U> {
	initial: T,
	fold: Arc<FoldFn<T, U>>,
	capacity: Option<usize>,
	sink: FaultSink,
	name: String,
}

impl<T, U> AgentBuilder<T, U>
where
	T: Send + 'static,
	U: Send + 'static,
{
	/// Bounds the mailbox; blocking sends then wait under backpressure.
	///
	/// # Panics
	///
	/// Panics if `capacity` is zero.
	#[must_use]
	pub fn capacity(mut self, capacity: usize) -> Self {
		assert!(capacity > 0, "mailbox capacity must be > 0");
		self.capacity = Some(capacity);
		self
	}

	/// Names the worker thread.
	#[must_use]
	pub fn name(mut self, name: impl Into<String>) -> Self {
		self.name = name.into();
		self
	}

	/// Replaces the default tracing-backed fault sink.
	#[must_use]
	pub fn fault_sink(mut self, sink: impl Fn(&Fault) + Send + Sync + 'static) -> Self {
		self.sink = Arc::new(sink);
		self
	}

	/// Builds the agent in the `NotStarted` state.
	pub fn build(self) -> Agent<T, U> {
		let mailbox = match self.capacity {
			Some(capacity) => Mailbox::bounded(capacity),
			None => Mailbox::unbounded(),
		};
		let tx = mailbox.sender();
		let rx = mailbox.receiver();
		let value = Arc::new(Mutex::new(self.initial));
		let seed = WorkerSeed {
			rx,
			fold: self.fold,
			value: Arc::clone(&value),
			sink: Arc::clone(&self.sink),
			name: self.name.clone(),
		};
		Agent {
			tx,
			value,
			lifecycle: Mutex::new(Lifecycle {
				state: ExecState::NotStarted,
				worker: None,
				seed: Some(seed),
			}),
			disposed: AtomicBool::new(false),
			sink: self.sink,
			name: self.name,
		}
	}
}

/// Sequential message-processing agent: a private state value, a fold, and
/// one dedicated worker thread that drains the mailbox in FIFO order.
///
/// The state is touched by exactly one thread: the worker applies the fold
/// item by item, and [`Agent::value`] is a snapshot read intended for after
/// [`Agent::stop`] has returned, when the agent is quiescent.
pub struct Agent<T, U> {
	tx: MailboxSender<U>,
	value: Arc<Mutex<T>>,
	lifecycle: Mutex<Lifecycle<T, U>>,
	disposed: AtomicBool,
	sink: FaultSink,
	name: String,
}

impl<T, U> Agent<T, U>
where
	T: Send + 'static,
	U: Send + 'static,
{
	/// Creates an unbounded agent with the default fault sink.
	pub fn new(initial: T, fold: impl Fn(&T, U) -> Result<T, String> + Send + Sync + 'static) -> Self {
		Self::builder(initial, fold).build()
	}

	/// Returns a builder over `initial` state and `fold`.
	pub fn builder(initial: T, fold: impl Fn(&T, U) -> Result<T, String> + Send + Sync + 'static) -> AgentBuilder<T, U> {
		AgentBuilder {
			initial,
			fold: Arc::new(fold),
			capacity: None,
			sink: fault::log_sink(),
			name: "agent".to_string(),
		}
	}

	/// Starts the worker thread. No-op unless the agent is `NotStarted`.
	pub fn start(&self) {
		let mut lifecycle = self.lifecycle.lock();
		if lifecycle.state != ExecState::NotStarted {
			return;
		}
		lifecycle.state = ExecState::Starting;
		let Some(seed) = lifecycle.seed.take() else {
			unreachable!("worker seed present before first start")
		};
		tracing::trace!(agent = %self.name, "messaging.agent.start");
		lifecycle.worker = Some(spawn_worker(seed));
		lifecycle.state = ExecState::Running;
	}

	/// Stops the agent. Closes the mailbox and blocks until every queued
	/// item has been processed and the worker has exited. Idempotent; from
	/// `NotStarted` the agent moves directly to `Stopped` without a worker
	/// ever running.
	pub fn stop(&self) {
		let mut lifecycle = self.lifecycle.lock();
		match lifecycle.state {
			ExecState::NotStarted => {
				self.tx.close();
				lifecycle.seed = None;
				lifecycle.state = ExecState::Stopped;
			}
			ExecState::Running => {
				lifecycle.state = ExecState::Stopping;
				self.tx.close();
				if let Some(worker) = lifecycle.worker.take() {
					if let Err(payload) = worker.join() {
						(self.sink)(&Fault::Panicked {
							detail: fault::panic_message(payload),
						});
					}
				}
				lifecycle.state = ExecState::Stopped;
				tracing::trace!(agent = %self.name, "messaging.agent.stop");
			}
			ExecState::Starting | ExecState::Stopping | ExecState::Stopped => {}
		}
	}

	/// Blocking enqueue. Waits under backpressure when the mailbox is
	/// bounded.
	pub fn send(&self, item: U) -> Result<(), AgentSendError> {
		if self.disposed.load(Ordering::Acquire) {
			return Err(AgentSendError::Disposed);
		}
		self.tx.send(item).map_err(|_| AgentSendError::Stopped)
	}

	/// Blocking enqueue that unblocks when `cancel` fires.
	pub fn send_cancellable(&self, item: U, cancel: &CancelToken) -> Result<(), AgentSendError> {
		if self.disposed.load(Ordering::Acquire) {
			return Err(AgentSendError::Disposed);
		}
		self.tx.send_cancellable(item, cancel).map_err(|err| match err {
			SendError::Cancelled => AgentSendError::Cancelled,
			SendError::Closed | SendError::Full => AgentSendError::Stopped,
		})
	}

	/// Non-blocking enqueue. Returns false on backpressure or a stopped or
	/// disposed agent, never an error value.
	pub fn try_send(&self, item: U) -> bool {
		!self.disposed.load(Ordering::Acquire) && self.tx.try_send(item).is_ok()
	}

	/// Time-bounded enqueue.
	pub fn try_send_timeout(&self, item: U, timeout: Duration) -> bool {
		!self.disposed.load(Ordering::Acquire) && self.tx.try_send_timeout(item, timeout).is_ok()
	}

	/// Time-bounded enqueue that also gives up when `cancel` fires.
	pub fn try_send_timeout_cancellable(&self, item: U, timeout: Duration, cancel: &CancelToken) -> bool {
		!self.disposed.load(Ordering::Acquire) && self.tx.try_send_timeout_cancellable(item, timeout, cancel).is_ok()
	}

	/// Snapshot of the current state.
	///
	/// Intended to be read after [`Agent::stop`] has returned, when the
	/// worker has drained the mailbox and exited; a read before that sees
	/// whatever prefix of items the worker has folded so far.
	pub fn value(&self) -> T
	where
		T: Clone,
	{
		self.value.lock().clone()
	}

	/// Stops the agent and marks it disposed. Idempotent and safe even if
	/// [`Agent::start`] was never called.
	pub fn dispose(&self) {
		if self.disposed.swap(true, Ordering::AcqRel) {
			return;
		}
		self.stop();
	}
}

impl<T, U> Drop for Agent<T, U> {
	fn drop(&mut self) {
		// Deterministic cleanup without relying on callers to dispose.
		if self.disposed.swap(true, Ordering::AcqRel) {
			return;
		}
		let mut lifecycle = self.lifecycle.lock();
		self.tx.close();
		lifecycle.seed = None;
		if let Some(worker) = lifecycle.worker.take() {
			let _ = worker.join();
		}
		lifecycle.state = ExecState::Stopped;
	}
}

fn spawn_worker<T, U>(seed: WorkerSeed<T, U>) -> JoinHandle<()>
where
	T: Send + 'static,
	U: Send + 'static,
{
	std::thread::Builder::new()
		.name(seed.name.clone())
		.spawn(move || run_worker(seed))
		.expect("failed to spawn agent worker thread")
}

fn run_worker<T, U>(seed: WorkerSeed<T, U>) {
	let WorkerSeed { rx, fold, value, sink, name } = seed;
	tracing::trace!(agent = %name, "messaging.agent.worker_enter");
	while let Some(item) = rx.recv() {
		let mut state = value.lock();
		match panic::catch_unwind(AssertUnwindSafe(|| fold(&state, item))) {
			Ok(Ok(next)) => *state = next,
			Ok(Err(detail)) => {
				drop(state);
				sink(&Fault::Handler { detail });
			}
			Err(payload) => {
				drop(state);
				sink(&Fault::Panicked {
					detail: fault::panic_message(payload),
				});
			}
		}
	}
	tracing::trace!(agent = %name, "messaging.agent.worker_exit");
}
