use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::cancel::CancelToken;

/// Mailbox send error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
	/// Mailbox is closed; no further items are accepted.
	#[error("mailbox is closed")]
	Closed,
	/// Queue is full and a non-blocking or time-bounded send was used.
	#[error("mailbox is full")]
	Full,
	/// A blocked send was cancelled through its token.
	#[error("send was cancelled")]
	Cancelled,
}

struct MailboxState<T> {
	queue: VecDeque<T>,
	closed: bool,
}

struct MailboxInner<T> {
	capacity: Option<usize>,
	state: Mutex<MailboxState<T>>,
	not_empty: Condvar,
	not_full: Condvar,
}

impl<T> MailboxInner<T> {
	fn has_space(&self, state: &MailboxState<T>) -> bool {
		self.capacity.is_none_or(|cap| state.queue.len() < cap)
	}
}

/// Bounded or unbounded concurrent FIFO queue feeding exactly one consumer.
///
/// Items are delivered in enqueue order. Once closed, no new items are
/// accepted but previously enqueued items remain deliverable; after the
/// queue is closed and drained, [`MailboxReceiver::recv`] returns `None`
/// and the consuming loop terminates.
pub struct Mailbox<T> {
	inner: Arc<MailboxInner<T>>,
}

/// Cloneable send-only capability over a mailbox.
///
/// This is the only surface producers see; it never owns the mailbox
/// lifetime.
pub struct MailboxSender<T> {
	inner: Arc<MailboxInner<T>>,
}

/// Consuming side of a mailbox. One receiver per mailbox.
pub struct MailboxReceiver<T> {
	inner: Arc<MailboxInner<T>>,
}

impl<T> Clone for MailboxSender<T> {
	fn clone(&self) -> Self {
		Self {
			inner: Arc::clone(&self.inner),
		}
	}
}

impl<T> Mailbox<T> {
	/// Creates a mailbox without a capacity bound.
	pub fn unbounded() -> Self {
		Self::with_capacity(None)
	}

	/// Creates a bounded mailbox.
	///
	/// # Panics
	///
	/// Panics if `capacity` is zero.
	pub fn bounded(capacity: usize) -> Self {
		assert!(capacity > 0, "mailbox capacity must be > 0");
		Self::with_capacity(Some(capacity))
	}

	fn with_capacity(capacity: Option<usize>) -> Self {
		Self {
			inner: Arc::new(MailboxInner {
				capacity,
				state: Mutex::new(MailboxState {
					queue: VecDeque::new(),
					closed: false,
				}),
				not_empty: Condvar::new(),
				not_full: Condvar::new(),
			}),
		}
	}

	/// Returns a sender handle.
	pub fn sender(&self) -> MailboxSender<T> {
		MailboxSender {
			inner: Arc::clone(&self.inner),
		}
	}

	/// Returns the receiver handle. The mailbox feeds exactly one consumer;
	/// create a single receiver and hand it to the owning worker.
	pub fn receiver(&self) -> MailboxReceiver<T> {
		MailboxReceiver {
			inner: Arc::clone(&self.inner),
		}
	}
}

impl<T> MailboxSender<T> {
	/// Blocking enqueue. Waits while a bounded mailbox is full; fails with
	/// [`SendError::Closed`] once the mailbox is closed, including while
	/// waiting for space.
	pub fn send(&self, item: T) -> Result<(), SendError> {
		self.send_inner(item, None, None)
	}

	/// Blocking enqueue that also unblocks with [`SendError::Cancelled`]
	/// when `cancel` fires.
	pub fn send_cancellable(&self, item: T, cancel: &CancelToken) -> Result<(), SendError>
	where
		T: Send + 'static,
	{
		let _wake = cancel.register(self.waker());
		self.send_inner(item, None, Some(cancel))
	}

	/// Non-blocking enqueue. Returns [`SendError::Full`] instead of waiting.
	pub fn try_send(&self, item: T) -> Result<(), SendError> {
		let mut state = self.inner.state.lock();
		if state.closed {
			return Err(SendError::Closed);
		}
		if !self.inner.has_space(&state) {
			return Err(SendError::Full);
		}
		state.queue.push_back(item);
		self.inner.not_empty.notify_one();
		Ok(())
	}

	/// Time-bounded enqueue. Waits up to `timeout` for space, then returns
	/// [`SendError::Full`].
	pub fn try_send_timeout(&self, item: T, timeout: Duration) -> Result<(), SendError> {
		self.send_inner(item, Some(Instant::now() + timeout), None)
	}

	/// Time-bounded enqueue that also unblocks with [`SendError::Cancelled`]
	/// when `cancel` fires.
	pub fn try_send_timeout_cancellable(&self, item: T, timeout: Duration, cancel: &CancelToken) -> Result<(), SendError>
	where
		T: Send + 'static,
	{
		let _wake = cancel.register(self.waker());
		self.send_inner(item, Some(Instant::now() + timeout), Some(cancel))
	}

	/// Closes the mailbox. Queued items remain deliverable; all blocked
	/// senders and the receiver are woken. Idempotent.
	pub fn close(&self) {
		let mut state = self.inner.state.lock();
		state.closed = true;
		self.inner.not_empty.notify_all();
		self.inner.not_full.notify_all();
		drop(state);
	}

	/// Returns current queue length.
	pub fn len(&self) -> usize {
		self.inner.state.lock().queue.len()
	}

	/// Returns true when no items are queued.
	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Returns true once the mailbox has been closed.
	pub fn is_closed(&self) -> bool {
		self.inner.state.lock().closed
	}

	/// Returns the capacity bound, if any.
	pub fn capacity(&self) -> Option<usize> {
		self.inner.capacity
	}

	fn send_inner(&self, item: T, deadline: Option<Instant>, cancel: Option<&CancelToken>) -> Result<(), SendError> {
		let mut state = self.inner.state.lock();
		loop {
			if state.closed {
				return Err(SendError::Closed);
			}
			if cancel.is_some_and(CancelToken::is_cancelled) {
				return Err(SendError::Cancelled);
			}
			if self.inner.has_space(&state) {
				break;
			}
			match deadline {
				Some(deadline) => {
					if self.inner.not_full.wait_until(&mut state, deadline).timed_out() {
						return Err(SendError::Full);
					}
				}
				None => self.inner.not_full.wait(&mut state),
			}
		}
		state.queue.push_back(item);
		self.inner.not_empty.notify_one();
		Ok(())
	}

	/// Waker handed to cancellation tokens. Takes the state lock before
	/// notifying so a sender between its cancelled-check and its wait cannot
	/// miss the wakeup.
	fn waker(&self) -> crate::cancel::CancelWaker
	where
		T: Send + 'static,
	{
		let inner = Arc::clone(&self.inner);
		Arc::new(move || {
			let state = inner.state.lock();
			inner.not_full.notify_all();
			drop(state);
		})
	}
}

impl<T> MailboxReceiver<T> {
	/// Receives one item. Blocks while the mailbox is empty and open;
	/// returns `None` once the mailbox is closed and drained.
	pub fn recv(&self) -> Option<T> {
		let mut state = self.inner.state.lock();
		loop {
			if let Some(item) = state.queue.pop_front() {
				self.inner.not_full.notify_one();
				return Some(item);
			}
			if state.closed {
				return None;
			}
			self.inner.not_empty.wait(&mut state);
		}
	}

	/// Returns current queue length.
	pub fn len(&self) -> usize {
		self.inner.state.lock().queue.len()
	}

	/// Returns true when no items are queued.
	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}
