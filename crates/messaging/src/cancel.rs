use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

/// Callback invoked when a token is cancelled, used to wake blocked senders.
pub(crate) type CancelWaker = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct WakerSet {
	next_id: u64,
	entries: Vec<(u64, CancelWaker)>,
}

#[derive(Default)]
struct CancelInner {
	cancelled: AtomicBool,
	wakers: Mutex<WakerSet>,
}

/// Cloneable producer-side cancellation token.
///
/// Cancellation is sticky: once [`CancelToken::cancel`] has been called the
/// token stays cancelled and every blocked send registered against it is
/// woken immediately. Tokens only affect producers; items already accepted
/// into a mailbox are still processed.
#[derive(Clone, Default)]
pub struct CancelToken {
	inner: Arc<CancelInner>,
}

impl CancelToken {
	/// Creates a token in the not-cancelled state.
	pub fn new() -> Self {
		Self::default()
	}

	/// Returns true once [`CancelToken::cancel`] has been called.
	pub fn is_cancelled(&self) -> bool {
		self.inner.cancelled.load(Ordering::Acquire)
	}

	/// Cancels the token and wakes all registered waiters. Idempotent.
	pub fn cancel(&self) {
		if self.inner.cancelled.swap(true, Ordering::AcqRel) {
			return;
		}
		let wakers: Vec<CancelWaker> = {
			let mut set = self.inner.wakers.lock();
			set.entries.drain(..).map(|(_, waker)| waker).collect()
		};
		for waker in wakers {
			waker();
		}
	}

	/// Registers a waker for the duration of the returned guard.
	///
	/// Callers must re-check [`CancelToken::is_cancelled`] under their own
	/// lock after registering; the waker alone does not carry the flag.
	pub(crate) fn register(&self, waker: CancelWaker) -> CancelGuard {
		let id = {
			let mut set = self.inner.wakers.lock();
			set.next_id = set.next_id.wrapping_add(1);
			let id = set.next_id;
			set.entries.push((id, waker));
			id
		};
		CancelGuard {
			inner: Arc::clone(&self.inner),
			id,
		}
	}
}

/// Deregisters the associated waker on drop.
pub(crate) struct CancelGuard {
	inner: Arc<CancelInner>,
	id: u64,
}

impl Drop for CancelGuard {
	fn drop(&mut self) {
		self.inner.wakers.lock().entries.retain(|(id, _)| *id != self.id);
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::AtomicUsize;

	use super::*;

	#[test]
	fn cancel_is_sticky_and_shared_across_clones() {
		let token = CancelToken::new();
		let clone = token.clone();
		assert!(!token.is_cancelled());

		clone.cancel();
		assert!(token.is_cancelled());
		assert!(clone.is_cancelled());

		// Second cancel is a no-op.
		token.cancel();
		assert!(token.is_cancelled());
	}

	#[test]
	fn cancel_runs_registered_wakers_once() {
		let token = CancelToken::new();
		let calls = Arc::new(AtomicUsize::new(0));
		let counter = Arc::clone(&calls);
		let _guard = token.register(Arc::new(move || {
			counter.fetch_add(1, Ordering::SeqCst);
		}));

		token.cancel();
		token.cancel();
		assert_eq!(calls.load(Ordering::SeqCst), 1);
	}

	#[test]
	fn dropped_guard_deregisters_waker() {
		let token = CancelToken::new();
		let calls = Arc::new(AtomicUsize::new(0));
		let counter = Arc::clone(&calls);
		let guard = token.register(Arc::new(move || {
			counter.fetch_add(1, Ordering::SeqCst);
		}));
		drop(guard);

		token.cancel();
		assert_eq!(calls.load(Ordering::SeqCst), 0);
	}
}
