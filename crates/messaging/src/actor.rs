use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;

use crate::fault::{self, Fault, FaultSink};
use crate::mailbox::{Mailbox, MailboxReceiver, MailboxSender, SendError};
use crate::message::{Kind, Message};

/// Execution context handed to every message handler invocation.
pub struct ActorContext {
	outbox: Option<MailboxSender<Message>>,
}

impl ActorContext {
	/// Sends a message onward through the configured outbox.
	///
	/// Blocks under backpressure like any mailbox send. Fails with
	/// [`SendError::Closed`] when no outbox is configured or the outbox has
	/// been closed.
	pub fn forward(&self, msg: Message) -> Result<(), SendError> {
		match &self.outbox {
			Some(tx) => tx.send(msg),
			None => Err(SendError::Closed),
		}
	}

	/// Returns the outbox channel, if one was configured.
	pub fn outbox(&self) -> Option<&MailboxSender<Message>> {
		self.outbox.as_ref()
	}
}

type PayloadHandler = Box<dyn FnMut(Box<dyn Any + Send>, &ActorContext) -> Result<(), String> + Send>;

/// Type-indexed handler table, built once before the actor worker starts
/// and read-only afterwards.
#[derive(Default)]
pub struct Handlers {
	table: HashMap<Kind, PayloadHandler>,
}

impl Handlers {
	/// Creates an empty table.
	pub fn new() -> Self {
		Self::default()
	}

	/// Registers the handler for payload type `P`.
	///
	/// # Panics
	///
	/// Panics if a handler for `P` is already registered; one handler per
	/// kind is a hard table invariant.
	#[must_use]
	pub fn on<P>(mut self, mut handler: impl FnMut(P, &ActorContext) -> Result<(), String> + Send + 'static) -> Self
	where
		P: Any + Send,
	{
		let kind = Kind::of::<P>();
		let wrapped: PayloadHandler = Box::new(move |payload, ctx| match payload.downcast::<P>() {
			Ok(payload) => handler(*payload, ctx),
			Err(_) => Err(format!("payload does not match kind {kind}")),
		});
		let previous = self.table.insert(kind, wrapped);
		assert!(previous.is_none(), "duplicate handler for {kind}");
		self
	}

	/// Kinds this table covers.
	pub fn kinds(&self) -> Vec<Kind> {
		self.table.keys().copied().collect()
	}

	/// Number of registered handlers.
	pub fn len(&self) -> usize {
		self.table.len()
	}

	/// Returns true when no handlers are registered.
	pub fn is_empty(&self) -> bool {
		self.table.is_empty()
	}
}

/// Builder for [`Actor`].
pub struct ActorBuilder {
	name: String,
	capacity: Option<usize>,
	outbox: Option<MailboxSender<Message>>,
	sink: FaultSink,
}

impl ActorBuilder {
	/// Bounds the inbox; senders then block under backpressure.
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

	/// Configures the outbox handlers forward onward messages to.
	#[must_use]
	pub fn outbox(mut self, outbox: MailboxSender<Message>) -> Self {
		self.outbox = Some(outbox);
		self
	}

	/// Replaces the default tracing-backed fault sink.
	#[must_use]
	pub fn fault_sink(mut self, sink: impl Fn(&Fault) + Send + Sync + 'static) -> Self {
		self.sink = Arc::new(sink);
		self
	}

	/// Validates the handler table and starts the worker immediately.
	/// Actors are always running once constructed; there is no separate
	/// start step.
	pub fn spawn(self, handlers: Handlers) -> Actor {
		let subscriptions = handlers.kinds();
		let mailbox = match self.capacity {
			Some(capacity) => Mailbox::bounded(capacity),
			None => Mailbox::unbounded(),
		};
		let tx = mailbox.sender();
		let rx = mailbox.receiver();
		let ctx = ActorContext { outbox: self.outbox };
		let sink = Arc::clone(&self.sink);
		let name = self.name.clone();
		let worker = std::thread::Builder::new()
			.name(self.name.clone())
			.spawn(move || run_worker(handlers, rx, ctx, sink, name))
			.expect("failed to spawn actor worker thread");

		Actor {
			name: self.name,
			tx,
			subscriptions,
			worker: Mutex::new(Some(worker)),
			sink: self.sink,
		}
	}
}

/// A message-envelope agent: one dedicated worker drains the inbox and
/// dispatches each [`Message`] to the handler registered for its kind.
pub struct Actor {
	name: String,
	tx: MailboxSender<Message>,
	subscriptions: Vec<Kind>,
	worker: Mutex<Option<JoinHandle<()>>>,
	sink: FaultSink,
}

impl Actor {
	/// Returns a builder.
	pub fn builder(name: impl Into<String>) -> ActorBuilder {
		ActorBuilder {
			name: name.into(),
			capacity: None,
			outbox: None,
			sink: fault::log_sink(),
		}
	}

	/// Spawns an actor with defaults: unbounded inbox, no outbox, tracing
	/// fault sink.
	pub fn spawn(name: impl Into<String>, handlers: Handlers) -> Self {
		Self::builder(name).spawn(handlers)
	}

	/// Actor name.
	pub fn name(&self) -> &str {
		&self.name
	}

	/// The message kinds this actor handles, declared to routers at
	/// registration time.
	pub fn subscriptions(&self) -> &[Kind] {
		&self.subscriptions
	}

	/// The actor's inbox as a send-only channel, the only way external
	/// parties deliver messages to it.
	pub fn inbox(&self) -> MailboxSender<Message> {
		self.tx.clone()
	}

	/// Closes the inbox, drains queued messages, and joins the worker.
	/// Idempotent.
	pub fn close(&self) {
		self.tx.close();
		if let Some(worker) = self.worker.lock().take() {
			if let Err(payload) = worker.join() {
				(self.sink)(&Fault::Panicked {
					detail: fault::panic_message(payload),
				});
			}
		}
	}
}

impl Drop for Actor {
	fn drop(&mut self) {
		self.close();
	}
}

fn run_worker(mut handlers: Handlers, rx: MailboxReceiver<Message>, ctx: ActorContext, sink: FaultSink, name: String) {
	tracing::trace!(actor = %name, "messaging.actor.worker_enter");
	while let Some(msg) = rx.recv() {
		let kind = msg.kind();
		let Some(handler) = handlers.table.get_mut(&kind) else {
			sink(&Fault::Unhandled { kind });
			continue;
		};
		let payload = msg.into_payload();
		match panic::catch_unwind(AssertUnwindSafe(|| handler(payload, &ctx))) {
			Ok(Ok(())) => {}
			Ok(Err(detail)) => sink(&Fault::Handler { detail }),
			Err(payload) => sink(&Fault::Panicked {
				detail: fault::panic_message(payload),
			}),
		}
	}
	tracing::trace!(actor = %name, "messaging.actor.worker_exit");
}

#[cfg(test)]
mod tests {
	use super::*;

	#[derive(Debug, Clone, PartialEq, Eq)]
	struct Greet(String);

	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	struct Add(i64);

	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	struct Unknown;

	#[test]
	fn dispatches_messages_to_the_matching_handler() {
		let greets: Arc<Mutex<Vec<String>>> = Arc::default();
		let sums: Arc<Mutex<i64>> = Arc::default();

		let greet_log = Arc::clone(&greets);
		let sum_cell = Arc::clone(&sums);
		let actor = Actor::spawn(
			"dispatching",
			Handlers::new()
				.on(move |Greet(who): Greet, _ctx: &ActorContext| {
					greet_log.lock().push(who);
					Ok(())
				})
				.on(move |Add(n): Add, _ctx: &ActorContext| {
					*sum_cell.lock() += n;
					Ok(())
				}),
		);

		let inbox = actor.inbox();
		inbox.send(Message::new(Greet("alice".to_string()))).unwrap();
		inbox.send(Message::new(Add(2))).unwrap();
		inbox.send(Message::new(Add(3))).unwrap();
		inbox.send(Message::new(Greet("bob".to_string()))).unwrap();
		actor.close();

		assert_eq!(*greets.lock(), vec!["alice".to_string(), "bob".to_string()]);
		assert_eq!(*sums.lock(), 5);
	}

	#[test]
	fn unhandled_kind_is_reported_and_processing_continues() {
		let faults: Arc<Mutex<Vec<Fault>>> = Arc::default();
		let greets: Arc<Mutex<Vec<String>>> = Arc::default();

		let seen = Arc::clone(&faults);
		let greet_log = Arc::clone(&greets);
		let actor = Actor::builder("partial")
			.fault_sink(move |fault| seen.lock().push(fault.clone()))
			.spawn(Handlers::new().on(move |Greet(who): Greet, _ctx: &ActorContext| {
				greet_log.lock().push(who);
				Ok(())
			}));

		let inbox = actor.inbox();
		inbox.send(Message::new(Unknown)).unwrap();
		inbox.send(Message::new(Greet("carol".to_string()))).unwrap();
		actor.close();

		assert_eq!(*greets.lock(), vec!["carol".to_string()]);
		assert_eq!(
			*faults.lock(),
			vec![Fault::Unhandled {
				kind: Kind::of::<Unknown>()
			}]
		);
	}

	#[test]
	fn handler_errors_and_panics_are_isolated_per_message() {
		let faults: Arc<Mutex<Vec<Fault>>> = Arc::default();
		let sums: Arc<Mutex<i64>> = Arc::default();

		let seen = Arc::clone(&faults);
		let sum_cell = Arc::clone(&sums);
		let actor = Actor::builder("flaky")
			.fault_sink(move |fault| seen.lock().push(fault.clone()))
			.spawn(Handlers::new().on(move |Add(n): Add, _ctx: &ActorContext| {
				if n < 0 {
					return Err("negative".to_string());
				}
				assert!(n != 13, "unlucky");
				*sum_cell.lock() += n;
				Ok(())
			}));

		let inbox = actor.inbox();
		inbox.send(Message::new(Add(1))).unwrap();
		inbox.send(Message::new(Add(-1))).unwrap();
		inbox.send(Message::new(Add(13))).unwrap();
		inbox.send(Message::new(Add(2))).unwrap();
		actor.close();

		assert_eq!(*sums.lock(), 3);
		let faults = faults.lock();
		assert_eq!(faults.len(), 2);
		assert!(matches!(faults[0], Fault::Handler { .. }));
		assert!(matches!(faults[1], Fault::Panicked { .. }));
	}

	#[test]
	fn subscriptions_cover_the_handler_table() {
		let actor = Actor::spawn(
			"subscribed",
			Handlers::new()
				.on(|_: Greet, _ctx: &ActorContext| Ok(()))
				.on(|_: Add, _ctx: &ActorContext| Ok(())),
		);

		let subs = actor.subscriptions();
		assert_eq!(subs.len(), 2);
		assert!(subs.contains(&Kind::of::<Greet>()));
		assert!(subs.contains(&Kind::of::<Add>()));
		actor.close();
	}

	#[test]
	fn handlers_forward_through_the_outbox() {
		let downstream = Mailbox::unbounded();
		let downstream_rx = downstream.receiver();

		let actor = Actor::builder("forwarding")
			.outbox(downstream.sender())
			.spawn(Handlers::new().on(|Add(n): Add, ctx: &ActorContext| {
				ctx.forward(Message::new(Add(n * 2))).map_err(|err| err.to_string())
			}));

		actor.inbox().send(Message::new(Add(21))).unwrap();
		actor.close();
		downstream.sender().close();

		let forwarded = downstream_rx.recv().expect("one forwarded message");
		assert_eq!(forwarded.downcast::<Add>().unwrap(), Add(42));
		assert!(downstream_rx.recv().is_none());
	}

	#[test]
	fn forward_without_an_outbox_is_a_handler_error() {
		let faults: Arc<Mutex<Vec<Fault>>> = Arc::default();
		let seen = Arc::clone(&faults);
		let actor = Actor::builder("outboxless")
			.fault_sink(move |fault| seen.lock().push(fault.clone()))
			.spawn(Handlers::new().on(|_: Unknown, ctx: &ActorContext| {
				ctx.forward(Message::new(Add(1))).map_err(|err| err.to_string())
			}));

		actor.inbox().send(Message::new(Unknown)).unwrap();
		actor.close();

		assert!(matches!(faults.lock().as_slice(), [Fault::Handler { .. }]));
	}

	#[test]
	#[should_panic(expected = "duplicate handler")]
	fn duplicate_handler_registration_panics() {
		let _ = Handlers::new()
			.on(|_: Unknown, _ctx: &ActorContext| Ok(()))
			.on(|_: Unknown, _ctx: &ActorContext| Ok(()));
	}
}
