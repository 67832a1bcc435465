use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;

use crate::actor::Actor;
use crate::fault::{self, Fault, FaultSink};
use crate::mailbox::{Mailbox, MailboxReceiver, MailboxSender, SendError};
use crate::message::{Kind, Message};

/// Control payload installing forwarding rules for one actor.
///
/// Registration travels through the router's ordinary mailbox so that table
/// mutation is serialized with forwarding on the one worker thread; the
/// dispatch table itself needs no synchronization.
struct RegisterActor {
	name: String,
	kinds: Vec<Kind>,
	inbox: MailboxSender<Message>,
}

struct Rule {
	actor: String,
	tx: MailboxSender<Message>,
}

/// Builder for [`Router`].
pub struct RouterBuilder {
	name: String,
	capacity: Option<usize>,
	sink: FaultSink,
}

impl RouterBuilder {
	/// Bounds the router inbox; senders then block under backpressure.
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

	/// Replaces the default tracing-backed fault sink.
	#[must_use]
	pub fn fault_sink(mut self, sink: impl Fn(&Fault) + Send + Sync + 'static) -> Self {
		self.sink = Arc::new(sink);
		self
	}

	/// Starts the router worker immediately.
	pub fn spawn(self) -> Router {
		let mailbox = match self.capacity {
			Some(capacity) => Mailbox::bounded(capacity),
			None => Mailbox::unbounded(),
		};
		let tx = mailbox.sender();
		let rx = mailbox.receiver();
		let close_tx = tx.clone();
		let sink = Arc::clone(&self.sink);
		let name = self.name.clone();
		let worker = std::thread::Builder::new()
			.name(self.name.clone())
			.spawn(move || run_worker(rx, close_tx, sink, name))
			.expect("failed to spawn router worker thread");

		Router {
			name: self.name,
			tx,
			worker: Mutex::new(Some(worker)),
			sink: self.sink,
		}
	}
}

/// Forwards messages to registered actors' inboxes by message kind.
///
/// One forwarding rule per kind: a second actor claiming an already-routed
/// kind is a configuration error, reported as
/// [`Fault::DuplicateSubscription`] and fatal to the router.
pub struct Router {
	name: String,
	tx: MailboxSender<Message>,
	worker: Mutex<Option<JoinHandle<()>>>,
	sink: FaultSink,
}

impl Router {
	/// Returns a builder.
	pub fn builder(name: impl Into<String>) -> RouterBuilder {
		RouterBuilder {
			name: name.into(),
			capacity: None,
			sink: fault::log_sink(),
		}
	}

	/// Spawns a router with defaults: unbounded inbox, tracing fault sink.
	pub fn spawn(name: impl Into<String>) -> Self {
		Self::builder(name).spawn()
	}

	/// Router name.
	pub fn name(&self) -> &str {
		&self.name
	}

	/// Registers an actor: one forwarding rule per declared subscription.
	///
	/// Registration is enqueued as a control message and processed by the
	/// router worker, so it races with nothing; the call itself blocks only
	/// under the same backpressure rule as any send.
	pub fn register(&self, actor: &Actor) -> Result<(), SendError> {
		self.tx.send(Message::new(RegisterActor {
			name: actor.name().to_string(),
			kinds: actor.subscriptions().to_vec(),
			inbox: actor.inbox(),
		}))
	}

	/// The router's inbox as a send-only channel for ordinary messages.
	pub fn inbox(&self) -> MailboxSender<Message> {
		self.tx.clone()
	}

	/// Closes the inbox, lets the worker drain queued messages, and joins
	/// it. Idempotent.
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

impl Drop for Router {
	fn drop(&mut self) {
		self.close();
	}
}

fn run_worker(rx: MailboxReceiver<Message>, close_tx: MailboxSender<Message>, sink: FaultSink, name: String) {
	let mut rules: HashMap<Kind, Rule> = HashMap::new();
	let register_kind = Kind::of::<RegisterActor>();
	tracing::trace!(router = %name, "messaging.router.worker_enter");

	while let Some(msg) = rx.recv() {
		let kind = msg.kind();
		if kind == register_kind {
			match msg.downcast::<RegisterActor>() {
				Ok(registration) => {
					if !install(&mut rules, registration, &sink, &name) {
						// Fatal configuration error: stop accepting input and
						// exit without draining what remains.
						close_tx.close();
						break;
					}
				}
				// Unreachable: kind equality implies payload type equality.
				Err(_) => continue,
			}
			continue;
		}

		match rules.get(&kind) {
			Some(rule) => {
				if let Err(err) = rule.tx.send(msg) {
					sink(&Fault::Handler {
						detail: format!("forward to actor '{}' failed: {err}", rule.actor),
					});
				}
			}
			None => sink(&Fault::Unhandled { kind }),
		}
	}
	tracing::trace!(router = %name, "messaging.router.worker_exit");
}

/// Installs one forwarding rule per declared kind. Returns false on a
/// duplicate subscription, which the caller treats as fatal.
fn install(rules: &mut HashMap<Kind, Rule>, registration: RegisterActor, sink: &FaultSink, router: &str) -> bool {
	for kind in &registration.kinds {
		if rules.contains_key(kind) {
			sink(&Fault::DuplicateSubscription {
				kind: *kind,
				actor: registration.name.clone(),
			});
			return false;
		}
		rules.insert(
			*kind,
			Rule {
				actor: registration.name.clone(),
				tx: registration.inbox.clone(),
			},
		);
	}
	tracing::debug!(
		router = %router,
		actor = %registration.name,
		kinds = registration.kinds.len(),
		"messaging.router.registered"
	);
	true
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::actor::{ActorContext, Handlers};

	#[derive(Debug, Clone, PartialEq, Eq)]
	struct Ping(u32);

	#[derive(Debug, Clone, PartialEq, Eq)]
	struct Pong(u32);

	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	struct Stray;

	fn collecting_actor<P: std::any::Any + Send>(name: &str) -> (Actor, Arc<Mutex<Vec<P>>>) {
		let log: Arc<Mutex<Vec<P>>> = Arc::default();
		let sink = Arc::clone(&log);
		let actor = Actor::spawn(
			name,
			Handlers::new().on(move |payload: P, _ctx: &ActorContext| {
				sink.lock().push(payload);
				Ok(())
			}),
		);
		(actor, log)
	}

	#[test]
	fn forwards_each_kind_only_to_its_registered_actor() {
		let (ping_actor, pings) = collecting_actor::<Ping>("ping");
		let (pong_actor, pongs) = collecting_actor::<Pong>("pong");

		let router = Router::spawn("router");
		router.register(&ping_actor).unwrap();
		router.register(&pong_actor).unwrap();

		let inbox = router.inbox();
		inbox.send(Message::new(Ping(1))).unwrap();
		inbox.send(Message::new(Pong(2))).unwrap();
		inbox.send(Message::new(Ping(3))).unwrap();

		// Close order matters: the router drains first, then the actors.
		router.close();
		ping_actor.close();
		pong_actor.close();

		assert_eq!(*pings.lock(), vec![Ping(1), Ping(3)]);
		assert_eq!(*pongs.lock(), vec![Pong(2)]);
	}

	#[test]
	fn unregistered_kind_is_reported_without_stopping_the_router() {
		let faults: Arc<Mutex<Vec<Fault>>> = Arc::default();
		let seen = Arc::clone(&faults);
		let (ping_actor, pings) = collecting_actor::<Ping>("ping");

		let router = Router::builder("router")
			.fault_sink(move |fault| seen.lock().push(fault.clone()))
			.spawn();
		router.register(&ping_actor).unwrap();

		let inbox = router.inbox();
		inbox.send(Message::new(Stray)).unwrap();
		inbox.send(Message::new(Ping(7))).unwrap();

		router.close();
		ping_actor.close();

		assert_eq!(*pings.lock(), vec![Ping(7)]);
		assert_eq!(
			*faults.lock(),
			vec![Fault::Unhandled {
				kind: Kind::of::<Stray>()
			}]
		);
	}

	#[test]
	fn duplicate_registration_is_fatal() {
		let faults: Arc<Mutex<Vec<Fault>>> = Arc::default();
		let seen = Arc::clone(&faults);
		let (first, _) = collecting_actor::<Ping>("first");
		let (second, _) = collecting_actor::<Ping>("second");

		let router = Router::builder("router")
			.fault_sink(move |fault| seen.lock().push(fault.clone()))
			.spawn();
		router.register(&first).unwrap();
		router.register(&second).unwrap();

		// The worker exits on the duplicate; close() just joins it.
		router.close();
		first.close();
		second.close();

		assert_eq!(
			*faults.lock(),
			vec![Fault::DuplicateSubscription {
				kind: Kind::of::<Ping>(),
				actor: "second".to_string()
			}]
		);
		assert!(router.inbox().is_closed());
	}

	#[test]
	fn forward_to_a_closed_inbox_is_reported_per_message() {
		let faults: Arc<Mutex<Vec<Fault>>> = Arc::default();
		let seen = Arc::clone(&faults);
		let (ping_actor, _pings) = collecting_actor::<Ping>("ping");

		let router = Router::builder("router")
			.fault_sink(move |fault| seen.lock().push(fault.clone()))
			.spawn();
		router.register(&ping_actor).unwrap();
		ping_actor.close();

		router.inbox().send(Message::new(Ping(1))).unwrap();
		router.close();

		assert!(matches!(faults.lock().as_slice(), [Fault::Handler { .. }]));
	}

	#[test]
	fn registration_through_the_mailbox_preserves_send_order() {
		// A message sent after register() must find the rule installed,
		// because both travel the same FIFO mailbox.
		let (ping_actor, pings) = collecting_actor::<Ping>("ping");
		let router = Router::spawn("router");

		router.register(&ping_actor).unwrap();
		router.inbox().send(Message::new(Ping(9))).unwrap();

		router.close();
		ping_actor.close();

		assert_eq!(*pings.lock(), vec![Ping(9)]);
	}
}
