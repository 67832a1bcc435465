//! Single-consumer mailbox messaging primitives.
//!
//! Everything here is built from one pattern: a FIFO [`Mailbox`] drained by
//! exactly one dedicated worker thread, so the state behind the worker is
//! only ever touched from that thread.
//!
//! * [`Agent`] folds each dequeued item into a private state value.
//! * [`Actor`] dispatches [`Message`] envelopes to per-kind handlers.
//! * [`Router`] forwards envelopes to registered actors' inboxes by kind,
//!   with registration itself serialized through its mailbox.
//!
//! Faults recovered inside a worker loop are reported as values to an
//! injectable [`FaultSink`]; one bad message never halts a worker. The one
//! deliberate exception is a duplicate router subscription, which is a
//! configuration error and fatal to the router that observes it.

pub mod actor;
pub mod agent;
pub mod cancel;
pub mod fault;
pub mod mailbox;
pub mod message;
pub mod router;

pub use actor::{Actor, ActorBuilder, ActorContext, Handlers};
pub use agent::{Agent, AgentBuilder, AgentSendError, FoldFn};
pub use cancel::CancelToken;
pub use fault::{Fault, FaultSink};
pub use mailbox::{Mailbox, MailboxReceiver, MailboxSender, SendError};
pub use message::{Kind, Message};
pub use router::{Router, RouterBuilder};
