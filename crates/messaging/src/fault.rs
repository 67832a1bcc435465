use std::any::Any;
use std::sync::Arc;

use crate::message::Kind;

/// Fault raised while processing one mailbox item.
///
/// Every variant except [`Fault::DuplicateSubscription`] is isolated to the
/// offending item: the worker reports it to the fault sink and keeps
/// processing. Duplicate subscriptions are a configuration error and stop
/// the router that observes them.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Fault {
	/// A fold or message handler returned an error for one item.
	#[error("handler failed: {detail}")]
	Handler { detail: String },
	/// A fold or message handler panicked for one item.
	#[error("handler panicked: {detail}")]
	Panicked { detail: String },
	/// No handler or forwarding rule registered for an incoming kind.
	#[error("no handler registered for {kind}")]
	Unhandled { kind: Kind },
	/// Two actors declared the same subscription kind.
	#[error("duplicate subscription for {kind} by actor '{actor}'")]
	DuplicateSubscription { kind: Kind, actor: String },
}

/// Injectable sink receiving every fault a worker recovers from.
pub type FaultSink = Arc<dyn Fn(&Fault) + Send + Sync>;

/// Default sink: structured error log.
pub(crate) fn log_sink() -> FaultSink {
	Arc::new(|fault: &Fault| tracing::error!(fault = %fault, "messaging.fault"))
}

/// Best-effort extraction of a panic payload message.
pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
	if let Some(msg) = payload.downcast_ref::<&'static str>() {
		return (*msg).to_string();
	}
	if let Some(msg) = payload.downcast_ref::<String>() {
		return msg.clone();
	}
	"opaque panic payload".to_string()
}
