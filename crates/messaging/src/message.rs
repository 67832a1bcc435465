use std::any::{Any, TypeId};
use std::fmt;
use std::hash::{Hash, Hasher};

/// Runtime type tag identifying a message payload type.
///
/// Equality and hashing use the [`TypeId`] only; the type name is carried
/// purely for diagnostics and fault messages.
#[derive(Debug, Clone, Copy)]
pub struct Kind {
	id: TypeId,
	name: &'static str,
}

impl Kind {
	/// Returns the tag for payload type `P`.
	pub fn of<P: Any>() -> Self {
		Self {
			id: TypeId::of::<P>(),
			name: std::any::type_name::<P>(),
		}
	}

	/// Human-readable type name for diagnostics.
	pub fn name(&self) -> &'static str {
		self.name
	}
}

impl PartialEq for Kind {
	fn eq(&self, other: &Self) -> bool {
		self.id == other.id
	}
}

impl Eq for Kind {}

impl Hash for Kind {
	fn hash<H: Hasher>(&self, state: &mut H) {
		self.id.hash(state);
	}
}

impl fmt::Display for Kind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.name)
	}
}

/// Immutable envelope pairing a runtime type tag with its payload.
///
/// The tag always matches the payload's concrete type: [`Message::new`] is
/// the only constructor, so a mismatched envelope is unrepresentable.
pub struct Message {
	kind: Kind,
	payload: Box<dyn Any + Send>,
}

impl Message {
	/// Wraps a payload into an envelope tagged with its concrete type.
	pub fn new<P: Any + Send>(payload: P) -> Self {
		Self {
			kind: Kind::of::<P>(),
			payload: Box::new(payload),
		}
	}

	/// Returns the payload's type tag.
	pub fn kind(&self) -> Kind {
		self.kind
	}

	/// Returns true when the payload is a `P`.
	pub fn is<P: Any>(&self) -> bool {
		self.kind == Kind::of::<P>()
	}

	/// Recovers the payload, or returns the envelope unchanged on a type
	/// mismatch.
	pub fn downcast<P: Any + Send>(self) -> Result<P, Message> {
		match self.payload.downcast::<P>() {
			Ok(payload) => Ok(*payload),
			Err(payload) => Err(Self {
				kind: self.kind,
				payload,
			}),
		}
	}

	pub(crate) fn into_payload(self) -> Box<dyn Any + Send> {
		self.payload
	}
}

impl fmt::Debug for Message {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Message").field("kind", &self.kind.name).finish_non_exhaustive()
	}
}
