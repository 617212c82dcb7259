use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::Attributes;

/// Registry-assigned provider identity. Never reused within a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProviderId(pub(crate) u64);

impl ProviderId {
	pub fn as_u64(self) -> u64 {
		self.0
	}
}

impl fmt::Display for ProviderId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "#{}", self.0)
	}
}

/// Handle to a registered provider.
///
/// Equality and hashing use the id only. The attribute view is live: after an
/// update every clone of the handle observes the new attributes, which is what
/// change signatures are computed from.
#[derive(Clone)]
pub struct ProviderRef {
	id: ProviderId,
	attributes: Arc<RwLock<Attributes>>,
}

impl ProviderRef {
	pub(crate) fn new(id: ProviderId, attributes: Attributes) -> Self {
		Self {
			id,
			attributes: Arc::new(RwLock::new(attributes)),
		}
	}

	pub fn id(&self) -> ProviderId {
		self.id
	}

	/// Snapshot of the current attributes.
	pub fn attributes(&self) -> Attributes {
		self.attributes.read().clone()
	}

	pub fn get(&self, key: &str) -> Option<String> {
		self.attributes.read().get(key).map(str::to_owned)
	}

	pub(crate) fn with_attributes<R>(&self, f: impl FnOnce(&Attributes) -> R) -> R {
		f(&self.attributes.read())
	}

	pub(crate) fn replace_attributes(&self, attributes: Attributes) {
		*self.attributes.write() = attributes;
	}
}

impl PartialEq for ProviderRef {
	fn eq(&self, other: &Self) -> bool {
		self.id == other.id
	}
}

impl Eq for ProviderRef {}

impl Hash for ProviderRef {
	fn hash<H: Hasher>(&self, state: &mut H) {
		self.id.hash(state);
	}
}

impl fmt::Debug for ProviderRef {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "ProviderRef({})", self.id)
	}
}
