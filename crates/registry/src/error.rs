use crate::provider::ProviderId;
use crate::registry::WatchId;
use crate::selector::SelectorError;

/// Registry and configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("invalid selector: {0}")]
	Selector(#[from] SelectorError),

	/// A configured capability carries a filter that does not parse.
	#[error("capability '{name}' has an invalid filter: {source}")]
	InvalidCapability {
		name: String,
		#[source]
		source: SelectorError,
	},

	#[error("config parse error: {0}")]
	Config(#[from] toml::de::Error),

	#[error("capability '{0}' is already configured")]
	DuplicateCapability(String),

	#[error("unknown provider {0}")]
	UnknownProvider(ProviderId),

	#[error("unknown watch {0}")]
	UnknownWatch(WatchId),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
