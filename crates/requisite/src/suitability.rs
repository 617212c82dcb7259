use std::fmt;
use std::marker::PhantomData;

/// Boxed error for closure-based strategies.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Decides which providers satisfy which consumers.
///
/// Supplied once per tracker. Called concurrently for different pairs but never
/// concurrently for the same pair.
pub trait Suitability<C, P>: Send + Sync {
	/// Snapshot of the provider attributes this capability cares about.
	///
	/// Two signatures that compare equal mean a modification was irrelevant and
	/// must not cause rebinding.
	type Signature: PartialEq + fmt::Debug + Send + Sync;

	type Error: fmt::Display;

	fn signature(&self, provider: &P) -> Self::Signature;

	/// Returns whether `provider` can serve `consumer`.
	///
	/// An `Err` is treated exactly like `Ok(false)`: the pair is logged and
	/// remembered as wrong.
	fn is_suitable(&self, consumer: &C, provider: &P) -> Result<bool, Self::Error>;
}

/// Every provider suits every consumer and no modification is ever relevant.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl<C, P> Suitability<C, P> for AcceptAll {
	type Signature = ();
	type Error = std::convert::Infallible;

	fn signature(&self, _provider: &P) -> Self::Signature {}

	fn is_suitable(&self, _consumer: &C, _provider: &P) -> Result<bool, Self::Error> {
		Ok(true)
	}
}

/// Strategy assembled from two closures.
pub struct FnSuitability<C, P, Sig, SigFn, CheckFn> {
	signature: SigFn,
	check: CheckFn,
	_marker: PhantomData<fn(&C, &P) -> Sig>,
}

impl<C, P, Sig, SigFn, CheckFn> FnSuitability<C, P, Sig, SigFn, CheckFn>
where
	SigFn: Fn(&P) -> Sig + Send + Sync,
	CheckFn: Fn(&C, &P) -> Result<bool, BoxError> + Send + Sync,
{
	pub fn new(signature: SigFn, check: CheckFn) -> Self {
		Self {
			signature,
			check,
			_marker: PhantomData,
		}
	}
}

impl<C, P, Sig, SigFn, CheckFn> Suitability<C, P> for FnSuitability<C, P, Sig, SigFn, CheckFn>
where
	Sig: PartialEq + fmt::Debug + Send + Sync,
	SigFn: Fn(&P) -> Sig + Send + Sync,
	CheckFn: Fn(&C, &P) -> Result<bool, BoxError> + Send + Sync,
{
	type Signature = Sig;
	type Error = BoxError;

	fn signature(&self, provider: &P) -> Sig {
		(self.signature)(provider)
	}

	fn is_suitable(&self, consumer: &C, provider: &P) -> Result<bool, BoxError> {
		(self.check)(consumer, provider)
	}
}

impl<C, P, Sig, SigFn, CheckFn> fmt::Debug for FnSuitability<C, P, Sig, SigFn, CheckFn> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("FnSuitability").finish_non_exhaustive()
	}
}
