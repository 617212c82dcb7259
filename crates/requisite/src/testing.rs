//! Recording listeners shared by the unit tests.

use indexmap::IndexMap;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::{Identity, MultiRequirementListener, RequirementListener};

pub(crate) fn init_tracing() {
	let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Event<C, P> {
	Available(C, P),
	Removed(C, P),
}

/// Records every tracker callback in arrival order.
#[derive(Debug)]
pub(crate) struct Recorder<C, P> {
	events: Mutex<Vec<Event<C, P>>>,
}

impl<C: Identity, P: Identity> Recorder<C, P> {
	pub(crate) fn new() -> Self {
		Self { events: Mutex::new(Vec::new()) }
	}

	pub(crate) fn events(&self) -> Vec<Event<C, P>> {
		self.events.lock().clone()
	}

	pub(crate) fn take(&self) -> Vec<Event<C, P>> {
		std::mem::take(&mut *self.events.lock())
	}
}

impl<C: Identity, P: Identity> RequirementListener<C, P> for Recorder<C, P> {
	fn available(&self, consumer: &C, provider: &P) {
		self.events.lock().push(Event::Available(consumer.clone(), provider.clone()));
	}

	fn removed(&self, consumer: &C, provider: &P) {
		self.events.lock().push(Event::Removed(consumer.clone(), provider.clone()));
	}
}

/// Checks that callbacks for each consumer alternate, start with `available`, and
/// that every `removed` names the provider of the preceding `available`.
pub(crate) fn check_alternation<C: Identity, P: Identity>(events: &[Event<C, P>]) -> Result<(), String> {
	let mut bound: FxHashMap<C, P> = FxHashMap::default();
	for (index, event) in events.iter().enumerate() {
		match event {
			Event::Available(consumer, provider) => {
				if let Some(previous) = bound.insert(consumer.clone(), provider.clone()) {
					return Err(format!("event {index}: {consumer:?} got {provider:?} while still bound to {previous:?}"));
				}
			}
			Event::Removed(consumer, provider) => match bound.remove(consumer) {
				Some(previous) if previous == *provider => {}
				Some(previous) => {
					return Err(format!("event {index}: {consumer:?} lost {provider:?} but was bound to {previous:?}"));
				}
				None => return Err(format!("event {index}: {consumer:?} lost {provider:?} while unbound")),
			},
		}
	}
	Ok(())
}

/// Checks that each consumer's transitions alternate, starting with a start.
pub(crate) fn check_transition_alternation<C: Identity, P: Identity>(
	transitions: &[Transition<C, P>],
) -> Result<(), String> {
	let mut started: FxHashMap<C, bool> = FxHashMap::default();
	for (index, transition) in transitions.iter().enumerate() {
		let (consumer, starting) = match transition {
			Transition::Start(consumer, _) => (consumer, true),
			Transition::Stop(consumer) => (consumer, false),
		};
		let running = started.entry(consumer.clone()).or_default();
		if *running == starting {
			return Err(format!("transition {index}: {transition:?} repeats the previous one for {consumer:?}"));
		}
		*running = starting;
	}
	Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Transition<C, P> {
	Start(C, IndexMap<String, P>),
	Stop(C),
}

/// Records aggregator start/stop transitions.
#[derive(Debug)]
pub(crate) struct TransitionRecorder<C, P> {
	transitions: Mutex<Vec<Transition<C, P>>>,
}

impl<C: Identity, P: Identity> TransitionRecorder<C, P> {
	pub(crate) fn new() -> Self {
		Self {
			transitions: Mutex::new(Vec::new()),
		}
	}

	pub(crate) fn transitions(&self) -> Vec<Transition<C, P>> {
		self.transitions.lock().clone()
	}

	pub(crate) fn starts(&self) -> usize {
		self.transitions.lock().iter().filter(|t| matches!(t, Transition::Start(..))).count()
	}

	pub(crate) fn stops(&self) -> usize {
		self.transitions.lock().iter().filter(|t| matches!(t, Transition::Stop(..))).count()
	}
}

impl<C: Identity, P: Identity> MultiRequirementListener<C, P> for TransitionRecorder<C, P> {
	fn start(&self, consumer: &C, providers: &IndexMap<String, P>) {
		self.transitions.lock().push(Transition::Start(consumer.clone(), providers.clone()));
	}

	fn stop(&self, consumer: &C) {
		self.transitions.lock().push(Transition::Stop(consumer.clone()));
	}
}
