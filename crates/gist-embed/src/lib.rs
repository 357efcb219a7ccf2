//! gist-embed: resolve content identifiers declared on document elements
//! and inject the hosted content.
//!
//! An [`Activator`] scans a [`Document`] for elements carrying a data
//! attribute, resolves each identifier through a [`Resolver`] and marks the
//! element complete or failed. Activations run manually
//! ([`Activator::run_once`]), on the first change notification
//! ([`Activator::watch`]) or from a bounded poll ([`Activator::poll_for`]).

pub mod activator;
pub mod bootstrap;
pub mod config;
pub mod document;
pub mod resolver;
pub mod trigger;
pub mod types;

pub use activator::{
    Activation, Activator, SettleHook, StylesheetRegistry, TargetAttribute, CLAIM_ATTRIBUTE,
};
pub use bootstrap::{bootstrap_attribute, bootstrap_inline};
pub use config::{ActivatorConfig, BootstrapConfig, EmbedConfig, PollOptions, ResolverConfig};
pub use document::{Document, MemoryDocument, MutationRecord, MutationSubscription, Selector};
pub use resolver::{CallbackHandle, CallbackRegistry, CallbackResolver, Resolver, ScriptTransport};
pub use trigger::{Clock, ManualClock, TokioClock, TriggerHandle, TriggerState};
pub use types::*;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
