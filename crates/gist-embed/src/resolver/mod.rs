//! Identifier resolution: the resolver contract and the callback-based
//! implementation.

pub mod callback;
pub mod registry;

use async_trait::async_trait;

use crate::types::{ResolutionResult, ResolveError};

pub use callback::{CallbackResolver, ScriptTransport};
pub use registry::{CallbackHandle, CallbackRegistry, PendingCallback};

/// Turns an identifier into displayable content.
///
/// Every call is an independent attempt; callers decide how many attempts
/// run per element.
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, identifier: &str) -> Result<ResolutionResult, ResolveError>;
}
