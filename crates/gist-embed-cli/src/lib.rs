//! gist-embed command-line support: the HTTP callback transport and page
//! rendering.

pub mod render;
pub mod transport;

pub use render::{render_html, Mode, RenderOptions, RenderReport};
pub use transport::{extract_callback_payload, HttpScriptTransport};

use gist_embed::{CallbackResolver, ResolverConfig};

/// Extra time the HTTP client waits past the resolver timeout. The resolver
/// must be the one that gives up so the failure is reported as a timeout.
const TRANSPORT_GRACE_MS: u64 = 1_000;

/// Resolver backed by the HTTP transport.
pub fn http_resolver(
    config: &ResolverConfig,
) -> anyhow::Result<CallbackResolver<HttpScriptTransport>> {
    let transport = HttpScriptTransport::new(config.timeout_ms.saturating_add(TRANSPORT_GRACE_MS))?;
    Ok(CallbackResolver::new(transport, config)?)
}
