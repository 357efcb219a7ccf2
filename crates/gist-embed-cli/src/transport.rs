//! HTTP script transport.
//!
//! Fetches the callback script with reqwest and delivers the argument of the
//! `name({...});` invocation through the callback handle.

use std::time::Duration;

use anyhow::{Context, Result};
use gist_embed::{CallbackHandle, ResolutionRequest, ScriptTransport};
use serde_json::Value;

/// Loads callback scripts over HTTP.
#[derive(Clone)]
pub struct HttpScriptTransport {
    client: reqwest::Client,
}

impl HttpScriptTransport {
    /// Build a client that drops stalled connections after `timeout_ms`.
    pub fn new(timeout_ms: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .redirect(reqwest::redirect::Policy::limited(5))
            .user_agent(concat!("gist-embed/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { client })
    }

    async fn fetch_script(&self, url: &str) -> Result<String> {
        let response = self
            .client
            .get(url)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.text().await?)
    }
}

impl ScriptTransport for HttpScriptTransport {
    fn dispatch(&self, request: &ResolutionRequest, handle: CallbackHandle) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::error!("No async runtime to load {}", request.url);
            handle.failed();
            return;
        };

        let transport = self.clone();
        let url = request.url.to_string();
        runtime.spawn(async move {
            match transport.fetch_script(&url).await {
                Ok(body) => {
                    match extract_callback_payload(&body, handle.callback_name()) {
                        Some(payload) => {
                            handle.invoke(payload);
                        }
                        None => tracing::warn!("Response from {url} did not invoke the callback"),
                    }
                    handle.loaded();
                }
                Err(e) => {
                    tracing::warn!("Failed to load {url}: {e}");
                    handle.failed();
                }
            }
        });
    }
}

/// Extract the JSON argument of `callback_name(...)` from a script body.
///
/// Tolerates surrounding whitespace, a leading `/**/` guard and a missing
/// trailing semicolon.
pub fn extract_callback_payload(body: &str, callback_name: &str) -> Option<Value> {
    let body = body.trim();
    let body = body.strip_prefix("/**/").unwrap_or(body).trim_start();
    let rest = body.strip_prefix(callback_name)?.trim_start();
    let rest = rest.strip_prefix('(')?;
    let rest = rest.trim_end();
    let rest = rest.strip_suffix(';').unwrap_or(rest).trim_end();
    let argument = rest.strip_suffix(')')?;
    serde_json::from_str(argument).ok()
}
