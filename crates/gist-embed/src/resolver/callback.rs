//! Resolver for hosts that only deliver content through a named callback
//! invoked by a loaded script.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use url::Url;

use super::registry::{CallbackHandle, CallbackRegistry, Delivery};
use super::Resolver;
use crate::config::{saturating_millis, ResolverConfig};
use crate::types::{EmbedError, EmbedResult, ResolutionRequest, ResolutionResult, ResolveError};

/// Loads the script for a request.
///
/// `dispatch` must not block: it starts the load and reports back through the
/// handle (`invoke` when the response calls the callback, then `loaded` or
/// `failed`).
pub trait ScriptTransport: Send + Sync {
    fn dispatch(&self, request: &ResolutionRequest, handle: CallbackHandle);
}

impl<T: ScriptTransport + ?Sized> ScriptTransport for Arc<T> {
    fn dispatch(&self, request: &ResolutionRequest, handle: CallbackHandle) {
        (**self).dispatch(request, handle)
    }
}

pub struct CallbackResolver<T> {
    transport: T,
    registry: Arc<CallbackRegistry>,
    endpoint: Url,
    timeout: Duration,
}

impl<T: ScriptTransport> CallbackResolver<T> {
    pub fn new(transport: T, config: &ResolverConfig) -> EmbedResult<Self> {
        let endpoint = Url::parse(&config.endpoint)
            .map_err(|e| EmbedError::Config(format!("invalid endpoint {}: {e}", config.endpoint)))?;
        if endpoint.cannot_be_a_base() {
            return Err(EmbedError::Config(format!(
                "endpoint {} cannot carry a path",
                config.endpoint
            )));
        }

        Ok(Self {
            transport,
            registry: Arc::new(CallbackRegistry::new(config.callback_prefix.clone())),
            endpoint,
            timeout: config.timeout(),
        })
    }

    pub fn registry(&self) -> &CallbackRegistry {
        &self.registry
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// `<endpoint>/<identifier>.json?callback=<name>`
    pub fn request_url(&self, identifier: &str, callback_name: &str) -> Url {
        let mut url = self.endpoint.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push(&format!("{identifier}.json"));
        }
        url.query_pairs_mut().append_pair("callback", callback_name);
        url
    }
}

#[async_trait]
impl<T: ScriptTransport> Resolver for CallbackResolver<T> {
    async fn resolve(&self, identifier: &str) -> Result<ResolutionResult, ResolveError> {
        let mut pending = self.registry.register(identifier);
        let request = ResolutionRequest {
            identifier: identifier.to_string(),
            token: pending.token(),
            callback_name: pending.callback_name().to_string(),
            url: self.request_url(identifier, pending.callback_name()),
        };

        tracing::debug!("Dispatching {} via {}", request.identifier, request.url);
        self.transport.dispatch(&request, pending.handle());

        let delivery = match tokio::time::timeout(self.timeout, pending.settled()).await {
            Ok(delivery) => delivery,
            Err(_) => {
                tracing::warn!(
                    "Request for {identifier} timed out after {}ms",
                    self.timeout.as_millis()
                );
                return Err(ResolveError::Timeout {
                    identifier: identifier.to_string(),
                    timeout_ms: saturating_millis(self.timeout),
                });
            }
        };

        match delivery {
            Some(Delivery::Loaded(Some(payload))) => {
                serde_json::from_value(payload).map_err(|e| ResolveError::MalformedPayload {
                    identifier: identifier.to_string(),
                    reason: e.to_string(),
                })
            }
            Some(Delivery::Loaded(None)) => Err(ResolveError::MalformedPayload {
                identifier: identifier.to_string(),
                reason: "script loaded without invoking the callback".to_string(),
            }),
            Some(Delivery::Failed) | None => Err(ResolveError::Fetch {
                identifier: identifier.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use serde_json::json;

    /// Scripted transport: records requests and replays one behaviour.
    #[derive(Clone, Copy)]
    enum Script {
        Respond,
        RespondLate(u64),
        Fail,
        LoadEmpty,
        Silent,
    }

    struct FakeTransport {
        script: Script,
        requests: Mutex<Vec<ResolutionRequest>>,
    }

    impl FakeTransport {
        fn new(script: Script) -> Arc<Self> {
            Arc::new(Self {
                script,
                requests: Mutex::new(Vec::new()),
            })
        }
    }

    impl ScriptTransport for FakeTransport {
        fn dispatch(&self, request: &ResolutionRequest, handle: CallbackHandle) {
            self.requests.lock().unwrap().push(request.clone());
            let id = request.identifier.clone();
            let script = self.script;
            tokio::spawn(async move {
                match script {
                    Script::Respond => {
                        handle.invoke(json!({ "div": format!("<p>{id}</p>"), "stylesheet": "/a.css" }));
                        handle.loaded();
                    }
                    Script::RespondLate(ms) => {
                        tokio::time::sleep(Duration::from_millis(ms)).await;
                        handle.invoke(json!({ "div": "late" }));
                        handle.loaded();
                    }
                    Script::Fail => {
                        handle.failed();
                    }
                    Script::LoadEmpty => {
                        handle.loaded();
                    }
                    Script::Silent => {}
                }
            });
        }
    }

    fn resolver(script: Script) -> (CallbackResolver<Arc<FakeTransport>>, Arc<FakeTransport>) {
        let transport = FakeTransport::new(script);
        let config = ResolverConfig {
            endpoint: "https://gist.example.com".to_string(),
            timeout_ms: 1_000,
            ..ResolverConfig::default()
        };
        (
            CallbackResolver::new(Arc::clone(&transport), &config).unwrap(),
            transport,
        )
    }

    #[test]
    fn test_request_url() {
        let (resolver, _) = resolver(Script::Silent);
        let url = resolver.request_url("abc/42", "_gist_cb_abc_42_x");
        assert_eq!(
            url.as_str(),
            "https://gist.example.com/abc%2F42.json?callback=_gist_cb_abc_42_x"
        );
    }

    #[test]
    fn test_rejects_bad_endpoint() {
        let config = ResolverConfig {
            endpoint: "not a url".to_string(),
            ..ResolverConfig::default()
        };
        assert!(matches!(
            CallbackResolver::new(FakeTransport::new(Script::Silent), &config),
            Err(EmbedError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_resolves_payload() {
        let (resolver, transport) = resolver(Script::Respond);
        let result = resolver.resolve("42").await.unwrap();
        assert_eq!(result.fragment, "<p>42</p>");
        assert_eq!(result.stylesheet_path.as_deref(), Some("/a.css"));
        assert!(resolver.registry().is_empty());

        let requests = transport.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert!(requests[0].url.as_str().contains(&requests[0].callback_name));
    }

    #[tokio::test]
    async fn test_transport_failure() {
        let (resolver, _) = resolver(Script::Fail);
        let err = resolver.resolve("42").await.unwrap_err();
        assert_eq!(err.to_string(), "unable to retrieve content for 42");
        assert!(resolver.registry().is_empty());
    }

    #[tokio::test]
    async fn test_loaded_without_callback() {
        let (resolver, _) = resolver(Script::LoadEmpty);
        assert!(matches!(
            resolver.resolve("42").await,
            Err(ResolveError::MalformedPayload { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_cleans_up_and_ignores_late_response() {
        let (resolver, _) = resolver(Script::RespondLate(5_000));
        let err = resolver.resolve("42").await.unwrap_err();
        assert_eq!(
            err,
            ResolveError::Timeout {
                identifier: "42".to_string(),
                timeout_ms: 1_000
            }
        );
        assert!(resolver.registry().is_empty());

        // Let the late response arrive; it must find nothing to settle.
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(resolver.registry().is_empty());
    }

    #[tokio::test]
    async fn test_same_identifier_requests_are_independent() {
        let (resolver, transport) = resolver(Script::Respond);
        let (a, b) = tokio::join!(resolver.resolve("7"), resolver.resolve("7"));
        assert!(a.is_ok() && b.is_ok());

        let requests = transport.requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        assert_ne!(requests[0].token, requests[1].token);
        assert_ne!(requests[0].callback_name, requests[1].callback_name);
    }
}
