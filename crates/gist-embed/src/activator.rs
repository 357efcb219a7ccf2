//! Scan-and-resolve cycle: finds target elements, resolves their identifiers
//! and applies each outcome to the document exactly once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::config::ActivatorConfig;
use crate::document::{Document, Selector};
use crate::lock;
use crate::resolver::Resolver;
use crate::types::{
    ElementHandle, ElementState, EmbedError, EmbedResult, Outcome, ResolutionResult, ResolveError,
};

/// Marks an element while some activator has a resolution in flight for it.
pub const CLAIM_ATTRIBUTE: &str = "data-gist-embed-pending";

/// Called with each element once it has settled, successfully or not.
pub type SettleHook = Arc<dyn Fn(ElementHandle) + Send + Sync>;

/// The data attribute that marks target elements.
///
/// Accepts the attribute form (`gist-id`, `data-gist-id`) and the dataset
/// form (`gistId`); both map to `data-gist-id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetAttribute {
    attribute: String,
}

impl TargetAttribute {
    pub fn parse(name: &str) -> EmbedResult<Self> {
        let trimmed = name.trim();
        let bare = trimmed.strip_prefix("data-").unwrap_or(trimmed);

        let mut kebab = String::with_capacity(bare.len() + 4);
        for c in bare.chars() {
            if c.is_ascii_uppercase() {
                kebab.push('-');
                kebab.push(c.to_ascii_lowercase());
            } else {
                kebab.push(c);
            }
        }

        let valid = !kebab.is_empty()
            && kebab
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_');
        if !valid {
            return Err(EmbedError::InvalidSelector {
                selector: name.to_string(),
                reason: "attribute names may only contain letters, digits, '-' and '_'"
                    .to_string(),
            });
        }

        Ok(Self {
            attribute: format!("data-{kebab}"),
        })
    }

    /// Full attribute name, e.g. `data-gist-id`.
    pub fn attribute(&self) -> &str {
        &self.attribute
    }
}

/// Appends the shared stylesheet at most once.
pub struct StylesheetRegistry {
    asset_base: String,
    injected: AtomicBool,
}

impl StylesheetRegistry {
    pub fn new(asset_base: impl Into<String>) -> Self {
        Self {
            asset_base: asset_base.into(),
            injected: AtomicBool::new(false),
        }
    }

    /// Absolute URLs pass through; anything else is served by the asset host.
    pub fn href(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") || path.starts_with("//") {
            return path.to_string();
        }
        let base = self.asset_base.trim_end_matches('/');
        if path.starts_with('/') {
            format!("{base}{path}")
        } else {
            format!("{base}/{path}")
        }
    }

    /// Append the stylesheet unless one was already appended. Returns whether
    /// this call appended it.
    pub fn ensure(&self, document: &dyn Document, path: &str) -> bool {
        if path.trim().is_empty() || self.injected.swap(true, Ordering::SeqCst) {
            return false;
        }
        let href = self.href(path);
        tracing::debug!("Injecting stylesheet {href}");
        document.append_stylesheet(&href);
        true
    }

    pub fn is_injected(&self) -> bool {
        self.injected.load(Ordering::SeqCst)
    }
}

/// Resolution tasks dispatched by one activation.
pub struct Activation {
    tasks: Vec<JoinHandle<()>>,
}

impl Activation {
    /// Number of elements a resolution was started for.
    pub fn dispatched(&self) -> usize {
        self.tasks.len()
    }

    /// Wait until every dispatched element has settled.
    pub async fn settled(self) {
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::error!("Resolution task ended abnormally: {e}");
            }
        }
    }
}

impl std::fmt::Debug for Activation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Activation")
            .field("dispatched", &self.tasks.len())
            .finish()
    }
}

/// Finds target elements and resolves each of them once.
///
/// Cloning is cheap; clones share state, including the stylesheet flag.
#[derive(Clone)]
pub struct Activator {
    pub(crate) inner: Arc<ActivatorInner>,
}

pub(crate) struct ActivatorInner {
    pub(crate) target: TargetAttribute,
    pub(crate) selector: Selector,
    pub(crate) document: Arc<dyn Document>,
    pub(crate) runtime: Handle,
    resolver: Arc<dyn Resolver>,
    on_settled: Option<SettleHook>,
    stylesheets: StylesheetRegistry,
    states: Mutex<HashMap<ElementHandle, ElementState>>,
    config: ActivatorConfig,
}

impl Activator {
    pub fn new(
        attribute_name: &str,
        document: Arc<dyn Document>,
        resolver: Arc<dyn Resolver>,
        on_settled: Option<SettleHook>,
    ) -> EmbedResult<Self> {
        Self::with_config(
            attribute_name,
            document,
            resolver,
            on_settled,
            ActivatorConfig::default(),
        )
    }

    /// Validation runs before the document is touched: blank attribute name,
    /// then a missing async runtime, then an unusable attribute name.
    pub fn with_config(
        attribute_name: &str,
        document: Arc<dyn Document>,
        resolver: Arc<dyn Resolver>,
        on_settled: Option<SettleHook>,
        config: ActivatorConfig,
    ) -> EmbedResult<Self> {
        if attribute_name.trim().is_empty() {
            return Err(EmbedError::MissingArgument);
        }
        let runtime = Handle::try_current()
            .map_err(|e| EmbedError::UnsupportedCapability(format!("async runtime: {e}")))?;
        let target = TargetAttribute::parse(attribute_name)?;
        let selector = Selector::for_attribute(config.target_tag.as_deref(), target.attribute())?;

        tracing::debug!("Activator ready for {selector}");

        Ok(Self {
            inner: Arc::new(ActivatorInner {
                target,
                selector,
                document,
                runtime,
                resolver,
                on_settled,
                stylesheets: StylesheetRegistry::new(config.asset_base.clone()),
                states: Mutex::new(HashMap::new()),
                config,
            }),
        })
    }

    /// Scan the document and start one resolution per unclaimed target.
    ///
    /// All resolutions are dispatched before any of them can settle. Failures
    /// are applied to the element and never returned.
    pub fn run_once(&self) -> Activation {
        let inner = &self.inner;
        let targets = inner.document.query_selector_all(None, &inner.selector);
        let found = targets.len();
        let mut tasks = Vec::with_capacity(found);

        for element in targets {
            let Some(identifier) = inner.document.attribute(element, inner.target.attribute())
            else {
                continue;
            };
            if identifier.trim().is_empty() {
                tracing::warn!(
                    "Skipping element {element}: empty {}",
                    inner.target.attribute()
                );
                continue;
            }
            if !inner.claim(element) {
                continue;
            }

            let task_inner = Arc::clone(inner);
            tasks.push(inner.runtime.spawn(async move {
                let result = task_inner.resolver.resolve(&identifier).await;
                task_inner.settle(element, &identifier, result);
            }));
        }

        tracing::info!(
            "Activation dispatched {} of {found} target(s) for {}",
            tasks.len(),
            inner.selector
        );
        Activation { tasks }
    }

    pub fn target(&self) -> &TargetAttribute {
        &self.inner.target
    }

    pub fn selector(&self) -> &Selector {
        &self.inner.selector
    }

    pub fn state(&self, element: ElementHandle) -> Option<ElementState> {
        lock(&self.inner.states).get(&element).cloned()
    }

    pub fn outcome(&self, element: ElementHandle) -> Option<Outcome> {
        match self.state(element) {
            Some(ElementState::Settled(outcome)) => Some(outcome),
            _ => None,
        }
    }

    pub fn stylesheet_injected(&self) -> bool {
        self.inner.stylesheets.is_injected()
    }
}

impl ActivatorInner {
    /// Mark `element` pending unless it is already in flight or settled,
    /// here or by another activator. Other activators are seen through the
    /// state classes and the claim attribute on the element itself.
    fn claim(&self, element: ElementHandle) -> bool {
        let mut states = lock(&self.states);
        if states.contains_key(&element) {
            return false;
        }
        if self.document.has_class(element, &self.config.complete_class)
            || self.document.has_class(element, &self.config.error_class)
        {
            return false;
        }
        if !self.document.insert_attribute(element, CLAIM_ATTRIBUTE, "") {
            tracing::debug!("Element {element} is claimed by another activator");
            return false;
        }
        states.insert(element, ElementState::Pending);
        true
    }

    fn settle(
        &self,
        element: ElementHandle,
        identifier: &str,
        result: Result<ResolutionResult, ResolveError>,
    ) {
        let (outcome, stylesheet) = match result {
            Ok(resolved) => (
                Outcome::Complete {
                    fragment: resolved.fragment,
                },
                resolved.stylesheet_path,
            ),
            Err(e) => {
                tracing::warn!("Failed to resolve {identifier}: {e}");
                (
                    Outcome::Failed {
                        message: e.to_string(),
                    },
                    None,
                )
            }
        };

        {
            let mut states = lock(&self.states);
            if let Some(ElementState::Settled(_)) = states.get(&element) {
                tracing::debug!("Element {element} already settled; dropping result");
                return;
            }
            states.insert(element, ElementState::Settled(outcome.clone()));
        }

        self.project(element, &outcome, stylesheet.as_deref());
        self.document.remove_attribute(element, CLAIM_ATTRIBUTE);

        if let Some(hook) = &self.on_settled {
            hook(element);
        }
    }

    /// Apply an outcome to the document.
    fn project(&self, element: ElementHandle, outcome: &Outcome, stylesheet: Option<&str>) {
        let document = self.document.as_ref();
        match outcome {
            Outcome::Complete { fragment } => {
                document.set_inner_html(element, fragment);
                if let Some(path) = stylesheet {
                    self.stylesheets.ensure(document, path);
                }
                document.add_class(element, &self.config.complete_class);
            }
            Outcome::Failed { message } => {
                document.add_class(element, &self.config.error_class);
                document.set_inner_html(element, message);
            }
        }
    }
}
