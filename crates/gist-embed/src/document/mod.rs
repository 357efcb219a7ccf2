//! Document abstraction the activator queries and mutates.

pub mod memory;

use std::str::FromStr;

use tokio::sync::mpsc;

use crate::types::{ElementHandle, EmbedError, EmbedResult};

pub use memory::MemoryDocument;

/// A parsed CSS selector group, keeping the text it was parsed from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selector {
    source: String,
    compiled: scraper::Selector,
}

impl Selector {
    pub fn parse(source: &str) -> EmbedResult<Self> {
        let trimmed = source.trim();
        if trimmed.is_empty() {
            return Err(EmbedError::InvalidSelector {
                selector: source.to_string(),
                reason: "empty selector".to_string(),
            });
        }
        let compiled =
            scraper::Selector::parse(trimmed).map_err(|e| EmbedError::InvalidSelector {
                selector: source.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Self {
            source: trimmed.to_string(),
            compiled,
        })
    }

    /// Selector for elements carrying `attribute`, optionally restricted to `tag`.
    pub fn for_attribute(tag: Option<&str>, attribute: &str) -> EmbedResult<Self> {
        Self::parse(&format!("{}[{attribute}]", tag.unwrap_or("")))
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// The compiled form, for documents backed by `scraper`.
    pub fn compiled(&self) -> &scraper::Selector {
        &self.compiled
    }
}

impl FromStr for Selector {
    type Err = EmbedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl std::fmt::Display for Selector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.source)
    }
}

/// Query, mutation and change-notification primitives of a host document.
///
/// Implementations own the nodes; the activator only holds handles.
pub trait Document: Send + Sync {
    /// First element in document order matching `selector`.
    fn query_selector(&self, selector: &Selector) -> Option<ElementHandle>;

    /// Elements matching `selector`, in document order. With a `scope`, only
    /// descendants of that element are considered.
    fn query_selector_all(
        &self,
        scope: Option<ElementHandle>,
        selector: &Selector,
    ) -> Vec<ElementHandle>;

    fn attribute(&self, element: ElementHandle, name: &str) -> Option<String>;

    fn has_class(&self, element: ElementHandle, class: &str) -> bool;

    /// Add `class` unless the element already carries it.
    fn add_class(&self, element: ElementHandle, class: &str);

    fn set_attribute(&self, element: ElementHandle, name: &str, value: &str);

    fn remove_attribute(&self, element: ElementHandle, name: &str);

    /// Set `name` only if the element does not carry it yet. Returns whether
    /// this call set it. Implementations shared between threads should
    /// override this with an atomic version.
    fn insert_attribute(&self, element: ElementHandle, name: &str, value: &str) -> bool {
        if self.attribute(element, name).is_some() {
            return false;
        }
        self.set_attribute(element, name, value);
        true
    }

    /// Replace the element's children with `markup`.
    fn set_inner_html(&self, element: ElementHandle, markup: &str);

    /// Append a stylesheet link to the document head.
    fn append_stylesheet(&self, href: &str);

    /// Whether [`observe_child_list`](Document::observe_child_list) is available.
    fn supports_change_notification(&self) -> bool {
        true
    }

    /// Subscribe to direct-child structural changes of `target`.
    fn observe_child_list(&self, target: ElementHandle) -> EmbedResult<MutationSubscription>;
}

/// One structural change to an observed node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationRecord {
    pub target: ElementHandle,
    pub added: Vec<ElementHandle>,
}

/// Live change-notification subscription. Dropping it disconnects.
pub struct MutationSubscription {
    receiver: mpsc::UnboundedReceiver<Vec<MutationRecord>>,
    disconnect: Option<Box<dyn FnOnce() + Send>>,
}

impl MutationSubscription {
    pub fn new(
        receiver: mpsc::UnboundedReceiver<Vec<MutationRecord>>,
        disconnect: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            receiver,
            disconnect: Some(Box::new(disconnect)),
        }
    }

    /// Next batch of records, or `None` once the document stops delivering.
    pub async fn next_batch(&mut self) -> Option<Vec<MutationRecord>> {
        self.receiver.recv().await
    }

    pub fn disconnect(mut self) {
        self.run_disconnect();
    }

    fn run_disconnect(&mut self) {
        if let Some(disconnect) = self.disconnect.take() {
            disconnect();
        }
        self.receiver.close();
    }
}

impl Drop for MutationSubscription {
    fn drop(&mut self) {
        self.run_disconnect();
    }
}

impl std::fmt::Debug for MutationSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutationSubscription")
            .field("connected", &self.disconnect.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selector_parse() {
        let sel = Selector::parse("  main > #gists ").unwrap();
        assert_eq!(sel.as_str(), "main > #gists");
        assert_eq!(sel.to_string(), "main > #gists");
        assert!("section .gist code[data-gist-id]".parse::<Selector>().is_ok());
    }

    #[test]
    fn test_selector_rejects_garbage() {
        for bad in ["", "   ", "[data-", "div >", "::nope("] {
            assert!(
                matches!(Selector::parse(bad), Err(EmbedError::InvalidSelector { .. })),
                "{bad:?}"
            );
        }
    }

    #[test]
    fn test_for_attribute() {
        assert_eq!(
            Selector::for_attribute(None, "data-gist-id").unwrap().as_str(),
            "[data-gist-id]"
        );
        assert_eq!(
            Selector::for_attribute(Some("code"), "data-gist-id")
                .unwrap()
                .as_str(),
            "code[data-gist-id]"
        );
    }
}
