//! Inline-script bootstrap: a page that loads the embedder with
//! `<script src=".../gister.js" data-attr-name="gist-id">` gets an immediate
//! activation, no observation involved.

use std::sync::Arc;

use crate::activator::{Activation, Activator};
use crate::config::{BootstrapConfig, EmbedConfig};
use crate::document::{Document, Selector};
use crate::resolver::Resolver;
use crate::types::EmbedResult;

/// Attribute name declared by the bootstrap script, if the document has one.
pub fn bootstrap_attribute(
    document: &dyn Document,
    config: &BootstrapConfig,
) -> EmbedResult<Option<String>> {
    let marker = config.script_marker.replace('"', "");
    let selector = Selector::parse(&format!("script[src*=\"{marker}\"]"))?;

    let Some(script) = document.query_selector(&selector) else {
        return Ok(None);
    };
    Ok(document
        .attribute(script, &config.attribute)
        .filter(|name| !name.trim().is_empty()))
}

/// Activate the document if it carries a bootstrap script. `Ok(None)` when
/// there is no such script or it names no attribute.
pub fn bootstrap_inline(
    document: Arc<dyn Document>,
    resolver: Arc<dyn Resolver>,
    config: &EmbedConfig,
) -> EmbedResult<Option<Activation>> {
    let Some(attribute_name) = bootstrap_attribute(document.as_ref(), &config.bootstrap)? else {
        return Ok(None);
    };

    tracing::info!("Bootstrapping from inline script for {attribute_name}");
    let activator = Activator::with_config(
        &attribute_name,
        document,
        resolver,
        None,
        config.activator.clone(),
    )?;
    Ok(Some(activator.run_once()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::MemoryDocument;
    use crate::types::{ResolutionResult, ResolveError};
    use async_trait::async_trait;

    struct Echo;

    #[async_trait]
    impl Resolver for Echo {
        async fn resolve(&self, identifier: &str) -> Result<ResolutionResult, ResolveError> {
            Ok(ResolutionResult::new(format!("gist {identifier}")))
        }
    }

    fn script(attr: Option<&str>) -> String {
        match attr {
            Some(a) => format!(r#"<script src="/vendor/gister.js" data-attr-name="{a}"></script>"#),
            None => r#"<script src="/vendor/gister.js"></script>"#.to_string(),
        }
    }

    #[tokio::test]
    async fn test_bootstrap_runs_immediately() {
        let doc = Arc::new(MemoryDocument::new());
        doc.append_element(doc.head(), &script(Some("foobar")));
        let el = doc
            .append_element(doc.body(), r#"<code data-foobar="9"></code>"#)
            .unwrap();

        let activation = bootstrap_inline(doc.clone(), Arc::new(Echo), &EmbedConfig::default())
            .unwrap()
            .expect("bootstrap script present");
        assert_eq!(activation.dispatched(), 1);
        activation.settled().await;
        assert_eq!(doc.inner_html(el).as_deref(), Some("gist 9"));
    }

    #[tokio::test]
    async fn test_no_script_no_activation() {
        let doc = Arc::new(MemoryDocument::new());
        doc.append_element(doc.head(), &script(None));
        let result = bootstrap_inline(doc, Arc::new(Echo), &EmbedConfig::default()).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_bootstrap_attribute() {
        let doc = MemoryDocument::new();
        let config = BootstrapConfig::default();
        assert_eq!(bootstrap_attribute(&doc, &config).unwrap(), None);

        doc.append_element(doc.head(), &script(Some("gist-id")));
        assert_eq!(
            bootstrap_attribute(&doc, &config).unwrap().as_deref(),
            Some("gist-id")
        );
    }
}
