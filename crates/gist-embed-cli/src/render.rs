//! Render an HTML page: resolve every target element and rewrite the page.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use gist_embed::{
    bootstrap_attribute, Activator, Document, EmbedConfig, ElementHandle, MemoryDocument, Outcome,
    Resolver, Selector, TriggerState,
};
use serde::Serialize;

/// When the activation runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Mode {
    /// Scan the page immediately.
    Once,
    /// Run on the first change to the container.
    Watch,
    /// Poll the container until targets appear.
    Poll,
}

#[derive(Debug, Clone)]
pub struct RenderOptions {
    /// Target attribute. Taken from the page's bootstrap script when unset.
    pub attribute: Option<String>,
    pub mode: Mode,
    /// Container selector, required for `watch` and `poll`.
    pub container: Option<String>,
    pub config: EmbedConfig,
}

/// Summary of one render.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RenderReport {
    pub dispatched: usize,
    pub complete: usize,
    pub failed: usize,
    pub stylesheet_injected: bool,
    /// False when a trigger gave up before running.
    pub fired: bool,
}

/// Resolve the targets in `source` and return the rewritten HTML.
///
/// In `watch` and `poll` mode the container's children are attached only
/// after the trigger is armed, so the page behaves as if its content was
/// rendered late.
pub async fn render_html(
    source: &str,
    resolver: Arc<dyn Resolver>,
    options: &RenderOptions,
) -> Result<(String, RenderReport)> {
    let document = Arc::new(MemoryDocument::parse(source));

    let deferred = match options.mode {
        Mode::Once => None,
        Mode::Watch | Mode::Poll => {
            let Some(container) = options.container.as_deref() else {
                bail!("--container is required for {:?} mode", options.mode);
            };
            let parent = document
                .query_selector(&Selector::parse(container)?)
                .with_context(|| format!("no element matches container {container}"))?;
            let markup = document.detach_children(parent).unwrap_or_default();
            Some((parent, markup))
        }
    };

    let attribute = match &options.attribute {
        Some(name) => name.clone(),
        None => bootstrap_attribute(&*document, &options.config.bootstrap)?
            .context("no --attr given and the page has no bootstrap script")?,
    };

    let activator = Activator::with_config(
        &attribute,
        document.clone(),
        resolver,
        None,
        options.config.activator.clone(),
    )?;

    let activation = match options.mode {
        Mode::Once => Some(activator.run_once()),
        Mode::Watch | Mode::Poll => {
            let container = options.container.as_deref().unwrap_or_default();
            let handle = if options.mode == Mode::Watch {
                activator.watch(container)?
            } else {
                activator.poll_for(container, options.config.poll)?
            };

            match deferred {
                // Nothing would ever be inserted, so the trigger could only wait.
                Some((_, markup)) if markup.is_empty() => {
                    tracing::warn!("Container {container} is empty; nothing to wait for");
                    handle.cancel();
                }
                Some((parent, markup)) if handle.state() == TriggerState::Armed => {
                    attach(&document, parent, &markup);
                }
                _ => {}
            }
            handle.fired().await
        }
    };

    let mut report = RenderReport {
        fired: activation.is_some(),
        ..RenderReport::default()
    };
    if let Some(activation) = activation {
        report.dispatched = activation.dispatched();
        activation.settled().await;
    } else {
        tracing::warn!("Trigger finished without running");
    }

    for element in document.query_selector_all(None, activator.selector()) {
        match activator.outcome(element) {
            Some(Outcome::Complete { .. }) => report.complete += 1,
            Some(Outcome::Failed { .. }) => report.failed += 1,
            None => {}
        }
    }
    report.stylesheet_injected = activator.stylesheet_injected();

    tracing::info!(
        "Rendered {} target(s): {} complete, {} failed",
        report.dispatched,
        report.complete,
        report.failed
    );
    Ok((document.to_html(), report))
}

fn attach(document: &MemoryDocument, container: ElementHandle, markup: &str) {
    let added = document.append_html(container, markup);
    tracing::debug!("Attached {} element(s) to {container}", added.len());
}
