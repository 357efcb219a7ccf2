//! Trigger strategies deciding when an activation runs: single-shot change
//! observation and bounded polling. The manual trigger is
//! [`Activator::run_once`].

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::task::JoinHandle;

use crate::activator::{Activation, Activator};
use crate::config::PollOptions;
use crate::document::Selector;
use crate::lock;
use crate::types::{ElementHandle, EmbedError, EmbedResult};

/// Time source for polling.
#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
    async fn sleep(&self, duration: Duration);
}

/// Tokio's clock; follows paused test time.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    fn now(&self) -> Instant {
        tokio::time::Instant::now().into_std()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Virtual clock: `sleep` advances time immediately and yields once.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<Instant>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: Mutex::new(Instant::now()),
        }
    }

    pub fn advance(&self, duration: Duration) {
        *lock(&self.now) += duration;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *lock(&self.now)
    }

    async fn sleep(&self, duration: Duration) {
        self.advance(duration);
        tokio::task::yield_now().await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerState {
    /// Waiting for a notification or a successful poll.
    Armed,
    /// `run_once` was invoked.
    Fired,
    /// Stopped without running: poll window elapsed or notifications ended.
    Expired,
    Cancelled,
}

/// One armed trigger.
#[derive(Debug)]
pub struct TriggerHandle {
    state: Arc<Mutex<TriggerState>>,
    task: JoinHandle<Option<Activation>>,
}

impl TriggerHandle {
    pub fn state(&self) -> TriggerState {
        *lock(&self.state)
    }

    /// Disarm the trigger, dropping its timer or subscription. No effect
    /// once it has fired or expired.
    pub fn cancel(&self) {
        if transition(&self.state, TriggerState::Cancelled) {
            self.task.abort();
        }
    }

    /// Wait for the trigger to finish. Returns the activation if it fired.
    pub async fn fired(self) -> Option<Activation> {
        match self.task.await {
            Ok(activation) => activation,
            Err(e) => {
                if !e.is_cancelled() {
                    tracing::error!("Trigger task ended abnormally: {e}");
                }
                None
            }
        }
    }
}

/// Move an armed trigger to `to`. Only the first transition wins.
fn transition(state: &Mutex<TriggerState>, to: TriggerState) -> bool {
    let mut current = lock(state);
    if *current != TriggerState::Armed {
        return false;
    }
    *current = to;
    true
}

impl Activator {
    /// Observe direct-child changes of the container and run once on the
    /// first notification, disconnecting immediately.
    ///
    /// The container must already be in the document.
    pub fn watch(&self, container_selector: &str) -> EmbedResult<TriggerHandle> {
        let document = &self.inner.document;
        if !document.supports_change_notification() {
            return Err(EmbedError::UnsupportedCapability(
                "change notification".to_string(),
            ));
        }
        let container = self.find_container(container_selector)?;
        let mut subscription = document.observe_child_list(container)?;

        let state = Arc::new(Mutex::new(TriggerState::Armed));
        let task_state = Arc::clone(&state);
        let activator = self.clone();
        tracing::debug!("Watching {container_selector} for target elements");

        let task = self.inner.runtime.spawn(async move {
            let batch = subscription.next_batch().await;
            subscription.disconnect();

            match batch {
                Some(records) => {
                    if !transition(&task_state, TriggerState::Fired) {
                        return None;
                    }
                    tracing::debug!("Change notification with {} record(s); activating", records.len());
                    Some(activator.run_once())
                }
                None => {
                    transition(&task_state, TriggerState::Expired);
                    None
                }
            }
        });

        Ok(TriggerHandle { state, task })
    }

    /// Poll the container every `options.interval` for target elements and
    /// run once at the first hit. Gives up after `options.duration`.
    pub fn poll_for(
        &self,
        container_selector: &str,
        options: PollOptions,
    ) -> EmbedResult<TriggerHandle> {
        self.poll_for_with_clock(container_selector, options, Arc::new(TokioClock))
    }

    /// [`poll_for`](Activator::poll_for) with an explicit clock.
    pub fn poll_for_with_clock(
        &self,
        container_selector: &str,
        options: PollOptions,
        clock: Arc<dyn Clock>,
    ) -> EmbedResult<TriggerHandle> {
        let max_checks = options.max_checks()?;
        let container = self.find_container(container_selector)?;
        let state = Arc::new(Mutex::new(TriggerState::Armed));

        // First check happens before returning.
        if max_checks == 0 {
            transition(&state, TriggerState::Expired);
            return Ok(self.finished(state, None));
        }
        if self.has_targets(container) {
            transition(&state, TriggerState::Fired);
            let activation = self.run_once();
            return Ok(self.finished(state, Some(activation)));
        }

        let task_state = Arc::clone(&state);
        let activator = self.clone();
        let (duration, interval) = (options.duration(), options.interval());
        tracing::debug!(
            "Polling {container_selector} every {}ms for up to {}ms",
            options.interval_ms,
            options.duration_ms
        );

        let task = self.inner.runtime.spawn(async move {
            let start = clock.now();
            for check in 1..max_checks {
                clock.sleep(interval).await;
                if clock.now().duration_since(start) >= duration {
                    break;
                }
                if activator.has_targets(container) {
                    if !transition(&task_state, TriggerState::Fired) {
                        return None;
                    }
                    tracing::debug!("Poll found targets on check {}", check + 1);
                    return Some(activator.run_once());
                }
            }
            transition(&task_state, TriggerState::Expired);
            tracing::debug!("Polling window elapsed without targets");
            None
        });

        Ok(TriggerHandle { state, task })
    }

    fn find_container(&self, container_selector: &str) -> EmbedResult<ElementHandle> {
        let selector = Selector::parse(container_selector)?;
        self.inner
            .document
            .query_selector(&selector)
            .ok_or_else(|| EmbedError::ContainerNotFound(container_selector.to_string()))
    }

    fn has_targets(&self, container: ElementHandle) -> bool {
        !self
            .inner
            .document
            .query_selector_all(Some(container), &self.inner.selector)
            .is_empty()
    }

    fn finished(&self, state: Arc<Mutex<TriggerState>>, result: Option<Activation>) -> TriggerHandle {
        TriggerHandle {
            state,
            task: self.inner.runtime.spawn(async move { result }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{Document, MemoryDocument};
    use crate::resolver::Resolver;
    use crate::types::{ResolutionResult, ResolveError};

    struct Echo;

    #[async_trait]
    impl Resolver for Echo {
        async fn resolve(&self, identifier: &str) -> Result<ResolutionResult, ResolveError> {
            Ok(ResolutionResult::new(identifier.to_string()))
        }
    }

    fn setup() -> (Arc<MemoryDocument>, ElementHandle, Activator) {
        let doc = Arc::new(MemoryDocument::new());
        let container = doc
            .append_element(doc.body(), r#"<div id="gists"></div>"#)
            .unwrap();
        let activator = Activator::new("gist-id", doc.clone(), Arc::new(Echo), None).unwrap();
        (doc, container, activator)
    }

    #[tokio::test]
    async fn test_manual_clock() {
        let clock = ManualClock::new();
        let start = clock.now();
        clock.sleep(Duration::from_millis(500)).await;
        assert_eq!(clock.now() - start, Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_watch_missing_container() {
        let (_, _, activator) = setup();
        assert!(matches!(
            activator.watch("#nope"),
            Err(EmbedError::ContainerNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_watch_unsupported_checked_first() {
        let doc = Arc::new(MemoryDocument::without_change_notification());
        let activator = Activator::new("gist-id", doc, Arc::new(Echo), None).unwrap();
        // Reported even though the container does not exist.
        assert!(matches!(
            activator.watch("#nope"),
            Err(EmbedError::UnsupportedCapability(_))
        ));
    }

    #[tokio::test]
    async fn test_watch_cancel_disconnects() {
        let (doc, _, activator) = setup();
        let handle = activator.watch("#gists").unwrap();
        assert_eq!(doc.observer_count(), 1);

        handle.cancel();
        assert_eq!(handle.state(), TriggerState::Cancelled);
        assert!(handle.fired().await.is_none());
        assert_eq!(doc.observer_count(), 0);
    }

    #[tokio::test]
    async fn test_poll_fires_immediately_when_present() {
        let (doc, container, activator) = setup();
        doc.append_element(container, r#"<code data-gist-id="1"></code>"#);

        let handle = activator
            .poll_for("#gists", PollOptions::default())
            .unwrap();
        assert_eq!(handle.state(), TriggerState::Fired);
        assert_eq!(handle.fired().await.unwrap().dispatched(), 1);
    }

    #[tokio::test]
    async fn test_poll_rejects_zero_interval() {
        let (_, _, activator) = setup();
        let options = PollOptions::new(Duration::from_secs(1), Duration::ZERO);
        assert!(matches!(
            activator.poll_for("#gists", options),
            Err(EmbedError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_poll_ignores_targets_outside_container() {
        let (doc, _, activator) = setup();
        doc.append_element(doc.body(), r#"<code data-gist-id="1"></code>"#);

        let clock = Arc::new(ManualClock::new());
        let options = PollOptions::new(Duration::from_secs(2), Duration::from_millis(500));
        let handle = activator
            .poll_for_with_clock("#gists", options, clock)
            .unwrap();
        assert!(handle.fired().await.is_none());
    }

    #[tokio::test]
    async fn test_container_with_combinators() {
        let doc = Arc::new(MemoryDocument::parse(
            r#"<main><section id="gists"></section></main><section class="gists"></section>"#,
        ));
        let activator = Activator::new("gist-id", doc.clone(), Arc::new(Echo), None).unwrap();

        let handle = activator.watch("main > #gists").unwrap();
        let container = doc
            .query_selector(&Selector::parse("main #gists").unwrap())
            .unwrap();
        doc.append_element(container, r#"<code data-gist-id="7"></code>"#);
        let activation = handle.fired().await.unwrap();
        assert_eq!(activation.dispatched(), 1);

        let handle = activator
            .poll_for("body > section.gists", PollOptions::default())
            .unwrap();
        handle.cancel();
        assert!(handle.fired().await.is_none());
    }

    #[tokio::test]
    async fn test_poll_cancel() {
        let (_, _, activator) = setup();
        let handle = activator
            .poll_for("#gists", PollOptions::default())
            .unwrap();
        handle.cancel();
        assert_eq!(handle.state(), TriggerState::Cancelled);
        assert!(handle.fired().await.is_none());
    }
}
