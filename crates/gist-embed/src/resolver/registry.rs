//! Per-request callback registry.
//!
//! Each attempt registers a token before its script is dispatched. The
//! transport reports back through a [`CallbackHandle`]; the entry is removed
//! as soon as the attempt settles or its [`PendingCallback`] is dropped, so
//! events that arrive afterwards are ignored.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use serde_json::Value;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::lock;

/// How a dispatched script finished.
#[derive(Debug)]
pub(crate) enum Delivery {
    /// The script loaded; carries whatever the callback received.
    Loaded(Option<Value>),
    Failed,
}

struct PendingEntry {
    identifier: String,
    payload: Option<Value>,
    settle: oneshot::Sender<Delivery>,
}

pub struct CallbackRegistry {
    prefix: String,
    pending: Mutex<HashMap<Uuid, PendingEntry>>,
}

impl CallbackRegistry {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Register a new attempt for `identifier`.
    pub fn register(self: &Arc<Self>, identifier: &str) -> PendingCallback {
        let token = Uuid::new_v4();
        let callback_name = self.callback_name(identifier, token);
        let (settle, receiver) = oneshot::channel();

        lock(&self.pending).insert(
            token,
            PendingEntry {
                identifier: identifier.to_string(),
                payload: None,
                settle,
            },
        );

        PendingCallback {
            token,
            callback_name,
            registry: Arc::clone(self),
            receiver,
        }
    }

    /// Callback name for an attempt: prefix, sanitized identifier, token.
    pub fn callback_name(&self, identifier: &str, token: Uuid) -> String {
        let sanitized: String = identifier
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        format!("{}{sanitized}_{}", self.prefix, token.simple())
    }

    /// Number of attempts still waiting to settle.
    pub fn len(&self) -> usize {
        lock(&self.pending).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn invoke(&self, token: Uuid, payload: Value) -> bool {
        match lock(&self.pending).get_mut(&token) {
            Some(entry) => {
                if entry.payload.is_none() {
                    entry.payload = Some(payload);
                }
                true
            }
            None => false,
        }
    }

    fn settle(&self, token: Uuid, outcome: impl FnOnce(Option<Value>) -> Delivery) -> bool {
        let Some(entry) = lock(&self.pending).remove(&token) else {
            return false;
        };
        tracing::debug!("Settling callback for {}", entry.identifier);
        // The receiver is gone only if the attempt was abandoned mid-flight.
        entry.settle.send(outcome(entry.payload)).is_ok()
    }

    fn remove(&self, token: Uuid) {
        lock(&self.pending).remove(&token);
    }
}

/// Resolver-side half of a registered attempt. Dropping it unregisters the
/// callback.
pub struct PendingCallback {
    token: Uuid,
    callback_name: String,
    registry: Arc<CallbackRegistry>,
    receiver: oneshot::Receiver<Delivery>,
}

impl PendingCallback {
    pub fn token(&self) -> Uuid {
        self.token
    }

    pub fn callback_name(&self) -> &str {
        &self.callback_name
    }

    /// Handle given to the transport.
    pub fn handle(&self) -> CallbackHandle {
        CallbackHandle {
            token: self.token,
            callback_name: self.callback_name.clone(),
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Wait for the transport to settle the attempt. `None` if the entry was
    /// dropped without a delivery.
    pub(crate) async fn settled(&mut self) -> Option<Delivery> {
        (&mut self.receiver).await.ok()
    }
}

impl Drop for PendingCallback {
    fn drop(&mut self) {
        self.registry.remove(self.token);
    }
}

/// Transport-side half of a registered attempt.
///
/// All methods return `false` when the attempt has already settled; late
/// events are otherwise no-ops.
#[derive(Clone, Debug)]
pub struct CallbackHandle {
    token: Uuid,
    callback_name: String,
    registry: Weak<CallbackRegistry>,
}

impl CallbackHandle {
    pub fn token(&self) -> Uuid {
        self.token
    }

    pub fn callback_name(&self) -> &str {
        &self.callback_name
    }

    /// The remote response calling the named callback with its payload.
    pub fn invoke(&self, payload: Value) -> bool {
        let delivered = self
            .registry
            .upgrade()
            .is_some_and(|r| r.invoke(self.token, payload));
        if !delivered {
            tracing::debug!("Ignoring late callback {}", self.callback_name);
        }
        delivered
    }

    /// The script finished loading.
    pub fn loaded(&self) -> bool {
        self.finish(Delivery::Loaded)
    }

    /// The script failed to load.
    pub fn failed(&self) -> bool {
        self.finish(|_| Delivery::Failed)
    }

    pub fn is_pending(&self) -> bool {
        self.registry
            .upgrade()
            .is_some_and(|r| lock(&r.pending).contains_key(&self.token))
    }

    fn finish(&self, outcome: impl FnOnce(Option<Value>) -> Delivery) -> bool {
        let settled = self
            .registry
            .upgrade()
            .is_some_and(|r| r.settle(self.token, outcome));
        if !settled {
            tracing::debug!("Ignoring late load event for {}", self.callback_name);
        }
        settled
    }
}
