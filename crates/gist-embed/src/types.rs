//! Core data types for content resolution and element state.

use serde::{Deserialize, Serialize};

/// Opaque handle to an element owned by a [`Document`](crate::Document).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ElementHandle(pub u64);

impl std::fmt::Display for ElementHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Content resolved for one identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionResult {
    /// Markup injected into the target element.
    #[serde(alias = "div")]
    pub fragment: String,
    /// Stylesheet the fragment depends on, relative to the asset host or absolute.
    #[serde(default, alias = "stylesheet")]
    pub stylesheet_path: Option<String>,
}

impl ResolutionResult {
    pub fn new(fragment: impl Into<String>) -> Self {
        Self {
            fragment: fragment.into(),
            stylesheet_path: None,
        }
    }

    pub fn with_stylesheet(mut self, path: impl Into<String>) -> Self {
        self.stylesheet_path = Some(path.into());
        self
    }
}

/// A single fetch attempt, alive until it settles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolutionRequest {
    pub identifier: String,
    pub token: uuid::Uuid,
    /// Name the remote response calls back into.
    pub callback_name: String,
    pub url: url::Url,
}

/// Terminal state of a target element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Outcome {
    Complete { fragment: String },
    Failed { message: String },
}

impl Outcome {
    pub fn is_complete(&self) -> bool {
        matches!(self, Outcome::Complete { .. })
    }

    /// Text that ends up as the element's content.
    pub fn content(&self) -> &str {
        match self {
            Outcome::Complete { fragment } => fragment,
            Outcome::Failed { message } => message,
        }
    }
}

/// Per-element bookkeeping held by an activator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElementState {
    /// A resolution is in flight.
    Pending,
    Settled(Outcome),
}

/// Errors raised while constructing an activator or arming a trigger.
#[derive(thiserror::Error, Debug)]
pub enum EmbedError {
    #[error("Failed to construct activator: provide a data attribute name for the target element(s)")]
    MissingArgument,

    #[error("Unsupported capability: {0}")]
    UnsupportedCapability(String),

    #[error("Container not found: {0}")]
    ContainerNotFound(String),

    #[error("Invalid selector '{selector}': {reason}")]
    InvalidSelector { selector: String, reason: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type EmbedResult<T> = Result<T, EmbedError>;

/// Errors produced by a single resolution attempt.
///
/// These never reach the caller of `run_once`; the activator turns them into
/// the error class and message text on the element.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("unable to retrieve content for {identifier}")]
    Fetch { identifier: String },

    #[error("the request for {identifier} timed out after {timeout_ms}ms")]
    Timeout { identifier: String, timeout_ms: u64 },

    #[error("malformed payload for {identifier}: {reason}")]
    MalformedPayload { identifier: String, reason: String },
}

impl ResolveError {
    pub fn identifier(&self) -> &str {
        match self {
            ResolveError::Fetch { identifier }
            | ResolveError::Timeout { identifier, .. }
            | ResolveError::MalformedPayload { identifier, .. } => identifier,
        }
    }
}
