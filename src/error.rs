//! Error types for the Multishare Controller
//!
//! Separates failures a caller should retry later (conflicts, transient
//! backend errors) from failures that will never succeed as requested
//! (validation, capacity exhaustion).

use std::time::Duration;
use thiserror::Error;

/// Unified error type for the controller
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Request Errors
    // =========================================================================
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Operation {existing} already in progress for {resource}")]
    Conflict { resource: String, existing: String },

    #[error("Capacity exhausted: {requested} bytes cannot be placed ({reason})")]
    CapacityExhausted { requested: u64, reason: String },

    #[error("Malformed identity {value:?}: expected {expected} segments, found {found}")]
    MalformedIdentity {
        value: String,
        expected: usize,
        found: usize,
    },

    // =========================================================================
    // Backend Errors
    // =========================================================================
    #[error("Backend operation failed: {operation}: {reason}")]
    Backend { operation: String, reason: String },

    #[error("Unknown state for {resource}: {detail}")]
    UnknownState { resource: String, detail: String },

    // =========================================================================
    // Persistence Errors
    // =========================================================================
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Resource not found: {kind}/{name}")]
    ResourceNotFound { kind: String, name: String },

    #[error("Resource {resource} is protected by finalizer")]
    FinalizerPresent { resource: String },

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("Time parse error: {0}")]
    TimeParse(String),

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Action to take on error during reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Requeue with exponential backoff
    RequeueWithBackoff,
    /// Requeue after specific duration
    RequeueAfter(Duration),
    /// Don't requeue, wait for changes
    NoRequeue,
}

/// How a caller should react to a failed request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    /// The same request may succeed later
    TryAgainLater,
    /// The request can never succeed as stated
    NeverFits,
    /// Neither; a bug or broken environment
    Internal,
}

impl Error {
    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            Error::Backend { .. } | Error::Kube(_) => ErrorAction::RequeueWithBackoff,

            // Another operation owns the resource; it will finish on its own
            Error::Conflict { .. } => ErrorAction::RequeueAfter(Duration::from_secs(30)),

            Error::UnknownState { .. } => ErrorAction::RequeueAfter(Duration::from_secs(60)),

            Error::Configuration(_)
            | Error::Validation(_)
            | Error::CapacityExhausted { .. }
            | Error::MalformedIdentity { .. }
            | Error::TimeParse(_) => ErrorAction::NoRequeue,

            _ => ErrorAction::RequeueWithBackoff,
        }
    }

    /// Classify the error for a request caller
    pub fn retry_class(&self) -> RetryClass {
        match self {
            Error::Conflict { .. }
            | Error::Backend { .. }
            | Error::UnknownState { .. }
            | Error::Kube(_)
            | Error::FinalizerPresent { .. } => RetryClass::TryAgainLater,

            Error::Validation(_)
            | Error::CapacityExhausted { .. }
            | Error::MalformedIdentity { .. } => RetryClass::NeverFits,

            _ => RetryClass::Internal,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        !matches!(self.action(), ErrorAction::NoRequeue)
    }

    /// Check if this error is transient
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Backend { .. } | Error::Kube(_))
    }

    pub(crate) fn backend(operation: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Error::Backend {
            operation: operation.into(),
            reason: reason.to_string(),
        }
    }
}

/// Result type alias for the controller
pub type Result<T> = std::result::Result<T, Error>;
