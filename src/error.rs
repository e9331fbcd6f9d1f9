//! Error types for the vCenter Migration Operator
//!
//! Provides structured error types for every migration component: resource
//! backup/restore, disk-object management, cross-vCenter relocation, CNS
//! registration and the per-volume orchestrator.

use std::time::Duration;
use thiserror::Error;

/// Unified error type for the operator
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Timed out after {duration:?} waiting for {operation}{}", fmt_detail(.detail))]
    Timeout {
        operation: String,
        duration: Duration,
        detail: Option<String>,
    },

    #[error("{operation}: {count} consecutive query failures, last: {last}")]
    ConsecutiveErrors {
        operation: String,
        count: u32,
        last: Box<Error>,
    },

    // =========================================================================
    // Kubernetes Errors
    // =========================================================================
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Resource not found: {kind}/{name}")]
    ResourceNotFound { kind: String, name: String },

    // =========================================================================
    // Backup / Restore Errors
    // =========================================================================
    #[error("Cannot resolve type identity for resource type {resource_type}")]
    TypeResolution { resource_type: String },

    #[error("Backup manifest decode failed: {0}")]
    Decode(String),

    #[error("Resource {kind}/{name} disappeared between lookup and update")]
    NotFoundAfterCheck { kind: String, name: String },

    #[error("Conflict writing {kind}/{name}: {reason}")]
    Conflict {
        kind: String,
        name: String,
        reason: String,
    },

    #[error("Giving up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: Box<Error> },

    #[error("{failed} of {total} restores failed: {}", .causes.join("; "))]
    RestoreFailed {
        failed: usize,
        total: usize,
        causes: Vec<String>,
    },

    // =========================================================================
    // Disk Object (FCD) Errors
    // =========================================================================
    #[error("Disk object not found: {id}")]
    DiskObjectNotFound { id: String },

    #[error("Failed to attach disk {id} to VM {vm}: {reason}")]
    Attach { id: String, vm: String, reason: String },

    #[error("Failed to detach disk {id} from VM {vm}: {reason}")]
    Detach { id: String, vm: String, reason: String },

    #[error("Failed to delete disk {id}: {reason}")]
    DiskDelete { id: String, reason: String },

    #[error("Disk {id} is still attached to VM {vm}")]
    DiskStillAttached { id: String, vm: String },

    #[error("Invalid datastore path format: {0}")]
    InvalidPathFormat(String),

    #[error("Invalid volume handle: {0}")]
    InvalidVolumeHandle(String),

    // =========================================================================
    // Relocation Errors
    // =========================================================================
    #[error("Failed to create VM {name}: {reason}")]
    CreateVm { name: String, reason: String },

    #[error("Failed to destroy VM {name}: {reason}")]
    DestroyVm { name: String, reason: String },

    #[error("Relocation of VM {vm} failed: {fault}")]
    Relocation { vm: String, fault: String },

    #[error("Status of task {task} unavailable after {attempts} consecutive failures: {reason}")]
    TaskStatusUnavailable {
        task: String,
        attempts: u32,
        reason: String,
    },

    #[error("No free SCSI unit on controller {controller_key}")]
    NoFreeUnits { controller_key: i32 },

    #[error("No SCSI controller found on VM {vm}")]
    NoController { vm: String },

    // =========================================================================
    // CNS Errors
    // =========================================================================
    #[error("Managed volume not found: {id}")]
    ManagedVolumeNotFound { id: String },

    #[error("CNS volume registration failed: {0}")]
    CnsCreateFailed(String),

    #[error("Unexpected task result: expected {expected}, got {actual}")]
    UnexpectedResultType { expected: String, actual: String },

    // =========================================================================
    // Endpoint Errors
    // =========================================================================
    #[error("{kind} not found at path {path}")]
    InventoryNotFound { kind: String, path: String },

    #[error("vCenter call {operation} failed: {reason}")]
    Endpoint { operation: String, reason: String },

    // =========================================================================
    // Orchestration Errors
    // =========================================================================
    #[error("{failed} of {total} volume migrations failed: {}", .details.join("; "))]
    BatchFailed {
        failed: usize,
        total: usize,
        details: Vec<String>,
    },

    #[error("Cannot checkpoint volume {volume} before scaling its consumers down: {reason}")]
    CheckpointFailed { volume: String, reason: String },

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("Base64 decode error: {0}")]
    Base64Decode(#[from] base64::DecodeError),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn fmt_detail(detail: &Option<String>) -> String {
    match detail {
        Some(d) => format!(": {}", d),
        None => String::new(),
    }
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

impl Error {
    /// Shorthand for wrapping a failed endpoint call
    pub fn endpoint(operation: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Error::Endpoint {
            operation: operation.into(),
            reason: reason.to_string(),
        }
    }

    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            // Transient errors - retry with backoff
            Error::Kube(_)
            | Error::Endpoint { .. }
            | Error::Conflict { .. }
            | Error::TaskStatusUnavailable { .. } => ErrorAction::RequeueWithBackoff,

            // Waiting on the cluster to settle
            Error::Timeout { .. } => ErrorAction::RequeueAfter(Duration::from_secs(300)),

            Error::BatchFailed { .. } | Error::RestoreFailed { .. } => {
                ErrorAction::RequeueAfter(Duration::from_secs(60))
            }

            // Safety gate, cancellation and bad input - never retried automatically
            Error::DiskStillAttached { .. }
            | Error::Cancelled
            | Error::Configuration(_)
            | Error::InvalidPathFormat(_)
            | Error::InvalidVolumeHandle(_)
            | Error::TypeResolution { .. } => ErrorAction::NoRequeue,

            // All other errors - retry with backoff
            _ => ErrorAction::RequeueWithBackoff,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        !matches!(self.action(), ErrorAction::NoRequeue)
    }

    /// Check if this error is transient
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Kube(_)
                | Error::Endpoint { .. }
                | Error::Conflict { .. }
                | Error::TaskStatusUnavailable { .. }
        )
    }
}

/// Result type alias for the operator
pub type Result<T> = std::result::Result<T, Error>;
