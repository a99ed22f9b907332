//! Reconcile error taxonomy and how each failure is retried and reported.

use std::time::Duration;

use shp_apply::ManifestError;
use shp_core::{ConditionStatus, Reason};
use shp_kubehub::ClusterError;

/// Delay used whenever a failure asks to be retried later rather than immediately.
pub const RETRY_AFTER: Duration = Duration::from_secs(5);

/// When the dispatcher should call again after a failed pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Retry {
    Immediate,
    After(Duration),
    /// No hint; the dispatcher's own backoff applies.
    Backoff,
}

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    /// A prerequisite operator is not installed at all; nothing in-cluster will fix it.
    #[error("{0} not installed")]
    PrerequisiteMissing(&'static str),

    /// Dependency present but not usable yet (mid-upgrade, still rolling out).
    #[error("{0}")]
    DependencyUnready(String),

    #[error("failed to determine Tekton Operator version: {0}")]
    DependencyVersion(String),

    #[error("timed out after {0:?} waiting for the webhook pods to be ready and running")]
    WebhookTimeout(Duration),

    #[error("{0}")]
    Manifest(#[from] ManifestError),

    /// Deleting the installed manifest failed; the finalizer stays.
    #[error("teardown: {0}")]
    Teardown(#[source] ManifestError),

    #[error("{0}")]
    Cluster(#[from] ClusterError),
}

impl ControllerError {
    pub fn retry(&self) -> Retry {
        match self {
            Self::PrerequisiteMissing(_) => Retry::Backoff,
            Self::DependencyUnready(_) | Self::DependencyVersion(_) | Self::WebhookTimeout(_) | Self::Manifest(_) => {
                Retry::After(RETRY_AFTER)
            }
            Self::Teardown(_) | Self::Cluster(_) => Retry::Immediate,
        }
    }

    /// Reason the Ready condition carries while this error stands.
    pub fn reason(&self) -> Reason {
        match self {
            Self::DependencyUnready(_) | Self::WebhookTimeout(_) => Reason::Waiting,
            _ => Reason::Failed,
        }
    }

    pub fn condition(&self) -> (ConditionStatus, Reason) {
        let reason = self.reason();
        (reason.status(), reason)
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Cluster(e) if e.is_conflict())
    }
}
