//! Shipwright operator core types: the ShipwrightBuild resource, its Ready condition,
//! reconcile outcomes and the startup configuration shared by every other crate.

#![forbid(unsafe_code)]

pub mod condition;
pub mod config;
pub mod crd;
pub mod outcome;
pub mod version;

pub use condition::{Condition, ConditionStatus, Reason};
pub use config::{OperatorConfig, Platform};
pub use crd::{ShipwrightBuild, ShipwrightBuildSpec, ShipwrightBuildStatus};
pub use outcome::ReconcileOutcome;
pub use version::Version;

/// Sentinel appended to `metadata.finalizers` while the release manifest is installed.
pub const FINALIZER: &str = "finalizer.operator.shipwright.io";

/// Fallback when `spec.targetNamespace` is empty.
pub const DEFAULT_TARGET_NAMESPACE: &str = "shipwright-build";

/// The only condition type maintained on a ShipwrightBuild.
pub const CONDITION_READY: &str = "Ready";

pub const CERT_MANAGER_INJECT_ANNOTATION: &str = "cert-manager.io/inject-ca-from";

/// `cert-manager.io/inject-ca-from` value for a given target namespace.
pub fn cert_manager_inject_value(target_namespace: &str) -> String {
    format!("{}/shipwright-build-webhook-cert", target_namespace)
}

/// Errors raised while assembling core values (configuration, versions).
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("'{0}' is not set")]
    MissingEnv(&'static str),
    #[error("invalid duration '{value}': {source}")]
    InvalidDuration { value: String, source: humantime::DurationError },
    #[error("invalid semantic version '{0}'")]
    InvalidVersion(String),
}
