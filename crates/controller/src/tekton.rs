//! Tekton Pipelines dependency: present, installable through the Tekton Operator, or blocking.

use serde_json::json;
use tracing::{debug, info};

use shp_core::Version;
use shp_kubehub::{object, ClusterClient, ListQuery};

use crate::error::ControllerError;
use crate::get_crd;

pub const TASKRUN_CRD: &str = "taskruns.tekton.dev";
pub const TEKTON_CONFIG_CRD: &str = "tektonconfigs.operator.tekton.dev";
pub const RELEASE_LABEL: &str = "operator.tekton.dev/release";
pub const TEKTON_CONFIG_API_VERSION: &str = "operator.tekton.dev/v1alpha1";
pub const TEKTON_CONFIG_KIND: &str = "TektonConfig";

pub const MIN_SUPPORTED: Version = Version::new(0, 50, 0);

pub const CONFIG_NAME: &str = "config";
pub const CONFIG_PROFILE: &str = "lite";
pub const CONFIG_TARGET_NAMESPACE: &str = "tekton-pipelines";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DependencyState {
    /// Runtime not installed; the operator is present at a supported version but unconfigured.
    Absent,
    OperatorAbsent,
    VersionInsufficient(Version),
    /// Runtime not installed; a TektonConfig was created during this pass.
    ConfiguredAbsent,
    /// Runtime installed, or a TektonConfig already asks the operator to install it.
    Ready,
}

impl DependencyState {
    /// Turn blocking states into errors.
    pub fn require(self) -> Result<Self, ControllerError> {
        match self {
            Self::OperatorAbsent => Err(ControllerError::PrerequisiteMissing("tekton operator")),
            Self::VersionInsufficient(v) => Err(ControllerError::DependencyUnready(format!(
                "insufficient Tekton Operator version {} - must be greater than {}",
                v, MIN_SUPPORTED
            ))),
            other => Ok(other),
        }
    }
}

/// Classify the Tekton installation from live queries, without side effects.
pub async fn assess(client: &dyn ClusterClient) -> Result<DependencyState, ControllerError> {
    if get_crd(client, TASKRUN_CRD).await?.is_some() {
        return Ok(DependencyState::Ready);
    }
    let Some(operator_crd) = get_crd(client, TEKTON_CONFIG_CRD).await? else {
        return Ok(DependencyState::OperatorAbsent);
    };
    let version = operator_version(&operator_crd)?;
    if !version.meets_minimum(MIN_SUPPORTED.major, MIN_SUPPORTED.minor) {
        return Ok(DependencyState::VersionInsufficient(version));
    }
    let configs = client.list(&ListQuery::new(TEKTON_CONFIG_API_VERSION, TEKTON_CONFIG_KIND)).await?;
    if !configs.is_empty() {
        debug!(count = configs.len(), "TektonConfig present");
        return Ok(DependencyState::Ready);
    }
    Ok(DependencyState::Absent)
}

/// [`assess`], then create the minimal TektonConfig when the operator is unconfigured.
/// The create is a single attempt.
pub async fn resolve(client: &dyn ClusterClient) -> Result<DependencyState, ControllerError> {
    match assess(client).await? {
        DependencyState::Absent => {
            client.create(&tekton_config()).await?;
            info!(name = CONFIG_NAME, profile = CONFIG_PROFILE, "created TektonConfig");
            Ok(DependencyState::ConfiguredAbsent)
        }
        other => Ok(other),
    }
}

/// Version published on the operator CRD's release label.
pub fn operator_version(crd: &serde_json::Value) -> Result<Version, ControllerError> {
    let label = object::label(crd, RELEASE_LABEL).ok_or_else(|| {
        ControllerError::DependencyVersion(format!("the CRD TektonConfig does not have the label {} to get its version", RELEASE_LABEL))
    })?;
    Version::parse(label).map_err(|e| ControllerError::DependencyVersion(e.to_string()))
}

pub fn tekton_config() -> serde_json::Value {
    json!({
        "apiVersion": TEKTON_CONFIG_API_VERSION,
        "kind": TEKTON_CONFIG_KIND,
        "metadata": { "name": CONFIG_NAME },
        "spec": { "profile": CONFIG_PROFILE, "targetNamespace": CONFIG_TARGET_NAMESPACE }
    })
}
