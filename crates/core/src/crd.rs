//! ShipwrightBuild custom resource.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::condition::{find_condition, Condition};
use crate::{CONDITION_READY, DEFAULT_TARGET_NAMESPACE, FINALIZER};

/// Desired state of a Shipwright Build installation.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "operator.shipwright.io",
    version = "v1alpha1",
    kind = "ShipwrightBuild",
    plural = "shipwrightbuilds",
    status = "ShipwrightBuildStatus",
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ShipwrightBuildSpec {
    /// Namespace where the Shipwright Build controller is deployed.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub target_namespace: String,
}

/// Observed state of a ShipwrightBuild.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct ShipwrightBuildStatus {
    /// Latest observations of the resource state. Absent until the first reconcile pass.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<Condition>>,
}

impl ShipwrightBuildStatus {
    pub fn ready(&self) -> Option<&Condition> {
        self.conditions.as_deref().and_then(|c| find_condition(c, CONDITION_READY))
    }
}

impl ShipwrightBuild {
    /// `spec.targetNamespace`, or the default namespace when empty.
    pub fn target_namespace(&self) -> &str {
        let ns = self.spec.target_namespace.trim();
        if ns.is_empty() { DEFAULT_TARGET_NAMESPACE } else { ns }
    }

    /// The Ready condition; `None` means the resource was never reconciled.
    pub fn ready_condition(&self) -> Option<&Condition> {
        self.status.as_ref().and_then(|s| s.ready())
    }

    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    pub fn finalizers(&self) -> &[String] {
        self.metadata.finalizers.as_deref().unwrap_or(&[])
    }

    pub fn has_finalizer(&self) -> bool {
        self.finalizers().iter().any(|f| f == FINALIZER)
    }

    /// Mutable access to the condition list, creating status and list on first touch.
    pub fn conditions_mut(&mut self) -> &mut Vec<Condition> {
        self.status.get_or_insert_with(ShipwrightBuildStatus::default).conditions.get_or_insert_with(Vec::new)
    }
}
