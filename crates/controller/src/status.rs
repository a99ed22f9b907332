//! Ready condition transitions on a ShipwrightBuild.

use tracing::{info, warn};

use shp_core::condition::set_condition;
use shp_core::{Condition, Reason, ShipwrightBuild, CONDITION_READY};
use shp_kubehub::{from_json, to_json, ClusterClient, ClusterError};

use crate::error::ControllerError;

pub const INIT_MESSAGE: &str = "Initializing Shipwright Operator";
pub const SUCCESS_MESSAGE: &str = "Reconciled ShipwrightBuild successfully";

/// Set the Ready condition and write the status subresource. Skips the write when nothing changed.
pub async fn set_ready(
    client: &dyn ClusterClient,
    build: &ShipwrightBuild,
    reason: Reason,
    message: &str,
) -> Result<ShipwrightBuild, ClusterError> {
    let mut b = build.clone();
    let cond = Condition::new(CONDITION_READY, reason.status(), reason.as_str(), message);
    if !set_condition(b.conditions_mut(), cond) {
        return Ok(b);
    }
    let updated = from_json(client.update_status(&to_json(&b)?).await?)?;
    info!(status = %reason.status(), reason = reason.as_str(), message, "Ready condition updated");
    Ok(updated)
}

pub async fn mark_init(client: &dyn ClusterClient, build: &ShipwrightBuild) -> Result<ShipwrightBuild, ClusterError> {
    set_ready(client, build, Reason::Init, INIT_MESSAGE).await
}

pub async fn mark_ready(client: &dyn ClusterClient, build: &ShipwrightBuild) -> Result<ShipwrightBuild, ClusterError> {
    set_ready(client, build, Reason::Success, SUCCESS_MESSAGE).await
}

pub async fn mark_waiting(client: &dyn ClusterClient, build: &ShipwrightBuild, message: &str) -> Result<ShipwrightBuild, ClusterError> {
    set_ready(client, build, Reason::Waiting, message).await
}

pub fn failure_message(err: &ControllerError) -> String {
    format!("Reconciling ShipwrightBuild failed: {}", err)
}

/// Record `err` on the Ready condition. The pass is already failing with `err`, so a failed
/// write here is logged and dropped.
pub async fn record_failure(client: &dyn ClusterClient, build: &ShipwrightBuild, err: &ControllerError) {
    if let Err(e) = set_ready(client, build, err.reason(), &failure_message(err)).await {
        warn!(error = %e, cause = %err, "updating Ready condition after failure");
    }
}
