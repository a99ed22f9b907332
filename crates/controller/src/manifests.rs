//! Manifest subsets read once at startup from the data path.

use tracing::info;

use shp_apply::{ManifestError, ManifestSet};
use shp_core::OperatorConfig;

#[derive(Clone, Debug, Default)]
pub struct Manifests {
    /// Shipwright Build release: CRDs, RBAC, controller and webhook.
    pub release: ManifestSet,
    /// Webhook Issuer/Certificate; loaded only when managed certificates are enabled.
    pub certificates: Option<ManifestSet>,
    /// ClusterBuildStrategy catalog; empty when the directory is absent.
    pub strategies: ManifestSet,
}

impl Manifests {
    pub fn load(config: &OperatorConfig) -> Result<Self, ManifestError> {
        let release = ManifestSet::load(&config.release_manifest_path())?;
        let certificates = if config.managed_webhook_certs {
            Some(ManifestSet::load(&config.certificates_manifest_path())?)
        } else {
            None
        };
        let dir = config.strategies_dir();
        let strategies = if dir.exists() { ManifestSet::load(&dir)? } else { ManifestSet::new(dir.display().to_string(), Vec::new()) };
        info!(
            release = release.len(),
            certificates = certificates.as_ref().map(ManifestSet::len).unwrap_or(0),
            strategies = strategies.len(),
            "manifests loaded"
        );
        Ok(Self { release, certificates, strategies })
    }
}
