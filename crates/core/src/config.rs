//! Operator configuration assembled once at startup from the process environment.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::CoreError;

pub const DATA_PATH_ENV: &str = "KO_DATA_PATH";
pub const MANAGED_WEBHOOK_CERTS_ENV: &str = "USE_MANAGED_WEBHOOK_CERTS";
pub const TIMEOUT_ENV: &str = "TIMEOUT";
pub const PLATFORM_ENV: &str = "PLATFORM";
pub const IMAGE_PREFIX: &str = "IMAGE_SHIPWRIGHT_";

pub const DEFAULT_WEBHOOK_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Target platform; selects the transform branch for the release manifest.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Platform {
    #[default]
    Kubernetes,
    OpenShift,
}

impl Platform {
    pub fn parse(s: &str) -> Self {
        if s.trim().eq_ignore_ascii_case("openshift") { Self::OpenShift } else { Self::Kubernetes }
    }
}

#[derive(Clone, Debug)]
pub struct OperatorConfig {
    /// Base directory holding `release.yaml`, `certificates.yaml` and `samples/buildstrategy`.
    pub data_path: PathBuf,
    pub managed_webhook_certs: bool,
    /// Upper bound for the webhook readiness wait.
    pub webhook_timeout: Duration,
    pub platform: Platform,
    /// Image overrides keyed by the variable name with the prefix stripped.
    pub images: BTreeMap<String, String>,
}

impl OperatorConfig {
    pub fn from_env() -> Result<Self, CoreError> {
        Self::from_vars(std::env::vars())
    }

    pub fn from_vars<I>(vars: I) -> Result<Self, CoreError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let vars: BTreeMap<String, String> = vars.into_iter().collect();
        let data_path = vars.get(DATA_PATH_ENV).map(PathBuf::from).ok_or(CoreError::MissingEnv(DATA_PATH_ENV))?;
        Ok(Self {
            data_path,
            managed_webhook_certs: vars.get(MANAGED_WEBHOOK_CERTS_ENV).map(|v| parse_bool(v)).unwrap_or(false),
            webhook_timeout: parse_timeout(vars.get(TIMEOUT_ENV).map(String::as_str))?,
            platform: vars.get(PLATFORM_ENV).map(|v| Platform::parse(v)).unwrap_or_default(),
            images: images_from_vars(vars.iter().map(|(k, v)| (k.as_str(), v.as_str())), IMAGE_PREFIX),
        })
    }

    pub fn release_manifest_path(&self) -> PathBuf {
        self.data_path.join("release.yaml")
    }

    pub fn certificates_manifest_path(&self) -> PathBuf {
        self.data_path.join("certificates.yaml")
    }

    pub fn strategies_dir(&self) -> PathBuf {
        self.data_path.join("samples").join("buildstrategy")
    }
}

/// Accepts `1`, `t` and `true` in their usual spellings; anything unrecognised is false.
pub fn parse_bool(s: &str) -> bool {
    matches!(s.trim(), "1" | "t" | "T" | "TRUE" | "true" | "True")
}

/// Empty or `0` means the default bound.
pub fn parse_timeout(s: Option<&str>) -> Result<Duration, CoreError> {
    match s.map(str::trim) {
        None | Some("") | Some("0") => Ok(DEFAULT_WEBHOOK_TIMEOUT),
        Some(v) => humantime::parse_duration(v)
            .map_err(|source| CoreError::InvalidDuration { value: v.to_string(), source }),
    }
}

pub fn images_from_vars<'a, I>(vars: I, prefix: &str) -> BTreeMap<String, String>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    vars.into_iter()
        .filter_map(|(k, v)| k.strip_prefix(prefix).filter(|name| !name.is_empty()).map(|name| (name.to_string(), v.to_string())))
        .collect()
}
