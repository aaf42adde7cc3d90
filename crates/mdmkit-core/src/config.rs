//! Configuration resolution for mdmkit.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (`$XDG_CONFIG_HOME/mdmkit/settings.json`)
//! 3. Explicit config file passed by the embedding service
//! 4. Environment variables (`MDMKIT_*`)

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Complete mdmkit configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub mdm: MdmConfig,
    #[serde(default)]
    pub profiles: ProfileConfig,
    #[serde(default)]
    pub certificate_authorities: CertificateAuthorityConfig,
    #[serde(default)]
    pub push: PushConfig,
    #[serde(default)]
    pub license: LicenseConfig,
    #[serde(default)]
    pub database_path: Option<PathBuf>,
}

/// MDM server endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MdmConfig {
    /// Public URL of the server.
    pub server_url: String,
    /// Dedicated Apple MDM URL. Takes precedence over `server_url` when set.
    pub apple_server_url: Option<String>,
    /// Path of the SCEP proxy endpoint, appended to the MDM URL.
    pub scep_proxy_path: String,
}

impl Default for MdmConfig {
    fn default() -> Self {
        Self {
            server_url: String::new(),
            apple_server_url: None,
            scep_proxy_path: "/mdm/scep/proxy/".to_string(),
        }
    }
}

/// Profile delivery and verification policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileConfig {
    /// Number of re-enqueues a missing or failed profile gets before it is
    /// marked failed.
    pub max_retries: u32,
    /// How long after the earliest install date a missing profile is
    /// tolerated.
    pub grace_period_secs: u64,
    /// Subtracted from `variables_updated_at` when CA-backed variables are
    /// materialized, to absorb device clock skew.
    pub clock_skew_secs: u64,
    /// Maximum number of dispatch workers running at once.
    pub dispatch_concurrency: usize,
}

impl Default for ProfileConfig {
    fn default() -> Self {
        Self {
            max_retries: 1,
            grace_period_secs: 60 * 60, // 1 hour
            clock_skew_secs: 3 * 60,
            dispatch_concurrency: 8,
        }
    }
}

/// Certificate authority client settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CertificateAuthorityConfig {
    pub timeout_secs: u64,
}

impl Default for CertificateAuthorityConfig {
    fn default() -> Self {
        Self { timeout_secs: 30 }
    }
}

/// APNs push settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PushConfig {
    pub apns_url: String,
    /// Bearer provider token used for APNs authentication.
    pub provider_token: Option<String>,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            apns_url: "https://api.push.apple.com".to_string(),
            provider_token: None,
        }
    }
}

/// License tier of the installation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LicenseTier {
    #[default]
    Free,
    Premium,
}

impl LicenseTier {
    pub const fn is_premium(self) -> bool {
        matches!(self, Self::Premium)
    }
}

impl FromStr for LicenseTier {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "free" => Ok(Self::Free),
            "premium" => Ok(Self::Premium),
            other => Err(Error::Config(format!("Unknown license tier: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct LicenseConfig {
    pub tier: LicenseTier,
}

impl Config {
    /// URL that devices use to reach the MDM server.
    pub fn mdm_url(&self) -> &str {
        match self.mdm.apple_server_url.as_deref() {
            Some(url) if !url.is_empty() => url,
            _ => &self.mdm.server_url,
        }
    }

    pub const fn grace_period(&self) -> Duration {
        Duration::from_secs(self.profiles.grace_period_secs)
    }

    pub const fn clock_skew(&self) -> Duration {
        Duration::from_secs(self.profiles.clock_skew_secs)
    }

    pub const fn ca_timeout(&self) -> Duration {
        Duration::from_secs(self.certificate_authorities.timeout_secs)
    }

    /// Configured database path, falling back to `$XDG_DATA_HOME/mdmkit/mdm.db`.
    pub fn resolved_database_path(&self) -> Option<PathBuf> {
        self.database_path
            .clone()
            .or_else(|| dirs::data_dir().map(|p| p.join("mdmkit").join("mdm.db")))
    }
}

/// Load configuration with hierarchical resolution.
pub fn load_config(config_file: Option<&Path>) -> Result<Config> {
    let mut config = Config::default();

    if let Some(global_path) = global_config_path() {
        if global_path.exists() {
            let global = load_config_file(&global_path)?;
            merge_config(&mut config, global)?;
        }
    }

    if let Some(path) = config_file {
        let explicit = load_config_file(path)?;
        merge_config(&mut config, explicit)?;
    }

    apply_env_overrides(&mut config)?;

    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("mdmkit").join("settings.json"))
}

/// Read a config layer as raw JSON so absent keys stay absent.
fn load_config_file(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    let layer: Value = serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })?;
    if !layer.is_object() {
        return Err(Error::Config(format!(
            "Config file {} must contain a JSON object",
            path.display()
        )));
    }
    Ok(layer)
}

/// Overlay the keys present in `layer` onto `base`.
fn merge_config(base: &mut Config, layer: Value) -> Result<()> {
    let mut merged = serde_json::to_value(&*base)?;
    merge_values(&mut merged, layer);
    *base = serde_json::from_value(merged)
        .map_err(|e| Error::Config(format!("Invalid configuration: {e}")))?;
    Ok(())
}

fn merge_values(base: &mut Value, layer: Value) {
    match (base, layer) {
        (Value::Object(base), Value::Object(layer)) => {
            for (key, value) in layer {
                match base.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, layer) => *base = layer,
    }
}

/// Apply `MDMKIT_*` environment overrides.
pub fn apply_env_overrides(config: &mut Config) -> Result<()> {
    apply_overrides_from(config, |key| std::env::var(key).ok())
}

fn apply_overrides_from(
    config: &mut Config,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<()> {
    if let Some(val) = lookup("MDMKIT_SERVER_URL") {
        config.mdm.server_url = val;
    }
    if let Some(val) = lookup("MDMKIT_MAX_RETRIES") {
        if let Ok(n) = val.parse() {
            config.profiles.max_retries = n;
        }
    }
    if let Some(val) = lookup("MDMKIT_GRACE_PERIOD_SECS") {
        if let Ok(n) = val.parse() {
            config.profiles.grace_period_secs = n;
        }
    }
    if let Some(val) = lookup("MDMKIT_DISPATCH_CONCURRENCY") {
        if let Ok(n) = val.parse() {
            config.profiles.dispatch_concurrency = n;
        }
    }
    if let Some(val) = lookup("MDMKIT_DATABASE_PATH") {
        config.database_path = Some(PathBuf::from(val));
    }
    if let Some(val) = lookup("MDMKIT_LICENSE_TIER") {
        config.license.tier = val.parse()?;
    }
    if let Some(val) = lookup("MDMKIT_APNS_PROVIDER_TOKEN") {
        config.push.provider_token = Some(val);
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn default_config_has_one_hour_grace_and_one_retry() {
        let config = Config::default();
        assert_eq!(config.grace_period(), Duration::from_secs(3600));
        assert_eq!(config.profiles.max_retries, 1);
        assert_eq!(config.mdm.scep_proxy_path, "/mdm/scep/proxy/");
        assert_eq!(config.license.tier, LicenseTier::Free);
    }

    #[test]
    fn mdm_url_prefers_apple_server_url() {
        let mut config = Config::default();
        config.mdm.server_url = "https://fleet.example.com".to_string();
        assert_eq!(config.mdm_url(), "https://fleet.example.com");

        config.mdm.apple_server_url = Some("https://mdm.example.com".to_string());
        assert_eq!(config.mdm_url(), "https://mdm.example.com");

        config.mdm.apple_server_url = Some(String::new());
        assert_eq!(config.mdm_url(), "https://fleet.example.com");
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"mdm": {"server_url": "https://fleet.example.com"}, "license": {"tier": "premium"}}"#,
        )
        .unwrap();

        let mut config = Config::default();
        merge_config(&mut config, load_config_file(&path).unwrap()).unwrap();

        assert_eq!(config.mdm.server_url, "https://fleet.example.com");
        assert_eq!(config.mdm.scep_proxy_path, "/mdm/scep/proxy/");
        assert!(config.license.tier.is_premium());
        assert_eq!(config.profiles.dispatch_concurrency, 8);
    }

    #[test]
    fn explicit_file_only_overrides_the_keys_it_sets() {
        let dir = tempfile::tempdir().unwrap();
        let global = dir.path().join("global.json");
        let explicit = dir.path().join("explicit.json");
        std::fs::write(
            &global,
            r#"{"license": {"tier": "premium"}, "profiles": {"max_retries": 3}, "mdm": {"scep_proxy_path": "/custom/"}, "push": {"provider_token": "token"}}"#,
        )
        .unwrap();
        std::fs::write(
            &explicit,
            r#"{"mdm": {"server_url": "https://fleet.example.com"}, "profiles": {"grace_period_secs": 60}}"#,
        )
        .unwrap();

        let mut config = Config::default();
        merge_config(&mut config, load_config_file(&global).unwrap()).unwrap();
        merge_config(&mut config, load_config_file(&explicit).unwrap()).unwrap();

        assert_eq!(config.license.tier, LicenseTier::Premium);
        assert_eq!(config.profiles.max_retries, 3);
        assert_eq!(config.profiles.grace_period_secs, 60);
        assert_eq!(config.profiles.clock_skew_secs, 180);
        assert_eq!(config.mdm.scep_proxy_path, "/custom/");
        assert_eq!(config.mdm.server_url, "https://fleet.example.com");
        assert_eq!(config.push.provider_token.as_deref(), Some("token"));
        assert_eq!(config.push.apns_url, "https://api.push.apple.com");
    }

    #[test]
    fn invalid_layer_value_is_config_error() {
        let mut config = Config::default();
        let err = merge_config(
            &mut config,
            serde_json::json!({"license": {"tier": "platinum"}}),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)), "got: {err}");
        assert_eq!(config.license.tier, LicenseTier::Free);
    }

    #[test]
    fn non_object_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "[1, 2]").unwrap();
        assert!(matches!(load_config_file(&path), Err(Error::Config(_))));
    }

    #[test]
    fn unreadable_file_is_config_error() {
        let err = load_config_file(Path::new("/nonexistent/mdmkit.json")).unwrap_err();
        assert!(matches!(err, Error::Config(_)), "got: {err}");
    }

    #[test]
    fn empty_layer_keeps_base_options() {
        let mut base = Config::default();
        base.push.provider_token = Some("token".to_string());
        base.database_path = Some(PathBuf::from("/var/lib/mdmkit/mdm.db"));

        merge_config(&mut base, serde_json::json!({})).unwrap();

        assert_eq!(base.push.provider_token.as_deref(), Some("token"));
        assert_eq!(
            base.database_path.as_deref(),
            Some(Path::new("/var/lib/mdmkit/mdm.db"))
        );
    }

    #[test]
    fn env_overrides_apply() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("MDMKIT_SERVER_URL", "https://env.example.com"),
            ("MDMKIT_MAX_RETRIES", "3"),
            ("MDMKIT_GRACE_PERIOD_SECS", "not-a-number"),
            ("MDMKIT_LICENSE_TIER", "Premium"),
            ("MDMKIT_DATABASE_PATH", "/srv/mdm.db"),
        ]);
        let mut config = Config::default();
        apply_overrides_from(&mut config, |k| env.get(k).map(ToString::to_string)).unwrap();

        assert_eq!(config.mdm.server_url, "https://env.example.com");
        assert_eq!(config.profiles.max_retries, 3);
        assert_eq!(config.profiles.grace_period_secs, 3600);
        assert_eq!(config.license.tier, LicenseTier::Premium);
        assert_eq!(
            config.resolved_database_path().as_deref(),
            Some(Path::new("/srv/mdm.db"))
        );
    }

    #[test]
    fn unknown_license_tier_is_rejected() {
        let mut config = Config::default();
        let result = apply_overrides_from(&mut config, |k| {
            (k == "MDMKIT_LICENSE_TIER").then(|| "platinum".to_string())
        });
        assert!(result.is_err());
    }
}
