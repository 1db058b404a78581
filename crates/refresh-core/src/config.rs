//! refresh.toml configuration parser.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::types::{PausePolicy, PlatformVariant, VersionPin, validate_app_name};
use crate::version::CodeVersion;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshConfig {
    pub application: ApplicationConfig,
    pub policy: Option<PolicyConfig>,
    pub versions: VersionsConfig,
    pub health: Option<HealthConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    pub name: String,
    pub variant: PlatformVariant,
    /// Ordinal of the unit that coordinates the rollout (the leader).
    pub coordinator: Option<u32>,
    /// Human readable workload name, e.g. `PostgreSQL`.
    pub workload_name: Option<String>,
    pub docs_url: Option<String>,
    /// Name of the workload resource passed to the rollback command.
    /// Required for the partition variant.
    pub resource_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Kept as a raw string; out-of-enum values are reported, not rejected.
    pub pause_after_unit_upgrade: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionsConfig {
    pub code: String,
    pub workload: String,
    pub workload_release: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Probe address per unit; `{ordinal}` is substituted.
    pub address_template: Option<String>,
    pub endpoint: Option<String>,
    pub interval: Option<String>,
    pub timeout: Option<String>,
}

impl RefreshConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: RefreshConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Reject configurations the orchestrator cannot act on.
    ///
    /// The pause policy is deliberately not checked here: an invalid value
    /// is a standing warning at runtime, not a load failure.
    pub fn validate(&self) -> anyhow::Result<()> {
        validate_app_name(&self.application.name)
            .map_err(|e| anyhow::anyhow!("application.name: {e}"))?;
        CodeVersion::parse(&self.versions.code)?;
        if self.versions.workload.trim().is_empty() {
            anyhow::bail!("versions.workload must not be empty");
        }

        if self.application.variant == PlatformVariant::Partition {
            if self.application.resource_name.is_none() {
                anyhow::bail!("application.resource_name is required for the partition variant");
            }
            let digest = self
                .versions
                .workload
                .strip_prefix("sha256:")
                .ok_or_else(|| {
                    anyhow::anyhow!(
                        "versions.workload must be an image digest (\"sha256:<hex>\"), got \"{}\"",
                        self.versions.workload
                    )
                })?;
            let bytes = hex::decode(digest)
                .map_err(|e| anyhow::anyhow!("versions.workload digest is not hex: {e}"))?;
            if bytes.len() != 32 {
                anyhow::bail!(
                    "versions.workload digest must be 32 bytes, got {}",
                    bytes.len()
                );
            }
        }
        Ok(())
    }

    pub fn version_pin(&self) -> VersionPin {
        VersionPin {
            code: self.versions.code.clone(),
            workload: self.versions.workload.clone(),
            workload_release: self.versions.workload_release.clone().unwrap_or_default(),
        }
    }

    /// Raw policy value, defaulting to `first`.
    pub fn pause_policy_raw(&self) -> String {
        self.policy
            .as_ref()
            .and_then(|p| p.pause_after_unit_upgrade.clone())
            .unwrap_or_else(|| PausePolicy::default().to_string())
    }

    /// Scaffold a minimal refresh.toml for the given application.
    pub fn scaffold(name: &str, variant: PlatformVariant, code: &str, workload: &str) -> Self {
        RefreshConfig {
            application: ApplicationConfig {
                name: name.to_string(),
                variant,
                coordinator: Some(0),
                workload_name: None,
                docs_url: None,
                resource_name: match variant {
                    PlatformVariant::Partition => Some("workload-image".to_string()),
                    PlatformVariant::PerUnit => None,
                },
            },
            policy: Some(PolicyConfig {
                pause_after_unit_upgrade: Some(PausePolicy::default().to_string()),
            }),
            versions: VersionsConfig {
                code: code.to_string(),
                workload: workload.to_string(),
                workload_release: None,
            },
            health: Some(HealthConfig {
                address_template: Some("127.0.0.1:{ordinal}".to_string()),
                endpoint: Some("/healthz".to_string()),
                interval: Some("5s".to_string()),
                timeout: Some("2s".to_string()),
            }),
        }
    }
}

/// Parse a duration like `5s`, `250ms` or `2m`. Bare numbers are seconds.
pub fn parse_duration(raw: &str) -> Option<std::time::Duration> {
    let raw = raw.trim();
    let (number, unit) = match raw.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => raw.split_at(idx),
        None => (raw, "s"),
    };
    let value: u64 = number.parse().ok()?;
    match unit {
        "ms" => Some(std::time::Duration::from_millis(value)),
        "s" => Some(std::time::Duration::from_secs(value)),
        "m" => Some(std::time::Duration::from_secs(value * 60)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIGEST: &str =
        "sha256:76ef26c7d11a524bcac206d5cb042ebc3c8c8ead73fa0cd69d21921552db03b6";

    #[test]
    fn test_scaffold() {
        let config = RefreshConfig::scaffold("postgresql", PlatformVariant::Partition, "14/1.12.0", DIGEST);
        let toml_str = config.to_toml_string().unwrap();
        assert!(toml_str.contains("postgresql"));
        assert!(toml_str.contains("partition"));
        config.validate().unwrap();
    }

    #[test]
    fn test_parse_minimal() {
        let toml_str = r#"
[application]
name = "mysql"
variant = "per_unit"

[versions]
code = "8.0/1.0.0"
workload = "8.0.39"
"#;
        let config: RefreshConfig = toml::from_str(toml_str).unwrap();
        config.validate().unwrap();
        assert_eq!(config.application.name, "mysql");
        assert_eq!(config.pause_policy_raw(), "first");
        assert_eq!(config.version_pin().workload_release, "");
    }

    #[test]
    fn invalid_policy_still_loads() {
        let toml_str = r#"
[application]
name = "mysql"
variant = "per_unit"

[policy]
pause_after_unit_upgrade = "sometimes"

[versions]
code = "8.0/1.0.0"
workload = "8.0.39"
"#;
        let config: RefreshConfig = toml::from_str(toml_str).unwrap();
        config.validate().unwrap();
        assert_eq!(config.pause_policy_raw(), "sometimes");
    }

    #[test]
    fn partition_requires_digest_and_resource() {
        let mut config =
            RefreshConfig::scaffold("postgresql", PlatformVariant::Partition, "14/1.12.0", "14.11");
        assert!(config.validate().is_err());

        config.versions.workload = DIGEST.to_string();
        config.application.resource_name = None;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_bad_code_version() {
        let config = RefreshConfig::scaffold("mysql", PlatformVariant::PerUnit, "1.0.0", "8.0.39");
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_reserved_characters_in_name() {
        let config = RefreshConfig::scaffold("pg:replica", PlatformVariant::PerUnit, "8.0/1.0.0", "8.0.39");
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("':'"), "{err}");
    }

    #[test]
    fn durations() {
        assert_eq!(parse_duration("5s"), Some(std::time::Duration::from_secs(5)));
        assert_eq!(parse_duration("250ms"), Some(std::time::Duration::from_millis(250)));
        assert_eq!(parse_duration("2m"), Some(std::time::Duration::from_secs(120)));
        assert_eq!(parse_duration("7"), Some(std::time::Duration::from_secs(7)));
        assert_eq!(parse_duration("soon"), None);
    }
}
