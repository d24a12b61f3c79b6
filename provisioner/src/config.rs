//! Provisioner configuration.
//!
//! No CLI flags: everything comes from `FLEETFORGE_*` environment variables
//! layered over an optional local `fleetforge.toml`, with defaults baked in.
//! The notification-channel identifier is the one hard requirement.

use crate::error::{OrchestratorError, Result};
use crate::provider::ImageSelector;
use fleetforge_common::protocol::TopicArn;
use serde::Deserialize;
use std::time::Duration;

pub const SETTINGS_FILE: &str = "fleetforge.toml";

/// Optional settings file; every field has an environment override.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    pub topic_arn: Option<String>,
    pub region: Option<String>,
    pub instance_type: Option<String>,
    pub subnet_id: Option<String>,
    pub security_group_id: Option<String>,
    pub key_name: Option<String>,
    pub image_name_pattern: Option<String>,
    pub image_owner: Option<String>,
    pub architecture: Option<String>,
    pub instance_profile: Option<String>,
    pub builds_bucket: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub topic: TopicArn,
    pub region: String,
    pub instance_type: String,
    pub subnet_id: Option<String>,
    pub security_group_id: Option<String>,
    pub key_name: Option<String>,
    pub image_name_pattern: String,
    pub image_owner: String,
    pub architecture: String,
    pub instance_profile: String,
    /// Overrides the derived `fleetforge-builds-{region}-{account}` bucket.
    pub builds_bucket: Option<String>,
    /// Inserted after creating a new role; identity propagation is
    /// eventually consistent and immediate use intermittently fails.
    pub role_propagation_delay: Duration,
}

impl Config {
    pub fn load() -> Result<Self> {
        let settings = read_settings()?;
        Self::resolve(settings, |key| std::env::var(key).ok())
    }

    /// Layering: environment over settings file over baked-in default.
    pub(crate) fn resolve(settings: Settings, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let pick = |env_key: &str, file_value: Option<String>, default: &str| {
            env(env_key)
                .or(file_value)
                .unwrap_or_else(|| default.to_string())
        };
        let pick_opt = |env_key: &str, file_value: Option<String>| {
            env(env_key).or(file_value).filter(|s| !s.is_empty())
        };

        let raw_topic = env("FLEETFORGE_TOPIC_ARN")
            .or(settings.topic_arn)
            .ok_or_else(|| {
                OrchestratorError::precondition(
                    "notification channel is not configured; set FLEETFORGE_TOPIC_ARN \
                     (arn:<partition>:sns:<region>:<account>:<name>) or topic_arn in fleetforge.toml",
                )
            })?;
        let topic = TopicArn::parse(&raw_topic)
            .map_err(|e| OrchestratorError::precondition(e.to_string()))?;

        let region = pick("FLEETFORGE_REGION", settings.region, &topic.region);

        let propagation_secs = env("FLEETFORGE_ROLE_PROPAGATION_SECS")
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(30);

        Ok(Self {
            topic,
            region,
            instance_type: pick(
                "FLEETFORGE_INSTANCE_TYPE",
                settings.instance_type,
                "m6i.large",
            ),
            subnet_id: pick_opt("FLEETFORGE_SUBNET_ID", settings.subnet_id),
            security_group_id: pick_opt("FLEETFORGE_SECURITY_GROUP_ID", settings.security_group_id),
            key_name: pick_opt("FLEETFORGE_KEY_NAME", settings.key_name),
            image_name_pattern: pick(
                "FLEETFORGE_IMAGE_NAME_PATTERN",
                settings.image_name_pattern,
                "al2023-ami-2023*",
            ),
            image_owner: pick("FLEETFORGE_IMAGE_OWNER", settings.image_owner, "amazon"),
            architecture: pick("FLEETFORGE_ARCHITECTURE", settings.architecture, "x86_64"),
            instance_profile: pick(
                "FLEETFORGE_INSTANCE_PROFILE",
                settings.instance_profile,
                "fleetforge-host",
            ),
            builds_bucket: pick_opt("FLEETFORGE_BUILDS_BUCKET", settings.builds_bucket),
            role_propagation_delay: Duration::from_secs(propagation_secs),
        })
    }

    pub fn image_selector(&self) -> ImageSelector {
        ImageSelector {
            name_pattern: self.image_name_pattern.clone(),
            owner: self.image_owner.clone(),
            architecture: self.architecture.clone(),
        }
    }
}

/// Region resolution for the management subcommands, which operate on an
/// already-provisioned instance and need no notification channel.
pub fn region_only() -> Result<String> {
    if let Ok(region) = std::env::var("FLEETFORGE_REGION") {
        return Ok(region);
    }
    let settings = read_settings()?;
    if let Some(region) = settings.region {
        return Ok(region);
    }
    if let Some(raw) = std::env::var("FLEETFORGE_TOPIC_ARN")
        .ok()
        .or(settings.topic_arn)
        && let Ok(topic) = TopicArn::parse(&raw)
    {
        return Ok(topic.region);
    }
    Ok("us-east-1".to_string())
}

fn read_settings() -> Result<Settings> {
    let path = std::env::var("FLEETFORGE_CONFIG").unwrap_or_else(|_| SETTINGS_FILE.to_string());
    if !std::path::Path::new(&path).exists() {
        return Ok(Settings::default());
    }
    let content = std::fs::read_to_string(&path)?;
    toml::from_str(&content)
        .map_err(|e| OrchestratorError::precondition(format!("invalid {path}: {e}")))
}
