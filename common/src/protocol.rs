//! Status and notification protocol shared between the provisioner and the
//! bootstrap binary.
//!
//! The bootstrap side writes a structured status document and appends a
//! literal completion marker to its log; the provisioner side polls both.
//! Log scraping is the legacy channel and is kept for compatibility; the
//! status document is the preferred one.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::io::Error;

pub const BIN_PATH: &str = "/opt/fleetforge/bin/";
pub const ETC_PATH: &str = "/opt/fleetforge/etc/";
pub const STATUS_FILE: &str = "/opt/fleetforge/status.json";
pub const BOOTSTRAP_LOG: &str = "/var/log/fleetforge-bootstrap.log";
pub const BOOTSTRAP_ENV_FILE: &str = "/opt/fleetforge/etc/bootstrap.env";

/// Literal marker appended to the log on successful completion.
pub const COMPLETION_MARKER: &str = "FLEETFORGE BOOTSTRAP COMPLETE";

/// Case-insensitive keywords that signal failure when scraping the log.
pub const ERROR_KEYWORDS: &[&str] = &["error", "failed", "fatal", "traceback"];

/// Web console port probed by the secondary verification path.
pub const CONSOLE_PORT: u16 = 9090;

pub fn log_signals_completion(text: &str) -> bool {
    text.contains(COMPLETION_MARKER)
}

pub fn log_signals_failure(text: &str) -> bool {
    let lower = text.to_lowercase();
    ERROR_KEYWORDS.iter().any(|kw| lower.contains(kw))
}

/// Parsed notification-channel identifier. The structural pattern is
/// `arn:<partition>:sns:<region>:<12-digit account>:<topic name>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicArn {
    pub partition: String,
    pub region: String,
    pub account: String,
    pub name: String,
}

impl TopicArn {
    pub fn parse(s: &str) -> Result<Self, Error> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 6 {
            return Err(Error::other(format!(
                "channel identifier {s:?} must have 6 colon-separated fields"
            )));
        }
        if parts[0] != "arn" {
            return Err(Error::other(format!(
                "channel identifier {s:?} must start with 'arn'"
            )));
        }
        if parts[2] != "sns" {
            return Err(Error::other(format!(
                "channel identifier {s:?} is not an sns topic"
            )));
        }
        if parts[1].is_empty() || parts[3].is_empty() {
            return Err(Error::other(format!(
                "channel identifier {s:?} has an empty partition or region"
            )));
        }
        let account = parts[4];
        if account.len() != 12 || !account.bytes().all(|b| b.is_ascii_digit()) {
            return Err(Error::other(format!(
                "channel identifier {s:?} must carry a 12-digit account id"
            )));
        }
        let name = parts[5];
        if name.is_empty()
            || !name
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        {
            return Err(Error::other(format!(
                "channel identifier {s:?} has an invalid topic name"
            )));
        }
        Ok(Self {
            partition: parts[1].to_string(),
            region: parts[3].to_string(),
            account: account.to_string(),
            name: name.to_string(),
        })
    }
}

impl std::fmt::Display for TopicArn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "arn:{}:sns:{}:{}:{}",
            self.partition, self.region, self.account, self.name
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Success,
    Failed,
}

/// Terminal state of one pipeline step as recorded in the status document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepResult {
    Succeeded,
    FailedOptional,
    FailedCritical,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepReport {
    pub id: String,
    pub result: StepResult,
    pub attempts: u32,
}

/// Structured status document written to [`STATUS_FILE`] when the pipeline
/// reaches a terminal state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub status: RunStatus,
    pub detail: String,
    pub steps: Vec<StepReport>,
    pub timestamp: String,
}

impl StatusReport {
    pub fn new(status: RunStatus, detail: impl Into<String>, steps: Vec<StepReport>) -> Self {
        Self {
            status,
            detail: detail.into(),
            steps,
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

/// Identity snapshot of the provisioned instance, captured once at boot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceIdentity {
    pub instance_id: String,
    pub private_ip: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_ip: Option<String>,
    pub zone: String,
    pub instance_class: String,
}

/// Event published to the notification channel. At most one success event is
/// emitted per run; failures may be reported twice (once by the failing step,
/// once by the global error trap).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationEvent {
    pub status: RunStatus,
    pub identity: InstanceIdentity,
    pub detail: String,
    pub timestamp: String,
}

impl NotificationEvent {
    pub fn success(identity: &InstanceIdentity, detail: impl Into<String>) -> Self {
        Self::with_status(RunStatus::Success, identity, detail)
    }

    pub fn failure(identity: &InstanceIdentity, detail: impl Into<String>) -> Self {
        Self::with_status(RunStatus::Failed, identity, detail)
    }

    fn with_status(
        status: RunStatus,
        identity: &InstanceIdentity,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            status,
            identity: identity.clone(),
            detail: detail.into(),
            timestamp: Utc::now().to_rfc3339(),
        }
    }

    pub fn subject(&self) -> String {
        let status = match self.status {
            RunStatus::Success => "SUCCESS",
            RunStatus::Failed => "FAILED",
        };
        format!("[fleetforge] {status} {}", self.identity.instance_id)
    }

    pub fn body(&self) -> Result<String, Error> {
        serde_json::to_string_pretty(self)
            .map_err(|e| Error::other(format!("failed to serialize notification event: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_arn_parse_valid() {
        let arn = TopicArn::parse("arn:aws:sns:us-east-1:123456789012:deploy-events").unwrap();
        assert_eq!(arn.partition, "aws");
        assert_eq!(arn.region, "us-east-1");
        assert_eq!(arn.account, "123456789012");
        assert_eq!(arn.name, "deploy-events");
        assert_eq!(
            arn.to_string(),
            "arn:aws:sns:us-east-1:123456789012:deploy-events"
        );
    }

    #[test]
    fn test_topic_arn_rejects_malformed() {
        // wrong field count
        assert!(TopicArn::parse("arn:aws:sns:us-east-1:123456789012").is_err());
        // not sns
        assert!(TopicArn::parse("arn:aws:sqs:us-east-1:123456789012:queue").is_err());
        // account not 12 digits
        assert!(TopicArn::parse("arn:aws:sns:us-east-1:1234:topic").is_err());
        assert!(TopicArn::parse("arn:aws:sns:us-east-1:12345678901x:topic").is_err());
        // empty name and bad characters
        assert!(TopicArn::parse("arn:aws:sns:us-east-1:123456789012:").is_err());
        assert!(TopicArn::parse("arn:aws:sns:us-east-1:123456789012:a b").is_err());
        // missing prefix
        assert!(TopicArn::parse("urn:aws:sns:us-east-1:123456789012:topic").is_err());
    }

    #[test]
    fn test_log_marker_detection() {
        assert!(log_signals_completion(
            "Aug 28 10:00:00 fleetforge-bootstrap[812]: INFO FLEETFORGE BOOTSTRAP COMPLETE"
        ));
        assert!(!log_signals_completion("installing cockpit"));
    }

    #[test]
    fn test_log_failure_keywords_case_insensitive() {
        assert!(log_signals_failure("step update: FATAL exit 1"));
        assert!(log_signals_failure("Traceback (most recent call last)"));
        assert!(log_signals_failure("yum install Failed"));
        assert!(!log_signals_failure("installing cockpit-storaged"));
    }

    #[test]
    fn test_status_report_round_trip() {
        let report = StatusReport::new(
            RunStatus::Success,
            "all steps succeeded",
            vec![StepReport {
                id: "base-stack".to_string(),
                result: StepResult::Succeeded,
                attempts: 1,
            }],
        );
        let json = serde_json::to_string(&report).unwrap();
        assert!(json.contains("\"SUCCESS\""));
        let parsed: StatusReport = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.status, RunStatus::Success);
        assert_eq!(parsed.steps.len(), 1);
        assert_eq!(parsed.steps[0].result, StepResult::Succeeded);
    }

    #[test]
    fn test_notification_subject() {
        let identity = InstanceIdentity {
            instance_id: "i-0abc".to_string(),
            private_ip: "10.0.1.5".to_string(),
            public_ip: Some("3.91.1.2".to_string()),
            zone: "us-east-1a".to_string(),
            instance_class: "m6i.large".to_string(),
        };
        let event = NotificationEvent::failure(&identity, "step base-stack exhausted retries");
        assert_eq!(event.subject(), "[fleetforge] FAILED i-0abc");
        assert!(event.body().unwrap().contains("base-stack"));
    }
}
