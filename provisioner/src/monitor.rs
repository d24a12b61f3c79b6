//! Synchronous bootstrap monitoring.
//!
//! Primary path: wait for the remote-command channel, then poll for
//! completion, preferring the structured status document and falling back
//! to scraping the log for the literal marker or an error keyword. When the
//! budget runs out, a secondary verification probes the service endpoint
//! directly: a reachable endpoint is sufficient for (degraded) success even
//! if the remote-command channel is unhealthy, since service availability is
//! the primary goal.

use crate::error::Result;
use cmd_lib::*;
use fleetforge_common::protocol::{
    self, CONSOLE_PORT, RunStatus, STATUS_FILE, StatusReport,
};
use std::io::Error;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub ready_attempts: u32,
    pub ready_interval: Duration,
    pub completion_checks: u32,
    pub completion_interval: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            ready_attempts: 30,
            ready_interval: Duration::from_secs(10),
            completion_checks: 60,
            completion_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorOutcome {
    /// Bootstrap reported completion through the status or log channel.
    Completed,
    /// The pipeline reported a failure; detail names the evidence.
    BootstrapFailed(String),
    /// Primary monitoring exhausted, but the endpoint answered.
    Degraded(String),
    /// Nothing definitive; the notification channel has the last word.
    Unknown(String),
}

pub trait RemoteChannel {
    fn command_ready(&self) -> bool;
    fn read_status(&self) -> Option<StatusReport>;
    fn read_log_tail(&self) -> Option<String>;
    fn probe_endpoint(&self) -> bool;
}

pub fn watch(channel: &dyn RemoteChannel, cfg: &MonitorConfig) -> Result<MonitorOutcome> {
    let mut ready = false;
    for attempt in 1..=cfg.ready_attempts {
        if channel.command_ready() {
            info!("Remote command channel ready after {attempt} check(s)");
            ready = true;
            break;
        }
        std::thread::sleep(cfg.ready_interval);
    }

    if ready {
        for check in 1..=cfg.completion_checks {
            if let Some(report) = channel.read_status() {
                return Ok(match report.status {
                    RunStatus::Success => MonitorOutcome::Completed,
                    RunStatus::Failed => MonitorOutcome::BootstrapFailed(report.detail),
                });
            }
            if let Some(tail) = channel.read_log_tail() {
                if protocol::log_signals_completion(&tail) {
                    info!("Completion marker found on check {check}");
                    return Ok(MonitorOutcome::Completed);
                }
                if protocol::log_signals_failure(&tail) {
                    return Ok(MonitorOutcome::BootstrapFailed(format!(
                        "log shows a failure keyword (check {check}); inspect {}",
                        protocol::BOOTSTRAP_LOG
                    )));
                }
            }
            std::thread::sleep(cfg.completion_interval);
        }
        info!(
            "No completion signal after {} checks; probing the endpoint directly",
            cfg.completion_checks
        );
    } else {
        info!("Remote command channel never became ready; probing the endpoint directly");
    }

    // Secondary verification.
    if channel.probe_endpoint() {
        let detail = if channel.command_ready() {
            "endpoint reachable; completion signal missing".to_string()
        } else {
            "endpoint reachable; remote command channel unhealthy".to_string()
        };
        return Ok(MonitorOutcome::Degraded(detail));
    }

    Ok(MonitorOutcome::Unknown(
        "no completion signal and endpoint unreachable; check the notification channel".to_string(),
    ))
}

/// SSM-backed remote channel for a launched instance.
pub struct SsmChannel {
    region: String,
    instance_id: String,
    public_ip: String,
}

impl SsmChannel {
    pub fn new(region: &str, instance_id: &str, public_ip: &str) -> Self {
        Self {
            region: region.to_string(),
            instance_id: instance_id.to_string(),
            public_ip: public_ip.to_string(),
        }
    }

    /// Run one shell command on the instance and collect its stdout.
    pub fn run_remote(&self, command: &str) -> FunResult {
        let region = &self.region;
        let instance_id = &self.instance_id;
        let command_id = run_fun!(
            aws ssm send-command --region $region
                --document-name "AWS-RunShellScript"
                --targets "Key=InstanceIds,Values=$instance_id"
                --parameters commands="$command"
                --timeout-seconds 60
                --query "Command.CommandId"
                --output text
        )?;
        let command_id = command_id.trim().to_string();

        let start = Instant::now();
        let timeout = Duration::from_secs(60);
        loop {
            if start.elapsed() > timeout {
                return Err(Error::other(format!(
                    "remote command {command_id} did not finish within 60s"
                )));
            }
            let status = run_fun!(
                aws ssm get-command-invocation --region $region
                    --command-id $command_id
                    --instance-id $instance_id
                    --query "Status"
                    --output text
                    2>/dev/null
            )
            .unwrap_or_else(|_| "Pending".to_string());
            match status.trim() {
                "Success" => break,
                "Failed" | "Cancelled" | "TimedOut" => {
                    return Err(Error::other(format!(
                        "remote command {command_id} ended as {}",
                        status.trim()
                    )));
                }
                _ => std::thread::sleep(Duration::from_secs(2)),
            }
        }

        run_fun!(
            aws ssm get-command-invocation --region $region
                --command-id $command_id
                --instance-id $instance_id
                --query "StandardOutputContent"
                --output text
        )
    }
}

impl RemoteChannel for SsmChannel {
    fn command_ready(&self) -> bool {
        let region = &self.region;
        let instance_id = &self.instance_id;
        let output = run_fun!(
            aws ssm describe-instance-information --region $region
                --filters "Key=InstanceIds,Values=$instance_id"
                --query "InstanceInformationList[].InstanceId"
                --output text
                2>/dev/null
        )
        .unwrap_or_default();
        output.contains(instance_id)
    }

    fn read_status(&self) -> Option<StatusReport> {
        let content = self
            .run_remote(&format!("cat {STATUS_FILE} 2>/dev/null || true"))
            .ok()?;
        serde_json::from_str(&content).ok()
    }

    fn read_log_tail(&self) -> Option<String> {
        self.run_remote(&format!(
            "tail -n 200 {} 2>/dev/null || true",
            protocol::BOOTSTRAP_LOG
        ))
        .ok()
    }

    fn probe_endpoint(&self) -> bool {
        let url = format!("https://{}:{}/", self.public_ip, CONSOLE_PORT);
        run_cmd!(curl -skf --max-time 10 -o /dev/null $url).is_ok()
    }
}
