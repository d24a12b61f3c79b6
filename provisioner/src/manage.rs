//! Management companion: operations on a previously provisioned instance,
//! addressed through the persisted run record.

use crate::error::Result;
use crate::monitor::SsmChannel;
use crate::provider::FleetProvider;
use crate::run_record::{RunRecord, RunRecordStore};
use cmd_lib::*;
use colored::*;
use dialoguer::Input;
use fleetforge_common::protocol::{self, CONSOLE_PORT};
use std::io::Error;

fn resolve_run(records: &RunRecordStore, run_id: Option<&str>) -> Result<RunRecord> {
    Ok(records.resolve(run_id)?)
}

fn channel(region: &str, record: &RunRecord) -> Result<SsmChannel> {
    let public_ip = record
        .public_ip
        .clone()
        .ok_or_else(|| Error::other("run record has no public address yet"))?;
    Ok(SsmChannel::new(region, &record.instance_id, &public_ip))
}

pub fn status(
    region: &str,
    provider: &dyn FleetProvider,
    records: &RunRecordStore,
    run_id: Option<&str>,
) -> Result<()> {
    let record = resolve_run(records, run_id)?;
    let state = provider.instance_state(&record.instance_id)?;

    println!("{}", format!("Run {}", record.run_id).bold());
    println!("  Instance: {}", record.instance_id);
    println!(
        "  Public IP: {}",
        record.public_ip.as_deref().unwrap_or("(none)")
    );
    let state_display = match state.as_str() {
        "running" => state.green(),
        "pending" => state.yellow(),
        _ => state.red(),
    };
    println!("  State: {state_display}");

    if state == "running"
        && let Ok(channel) = channel(region, &record)
        && let Some(report) = crate::monitor::RemoteChannel::read_status(&channel)
    {
        println!("  Bootstrap: {:?}", report.status);
        for step in &report.steps {
            println!(
                "    {:<20} {:?} (attempts: {})",
                step.id, step.result, step.attempts
            );
        }
    }
    Ok(())
}

pub fn ssh(region: &str, records: &RunRecordStore, run_id: Option<&str>) -> Result<()> {
    let record = resolve_run(records, run_id)?;
    let instance_id = &record.instance_id;
    run_cmd! {
        info "Opening session to $instance_id";
        aws ssm start-session --region $region --target $instance_id;
    }?;
    Ok(())
}

pub fn logs(region: &str, records: &RunRecordStore, run_id: Option<&str>) -> Result<()> {
    let record = resolve_run(records, run_id)?;
    let channel = channel(region, &record)?;
    let tail = channel.run_remote(&format!("tail -n 100 {}", protocol::BOOTSTRAP_LOG))?;
    println!("{tail}");
    Ok(())
}

pub fn cockpit(records: &RunRecordStore, run_id: Option<&str>) -> Result<()> {
    let record = resolve_run(records, run_id)?;
    let url = console_url(&record)?;
    run_cmd! {
        info "Opening $url";
        xdg-open $url;
    }?;
    Ok(())
}

pub fn services(region: &str, records: &RunRecordStore, run_id: Option<&str>) -> Result<()> {
    let record = resolve_run(records, run_id)?;
    let channel = channel(region, &record)?;
    let output = channel.run_remote(
        "systemctl list-units --type=service,socket --state=active --no-pager --no-legend",
    )?;
    println!("{output}");
    Ok(())
}

pub fn runs(records: &RunRecordStore) -> Result<()> {
    let latest = records.latest_run_id()?;
    for run_id in records.list_runs()? {
        let marker = if latest.as_deref() == Some(run_id.as_str()) {
            " (latest)"
        } else {
            ""
        };
        match records.load(&run_id) {
            Ok(record) => println!(
                "{run_id}{marker}  {}  {}",
                record.instance_id,
                record.public_ip.as_deref().unwrap_or("-")
            ),
            Err(_) => println!("{run_id}{marker}  (unreadable record)"),
        }
    }
    Ok(())
}

pub fn terminate(
    provider: &dyn FleetProvider,
    records: &RunRecordStore,
    run_id: Option<&str>,
) -> Result<()> {
    let record = resolve_run(records, run_id)?;
    let instance_id = record.instance_id.clone();

    warn!("This will permanently terminate {instance_id} and its data!");
    let _confirmation: String = Input::new()
        .with_prompt(format!(
            "Type {} to confirm termination",
            instance_id.bold()
        ))
        .validate_with(|input: &String| -> std::result::Result<(), String> {
            if *input == instance_id {
                Ok(())
            } else {
                Err(format!("You must type {instance_id} exactly to confirm"))
            }
        })
        .interact_text()
        .map_err(|e| Error::other(format!("Failed to read confirmation: {e}")))?;

    provider.terminate_instance(&record.instance_id)?;
    info!("Instance {} is terminating", record.instance_id);
    Ok(())
}

pub fn console_url(record: &RunRecord) -> Result<String> {
    let public_ip = record
        .public_ip
        .as_deref()
        .ok_or_else(|| Error::other("run record has no public address yet"))?;
    Ok(format!("https://{public_ip}:{CONSOLE_PORT}/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_console_url_from_record() {
        let record = RunRecord {
            run_id: "run-a".to_string(),
            instance_id: "i-0abc".to_string(),
            public_ip: Some("3.91.1.2".to_string()),
        };
        assert_eq!(console_url(&record).unwrap(), "https://3.91.1.2:9090/");
    }

    #[test]
    fn test_console_url_requires_public_address() {
        let record = RunRecord {
            run_id: "run-a".to_string(),
            instance_id: "i-0abc".to_string(),
            public_ip: None,
        };
        assert!(console_url(&record).is_err());
    }
}
