mod config;
mod error;
mod manage;
mod monitor;
mod orchestrate;
mod payload;
mod provider;
mod run_record;

use clap::Parser;
use cmd_lib::*;
use colored::*;
use config::Config;
use dialoguer::Confirm;
use error::OrchestratorError;
use monitor::{MonitorConfig, MonitorOutcome, SsmChannel};
use orchestrate::LaunchOutcome;
use provider::AwsCli;
use run_record::RunRecordStore;
use std::io::Error;

#[derive(Parser)]
#[clap(
    name = "fleetforge",
    about = "Provision a fleetforge host and manage it afterwards"
)]
enum Cmd {
    #[clap(about = "Provision a new instance and run the first-boot pipeline")]
    Launch,

    #[clap(about = "Show instance and bootstrap status")]
    Status {
        #[clap(long, long_help = "Run id (defaults to the most recent run)")]
        run: Option<String>,
    },

    #[clap(about = "Open an interactive session on the instance")]
    Ssh {
        #[clap(long, long_help = "Run id (defaults to the most recent run)")]
        run: Option<String>,
    },

    #[clap(about = "Tail the bootstrap log")]
    Logs {
        #[clap(long, long_help = "Run id (defaults to the most recent run)")]
        run: Option<String>,
    },

    #[clap(about = "Open the web console in a local browser")]
    Cockpit {
        #[clap(long, long_help = "Run id (defaults to the most recent run)")]
        run: Option<String>,
    },

    #[clap(about = "List active services on the instance")]
    Services {
        #[clap(long, long_help = "Run id (defaults to the most recent run)")]
        run: Option<String>,
    },

    #[clap(about = "List recorded runs")]
    Runs,

    #[clap(about = "Terminate the instance (asks for confirmation)")]
    Terminate {
        #[clap(long, long_help = "Run id (defaults to the most recent run)")]
        run: Option<String>,
    },
}

#[cmd_lib::main]
fn main() -> CmdResult {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_target(false)
        .init();

    let records = RunRecordStore::open_default()?;

    // Only launch needs the full configuration (and its notification-channel
    // precondition); the management subcommands just need a region.
    match Cmd::parse() {
        Cmd::Launch => {
            let cfg = Config::load().map_err(to_io)?;
            let provider = AwsCli::new(&cfg.region);
            run_launch(&cfg, &provider, &records).map_err(to_io)?
        }
        Cmd::Status { run } => {
            let region = config::region_only().map_err(to_io)?;
            let provider = AwsCli::new(&region);
            manage::status(&region, &provider, &records, run.as_deref()).map_err(to_io)?
        }
        Cmd::Ssh { run } => {
            let region = config::region_only().map_err(to_io)?;
            manage::ssh(&region, &records, run.as_deref()).map_err(to_io)?
        }
        Cmd::Logs { run } => {
            let region = config::region_only().map_err(to_io)?;
            manage::logs(&region, &records, run.as_deref()).map_err(to_io)?
        }
        Cmd::Cockpit { run } => manage::cockpit(&records, run.as_deref()).map_err(to_io)?,
        Cmd::Services { run } => {
            let region = config::region_only().map_err(to_io)?;
            manage::services(&region, &records, run.as_deref()).map_err(to_io)?
        }
        Cmd::Runs => manage::runs(&records).map_err(to_io)?,
        Cmd::Terminate { run } => {
            let region = config::region_only().map_err(to_io)?;
            let provider = AwsCli::new(&region);
            manage::terminate(&provider, &records, run.as_deref()).map_err(to_io)?
        }
    }
    Ok(())
}

fn to_io(e: OrchestratorError) -> Error {
    Error::other(e.to_string())
}

fn run_launch(cfg: &Config, provider: &AwsCli, records: &RunRecordStore) -> error::Result<()> {
    // Used to tell a record written by this launch apart from one left over
    // from an earlier run, so failure hints never point at the wrong instance.
    let prior_run = records.latest_run_id()?;
    install_interrupt_hint(prior_run.clone());

    let outcome = match orchestrate::launch(cfg, provider, records) {
        Ok(outcome) => outcome,
        Err(e) => {
            print_teardown_hint(records, prior_run.as_deref());
            return Err(e);
        }
    };

    print_access_summary(&outcome);

    if !want_monitoring() {
        info!("Monitoring declined; completion will arrive on the notification channel");
        info!("Check progress later with: fleetforge status");
        return Ok(());
    }

    let channel = SsmChannel::new(&cfg.region, &outcome.instance_id, &outcome.public_ip);
    match monitor::watch(&channel, &MonitorConfig::default())? {
        MonitorOutcome::Completed => {
            println!("{}", "Bootstrap completed".green().bold());
            let record = records.resolve(Some(&outcome.run_id))?;
            let url = manage::console_url(&record)?;
            run_cmd!(xdg-open $url).unwrap_or_else(|_| info!("Console ready at {url}"));
            Ok(())
        }
        MonitorOutcome::Degraded(detail) => {
            println!("{} {detail}", "Degraded success:".yellow().bold());
            info!(
                "Check the notification channel {} for the final report",
                cfg.topic
            );
            Ok(())
        }
        MonitorOutcome::Unknown(detail) => {
            println!("{} {detail}", "Monitoring inconclusive:".yellow().bold());
            Ok(())
        }
        MonitorOutcome::BootstrapFailed(detail) => {
            print_teardown_hint(records, prior_run.as_deref());
            Err(OrchestratorError::VerificationTimeout(format!(
                "bootstrap pipeline reported failure: {detail}; \
                 inspect the log with: fleetforge logs"
            )))
        }
    }
}

fn want_monitoring() -> bool {
    if std::env::var("FLEETFORGE_NO_WATCH").is_ok_and(|v| v == "1" || v == "true") {
        return false;
    }
    Confirm::new()
        .with_prompt("Watch bootstrap progress now?")
        .default(true)
        .interact()
        .unwrap_or(false)
}

fn print_access_summary(outcome: &LaunchOutcome) {
    println!();
    println!("{}", "Instance provisioned".green().bold());
    println!("  Run id: {}", outcome.run_id);
    println!("  Instance: {}", outcome.instance_id);
    println!("  Private IP: {}", outcome.private_ip);
    println!("  Public IP: {}", outcome.public_ip);
    println!(
        "  Console: https://{}:{}/",
        outcome.public_ip,
        fleetforge_common::protocol::CONSOLE_PORT
    );
    println!("  Session: fleetforge ssh");
    println!();
}

/// Interrupts and failures share the abort path: the instance is left in
/// place for inspection and the manual teardown command is printed.
fn install_interrupt_hint(prior_run: Option<String>) {
    let result = ctrlc::set_handler(move || {
        eprintln!();
        eprintln!("Interrupted; any launched instance is left running.");
        if let Ok(records) = RunRecordStore::open_default() {
            print_teardown_hint(&records, prior_run.as_deref());
        }
        std::process::exit(1);
    });
    if let Err(e) = result {
        warn!("could not install interrupt handler: {e}");
    }
}

/// Prints the manual cleanup command for the instance launched by THIS run.
/// Quiet when nothing was recorded yet, or when the latest record predates
/// this invocation.
fn print_teardown_hint(records: &RunRecordStore, prior_run: Option<&str>) {
    let latest = records.latest_run_id().ok().flatten();
    if latest.as_deref() == prior_run {
        return;
    }
    if let Ok(record) = records.resolve(None) {
        eprintln!(
            "Instance {} is left for inspection. To clean up manually:",
            record.instance_id
        );
        eprintln!(
            "  aws ec2 terminate-instances --instance-ids {}",
            record.instance_id
        );
    }
}
