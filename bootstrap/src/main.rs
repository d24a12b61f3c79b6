mod notify;
mod pipeline;
mod steps;

use cmd_lib::*;
use fleetforge_common::protocol::{
    COMPLETION_MARKER, NotificationEvent, RunStatus, StatusReport, TopicArn,
};
use notify::{Notifier, SnsNotifier};
use pipeline::PipelineRun;
use std::io::{self, Write};

#[cmd_lib::main]
fn main() -> CmdResult {
    env_logger::Builder::new()
        .format(|buf, record| {
            let timestamp = chrono::Local::now().format("%b %d %H:%M:%S").to_string();
            let pid = std::process::id();
            writeln!(
                buf,
                "{} fleetforge-bootstrap[{}]: {} {}",
                timestamp,
                pid,
                record.level(),
                record.args()
            )
        })
        .filter(None, log::LevelFilter::Info)
        .init();

    let build_info = option_env!("BUILD_TIMESTAMP").unwrap_or("unknown");
    eprintln!("build time: {build_info}");

    let topic = TopicArn::parse(
        &std::env::var("FLEETFORGE_TOPIC_ARN")
            .map_err(|_| io::Error::other("FLEETFORGE_TOPIC_ARN is not set"))?,
    )?;
    let notifier = SnsNotifier::new(topic);
    let identity = steps::discover_identity()?;
    info!(
        "Bootstrapping {} ({}) in {}",
        identity.instance_id, identity.instance_class, identity.zone
    );

    // Global error trap: any uncaught pipeline failure routes to the
    // failure-notification path before the process exits. A critical step
    // already reports itself, so the same fault may be published twice.
    match run_pipeline(&identity, &notifier) {
        Ok(()) => Ok(()),
        Err(e) => {
            let event = NotificationEvent::failure(&identity, format!("bootstrap aborted: {e}"));
            if let Err(notify_err) = notifier.publish(&event) {
                warn!("could not publish abort notification: {notify_err}");
            }
            Err(e)
        }
    }
}

fn run_pipeline(
    identity: &fleetforge_common::protocol::InstanceIdentity,
    notifier: &dyn Notifier,
) -> CmdResult {
    let mut run = PipelineRun::new(steps::install_steps(identity));
    let result = run.execute(identity, notifier);

    match result {
        Ok(()) => {
            let report = StatusReport::new(
                RunStatus::Success,
                "all pipeline steps reached a terminal state",
                run.step_reports(),
            );
            steps::write_status_report(&report)?;
            notifier.publish(&NotificationEvent::success(
                identity,
                "bootstrap pipeline completed",
            ))?;
            // Literal marker scraped by the legacy monitoring path.
            info!("{COMPLETION_MARKER}");
            Ok(())
        }
        Err(e) => {
            let report = StatusReport::new(RunStatus::Failed, e.to_string(), run.step_reports());
            if let Err(status_err) = steps::write_status_report(&report) {
                warn!("could not write status report: {status_err}");
            }
            Err(e)
        }
    }
}
