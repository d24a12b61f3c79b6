//! Launch orchestration: a linear sequence of gated stages. A later stage
//! never begins until the former's postcondition holds, and failures leave
//! the resource in place for inspection (the caller prints the manual
//! teardown command).

use crate::config::Config;
use crate::error::{OrchestratorError, Result};
use crate::payload::PayloadTemplate;
use crate::provider::{FleetProvider, LaunchSpec, RoleOutcome};
use crate::run_record::RunRecordStore;
use log::info;

#[derive(Debug, Clone)]
pub struct LaunchOutcome {
    pub run_id: String,
    pub instance_id: String,
    pub private_ip: String,
    pub public_ip: String,
}

pub fn launch(
    cfg: &Config,
    provider: &dyn FleetProvider,
    records: &RunRecordStore,
) -> Result<LaunchOutcome> {
    // Image resolution: most recently created match wins.
    let image_id = provider
        .find_image(&cfg.image_selector())
        .map_err(OrchestratorError::Provider)?;
    info!("Resolved image {image_id}");

    // Identity ensure, with the propagation delay only on fresh creation.
    let outcome = provider
        .ensure_instance_profile(&cfg.instance_profile)
        .map_err(OrchestratorError::Provider)?;
    if outcome == RoleOutcome::Created {
        info!(
            "Instance profile {} is new; waiting {}s for identity propagation",
            cfg.instance_profile,
            cfg.role_propagation_delay.as_secs()
        );
        std::thread::sleep(cfg.role_propagation_delay);
    }

    // Payload rendered exactly once before submission.
    let builds_bucket = match &cfg.builds_bucket {
        Some(bucket) => bucket.clone(),
        None => provider
            .builds_bucket()
            .map_err(OrchestratorError::Provider)?,
    };
    let user_data = PayloadTemplate {
        topic: cfg.topic.clone(),
        region: cfg.region.clone(),
        builds_bucket,
    }
    .render();

    let run_id = records.new_run_id();
    let spec = LaunchSpec {
        image_id,
        instance_type: cfg.instance_type.clone(),
        subnet_id: cfg.subnet_id.clone(),
        security_group_id: cfg.security_group_id.clone(),
        key_name: cfg.key_name.clone(),
        instance_profile: cfg.instance_profile.clone(),
        tags: vec![
            ("Name".to_string(), format!("fleetforge-{run_id}")),
            ("fleetforge:run".to_string(), run_id.clone()),
        ],
    };
    let instance_id = provider
        .launch_instance(&spec, &user_data)
        .map_err(OrchestratorError::Provider)?;
    info!("Launched {instance_id} (run {run_id})");
    records.record_instance(&run_id, &instance_id)?;

    provider
        .wait_running(&instance_id)
        .map_err(OrchestratorError::Provider)?;

    let addresses = provider
        .describe_addresses(&instance_id)
        .map_err(OrchestratorError::Provider)?;
    let public_ip = match addresses.public {
        Some(ip) => ip,
        // Only an already-allocated, unassociated address may be attached;
        // allocating a new one here would be an unbounded cost.
        None => {
            let allocation_id = provider
                .find_unassociated_address()
                .map_err(OrchestratorError::Provider)?
                .ok_or_else(|| {
                    OrchestratorError::Provider(std::io::Error::other(
                        "no public address attached and no unassociated elastic address \
                         available; allocate one and re-run, or associate it manually",
                    ))
                })?;
            provider
                .associate_address(&instance_id, &allocation_id)
                .map_err(OrchestratorError::Provider)?
        }
    };
    records.record_public_ip(&run_id, &public_ip)?;

    Ok(LaunchOutcome {
        run_id,
        instance_id,
        private_ip: addresses.private,
        public_ip,
    })
}
