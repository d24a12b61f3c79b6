//! Fleet Provider adapter.
//!
//! The orchestrator consumes this surface as a black box; the shipped
//! implementation shells out to the aws CLI. Every call is treated as
//! potentially slow, and unrecoverable errors abort the run rather than
//! retry indefinitely.

use cmd_lib::*;
use std::io::Error;

#[derive(Debug, Clone)]
pub struct ImageSelector {
    pub name_pattern: String,
    pub owner: String,
    pub architecture: String,
}

#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub image_id: String,
    pub instance_type: String,
    pub subnet_id: Option<String>,
    pub security_group_id: Option<String>,
    pub key_name: Option<String>,
    pub instance_profile: String,
    pub tags: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct Addresses {
    pub private: String,
    pub public: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleOutcome {
    Existed,
    Created,
}

pub trait FleetProvider {
    fn find_image(&self, selector: &ImageSelector) -> Result<String, Error>;
    /// Idempotent: checks existence before creating anything.
    fn ensure_instance_profile(&self, name: &str) -> Result<RoleOutcome, Error>;
    fn launch_instance(&self, spec: &LaunchSpec, user_data: &str) -> Result<String, Error>;
    fn wait_running(&self, instance_id: &str) -> Result<(), Error>;
    fn describe_addresses(&self, instance_id: &str) -> Result<Addresses, Error>;
    /// Allocation id of an already-allocated address with no association,
    /// if any. Never allocates a new one.
    fn find_unassociated_address(&self) -> Result<Option<String>, Error>;
    /// Returns the public address that is now attached.
    fn associate_address(&self, instance_id: &str, allocation_id: &str) -> Result<String, Error>;
    fn instance_state(&self, instance_id: &str) -> Result<String, Error>;
    fn terminate_instance(&self, instance_id: &str) -> Result<(), Error>;
    /// Bucket holding the bootstrap binary for this account/region.
    fn builds_bucket(&self) -> Result<String, Error>;
}

/// aws CLI implementation.
pub struct AwsCli {
    region: String,
}

impl AwsCli {
    pub fn new(region: &str) -> Self {
        Self {
            region: region.to_string(),
        }
    }
}

impl FleetProvider for AwsCli {
    fn find_image(&self, selector: &ImageSelector) -> Result<String, Error> {
        let region = &self.region;
        let name_filter = format!("Name=name,Values={}", selector.name_pattern);
        let arch_filter = format!("Name=architecture,Values={}", selector.architecture);
        let owner = &selector.owner;
        let image_id = run_fun!(
            aws ec2 describe-images --region $region
                --owners $owner
                --filters $name_filter $arch_filter "Name=state,Values=available"
                --query "sort_by(Images, &CreationDate)[-1].ImageId"
                --output text
        )?;
        let image_id = image_id.trim().to_string();
        if image_id.is_empty() || image_id == "None" {
            return Err(Error::other(format!(
                "no image matches pattern {:?} (owner {owner})",
                selector.name_pattern
            )));
        }
        Ok(image_id)
    }

    fn ensure_instance_profile(&self, name: &str) -> Result<RoleOutcome, Error> {
        let exists =
            run_cmd!(aws iam get-instance-profile --instance-profile-name $name &>/dev/null)
                .is_ok();
        if exists {
            info!("Instance profile {name} already exists");
            return Ok(RoleOutcome::Existed);
        }

        let trust_policy = r##"{
  "Version": "2012-10-17",
  "Statement": [
    {
      "Effect": "Allow",
      "Principal": { "Service": "ec2.amazonaws.com" },
      "Action": "sts:AssumeRole"
    }
  ]
}"##;
        let publish_policy = r##"{
  "Version": "2012-10-17",
  "Statement": [
    {
      "Effect": "Allow",
      "Action": "sns:Publish",
      "Resource": "*"
    }
  ]
}"##;
        run_cmd! {
            info "Creating role and instance profile $name";
            aws iam create-role
                --role-name $name
                --assume-role-policy-document $trust_policy >/dev/null;
            aws iam attach-role-policy
                --role-name $name
                --policy-arn "arn:aws:iam::aws:policy/AmazonSSMManagedInstanceCore";
            aws iam attach-role-policy
                --role-name $name
                --policy-arn "arn:aws:iam::aws:policy/AmazonS3ReadOnlyAccess";
            aws iam put-role-policy
                --role-name $name
                --policy-name "fleetforge-notify"
                --policy-document $publish_policy;
            aws iam create-instance-profile
                --instance-profile-name $name >/dev/null;
            aws iam add-role-to-instance-profile
                --instance-profile-name $name
                --role-name $name;
        }?;
        Ok(RoleOutcome::Created)
    }

    fn launch_instance(&self, spec: &LaunchSpec, user_data: &str) -> Result<String, Error> {
        let region = &self.region;
        let user_data_path = std::env::temp_dir().join("fleetforge-user-data.sh");
        std::fs::write(&user_data_path, user_data)?;
        let user_data_arg = format!("file://{}", user_data_path.display());

        let mut args: Vec<String> = Vec::new();
        let mut push = |flag: &str, value: &str| {
            args.push(flag.to_string());
            args.push(value.to_string());
        };
        push("--image-id", &spec.image_id);
        push("--instance-type", &spec.instance_type);
        push(
            "--iam-instance-profile",
            &format!("Name={}", spec.instance_profile),
        );
        if let Some(subnet) = &spec.subnet_id {
            push("--subnet-id", subnet);
        }
        if let Some(sg) = &spec.security_group_id {
            push("--security-group-ids", sg);
        }
        if let Some(key) = &spec.key_name {
            push("--key-name", key);
        }
        if !spec.tags.is_empty() {
            let tags = spec
                .tags
                .iter()
                .map(|(k, v)| format!("{{Key={k},Value={v}}}"))
                .collect::<Vec<_>>()
                .join(",");
            push(
                "--tag-specifications",
                &format!("ResourceType=instance,Tags=[{tags}]"),
            );
        }

        let instance_id = run_fun!(
            aws ec2 run-instances --region $region
                $[args]
                --user-data $user_data_arg
                --count 1
                --query "Instances[0].InstanceId"
                --output text
        )?;
        Ok(instance_id.trim().to_string())
    }

    fn wait_running(&self, instance_id: &str) -> Result<(), Error> {
        let region = &self.region;
        run_cmd! {
            info "Waiting for $instance_id to reach running state";
            aws ec2 wait instance-running --region $region --instance-ids $instance_id;
        }?;
        Ok(())
    }

    fn describe_addresses(&self, instance_id: &str) -> Result<Addresses, Error> {
        let region = &self.region;
        let output = run_fun!(
            aws ec2 describe-instances --region $region
                --instance-ids $instance_id
                --query "Reservations[0].Instances[0].[PrivateIpAddress, PublicIpAddress]"
                --output text
        )?;
        let mut fields = output.split_whitespace();
        let private = fields
            .next()
            .filter(|s| *s != "None")
            .ok_or_else(|| Error::other(format!("{instance_id} has no private address")))?
            .to_string();
        let public = fields
            .next()
            .filter(|s| *s != "None")
            .map(str::to_string);
        Ok(Addresses { private, public })
    }

    fn find_unassociated_address(&self) -> Result<Option<String>, Error> {
        let region = &self.region;
        let output = run_fun!(
            aws ec2 describe-addresses --region $region
                --query "Addresses[?AssociationId==null].AllocationId | [0]"
                --output text
        )?;
        let allocation_id = output.trim();
        if allocation_id.is_empty() || allocation_id == "None" {
            Ok(None)
        } else {
            Ok(Some(allocation_id.to_string()))
        }
    }

    fn associate_address(&self, instance_id: &str, allocation_id: &str) -> Result<String, Error> {
        let region = &self.region;
        run_cmd! {
            info "Associating address $allocation_id with $instance_id";
            aws ec2 associate-address --region $region
                --instance-id $instance_id
                --allocation-id $allocation_id >/dev/null;
        }?;
        let addresses = self.describe_addresses(instance_id)?;
        addresses
            .public
            .ok_or_else(|| Error::other(format!("{instance_id} still has no public address")))
    }

    fn instance_state(&self, instance_id: &str) -> Result<String, Error> {
        let region = &self.region;
        let state = run_fun!(
            aws ec2 describe-instances --region $region
                --instance-ids $instance_id
                --query "Reservations[0].Instances[0].State.Name"
                --output text
        )?;
        Ok(state.trim().to_string())
    }

    fn terminate_instance(&self, instance_id: &str) -> Result<(), Error> {
        let region = &self.region;
        run_cmd! {
            info "Terminating $instance_id";
            aws ec2 terminate-instances --region $region --instance-ids $instance_id >/dev/null;
        }?;
        Ok(())
    }

    fn builds_bucket(&self) -> Result<String, Error> {
        let account_id = run_fun!(aws sts get-caller-identity --query Account --output text)?;
        Ok(format!(
            "fleetforge-builds-{}-{}",
            self.region,
            account_id.trim()
        ))
    }
}
