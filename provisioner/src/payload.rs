//! Bootstrap payload template.
//!
//! A typed template rendered exactly once before submission; the rendered
//! script is handed to the instance as user data. It records the channel
//! identifier and region, pulls the bootstrap binary from the builds bucket,
//! and tees its output into the well-known log file.

use fleetforge_common::protocol::{
    BIN_PATH, BOOTSTRAP_ENV_FILE, BOOTSTRAP_LOG, ETC_PATH, TopicArn,
};

#[derive(Debug, Clone)]
pub struct PayloadTemplate {
    pub topic: TopicArn,
    pub region: String,
    pub builds_bucket: String,
}

impl PayloadTemplate {
    pub fn render(&self) -> String {
        let topic_arn = self.topic.to_string();
        let region = &self.region;
        let bucket = &self.builds_bucket;
        format!(
            r##"#!/bin/bash
set -euo pipefail

mkdir -p {BIN_PATH} {ETC_PATH}

cat > {BOOTSTRAP_ENV_FILE} <<EOF
FLEETFORGE_TOPIC_ARN={topic_arn}
AWS_DEFAULT_REGION={region}
EOF

aws s3 cp --no-progress s3://{bucket}/$(arch)/fleetforge-bootstrap {BIN_PATH}
chmod +x {BIN_PATH}fleetforge-bootstrap

set -a
source {BOOTSTRAP_ENV_FILE}
set +a
{BIN_PATH}fleetforge-bootstrap 2>&1 | tee -a {BOOTSTRAP_LOG}
"##
        )
    }
}
