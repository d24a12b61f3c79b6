//! Notification channel adapter.

use cmd_lib::*;
use fleetforge_common::protocol::{NotificationEvent, TopicArn};

pub trait Notifier {
    fn publish(&self, event: &NotificationEvent) -> CmdResult;
}

/// Publishes events to an SNS topic through the aws CLI.
pub struct SnsNotifier {
    topic: TopicArn,
}

impl SnsNotifier {
    pub fn new(topic: TopicArn) -> Self {
        Self { topic }
    }
}

impl Notifier for SnsNotifier {
    fn publish(&self, event: &NotificationEvent) -> CmdResult {
        let topic_arn = self.topic.to_string();
        let region = &self.topic.region;
        let subject = event.subject();
        let message = event.body()?;
        run_cmd! {
            info "Publishing $subject to $topic_arn";
            aws sns publish
                --region $region
                --topic-arn $topic_arn
                --subject $subject
                --message $message
                >/dev/null;
        }?;
        Ok(())
    }
}
