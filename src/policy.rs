//!
//! Queue access and redrive documents pushed as queue attributes.
//!
use crate::error::ClientError;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const POLICY_VERSION: &str = "2012-10-17";
pub const SEND_MESSAGE_ACTION: &str = "SQS:SendMessage";
pub const TOPIC_ARN_CONDITION_KEY: &str = "aws:TopicArn";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct QueuePolicy {
    pub version: String,
    pub id: String,
    pub statement: Vec<PolicyStatement>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct PolicyStatement {
    pub sid: String,
    pub effect: String,
    pub principal: BTreeMap<String, String>,
    pub action: String,
    pub resource: String,
    pub condition: PolicyCondition,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct PolicyCondition {
    #[serde(rename = "ArnEquals", default)]
    pub arn_equals: BTreeMap<String, String>,
}

impl QueuePolicy {
    /// Let any principal send into `queue_arn`, provided the message comes from `topic_arn`.
    pub fn allow_topic(queue_arn: &str, topic_arn: &str) -> Self {
        let statement = PolicyStatement {
            sid: format!("Sid{}", Utc::now().format("%Y")),
            effect: "Allow".to_owned(),
            principal: BTreeMap::from([("AWS".to_owned(), "*".to_owned())]),
            action: SEND_MESSAGE_ACTION.to_owned(),
            resource: queue_arn.to_owned(),
            condition: PolicyCondition {
                arn_equals: BTreeMap::from([(
                    TOPIC_ARN_CONDITION_KEY.to_owned(),
                    topic_arn.to_owned(),
                )]),
            },
        };
        Self {
            version: POLICY_VERSION.to_owned(),
            id: format!("{}/SQSDefaultPolicy", queue_arn),
            statement: vec![statement],
        }
    }

    pub fn allows_topic(&self, topic_arn: &str) -> bool {
        self.statement.iter().any(|statement| {
            statement.effect == "Allow"
                && statement.action == SEND_MESSAGE_ACTION
                && statement.condition.arn_equals.get(TOPIC_ARN_CONDITION_KEY).map(String::as_str)
                    == Some(topic_arn)
        })
    }

    pub fn to_json(&self) -> Result<String, ClientError> {
        serde_json::to_string(self).map_err(|e| ClientError::Encode {
            what: "queue policy",
            source: e,
        })
    }
}

/// Redirect messages to a dead-letter queue once they were received `max_receive_count` times.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RedrivePolicy {
    pub dead_letter_target_arn: String,
    pub max_receive_count: u32,
}

impl RedrivePolicy {
    pub fn new(dead_letter_target_arn: &str, max_receive_count: u32) -> Self {
        Self {
            dead_letter_target_arn: dead_letter_target_arn.to_owned(),
            max_receive_count,
        }
    }

    pub fn to_json(&self) -> Result<String, ClientError> {
        serde_json::to_string(self).map_err(|e| ClientError::Encode {
            what: "redrive policy",
            source: e,
        })
    }
}
