//!
//! This module defines the narrow interface through which the client talks to the external broker.
//!
//! Implementations translate each call to the broker's wire protocol. The client never retries
//! a call, every administrative call is bounded by [`ADMIN_CALL_TIMEOUT`].
//!
use crate::error::ClientError;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

/// Upper bound of every create/lookup/configure/publish/delete call.
pub const ADMIN_CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Delivery protocol used when binding a queue to a topic.
pub const QUEUE_PROTOCOL: &str = "sqs";

pub const ATTR_DELAY_SECONDS: &str = "DelaySeconds";
pub const ATTR_MESSAGE_RETENTION_PERIOD: &str = "MessageRetentionPeriod";
pub const ATTR_QUEUE_ARN: &str = "QueueArn";
pub const ATTR_POLICY: &str = "Policy";
pub const ATTR_REDRIVE_POLICY: &str = "RedrivePolicy";

/// System attribute requested on receive.
pub const ATTR_SENT_TIMESTAMP: &str = "SentTimestamp";

/// Message attribute selector requesting every user attribute.
pub const ALL_MESSAGE_ATTRIBUTES: &str = "All";

pub const STRING_DATA_TYPE: &str = "String";

/// Typed user attribute attached to a published or received message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageAttributeValue {
    pub data_type: String,
    pub string_value: String,
}

impl MessageAttributeValue {
    pub fn string(value: &str) -> Self {
        Self {
            data_type: STRING_DATA_TYPE.to_owned(),
            string_value: value.to_owned(),
        }
    }
}

/// A message as handed out by the queue, before any decoding.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawMessage {
    pub message_id: String,

    /// Handle identifying this particular delivery; required to delete the message.
    pub receipt_handle: String,

    pub body: Bytes,

    /// System attributes, e.g. `SentTimestamp`.
    pub attributes: HashMap<String, String>,

    pub message_attributes: HashMap<String, MessageAttributeValue>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReceiveRequest {
    pub queue_url: String,
    pub max_messages: usize,
    pub visibility_timeout: Duration,
    pub wait_time: Duration,
    pub attribute_names: Vec<String>,
    pub message_attribute_names: Vec<String>,
}

#[async_trait]
pub trait BrokerApi: Send + Sync {
    /// Create a topic, or return the identifier of the existing topic with the same name.
    async fn create_topic(&self, name: &str) -> Result<String, ClientError>;

    /// Look up a queue address.
    ///
    /// # Errors
    /// `ClientError::QueueDoesNotExist` when no queue carries that name.
    async fn get_queue_url(&self, name: &str) -> Result<String, ClientError>;

    async fn create_queue(
        &self,
        name: &str,
        attributes: HashMap<String, String>,
    ) -> Result<String, ClientError>;

    async fn get_queue_attributes(
        &self,
        queue_url: &str,
        names: &[&str],
    ) -> Result<HashMap<String, String>, ClientError>;

    async fn set_queue_attributes(
        &self,
        queue_url: &str,
        attributes: HashMap<String, String>,
    ) -> Result<(), ClientError>;

    async fn subscribe(
        &self,
        topic_arn: &str,
        protocol: &str,
        endpoint: &str,
    ) -> Result<String, ClientError>;

    async fn set_subscription_attributes(
        &self,
        subscription_arn: &str,
        name: &str,
        value: &str,
    ) -> Result<(), ClientError>;

    async fn publish(
        &self,
        topic_arn: &str,
        body: &str,
        attributes: HashMap<String, MessageAttributeValue>,
    ) -> Result<String, ClientError>;

    async fn receive_messages(&self, request: ReceiveRequest) -> Result<Vec<RawMessage>, ClientError>;

    async fn delete_message(&self, queue_url: &str, receipt_handle: &str) -> Result<(), ClientError>;
}

/// Run a broker call under `limit`, mapping expiry to `ClientError::Timeout(operation)`.
pub(crate) async fn bounded<T, F>(operation: &'static str, limit: Duration, call: F) -> Result<T, ClientError>
where
    F: Future<Output = Result<T, ClientError>>,
{
    tokio::time::timeout(limit, call)
        .await
        .map_err(|_e| ClientError::Timeout(operation))?
}
