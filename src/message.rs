use crate::broker::{RawMessage, ATTR_SENT_TIMESTAMP};
use crate::error::ClientError;
use async_trait::async_trait;
use bytes::Buf;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Typed attribute as rendered inside a notification document.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct NotificationAttribute {
    #[serde(rename = "Type")]
    pub data_type: String,

    #[serde(rename = "Value")]
    pub value: String,
}

/// Document a topic writes into a subscribed queue for every published message.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct Notification {
    #[serde(default)]
    pub r#type: String,

    #[serde(default)]
    pub message_id: String,

    /// Identifier of the topic the message was published to.
    #[serde(default)]
    pub topic_arn: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,

    /// Application payload, exactly as published.
    #[serde(default)]
    pub message: String,

    #[serde(default)]
    pub timestamp: String,

    #[serde(default)]
    pub signature_version: String,

    #[serde(default)]
    pub signature: String,

    #[serde(default, rename = "SigningCertURL")]
    pub signing_cert_url: String,

    #[serde(default, rename = "UnsubscribeURL")]
    pub unsubscribe_url: String,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub message_attributes: HashMap<String, NotificationAttribute>,
}

/// Deletes a consumed message from the queue it was received from.
#[async_trait]
pub trait MessageRemover: Send + Sync {
    async fn remove(&self, message: &Message) -> Result<(), ClientError>;
}

/// A received message: the raw delivery, its decoded notification and the means to acknowledge it.
#[derive(Clone)]
pub struct Message {
    raw: RawMessage,
    notification: Notification,
    remover: Arc<dyn MessageRemover>,
}

impl Message {
    pub fn new(raw: RawMessage, notification: Notification, remover: Arc<dyn MessageRemover>) -> Self {
        Self {
            raw,
            notification,
            remover,
        }
    }

    /// Decode a raw delivery.
    ///
    /// Returns `Ok(None)` for an empty body, or a body that carries no notification field at all.
    ///
    /// # Errors
    /// `ClientError::Decode` if the body is not a JSON notification document.
    pub(crate) fn decode(
        raw: RawMessage,
        remover: Arc<dyn MessageRemover>,
    ) -> Result<Option<Self>, ClientError> {
        if raw.body.is_empty() {
            return Ok(None);
        }
        let notification: Notification =
            serde_json::from_reader(raw.body.clone().reader()).map_err(ClientError::Decode)?;
        if notification == Notification::default() {
            return Ok(None);
        }
        Ok(Some(Self::new(raw, notification, remover)))
    }

    /// Acknowledge the message after handling it.
    ///
    /// A prior handling error is returned unchanged and the message stays in the queue for
    /// redelivery; otherwise the message is deleted.
    pub async fn ack<E>(&self, prior: Result<(), E>) -> Result<(), E>
    where
        E: From<ClientError>,
    {
        prior?;
        self.remover.remove(self).await.map_err(E::from)
    }

    pub fn notification(&self) -> &Notification {
        &self.notification
    }

    /// Application payload.
    pub fn body(&self) -> &str {
        &self.notification.message
    }

    pub fn message_id(&self) -> &str {
        &self.raw.message_id
    }

    pub fn receipt_handle(&self) -> &str {
        &self.raw.receipt_handle
    }

    pub fn event_type(&self) -> Option<&str> {
        self.notification
            .message_attributes
            .get(crate::subscription::EVENT_TYPE)
            .map(|attribute| attribute.value.as_str())
    }

    /// Milliseconds since the epoch at which the broker accepted the message.
    pub fn sent_timestamp(&self) -> Option<i64> {
        self.raw
            .attributes
            .get(ATTR_SENT_TIMESTAMP)
            .and_then(|value| value.parse().ok())
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("raw", &self.raw)
            .field("notification", &self.notification)
            .finish_non_exhaustive()
    }
}
