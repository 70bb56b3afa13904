//!
//! Subscription settings supplied by a message handler.
//!
use crate::broker::{MessageAttributeValue, STRING_DATA_TYPE};
use crate::error::ClientError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

pub const FILTER_POLICY: &str = "FilterPolicy";

/// Name of the message attribute carrying the event type of a published message.
pub const EVENT_TYPE: &str = "eventType";

/// Value pushed when an attribute is not declared, clearing it on the broker.
pub const EMPTY_ATTRIBUTE_VALUE: &str = "{}";

/// Accepted string values per message attribute, e.g. `{"eventType": ["Paid"]}`.
///
/// A message passes when every listed attribute is present, string-typed and equal to one of
/// the accepted values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FilterPolicy(BTreeMap<String, Vec<String>>);

impl FilterPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, attribute: &str, accepted: &[&str]) -> Self {
        self.0
            .entry(attribute.to_owned())
            .or_default()
            .extend(accepted.iter().map(|v| v.to_string()));
        self
    }

    /// Filter on the `eventType` attribute attached by [`crate::exchange::Exchange::publish`].
    pub fn event_types(accepted: &[&str]) -> Self {
        Self::new().with(EVENT_TYPE, accepted)
    }

    pub fn matches(&self, attributes: &HashMap<String, MessageAttributeValue>) -> bool {
        self.0.iter().all(|(name, accepted)| match attributes.get(name) {
            Some(value) if value.data_type == STRING_DATA_TYPE => {
                accepted.iter().any(|v| *v == value.string_value)
            }
            Some(_) => false,
            None => false,
        })
    }
}

/// Subscription attributes the client knows how to render, plus a pass-through variant for
/// anything else the broker accepts.
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionAttribute {
    FilterPolicy(FilterPolicy),

    Custom {
        name: String,
        value: serde_json::Value,
    },
}

impl SubscriptionAttribute {
    pub fn name(&self) -> &str {
        match self {
            SubscriptionAttribute::FilterPolicy(_) => FILTER_POLICY,
            SubscriptionAttribute::Custom { name, .. } => name,
        }
    }

    /// JSON text sent to the broker as the attribute value.
    pub fn to_value(&self) -> Result<String, ClientError> {
        let encoded = match self {
            SubscriptionAttribute::FilterPolicy(policy) => serde_json::to_string(policy),
            SubscriptionAttribute::Custom { value, .. } => serde_json::to_string(value),
        };
        encoded.map_err(|e| ClientError::Encode {
            what: "subscription attribute",
            source: e,
        })
    }
}

/// Everything needed to derive resource names and access rules of one subscription.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubscriptionContext {
    /// Logical topic name.
    pub topic: String,

    /// Logical queue name.
    pub queue: String,

    /// Logical name of the queue receiving messages that exhausted their delivery attempts.
    pub dead_letter_queue: Option<String>,

    pub attributes: Vec<SubscriptionAttribute>,
}

impl SubscriptionContext {
    pub fn new(topic: &str, queue: &str) -> Self {
        Self {
            topic: topic.to_owned(),
            queue: queue.to_owned(),
            ..Default::default()
        }
    }

    /// Context of a publisher, which only needs the topic.
    pub fn for_topic(topic: &str) -> Self {
        Self::new(topic, "")
    }

    pub fn with_dead_letter_queue(mut self, queue: &str) -> Self {
        self.dead_letter_queue = Some(queue.to_owned());
        self
    }

    pub fn with_attribute(mut self, attribute: SubscriptionAttribute) -> Self {
        self.attributes.retain(|a| a.name() != attribute.name());
        self.attributes.push(attribute);
        self
    }

    pub fn attribute(&self, name: &str) -> Option<&SubscriptionAttribute> {
        self.attributes.iter().find(|a| a.name() == name)
    }

    /// Rendered value of the named attribute, `{}` when it is not declared.
    pub fn attribute_value(&self, name: &str) -> Result<String, ClientError> {
        match self.attribute(name) {
            Some(attribute) => attribute.to_value(),
            None => Ok(EMPTY_ATTRIBUTE_VALUE.to_owned()),
        }
    }
}
