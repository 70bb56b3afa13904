//!
//! This module defines Exchange, the gateway to one topic: resolution, subscription and publishing.
//!
use crate::broker::{bounded, BrokerApi, MessageAttributeValue, ADMIN_CALL_TIMEOUT, QUEUE_PROTOCOL};
use crate::error::ClientError;
use crate::naming::Naming;
use crate::subscription::{SubscriptionContext, EVENT_TYPE, FILTER_POLICY};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::debug;

/// Wrapper applied by [`Exchange::publish_json`].
#[derive(Serialize)]
struct PublishEnvelope<'a, T: Serialize> {
    body: &'a T,
}

pub struct Exchange {
    broker: Arc<dyn BrokerApi>,
    naming: Naming,
    context: SubscriptionContext,

    /// Resolved at most once, concurrent resolvers wait for the first one.
    topic_arn: OnceCell<String>,
}

impl Exchange {
    /// Build a gateway for `context.topic`, creating the topic if needed.
    ///
    /// # Errors
    /// Fails if the topic cannot be created or fetched within [`ADMIN_CALL_TIMEOUT`]; there is no
    /// gateway without a resolved topic.
    pub async fn new(
        broker: Arc<dyn BrokerApi>,
        naming: Naming,
        context: SubscriptionContext,
    ) -> Result<Self, ClientError> {
        let exchange = Self {
            broker,
            naming,
            context,
            topic_arn: OnceCell::new(),
        };
        let topic = exchange.context.topic.clone();
        exchange.resolve_topic(&topic).await?;
        Ok(exchange)
    }

    /// Create-or-fetch the topic once and return its identifier.
    ///
    /// The gateway serves a single topic: once resolved, the cached identifier is returned
    /// without another broker call.
    pub async fn resolve_topic(&self, logical: &str) -> Result<&str, ClientError> {
        let arn = self
            .topic_arn
            .get_or_try_init(|| async {
                let name = self.naming.topic_name(logical);
                let arn = bounded(
                    "create_topic",
                    ADMIN_CALL_TIMEOUT,
                    self.broker.create_topic(&name),
                )
                .await?;
                debug!(topic = %name, arn = %arn, "topic resolved");
                Ok::<_, ClientError>(arn)
            })
            .await?;
        Ok(arn.as_str())
    }

    pub fn topic_arn(&self) -> &str {
        self.topic_arn.get().map(String::as_str).unwrap_or_default()
    }

    /// Bind `queue_arn` to the topic and push the declared subscription attributes.
    ///
    /// `FilterPolicy` is always pushed, as `{}` when the context declares none.
    pub async fn subscribe(&self, queue_arn: &str) -> Result<String, ClientError> {
        let subscription_arn = bounded(
            "subscribe",
            ADMIN_CALL_TIMEOUT,
            self.broker
                .subscribe(self.topic_arn(), QUEUE_PROTOCOL, queue_arn),
        )
        .await?;
        debug!(subscription = %subscription_arn, queue = %queue_arn, "queue subscribed");

        self.set_subscription_attribute(&subscription_arn, FILTER_POLICY)
            .await?;
        for attribute in self
            .context
            .attributes
            .iter()
            .filter(|attribute| attribute.name() != FILTER_POLICY)
        {
            self.set_subscription_attribute(&subscription_arn, attribute.name())
                .await?;
        }
        Ok(subscription_arn)
    }

    pub async fn set_subscription_attribute(
        &self,
        subscription_arn: &str,
        name: &str,
    ) -> Result<(), ClientError> {
        let value = self.context.attribute_value(name)?;
        bounded(
            "set_subscription_attributes",
            ADMIN_CALL_TIMEOUT,
            self.broker
                .set_subscription_attributes(subscription_arn, name, &value),
        )
        .await
    }

    /// Publish `payload` tagged with an `eventType` attribute subscribers may filter on.
    pub async fn publish(&self, payload: &str, event_type: &str) -> Result<String, ClientError> {
        let attributes = HashMap::from([(
            EVENT_TYPE.to_owned(),
            MessageAttributeValue::string(event_type),
        )]);
        bounded(
            "publish",
            ADMIN_CALL_TIMEOUT,
            self.broker.publish(self.topic_arn(), payload, attributes),
        )
        .await
    }

    /// Publish `{"body": <payload>}`.
    pub async fn publish_json<T>(&self, payload: &T, event_type: &str) -> Result<String, ClientError>
    where
        T: Serialize + Sync,
    {
        let body = serde_json::to_string(&PublishEnvelope { body: payload }).map_err(|e| {
            ClientError::Encode {
                what: "publish payload",
                source: e,
            }
        })?;
        debug!(event_type, body = %body, "publishing");
        self.publish(&body, event_type).await
    }
}
