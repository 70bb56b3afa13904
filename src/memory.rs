//!
//! This module defines MemoryBroker, an in-process topic and queue broker.
//!
//! It follows the observable behavior the client relies on: idempotent topic and queue
//! creation, queue policies gating topic delivery, filter policies, notification wrapping,
//! visibility timeouts, long polling and dead-letter redrive. Nothing is persisted.
//!
use crate::broker::{
    BrokerApi, MessageAttributeValue, RawMessage, ReceiveRequest, ATTR_POLICY, ATTR_QUEUE_ARN,
    ATTR_REDRIVE_POLICY, ATTR_SENT_TIMESTAMP, QUEUE_PROTOCOL,
};
use crate::error::ClientError;
use crate::message::{Notification, NotificationAttribute};
use crate::policy::{QueuePolicy, RedrivePolicy};
use crate::subscription::{FilterPolicy, FILTER_POLICY};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{SecondsFormat, Utc};
use std::collections::HashMap;
use std::sync::atomic::{self, AtomicU64};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, error, warn};

struct StoredMessage {
    message_id: String,
    body: Bytes,
    sent_timestamp: i64,
    message_attributes: HashMap<String, MessageAttributeValue>,
    receive_count: u32,
    receipt_handle: Option<String>,
    invisible_until: Option<Instant>,
}

impl StoredMessage {
    fn is_visible(&self, now: Instant) -> bool {
        self.invisible_until.map_or(true, |until| until <= now)
    }
}

struct MemoryQueue {
    name: String,
    arn: String,
    attributes: HashMap<String, String>,
    messages: Vec<StoredMessage>,
}

impl MemoryQueue {
    fn redrive_policy(&self) -> Option<RedrivePolicy> {
        let raw = self.attributes.get(ATTR_REDRIVE_POLICY)?;
        match serde_json::from_str(raw) {
            Ok(policy) => Some(policy),
            Err(e) => {
                warn!(queue = %self.name, "ignoring malformed redrive policy: {}", e);
                None
            }
        }
    }

    fn accepts_from(&self, topic_arn: &str) -> bool {
        self.attributes
            .get(ATTR_POLICY)
            .and_then(|raw| serde_json::from_str::<QueuePolicy>(raw).ok())
            .map_or(false, |policy| policy.allows_topic(topic_arn))
    }
}

struct MemorySubscription {
    topic_arn: String,
    endpoint: String,
    attributes: HashMap<String, String>,
}

impl MemorySubscription {
    fn accepts(&self, attributes: &HashMap<String, MessageAttributeValue>) -> bool {
        match self.attributes.get(FILTER_POLICY) {
            None => true,
            Some(raw) => match serde_json::from_str::<FilterPolicy>(raw) {
                Ok(policy) => policy.matches(attributes),
                Err(_) => false,
            },
        }
    }
}

#[derive(Default)]
struct State {
    /// Topic name to identifier.
    topics: HashMap<String, String>,

    /// Queue name to address.
    queue_urls: HashMap<String, String>,

    /// Queue address to queue.
    queues: HashMap<String, MemoryQueue>,

    /// Subscription identifier to subscription.
    subscriptions: HashMap<String, MemorySubscription>,
}

impl State {
    fn queue_mut(&mut self, queue_url: &str, operation: &'static str) -> Result<&mut MemoryQueue, ClientError> {
        self.queues
            .get_mut(queue_url)
            .ok_or_else(|| ClientError::broker(operation, format!("no queue at `{}`", queue_url)))
    }

    fn queue_by_arn_mut(&mut self, arn: &str) -> Option<&mut MemoryQueue> {
        self.queues.values_mut().find(|queue| queue.arn == arn)
    }
}

#[derive(Default)]
pub struct MemoryBroker {
    state: Mutex<State>,
    arrivals: Notify,
    sequence: AtomicU64,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&self) -> u64 {
        self.sequence.fetch_add(1, atomic::Ordering::Relaxed)
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, ClientError> {
        self.state.lock().map_err(|e| {
            error!("Memory broker lock is poisoned. Cause: {}", e);
            ClientError::Unknown
        })
    }

    /// Messages currently stored in the named queue, visible or not.
    pub fn queue_depth(&self, name: &str) -> Option<usize> {
        let state = self.lock().ok()?;
        let url = state.queue_urls.get(name)?;
        state.queues.get(url).map(|queue| queue.messages.len())
    }

    pub fn queue_attributes(&self, name: &str) -> Option<HashMap<String, String>> {
        let state = self.lock().ok()?;
        let url = state.queue_urls.get(name)?;
        state.queues.get(url).map(|queue| queue.attributes.clone())
    }

    pub fn subscription_attributes(&self, subscription_arn: &str) -> Option<HashMap<String, String>> {
        let state = self.lock().ok()?;
        state
            .subscriptions
            .get(subscription_arn)
            .map(|subscription| subscription.attributes.clone())
    }

    /// Hand out up to `max_messages` visible messages, moving exhausted ones to the dead-letter queue.
    /// Without an existing dead-letter queue no message is considered exhausted.
    ///
    /// Also returns the earliest instant at which an in-flight message becomes visible again.
    fn take_visible(&self, request: &ReceiveRequest) -> Result<(Vec<RawMessage>, Option<Instant>), ClientError> {
        let mut state = self.lock()?;
        let now = Instant::now();
        let policy = state.queue_mut(&request.queue_url, "receive_messages")?.redrive_policy();
        let redrive = policy.filter(|policy| {
            let exists = state.queues.values().any(|q| q.arn == policy.dead_letter_target_arn);
            if !exists {
                warn!("dead-letter target `{}` does not exist", policy.dead_letter_target_arn);
            }
            exists
        });
        let queue = state.queue_mut(&request.queue_url, "receive_messages")?;
        let wants_sent_timestamp = request
            .attribute_names
            .iter()
            .any(|name| name == ATTR_SENT_TIMESTAMP || name == "All");

        let mut taken = Vec::new();
        let mut exhausted = Vec::new();
        let mut next_visible: Option<Instant> = None;
        let mut index = 0;
        while index < queue.messages.len() && taken.len() < request.max_messages {
            if !queue.messages[index].is_visible(now) {
                let until = queue.messages[index].invisible_until;
                next_visible = match (next_visible, until) {
                    (Some(a), Some(b)) => Some(a.min(b)),
                    (a, b) => a.or(b),
                };
                index += 1;
                continue;
            }
            if let Some(policy) = &redrive {
                if queue.messages[index].receive_count >= policy.max_receive_count {
                    exhausted.push(queue.messages.remove(index));
                    continue;
                }
            }

            let handle = format!("{}#{}", queue.messages[index].message_id, self.next_id());
            let stored = &mut queue.messages[index];
            stored.receive_count += 1;
            stored.receipt_handle = Some(handle.clone());
            stored.invisible_until = Some(now + request.visibility_timeout);

            let mut attributes = HashMap::new();
            if wants_sent_timestamp {
                attributes.insert(ATTR_SENT_TIMESTAMP.to_owned(), stored.sent_timestamp.to_string());
            }
            let message_attributes = if request.message_attribute_names.is_empty() {
                HashMap::new()
            } else {
                stored.message_attributes.clone()
            };
            taken.push(RawMessage {
                message_id: stored.message_id.clone(),
                receipt_handle: handle,
                body: stored.body.clone(),
                attributes,
                message_attributes,
            });
            index += 1;
        }

        if let (Some(policy), false) = (redrive, exhausted.is_empty()) {
            let source = queue.name.clone();
            if let Some(dead_letter_queue) = state.queue_by_arn_mut(&policy.dead_letter_target_arn) {
                debug!(queue = %source, dlq = %dead_letter_queue.name, count = exhausted.len(), "redriving messages");
                for mut message in exhausted {
                    message.receive_count = 0;
                    message.receipt_handle = None;
                    message.invisible_until = None;
                    dead_letter_queue.messages.push(message);
                }
            }
        }
        Ok((taken, next_visible))
    }
}

#[async_trait]
impl BrokerApi for MemoryBroker {
    async fn create_topic(&self, name: &str) -> Result<String, ClientError> {
        let mut state = self.lock()?;
        let arn = state
            .topics
            .entry(name.to_owned())
            .or_insert_with(|| format!("arn:memory:sns:{}", name));
        Ok(arn.clone())
    }

    async fn get_queue_url(&self, name: &str) -> Result<String, ClientError> {
        let state = self.lock()?;
        state
            .queue_urls
            .get(name)
            .cloned()
            .ok_or_else(|| ClientError::QueueDoesNotExist(name.to_owned()))
    }

    async fn create_queue(
        &self,
        name: &str,
        attributes: HashMap<String, String>,
    ) -> Result<String, ClientError> {
        let mut state = self.lock()?;
        if let Some(url) = state.queue_urls.get(name) {
            return Ok(url.clone());
        }
        let url = format!("memory://sqs/{}", name);
        state.queue_urls.insert(name.to_owned(), url.clone());
        state.queues.insert(
            url.clone(),
            MemoryQueue {
                name: name.to_owned(),
                arn: format!("arn:memory:sqs:{}", name),
                attributes,
                messages: Vec::new(),
            },
        );
        Ok(url)
    }

    async fn get_queue_attributes(
        &self,
        queue_url: &str,
        names: &[&str],
    ) -> Result<HashMap<String, String>, ClientError> {
        let mut state = self.lock()?;
        let queue = state.queue_mut(queue_url, "get_queue_attributes")?;
        Ok(names
            .iter()
            .filter_map(|name| {
                let value = if *name == ATTR_QUEUE_ARN {
                    Some(queue.arn.clone())
                } else {
                    queue.attributes.get(*name).cloned()
                };
                value.map(|value| (name.to_string(), value))
            })
            .collect())
    }

    async fn set_queue_attributes(
        &self,
        queue_url: &str,
        attributes: HashMap<String, String>,
    ) -> Result<(), ClientError> {
        let mut state = self.lock()?;
        state
            .queue_mut(queue_url, "set_queue_attributes")?
            .attributes
            .extend(attributes);
        Ok(())
    }

    async fn subscribe(
        &self,
        topic_arn: &str,
        protocol: &str,
        endpoint: &str,
    ) -> Result<String, ClientError> {
        if protocol != QUEUE_PROTOCOL {
            return Err(ClientError::broker(
                "subscribe",
                format!("unsupported protocol `{}`", protocol),
            ));
        }
        let mut state = self.lock()?;
        if !state.topics.values().any(|arn| arn == topic_arn) {
            return Err(ClientError::broker("subscribe", format!("no topic `{}`", topic_arn)));
        }
        if let Some((arn, _)) = state
            .subscriptions
            .iter()
            .find(|(_, s)| s.topic_arn == topic_arn && s.endpoint == endpoint)
        {
            return Ok(arn.clone());
        }
        let arn = format!("{}:{}", topic_arn, self.next_id());
        state.subscriptions.insert(
            arn.clone(),
            MemorySubscription {
                topic_arn: topic_arn.to_owned(),
                endpoint: endpoint.to_owned(),
                attributes: HashMap::new(),
            },
        );
        Ok(arn)
    }

    async fn set_subscription_attributes(
        &self,
        subscription_arn: &str,
        name: &str,
        value: &str,
    ) -> Result<(), ClientError> {
        let mut state = self.lock()?;
        let subscription = state.subscriptions.get_mut(subscription_arn).ok_or_else(|| {
            ClientError::broker(
                "set_subscription_attributes",
                format!("no subscription `{}`", subscription_arn),
            )
        })?;
        subscription
            .attributes
            .insert(name.to_owned(), value.to_owned());
        Ok(())
    }

    async fn publish(
        &self,
        topic_arn: &str,
        body: &str,
        attributes: HashMap<String, MessageAttributeValue>,
    ) -> Result<String, ClientError> {
        let message_id = format!("msg-{}", self.next_id());
        {
            let mut state = self.lock()?;
            if !state.topics.values().any(|arn| arn == topic_arn) {
                return Err(ClientError::broker("publish", format!("no topic `{}`", topic_arn)));
            }
            let deliveries: Vec<(String, String)> = state
                .subscriptions
                .iter()
                .filter(|(_, s)| s.topic_arn == topic_arn && s.accepts(&attributes))
                .map(|(arn, s)| (arn.clone(), s.endpoint.clone()))
                .collect();

            let now = Utc::now();
            for (subscription_arn, endpoint) in deliveries {
                let Some(queue) = state.queue_by_arn_mut(&endpoint) else {
                    warn!(endpoint = %endpoint, "subscribed queue does not exist");
                    continue;
                };
                if !queue.accepts_from(topic_arn) {
                    warn!(queue = %queue.name, topic = %topic_arn, "queue policy denies delivery");
                    continue;
                }
                let notification = Notification {
                    r#type: "Notification".to_owned(),
                    message_id: message_id.clone(),
                    topic_arn: topic_arn.to_owned(),
                    subject: None,
                    message: body.to_owned(),
                    timestamp: now.to_rfc3339_opts(SecondsFormat::Millis, true),
                    signature_version: "1".to_owned(),
                    signature: String::new(),
                    signing_cert_url: String::new(),
                    unsubscribe_url: format!("memory://sns/unsubscribe/{}", subscription_arn),
                    message_attributes: attributes
                        .iter()
                        .map(|(name, value)| {
                            (
                                name.clone(),
                                NotificationAttribute {
                                    data_type: value.data_type.clone(),
                                    value: value.string_value.clone(),
                                },
                            )
                        })
                        .collect(),
                };
                let encoded = serde_json::to_vec(&notification).map_err(|e| ClientError::Encode {
                    what: "notification",
                    source: e,
                })?;
                queue.messages.push(StoredMessage {
                    message_id: format!("{}-{}", message_id, self.next_id()),
                    body: Bytes::from(encoded),
                    sent_timestamp: now.timestamp_millis(),
                    message_attributes: HashMap::new(),
                    receive_count: 0,
                    receipt_handle: None,
                    invisible_until: None,
                });
            }
        }
        self.arrivals.notify_waiters();
        Ok(message_id)
    }

    async fn receive_messages(&self, request: ReceiveRequest) -> Result<Vec<RawMessage>, ClientError> {
        let deadline = Instant::now() + request.wait_time;
        loop {
            let notified = self.arrivals.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let (batch, next_visible) = self.take_visible(&request)?;
            if !batch.is_empty() || Instant::now() >= deadline {
                return Ok(batch);
            }
            let wake = next_visible.map_or(deadline, |at| at.min(deadline));
            let _ = tokio::time::timeout_at(wake, notified).await;
        }
    }

    async fn delete_message(&self, queue_url: &str, receipt_handle: &str) -> Result<(), ClientError> {
        let mut state = self.lock()?;
        let queue = state.queue_mut(queue_url, "delete_message")?;
        queue
            .messages
            .retain(|message| message.receipt_handle.as_deref() != Some(receipt_handle));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::exchange::Exchange;
    use crate::mediator::Mediator;
    use crate::subscription::{SubscriptionAttribute, SubscriptionContext};
    use std::sync::Arc;
    use std::time::Duration;

    fn config() -> ClientConfig {
        ClientConfig::new("stage", "svc", 1).unwrap()
    }

    fn billing() -> SubscriptionContext {
        SubscriptionContext::new("orders", "billing")
            .with_dead_letter_queue("DLQ")
            .with_attribute(SubscriptionAttribute::FilterPolicy(FilterPolicy::event_types(&["Paid"])))
    }

    fn request(queue_url: &str, wait: Duration) -> ReceiveRequest {
        ReceiveRequest {
            queue_url: queue_url.to_owned(),
            max_messages: 10,
            visibility_timeout: Duration::from_secs(5),
            wait_time: wait,
            attribute_names: vec![ATTR_SENT_TIMESTAMP.to_owned()],
            message_attribute_names: vec!["All".to_owned()],
        }
    }

    async fn publisher(broker: &Arc<MemoryBroker>) -> Result<Exchange, ClientError> {
        Exchange::new(
            broker.clone(),
            config().naming(),
            SubscriptionContext::for_topic("orders"),
        )
        .await
    }

    #[tokio::test]
    async fn test_create_is_idempotent() -> Result<(), ClientError> {
        let broker = MemoryBroker::new();
        assert_eq!(broker.create_topic("t").await?, broker.create_topic("t").await?);
        let url = broker.create_queue("q", HashMap::new()).await?;
        assert_eq!(broker.create_queue("q", HashMap::new()).await?, url);
        assert_eq!(broker.get_queue_url("q").await?, url);
        assert!(matches!(
            broker.get_queue_url("missing").await,
            Err(ClientError::QueueDoesNotExist(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_filtered_delivery_and_ack() -> Result<(), ClientError> {
        let broker = Arc::new(MemoryBroker::new());
        let mediator = Mediator::new(broker.clone(), &config());
        mediator.subscribe(&billing()).await?;

        let exchange = publisher(&broker).await?;
        exchange.publish_json(&"paid", "Paid").await?;
        exchange.publish_json(&"shipped", "Shipped").await?;
        assert_eq!(broker.queue_depth("svc-billing-stage"), Some(1));

        let messages = mediator.receive(&billing()).await?;
        assert_eq!(messages.len(), 1);
        let message = &messages[0];
        assert_eq!(message.body(), r#"{"body":"paid"}"#);
        assert_eq!(message.event_type(), Some("Paid"));
        assert_eq!(message.notification().topic_arn, exchange.topic_arn());
        assert!(message.sent_timestamp().is_some());

        message.ack::<ClientError>(Ok(())).await?;
        assert_eq!(broker.queue_depth("svc-billing-stage"), Some(0));

        let subscription_arn = mediator.subscription_arn().unwrap_or_default().to_owned();
        let attributes = broker
            .subscription_attributes(&subscription_arn)
            .unwrap_or_default();
        assert_eq!(attributes[FILTER_POLICY], r#"{"eventType":["Paid"]}"#);
        Ok(())
    }

    #[tokio::test]
    async fn test_delivery_requires_queue_policy() -> Result<(), ClientError> {
        let broker = Arc::new(MemoryBroker::new());
        let exchange = publisher(&broker).await?;
        let url = broker.create_queue("svc-audit-stage", HashMap::new()).await?;
        broker
            .subscribe(exchange.topic_arn(), QUEUE_PROTOCOL, "arn:memory:sqs:svc-audit-stage")
            .await?;

        exchange.publish("denied", "Paid").await?;
        assert_eq!(broker.queue_depth("svc-audit-stage"), Some(0));

        let policy = QueuePolicy::allow_topic("arn:memory:sqs:svc-audit-stage", exchange.topic_arn());
        broker
            .set_queue_attributes(&url, HashMap::from([(ATTR_POLICY.to_owned(), policy.to_json()?)]))
            .await?;
        exchange.publish("allowed", "Paid").await?;
        assert_eq!(broker.queue_depth("svc-audit-stage"), Some(1));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_visibility_timeout() -> Result<(), ClientError> {
        let broker = Arc::new(MemoryBroker::new());
        let mediator = Mediator::new(broker.clone(), &config());
        mediator.subscribe(&billing()).await?;
        publisher(&broker).await?.publish("p", "Paid").await?;
        let url = mediator.resolve_queue_url("billing").await?;

        let first = broker.receive_messages(request(&url, Duration::ZERO)).await?;
        assert_eq!(first.len(), 1);
        assert!(broker.receive_messages(request(&url, Duration::ZERO)).await?.is_empty());

        tokio::time::advance(Duration::from_secs(6)).await;
        let again = broker.receive_messages(request(&url, Duration::ZERO)).await?;
        assert_eq!(again.len(), 1);
        assert_ne!(again[0].receipt_handle, first[0].receipt_handle);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_redrive_to_dead_letter_queue() -> Result<(), ClientError> {
        let broker = Arc::new(MemoryBroker::new());
        let mediator = Mediator::new(broker.clone(), &config());
        mediator.subscribe(&billing()).await?;
        publisher(&broker).await?.publish("poison", "Paid").await?;
        let url = mediator.resolve_queue_url("billing").await?;

        for _ in 0..crate::mediator::MAX_RECEIVE_COUNT {
            assert_eq!(broker.receive_messages(request(&url, Duration::ZERO)).await?.len(), 1);
            tokio::time::advance(Duration::from_secs(6)).await;
        }
        assert!(broker.receive_messages(request(&url, Duration::ZERO)).await?.is_empty());
        assert_eq!(broker.queue_depth("svc-billing-stage"), Some(0));
        assert_eq!(broker.queue_depth("svc-DLQ-stage"), Some(1));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_dead_letter_target_keeps_message() -> Result<(), ClientError> {
        let broker = Arc::new(MemoryBroker::new());
        let exchange = publisher(&broker).await?;
        let queue_arn = "arn:memory:sqs:svc-audit-stage";
        let url = broker.create_queue("svc-audit-stage", HashMap::new()).await?;
        broker
            .set_queue_attributes(
                &url,
                HashMap::from([
                    (
                        ATTR_POLICY.to_owned(),
                        QueuePolicy::allow_topic(queue_arn, exchange.topic_arn()).to_json()?,
                    ),
                    (
                        ATTR_REDRIVE_POLICY.to_owned(),
                        RedrivePolicy::new("arn:memory:sqs:gone", 2).to_json()?,
                    ),
                ]),
            )
            .await?;
        let attributes = broker.queue_attributes("svc-audit-stage").unwrap_or_default();
        assert!(attributes.contains_key(ATTR_REDRIVE_POLICY));

        broker.subscribe(exchange.topic_arn(), QUEUE_PROTOCOL, queue_arn).await?;
        exchange.publish("kept", "Paid").await?;
        for _ in 0..4 {
            assert_eq!(broker.receive_messages(request(&url, Duration::ZERO)).await?.len(), 1);
            tokio::time::advance(Duration::from_secs(6)).await;
        }
        assert_eq!(broker.queue_depth("svc-audit-stage"), Some(1));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_poll_wakes_on_publish() -> Result<(), Box<dyn std::error::Error>> {
        let broker = Arc::new(MemoryBroker::new());
        let mediator = Mediator::new(broker.clone(), &config());
        mediator.subscribe(&billing()).await?;
        let url = mediator.resolve_queue_url("billing").await?;

        let waiting = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.receive_messages(request(&url, Duration::from_secs(20))).await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        publisher(&broker).await?.publish("late", "Paid").await?;

        let received = tokio::time::timeout(Duration::from_secs(5), waiting).await???;
        assert_eq!(received.len(), 1);
        Ok(())
    }
}
