//!
//! This module defines Mediator, which provisions queues, wires them to a topic and receives from them.
//!
//! Lock discipline: the queue registry is a `RwLock` over a map of entries. Lookups of an
//! existing entry take the shared lock; inserting an entry takes the exclusive lock and re-checks
//! the map first. Neither lock is held across a broker call. Each entry resolves its address and
//! resource identifier through a `OnceCell`, so concurrent resolvers of one queue share a single
//! broker round-trip and a populated value is never replaced.
//!
use crate::broker::{
    bounded, BrokerApi, ReceiveRequest, ADMIN_CALL_TIMEOUT, ALL_MESSAGE_ATTRIBUTES,
    ATTR_DELAY_SECONDS, ATTR_MESSAGE_RETENTION_PERIOD, ATTR_POLICY, ATTR_QUEUE_ARN,
    ATTR_REDRIVE_POLICY, ATTR_SENT_TIMESTAMP,
};
use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::exchange::Exchange;
use crate::message::{Message, MessageRemover};
use crate::naming::Naming;
use crate::policy::{QueuePolicy, RedrivePolicy};
use crate::subscriber::MessageSource;
use crate::subscription::SubscriptionContext;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, error};

pub const DELAY_SECONDS: &str = "0";

/// Three days.
pub const MESSAGE_RETENTION_PERIOD: &str = "259200";

pub const VISIBILITY_TIMEOUT: Duration = Duration::from_secs(5);
pub const MAX_NUMBER_OF_MESSAGES: usize = 10;

/// Deliveries of one message before the broker moves it to the dead-letter queue.
pub const MAX_RECEIVE_COUNT: u32 = 5;

#[derive(Debug, Default)]
struct QueueEntry {
    url: OnceCell<String>,
    arn: OnceCell<String>,
}

struct Subscription {
    subscription_arn: String,
    exchange: Arc<Exchange>,
}

struct Inner {
    broker: Arc<dyn BrokerApi>,
    naming: Naming,
    wait_time: Duration,

    /// Keyed by fully-qualified queue name.
    queues: RwLock<HashMap<String, Arc<QueueEntry>>>,

    /// Established at most once per mediator.
    subscription: OnceCell<Subscription>,
}

/// Queue registry and subscription orchestrator. Cheap to clone, clones share all state.
#[derive(Clone)]
pub struct Mediator {
    inner: Arc<Inner>,
}

impl Mediator {
    pub fn new(broker: Arc<dyn BrokerApi>, config: &ClientConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                broker,
                naming: config.naming(),
                wait_time: config.wait_time(),
                queues: RwLock::new(HashMap::new()),
                subscription: OnceCell::new(),
            }),
        }
    }

    pub fn wait_time(&self) -> Duration {
        self.inner.wait_time
    }

    pub fn subscription_arn(&self) -> Option<&str> {
        self.inner
            .subscription
            .get()
            .map(|s| s.subscription_arn.as_str())
    }

    /// Gateway of the subscribed topic, available once subscribed.
    pub fn exchange(&self) -> Option<Arc<Exchange>> {
        self.inner.subscription.get().map(|s| Arc::clone(&s.exchange))
    }

    fn subscription(&self) -> Result<&Subscription, ClientError> {
        self.inner.subscription.get().ok_or(ClientError::NotSubscribed)
    }

    fn registered(&self, name: &str) -> Result<Option<Arc<QueueEntry>>, ClientError> {
        let guard = match self.inner.queues.read() {
            Ok(map) => map,
            Err(e) => {
                error!("Queue registry lock is poisoned. Cause: {}", e);
                return Err(ClientError::Unknown);
            }
        };
        Ok(guard.get(name).cloned())
    }

    fn entry(&self, name: &str) -> Result<Arc<QueueEntry>, ClientError> {
        if let Some(entry) = self.registered(name)? {
            return Ok(entry);
        }
        let mut guard = match self.inner.queues.write() {
            Ok(map) => map,
            Err(e) => {
                error!("Queue registry lock is poisoned. Cause: {}", e);
                return Err(ClientError::Unknown);
            }
        };
        // Another resolver may have inserted the entry between the two locks.
        Ok(Arc::clone(guard.entry(name.to_owned()).or_default()))
    }

    /// Address of the queue named `logical`, created with default attributes if missing.
    pub async fn resolve_queue_url(&self, logical: &str) -> Result<String, ClientError> {
        let name = self.inner.naming.queue_name(logical);
        let entry = self.entry(&name)?;
        let url = entry
            .url
            .get_or_try_init(|| self.lookup_or_create_queue(&name))
            .await?;
        Ok(url.clone())
    }

    async fn lookup_or_create_queue(&self, name: &str) -> Result<String, ClientError> {
        let broker = &self.inner.broker;
        match bounded("get_queue_url", ADMIN_CALL_TIMEOUT, broker.get_queue_url(name)).await {
            Ok(url) => Ok(url),
            Err(ClientError::QueueDoesNotExist(_)) => {
                let attributes = HashMap::from([
                    (ATTR_DELAY_SECONDS.to_owned(), DELAY_SECONDS.to_owned()),
                    (
                        ATTR_MESSAGE_RETENTION_PERIOD.to_owned(),
                        MESSAGE_RETENTION_PERIOD.to_owned(),
                    ),
                ]);
                let url = bounded(
                    "create_queue",
                    ADMIN_CALL_TIMEOUT,
                    broker.create_queue(name, attributes),
                )
                .await?;
                debug!(queue = %name, url = %url, "queue created");
                Ok(url)
            }
            Err(e) => Err(e),
        }
    }

    /// Broker resource identifier of the queue named `logical`.
    pub async fn resolve_queue_arn(&self, logical: &str) -> Result<String, ClientError> {
        let url = self.resolve_queue_url(logical).await?;
        let name = self.inner.naming.queue_name(logical);
        let entry = self
            .registered(&name)?
            .ok_or_else(|| ClientError::UnknownQueue(name.clone()))?;
        let arn = entry
            .arn
            .get_or_try_init(|| async {
                let mut attributes = bounded(
                    "get_queue_attributes",
                    ADMIN_CALL_TIMEOUT,
                    self.inner.broker.get_queue_attributes(&url, &[ATTR_QUEUE_ARN]),
                )
                .await?;
                attributes
                    .remove(ATTR_QUEUE_ARN)
                    .ok_or_else(|| ClientError::MissingAttribute(ATTR_QUEUE_ARN.to_owned()))
            })
            .await?;
        Ok(arn.clone())
    }

    /// Allow the subscribed topic to deliver into the context's queue, and attach the
    /// dead-letter redrive policy when the context names one.
    ///
    /// # Errors
    /// `ClientError::NotSubscribed` if no subscription has been established yet.
    pub async fn grant_topic_delivery(&self, context: &SubscriptionContext) -> Result<(), ClientError> {
        let subscription = self.subscription()?;
        let topic_arn = subscription.exchange.resolve_topic(&context.topic).await?;
        self.authorize(context, topic_arn).await
    }

    async fn authorize(&self, context: &SubscriptionContext, topic_arn: &str) -> Result<(), ClientError> {
        let queue_arn = self.resolve_queue_arn(&context.queue).await?;
        let queue_url = self.resolve_queue_url(&context.queue).await?;

        let mut attributes = HashMap::from([(
            ATTR_POLICY.to_owned(),
            QueuePolicy::allow_topic(&queue_arn, topic_arn).to_json()?,
        )]);
        if let Some(dead_letter_queue) = context.dead_letter_queue.as_deref() {
            let dead_letter_arn = self.resolve_queue_arn(dead_letter_queue).await?;
            attributes.insert(
                ATTR_REDRIVE_POLICY.to_owned(),
                RedrivePolicy::new(&dead_letter_arn, MAX_RECEIVE_COUNT).to_json()?,
            );
        }

        bounded(
            "set_queue_attributes",
            ADMIN_CALL_TIMEOUT,
            self.inner.broker.set_queue_attributes(&queue_url, attributes),
        )
        .await?;
        debug!(queue = %queue_arn, topic = %topic_arn, "topic delivery granted");
        Ok(())
    }

    /// Bind the context's queue to its topic and authorize delivery.
    ///
    /// The order is queue id, topic, bind, grant, record: recording comes last so a failed grant
    /// does not leave a subscribed queue without a delivery policy.
    ///
    /// The subscription is recorded only once every step succeeded; a failed attempt leaves no
    /// record, so the next call repeats the whole sequence. Broker resources created by a failed
    /// attempt are not removed.
    pub async fn subscribe(&self, context: &SubscriptionContext) -> Result<(), ClientError> {
        self.inner
            .subscription
            .get_or_try_init(|| async {
                let queue_arn = self.resolve_queue_arn(&context.queue).await?;
                let exchange = Exchange::new(
                    Arc::clone(&self.inner.broker),
                    self.inner.naming.clone(),
                    context.clone(),
                )
                .await?;
                let subscription_arn = exchange.subscribe(&queue_arn).await?;
                self.authorize(context, exchange.topic_arn()).await?;
                debug!(subscription = %subscription_arn, "subscription established");
                Ok::<_, ClientError>(Subscription {
                    subscription_arn,
                    exchange: Arc::new(exchange),
                })
            })
            .await?;
        Ok(())
    }

    /// Receive up to [`MAX_NUMBER_OF_MESSAGES`] messages from the context's queue, subscribing first
    /// if needed.
    ///
    /// Empty bodies are skipped. A body that fails to decode fails the whole batch.
    pub async fn receive(&self, context: &SubscriptionContext) -> Result<Vec<Message>, ClientError> {
        match self.subscription() {
            Ok(_) => {}
            Err(ClientError::NotSubscribed) => self
                .subscribe(context)
                .await
                .map_err(|e| ClientError::SubscribeFailed(Box::new(e)))?,
            Err(e) => return Err(e),
        }

        let queue_url = self.resolve_queue_url(&context.queue).await?;
        let request = ReceiveRequest {
            queue_url,
            max_messages: MAX_NUMBER_OF_MESSAGES,
            visibility_timeout: VISIBILITY_TIMEOUT,
            wait_time: self.inner.wait_time,
            attribute_names: vec![ATTR_SENT_TIMESTAMP.to_owned()],
            message_attribute_names: vec![ALL_MESSAGE_ATTRIBUTES.to_owned()],
        };
        let raw_messages = bounded(
            "receive_messages",
            self.inner.wait_time + ADMIN_CALL_TIMEOUT,
            self.inner.broker.receive_messages(request),
        )
        .await?;
        if raw_messages.is_empty() {
            return Ok(Vec::new());
        }

        let remover: Arc<dyn MessageRemover> = Arc::new(QueueRemover {
            mediator: self.clone(),
            queue: context.queue.clone(),
        });
        let mut messages = Vec::with_capacity(raw_messages.len());
        for raw in raw_messages {
            if let Some(message) = Message::decode(raw, Arc::clone(&remover))? {
                messages.push(message);
            }
        }
        Ok(messages)
    }

    /// Remove a consumed message from the queue named `logical`.
    pub async fn delete(&self, message: &Message, logical: &str) -> Result<(), ClientError> {
        let queue_url = self.resolve_queue_url(logical).await?;
        bounded(
            "delete_message",
            ADMIN_CALL_TIMEOUT,
            self.inner
                .broker
                .delete_message(&queue_url, message.receipt_handle()),
        )
        .await
    }
}

#[async_trait]
impl MessageSource for Mediator {
    async fn receive(&self, context: &SubscriptionContext) -> Result<Vec<Message>, ClientError> {
        Mediator::receive(self, context).await
    }

    fn wait_time(&self) -> Duration {
        Mediator::wait_time(self)
    }
}

/// Acknowledges messages against the queue they were received from.
struct QueueRemover {
    mediator: Mediator,
    queue: String,
}

#[async_trait]
impl MessageRemover for QueueRemover {
    async fn remove(&self, message: &Message) -> Result<(), ClientError> {
        self.mediator.delete(message, &self.queue).await
    }
}
