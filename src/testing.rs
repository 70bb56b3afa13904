//!
//! Scripted broker recording every call, used by unit tests.
//!
use crate::broker::{BrokerApi, MessageAttributeValue, RawMessage, ReceiveRequest};
use crate::error::ClientError;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Call {
    CreateTopic(String),
    GetQueueUrl(String),
    CreateQueue(String, HashMap<String, String>),
    GetQueueAttributes(String),
    SetQueueAttributes(String, HashMap<String, String>),
    Subscribe {
        topic_arn: String,
        protocol: String,
        endpoint: String,
    },
    SetSubscriptionAttributes {
        subscription_arn: String,
        name: String,
        value: String,
    },
    Publish {
        topic_arn: String,
        body: String,
        attributes: HashMap<String, MessageAttributeValue>,
    },
    ReceiveMessages(ReceiveRequest),
    DeleteMessage {
        queue_url: String,
        receipt_handle: String,
    },
}

#[derive(Default)]
pub(crate) struct RecordingBroker {
    calls: Mutex<Vec<Call>>,
    sequence: AtomicU64,
    existing: Mutex<HashSet<String>>,
    urls: Mutex<HashMap<String, String>>,
    failing: Mutex<HashSet<&'static str>>,
    batches: Mutex<VecDeque<Vec<RawMessage>>>,
    lookup_budget: Mutex<Option<usize>>,
    lookup_delay: Duration,
}

impl RecordingBroker {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Queue that already exists on the broker.
    pub(crate) fn with_queue(self, name: &str) -> Self {
        self.existing.lock().unwrap().insert(name.to_owned());
        self
    }

    /// Make every call to `operation` fail.
    pub(crate) fn failing(self, operation: &'static str) -> Self {
        self.failing.lock().unwrap().insert(operation);
        self
    }

    pub(crate) fn with_batch(self, batch: Vec<RawMessage>) -> Self {
        self.batches.lock().unwrap().push_back(batch);
        self
    }

    /// Answer `budget` queue lookups, fail the ones after.
    pub(crate) fn with_lookup_budget(self, budget: usize) -> Self {
        *self.lookup_budget.lock().unwrap() = Some(budget);
        self
    }

    /// Delay queue url and attribute lookups.
    pub(crate) fn with_lookup_delay(mut self, delay: Duration) -> Self {
        self.lookup_delay = delay;
        self
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn count<F>(&self, predicate: F) -> usize
    where
        F: Fn(&Call) -> bool,
    {
        self.calls.lock().unwrap().iter().filter(|c| predicate(c)).count()
    }

    pub(crate) fn queue_arn(name: &str) -> String {
        format!("arn:test:queue:{}", name)
    }

    fn record(&self, operation: &'static str, call: Call) -> Result<(), ClientError> {
        self.calls.lock().unwrap().push(call);
        if self.failing.lock().unwrap().contains(operation) {
            return Err(ClientError::broker(operation, "injected failure"));
        }
        Ok(())
    }

    fn next(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }

    fn new_url(&self, name: &str) -> String {
        let url = format!("https://queue.test/{}/{}", self.next(), name);
        self.urls.lock().unwrap().insert(url.clone(), name.to_owned());
        url
    }
}

#[async_trait]
impl BrokerApi for RecordingBroker {
    async fn create_topic(&self, name: &str) -> Result<String, ClientError> {
        self.record("create_topic", Call::CreateTopic(name.to_owned()))?;
        Ok(format!("arn:test:topic:{}", name))
    }

    async fn get_queue_url(&self, name: &str) -> Result<String, ClientError> {
        self.record("get_queue_url", Call::GetQueueUrl(name.to_owned()))?;
        if !self.lookup_delay.is_zero() {
            tokio::time::sleep(self.lookup_delay).await;
        }
        if let Some(budget) = self.lookup_budget.lock().unwrap().as_mut() {
            if *budget == 0 {
                return Err(ClientError::broker("get_queue_url", "lookup budget exhausted"));
            }
            *budget -= 1;
        }
        if !self.existing.lock().unwrap().contains(name) {
            return Err(ClientError::QueueDoesNotExist(name.to_owned()));
        }
        Ok(self.new_url(name))
    }

    async fn create_queue(
        &self,
        name: &str,
        attributes: HashMap<String, String>,
    ) -> Result<String, ClientError> {
        self.record("create_queue", Call::CreateQueue(name.to_owned(), attributes))?;
        self.existing.lock().unwrap().insert(name.to_owned());
        Ok(self.new_url(name))
    }

    async fn get_queue_attributes(
        &self,
        queue_url: &str,
        names: &[&str],
    ) -> Result<HashMap<String, String>, ClientError> {
        self.record("get_queue_attributes", Call::GetQueueAttributes(queue_url.to_owned()))?;
        if !self.lookup_delay.is_zero() {
            tokio::time::sleep(self.lookup_delay).await;
        }
        let name = self
            .urls
            .lock()
            .unwrap()
            .get(queue_url)
            .cloned()
            .ok_or_else(|| ClientError::broker("get_queue_attributes", "unknown queue url"))?;
        Ok(names
            .iter()
            .filter(|n| **n == crate::broker::ATTR_QUEUE_ARN)
            .map(|n| (n.to_string(), Self::queue_arn(&name)))
            .collect())
    }

    async fn set_queue_attributes(
        &self,
        queue_url: &str,
        attributes: HashMap<String, String>,
    ) -> Result<(), ClientError> {
        self.record(
            "set_queue_attributes",
            Call::SetQueueAttributes(queue_url.to_owned(), attributes),
        )
    }

    async fn subscribe(
        &self,
        topic_arn: &str,
        protocol: &str,
        endpoint: &str,
    ) -> Result<String, ClientError> {
        self.record(
            "subscribe",
            Call::Subscribe {
                topic_arn: topic_arn.to_owned(),
                protocol: protocol.to_owned(),
                endpoint: endpoint.to_owned(),
            },
        )?;
        Ok(format!("{}:sub-{}", topic_arn, self.next()))
    }

    async fn set_subscription_attributes(
        &self,
        subscription_arn: &str,
        name: &str,
        value: &str,
    ) -> Result<(), ClientError> {
        self.record(
            "set_subscription_attributes",
            Call::SetSubscriptionAttributes {
                subscription_arn: subscription_arn.to_owned(),
                name: name.to_owned(),
                value: value.to_owned(),
            },
        )
    }

    async fn publish(
        &self,
        topic_arn: &str,
        body: &str,
        attributes: HashMap<String, MessageAttributeValue>,
    ) -> Result<String, ClientError> {
        self.record(
            "publish",
            Call::Publish {
                topic_arn: topic_arn.to_owned(),
                body: body.to_owned(),
                attributes,
            },
        )?;
        Ok(format!("publish-{}", self.next()))
    }

    async fn receive_messages(&self, request: ReceiveRequest) -> Result<Vec<RawMessage>, ClientError> {
        self.record("receive_messages", Call::ReceiveMessages(request))?;
        Ok(self.batches.lock().unwrap().pop_front().unwrap_or_default())
    }

    async fn delete_message(&self, queue_url: &str, receipt_handle: &str) -> Result<(), ClientError> {
        self.record(
            "delete_message",
            Call::DeleteMessage {
                queue_url: queue_url.to_owned(),
                receipt_handle: receipt_handle.to_owned(),
            },
        )
    }
}
