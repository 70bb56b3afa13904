//!
//! This module defines the polling subscriber that feeds received messages to an application handler.
//!
use crate::error::{ClientError, HandlerError};
use crate::message::Message;
use crate::subscription::SubscriptionContext;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Where messages come from.
#[async_trait]
pub trait MessageSource: Send + Sync {
    async fn receive(&self, context: &SubscriptionContext) -> Result<Vec<Message>, ClientError>;

    /// Pause between two polling cycles.
    fn wait_time(&self) -> Duration;
}

/// Application logic consuming messages.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Called on every cycle; must be cheap and side-effect free.
    fn subscription_context(&self) -> SubscriptionContext;

    /// Handle one message. The handler acknowledges it, typically with `message.ack(result)`.
    /// An error leaves the message in the queue until its visibility timeout expires.
    async fn handle(&self, message: Message) -> Result<(), HandlerError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberState {
    /// Between two cycles.
    Idle,

    /// Receiving or dispatching.
    Polling,
}

/// Counters of a single polling cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollOutcome {
    pub received: usize,
    pub handled: usize,
    pub failed: usize,
}

pub struct Subscriber {
    handler: Arc<dyn MessageHandler>,
    source: Arc<dyn MessageSource>,
    state: watch::Sender<SubscriberState>,
}

impl Subscriber {
    pub fn new(handler: Arc<dyn MessageHandler>, source: Arc<dyn MessageSource>) -> Self {
        let (state, _) = watch::channel(SubscriberState::Idle);
        Self {
            handler,
            source,
            state,
        }
    }

    pub fn state(&self) -> watch::Receiver<SubscriberState> {
        self.state.subscribe()
    }

    /// Receive once and dispatch every message, in order, to the handler.
    ///
    /// Handler failures are logged and counted; only a failed receive is returned as an error.
    pub async fn poll_once(&self) -> Result<PollOutcome, ClientError> {
        self.state.send_replace(SubscriberState::Polling);
        let outcome = self.dispatch().await;
        self.state.send_replace(SubscriberState::Idle);
        outcome
    }

    async fn dispatch(&self) -> Result<PollOutcome, ClientError> {
        let context = self.handler.subscription_context();
        let messages = self.source.receive(&context).await?;
        let mut outcome = PollOutcome {
            received: messages.len(),
            ..Default::default()
        };
        if messages.is_empty() {
            return Ok(outcome);
        }

        info!(count = messages.len(), queue = %context.queue, "received messages");
        for message in messages {
            let message_id = message.message_id().to_owned();
            debug!(message_id = %message_id, body = %message.body(), "received");
            match self.handler.handle(message).await {
                Ok(()) => outcome.handled += 1,
                Err(e) => {
                    outcome.failed += 1;
                    warn!(message_id = %message_id, "unacknowledged: {}", e);
                }
            }
        }
        Ok(outcome)
    }

    /// Poll until `shutdown` turns `true` or its sender is dropped.
    ///
    /// A failed cycle is logged and the loop carries on after the usual pause. The pause is cut
    /// short by shutdown only, other updates of the channel are ignored; a cycle in progress is
    /// allowed to finish.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            if let Err(e) = self.poll_once().await {
                error!("polling cycle failed: {}", e);
            }
            tokio::select! {
                _ = tokio::time::sleep(self.source.wait_time()) => {}
                // Only a `true` update or a dropped sender ends the pause early.
                _ = async {
                    let _ = shutdown.wait_for(|stop| *stop).await;
                } => break,
            }
        }
        info!("subscriber stopped");
    }
}
