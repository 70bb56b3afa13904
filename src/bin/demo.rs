//! Publishes a few events through an in-memory broker and consumes the accepted ones.
//!
//! `RUST_LOG=debug cargo run --bin topicq-demo`
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::watch;
use topicq::memory::MemoryBroker;
use topicq::{
    ClientConfig, ClientError, Exchange, FilterPolicy, HandlerError, Mediator, Message,
    MessageHandler, Subscriber, SubscriptionAttribute, SubscriptionContext,
};
use tracing_subscriber::EnvFilter;

const EXCHANGE_NAME: &str = "topic";
const EVENT_TYPE: &str = "StatusChanged";

struct StatusHandler {
    queue: String,
}

#[async_trait]
impl MessageHandler for StatusHandler {
    fn subscription_context(&self) -> SubscriptionContext {
        SubscriptionContext::new(EXCHANGE_NAME, &self.queue)
            .with_dead_letter_queue("DLQ")
            // Drop this attribute to receive every event type.
            .with_attribute(SubscriptionAttribute::FilterPolicy(FilterPolicy::event_types(&[
                EVENT_TYPE,
            ])))
    }

    async fn handle(&self, message: Message) -> Result<(), HandlerError> {
        tracing::info!("handling: {}", message.body());
        message.ack(Ok(())).await
    }
}

#[tokio::main]
async fn main() -> Result<(), ClientError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("topicq=info")),
        )
        .init();

    let config = ClientConfig::from_env()?;
    let broker = Arc::new(MemoryBroker::new());

    let handler = Arc::new(StatusHandler {
        queue: "myqueue".to_owned(),
    });
    let mediator = Arc::new(Mediator::new(broker.clone(), &config));
    mediator.subscribe(&handler.subscription_context()).await?;

    let exchange = Exchange::new(
        broker.clone(),
        config.naming(),
        SubscriptionContext::for_topic(EXCHANGE_NAME),
    )
    .await?;
    for (payload, event_type) in [("hello", EVENT_TYPE), ("ignored", "Other"), ("world", EVENT_TYPE)] {
        let id = exchange.publish_json(&payload, event_type).await?;
        tracing::info!(id = %id, event_type, "sent: {}", payload);
    }

    let (stop, shutdown) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = stop.send(true);
        }
    });

    tracing::info!("subscriber running, press Ctrl-C to stop");
    Subscriber::new(handler, mediator).run(shutdown).await;
    Ok(())
}
