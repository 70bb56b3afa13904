use thiserror::Error;

/// Error returned by application handlers. Handlers own their error types,
/// the subscriber loop only needs to log them.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Broker call `{operation}` failed: {message}")]
    Broker {
        operation: &'static str,
        message: String,
    },

    #[error("Queue `{0}` does not exist")]
    QueueDoesNotExist(String),

    #[error("Timeout when calling `{0}`")]
    Timeout(&'static str),

    #[error("Invalid message body: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("Failed to encode {what}: {source}")]
    Encode {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("No subscription has been established")]
    NotSubscribed,

    #[error("Subscribe on demand failed: {0}")]
    SubscribeFailed(#[source] Box<ClientError>),

    #[error("Queue `{0}` is not registered")]
    UnknownQueue(String),

    #[error("Broker response lacks attribute `{0}`")]
    MissingAttribute(String),

    #[error("Invalid configuration `{0}`")]
    InvalidConfig(String),

    #[error("unknown client error")]
    Unknown,
}

impl ClientError {
    pub(crate) fn broker(operation: &'static str, message: impl Into<String>) -> Self {
        ClientError::Broker {
            operation,
            message: message.into(),
        }
    }
}
