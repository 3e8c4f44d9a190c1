use thiserror::Error;

/// Errors from publishing an event.
#[derive(Debug, Error)]
pub enum PublishError {
    /// The consumer loop is gone.
    #[error("producer {0} is closed")]
    Closed(String),

    /// No tokio runtime was available to defer the send.
    #[error("producer {0} has no runtime to defer a send")]
    NoRuntime(String),
}

/// Errors from handling one event in a consumer.
#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Failed(String),
}
