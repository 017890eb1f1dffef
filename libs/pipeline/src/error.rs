use topic_engine::TopicError;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("adapter config ({owner}): {detail}")]
    AdapterConfig { owner: String, detail: String },

    #[error("route: {0}")]
    Route(String),

    #[error("subscription ({topic}): {source}")]
    Subscription { topic: String, source: TopicError },
}
