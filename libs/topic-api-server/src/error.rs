use topic_engine::TopicError;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("endpoint '{path}': {detail}")]
    Endpoint { path: String, detail: String },

    #[error("track ({topic}): {source}")]
    Track { topic: String, source: TopicError },

    #[error("bind api :{port}: {source}")]
    Bind { port: u16, source: std::io::Error },

    #[error("axum serve: {0}")]
    Serve(#[source] std::io::Error),
}
