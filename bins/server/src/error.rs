use exchange_api::ConfigError;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("config ({context}): {detail}")]
    Config { context: &'static str, detail: String },

    #[error("source [{name}]: {source}")]
    Adapter { name: String, source: ConfigError },

    #[error("{0}")]
    Pipeline(#[from] pipeline::PipelineError),

    #[error("{0}")]
    Api(#[from] topic_api_server::ApiError),

    #[error("api task: {0}")]
    ApiTask(#[from] tokio::task::JoinError),

    #[error("signal: {0}")]
    Signal(#[from] std::io::Error),
}
