#[derive(Debug, thiserror::Error)]
pub enum TopicError {
    #[error("topic bus is closed")]
    Closed,
}
