use thiserror::Error;

/// Ошибка source-адаптера при выполнении одного fetch.
///
/// Poller логирует её и пропускает tick; таймер продолжает работать.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// Сеть / соединение (DNS, connect, reset, TLS).
    #[error("transport: {0}")]
    Transport(String),

    /// Источник ответил не-2xx статусом.
    #[error("status {status}: {body}")]
    Status { status: u16, body: String },

    /// Ответ получен, но не является документом (JSON object).
    #[error("decode: {0}")]
    Decode(String),

    /// Fetch не уложился в отведённое время.
    #[error("timed out after {0} ms")]
    Timeout(u64),

    /// Источник недоступен или неверно сконфигурирован.
    #[error("unavailable: {0}")]
    Unavailable(String),
}

impl From<RecordError> for FetchError {
    fn from(e: RecordError) -> Self {
        FetchError::Decode(e.to_string())
    }
}

/// Неверная конфигурация source-адаптера: ошибка старта, а не tick'а.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct ConfigError(pub String);

impl ConfigError {
    pub fn new(msg: impl Into<String>) -> Self {
        ConfigError(msg.into())
    }
}

impl From<ConfigError> for FetchError {
    fn from(e: ConfigError) -> Self {
        FetchError::Unavailable(e.0)
    }
}

/// Ошибка handler'а при обработке доставленной записи.
///
/// Перехватывается на границе доставки bus'а и только логируется.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("handler: {0}")]
    Handler(String),

    /// Handler запаниковал; bus изолирует панику в отдельной задаче.
    #[error("handler panicked: {0}")]
    Panicked(String),
}

impl DeliveryError {
    pub fn handler(msg: impl Into<String>) -> Self {
        DeliveryError::Handler(msg.into())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordError {
    #[error("expected JSON object, got {0}")]
    NotAnObject(&'static str),
}
