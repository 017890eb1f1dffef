pub mod error;
pub mod handler;
pub mod record;
pub mod source;

use serde::{Deserialize, Serialize};

pub use error::{ConfigError, DeliveryError, FetchError, RecordError};
pub use handler::{handler_fn, HandlerFuture, RecordHandler};
pub use record::{Record, PROCESSED_FIELD};
pub use source::{FetchFuture, RecordSource};

// ════════════════════════════════════════════════════════════════
//  Overflow Policy
// ════════════════════════════════════════════════════════════════

/// Стратегия поведения при переполнении очереди подписчика.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// try_send(): если очередь полна, дропнуть запись, залогировать.
    /// Publisher никогда не ждёт подписчика.
    #[default]
    Drop,
    /// .send().await: publisher ждёт места в очереди (но не завершения handler'а).
    #[serde(alias = "backpressure")]
    BackPressure,
}

/// Текущее время в миллисекундах (Unix epoch).
pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
