use std::future::Future;
use std::pin::Pin;

use crate::error::FetchError;
use crate::record::Record;

pub type FetchFuture<'a> = Pin<Box<dyn Future<Output = Result<Vec<Record>, FetchError>> + Send + 'a>>;

/// Source-адаптер: один fetch на tick poller'а.
///
/// Возвращает ноль или больше записей; каждая публикуется отдельным вызовом.
/// Future может быть отброшен в любой момент (остановка poller'а, timeout).
pub trait RecordSource: Send + Sync {
    /// Имя адаптера для логов.
    fn kind(&self) -> &'static str;

    fn fetch(&self) -> FetchFuture<'_>;
}
