use std::future::Future;
use std::pin::Pin;

use crate::error::DeliveryError;
use crate::record::Record;

pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = Result<(), DeliveryError>> + Send + 'a>>;

/// Обработчик записей, доставленных подпиской на topic.
///
/// Вызывается на delivery-задаче своей подписки, строго по порядку publish.
/// Ошибка или паника handler'а не влияет на других подписчиков.
pub trait RecordHandler: Send + Sync + 'static {
    fn handle<'a>(&'a self, topic: &'a str, record: Record) -> HandlerFuture<'a>;
}

struct FnHandler<F>(F);

impl<F> RecordHandler for FnHandler<F>
where
    F: Fn(&str, Record) -> Result<(), DeliveryError> + Send + Sync + 'static,
{
    fn handle<'a>(&'a self, topic: &'a str, record: Record) -> HandlerFuture<'a> {
        let result = (self.0)(topic, record);
        Box::pin(async move { result })
    }
}

/// Синхронная функция как handler.
pub fn handler_fn<F>(f: F) -> impl RecordHandler
where
    F: Fn(&str, Record) -> Result<(), DeliveryError> + Send + Sync + 'static,
{
    FnHandler(f)
}
