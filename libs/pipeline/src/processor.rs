use std::collections::HashSet;
use std::sync::Arc;

use exchange_api::{HandlerFuture, PROCESSED_FIELD, Record, RecordHandler};
use serde_json::Value;
use topic_engine::{SubscriptionHandle, TopicBus};

use crate::config::RouteConfig;
use crate::error::PipelineError;

/// Производная запись: все поля исходной + `processed = true`.
///
/// Исходная запись не меняется (её видят и другие подписчики raw topic'а).
/// Существующее поле `processed` перезаписывается.
pub fn annotate(record: &Record) -> Record {
    record.with_field(PROCESSED_FIELD, Value::Bool(true))
}

/// Маршруты должны образовывать набор независимых пар raw → processed:
/// без повторов с каждой стороны и без processed topic'а, который сам является raw.
/// Иначе processor начал бы читать собственный вывод.
pub fn validate_routes(routes: &[RouteConfig]) -> Result<(), PipelineError> {
    let mut raws = HashSet::new();
    let mut processed = HashSet::new();

    for route in routes {
        if route.raw.is_empty() || route.processed.is_empty() {
            return Err(PipelineError::Route(format!(
                "empty topic in route '{}' -> '{}'",
                route.raw, route.processed
            )));
        }
        if route.raw == route.processed {
            return Err(PipelineError::Route(format!(
                "route '{}' publishes into its own input",
                route.raw
            )));
        }
        if !raws.insert(route.raw.as_str()) {
            return Err(PipelineError::Route(format!(
                "raw topic '{}' is routed more than once",
                route.raw
            )));
        }
        if !processed.insert(route.processed.as_str()) {
            return Err(PipelineError::Route(format!(
                "processed topic '{}' has more than one raw input",
                route.processed
            )));
        }
    }

    if let Some(topic) = processed.iter().find(|t| raws.contains(*t)) {
        return Err(PipelineError::Route(format!(
            "topic '{topic}' is both a raw input and a processed output"
        )));
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════════
//  Processor
// ═══════════════════════════════════════════════════════════════

struct Annotator {
    target: String,
    bus: Arc<TopicBus>,
}

impl RecordHandler for Annotator {
    fn handle<'a>(&'a self, topic: &'a str, record: Record) -> HandlerFuture<'a> {
        Box::pin(async move {
            let derived = annotate(&record);
            let subscribers = self.bus.publish(&self.target, derived).await;
            tracing::debug!(raw = %topic, processed = %self.target, subscribers, "record annotated");
            Ok(())
        })
    }
}

/// Подписчик raw topic'ов: каждая полученная запись публикуется
/// в парный processed topic с маркером `processed = true`.
///
/// Без состояния: одна и та же запись, полученная дважды, даёт
/// две одинаковые производные записи.
pub struct Processor {
    bus: Arc<TopicBus>,
    routes: Vec<RouteConfig>,
    subscriptions: Vec<SubscriptionHandle>,
}

impl std::fmt::Debug for Processor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Processor")
            .field("routes", &self.routes)
            .finish()
    }
}

impl Processor {
    /// Проверить маршруты и подписаться на каждый raw topic.
    ///
    /// При ошибке подписки уже созданные подписки снимаются.
    pub fn start(bus: Arc<TopicBus>, routes: &[RouteConfig]) -> Result<Self, PipelineError> {
        validate_routes(routes)?;

        let mut subscriptions = Vec::with_capacity(routes.len());
        for route in routes {
            let handler = Annotator {
                target: route.processed.clone(),
                bus: bus.clone(),
            };
            match bus.subscribe(&route.raw, handler) {
                Ok(handle) => {
                    tracing::info!(raw = %route.raw, processed = %route.processed, "route registered");
                    subscriptions.push(handle);
                }
                Err(source) => {
                    for handle in &subscriptions {
                        bus.unsubscribe(handle);
                    }
                    return Err(PipelineError::Subscription {
                        topic: route.raw.clone(),
                        source,
                    });
                }
            }
        }

        Ok(Self {
            bus,
            routes: routes.to_vec(),
            subscriptions,
        })
    }

    pub fn routes(&self) -> &[RouteConfig] {
        &self.routes
    }

    pub fn subscriptions(&self) -> &[SubscriptionHandle] {
        &self.subscriptions
    }

    /// Снять все подписки processor'а.
    pub fn stop(self) {
        for handle in &self.subscriptions {
            self.bus.unsubscribe(handle);
        }
        tracing::info!(routes = self.routes.len(), "processor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use exchange_api::{DeliveryError, handler_fn};
    use serde_json::json;
    use tokio::sync::mpsc;

    fn record(value: Value) -> Record {
        Record::from_value(value).unwrap()
    }

    fn collect(bus: &TopicBus, topic: &str) -> mpsc::UnboundedReceiver<Record> {
        let (tx, rx) = mpsc::unbounded_channel();
        bus.subscribe(
            topic,
            handler_fn(move |_, record| {
                tx.send(record).map_err(|e| DeliveryError::handler(e.to_string()))
            }),
        )
        .unwrap();
        rx
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<Record>) -> Record {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("no record delivered")
            .unwrap()
    }

    #[test]
    fn test_annotate_adds_marker_and_keeps_input() {
        let input = record(json!({"id": 1, "title": "foo"}));
        let output = annotate(&input);

        assert_eq!(output.to_value(), json!({"id": 1, "title": "foo", "processed": true}));
        assert_eq!(input.to_value(), json!({"id": 1, "title": "foo"}));
    }

    #[test]
    fn test_annotate_overwrites_existing_marker() {
        let input = record(json!({"processed": "no"}));
        assert_eq!(annotate(&input).to_value(), json!({"processed": true}));
        assert_eq!(annotate(&Record::new()).to_value(), json!({"processed": true}));
    }

    #[test]
    fn test_route_validation() {
        let ok = [
            RouteConfig::new("api.data", "processed.api.data"),
            RouteConfig::new("db.data", "processed.db.data"),
        ];
        assert!(validate_routes(&ok).is_ok());
        assert!(validate_routes(&[]).is_ok());

        let duplicate_raw = [
            RouteConfig::new("api.data", "a"),
            RouteConfig::new("api.data", "b"),
        ];
        let duplicate_processed = [
            RouteConfig::new("api.data", "out"),
            RouteConfig::new("db.data", "out"),
        ];
        let chained = [
            RouteConfig::new("api.data", "mid"),
            RouteConfig::new("mid", "out"),
        ];
        let self_loop = [RouteConfig::new("api.data", "api.data")];
        let empty = [RouteConfig::new("", "out")];

        for bad in [
            &duplicate_raw[..],
            &duplicate_processed[..],
            &chained[..],
            &self_loop[..],
            &empty[..],
        ] {
            assert!(matches!(validate_routes(bad), Err(PipelineError::Route(_))));
        }
    }

    #[tokio::test]
    async fn test_records_follow_their_route() {
        let bus = Arc::new(TopicBus::default());
        let mut api = collect(&bus, "processed.api.data");
        let mut db = collect(&bus, "processed.db.data");
        let processor = Processor::start(
            bus.clone(),
            &[
                RouteConfig::new("api.data", "processed.api.data"),
                RouteConfig::new("db.data", "processed.db.data"),
            ],
        )
        .unwrap();
        assert_eq!(processor.subscriptions().len(), 2);

        bus.publish("api.data", record(json!({"id": 1}))).await;
        bus.publish("db.data", record(json!({"name": "Ann"}))).await;

        assert_eq!(next(&mut api).await.to_value(), json!({"id": 1, "processed": true}));
        assert_eq!(next(&mut db).await.to_value(), json!({"name": "Ann", "processed": true}));
        processor.stop();
    }

    #[tokio::test]
    async fn test_same_record_twice_yields_two_equal_outputs() {
        let bus = Arc::new(TopicBus::default());
        let mut out = collect(&bus, "processed.api.data");
        let processor =
            Processor::start(bus.clone(), &[RouteConfig::new("api.data", "processed.api.data")])
                .unwrap();

        let input = record(json!({"id": 7}));
        bus.publish("api.data", input.clone()).await;
        bus.publish("api.data", input.clone()).await;

        let first = next(&mut out).await;
        let second = next(&mut out).await;
        assert_eq!(first, second);
        assert_eq!(input.get(PROCESSED_FIELD), None);
        processor.stop();
    }

    #[tokio::test]
    async fn test_raw_subscribers_see_unmodified_record() {
        let bus = Arc::new(TopicBus::default());
        let mut raw = collect(&bus, "api.data");
        let processor =
            Processor::start(bus.clone(), &[RouteConfig::new("api.data", "processed.api.data")])
                .unwrap();

        bus.publish("api.data", record(json!({"id": 1}))).await;
        assert_eq!(next(&mut raw).await.to_value(), json!({"id": 1}));
        processor.stop();
    }

    #[tokio::test]
    async fn test_stop_unsubscribes_routes() {
        let bus = Arc::new(TopicBus::default());
        let processor =
            Processor::start(bus.clone(), &[RouteConfig::new("api.data", "processed.api.data")])
                .unwrap();
        assert_eq!(bus.subscriber_count("api.data"), 1);

        processor.stop();
        assert_eq!(bus.subscriber_count("api.data"), 0);
    }

    #[tokio::test]
    async fn test_start_on_closed_bus_fails() {
        let bus = Arc::new(TopicBus::default());
        bus.close();

        let err = Processor::start(bus, &[RouteConfig::new("api.data", "processed.api.data")])
            .unwrap_err();
        assert!(matches!(err, PipelineError::Subscription { .. }));
    }
}
