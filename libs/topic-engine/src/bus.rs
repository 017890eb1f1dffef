use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};

use exchange_api::{DeliveryError, OverflowPolicy, Record, RecordHandler};

use crate::error::TopicError;

// ═══════════════════════════════════════════════════════════════
//  Settings / Stats
// ═══════════════════════════════════════════════════════════════

/// Параметры подписок по умолчанию.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct BusSettings {
    /// Размер очереди каждого подписчика.
    #[serde(default = "default_buffer")]
    pub buffer: usize,
    /// Стратегия переполнения очереди подписчика.
    #[serde(default)]
    pub overflow: OverflowPolicy,
}

fn default_buffer() -> usize {
    1024
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            buffer: default_buffer(),
            overflow: OverflowPolicy::default(),
        }
    }
}

#[derive(Debug, Default)]
struct BusCounters {
    published: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
    handler_failures: AtomicU64,
}

/// Снимок счётчиков bus'а.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BusStats {
    /// Вызовы publish (включая topic'и без подписчиков).
    pub published: u64,
    /// Успешно обработанные handler'ами записи.
    pub delivered: u64,
    /// Записи, отброшенные из-за переполнения очереди (OverflowPolicy::Drop).
    pub dropped: u64,
    /// Ошибки и паники handler'ов.
    pub handler_failures: u64,
}

// ═══════════════════════════════════════════════════════════════
//  Subscriber
// ═══════════════════════════════════════════════════════════════

#[derive(Clone)]
struct Subscriber {
    id: u64,
    tx: mpsc::Sender<Record>,
    overflow: OverflowPolicy,
}

/// Идентификатор подписки, возвращаемый `subscribe`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    id: u64,
    topic: String,
}

impl SubscriptionHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

// ═══════════════════════════════════════════════════════════════
//  TopicBus
// ═══════════════════════════════════════════════════════════════

/// In-process publish/subscribe router.
///
/// Topic'и идентифицируются строкой и создаются неявно первой подпиской.
/// У каждой подписки своя bounded очередь и своя delivery-задача, поэтому:
/// - записи одного topic'а доходят до подписчика в порядке publish;
/// - медленный или упавший handler тормозит только свою очередь;
/// - publish не ждёт завершения handler'ов.
///
/// Истории нет: publish в topic без подписчиков молча отбрасывается,
/// поздний подписчик прошлых записей не увидит.
pub struct TopicBus {
    settings: BusSettings,
    topics: RwLock<HashMap<String, Vec<Subscriber>>>,
    next_id: AtomicU64,
    closed: AtomicBool,
    counters: Arc<BusCounters>,
}

impl Default for TopicBus {
    fn default() -> Self {
        Self::new(BusSettings::default())
    }
}

impl std::fmt::Debug for TopicBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopicBus")
            .field("settings", &self.settings)
            .field("topics", &self.topics())
            .finish()
    }
}

impl TopicBus {
    pub fn new(settings: BusSettings) -> Self {
        Self {
            settings,
            topics: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            counters: Arc::new(BusCounters::default()),
        }
    }

    /// Подписаться с параметрами bus'а по умолчанию.
    ///
    /// Спавнит delivery-задачу: вызывать внутри tokio runtime.
    pub fn subscribe<H: RecordHandler>(
        &self,
        topic: &str,
        handler: H,
    ) -> Result<SubscriptionHandle, TopicError> {
        self.subscribe_with(topic, self.settings.buffer, self.settings.overflow, handler)
    }

    pub fn subscribe_with<H: RecordHandler>(
        &self,
        topic: &str,
        buffer: usize,
        overflow: OverflowPolicy,
        handler: H,
    ) -> Result<SubscriptionHandle, TopicError> {
        let mut topics = self.write_topics();
        // Проверка под write-lock'ом: close() не может проскочить между ней и вставкой.
        if self.closed.load(Ordering::Acquire) {
            return Err(TopicError::Closed);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(buffer.max(1));
        topics
            .entry(topic.to_string())
            .or_default()
            .push(Subscriber { id, tx, overflow });
        drop(topics);

        spawn_delivery(
            topic.to_string(),
            id,
            rx,
            Arc::new(handler),
            self.counters.clone(),
        );
        tracing::debug!(topic = %topic, subscription = id, ?overflow, "subscribed");

        Ok(SubscriptionHandle {
            id,
            topic: topic.to_string(),
        })
    }

    /// Удалить подписку. Уже поставленные в очередь записи будут доставлены,
    /// после чего delivery-задача завершится.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        let removed = self.remove_subscribers(&handle.topic, &[handle.id]);
        if removed {
            tracing::debug!(topic = %handle.topic, subscription = handle.id, "unsubscribed");
        }
        removed
    }

    /// Поставить запись в очередь каждому текущему подписчику `topic`
    /// в порядке регистрации подписок. Возвращает число подписчиков,
    /// получивших запись.
    ///
    /// Подписчики получают клоны одной и той же неизменяемой записи.
    /// Полная очередь одного подписчика не задерживает доставку остальным;
    /// publisher ждёт только BackPressure-подписчиков с полной очередью.
    pub async fn publish(&self, topic: &str, record: Record) -> usize {
        self.counters.published.fetch_add(1, Ordering::Relaxed);

        // Snapshot подписчиков: lock не держится через await.
        let targets: Vec<Subscriber> = self
            .read_topics()
            .get(topic)
            .cloned()
            .unwrap_or_default();

        if targets.is_empty() {
            tracing::trace!(topic = %topic, "no subscribers, record dropped");
            return 0;
        }

        let mut enqueued = 0;
        let mut stale = Vec::new();
        // Полные очереди BackPressure-подписчиков ждут места параллельно:
        // остальные подписчики получают запись сразу.
        let mut waiting = JoinSet::new();
        for sub in targets {
            match sub.tx.try_send(record.clone()) {
                Ok(()) => enqueued += 1,
                Err(mpsc::error::TrySendError::Closed(_)) => stale.push(sub.id),
                Err(mpsc::error::TrySendError::Full(record)) => match sub.overflow {
                    OverflowPolicy::Drop => {
                        self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(topic = %topic, subscription = sub.id, "subscriber queue full, dropping");
                    }
                    OverflowPolicy::BackPressure => {
                        tracing::debug!(topic = %topic, subscription = sub.id, "subscriber queue full, waiting");
                        let Subscriber { id, tx, .. } = sub;
                        waiting.spawn(async move { (id, tx.send(record).await.is_ok()) });
                    }
                },
            }
        }

        // Publish возвращается только после всех ожидающих send'ов:
        // следующая запись не обгонит эту ни в одной очереди.
        while let Some(joined) = waiting.join_next().await {
            match joined {
                Ok((_, true)) => enqueued += 1,
                Ok((id, false)) => stale.push(id),
                Err(e) => tracing::error!(topic = %topic, error = %e, "enqueue task failed"),
            }
        }

        if !stale.is_empty() {
            tracing::warn!(topic = %topic, subscriptions = ?stale, "removing subscribers with closed delivery tasks");
            self.remove_subscribers(topic, &stale);
        }

        enqueued
    }

    /// Закрыть bus: все подписки удаляются, новые запрещены.
    /// Publish после закрытия ведёт себя как publish без подписчиков.
    pub fn close(&self) {
        let mut topics = self.write_topics();
        self.closed.store(true, Ordering::Release);
        let count: usize = topics.values().map(Vec::len).sum();
        topics.clear();
        tracing::info!(subscriptions = count, "topic bus closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.read_topics().get(topic).map_or(0, Vec::len)
    }

    /// Topic'и, у которых есть хотя бы один подписчик (отсортированы).
    pub fn topics(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read_topics().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            published: self.counters.published.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            handler_failures: self.counters.handler_failures.load(Ordering::Relaxed),
        }
    }

    fn remove_subscribers(&self, topic: &str, ids: &[u64]) -> bool {
        let mut topics = self.write_topics();
        let Some(subs) = topics.get_mut(topic) else {
            return false;
        };
        let before = subs.len();
        subs.retain(|s| !ids.contains(&s.id));
        let removed = subs.len() != before;
        if subs.is_empty() {
            topics.remove(topic);
        }
        removed
    }

    fn read_topics(&self) -> RwLockReadGuard<'_, HashMap<String, Vec<Subscriber>>> {
        match self.topics.read() {
            Ok(g) => g,
            Err(poisoned) => {
                tracing::warn!("topic bus read lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn write_topics(&self) -> RwLockWriteGuard<'_, HashMap<String, Vec<Subscriber>>> {
        match self.topics.write() {
            Ok(g) => g,
            Err(poisoned) => {
                tracing::warn!("topic bus write lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════
//  Delivery task
// ═══════════════════════════════════════════════════════════════

/// Очередь подписчика → handler, по одной записи за раз.
///
/// Каждый вызов handler'а идёт в отдельной задаче: паника превращается
/// в JoinError и не убивает цикл доставки.
fn spawn_delivery(
    topic: String,
    id: u64,
    mut rx: mpsc::Receiver<Record>,
    handler: Arc<dyn RecordHandler>,
    counters: Arc<BusCounters>,
) {
    tokio::spawn(async move {
        while let Some(record) = rx.recv().await {
            let call_handler = handler.clone();
            let call_topic = topic.clone();
            let outcome =
                tokio::spawn(async move { call_handler.handle(&call_topic, record).await }).await;

            let error = match outcome {
                Ok(Ok(())) => {
                    counters.delivered.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                Ok(Err(e)) => e,
                Err(join) => DeliveryError::Panicked(panic_message(join)),
            };
            counters.handler_failures.fetch_add(1, Ordering::Relaxed);
            tracing::error!(topic = %topic, subscription = id, error = %error, "delivery failed");
        }
        tracing::debug!(topic = %topic, subscription = id, "delivery task stopped");
    });
}

fn panic_message(err: JoinError) -> String {
    if err.is_cancelled() {
        return "cancelled".to_string();
    }
    let payload: Box<dyn Any + Send> = err.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
