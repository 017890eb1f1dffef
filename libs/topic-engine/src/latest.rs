use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::watch;

use exchange_api::{now_ms, HandlerFuture, Record, RecordHandler};

use crate::bus::{SubscriptionHandle, TopicBus};
use crate::error::TopicError;

/// Значение ячейки вместе с моментом записи.
#[derive(Debug, Clone, PartialEq)]
pub struct CellSnapshot {
    pub record: Record,
    /// Unix ms последней доставки.
    pub updated_ms: i64,
}

type Slot = watch::Sender<Option<Arc<CellSnapshot>>>;

struct Cell {
    slot: Arc<Slot>,
    subscription: SubscriptionHandle,
}

/// Единственный писатель ячейки: подписка, созданная в `track`.
struct CellWriter {
    slot: Arc<Slot>,
}

impl RecordHandler for CellWriter {
    fn handle<'a>(&'a self, topic: &'a str, record: Record) -> HandlerFuture<'a> {
        let snapshot = Arc::new(CellSnapshot {
            record,
            updated_ms: now_ms(),
        });
        self.slot.send_replace(Some(snapshot));
        tracing::debug!(topic = %topic, "latest value updated");
        Box::pin(async { Ok(()) })
    }
}

// ═══════════════════════════════════════════════════════════════
//  LatestValueCache
// ═══════════════════════════════════════════════════════════════

/// Последнее доставленное значение для каждого отслеживаемого topic'а.
///
/// Мост между асинхронными publish и синхронным чтением. Ячейка это
/// `watch` канал, доставка делает один `send_replace`, читатель берёт
/// `Arc` текущего снимка. Частично обновлённое значение увидеть нельзя.
///
/// Подписка на topic создаётся один раз в `track`; путь чтения
/// (`get`, `snapshot`) ничего не регистрирует в bus'е.
#[derive(Default)]
pub struct LatestValueCache {
    cells: RwLock<HashMap<String, Cell>>,
}

impl std::fmt::Debug for LatestValueCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LatestValueCache")
            .field("topics", &self.topics())
            .finish()
    }
}

impl LatestValueCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Начать отслеживать `topic`. Идемпотентно: повторный вызов
    /// возвращает уже существующую подписку и не создаёт новую.
    pub fn track(&self, bus: &TopicBus, topic: &str) -> Result<SubscriptionHandle, TopicError> {
        let mut cells = self.write_cells();
        if let Some(cell) = cells.get(topic) {
            tracing::debug!(topic = %topic, subscription = cell.subscription.id(), "topic already tracked");
            return Ok(cell.subscription.clone());
        }

        let (slot, _) = watch::channel(None);
        let slot = Arc::new(slot);
        let subscription = bus.subscribe(topic, CellWriter { slot: slot.clone() })?;
        cells.insert(
            topic.to_string(),
            Cell {
                slot,
                subscription: subscription.clone(),
            },
        );
        tracing::info!(topic = %topic, subscription = subscription.id(), "tracking latest value");
        Ok(subscription)
    }

    /// Текущая запись topic'а. `None`: ещё ничего не доставлено
    /// (или topic не отслеживается). Никогда не блокируется на I/O.
    pub fn get(&self, topic: &str) -> Option<Record> {
        self.snapshot(topic).map(|s| s.record.clone())
    }

    pub fn snapshot(&self, topic: &str) -> Option<Arc<CellSnapshot>> {
        self.read_cells().get(topic)?.slot.borrow().clone()
    }

    /// Receiver изменений ячейки (`None` если topic не отслеживается).
    pub fn watch(&self, topic: &str) -> Option<watch::Receiver<Option<Arc<CellSnapshot>>>> {
        self.read_cells().get(topic).map(|cell| cell.slot.subscribe())
    }

    pub fn topics(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read_cells().keys().cloned().collect();
        names.sort();
        names
    }

    fn read_cells(&self) -> RwLockReadGuard<'_, HashMap<String, Cell>> {
        match self.cells.read() {
            Ok(g) => g,
            Err(poisoned) => {
                tracing::warn!("latest value cache read lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn write_cells(&self) -> RwLockWriteGuard<'_, HashMap<String, Cell>> {
        match self.cells.write() {
            Ok(g) => g,
            Err(poisoned) => {
                tracing::warn!("latest value cache write lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }
}
