use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use exchange_api::{FetchError, Record, RecordSource};
use topic_engine::TopicBus;

use crate::config::OverlapPolicy;

// ═══════════════════════════════════════════════════════════════
//  Settings / Stats
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
pub struct PollerSettings {
    pub name: String,
    pub topic: String,
    pub interval: Duration,
    pub overlap: OverlapPolicy,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Default)]
struct PollerCounters {
    ticks: AtomicU64,
    fetches: AtomicU64,
    failures: AtomicU64,
    published: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollerStats {
    /// Tick'и, на которых был запущен fetch.
    pub ticks: u64,
    /// Успешные fetch.
    pub fetches: u64,
    pub failures: u64,
    /// Записи, переданные в publish.
    pub published: u64,
}

// ═══════════════════════════════════════════════════════════════
//  Poller
// ═══════════════════════════════════════════════════════════════

/// Таймерный producer: один fetch на tick → publish каждой записи в topic.
///
/// Fetch'и одного poller'а никогда не пересекаются: fetch выполняется
/// прямо в цикле tick'ов, а tick'и, пришедшие во время fetch, обрабатываются
/// согласно `OverlapPolicy`. Ошибка fetch логируется, таймер продолжает работу.
pub struct Poller {
    name: String,
    token: CancellationToken,
    handle: JoinHandle<()>,
    counters: Arc<PollerCounters>,
}

impl Poller {
    /// Запустить poller. Первый tick срабатывает сразу.
    ///
    /// `token` это родительский токен, его отмена (shutdown) останавливает
    /// poller так же, как `stop()`.
    pub fn start(
        settings: PollerSettings,
        source: Arc<dyn RecordSource>,
        bus: Arc<TopicBus>,
        token: &CancellationToken,
    ) -> Self {
        let token = token.child_token();
        let counters = Arc::new(PollerCounters::default());
        let name = settings.name.clone();
        let handle = tokio::spawn(run_poller(
            settings,
            source,
            bus,
            token.clone(),
            counters.clone(),
        ));
        Self {
            name,
            token,
            handle,
            counters,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stats(&self) -> PollerStats {
        PollerStats {
            ticks: self.counters.ticks.load(Ordering::Relaxed),
            fetches: self.counters.fetches.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
            published: self.counters.published.load(Ordering::Relaxed),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Остановить таймер. Незавершённый fetch отбрасывается вместе
    /// с результатом: после `stop()` poller ничего не публикует.
    pub async fn stop(self) {
        self.token.cancel();
        if let Err(e) = self.handle.await {
            tracing::error!(source = %self.name, error = %e, "poller task failed");
        }
    }
}

async fn run_poller(
    settings: PollerSettings,
    source: Arc<dyn RecordSource>,
    bus: Arc<TopicBus>,
    token: CancellationToken,
    counters: Arc<PollerCounters>,
) {
    let PollerSettings {
        name,
        topic,
        interval,
        overlap,
        timeout,
    } = settings;

    tracing::info!(
        source = %name,
        adapter = source.kind(),
        topic = %topic,
        interval_ms = interval.as_millis() as u64,
        ?overlap,
        "poller started"
    );

    let start = Instant::now();
    let mut deadline = start;
    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = tokio::time::sleep_until(deadline) => {}
        }
        counters.ticks.fetch_add(1, Ordering::Relaxed);

        let started = Instant::now();
        let result = tokio::select! {
            biased;
            _ = token.cancelled() => {
                tracing::debug!(source = %name, "stopped during fetch, result discarded");
                break;
            }
            result = fetch_once(&*source, timeout) => result,
        };

        let now = Instant::now();
        deadline = next_deadline(start, deadline, now, interval, overlap);
        if now.duration_since(started) > interval {
            tracing::debug!(
                source = %name,
                elapsed_ms = now.duration_since(started).as_millis() as u64,
                ?overlap,
                "fetch outlasted interval"
            );
        }

        match result {
            Ok(records) => {
                counters.fetches.fetch_add(1, Ordering::Relaxed);
                if records.is_empty() {
                    tracing::debug!(source = %name, "fetch returned no records");
                }
                let count = records.len();
                for record in records {
                    // BackPressure может держать publish сколь угодно долго.
                    let subscribers = tokio::select! {
                        biased;
                        _ = token.cancelled() => break,
                        subscribers = bus.publish(&topic, record) => subscribers,
                    };
                    counters.published.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(source = %name, topic = %topic, subscribers, "published record");
                }
                tracing::debug!(source = %name, records = count, "tick complete");
            }
            Err(e) => {
                counters.failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(source = %name, adapter = source.kind(), error = %e, "fetch failed, tick skipped");
            }
        }
    }

    tracing::info!(source = %name, "poller stopped");
}

/// Момент следующего fetch после завершения текущего в `now`.
///
/// `Skip`: ближайший слот расписания `start + k * interval` строго после `now`.
/// `Delay`: обычный следующий слот, а если он уже прошёл, то сразу (`now`),
/// и дальше расписание отсчитывается от этого момента.
fn next_deadline(
    start: Instant,
    current: Instant,
    now: Instant,
    interval: Duration,
    overlap: OverlapPolicy,
) -> Instant {
    match overlap {
        OverlapPolicy::Skip => {
            let step = interval.as_nanos().max(1);
            let into_slot = now.duration_since(start).as_nanos() % step;
            let into_slot = Duration::from_nanos(u64::try_from(into_slot).unwrap_or(u64::MAX));
            now + interval.saturating_sub(into_slot)
        }
        OverlapPolicy::Delay => {
            let regular = current + interval;
            if regular > now { regular } else { now }
        }
    }
}

async fn fetch_once(
    source: &dyn RecordSource,
    timeout: Option<Duration>,
) -> Result<Vec<Record>, FetchError> {
    match timeout {
        Some(limit) => tokio::time::timeout(limit, source.fetch())
            .await
            .map_err(|_| FetchError::Timeout(limit.as_millis() as u64))?,
        None => source.fetch().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    use exchange_api::{
        DeliveryError, FetchFuture, HandlerFuture, OverflowPolicy, RecordHandler, handler_fn,
    };
    use serde_json::json;
    use tokio::sync::mpsc;

    const INTERVAL: Duration = Duration::from_millis(100);

    /// Source с заранее заданными ответами и искусственной задержкой.
    #[derive(Default)]
    struct ScriptedSource {
        responses: Mutex<VecDeque<Result<Vec<Record>, FetchError>>>,
        delay: Duration,
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl ScriptedSource {
        fn new(responses: Vec<Result<Vec<Record>, FetchError>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                ..Self::default()
            }
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl RecordSource for ScriptedSource {
        fn kind(&self) -> &'static str {
            "scripted"
        }

        fn fetch(&self) -> FetchFuture<'_> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                self.max_in_flight.fetch_max(now, Ordering::SeqCst);
                if !self.delay.is_zero() {
                    tokio::time::sleep(self.delay).await;
                }
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
                self.responses
                    .lock()
                    .unwrap()
                    .pop_front()
                    .unwrap_or_else(|| Ok(Vec::new()))
            })
        }
    }

    /// Подписчик, который никогда не освобождает свою очередь.
    struct Stalled;

    impl RecordHandler for Stalled {
        fn handle<'a>(&'a self, _topic: &'a str, _record: Record) -> HandlerFuture<'a> {
            Box::pin(std::future::pending())
        }
    }

    fn record(id: i64) -> Record {
        Record::from_value(json!({ "id": id })).unwrap()
    }

    fn settings(overlap: OverlapPolicy) -> PollerSettings {
        PollerSettings {
            name: "test".into(),
            topic: "raw".into(),
            interval: INTERVAL,
            overlap,
            timeout: None,
        }
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

    #[tokio::test(start_paused = true)]
    async fn test_first_tick_fires_immediately() {
        let bus = Arc::new(TopicBus::default());
        let mut rx = collect(&bus, "raw");
        let source = Arc::new(ScriptedSource::new(vec![Ok(vec![record(1)])]));
        let token = CancellationToken::new();

        let poller = Poller::start(settings(OverlapPolicy::Skip), source.clone(), bus, &token);

        let got = tokio::time::timeout(INTERVAL / 2, rx.recv()).await.unwrap();
        assert_eq!(got, Some(record(1)));
        assert_eq!(source.calls(), 1);
        poller.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_fan_out_publishes_each_item_in_order() {
        let bus = Arc::new(TopicBus::default());
        let mut rx = collect(&bus, "raw");
        let source = Arc::new(ScriptedSource::new(vec![Ok(vec![
            record(1),
            record(2),
            record(3),
        ])]));
        let token = CancellationToken::new();

        let poller = Poller::start(settings(OverlapPolicy::Skip), source, bus, &token);

        for id in 1..=3 {
            assert_eq!(rx.recv().await, Some(record(id)));
        }
        assert_eq!(poller.stats().published, 3);
        poller.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_tick_keeps_timer_running() {
        let bus = Arc::new(TopicBus::default());
        let mut rx = collect(&bus, "raw");
        let source = Arc::new(ScriptedSource::new(vec![
            Err(FetchError::Transport("connection refused".into())),
            Err(FetchError::Status {
                status: 503,
                body: "unavailable".into(),
            }),
            Ok(vec![record(42)]),
        ]));
        let token = CancellationToken::new();

        let poller = Poller::start(settings(OverlapPolicy::Skip), source.clone(), bus, &token);

        assert_eq!(rx.recv().await, Some(record(42)));
        let stats = poller.stats();
        assert_eq!(stats.failures, 2);
        assert_eq!(stats.fetches, 1);
        assert_eq!(source.calls(), 3);
        poller.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_result_publishes_nothing() {
        let bus = Arc::new(TopicBus::default());
        let mut rx = collect(&bus, "raw");
        let source = Arc::new(ScriptedSource::new(vec![Ok(Vec::new())]));
        let token = CancellationToken::new();

        let poller = Poller::start(settings(OverlapPolicy::Skip), source, bus.clone(), &token);
        tokio::time::sleep(INTERVAL * 3 + INTERVAL / 2).await;

        assert!(rx.try_recv().is_err());
        assert_eq!(poller.stats().published, 0);
        assert_eq!(poller.stats().fetches, 4);
        assert_eq!(bus.stats().published, 0);
        poller.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_fetch_skips_ticks() {
        let bus = Arc::new(TopicBus::default());
        let source = Arc::new(ScriptedSource::default().with_delay(INTERVAL * 5 / 2));
        let token = CancellationToken::new();

        let poller = Poller::start(settings(OverlapPolicy::Skip), source.clone(), bus, &token);
        // Fetch'и на t=0, 300, 600: tick'и 100/200, 400/500 пропущены.
        tokio::time::sleep(INTERVAL * 7 + Duration::from_millis(75)).await;

        assert_eq!(source.max_in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(source.calls(), 3);
        poller.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_policy_never_overlaps() {
        let bus = Arc::new(TopicBus::default());
        let source = Arc::new(ScriptedSource::default().with_delay(INTERVAL * 5 / 2));
        let token = CancellationToken::new();

        let poller = Poller::start(settings(OverlapPolicy::Delay), source.clone(), bus, &token);
        // Отложенный tick срабатывает сразу по завершении: t=0, 250, 500, 750.
        tokio::time::sleep(INTERVAL * 7 + Duration::from_millis(75)).await;

        assert_eq!(source.max_in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(source.calls(), 4);
        poller.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_discards_in_flight_fetch() {
        let bus = Arc::new(TopicBus::default());
        let mut rx = collect(&bus, "raw");
        let source = Arc::new(
            ScriptedSource::new(vec![Ok(vec![record(1)])]).with_delay(INTERVAL * 10),
        );
        let token = CancellationToken::new();

        let poller = Poller::start(settings(OverlapPolicy::Skip), source.clone(), bus, &token);
        tokio::time::sleep(INTERVAL).await;
        assert_eq!(source.calls(), 1);

        poller.stop().await;
        tokio::time::sleep(INTERVAL * 20).await;

        assert!(rx.try_recv().is_err());
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_interrupts_blocked_publish() {
        let bus = Arc::new(TopicBus::default());
        bus.subscribe_with("raw", 1, OverflowPolicy::BackPressure, Stalled)
            .unwrap();
        let source = Arc::new(ScriptedSource::new(vec![Ok((0..5).map(record).collect())]));
        let token = CancellationToken::new();

        let poller = Poller::start(settings(OverlapPolicy::Skip), source, bus, &token);
        tokio::time::sleep(INTERVAL / 2).await;
        assert!(poller.stats().published < 5);

        tokio::time::timeout(INTERVAL, poller.stop())
            .await
            .expect("stop hung on a blocked publish");
    }

    #[tokio::test(start_paused = true)]
    async fn test_parent_token_stops_poller() {
        let bus = Arc::new(TopicBus::default());
        let source = Arc::new(ScriptedSource::default());
        let token = CancellationToken::new();

        let poller = Poller::start(settings(OverlapPolicy::Skip), source, bus, &token);
        token.cancel();
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert!(poller.is_finished());
        assert_eq!(poller.name(), "test");
    }

    #[test]
    fn test_skip_deadline_on_long_uptime() {
        let interval = Duration::from_millis(1);
        let start = Instant::now();
        // Больше u32::MAX интервалов с момента старта.
        let now = start + Duration::from_secs(50 * 24 * 3600) + Duration::from_micros(400);

        let next = next_deadline(start, start, now, interval, OverlapPolicy::Skip);
        assert_eq!(next, now + Duration::from_micros(600));

        let on_slot = start + interval * 3;
        let next = next_deadline(start, start, on_slot, interval, OverlapPolicy::Skip);
        assert_eq!(next, on_slot + interval);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_fetch_times_out() {
        let bus = Arc::new(TopicBus::default());
        let source = Arc::new(ScriptedSource::default().with_delay(INTERVAL * 2));
        let token = CancellationToken::new();
        let mut cfg = settings(OverlapPolicy::Skip);
        cfg.timeout = Some(INTERVAL / 2);

        let poller = Poller::start(cfg, source, bus, &token);
        tokio::time::sleep(INTERVAL * 3 / 4).await;

        let stats = poller.stats();
        assert_eq!(stats.failures, 1);
        assert_eq!(stats.fetches, 0);
        poller.stop().await;
    }
}
