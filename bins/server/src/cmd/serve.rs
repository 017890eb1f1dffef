use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::{ServeArgs, ServerConfig, SourceConfig};
use crate::error::ServerError;
use exchange_api::RecordSource;
use pipeline::{Poller, Processor};
use source_clickhouse::{ClickHouseConfig, ClickHouseSource};
use source_http_api::{HttpApiConfig, HttpApiSource};
use topic_api_server::QueryService;
use topic_engine::{LatestValueCache, TopicBus};

/// Сколько ждать завершения API сервера после отмены.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Adapter по имени из `[[sources]]`.
fn build_source(cfg: &SourceConfig) -> Result<Arc<dyn RecordSource>, ServerError> {
    let adapter_err = |source| ServerError::Adapter {
        name: cfg.name.clone(),
        source,
    };
    match cfg.adapter.as_str() {
        "http-api" => {
            let http_cfg: HttpApiConfig = cfg.adapter_config()?;
            let source = HttpApiSource::new(http_cfg).map_err(adapter_err)?;
            Ok(Arc::new(source))
        }
        "clickhouse" => {
            let ch_cfg: ClickHouseConfig = cfg.adapter_config()?;
            let source = ClickHouseSource::new(ch_cfg.with_env()).map_err(adapter_err)?;
            Ok(Arc::new(source))
        }
        other => Err(ServerError::Config {
            context: "sources",
            detail: format!("source [{}]: unknown adapter '{other}'", cfg.name),
        }),
    }
}

pub async fn run(args: ServeArgs) -> Result<(), ServerError> {
    tracing::info!("exchange-server starting");

    // --- Load config ---
    let config = ServerConfig::load(&args.config)?;
    tracing::info!(
        config = %args.config,
        sources = config.sources.len(),
        routes = config.routes.len(),
        endpoints = config.endpoints.len(),
        "loaded config"
    );

    // --- Adapters (ошибки конфигурации до старта чего-либо) ---
    let mut sources = Vec::with_capacity(config.sources.len());
    for source_cfg in &config.sources {
        let source = build_source(source_cfg)?;
        tracing::info!(source = %source_cfg.name, adapter = %source_cfg.adapter, topic = %source_cfg.topic, "built source");
        sources.push((source_cfg.poller_settings(), source));
    }

    // --- CancellationToken for graceful shutdown ---
    let token = CancellationToken::new();

    // --- Bus + subscribers: все подписки существуют до первого publish ---
    let bus = Arc::new(TopicBus::new(config.bus));
    let query = Arc::new(QueryService::new(
        Arc::new(LatestValueCache::new()),
        config.endpoints.clone(),
    )?);
    query.track_endpoints(&bus)?;
    let processor = Processor::start(bus.clone(), &config.routes)?;
    tracing::info!(routes = processor.routes().len(), "processor started");

    // --- API server ---
    let listener = topic_api_server::bind(config.api_port).await?;
    let mut api_handle = tokio::spawn(topic_api_server::serve(
        listener,
        topic_api_server::router(query.clone()),
        token.clone(),
    ));

    // --- Pollers ---
    let pollers: Vec<Poller> = sources
        .into_iter()
        .map(|(settings, source)| Poller::start(settings, source, bus.clone(), &token))
        .collect();

    tracing::info!(port = config.api_port, pollers = pollers.len(), "server ready");

    // --- Ожидание Ctrl+C (или падения API) ---
    let mut api_result = None;
    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            tracing::info!("shutting down...");
        }
        result = &mut api_handle => {
            tracing::error!("api server exited unexpectedly, shutting down");
            api_result = Some(result);
        }
    }

    token.cancel();

    for poller in pollers {
        let name = poller.name().to_string();
        let stats = poller.stats();
        poller.stop().await;
        tracing::info!(
            source = %name,
            ticks = stats.ticks,
            fetches = stats.fetches,
            failures = stats.failures,
            published = stats.published,
            "poller stopped"
        );
    }

    let api_result = match api_result {
        Some(result) => Some(result),
        None => match tokio::time::timeout(SHUTDOWN_GRACE, &mut api_handle).await {
            Ok(result) => Some(result),
            Err(_) => {
                tracing::warn!("api server did not stop in time, aborting");
                api_handle.abort();
                None
            }
        },
    };

    processor.stop();
    let stats = bus.stats();
    bus.close();
    tracing::info!(
        published = stats.published,
        delivered = stats.delivered,
        dropped = stats.dropped,
        handler_failures = stats.handler_failures,
        "shutdown complete"
    );

    match api_result {
        Some(result) => result?.map_err(ServerError::from),
        None => Ok(()),
    }
}
