use std::collections::HashSet;
use std::path::Path;

use clap::{Args, Parser, Subcommand};
use serde::Deserialize;

pub use pipeline::config::{OverlapPolicy, RouteConfig, SourceConfig};
pub use topic_api_server::EndpointConfig;
pub use topic_engine::BusSettings;

use crate::error::ServerError;

pub const DEFAULT_CONFIG_PATH: &str = "config.toml";

/// Поддерживаемые source-адаптеры.
pub const ADAPTERS: &[&str] = &["http-api", "clickhouse"];

#[derive(Parser)]
#[command(name = "exchange-server", about = "Сервис обмена данными между источниками и HTTP API")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Запустить сервер
    Serve(ServeArgs),
}

#[derive(Args, Clone, Debug)]
pub struct ServeArgs {
    /// Путь к TOML конфиг файлу
    #[arg(long, default_value = DEFAULT_CONFIG_PATH, env = "EXCHANGE_CONFIG")]
    pub config: String,
}

// ═══════════════════════════════════════════════════════════════
//  TOML Config
// ═══════════════════════════════════════════════════════════════

/// Конфигурация сервера. Пустая секция заменяется топологией по умолчанию:
/// `api` → `api.data` → `processed.api.data` → `/from-api`,
/// `db` → `db.data` → `processed.db.data` → `/from-db`.
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_api_port")]
    pub api_port: u16,
    #[serde(default)]
    pub bus: BusSettings,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,
}

fn default_api_port() -> u16 {
    8080
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            api_port: default_api_port(),
            bus: BusSettings::default(),
            sources: Vec::new(),
            routes: Vec::new(),
            endpoints: Vec::new(),
        }
        .with_defaults()
    }
}

fn default_source(name: &str, adapter: &str, topic: &str) -> SourceConfig {
    SourceConfig {
        name: name.into(),
        adapter: adapter.into(),
        topic: topic.into(),
        interval_ms: 5000,
        overlap: OverlapPolicy::Skip,
        timeout_ms: None,
        config: None,
    }
}

impl ServerConfig {
    /// Прочитать и провалидировать конфиг. Отсутствующий файл по пути
    /// по умолчанию не ошибка: сервер стартует с топологией по умолчанию.
    pub fn load(path: &str) -> Result<Self, ServerError> {
        if path == DEFAULT_CONFIG_PATH && !Path::new(path).exists() {
            tracing::warn!(config = %path, "config file not found, using default topology");
            let config = Self::default();
            config.validate()?;
            return Ok(config);
        }

        let content = std::fs::read_to_string(path).map_err(|e| ServerError::Config {
            context: "read",
            detail: format!("'{path}': {e}"),
        })?;
        Self::parse(&content).map_err(|e| match e {
            ServerError::Config { context, detail } => ServerError::Config {
                context,
                detail: format!("'{path}': {detail}"),
            },
            other => other,
        })
    }

    pub fn parse(content: &str) -> Result<Self, ServerError> {
        let config: Self = toml::from_str(content).map_err(|e| ServerError::Config {
            context: "parse",
            detail: e.to_string(),
        })?;
        let config = config.with_defaults();
        config.validate()?;
        Ok(config)
    }

    fn with_defaults(mut self) -> Self {
        if self.sources.is_empty() {
            self.sources = vec![
                default_source("api", "http-api", "api.data"),
                default_source("db", "clickhouse", "db.data"),
            ];
        }
        if self.routes.is_empty() {
            self.routes = vec![
                RouteConfig::new("api.data", "processed.api.data"),
                RouteConfig::new("db.data", "processed.db.data"),
            ];
        }
        if self.endpoints.is_empty() {
            self.endpoints = vec![
                EndpointConfig::new("/from-api", "processed.api.data"),
                EndpointConfig::new("/from-db", "processed.db.data"),
            ];
        }
        self
    }

    pub fn validate(&self) -> Result<(), ServerError> {
        let invalid = |context: &'static str, detail: String| ServerError::Config { context, detail };

        let mut names = HashSet::new();
        for source in &self.sources {
            source.validate().map_err(|e| invalid("sources", e))?;
            if !names.insert(source.name.as_str()) {
                return Err(invalid("sources", format!("duplicate source name '{}'", source.name)));
            }
            if !ADAPTERS.contains(&source.adapter.as_str()) {
                return Err(invalid(
                    "sources",
                    format!(
                        "source [{}]: unknown adapter '{}' (expected one of {ADAPTERS:?})",
                        source.name, source.adapter
                    ),
                ));
            }
        }

        pipeline::validate_routes(&self.routes)?;

        let processed: HashSet<&str> = self.routes.iter().map(|r| r.processed.as_str()).collect();
        let mut paths = HashSet::new();
        for endpoint in &self.endpoints {
            endpoint
                .validate()
                .map_err(|e| invalid("endpoints", e.to_string()))?;
            if !paths.insert(endpoint.path.as_str()) {
                return Err(invalid("endpoints", format!("duplicate path '{}'", endpoint.path)));
            }
            if !processed.contains(endpoint.topic.as_str()) {
                return Err(invalid(
                    "endpoints",
                    format!(
                        "'{}' reads topic '{}' which no route produces",
                        endpoint.path, endpoint.topic
                    ),
                ));
            }
        }

        let raw: HashSet<&str> = self.routes.iter().map(|r| r.raw.as_str()).collect();
        for source in &self.sources {
            if !raw.contains(source.topic.as_str()) {
                tracing::warn!(source = %source.name, topic = %source.topic, "source topic is not routed");
            }
        }
        Ok(())
    }
}
