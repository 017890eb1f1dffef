use std::time::Duration;

use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::error::PipelineError;
use crate::poller::PollerSettings;

// ═══════════════════════════════════════════════════════════════
//  Source Config
// ═══════════════════════════════════════════════════════════════

/// Что делать с tick'ами, пришедшими пока предыдущий fetch не завершён.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverlapPolicy {
    /// Пропущенные tick'и отбрасываются, следующий fetch идёт по расписанию.
    #[default]
    Skip,
    /// Один отложенный tick срабатывает сразу после завершения fetch,
    /// дальше расписание отсчитывается от него.
    Delay,
}

/// Конфигурация poller'а: адаптер + target topic + расписание.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    /// Уникальное имя source'а (для логов).
    pub name: String,
    /// Тип адаптера: "http-api" или "clickhouse".
    pub adapter: String,
    /// Raw topic, в который публикуются записи.
    pub topic: String,
    /// Интервал tick'ов.
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default)]
    pub overlap: OverlapPolicy,
    /// Лимит времени одного fetch (без лимита, если не задан).
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Конфигурация адаптера (формат зависит от `adapter`).
    #[serde(default)]
    pub config: Option<toml::Value>,
}

fn default_interval_ms() -> u64 {
    5000
}

impl SourceConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.name.is_empty() {
            return Err("source: 'name' must not be empty".into());
        }
        if self.topic.is_empty() {
            return Err(format!("source [{}]: 'topic' must not be empty", self.name));
        }
        if self.interval_ms == 0 {
            return Err(format!("source [{}]: 'interval_ms' must be > 0", self.name));
        }
        if self.timeout_ms == Some(0) {
            return Err(format!("source [{}]: 'timeout_ms' must be > 0", self.name));
        }
        Ok(())
    }

    pub fn poller_settings(&self) -> PollerSettings {
        PollerSettings {
            name: self.name.clone(),
            topic: self.topic.clone(),
            interval: Duration::from_millis(self.interval_ms),
            overlap: self.overlap,
            timeout: self.timeout_ms.map(Duration::from_millis),
        }
    }

    /// Распарсить `config` в конфиг конкретного адаптера.
    pub fn adapter_config<T: DeserializeOwned + Default>(&self) -> Result<T, PipelineError> {
        decode_config(&self.name, &self.config)
    }
}

// ═══════════════════════════════════════════════════════════════
//  Route Config
// ═══════════════════════════════════════════════════════════════

/// Статический маршрут processor'а: raw topic → processed topic.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RouteConfig {
    pub raw: String,
    pub processed: String,
}

impl RouteConfig {
    pub fn new(raw: impl Into<String>, processed: impl Into<String>) -> Self {
        Self {
            raw: raw.into(),
            processed: processed.into(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════
//  Helpers
// ═══════════════════════════════════════════════════════════════

/// Option<toml::Value> → типизированный конфиг (или Default).
pub fn decode_config<T: DeserializeOwned + Default>(
    owner: &str,
    val: &Option<toml::Value>,
) -> Result<T, PipelineError> {
    match val {
        Some(v) => v.clone().try_into().map_err(|e: toml::de::Error| PipelineError::AdapterConfig {
            owner: owner.to_string(),
            detail: e.to_string(),
        }),
        None => Ok(T::default()),
    }
}
