use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use topic_engine::{LatestValueCache, SubscriptionHandle, TopicBus};

use crate::error::ApiError;

/// Пути, занятые служебными маршрутами.
const RESERVED_PATHS: &[&str] = &["/api/topics"];

/// Статический маршрут чтения: HTTP path → processed topic.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EndpointConfig {
    pub path: String,
    pub topic: String,
}

impl EndpointConfig {
    pub fn new(path: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            topic: topic.into(),
        }
    }

    pub fn validate(&self) -> Result<(), ApiError> {
        let fail = |detail: &str| ApiError::Endpoint {
            path: self.path.clone(),
            detail: detail.to_string(),
        };
        if !self.path.starts_with('/') {
            return Err(fail("path must start with '/'"));
        }
        if self.path.contains(['{', '}', '*'])
            || self.path.split('/').any(|segment| segment.starts_with(':'))
        {
            return Err(fail("path must be static"));
        }
        if RESERVED_PATHS.contains(&self.path.as_str()) {
            return Err(fail("path is reserved"));
        }
        if self.topic.is_empty() {
            return Err(fail("'topic' must not be empty"));
        }
        Ok(())
    }
}

/// Элемент ответа `GET /api/topics`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointView {
    pub topic: String,
    pub path: String,
    /// Unix ms последнего значения, `null` пока значения нет.
    pub updated_ms: Option<i64>,
}

// ═══════════════════════════════════════════════════════════════
//  QueryService
// ═══════════════════════════════════════════════════════════════

/// Чтение cache по таблице endpoint'ов. Только чтение: подписки
/// создаются один раз в `track_endpoints`, запросы их не трогают.
#[derive(Debug)]
pub struct QueryService {
    cache: Arc<LatestValueCache>,
    endpoints: Vec<EndpointConfig>,
}

impl QueryService {
    pub fn new(cache: Arc<LatestValueCache>, endpoints: Vec<EndpointConfig>) -> Result<Self, ApiError> {
        let mut paths = HashSet::new();
        for endpoint in &endpoints {
            endpoint.validate()?;
            if !paths.insert(endpoint.path.as_str()) {
                return Err(ApiError::Endpoint {
                    path: endpoint.path.clone(),
                    detail: "duplicate path".into(),
                });
            }
        }
        Ok(Self { cache, endpoints })
    }

    pub fn endpoints(&self) -> &[EndpointConfig] {
        &self.endpoints
    }

    pub fn cache(&self) -> &Arc<LatestValueCache> {
        &self.cache
    }

    /// Подписать cache на topic каждого endpoint'а (до первого publish).
    pub fn track_endpoints(&self, bus: &TopicBus) -> Result<Vec<SubscriptionHandle>, ApiError> {
        self.endpoints
            .iter()
            .map(|endpoint| {
                self.cache
                    .track(bus, &endpoint.topic)
                    .map_err(|source| ApiError::Track {
                        topic: endpoint.topic.clone(),
                        source,
                    })
            })
            .collect()
    }

    /// Тело ответа для topic'а: pretty JSON последней записи или `{}`.
    pub fn render(&self, topic: &str) -> String {
        match self.cache.get(topic) {
            Some(record) => record.to_pretty_json(),
            None => "{}".to_string(),
        }
    }

    pub fn views(&self) -> Vec<EndpointView> {
        self.endpoints
            .iter()
            .map(|e| EndpointView {
                topic: e.topic.clone(),
                path: e.path.clone(),
                updated_ms: self.cache.snapshot(&e.topic).map(|s| s.updated_ms),
            })
            .collect()
    }
}
