use std::time::Duration;

use serde::Deserialize;

use exchange_api::{ConfigError, FetchError, FetchFuture, Record, RecordSource};

/// Сколько символов тела ошибки сохранять в `FetchError::Status`.
const ERROR_BODY_LIMIT: usize = 512;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpApiConfig {
    /// Базовый URL сервиса.
    pub url: String,
    /// Path ресурса, запрашиваемого на каждом tick'е.
    pub path: String,
    /// Лимит времени HTTP запроса.
    pub timeout_ms: Option<u64>,
    pub accept_invalid_certs: bool,
}

impl Default for HttpApiConfig {
    fn default() -> Self {
        Self {
            url: "https://jsonplaceholder.typicode.com".into(),
            path: "/posts/1".into(),
            timeout_ms: None,
            accept_invalid_certs: false,
        }
    }
}

/// HTTP client source: один GET на tick, тело ответа становится одной записью.
pub struct HttpApiSource {
    http: reqwest::Client,
    url: String,
    path: String,
    timeout_ms: Option<u64>,
}

impl HttpApiSource {
    pub fn new(cfg: HttpApiConfig) -> Result<Self, ConfigError> {
        if !cfg.url.starts_with("http://") && !cfg.url.starts_with("https://") {
            return Err(ConfigError::new(format!(
                "http-api: url '{}' must be http(s)",
                cfg.url
            )));
        }
        if !cfg.path.starts_with('/') {
            return Err(ConfigError::new(format!(
                "http-api: path '{}' must start with '/'",
                cfg.path
            )));
        }

        let mut builder =
            reqwest::Client::builder().danger_accept_invalid_certs(cfg.accept_invalid_certs);
        if let Some(ms) = cfg.timeout_ms {
            builder = builder.timeout(Duration::from_millis(ms));
        }
        let http = builder
            .build()
            .map_err(|e| ConfigError::new(format!("http-api: HTTP client: {e}")))?;

        Ok(Self {
            http,
            url: cfg.url.trim_end_matches('/').to_string(),
            path: cfg.path,
            timeout_ms: cfg.timeout_ms,
        })
    }

    /// GET `url + path`, тело ответа должно быть JSON object.
    pub async fn fetch_one(&self, url: &str, path: &str) -> Result<Record, FetchError> {
        let target = format!("{url}{path}");
        let resp = self
            .http
            .get(&target)
            .send()
            .await
            .map_err(|e| match self.timeout_ms {
                Some(ms) if e.is_timeout() => FetchError::Timeout(ms),
                _ => FetchError::Transport(format!("GET {target}: {e}")),
            })?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| FetchError::Transport(format!("read {target}: {e}")))?;

        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
                body: body.chars().take(ERROR_BODY_LIMIT).collect(),
            });
        }

        let value: serde_json::Value = serde_json::from_str(&body)
            .map_err(|e| FetchError::Decode(format!("{target}: {e}")))?;
        let record = Record::try_from(value)?;
        tracing::debug!(url = %target, fields = record.len(), "fetched document");
        Ok(record)
    }
}

impl RecordSource for HttpApiSource {
    fn kind(&self) -> &'static str {
        "http-api"
    }

    fn fetch(&self) -> FetchFuture<'_> {
        Box::pin(async move {
            let record = self.fetch_one(&self.url, &self.path).await?;
            Ok(vec![record])
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use axum::Router;
    use axum::http::StatusCode;
    use axum::routing::get;
    use serde_json::json;

    /// Локальный mock сервиса, возвращает базовый URL.
    async fn mock_api() -> String {
        let app = Router::new()
            .route("/posts/1", get(|| async { axum::Json(json!({"id": 1, "title": "foo"})) }))
            .route(
                "/broken",
                get(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "boom") }),
            )
            .route("/list", get(|| async { axum::Json(json!([1, 2, 3])) }))
            .route("/text", get(|| async { "not json" }));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn source(url: &str, path: &str) -> HttpApiSource {
        HttpApiSource::new(HttpApiConfig {
            url: url.to_string(),
            path: path.to_string(),
            ..HttpApiConfig::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_fetch_returns_single_document() {
        let url = mock_api().await;
        let records = source(&url, "/posts/1").fetch().await.unwrap();

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].to_value(), json!({"id": 1, "title": "foo"}));
    }

    #[tokio::test]
    async fn test_error_status_is_reported() {
        let url = mock_api().await;
        let err = source(&url, "/broken").fetch().await.unwrap_err();

        assert_eq!(
            err,
            FetchError::Status {
                status: 500,
                body: "boom".into()
            }
        );
    }

    #[tokio::test]
    async fn test_non_object_body_is_decode_error() {
        let url = mock_api().await;
        let src = source(&url, "/posts/1");

        assert!(matches!(src.fetch_one(&url, "/list").await, Err(FetchError::Decode(_))));
        assert!(matches!(src.fetch_one(&url, "/text").await, Err(FetchError::Decode(_))));
    }

    #[tokio::test]
    async fn test_unreachable_host_is_transport_error() {
        // Порт занят и сразу освобождён: соединение будет отклонено.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let url = format!("http://{addr}");
        let err = source(&url, "/posts/1").fetch().await.unwrap_err();
        assert!(matches!(err, FetchError::Transport(_)));
    }

    #[test]
    fn test_config_defaults_and_validation() {
        let cfg = HttpApiConfig::default();
        assert_eq!(cfg.url, "https://jsonplaceholder.typicode.com");
        assert_eq!(cfg.path, "/posts/1");

        let no_slash = HttpApiConfig {
            path: "posts/1".into(),
            ..HttpApiConfig::default()
        };
        assert!(HttpApiSource::new(no_slash).is_err());

        let bad_scheme = HttpApiConfig {
            url: "ftp://example.com".into(),
            ..HttpApiConfig::default()
        };
        assert!(HttpApiSource::new(bad_scheme).is_err());
    }
}
