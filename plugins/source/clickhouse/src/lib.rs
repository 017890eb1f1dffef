//! Store source поверх ClickHouse HTTP interface.
//!
//! Вместо пары `MONGODB_URI` / `MONGODB_NAME` адрес и база берутся из
//! `CLICKHOUSE_URL` / `CLICKHOUSE_DATABASE` (поверх `[sources.config]`).
//! `collection` это таблица, `filter` превращается в `WHERE ... AND ...`,
//! `find("customer", {})` соответствует `SELECT * FROM customer`.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::Value;

use exchange_api::{ConfigError, FetchError, FetchFuture, Record, RecordSource};

pub const ENV_URL: &str = "CLICKHOUSE_URL";
pub const ENV_DATABASE: &str = "CLICKHOUSE_DATABASE";

/// Условие выборки: column = value, все условия через AND.
/// Пустой filter выбирает все строки.
pub type Filter = BTreeMap<String, Value>;

/// Escape a string value for safe use inside a ClickHouse single-quoted literal.
fn escape_ch_string(s: &str) -> String {
    s.replace('\\', "\\\\").replace('\'', "\\'")
}

/// Имена таблиц и столбцов подставляются в SQL как есть, поэтому
/// допускаются только `[A-Za-z0-9_.]`.
fn check_identifier(kind: &str, name: &str) -> Result<(), ConfigError> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.');
    if valid {
        Ok(())
    } else {
        Err(ConfigError::new(format!("clickhouse: invalid {kind} '{name}'")))
    }
}

fn condition(column: &str, value: &Value) -> Result<String, ConfigError> {
    check_identifier("column", column)?;
    match value {
        Value::Null => Ok(format!("{column} IS NULL")),
        Value::Bool(b) => Ok(format!("{column} = {b}")),
        Value::Number(n) => Ok(format!("{column} = {n}")),
        Value::String(s) => Ok(format!("{column} = '{}'", escape_ch_string(s))),
        Value::Array(_) | Value::Object(_) => Err(ConfigError::new(format!(
            "clickhouse: filter '{column}' must be a scalar"
        ))),
    }
}

/// `SELECT * FROM <collection> [WHERE ...] FORMAT JSONEachRow`.
pub fn select_query(collection: &str, filter: &Filter) -> Result<String, ConfigError> {
    check_identifier("collection", collection)?;
    let conditions = filter
        .iter()
        .map(|(column, value)| condition(column, value))
        .collect::<Result<Vec<_>, _>>()?;

    let where_clause = if conditions.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", conditions.join(" AND "))
    };
    Ok(format!(
        "SELECT * FROM {collection}{where_clause} FORMAT JSONEachRow"
    ))
}

// ═══════════════════════════════════════════════════════════════
//  Config
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClickHouseConfig {
    /// HTTP интерфейс сервера. Переопределяется `CLICKHOUSE_URL`.
    pub url: String,
    /// Переопределяется `CLICKHOUSE_DATABASE`.
    pub database: String,
    pub user: String,
    pub password: String,
    pub accept_invalid_certs: bool,
    /// Таблица, из которой читаются строки.
    pub collection: String,
    pub filter: Filter,
}

impl Default for ClickHouseConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8123".into(),
            database: "default".into(),
            user: "default".into(),
            password: String::new(),
            accept_invalid_certs: false,
            collection: "customer".into(),
            filter: Filter::new(),
        }
    }
}

impl ClickHouseConfig {
    /// Параметры соединения из окружения процесса (читаются один раз при старте).
    pub fn with_env(self) -> Self {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(url) = lookup(ENV_URL).filter(|v| !v.is_empty()) {
            self.url = url;
        }
        if let Some(database) = lookup(ENV_DATABASE).filter(|v| !v.is_empty()) {
            self.database = database;
        }
        self
    }
}

// ═══════════════════════════════════════════════════════════════
//  Source
// ═══════════════════════════════════════════════════════════════

/// Data-store source: на каждом tick'е выборка строк коллекции,
/// каждая строка становится отдельной записью.
pub struct ClickHouseSource {
    http: reqwest::Client,
    base_url: String,
    user: String,
    password: String,
    database: String,
    collection: String,
    filter: Filter,
}

impl ClickHouseSource {
    pub fn new(cfg: ClickHouseConfig) -> Result<Self, ConfigError> {
        // Запрос проверяется до первого tick'а.
        select_query(&cfg.collection, &cfg.filter)?;
        check_identifier("database", &cfg.database)?;

        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(cfg.accept_invalid_certs)
            .build()
            .map_err(|e| ConfigError::new(format!("clickhouse: HTTP client: {e}")))?;

        tracing::info!(url = %cfg.url, database = %cfg.database, collection = %cfg.collection, "clickhouse source configured");
        Ok(Self {
            http,
            base_url: cfg.url,
            user: cfg.user,
            password: cfg.password,
            database: cfg.database,
            collection: cfg.collection,
            filter: cfg.filter,
        })
    }

    async fn exec(&self, sql: &str) -> Result<String, FetchError> {
        let resp = self
            .http
            .post(&self.base_url)
            .query(&[
                ("user", self.user.as_str()),
                ("password", self.password.as_str()),
                ("database", self.database.as_str()),
            ])
            .body(sql.to_owned())
            .send()
            .await
            .map_err(|e| FetchError::Transport(format!("CH request: {e}")))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| FetchError::Transport(format!("CH read: {e}")))?;

        if status.is_success() {
            Ok(body)
        } else {
            Err(FetchError::Status {
                status: status.as_u16(),
                body: body.trim().to_string(),
            })
        }
    }

    /// Все строки `collection`, удовлетворяющие `filter`.
    pub async fn fetch_all(
        &self,
        collection: &str,
        filter: &Filter,
    ) -> Result<Vec<Record>, FetchError> {
        let sql = select_query(collection, filter)?;
        let body = self.exec(&sql).await?;

        let mut rows = Vec::new();
        for line in body.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let value: Value = serde_json::from_str(line)
                .map_err(|e| FetchError::Decode(format!("parse CH row: {e}")))?;
            rows.push(Record::try_from(value)?);
        }
        tracing::debug!(collection = %collection, rows = rows.len(), "clickhouse rows fetched");
        Ok(rows)
    }
}

impl RecordSource for ClickHouseSource {
    fn kind(&self) -> &'static str {
        "clickhouse"
    }

    fn fetch(&self) -> FetchFuture<'_> {
        Box::pin(self.fetch_all(&self.collection, &self.filter))
    }
}
