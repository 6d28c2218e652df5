//! HTTP backend speaking the RusTs REST API.
//!
//! - `GET /health` is used as the connection health check
//! - rows are written as InfluxDB line protocol to `POST /write`
//! - reads and schema statements go to `POST /sql`
//!
//! Each session owns its own `reqwest::Client`, hence its own connection pool.
//! Idle connections are never reaped, so a session that is never closed keeps
//! its sockets open for the life of the process.

use super::{Backend, Session, StoredRow};
use crate::config::RunConfig;
use crate::error::BackendError;
use crate::metrics::TelemetrySample;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Port used when a host is given without one.
const DEFAULT_PORT: u16 = 8086;

/// Backend that opens HTTP sessions against a list of hosts, round robin.
#[derive(Debug)]
pub struct HttpBackend {
    base_urls: Vec<String>,
    keyspace: String,
    table: String,
    timeout: Duration,
    next_host: AtomicUsize,
}

impl HttpBackend {
    pub fn new(
        hosts: &[String],
        keyspace: impl Into<String>,
        table: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            base_urls: hosts.iter().map(|h| base_url(h)).collect(),
            keyspace: keyspace.into(),
            table: table.into(),
            timeout,
            next_host: AtomicUsize::new(0),
        }
    }

    pub fn from_config(config: &RunConfig) -> Self {
        Self::new(
            &config.hosts,
            config.keyspace.clone(),
            config.table.clone(),
            config.request_timeout(),
        )
    }

    fn pick_base_url(&self) -> &str {
        let idx = self.next_host.fetch_add(1, Ordering::Relaxed) % self.base_urls.len();
        &self.base_urls[idx]
    }
}

#[async_trait]
impl Backend for HttpBackend {
    type Session = HttpSession;

    async fn connect(&self) -> Result<HttpSession, BackendError> {
        let base_url = self.pick_base_url().to_string();

        let client = reqwest::Client::builder()
            .timeout(self.timeout)
            .connect_timeout(self.timeout)
            .pool_idle_timeout(None)
            .build()?;

        let response = client.get(format!("{}/health", base_url)).send().await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(BackendError::Server { status, message });
        }

        Ok(HttpSession {
            write_url: format!("{}/write?db={}", base_url, self.keyspace),
            sql_url: format!("{}/sql", base_url),
            client,
            table: self.table.clone(),
        })
    }

    fn describe(&self) -> String {
        format!("http [{}]", self.base_urls.join(", "))
    }
}

/// One HTTP connection pool bound to a single host.
#[derive(Debug)]
pub struct HttpSession {
    client: reqwest::Client,
    write_url: String,
    sql_url: String,
    table: String,
}

impl HttpSession {
    async fn post_sql(&self, query: &str) -> Result<reqwest::Response, BackendError> {
        let response = self
            .client
            .post(&self.sql_url)
            .json(&serde_json::json!({ "query": query }))
            .send()
            .await?;
        check_status(response).await
    }
}

#[async_trait]
impl Session for HttpSession {
    async fn execute(&self, statement: &str) -> Result<(), BackendError> {
        self.post_sql(statement).await.map(|_| ())
    }

    async fn insert(&self, sample: &TelemetrySample) -> Result<(), BackendError> {
        let response = self
            .client
            .post(&self.write_url)
            .header("Content-Type", "text/plain")
            .body(format_line(&self.table, sample))
            .send()
            .await?;
        check_status(response).await.map(|_| ())
    }

    async fn recent(&self, sensor_id: &str, limit: usize) -> Result<Vec<StoredRow>, BackendError> {
        let query = recent_rows_query(&self.table, sensor_id, limit);
        let response = self.post_sql(&query).await?;
        let body: SqlResponse = response.json().await?;
        Ok(body
            .results
            .into_iter()
            .map(|row| row.into_stored(sensor_id))
            .collect())
    }

    async fn close(self) -> Result<(), BackendError> {
        // Dropping the client closes its pooled connections
        drop(self.client);
        Ok(())
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, BackendError> {
    if response.status().is_success() {
        Ok(response)
    } else {
        let status = response.status().as_u16();
        let message = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        Err(BackendError::Server { status, message })
    }
}

/// Body of a `/sql` response.
#[derive(Debug, Deserialize)]
struct SqlResponse {
    #[serde(default)]
    results: Vec<SqlRow>,
}

#[derive(Debug, Deserialize)]
struct SqlRow {
    time: Option<i64>,
    #[serde(default)]
    tags: HashMap<String, String>,
    #[serde(default)]
    fields: HashMap<String, serde_json::Value>,
}

impl SqlRow {
    fn into_stored(mut self, sensor_id: &str) -> StoredRow {
        StoredRow {
            sensor_id: self
                .tags
                .remove("sensor_id")
                .unwrap_or_else(|| sensor_id.to_string()),
            event_time: DateTime::from_timestamp_nanos(self.time.unwrap_or(0)),
            metric_name: self.tags.remove("metric_name").unwrap_or_default(),
            // NaN comes back as null
            value: self
                .fields
                .get("value")
                .and_then(|v| v.as_f64())
                .unwrap_or(f64::NAN),
            unit: self.tags.remove("unit").unwrap_or_default(),
        }
    }
}

/// Normalizes a host entry into a base URL.
fn base_url(host: &str) -> String {
    let host = host.trim_end_matches('/');
    let with_scheme = if host.starts_with("http://") || host.starts_with("https://") {
        host.to_string()
    } else {
        format!("http://{}", host)
    };

    let authority = with_scheme
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(&with_scheme);
    if authority.contains(':') {
        with_scheme
    } else {
        format!("{}:{}", with_scheme, DEFAULT_PORT)
    }
}

/// Formats one sample as a line protocol record.
fn format_line(table: &str, sample: &TelemetrySample) -> String {
    format!(
        "{},sensor_id={},metric_name={},unit={} value={} {}",
        escape_measurement(table),
        escape_tag_value(&sample.sensor_id),
        escape_tag_value(&sample.metric_name),
        escape_tag_value(&sample.unit),
        sample.value,
        sample.timestamp.timestamp_nanos_opt().unwrap_or(0)
    )
}

fn recent_rows_query(table: &str, sensor_id: &str, limit: usize) -> String {
    format!(
        "SELECT * FROM {} WHERE sensor_id = '{}' ORDER BY time DESC LIMIT {}",
        table,
        sensor_id.replace('\'', "''"),
        limit
    )
}

/// Escapes special characters in measurement names
fn escape_measurement(s: &str) -> String {
    s.replace(',', "\\,").replace(' ', "\\ ")
}

/// Escapes special characters in tag values
fn escape_tag_value(s: &str) -> String {
    s.replace(',', "\\,")
        .replace('=', "\\=")
        .replace(' ', "\\ ")
}
