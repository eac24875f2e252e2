//! Structured job event log
//!
//! Business-level events from scheduled jobs ("user not found", "paid with
//! buzz", ...). Events go to tracing and, when a pool is configured, to the
//! `job_events` table. Logging is best effort: callers warn on failure and move on.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::BillingResult;

/// Event name used by the recurring club membership billing job
pub const RECURRING_BILLING_JOB: &str = "process-club-membership-recurring-payments";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobEventType {
    Info,
    Warning,
    Error,
}

impl JobEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobEventType::Info => "info",
            JobEventType::Warning => "warning",
            JobEventType::Error => "error",
        }
    }
}

impl std::fmt::Display for JobEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single structured event
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobEvent {
    pub name: String,
    #[serde(rename = "type")]
    pub event_type: JobEventType,
    /// Free-form payload, always a JSON object
    pub data: Value,
}

impl JobEvent {
    pub fn message(&self) -> Option<&str> {
        self.data.get("message").and_then(Value::as_str)
    }
}

/// Builder for job events
#[derive(Debug, Clone)]
pub struct JobEventBuilder {
    name: String,
    event_type: JobEventType,
    data: Map<String, Value>,
}

impl JobEventBuilder {
    pub fn new(name: impl Into<String>, event_type: JobEventType) -> Self {
        Self {
            name: name.into(),
            event_type,
            data: Map::new(),
        }
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.data
            .insert("message".to_string(), Value::String(message.into()));
        self
    }

    /// Merge an object's fields into the payload; other values land under `data`
    pub fn data(mut self, value: Value) -> Self {
        match value {
            Value::Object(fields) => self.data.extend(fields),
            Value::Null => {}
            other => {
                self.data.insert("data".to_string(), other);
            }
        }
        self
    }

    pub fn field(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.data.insert(key.to_string(), value.into());
        self
    }

    pub fn build(self) -> JobEvent {
        JobEvent {
            name: self.name,
            event_type: self.event_type,
            data: Value::Object(self.data),
        }
    }
}

#[async_trait]
pub trait EventSink: Send + Sync {
    async fn log_event(&self, event: JobEvent) -> BillingResult<()>;
}

/// Logs events through tracing and optionally persists them
#[derive(Clone)]
pub struct JobEventLogger {
    pool: Option<PgPool>,
}

impl JobEventLogger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool: Some(pool) }
    }

    /// Logger that only emits tracing events
    pub fn tracing_only() -> Self {
        Self { pool: None }
    }

    fn trace(event: &JobEvent) {
        let message = event.message().unwrap_or("");
        match event.event_type {
            JobEventType::Info => {
                tracing::info!(job = %event.name, data = %event.data, "{}", message)
            }
            JobEventType::Warning => {
                tracing::warn!(job = %event.name, data = %event.data, "{}", message)
            }
            JobEventType::Error => {
                tracing::error!(job = %event.name, data = %event.data, "{}", message)
            }
        }
    }
}

#[async_trait]
impl EventSink for JobEventLogger {
    async fn log_event(&self, event: JobEvent) -> BillingResult<()> {
        Self::trace(&event);

        let Some(pool) = &self.pool else {
            return Ok(());
        };

        sqlx::query(
            r#"
            INSERT INTO job_events (id, name, type, data)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&event.name)
        .bind(event.event_type.as_str())
        .bind(&event.data)
        .execute(pool)
        .await?;

        Ok(())
    }
}
