//! Shared core abstractions for the function gateway.
//!
//! This crate defines the contracts used by the dispatcher: the remote job-queue interface,
//! the schedule/task data model it exchanges, and the schedule resolution rules that map a
//! function identity onto a remote schedule.
//!
//! # API notes
//! `funcgate-core` is an internal crate (`publish = false`). Remote records are modelled on the
//! Iron.io worker API; fields the gateway never reads are not deserialized.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub mod fixtures;
pub mod iron;
pub mod resolve;

pub use resolve::{resolve_schedule, select_schedule, ResolvedSchedule, TimeoutPolicy};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub struct Error {
    inner: anyhow::Error,
}

impl Error {
    pub fn msg(message: impl Into<String>) -> Self {
        Self {
            inner: anyhow::anyhow!(message.into()),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Alternate formatting keeps the context chain ("get code: status 404 ...").
        write!(f, "{:#}", self.inner)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.inner.source()
    }
}

impl From<anyhow::Error> for Error {
    fn from(value: anyhow::Error) -> Self {
        Self { inner: value }
    }
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        Self {
            inner: anyhow::Error::from(value),
        }
    }
}

/// How a schedule expects to be invoked through the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvocationType {
    Sync,
    Async,
}

impl InvocationType {
    pub fn as_str(self) -> &'static str {
        match self {
            InvocationType::Sync => "sync",
            InvocationType::Async => "async",
        }
    }
}

impl fmt::Display for InvocationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Deployable worker image registered with the job queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Code {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub image: String,
}

/// Remote schedule definition. The gateway only ever holds read-only copies.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    pub id: String,
    #[serde(default)]
    pub code_name: String,
    #[serde(default)]
    pub cluster: String,

    /// Seconds a spawned task may run before it is killed.
    #[serde(default)]
    pub timeout: i64,

    /// JSON-encoded [`CronPayload`]; opaque to the job queue itself.
    #[serde(default)]
    pub payload: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Schedule {
    /// Decode the side-channel invocation policy carried in `payload`.
    pub fn cron_payload(&self) -> serde_json::Result<CronPayload> {
        serde_json::from_str(&self.payload)
    }
}

/// Invocation policy embedded in a schedule's payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CronPayload {
    /// Cron expression; empty means the schedule is not fired by the local crontab.
    #[serde(default)]
    pub schedule: String,

    /// `sync`, `async`, or empty.
    #[serde(default, rename = "type")]
    pub kind: String,

    /// Forwarded to the worker verbatim as its task payload.
    #[serde(default, alias = "encryptedPayload")]
    pub encrypted_payload: String,

    /// Overrides the schedule timeout when positive.
    #[serde(default)]
    pub timeout: i64,
}

impl CronPayload {
    pub fn invocation_type(&self) -> Option<InvocationType> {
        match self.kind.as_str() {
            "sync" => Some(InvocationType::Sync),
            "async" => Some(InvocationType::Async),
            _ => None,
        }
    }

    pub fn is_cron(&self) -> bool {
        !self.schedule.trim().is_empty()
    }
}

/// Parameters for queuing one ephemeral worker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub code_name: String,
    pub payload: String,
    pub cluster: String,
    pub timeout: i64,
}

/// A queued task as acknowledged by the job queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
}

/// Minimum operations the gateway needs from the remote job-queue service.
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn get_code(&self, code_id: &str) -> Result<Code>;

    async fn list_codes(&self) -> Result<Vec<Code>>;

    async fn list_schedules(&self) -> Result<Vec<Schedule>>;

    /// Schedules bound to `code_name`, in the order the remote service returns them.
    async fn schedules_with_code(&self, code_name: &str) -> Result<Vec<Schedule>> {
        let schedules = self.list_schedules().await?;
        Ok(schedules
            .into_iter()
            .filter(|s| s.code_name == code_name)
            .collect())
    }

    async fn get_schedule(&self, schedule_id: &str) -> Result<Option<Schedule>>;

    async fn queue_task(&self, spec: TaskSpec) -> Result<Task>;

    /// Best-effort; the caller never observes the task's terminal state.
    async fn cancel_task(&self, task_id: &str) -> Result<()>;
}
