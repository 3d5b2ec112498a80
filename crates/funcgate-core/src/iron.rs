//! HTTP client for an Iron.io-compatible worker API.

use crate::{Code, Error, JobQueue, Result, Schedule, Task, TaskSpec};
use anyhow::Context;
use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::sync::Arc;

/// Connection settings, usually provided as a JSON document in `IRON_CONFIG`.
#[derive(Clone, Deserialize)]
pub struct IronConfig {
    pub base_url: String,
    pub project_id: String,
    pub token: String,
    #[serde(default)]
    pub cluster_info: Vec<ClusterInfo>,
}

impl std::fmt::Debug for IronConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IronConfig")
            .field("base_url", &self.base_url)
            .field("project_id", &self.project_id)
            .field("token", &"<redacted>")
            .field("cluster_info", &self.cluster_info)
            .finish()
    }
}

impl IronConfig {
    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw).context("decode iron config json")?)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClusterInfo {
    pub cluster_id: String,
    #[serde(default)]
    pub cluster_name: String,
}

#[derive(Clone, Debug)]
pub struct IronClient {
    project_url: String,
    token: String,
    client: Arc<reqwest::Client>,
}

#[derive(Debug, Deserialize)]
struct CodesResponse {
    #[serde(default)]
    codes: Vec<Code>,
}

#[derive(Debug, Deserialize)]
struct SchedulesResponse {
    #[serde(default)]
    schedules: Vec<Schedule>,
}

#[derive(Debug, Serialize)]
struct QueueTasksRequest<'a> {
    tasks: [&'a TaskSpec; 1],
}

#[derive(Debug, Deserialize)]
struct QueueTasksResponse {
    #[serde(default)]
    tasks: Vec<Task>,
    #[serde(default)]
    msg: String,
}

impl IronClient {
    pub fn new(cfg: &IronConfig) -> Result<Self> {
        let base: Url = cfg.base_url.parse().context("parse iron base URL")?;
        let base = base.as_str().trim_end_matches('/');
        Ok(Self {
            project_url: format!("{base}/projects/{}", cfg.project_id),
            token: cfg.token.clone(),
            client: Arc::new(reqwest::Client::new()),
        })
    }

    fn url(&self, path: &str) -> Result<Url> {
        let full = format!("{}/{path}", self.project_url);
        full.parse()
            .with_context(|| format!("build iron URL for {path}"))
            .map_err(Error::from)
    }

    fn auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        req.header(reqwest::header::AUTHORIZATION, format!("OAuth {}", self.token))
            .header(reqwest::header::ACCEPT, "application/json")
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self.url(path)?;
        let resp = self
            .auth(self.client.get(url))
            .send()
            .await
            .with_context(|| format!("GET {path}"))?
            .error_for_status()
            .with_context(|| format!("GET {path} status"))?;
        Ok(resp
            .json::<T>()
            .await
            .with_context(|| format!("decode {path}"))?)
    }

    pub async fn get_code(&self, code_id: &str) -> Result<Code> {
        self.get_json(&format!("codes/{code_id}")).await
    }

    pub async fn list_codes(&self) -> Result<Vec<Code>> {
        let resp: CodesResponse = self.get_json("codes").await?;
        Ok(resp.codes)
    }

    pub async fn list_schedules(&self) -> Result<Vec<Schedule>> {
        let resp: SchedulesResponse = self.get_json("schedules").await?;
        Ok(resp.schedules)
    }

    pub async fn get_schedule(&self, schedule_id: &str) -> Result<Option<Schedule>> {
        let path = format!("schedules/{schedule_id}");
        let url = self.url(&path)?;
        let resp = self
            .auth(self.client.get(url))
            .send()
            .await
            .with_context(|| format!("GET {path}"))?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let resp = resp
            .error_for_status()
            .with_context(|| format!("GET {path} status"))?;
        Ok(Some(
            resp.json::<Schedule>()
                .await
                .with_context(|| format!("decode {path}"))?,
        ))
    }

    pub async fn queue_task(&self, spec: &TaskSpec) -> Result<Task> {
        let url = self.url("tasks")?;
        let resp = self
            .auth(self.client.post(url))
            .json(&QueueTasksRequest { tasks: [spec] })
            .send()
            .await
            .context("POST tasks")?
            .error_for_status()
            .context("POST tasks status")?;

        let body: QueueTasksResponse = resp.json().await.context("decode queued tasks")?;
        body.tasks.into_iter().next().ok_or_else(|| {
            Error::msg(format!(
                "queue response contained no task (msg: {:?})",
                body.msg
            ))
        })
    }

    pub async fn cancel_task(&self, task_id: &str) -> Result<()> {
        let path = format!("tasks/{task_id}/cancel");
        let url = self.url(&path)?;
        let resp = self
            .auth(self.client.post(url))
            .send()
            .await
            .with_context(|| format!("POST {path}"))?
            .error_for_status()
            .with_context(|| format!("POST {path} status"))?;
        drop(resp);
        Ok(())
    }
}

#[async_trait]
impl JobQueue for IronClient {
    async fn get_code(&self, code_id: &str) -> Result<Code> {
        self.get_code(code_id).await
    }

    async fn list_codes(&self) -> Result<Vec<Code>> {
        self.list_codes().await
    }

    async fn list_schedules(&self) -> Result<Vec<Schedule>> {
        self.list_schedules().await
    }

    async fn get_schedule(&self, schedule_id: &str) -> Result<Option<Schedule>> {
        self.get_schedule(schedule_id).await
    }

    async fn queue_task(&self, spec: TaskSpec) -> Result<Task> {
        self.queue_task(&spec).await
    }

    async fn cancel_task(&self, task_id: &str) -> Result<()> {
        self.cancel_task(task_id).await
    }
}
