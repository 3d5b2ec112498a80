//! Synchronous dispatch: spawn a single-use worker, wait for it, proxy one request, tear down.

use crate::{DispatchError, DispatchErrorKind, Gateway};
use anyhow::Context;
use axum::{
    body::{Body, Bytes},
    extract::Request,
    http::{header, request::Parts, HeaderMap},
    response::Response,
};
use funcgate_core::{InvocationType, JobQueue};
use std::{sync::Arc, time::Duration};
use tokio::{net::TcpStream, time::Instant};

// Connection-scoped headers that must not cross the proxy.
const HOP_BY_HOP: [header::HeaderName; 8] = [
    header::CONNECTION,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
    header::HeaderName::from_static("keep-alive"),
];

impl Gateway {
    /// Serve `req` on a freshly spawned worker for `function_id`.
    ///
    /// Once a task was queued it is cancelled exactly once, whatever happens afterwards.
    pub async fn dispatch(
        &self,
        function_id: &str,
        residual_path: &str,
        req: Request,
    ) -> Result<Response, DispatchError> {
        let (parts, body) = req.into_parts();
        let body = self.read_body(body).await?;

        let resolved = self.resolve(function_id, InvocationType::Sync).await?;
        let spec = resolved.task_spec(&self.cfg.timeouts);

        let task = self.queue.queue_task(spec).await.map_err(|err| {
            DispatchError::new(
                DispatchErrorKind::TaskSpawnFailed,
                anyhow::Error::from(err).context("queue task"),
            )
        })?;
        tracing::info!(
            event = "funcgate.dispatch.task_queued",
            function_id,
            schedule_id = %resolved.schedule.id,
            task_id = %task.id,
            "task queued"
        );

        let guard = TaskGuard::new(self.queue.clone(), task.id.clone());
        let result = self.wait_and_forward(residual_path, &parts, body).await;
        guard.cancel().await;
        result
    }

    async fn wait_and_forward(
        &self,
        residual_path: &str,
        parts: &Parts,
        body: Bytes,
    ) -> Result<Response, DispatchError> {
        let upstream = &self.cfg.upstream_addr;
        tracing::debug!(
            event = "funcgate.dispatch.waiting",
            upstream = %upstream,
            "waiting for worker to connect"
        );
        wait_for_port(
            upstream,
            self.cfg.upstream_wait_timeout,
            self.cfg.upstream_poll_interval,
        )
        .await
        .map_err(|err| DispatchError::new(DispatchErrorKind::UpstreamTimeout, err))?;
        tracing::debug!(
            event = "funcgate.dispatch.worker_reachable",
            upstream = %upstream,
            "worker is accepting connections"
        );

        let resp = self
            .forward(residual_path, parts, body)
            .await
            .map_err(|err| DispatchError::new(DispatchErrorKind::ForwardingFailed, err))?;
        tracing::info!(
            event = "funcgate.dispatch.forwarded",
            path = %residual_path,
            status = resp.status().as_u16(),
            "upstream responded"
        );
        Ok(resp)
    }

    async fn forward(
        &self,
        residual_path: &str,
        parts: &Parts,
        body: Bytes,
    ) -> anyhow::Result<Response> {
        let url = upstream_url(&self.cfg.upstream_addr, residual_path, parts.uri.query());

        let mut headers = parts.headers.clone();
        strip_hop_by_hop(&mut headers);
        headers.remove(header::HOST);
        headers.remove(header::CONTENT_LENGTH);

        let resp = self
            .http
            .request(parts.method.clone(), &url)
            .headers(headers)
            .body(body)
            .send()
            .await
            .with_context(|| format!("{} {url}", parts.method))?;

        let status = resp.status();
        let mut headers = resp.headers().clone();
        strip_hop_by_hop(&mut headers);
        headers.remove(header::CONTENT_LENGTH);
        let bytes = resp.bytes().await.context("read upstream body")?;

        let mut out = Response::new(Body::from(bytes));
        *out.status_mut() = status;
        *out.headers_mut() = headers;
        Ok(out)
    }
}

/// Cancels its task when dropped without an explicit [`TaskGuard::cancel`].
///
/// The drop path covers handler futures that are abandoned (client went away) or unwound by a
/// panic; it hands the cancel call to the runtime instead of awaiting it.
struct TaskGuard {
    queue: Arc<dyn JobQueue>,
    task_id: Option<String>,
}

impl TaskGuard {
    fn new(queue: Arc<dyn JobQueue>, task_id: String) -> Self {
        Self {
            queue,
            task_id: Some(task_id),
        }
    }

    async fn cancel(mut self) {
        if let Some(task_id) = self.task_id.take() {
            cancel_task(self.queue.as_ref(), &task_id).await;
        }
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        let Some(task_id) = self.task_id.take() else {
            return;
        };
        let queue = self.queue.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { cancel_task(queue.as_ref(), &task_id).await });
            }
            Err(_) => tracing::warn!(
                event = "funcgate.dispatch.cancel_orphaned",
                task_id = %task_id,
                "no runtime to cancel task; it will run until its timeout"
            ),
        }
    }
}

async fn cancel_task(queue: &dyn JobQueue, task_id: &str) {
    match queue.cancel_task(task_id).await {
        Ok(()) => tracing::info!(
            event = "funcgate.dispatch.task_cancelled",
            task_id = %task_id,
            "task cancelled"
        ),
        Err(err) => tracing::warn!(
            event = "funcgate.dispatch.cancel_failed",
            task_id = %task_id,
            error = %err,
            "task cancel failed"
        ),
    }
}

/// Poll `addr` until a TCP connection succeeds or `timeout` elapses.
pub async fn wait_for_port(addr: &str, timeout: Duration, poll: Duration) -> anyhow::Result<()> {
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if let Ok(Ok(stream)) = tokio::time::timeout(remaining, TcpStream::connect(addr)).await {
            drop(stream);
            return Ok(());
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            anyhow::bail!("timed out waiting for {addr} after {timeout:?}");
        }
        tokio::time::sleep(poll.min(remaining)).await;
    }
}

fn upstream_url(addr: &str, residual_path: &str, query: Option<&str>) -> String {
    let mut url = format!("http://{addr}{residual_path}");
    if let Some(query) = query.filter(|q| !q.is_empty()) {
        url.push('?');
        url.push_str(query);
    }
    url
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP.iter() {
        headers.remove(name);
    }
}

/// Everything after the `/{route}/{function_id}` segments of the raw request path, or `/`.
///
/// The path is taken as received: percent-escapes such as `%2F` or `%3F` are kept so the worker
/// sees the same path segments the client sent.
pub fn residual_path(raw_path: &str) -> String {
    let mut segments = raw_path.trim_start_matches('/').splitn(3, '/');
    let rest = segments.nth(2).unwrap_or_default();
    format!("/{rest}")
}
