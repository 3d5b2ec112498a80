//! Async invocation: queue a worker, park the request for pickup, acknowledge immediately.

use crate::cache::PendingRequest;
use crate::{DispatchError, DispatchErrorKind, Gateway};
use axum::{
    body::Bytes,
    extract::Request,
    http::{HeaderMap, Method},
};
use funcgate_core::InvocationType;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const CALLBACK_HEADER: &str = "X-Callback-URL";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AsyncAccepted {
    #[serde(rename = "taskID")]
    pub task_id: String,
}

impl Gateway {
    pub async fn dispatch_async(
        &self,
        function_id: &str,
        residual_path: &str,
        req: Request,
    ) -> Result<AsyncAccepted, DispatchError> {
        if *req.method() != Method::POST {
            return Err(DispatchError::invalid(
                "only the POST method is supported for async-function invocations",
            ));
        }
        let callback = req
            .headers()
            .get(CALLBACK_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .ok_or_else(|| DispatchError::invalid("missing X-Callback-URL header"))?;

        let (parts, body) = req.into_parts();
        let body = self.read_body(body).await?;
        let snapshot = PendingRequest {
            headers: flatten_headers(&parts.headers),
            body: String::from_utf8(body.to_vec())
                .map_err(|_| DispatchError::invalid("request body must be valid UTF-8"))?,
            callback,
            path: residual_path.to_string(),
        };

        let resolved = self.resolve(function_id, InvocationType::Async).await?;
        // Encode before queuing so a failure here never leaves an orphaned task behind.
        let encoded = Bytes::from(serde_json::to_vec(&snapshot).map_err(|err| {
            DispatchError::new(DispatchErrorKind::InvalidRequest, err)
        })?);

        let spec = resolved.task_spec(&self.cfg.timeouts);
        let task = self.queue.queue_task(spec).await.map_err(|err| {
            DispatchError::new(
                DispatchErrorKind::TaskSpawnFailed,
                anyhow::Error::from(err).context("queue async task"),
            )
        })?;

        self.cache
            .insert_raw(&task.id, encoded, self.cache.default_ttl());
        tracing::info!(
            event = "funcgate.async.task_queued",
            function_id,
            schedule_id = %resolved.schedule.id,
            task_id = %task.id,
            "async task queued; request parked for pickup"
        );

        Ok(AsyncAccepted { task_id: task.id })
    }

    /// Stored snapshot bytes for `task_id`, exactly as they were cached.
    pub fn pickup(&self, task_id: &str) -> Result<Bytes, DispatchError> {
        let Some(raw) = self.cache.get_raw(task_id) else {
            tracing::info!(
                event = "funcgate.pickup.miss",
                task_id,
                "request data for task not found"
            );
            return Err(DispatchError::new(
                DispatchErrorKind::CacheMiss,
                anyhow::anyhow!("request data for task {task_id} not found"),
            ));
        };

        if let Err(err) = serde_json::from_slice::<PendingRequest>(&raw) {
            tracing::error!(
                event = "funcgate.pickup.corrupt",
                task_id,
                error = %err,
                "cached entry is not a request snapshot"
            );
            return Err(DispatchError::new(DispatchErrorKind::CorruptEntry, err));
        }

        tracing::info!(event = "funcgate.pickup.hit", task_id, "returning payload");
        Ok(raw)
    }
}

/// Collapse a header map to one value per name, last occurrence wins.
///
/// Names are rendered in canonical MIME form (`x-callback-url` -> `X-Callback-Url`). Values that
/// are not visible ASCII are skipped.
pub fn flatten_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for (name, value) in headers.iter() {
        let Ok(value) = value.to_str() else {
            continue;
        };
        out.insert(canonical_header_name(name.as_str()), value.to_string());
    }
    out
}

pub fn canonical_header_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper = true;
    for c in name.chars() {
        if upper {
            out.push(c.to_ascii_uppercase());
        } else {
            out.push(c.to_ascii_lowercase());
        }
        upper = c == '-';
    }
    out
}
