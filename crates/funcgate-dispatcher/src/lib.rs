//! Function gateway service.
//!
//! Turns inbound HTTP requests into invocations of on-demand workers run by a remote job queue.
//! Sync requests spawn a single-use worker and are proxied to it once it listens; async requests
//! spawn a worker and park the request so the worker can pick it up by task id. A background
//! reconciler mirrors remote cron schedules into a local scheduler.

use anyhow::Context;
use axum::{
    body::Body,
    extract::{Path, Request, State},
    http::{header, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{any, get},
    Json, Router,
};
use funcgate_core::{resolve_schedule, InvocationType, JobQueue, ResolvedSchedule, TimeoutPolicy};
use http_body_util::LengthLimitError;
use serde::Deserialize;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::{net::TcpListener, sync::watch, task::JoinHandle};

pub mod async_dispatch;
pub mod auth;
pub mod cache;
pub mod config;
pub mod crontab;
mod error;
pub mod transport;

pub use async_dispatch::{AsyncAccepted, CALLBACK_HEADER};
pub use auth::AuthMode;
pub use cache::{PendingRequest, PendingRequestCache};
pub use error::{ApiError, DispatchError, DispatchErrorKind};

#[derive(Clone, Debug)]
pub struct DispatcherConfig {
    /// host:port the spawned worker listens on.
    pub upstream_addr: String,
    pub upstream_wait_timeout: Duration,
    pub upstream_poll_interval: Duration,
    pub timeouts: TimeoutPolicy,
    pub pending_ttl: Duration,
    pub pending_sweep_interval: Duration,
    pub reconcile_interval: Duration,
    pub enable_crontab: bool,
    pub max_body_bytes: usize,
    pub auth: AuthMode,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            upstream_addr: "localhost:8081".to_string(),
            upstream_wait_timeout: Duration::from_secs(60),
            upstream_poll_interval: Duration::from_millis(100),
            timeouts: TimeoutPolicy::default(),
            pending_ttl: Duration::from_secs(20 * 60),
            pending_sweep_interval: Duration::from_secs(40 * 60),
            reconcile_interval: Duration::from_secs(15),
            enable_crontab: true,
            max_body_bytes: 10 * 1024 * 1024,
            auth: AuthMode::None,
        }
    }
}

/// Shared state behind every route.
pub struct Gateway {
    queue: Arc<dyn JobQueue>,
    http: reqwest::Client,
    cache: PendingRequestCache,
    cfg: DispatcherConfig,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("cfg", &self.cfg)
            .field("pending", &self.cache.len())
            .finish()
    }
}

impl Gateway {
    pub fn new(cfg: DispatcherConfig, queue: Arc<dyn JobQueue>) -> anyhow::Result<Self> {
        // Worker responses are relayed as-is, redirects included.
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .context("build upstream http client")?;
        Ok(Self {
            queue,
            http,
            cache: PendingRequestCache::new(cfg.pending_ttl),
            cfg,
        })
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.cfg
    }

    pub fn cache(&self) -> &PendingRequestCache {
        &self.cache
    }

    pub fn queue(&self) -> Arc<dyn JobQueue> {
        self.queue.clone()
    }

    /// Any lookup failure is reported as a missing schedule.
    async fn resolve(
        &self,
        function_id: &str,
        required: InvocationType,
    ) -> Result<ResolvedSchedule, DispatchError> {
        match resolve_schedule(self.queue.as_ref(), function_id, required).await {
            Ok(Some(resolved)) => {
                tracing::debug!(
                    event = "funcgate.dispatch.schedule_resolved",
                    function_id,
                    schedule_id = %resolved.schedule.id,
                    invocation = %required,
                    "schedule resolved"
                );
                Ok(resolved)
            }
            Ok(None) => Err(DispatchError::new(
                DispatchErrorKind::ScheduleNotFound,
                anyhow::anyhow!("no {required} schedule for function {function_id}"),
            )),
            Err(err) => Err(DispatchError::new(
                DispatchErrorKind::ScheduleNotFound,
                anyhow::Error::from(err).context(format!("resolve function {function_id}")),
            )),
        }
    }

    async fn read_body(&self, body: Body) -> Result<axum::body::Bytes, DispatchError> {
        let limit = self.cfg.max_body_bytes;
        axum::body::to_bytes(body, limit).await.map_err(|err| {
            let inner = err.into_inner();
            if inner.downcast_ref::<LengthLimitError>().is_some() {
                return DispatchError::new(
                    DispatchErrorKind::InvalidRequest,
                    anyhow::anyhow!("request body exceeds the {limit} byte limit"),
                );
            }
            DispatchError::new(
                DispatchErrorKind::InvalidRequest,
                anyhow::anyhow!(inner).context("read request body"),
            )
        })
    }
}

pub fn router(gateway: Arc<Gateway>) -> Router {
    let auth = Arc::new(gateway.cfg.auth.clone());
    Router::new()
        .route("/function/:function_id", any(function_handler))
        .route("/function/:function_id/*rest", any(function_handler))
        .route("/async-function/:function_id", any(async_function_handler))
        .route("/async-function/:function_id/*rest", any(async_function_handler))
        .route("/payload/:task_id", get(payload_handler))
        .layer(middleware::from_fn_with_state(auth, auth::require_auth))
        .with_state(gateway)
}

#[derive(Debug, Deserialize)]
struct FunctionPath {
    function_id: String,
}

async fn function_handler(
    State(gateway): State<Arc<Gateway>>,
    Path(path): Path<FunctionPath>,
    req: Request,
) -> Result<Response, DispatchError> {
    let residual = transport::residual_path(req.uri().path());
    gateway.dispatch(&path.function_id, &residual, req).await
}

async fn async_function_handler(
    State(gateway): State<Arc<Gateway>>,
    Path(path): Path<FunctionPath>,
    req: Request,
) -> Result<(StatusCode, Json<AsyncAccepted>), DispatchError> {
    let residual = transport::residual_path(req.uri().path());
    let accepted = gateway
        .dispatch_async(&path.function_id, &residual, req)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(accepted)))
}

async fn payload_handler(
    State(gateway): State<Arc<Gateway>>,
    Path(task_id): Path<String>,
) -> Result<Response, DispatchError> {
    let raw = gateway.pickup(&task_id)?;
    Ok(([(header::CONTENT_TYPE, "application/json")], raw).into_response())
}

#[derive(Debug)]
pub struct GatewayServer {
    pub addr: SocketAddr,
    gateway: Arc<Gateway>,
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<anyhow::Result<()>>,
}

impl GatewayServer {
    pub async fn start(
        cfg: DispatcherConfig,
        queue: Arc<dyn JobQueue>,
        bind: SocketAddr,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(bind)
            .await
            .with_context(|| format!("bind gateway to {bind}"))?;
        let addr = listener.local_addr().context("gateway local_addr")?;

        let gateway = Arc::new(Gateway::new(cfg, queue)?);
        let app = router(gateway.clone());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(run_gateway(
            listener,
            app,
            gateway.clone(),
            shutdown_tx.clone(),
            shutdown_rx,
        ));

        tracing::info!(event = "funcgate.server.listening", addr = %addr, "gateway listening");
        Ok(Self {
            addr,
            gateway,
            shutdown_tx,
            join,
        })
    }

    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }

    pub async fn shutdown(self) -> anyhow::Result<()> {
        let _ = self.shutdown_tx.send(true);
        self.join.await.context("join gateway task")??;
        tracing::info!(event = "funcgate.server.stopped", "gateway stopped");
        Ok(())
    }
}

async fn run_gateway(
    listener: TcpListener,
    app: Router,
    gateway: Arc<Gateway>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let mut bg = Vec::<JoinHandle<()>>::new();
    bg.push(tokio::spawn(cache_sweep_loop(
        gateway.clone(),
        shutdown_rx.clone(),
    )));
    if gateway.cfg.enable_crontab {
        let scheduler = crontab::CronScheduler::new();
        let reconciler = Arc::new(crontab::CronReconciler::new(
            gateway.queue(),
            scheduler.clone(),
            gateway.cfg.timeouts,
        ));
        bg.push(tokio::spawn(scheduler.run(shutdown_rx.clone())));
        bg.push(tokio::spawn(
            reconciler.run(gateway.cfg.reconcile_interval, shutdown_rx.clone()),
        ));
    }

    let mut server_shutdown = shutdown_rx.clone();
    let server =
        axum::serve(listener, app.into_make_service()).with_graceful_shutdown(async move {
            while !*server_shutdown.borrow() {
                if server_shutdown.changed().await.is_err() {
                    break;
                }
            }
        });

    // Background loops stop whenever the server ends, error paths included.
    let server_res = server.await;
    let _ = shutdown_tx.send(true);

    for h in bg {
        let _ = h.await;
    }

    server_res.context("gateway serve")?;
    Ok(())
}

async fn cache_sweep_loop(gateway: Arc<Gateway>, mut shutdown_rx: watch::Receiver<bool>) {
    let interval = gateway.cfg.pending_sweep_interval;
    loop {
        if *shutdown_rx.borrow() {
            return;
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown_rx.changed() => continue,
        }

        let evicted = gateway.cache.evict_expired();
        if evicted > 0 {
            tracing::debug!(
                event = "funcgate.cache.swept",
                evicted,
                remaining = gateway.cache.len(),
                "evicted expired pending requests"
            );
        }
    }
}
