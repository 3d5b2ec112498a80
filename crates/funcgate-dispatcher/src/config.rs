use crate::{auth::AuthMode, DispatcherConfig};
use anyhow::Context;
use clap::Parser;
use funcgate_core::{iron::IronConfig, TimeoutPolicy};
use std::{net::SocketAddr, time::Duration};

/// Gateway configuration (flags or environment).
#[derive(Parser, Clone)]
#[command(name = "funcgate-dispatcher", about = "On-demand compute gateway")]
pub struct GatewayConfig {
    /// Bind address for the HTTP server.
    #[arg(long, env = "GATEWAY_BIND", default_value = "0.0.0.0:8079")]
    pub bind: String,

    /// Job-queue API settings as JSON: `{base_url, project_id, token, cluster_info?}`.
    #[arg(long, env = "IRON_CONFIG")]
    pub iron_config: String,

    /// host:port a spawned worker becomes reachable on.
    #[arg(long, env = "UPSTREAM_ADDR", default_value = "localhost:8081")]
    pub upstream_addr: String,

    /// How long to wait for a spawned worker to accept connections.
    #[arg(long, env = "UPSTREAM_WAIT_TIMEOUT_MS", default_value_t = 60_000)]
    pub upstream_wait_timeout_ms: u64,

    #[arg(long, env = "UPSTREAM_POLL_MS", default_value_t = 100)]
    pub upstream_poll_ms: u64,

    /// Schedule timeouts below this are replaced by `task_keep_running_secs`.
    #[arg(long, env = "TASK_TIMEOUT_FLOOR_SECS", default_value_t = 60)]
    pub task_timeout_floor_secs: i64,

    #[arg(long, env = "TASK_KEEP_RUNNING_SECS", default_value_t = 7_200)]
    pub task_keep_running_secs: i64,

    /// How long a parked async request stays available for pickup.
    #[arg(long, env = "PENDING_TTL_SECS", default_value_t = 1_200)]
    pub pending_ttl_secs: u64,

    #[arg(long, env = "PENDING_SWEEP_SECS", default_value_t = 2_400)]
    pub pending_sweep_secs: u64,

    /// Interval between cron reconciliation cycles.
    #[arg(long, env = "CRONTAB_REFRESH_SECS", default_value_t = 15)]
    pub reconcile_interval_secs: u64,

    #[arg(long, env = "CRONTAB_DISABLED", default_value_t = false)]
    pub disable_crontab: bool,

    /// Largest inbound body buffered for forwarding or caching.
    #[arg(long, env = "MAX_BODY_BYTES", default_value_t = 10 * 1024 * 1024)]
    pub max_body_bytes: usize,

    /// `none` or `token`.
    #[arg(long, env = "GATEWAY_AUTH_TYPE", default_value = "none")]
    pub auth_type: String,

    /// Shared secret for `token` auth.
    #[arg(long, env = "AUTH_TOKEN_TOKEN")]
    pub auth_token: Option<String>,
}

impl std::fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let auth_token = self.auth_token.as_deref().map(|_| "<redacted>");
        f.debug_struct("GatewayConfig")
            .field("bind", &self.bind)
            .field("iron_config", &"<redacted>")
            .field("upstream_addr", &self.upstream_addr)
            .field("upstream_wait_timeout_ms", &self.upstream_wait_timeout_ms)
            .field("upstream_poll_ms", &self.upstream_poll_ms)
            .field("task_timeout_floor_secs", &self.task_timeout_floor_secs)
            .field("task_keep_running_secs", &self.task_keep_running_secs)
            .field("pending_ttl_secs", &self.pending_ttl_secs)
            .field("pending_sweep_secs", &self.pending_sweep_secs)
            .field("reconcile_interval_secs", &self.reconcile_interval_secs)
            .field("disable_crontab", &self.disable_crontab)
            .field("max_body_bytes", &self.max_body_bytes)
            .field("auth_type", &self.auth_type)
            .field("auth_token", &auth_token)
            .finish()
    }
}

impl GatewayConfig {
    pub fn bind_addr(&self) -> anyhow::Result<SocketAddr> {
        self.bind
            .parse()
            .with_context(|| format!("parse bind addr {:?}", self.bind))
    }

    pub fn iron_config(&self) -> anyhow::Result<IronConfig> {
        IronConfig::from_json(&self.iron_config).context("IRON_CONFIG")
    }

    pub fn dispatcher_config(&self) -> anyhow::Result<DispatcherConfig> {
        if self.upstream_poll_ms == 0 {
            anyhow::bail!("upstream poll interval must be positive");
        }
        if self.reconcile_interval_secs == 0 || self.pending_sweep_secs == 0 {
            anyhow::bail!("background loop intervals must be positive");
        }
        Ok(DispatcherConfig {
            upstream_addr: self.upstream_addr.clone(),
            upstream_wait_timeout: Duration::from_millis(self.upstream_wait_timeout_ms),
            upstream_poll_interval: Duration::from_millis(self.upstream_poll_ms),
            timeouts: TimeoutPolicy {
                floor_secs: self.task_timeout_floor_secs,
                keep_running_secs: self.task_keep_running_secs,
            },
            pending_ttl: Duration::from_secs(self.pending_ttl_secs),
            pending_sweep_interval: Duration::from_secs(self.pending_sweep_secs),
            reconcile_interval: Duration::from_secs(self.reconcile_interval_secs),
            enable_crontab: !self.disable_crontab,
            max_body_bytes: self.max_body_bytes,
            auth: AuthMode::from_config(&self.auth_type, self.auth_token.as_deref())?,
        })
    }
}
