//! Schedule resolution: function identity + invocation type -> remote schedule.

use crate::{CronPayload, InvocationType, JobQueue, Result, Schedule, TaskSpec};
use anyhow::Context;

/// A schedule together with its decoded invocation policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSchedule {
    pub schedule: Schedule,
    pub cron: CronPayload,
}

impl ResolvedSchedule {
    pub fn task_spec(&self, policy: &TimeoutPolicy) -> TaskSpec {
        TaskSpec {
            code_name: self.schedule.code_name.clone(),
            payload: self.cron.encrypted_payload.clone(),
            cluster: self.schedule.cluster.clone(),
            timeout: policy.effective(&self.schedule, &self.cron),
        }
    }
}

/// Task timeout policy.
///
/// Timeouts under `floor_secs` are treated as "unset" and replaced by `keep_running_secs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutPolicy {
    pub floor_secs: i64,
    pub keep_running_secs: i64,
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self {
            floor_secs: 60,
            keep_running_secs: 7200,
        }
    }
}

impl TimeoutPolicy {
    pub fn effective(&self, schedule: &Schedule, cron: &CronPayload) -> i64 {
        let timeout = if cron.timeout > 0 {
            cron.timeout
        } else {
            schedule.timeout
        };
        if timeout < self.floor_secs {
            self.keep_running_secs
        } else {
            timeout
        }
    }
}

/// First schedule whose decoded type equals `required`.
///
/// Undecodable payloads are skipped rather than treated as errors.
pub fn select_schedule(
    schedules: Vec<Schedule>,
    required: InvocationType,
) -> Option<ResolvedSchedule> {
    schedules.into_iter().find_map(|schedule| {
        let cron = schedule.cron_payload().ok()?;
        (cron.invocation_type() == Some(required)).then_some(ResolvedSchedule { schedule, cron })
    })
}

/// Look up the schedule serving `function_id` for the given invocation type.
///
/// The function identity is a code id: the code is fetched first and its schedules listed by
/// code name. `Ok(None)` means nothing matched.
pub async fn resolve_schedule(
    queue: &dyn JobQueue,
    function_id: &str,
    required: InvocationType,
) -> Result<Option<ResolvedSchedule>> {
    let code = queue
        .get_code(function_id)
        .await
        .with_context(|| format!("get code {function_id}"))?;
    let schedules = queue
        .schedules_with_code(&code.name)
        .await
        .with_context(|| format!("list schedules for code {}", code.name))?;

    tracing::debug!(
        event = "funcgate.resolve.candidates",
        function_id,
        code_name = %code.name,
        candidates = schedules.len(),
        required = %required,
        "listed candidate schedules"
    );

    Ok(select_schedule(schedules, required))
}
