//! In-memory job queue for tests.
//!
//! Records every `queue_task` / `cancel_task` call so callers can assert exact call counts, and
//! can be switched into failure modes to exercise error paths.

use crate::{Code, Error, JobQueue, Result, Schedule, Task, TaskSpec};
use async_trait::async_trait;
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Default)]
pub struct InMemoryJobQueue {
    state: Mutex<State>,
}

#[derive(Debug, Default)]
struct State {
    codes: Vec<Code>,
    schedules: Vec<Schedule>,
    queued: Vec<(Task, TaskSpec)>,
    cancelled: Vec<String>,
    listings: usize,
    fail_listing: bool,
    fail_queue: bool,
    fail_cancel: bool,
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a code whose id and name are both `name`.
    pub fn add_code(&self, name: &str) {
        self.state().codes.push(Code {
            id: name.to_string(),
            name: name.to_string(),
            image: format!("{name}:latest"),
        });
    }

    pub fn add_schedule(&self, schedule: Schedule) {
        self.state().schedules.push(schedule);
    }

    pub fn set_schedules(&self, schedules: Vec<Schedule>) {
        self.state().schedules = schedules;
    }

    pub fn set_fail_listing(&self, fail: bool) {
        self.state().fail_listing = fail;
    }

    pub fn set_fail_queue(&self, fail: bool) {
        self.state().fail_queue = fail;
    }

    pub fn set_fail_cancel(&self, fail: bool) {
        self.state().fail_cancel = fail;
    }

    /// Specs passed to successful `queue_task` calls, in call order.
    pub fn queued(&self) -> Vec<TaskSpec> {
        self.state().queued.iter().map(|(_, s)| s.clone()).collect()
    }

    pub fn queued_task_ids(&self) -> Vec<String> {
        self.state().queued.iter().map(|(t, _)| t.id.clone()).collect()
    }

    /// Task ids passed to `cancel_task`, in call order (including failed attempts).
    pub fn cancelled(&self) -> Vec<String> {
        self.state().cancelled.clone()
    }

    pub fn listings(&self) -> usize {
        self.state().listings
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn get_code(&self, code_id: &str) -> Result<Code> {
        let state = self.state();
        if state.fail_listing {
            return Err(Error::msg("code lookup unavailable"));
        }
        state
            .codes
            .iter()
            .find(|c| c.id == code_id)
            .cloned()
            .ok_or_else(|| Error::msg(format!("code {code_id} not found")))
    }

    async fn list_codes(&self) -> Result<Vec<Code>> {
        Ok(self.state().codes.clone())
    }

    async fn list_schedules(&self) -> Result<Vec<Schedule>> {
        let mut state = self.state();
        state.listings += 1;
        if state.fail_listing {
            return Err(Error::msg("schedule listing unavailable"));
        }
        Ok(state.schedules.clone())
    }

    async fn get_schedule(&self, schedule_id: &str) -> Result<Option<Schedule>> {
        Ok(self
            .state()
            .schedules
            .iter()
            .find(|s| s.id == schedule_id)
            .cloned())
    }

    async fn queue_task(&self, spec: TaskSpec) -> Result<Task> {
        let mut state = self.state();
        if state.fail_queue {
            return Err(Error::msg("queue unavailable"));
        }
        let task = Task {
            id: format!("T{}", state.queued.len() + 1),
        };
        state.queued.push((task.clone(), spec));
        Ok(task)
    }

    async fn cancel_task(&self, task_id: &str) -> Result<()> {
        let mut state = self.state();
        state.cancelled.push(task_id.to_string());
        if state.fail_cancel {
            return Err(Error::msg("cancel unavailable"));
        }
        Ok(())
    }
}
