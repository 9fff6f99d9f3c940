//! In-memory scheduled jobs. A due job invokes one gateway method with its
//! stored params and publishes a `cron.fired` event.

use std::{
    collections::BTreeMap,
    str::FromStr,
    sync::{RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use {
    chrono::{DateTime, TimeZone, Utc},
    cron::Schedule,
    serde::Serialize,
    serde_json::Value,
    tracing::{debug, info},
};

#[derive(Debug, thiserror::Error)]
pub enum CronError {
    #[error("invalid schedule '{expr}': {reason}")]
    InvalidSchedule { expr: String, reason: String },
    #[error("method cannot be scheduled: {0}")]
    ForbiddenMethod(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CronJob {
    pub id: String,
    pub name: String,
    /// Cron expression with a seconds field, e.g. `0 */5 * * * *`.
    pub schedule: String,
    pub method: String,
    pub params: Value,
    pub enabled: bool,
    pub created_at: u64,
    pub last_run_at: Option<u64>,
    pub next_run_at: Option<u64>,
}

struct ScheduledJob {
    job: CronJob,
    schedule: Schedule,
}

fn to_ms(at: DateTime<Utc>) -> u64 {
    u64::try_from(at.timestamp_millis()).unwrap_or(0)
}

fn from_ms(ms: u64) -> DateTime<Utc> {
    let ms = i64::try_from(ms).unwrap_or(i64::MAX);
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

/// Methods a job may not call: scheduling itself or the handshake.
fn is_schedulable(method: &str) -> bool {
    !(method == "connect" || method.starts_with("cron."))
}

#[derive(Default)]
pub struct CronScheduler {
    jobs: RwLock<BTreeMap<String, ScheduledJob>>,
}

impl CronScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, ScheduledJob>> {
        self.jobs.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, ScheduledJob>> {
        self.jobs.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add(
        &self,
        name: &str,
        expr: &str,
        method: &str,
        params: Value,
        enabled: bool,
    ) -> Result<CronJob, CronError> {
        let schedule = Schedule::from_str(expr).map_err(|e| CronError::InvalidSchedule {
            expr: expr.to_string(),
            reason: e.to_string(),
        })?;
        if !is_schedulable(method) {
            return Err(CronError::ForbiddenMethod(method.to_string()));
        }

        let now = Utc::now();
        let job = CronJob {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            schedule: expr.to_string(),
            method: method.to_string(),
            params,
            enabled,
            created_at: to_ms(now),
            last_run_at: None,
            next_run_at: enabled
                .then(|| schedule.after(&now).next().map(to_ms))
                .flatten(),
        };
        info!(id = %job.id, name, method, schedule = expr, "cron job added");
        self.write().insert(job.id.clone(), ScheduledJob {
            job: job.clone(),
            schedule,
        });
        Ok(job)
    }

    pub fn remove(&self, id: &str) -> Option<CronJob> {
        self.write().remove(id).map(|s| s.job)
    }

    /// Jobs ordered by creation.
    pub fn list(&self) -> Vec<CronJob> {
        let mut jobs: Vec<CronJob> = self.read().values().map(|s| s.job.clone()).collect();
        jobs.sort_by_key(|j| j.created_at);
        jobs
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn enabled_count(&self) -> usize {
        self.read().values().filter(|s| s.job.enabled).count()
    }

    /// Claim every enabled job due at `now_ms` and advance its next run.
    pub fn take_due(&self, now_ms: u64) -> Vec<CronJob> {
        let now = from_ms(now_ms);
        let mut due = Vec::new();
        for scheduled in self.write().values_mut() {
            let job = &mut scheduled.job;
            if !job.enabled || job.next_run_at.is_none_or(|next| next > now_ms) {
                continue;
            }
            job.last_run_at = Some(now_ms);
            job.next_run_at = scheduled.schedule.after(&now).next().map(to_ms);
            debug!(id = %job.id, next = ?job.next_run_at, "cron job due");
            due.push(job.clone());
        }
        due
    }

    pub fn next_run_at(&self) -> Option<u64> {
        self.read()
            .values()
            .filter(|s| s.job.enabled)
            .filter_map(|s| s.job.next_run_at)
            .min()
    }
}
