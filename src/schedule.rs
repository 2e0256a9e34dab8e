//! The scheduler (C7): a priority queue of `(next-fire-time, imperative)`
//! drained by a single task. Fired actions dispatch with no associated
//! session; their invalidations reach live sessions through the registry's
//! refresh notifier.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::watch;

use crate::compile::{Imperative, ImperativeKind, ScheduleSpec};
use crate::prelude::*;
use crate::session::action::Dispatch;
use crate::site::Site;
use crate::source::{FetchCtx, Params};

struct Job {
    route: String,
    imperative: Imperative,
}

fn next_fire(spec: &ScheduleSpec, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match spec {
        ScheduleSpec::Cron(schedule) => schedule.after(&after).next(),
        ScheduleSpec::Every(interval) => {
            Some(after + chrono::Duration::from_std(*interval).ok()?)
        }
    }
}

/// Start the scheduler task. It ends when `shutdown` flips to true.
pub fn start(site: Arc<Site>, mut shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut queue: BinaryHeap<Reverse<(DateTime<Utc>, usize)>> = BinaryHeap::new();
        let mut jobs: Vec<Job> = Vec::new();

        let now = Utc::now();
        for page in site.pages() {
            for imperative in &page.schedules {
                let Some(next) = next_fire(&imperative.schedule, now) else {
                    warn!(raw = %imperative.raw, "schedule never fires");
                    continue;
                };

                let idx = jobs.len();
                jobs.push(Job {
                    route: page.route.clone(),
                    imperative: imperative.clone(),
                });
                queue.push(Reverse((next, idx)));
            }
        }

        if jobs.is_empty() {
            return;
        }
        info!("Scheduler armed with {} job(s).", jobs.len());

        loop {
            let Some(Reverse((at, idx))) = queue.pop() else {
                return;
            };

            let wait = (at - Utc::now()).to_std().unwrap_or_default();

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        info!("Scheduler stopping.");
                        return;
                    }
                    // Spurious wake; the job has not fired yet.
                    queue.push(Reverse((at, idx)));
                    continue;
                }
            }

            fire(&site, &jobs[idx]).await;

            if let Some(next) = next_fire(&jobs[idx].imperative.schedule, Utc::now()) {
                queue.push(Reverse((next, idx)));
            }
        }
    })
}

async fn fire(site: &Arc<Site>, job: &Job) {
    let corr_id = correlation_id();

    match &job.imperative.kind {
        ImperativeKind::Notify { message } => {
            info!(corr_id = %corr_id, route = %job.route, "notify: {message}");
        }
        ImperativeKind::Run { action } => {
            debug!(corr_id = %corr_id, route = %job.route, action = %action, "scheduled action firing");

            let Some(page) = site.page(&job.route) else {
                warn!(route = %job.route, "scheduled page no longer exists");
                return;
            };

            let ctx = FetchCtx::new(corr_id.clone());
            let dispatch = Dispatch {
                registry: &site.registry,
                settings: &page.settings,
                ctx: &ctx,
                allow_exec: site.registry.exec_allowed(),
                primary_source: None,
            };

            if let Err(err) = dispatch.run(action, &Params::new()).await {
                error!(corr_id = %corr_id, action = %action, "scheduled action failed: {err}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile::imperative::parse_schedule;

    #[test]
    fn interval_jobs_advance() {
        let spec = parse_schedule("@every:30s").unwrap();
        let now = Utc::now();

        let first = next_fire(&spec, now).unwrap();
        assert_eq!((first - now).num_seconds(), 30);
    }

    #[test]
    fn cron_jobs_fire_in_the_future() {
        let spec = parse_schedule("@hourly").unwrap();
        let now = Utc::now();

        let first = next_fire(&spec, now).unwrap();
        assert!(first > now);
        assert!((first - now).num_seconds() <= 3600);
    }
}
