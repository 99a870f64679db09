//! Cron job driver.
//!
//! Each job gets its own loop: sleep to the next matching minute, spawn the
//! job body, repeat. Runs are spawned rather than awaited, so a firing that
//! overlaps a still-running pass goes ahead; the ledger's idempotence is what
//! makes that safe, not serialization here. A failed run is not retried
//! either; the next scheduled firing is the retry at this granularity.
//! Spawned runs are tracked, and `stop` drains them before returning.

use std::{collections::HashMap, future::Future, pin::Pin, sync::Arc, time::Duration};

use chrono::{DateTime, Datelike, Local, Timelike};
use tokio::{sync::Mutex, task::JoinHandle, time::sleep};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{error, info};

use crate::{Error, Result};

pub type JobFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;
pub type JobBody = Arc<dyn Fn() -> JobFuture + Send + Sync>;

/// Per-job bookkeeping, exposed through the health surface.
#[derive(Clone, Copy, Debug, Default)]
pub struct JobStats {
    pub last_run: Option<DateTime<Local>>,
    pub last_success: Option<DateTime<Local>>,
    pub consecutive_failures: u32,
}

#[derive(Clone)]
pub struct JobRunner {
    inner: Arc<RunnerInner>,
}

struct RunnerInner {
    cancel: CancellationToken,
    runs: TaskTracker,
    state: Mutex<RunnerState>,
}

#[derive(Default)]
struct RunnerState {
    stats: HashMap<String, JobStats>,
    loops: Vec<JoinHandle<()>>,
}

impl JobRunner {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            inner: Arc::new(RunnerInner {
                cancel,
                runs: TaskTracker::new(),
                state: Mutex::new(RunnerState::default()),
            }),
        }
    }

    pub async fn add_job(&self, name: &str, cron: &str, body: JobBody) -> Result<()> {
        let expr = CronExpr::parse(cron)
            .map_err(|e| Error::Config(format!("job {name}: invalid cron {cron:?}: {e}")))?;

        let mut st = self.inner.state.lock().await;
        st.stats.insert(name.to_string(), JobStats::default());

        let runner = self.clone();
        let name = name.to_string();
        let handle = tokio::spawn(async move {
            runner.job_loop(name, expr, body).await;
        });
        st.loops.push(handle);

        Ok(())
    }

    async fn job_loop(&self, name: String, expr: CronExpr, body: JobBody) {
        info!("job {name} scheduled: next at {:?}", expr.next_after(Local::now()));
        loop {
            let Some(next) = expr.next_after(Local::now()) else {
                error!("job {name} has no next run, stopping its loop");
                break;
            };

            let dur = (next - Local::now())
                .to_std()
                .unwrap_or(Duration::from_secs(0));

            tokio::select! {
              _ = self.inner.cancel.cancelled() => break,
              _ = sleep(dur) => {
                let runner = self.clone();
                let name = name.clone();
                let body = body.clone();
                self.inner.runs.spawn(async move {
                    runner.mark_run(&name).await;
                    match body().await {
                        Ok(()) => {
                            runner.mark_success(&name).await;
                            info!("job {name} completed");
                        }
                        Err(e) => {
                            let failures = runner.mark_failure(&name).await;
                            error!("job {name} failed ({failures} consecutive): {e}");
                        }
                    }
                });
              }
            }
        }
    }

    pub async fn stats(&self) -> HashMap<String, JobStats> {
        self.inner.state.lock().await.stats.clone()
    }

    /// Stop the scheduling loops, then wait for in-flight runs to finish so
    /// the storage handle can be dropped safely afterwards.
    pub async fn stop(&self) {
        self.inner.cancel.cancel();
        {
            let mut st = self.inner.state.lock().await;
            for handle in st.loops.drain(..) {
                handle.abort();
            }
        }
        self.inner.runs.close();
        self.inner.runs.wait().await;
    }

    async fn mark_run(&self, name: &str) {
        let mut st = self.inner.state.lock().await;
        if let Some(s) = st.stats.get_mut(name) {
            s.last_run = Some(Local::now());
        }
    }

    async fn mark_success(&self, name: &str) {
        let mut st = self.inner.state.lock().await;
        if let Some(s) = st.stats.get_mut(name) {
            s.last_success = Some(Local::now());
            s.consecutive_failures = 0;
        }
    }

    async fn mark_failure(&self, name: &str) -> u32 {
        let mut st = self.inner.state.lock().await;
        match st.stats.get_mut(name) {
            Some(s) => {
                s.consecutive_failures += 1;
                s.consecutive_failures
            }
            None => 0,
        }
    }
}

// === Cron expression engine ===

/// Standard 5-field cron expression (min hour dom mon dow).
#[derive(Clone, Copy, Debug)]
pub struct CronExpr {
    minute: CronField,
    hour: CronField,
    dom: CronField,
    month: CronField,
    dow: CronField,
}

/// One cron field as a bitmask over its value range.
#[derive(Clone, Copy, Debug)]
struct CronField {
    mask: u64,
    lo: u32,
    hi: u32,
}

impl CronExpr {
    pub fn parse(expr: &str) -> Result<Self> {
        let parts: Vec<&str> = expr.split_whitespace().collect();
        if parts.len() != 5 {
            return Err(Error::Config(format!(
                "expected 5 cron fields, got {}",
                parts.len()
            )));
        }

        Ok(Self {
            minute: CronField::parse(parts[0], 0, 59, false)?,
            hour: CronField::parse(parts[1], 0, 23, false)?,
            dom: CronField::parse(parts[2], 1, 31, false)?,
            month: CronField::parse(parts[3], 1, 12, false)?,
            dow: CronField::parse(parts[4], 0, 6, true)?,
        })
    }

    pub fn matches(&self, dt: DateTime<Local>) -> bool {
        if !self.minute.contains(dt.minute())
            || !self.hour.contains(dt.hour())
            || !self.month.contains(dt.month())
        {
            return false;
        }

        // Standard cron semantics: when both DOM and DOW are restricted,
        // match if EITHER does.
        let dom_match = self.dom.contains(dt.day());
        let dow_match = self.dow.contains(dt.weekday().num_days_from_sunday());

        match (self.dom.is_any(), self.dow.is_any()) {
            (true, true) => true,
            (true, false) => dow_match,
            (false, true) => dom_match,
            (false, false) => dom_match || dow_match,
        }
    }

    /// Next matching minute boundary strictly after `now`. Capped at one year
    /// of minutes so an impossible expression terminates.
    pub fn next_after(&self, now: DateTime<Local>) -> Option<DateTime<Local>> {
        let mut t = (now + chrono::Duration::minutes(1))
            .with_second(0)?
            .with_nanosecond(0)?;

        for _ in 0..(366 * 24 * 60) {
            if self.matches(t) {
                return Some(t);
            }
            t += chrono::Duration::minutes(1);
        }
        None
    }
}

impl CronField {
    fn parse(raw: &str, lo: u32, hi: u32, sunday_alias: bool) -> Result<Self> {
        let mut field = Self { mask: 0, lo, hi };
        let raw = raw.trim();

        for part in raw.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }

            let (base, step) = match part.split_once('/') {
                Some((b, s)) => {
                    let step: u32 = s
                        .trim()
                        .parse()
                        .map_err(|_| Error::Config(format!("invalid step: {s}")))?;
                    if step == 0 {
                        return Err(Error::Config("step must be > 0".to_string()));
                    }
                    (b.trim(), step)
                }
                None => (part, 1),
            };

            let (start, end) = if base == "*" {
                (lo, hi)
            } else if let Some((a, b)) = base.split_once('-') {
                (
                    parse_value(a, sunday_alias)?,
                    parse_value(b, sunday_alias)?,
                )
            } else {
                let v = parse_value(base, sunday_alias)?;
                // A bare value with a step ("5/10") ranges to the field max.
                if part.contains('/') {
                    (v, hi)
                } else {
                    (v, v)
                }
            };

            let start = start.max(lo);
            let end = end.min(hi);
            if start > end {
                return Err(Error::Config(format!("invalid range: {base}")));
            }

            let mut v = start;
            while v <= end {
                field.mask |= 1u64 << v;
                v += step;
            }
        }

        if field.mask == 0 {
            return Err(Error::Config(format!("empty cron field: {raw}")));
        }
        Ok(field)
    }

    fn contains(&self, v: u32) -> bool {
        v >= self.lo && v <= self.hi && (self.mask >> v) & 1 == 1
    }

    fn is_any(&self) -> bool {
        (self.lo..=self.hi).all(|v| (self.mask >> v) & 1 == 1)
    }
}

fn parse_value(s: &str, sunday_alias: bool) -> Result<u32> {
    let v: u32 = s
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("invalid cron value: {s}")))?;
    // Both 0 and 7 mean Sunday in the day-of-week field.
    if sunday_alias && v == 7 {
        Ok(0)
    } else {
        Ok(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn hourly_expression_matches_only_minute_zero() {
        let expr = CronExpr::parse("0 * * * *").unwrap();
        let on_the_hour = Local.with_ymd_and_hms(2026, 8, 25, 10, 0, 0).unwrap();
        let past_it = Local.with_ymd_and_hms(2026, 8, 25, 10, 1, 0).unwrap();
        assert!(expr.matches(on_the_hour));
        assert!(!expr.matches(past_it));
    }

    #[test]
    fn step_expression_finds_next_boundary() {
        let expr = CronExpr::parse("*/10 * * * *").unwrap();
        let now = Local.with_ymd_and_hms(2026, 8, 25, 10, 3, 30).unwrap();
        let next = expr.next_after(now).unwrap();
        assert_eq!(next.minute(), 10);
        assert_eq!(next.second(), 0);
    }

    #[test]
    fn next_is_strictly_in_the_future() {
        let expr = CronExpr::parse("* * * * *").unwrap();
        let now = Local.with_ymd_and_hms(2026, 8, 25, 10, 3, 0).unwrap();
        let next = expr.next_after(now).unwrap();
        assert_eq!(next.minute(), 4);
    }

    #[test]
    fn dow_seven_is_sunday() {
        let expr = CronExpr::parse("0 9 * * 7").unwrap();
        // 2026-08-30 is a Sunday.
        let sunday = Local.with_ymd_and_hms(2026, 8, 30, 9, 0, 0).unwrap();
        let monday = Local.with_ymd_and_hms(2026, 8, 31, 9, 0, 0).unwrap();
        assert!(expr.matches(sunday));
        assert!(!expr.matches(monday));
    }

    #[test]
    fn restricted_dom_and_dow_match_on_either() {
        let expr = CronExpr::parse("0 0 15 * 1").unwrap();
        // 2026-08-15 is a Saturday; matches via DOM.
        let dom = Local.with_ymd_and_hms(2026, 8, 15, 0, 0, 0).unwrap();
        // 2026-08-24 is a Monday; matches via DOW.
        let dow = Local.with_ymd_and_hms(2026, 8, 24, 0, 0, 0).unwrap();
        let neither = Local.with_ymd_and_hms(2026, 8, 25, 0, 0, 0).unwrap();
        assert!(expr.matches(dom));
        assert!(expr.matches(dow));
        assert!(!expr.matches(neither));
    }

    #[test]
    fn rejects_wrong_field_count_and_bad_values() {
        assert!(CronExpr::parse("* * * *").is_err());
        assert!(CronExpr::parse("61 * * * *").is_err());
        assert!(CronExpr::parse("*/0 * * * *").is_err());
        assert!(CronExpr::parse("5-1 * * * *").is_err());
    }

    #[test]
    fn list_and_range_fields() {
        let expr = CronExpr::parse("0,30 9-17 * * 1-5").unwrap();
        let in_hours = Local.with_ymd_and_hms(2026, 8, 25, 9, 30, 0).unwrap();
        let off_hours = Local.with_ymd_and_hms(2026, 8, 25, 18, 0, 0).unwrap();
        assert!(expr.matches(in_hours));
        assert!(!expr.matches(off_hours));
    }

    #[tokio::test]
    async fn failure_counter_tracks_consecutive_failures_and_resets() {
        let runner = JobRunner::new(CancellationToken::new());
        {
            let mut st = runner.inner.state.lock().await;
            st.stats.insert("job".to_string(), JobStats::default());
        }

        assert_eq!(runner.mark_failure("job").await, 1);
        assert_eq!(runner.mark_failure("job").await, 2);
        runner.mark_success("job").await;

        let stats = runner.stats().await;
        let s = stats.get("job").unwrap();
        assert_eq!(s.consecutive_failures, 0);
        assert!(s.last_success.is_some());
    }

    #[test]
    fn consecutive_firings_keep_the_step_spacing() {
        let expr = CronExpr::parse("*/10 * * * *").unwrap();
        let start = Local.with_ymd_and_hms(2026, 8, 25, 10, 3, 30).unwrap();

        let first = expr.next_after(start).unwrap();
        let second = expr.next_after(first).unwrap();
        let third = expr.next_after(second).unwrap();
        assert_eq!(second - first, chrono::Duration::minutes(10));
        assert_eq!(third - second, chrono::Duration::minutes(10));

        // Step rolls over the hour boundary.
        let late = Local.with_ymd_and_hms(2026, 8, 25, 10, 50, 0).unwrap();
        let next = expr.next_after(late).unwrap();
        assert_eq!((next.hour(), next.minute()), (11, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn job_loop_runs_the_body_and_records_success() {
        static FIRED: AtomicU32 = AtomicU32::new(0);

        let runner = JobRunner::new(CancellationToken::new());
        runner
            .add_job(
                "tick",
                "* * * * *",
                Arc::new(|| -> JobFuture {
                    Box::pin(async {
                        FIRED.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    })
                }),
            )
            .await
            .unwrap();

        // Two minute boundaries plus slack.
        tokio::time::sleep(Duration::from_secs(130)).await;
        runner.stop().await;
        assert!(FIRED.load(Ordering::SeqCst) >= 2);

        let stats = runner.stats().await;
        let s = stats.get("tick").unwrap();
        assert!(s.last_run.is_some());
        assert!(s.last_success.is_some());
        assert_eq!(s.consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_drains_in_flight_runs_before_returning() {
        static DONE: AtomicU32 = AtomicU32::new(0);

        let runner = JobRunner::new(CancellationToken::new());
        runner
            .add_job(
                "slow",
                "* * * * *",
                Arc::new(|| -> JobFuture {
                    Box::pin(async {
                        // Far longer than the test's own sleep: the run can
                        // only complete if stop waits for it.
                        sleep(Duration::from_secs(3600)).await;
                        DONE.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    })
                }),
            )
            .await
            .unwrap();

        // Past at least one minute boundary, so one run is in flight.
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(DONE.load(Ordering::SeqCst), 0);

        runner.stop().await;
        assert!(DONE.load(Ordering::SeqCst) >= 1);
    }
}
