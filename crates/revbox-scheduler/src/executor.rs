use chrono::{DateTime, Duration, Local, NaiveDate, TimeZone, Timelike};
use revbox_storage::ReviewStore;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration as StdDuration, Instant};
use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::engine::{run_rollover_until, RolloverReport};
use crate::SchedulerError;

const BOUNDARY_MINUTES: i64 = 15;

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub db_path: PathBuf,
    /// How long one firing may run before its storage work is interrupted.
    pub firing_budget: StdDuration,
}

impl ExecutorConfig {
    pub fn new(db_path: PathBuf) -> Self {
        Self {
            db_path,
            firing_budget: StdDuration::from_secs(600),
        }
    }
}

/// The next :00/:15/:30/:45 wall-clock boundary strictly after `now`
/// (except when `now` sits exactly on a boundary, which maps to the next
/// one). Alignment depends only on the clock, never on process start.
pub fn next_quarter_boundary<Tz: TimeZone>(now: DateTime<Tz>) -> DateTime<Tz> {
    let truncated = now
        .clone()
        .with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(now);
    let remainder = i64::from(truncated.minute()) % BOUNDARY_MINUTES;
    truncated + Duration::minutes(BOUNDARY_MINUTES - remainder)
}

/// Guard that lets at most one firing run at a time: a tick arriving while
/// a firing is in flight is skipped instead of piling up behind slow
/// storage.
#[derive(Debug, Clone, Default)]
pub(crate) struct FiringGuard {
    running: Arc<AtomicBool>,
}

impl FiringGuard {
    pub(crate) fn try_acquire(&self) -> bool {
        !self.running.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn release(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

/// Fires the rollover engine at each quarter-hour boundary. The control
/// loop only waits and dispatches; each firing runs as its own task with a
/// bounded budget, so a slow or failing firing never stalls the timer.
pub struct QuarterHourExecutor {
    config: ExecutorConfig,
    guard: FiringGuard,
}

impl QuarterHourExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        Self {
            config,
            guard: FiringGuard::default(),
        }
    }

    /// Runs until the surrounding task is dropped (process shutdown).
    pub async fn run(&self) {
        let now = Local::now();
        let first = next_quarter_boundary(now.clone());
        let delay = (first.clone() - now)
            .to_std()
            .unwrap_or(StdDuration::ZERO);
        info!(
            event = "executor_armed",
            first_firing = %first.format("%H:%M:%S"),
        );

        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + delay,
            StdDuration::from_secs((BOUNDARY_MINUTES * 60) as u64),
        );

        loop {
            ticker.tick().await;
            if !self.guard.try_acquire() {
                warn!(event = "firing_skipped", reason = "previous firing still running");
                continue;
            }

            let guard = self.guard.clone();
            let db_path = self.config.db_path.clone();
            let budget = self.config.firing_budget;
            tokio::spawn(async move {
                let as_of = Local::now().date_naive();
                match fire_once(db_path, budget, as_of).await {
                    Ok(report) => info!(
                        event = "firing_complete",
                        items_scanned = report.items_scanned,
                        items_repaired = report.items_repaired,
                        items_failed = report.items_failed,
                        rows_shifted = report.rows_shifted,
                    ),
                    Err(err) => warn!(event = "firing_failed", error = %err),
                }
                guard.release();
            });
        }
    }
}

/// One firing: opens its own connection, runs the rollover pass on a
/// blocking thread, and enforces the execution budget. On expiry the
/// in-flight statement is interrupted so the open transaction rolls back,
/// and the engine's deadline check stops the pass between items; the rows
/// left behind stay overdue and are retried at the next boundary.
pub async fn fire_once(
    db_path: PathBuf,
    budget: StdDuration,
    as_of: NaiveDate,
) -> Result<RolloverReport, SchedulerError> {
    let deadline = Instant::now() + budget;
    let (handle_tx, handle_rx) = oneshot::channel();

    let mut worker = tokio::task::spawn_blocking(move || {
        let mut store = ReviewStore::open(&db_path)?;
        let _ = handle_tx.send(store.interrupt_handle());
        run_rollover_until(&mut store, as_of, Some(deadline))
    });

    let interrupt = handle_rx.await.ok();
    match tokio::time::timeout(budget, &mut worker).await {
        Ok(joined) => joined.map_err(|err| SchedulerError::Join(err.to_string()))?,
        Err(_elapsed) => {
            if let Some(handle) = interrupt {
                handle.interrupt();
            }
            // Drain the worker so its connection is closed before the next
            // firing can start.
            let _ = worker.await;
            Err(SchedulerError::BudgetExceeded)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use revbox_core::{Item, Pattern, PatternStep, TargetWeight};
    use tempfile::NamedTempFile;

    fn at(hour: u32, minute: u32, second: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 6, hour, minute, second)
            .single()
            .expect("valid timestamp")
    }

    #[test]
    fn boundary_is_independent_of_start_offset() {
        assert_eq!(next_quarter_boundary(at(10, 7, 30)), at(10, 15, 0));
        assert_eq!(next_quarter_boundary(at(10, 0, 1)), at(10, 15, 0));
        assert_eq!(next_quarter_boundary(at(10, 14, 59)), at(10, 15, 0));
    }

    #[test]
    fn consecutive_boundaries_walk_the_quarter_hours() {
        let first = next_quarter_boundary(at(10, 7, 30));
        let second = next_quarter_boundary(first.clone());
        let third = next_quarter_boundary(second.clone());

        assert_eq!(first, at(10, 15, 0));
        assert_eq!(second, at(10, 30, 0));
        assert_eq!(third, at(10, 45, 0));
    }

    #[test]
    fn boundary_rolls_over_the_hour() {
        assert_eq!(next_quarter_boundary(at(10, 59, 59)), at(11, 0, 0));
        assert_eq!(next_quarter_boundary(at(10, 45, 1)), at(11, 0, 0));
    }

    #[test]
    fn guard_admits_one_firing_at_a_time() {
        let guard = FiringGuard::default();
        assert!(guard.try_acquire());
        assert!(!guard.try_acquire());
        guard.release();
        assert!(guard.try_acquire());
    }

    fn seeded_db() -> NamedTempFile {
        let file = NamedTempFile::new().expect("temp db");
        let mut store = ReviewStore::open(file.path()).expect("open store");
        let pattern = Pattern {
            pattern_id: "pat-1".to_string(),
            owner_id: "owner-1".to_string(),
            name: "default curve".to_string(),
            target_weight: TargetWeight::Unset,
            steps: vec![
                PatternStep {
                    step_id: "pat-1-step-1".to_string(),
                    pattern_id: "pat-1".to_string(),
                    step_number: 1,
                    interval_days: 1,
                },
                PatternStep {
                    step_id: "pat-1-step-2".to_string(),
                    pattern_id: "pat-1".to_string(),
                    step_number: 2,
                    interval_days: 3,
                },
            ],
            created_at: Utc.with_ymd_and_hms(2024, 1, 1, 8, 0, 0)
                .single()
                .expect("valid timestamp"),
        };
        store.create_pattern(&pattern).expect("create pattern");
        let item = Item {
            item_id: "item-1".to_string(),
            owner_id: "owner-1".to_string(),
            category_id: Some("cat-1".to_string()),
            box_id: Some("box-1".to_string()),
            pattern_id: Some("pat-1".to_string()),
            name: "borrow checker".to_string(),
            detail: None,
            learned_date: chrono::NaiveDate::from_ymd_opt(2024, 1, 1).expect("valid date"),
            is_finished: false,
            created_at: Utc.with_ymd_and_hms(2024, 1, 1, 8, 0, 0)
                .single()
                .expect("valid timestamp"),
        };
        store
            .create_item_with_schedule(&item, &pattern)
            .expect("create item");
        file
    }

    #[tokio::test]
    async fn fire_once_repairs_overdue_schedules() {
        let file = seeded_db();
        let as_of = chrono::NaiveDate::from_ymd_opt(2024, 1, 10).expect("valid date");

        let report = fire_once(
            file.path().to_path_buf(),
            StdDuration::from_secs(60),
            as_of,
        )
        .await
        .expect("firing succeeds");

        assert_eq!(report.items_repaired, 1);
        assert_eq!(report.rows_shifted, 2);

        let store = ReviewStore::open(file.path()).expect("reopen store");
        let rows = store
            .review_dates_for_item("item-1", "owner-1")
            .expect("load rows");
        assert_eq!(
            rows[0].scheduled_date,
            chrono::NaiveDate::from_ymd_opt(2024, 1, 10).expect("valid date")
        );
        assert_eq!(
            rows[1].scheduled_date,
            chrono::NaiveDate::from_ymd_opt(2024, 1, 13).expect("valid date")
        );
    }

    #[tokio::test]
    async fn fire_once_with_spent_budget_reports_failure() {
        let file = seeded_db();
        let as_of = chrono::NaiveDate::from_ymd_opt(2024, 1, 10).expect("valid date");

        let result = fire_once(file.path().to_path_buf(), StdDuration::ZERO, as_of).await;
        assert!(matches!(
            result,
            Err(SchedulerError::BudgetExceeded) | Err(SchedulerError::Storage(_))
        ));
    }
}
