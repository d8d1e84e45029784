use chrono::NaiveDate;
use revbox_core::rollover::plan_rollover;
use revbox_storage::ReviewStore;
use std::time::Instant;
use tracing::{debug, warn};

use crate::SchedulerError;

/// Outcome of one rollover pass, for logging and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RolloverReport {
    /// Items the scan found with at least one overdue row.
    pub items_scanned: usize,
    /// Items whose schedule was actually rewritten.
    pub items_repaired: usize,
    /// Items whose repair transaction failed; they stay overdue and are
    /// picked up again at the next boundary.
    pub items_failed: usize,
    /// Total `scheduled_date` updates written.
    pub rows_shifted: usize,
}

/// Scans for overdue, uncompleted review rows and repairs each affected
/// item's schedule. Every item is repaired in its own transaction: a
/// failure rolls that item back and is logged, without touching items
/// already repaired or still pending. Running this again over repaired
/// state writes nothing.
pub fn run_rollover(
    store: &mut ReviewStore,
    as_of: NaiveDate,
) -> Result<RolloverReport, SchedulerError> {
    run_rollover_until(store, as_of, None)
}

/// Deadline-aware variant used by the executor: once `deadline` passes,
/// the pass stops between items and reports a budget failure. Items not
/// yet reached stay overdue and are retried at the next firing.
pub fn run_rollover_until(
    store: &mut ReviewStore,
    as_of: NaiveDate,
    deadline: Option<Instant>,
) -> Result<RolloverReport, SchedulerError> {
    let overdue = store.find_overdue_uncompleted(as_of)?;
    let mut report = RolloverReport {
        items_scanned: overdue.len(),
        ..RolloverReport::default()
    };

    for (item_id, rows) in overdue {
        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            warn!(
                event = "rollover_deadline",
                repaired = report.items_repaired,
                remaining = report.items_scanned - report.items_repaired - report.items_failed,
            );
            return Err(SchedulerError::BudgetExceeded);
        }

        let Some(owner_id) = rows.first().map(|row| row.owner_id.clone()) else {
            continue;
        };

        // Rows are re-read inside the transaction so the plan is computed
        // against state no concurrent writer can have moved under us.
        let repaired = store.in_transaction(|tx| {
            let current = tx.review_dates_for_item(&item_id, &owner_id)?;
            let shifts = plan_rollover(&current, as_of);
            if shifts.is_empty() {
                return Ok(0);
            }
            tx.update_scheduled_dates(&shifts, &owner_id)?;
            Ok(shifts.len())
        });

        match repaired {
            Ok(0) => {
                debug!(event = "rollover_noop", item_id = %item_id);
            }
            Ok(shifted) => {
                report.items_repaired += 1;
                report.rows_shifted += shifted;
                debug!(event = "item_repaired", item_id = %item_id, rows = shifted);
            }
            Err(err) => {
                report.items_failed += 1;
                warn!(event = "item_repair_failed", item_id = %item_id, error = %err);
            }
        }
    }

    Ok(report)
}
