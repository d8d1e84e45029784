use chrono::{Duration, NaiveDate};

use crate::ReviewDate;

/// One pending `scheduled_date` correction for a review row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleShift {
    pub review_date_id: String,
    pub step_number: u32,
    pub from: NaiveDate,
    pub to: NaiveDate,
}

/// Computes the repairs needed to bring one item's schedule back in line
/// after time has passed, without touching completed rows or any
/// `initial_scheduled_date`.
///
/// Working over the uncompleted rows in step order: the earliest overdue
/// row (`scheduled_date < as_of`) slides to `as_of`; each following row
/// that would now sort before its repaired predecessor shifts forward by
/// the delta applied to that predecessor, so the relative spacing the
/// pattern's intervals established survives the repair. The walk stops at
/// the first row whose date already satisfies the ordering, leaving later
/// rows untouched.
///
/// Returns an empty plan when nothing is overdue, which is what makes the
/// engine idempotent: re-running against repaired state is a no-op.
pub fn plan_rollover(rows: &[ReviewDate], as_of: NaiveDate) -> Vec<ScheduleShift> {
    let mut pending: Vec<&ReviewDate> =
        rows.iter().filter(|row| !row.is_completed).collect();
    pending.sort_by_key(|row| row.step_number);

    let mut shifts: Vec<ScheduleShift> = Vec::new();
    let mut carried_delta = Duration::zero();

    for row in pending {
        let target = match shifts.last() {
            None => {
                if row.scheduled_date >= as_of {
                    break;
                }
                carried_delta = as_of - row.scheduled_date;
                as_of
            }
            Some(previous) => {
                if row.scheduled_date >= previous.to {
                    break;
                }
                row.scheduled_date + carried_delta
            }
        };

        shifts.push(ScheduleShift {
            review_date_id: row.review_date_id.clone(),
            step_number: row.step_number,
            from: row.scheduled_date,
            to: target,
        });
    }

    shifts
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(year: i32, month: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(year, month, day).expect("valid date")
    }

    fn row(step_number: u32, scheduled: NaiveDate, completed: bool) -> ReviewDate {
        ReviewDate {
            review_date_id: format!("rd-{step_number}"),
            owner_id: "owner-1".to_string(),
            category_id: None,
            box_id: None,
            item_id: "item-1".to_string(),
            step_number,
            initial_scheduled_date: scheduled,
            scheduled_date: scheduled,
            is_completed: completed,
        }
    }

    fn ordering_holds(rows: &[ReviewDate], shifts: &[ScheduleShift]) -> bool {
        let mut dates: Vec<(u32, NaiveDate)> = rows
            .iter()
            .filter(|r| !r.is_completed)
            .map(|r| {
                let shifted = shifts
                    .iter()
                    .find(|s| s.review_date_id == r.review_date_id)
                    .map(|s| s.to)
                    .unwrap_or(r.scheduled_date);
                (r.step_number, shifted)
            })
            .collect();
        dates.sort_by_key(|(step, _)| *step);
        dates.windows(2).all(|pair| pair[0].1 <= pair[1].1)
    }

    #[test]
    fn nothing_overdue_plans_nothing() {
        let rows = vec![
            row(1, day(2024, 1, 10), false),
            row(2, day(2024, 1, 13), false),
        ];
        assert!(plan_rollover(&rows, day(2024, 1, 10)).is_empty());
    }

    #[test]
    fn overdue_row_slides_to_today_and_the_gap_cascades() {
        // step 2 lands 3 days after step 1; the repair keeps that gap.
        let rows = vec![
            row(1, day(2024, 1, 2), false),
            row(2, day(2024, 1, 5), false),
        ];
        let shifts = plan_rollover(&rows, day(2024, 1, 10));

        assert_eq!(shifts.len(), 2);
        assert_eq!(shifts[0].to, day(2024, 1, 10));
        assert_eq!(shifts[1].to, day(2024, 1, 13));
        assert!(ordering_holds(&rows, &shifts));
    }

    #[test]
    fn spacing_is_preserved_across_a_fully_overdue_run() {
        let rows = vec![
            row(1, day(2024, 1, 2), false),
            row(2, day(2024, 1, 4), false),
            row(3, day(2024, 1, 12), false),
        ];
        let shifts = plan_rollover(&rows, day(2024, 1, 10));

        // step 1 moves 8 days; step 2 keeps its 2-day gap; step 3 already
        // sits at or past the repaired step 2 and is left alone.
        assert_eq!(shifts.len(), 2);
        assert_eq!(shifts[0].to, day(2024, 1, 10));
        assert_eq!(shifts[1].to, day(2024, 1, 12));
        assert!(ordering_holds(&rows, &shifts));
    }

    #[test]
    fn cascade_stops_at_the_first_consistent_row() {
        let rows = vec![
            row(1, day(2024, 1, 4), false),
            row(2, day(2024, 1, 25), false),
            row(3, day(2024, 1, 26), false),
        ];
        let shifts = plan_rollover(&rows, day(2024, 1, 10));

        assert_eq!(shifts.len(), 1);
        assert_eq!(shifts[0].step_number, 1);
        assert_eq!(shifts[0].to, day(2024, 1, 10));
    }

    #[test]
    fn completed_rows_are_never_shifted() {
        let rows = vec![
            row(1, day(2024, 1, 2), true),
            row(2, day(2024, 1, 5), false),
        ];
        let shifts = plan_rollover(&rows, day(2024, 1, 10));

        assert_eq!(shifts.len(), 1);
        assert_eq!(shifts[0].step_number, 2);
        assert_eq!(shifts[0].to, day(2024, 1, 10));
    }

    #[test]
    fn a_second_pass_over_repaired_state_is_empty() {
        let mut rows = vec![
            row(1, day(2024, 1, 2), false),
            row(2, day(2024, 1, 5), false),
        ];
        let shifts = plan_rollover(&rows, day(2024, 1, 10));
        for shift in &shifts {
            let target = rows
                .iter_mut()
                .find(|r| r.review_date_id == shift.review_date_id)
                .expect("shifted row exists");
            target.scheduled_date = shift.to;
        }

        assert!(plan_rollover(&rows, day(2024, 1, 10)).is_empty());
    }

    #[test]
    fn due_today_is_not_overdue() {
        let rows = vec![row(1, day(2024, 1, 10), false)];
        assert!(plan_rollover(&rows, day(2024, 1, 10)).is_empty());
    }

    #[test]
    fn zero_day_gaps_collapse_onto_the_same_repaired_date() {
        let rows = vec![
            row(1, day(2024, 1, 5), false),
            row(2, day(2024, 1, 5), false),
        ];
        let shifts = plan_rollover(&rows, day(2024, 1, 10));

        assert_eq!(shifts.len(), 2);
        assert_eq!(shifts[0].to, day(2024, 1, 10));
        assert_eq!(shifts[1].to, day(2024, 1, 10));
        assert!(ordering_holds(&rows, &shifts));
    }
}
