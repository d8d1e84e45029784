use chrono::{Duration, NaiveDate};

use crate::{validate_steps, CoreError, PatternStep};

/// One planned review occurrence: step position plus the date both
/// `initial_scheduled_date` and `scheduled_date` take at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannedReview {
    pub step_number: u32,
    pub scheduled_date: NaiveDate,
}

/// Turns a pattern's steps into concrete review dates anchored to
/// `anchor` (the item's learned date). Offsets are cumulative:
/// `date(1) = anchor + interval_days(1)`, `date(k) = date(k-1) +
/// interval_days(k)`. Pure; performs no I/O.
pub fn plan_review_dates(
    steps: &[PatternStep],
    anchor: NaiveDate,
) -> Result<Vec<PlannedReview>, CoreError> {
    validate_steps(steps)?;

    let mut ordered: Vec<&PatternStep> = steps.iter().collect();
    ordered.sort_by_key(|step| step.step_number);

    let mut planned = Vec::with_capacity(ordered.len());
    let mut cursor = anchor;
    for step in ordered {
        cursor = cursor + Duration::days(step.interval_days);
        planned.push(PlannedReview {
            step_number: step.step_number,
            scheduled_date: cursor,
        });
    }

    Ok(planned)
}
