use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub mod planner;
pub mod rollover;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CoreError {
    #[error("pattern has no steps")]
    EmptyPattern,
    #[error("duplicate step number {0}")]
    DuplicateStepNumber(u32),
    #[error("step numbers are not contiguous: expected {expected}, found {found}")]
    NonContiguousSteps { expected: u32, found: u32 },
    #[error("step {step_number} has negative interval {interval_days}")]
    NegativeInterval { step_number: u32, interval_days: i64 },
    #[error("item {0} has inconsistent classification")]
    InconsistentClassification(String),
}

pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetWeight {
    Heavy,
    Normal,
    Light,
    Unset,
}

impl TargetWeight {
    pub fn as_str(self) -> &'static str {
        match self {
            TargetWeight::Heavy => "heavy",
            TargetWeight::Normal => "normal",
            TargetWeight::Light => "light",
            TargetWeight::Unset => "unset",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "heavy" => Some(TargetWeight::Heavy),
            "normal" => Some(TargetWeight::Normal),
            "light" => Some(TargetWeight::Light),
            "unset" => Some(TargetWeight::Unset),
            _ => None,
        }
    }
}

impl Default for TargetWeight {
    fn default() -> Self {
        TargetWeight::Unset
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternStep {
    pub step_id: String,
    pub pattern_id: String,
    /// 1-based position within the pattern.
    pub step_number: u32,
    /// Day offset from the previous step's date; step 1 is offset from the
    /// anchor date.
    pub interval_days: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pattern {
    pub pattern_id: String,
    pub owner_id: String,
    pub name: String,
    pub target_weight: TargetWeight,
    pub steps: Vec<PatternStep>,
    pub created_at: DateTime<Utc>,
}

impl Pattern {
    /// Steps sorted by position, after `validate_steps` has passed.
    pub fn ordered_steps(&self) -> Vec<&PatternStep> {
        let mut steps: Vec<&PatternStep> = self.steps.iter().collect();
        steps.sort_by_key(|step| step.step_number);
        steps
    }
}

/// Which collaborator query an item is served by. Scheduling itself does not
/// branch on this; partially classified items (box or pattern without the
/// full triple) are rejected up front.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Classified,
    CategoryOnly,
    Unclassified,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub item_id: String,
    pub owner_id: String,
    pub category_id: Option<String>,
    pub box_id: Option<String>,
    pub pattern_id: Option<String>,
    pub name: String,
    pub detail: Option<String>,
    /// Anchor date the pattern's first step is measured from.
    pub learned_date: NaiveDate,
    pub is_finished: bool,
    pub created_at: DateTime<Utc>,
}

impl Item {
    pub fn classification(&self) -> Result<Classification, CoreError> {
        match (&self.category_id, &self.box_id, &self.pattern_id) {
            (Some(_), Some(_), Some(_)) => Ok(Classification::Classified),
            (Some(_), None, None) => Ok(Classification::CategoryOnly),
            (None, None, None) => Ok(Classification::Unclassified),
            _ => Err(CoreError::InconsistentClassification(
                self.item_id.clone(),
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewDate {
    pub review_date_id: String,
    pub owner_id: String,
    pub category_id: Option<String>,
    pub box_id: Option<String>,
    pub item_id: String,
    pub step_number: u32,
    /// What was originally planned. Never changes after the row is created.
    pub initial_scheduled_date: NaiveDate,
    pub scheduled_date: NaiveDate,
    pub is_completed: bool,
}

impl ReviewDate {
    pub fn is_overdue(&self, as_of: NaiveDate) -> bool {
        !self.is_completed && self.scheduled_date < as_of
    }
}

/// Checks that steps form a contiguous 1..=N run with non-negative
/// intervals. Callers rely on this before planning or persisting.
pub fn validate_steps(steps: &[PatternStep]) -> Result<(), CoreError> {
    if steps.is_empty() {
        return Err(CoreError::EmptyPattern);
    }

    let mut ordered: Vec<&PatternStep> = steps.iter().collect();
    ordered.sort_by_key(|step| step.step_number);

    let mut expected = 1_u32;
    let mut previous: Option<u32> = None;
    for step in ordered {
        if previous == Some(step.step_number) {
            return Err(CoreError::DuplicateStepNumber(step.step_number));
        }
        if step.step_number != expected {
            return Err(CoreError::NonContiguousSteps {
                expected,
                found: step.step_number,
            });
        }
        if step.interval_days < 0 {
            return Err(CoreError::NegativeInterval {
                step_number: step.step_number,
                interval_days: step.interval_days,
            });
        }
        previous = Some(step.step_number);
        expected += 1;
    }

    Ok(())
}
