use chrono::{DateTime, Duration, NaiveDate, Utc};
use revbox_core::planner::plan_review_dates;
use revbox_core::rollover::ScheduleShift;
use revbox_core::{new_id, CoreError, Item, Pattern, PatternStep, ReviewDate, TargetWeight};
use rusqlite::{params, Connection, InterruptHandle, OptionalExtension};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

pub const SCHEDULE_SCHEMA_VERSION: i64 = 1;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("invalid schedule data: {0}")]
    Invalid(#[from] CoreError),
    #[error("date parse error: {0}")]
    Date(String),
    #[error("codec error: {0}")]
    Codec(String),
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
    #[error("pattern {pattern_id} does not match item {item_id}")]
    PatternMismatch { item_id: String, pattern_id: String },
    #[error("review date {0} not found or frozen")]
    RowNotFound(String),
}

/// Review rows for items that have at least one overdue, uncompleted row,
/// keyed by item id. The engine repairs each entry independently.
pub type OverdueByItem = BTreeMap<String, Vec<ReviewDate>>;

pub struct ReviewStore {
    conn: Connection,
}

/// Transaction-scoped handle passed to `ReviewStore::in_transaction`
/// closures. It carries the same row operations as the store, but no way
/// to open another transaction: nested work reuses the active handle.
pub struct ScheduleTx<'conn> {
    conn: &'conn Connection,
}

impl ReviewStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        Self::prepare(conn)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        Self::prepare(conn)
    }

    fn prepare(conn: Connection) -> Result<Self, StorageError> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    pub fn schema_version(&self) -> Result<i64, StorageError> {
        Ok(self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    pub fn migrate(&self) -> Result<(), StorageError> {
        let current = self.schema_version()?;
        if current > SCHEDULE_SCHEMA_VERSION {
            return Err(StorageError::UnsupportedSchemaVersion {
                found: current,
                supported: SCHEDULE_SCHEMA_VERSION,
            });
        }

        if current < 1 {
            let sql = include_str!("../migrations/0001_schedule_schema.sql");
            self.conn.execute_batch(sql)?;
            self.conn
                .execute("PRAGMA user_version = 1", [])
                .map(|_| ())?;
        }

        Ok(())
    }

    /// Handle that can abort this connection's in-flight statement from
    /// another thread; the open transaction then rolls back.
    pub fn interrupt_handle(&self) -> InterruptHandle {
        self.conn.get_interrupt_handle()
    }

    /// The unit-of-work boundary: runs `work` against a transaction-scoped
    /// handle, commits on `Ok`, rolls back on `Err`. The rollback is
    /// best-effort and never masks the error `work` returned.
    pub fn in_transaction<T>(
        &mut self,
        work: impl FnOnce(&ScheduleTx<'_>) -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        let tx = self.conn.transaction()?;
        let outcome = {
            let handle = ScheduleTx { conn: &tx };
            work(&handle)
        };
        match outcome {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(err) => {
                let _ = tx.rollback();
                Err(err)
            }
        }
    }

    pub fn create_pattern(&mut self, pattern: &Pattern) -> Result<(), StorageError> {
        revbox_core::validate_steps(&pattern.steps)?;
        self.in_transaction(|tx| {
            insert_pattern(tx.conn, pattern)?;
            for step in pattern.ordered_steps() {
                insert_pattern_step(tx.conn, step)?;
            }
            Ok(())
        })
    }

    pub fn pattern(
        &self,
        pattern_id: &str,
        owner_id: &str,
    ) -> Result<Option<Pattern>, StorageError> {
        load_pattern(&self.conn, pattern_id, owner_id)
    }

    /// Plans the full review schedule for `item` against `pattern` and
    /// persists item plus schedule in one transaction. Either both land or
    /// neither does; an item without its full schedule is never observable.
    pub fn create_item_with_schedule(
        &mut self,
        item: &Item,
        pattern: &Pattern,
    ) -> Result<usize, StorageError> {
        item.classification()?;
        if item.pattern_id.as_deref() != Some(pattern.pattern_id.as_str()) {
            return Err(StorageError::PatternMismatch {
                item_id: item.item_id.clone(),
                pattern_id: pattern.pattern_id.clone(),
            });
        }

        let rows = planned_rows(item, pattern)?;
        self.in_transaction(|tx| {
            tx.insert_item(item)?;
            tx.create_review_dates(&rows)
        })
    }

    /// Replaces an item's pending schedule after a box/pattern change:
    /// uncompleted rows are dropped and a fresh plan is written, skipping
    /// step numbers already frozen by completion. One transaction.
    pub fn replace_schedule(
        &mut self,
        item: &Item,
        pattern: &Pattern,
    ) -> Result<usize, StorageError> {
        let rows = planned_rows(item, pattern)?;
        self.in_transaction(|tx| {
            delete_uncompleted_rows(tx.conn, &item.item_id, &item.owner_id)?;
            let completed = completed_step_numbers(tx.conn, &item.item_id, &item.owner_id)?;
            let fresh: Vec<ReviewDate> = rows
                .into_iter()
                .filter(|row| !completed.contains(&row.step_number))
                .collect();
            tx.create_review_dates(&fresh)
        })
    }

    /// Slides every uncompleted row of an item forward (positive `days`)
    /// or backward (negative) by the same amount, in one transaction.
    pub fn shift_schedule(
        &mut self,
        item_id: &str,
        owner_id: &str,
        days: i64,
    ) -> Result<usize, StorageError> {
        self.in_transaction(|tx| {
            let rows = tx.review_dates_for_item(item_id, owner_id)?;
            let shifts: Vec<ScheduleShift> = rows
                .iter()
                .filter(|row| !row.is_completed)
                .map(|row| ScheduleShift {
                    review_date_id: row.review_date_id.clone(),
                    step_number: row.step_number,
                    from: row.scheduled_date,
                    to: row.scheduled_date + Duration::days(days),
                })
                .collect();
            tx.update_scheduled_dates(&shifts, owner_id)?;
            Ok(shifts.len())
        })
    }

    pub fn item(&self, item_id: &str, owner_id: &str) -> Result<Option<Item>, StorageError> {
        load_item(&self.conn, item_id, owner_id)
    }

    pub fn review_dates_for_item(
        &self,
        item_id: &str,
        owner_id: &str,
    ) -> Result<Vec<ReviewDate>, StorageError> {
        review_dates_for_item(&self.conn, item_id, owner_id)
    }

    pub fn create_review_dates(&self, rows: &[ReviewDate]) -> Result<usize, StorageError> {
        create_review_dates(&self.conn, rows)
    }

    pub fn update_scheduled_dates(
        &self,
        shifts: &[ScheduleShift],
        owner_id: &str,
    ) -> Result<(), StorageError> {
        update_scheduled_dates(&self.conn, shifts, owner_id)
    }

    /// Scan entrypoint for the rollover engine: every uncompleted row with
    /// `scheduled_date` before `as_of`, grouped by owning item.
    pub fn find_overdue_uncompleted(
        &self,
        as_of: NaiveDate,
    ) -> Result<OverdueByItem, StorageError> {
        find_overdue_uncompleted(&self.conn, as_of)
    }

    pub fn mark_completed(&self, review_date_id: &str, owner_id: &str) -> Result<(), StorageError> {
        set_completed(&self.conn, review_date_id, owner_id, true)
    }

    pub fn mark_incomplete(&self, review_date_id: &str, owner_id: &str) -> Result<(), StorageError> {
        set_completed(&self.conn, review_date_id, owner_id, false)
    }

    /// Removes an item; its review dates go with it via FK cascade.
    pub fn delete_item(&self, item_id: &str, owner_id: &str) -> Result<bool, StorageError> {
        let changes = self.conn.execute(
            "DELETE FROM items WHERE item_id = ?1 AND owner_id = ?2",
            params![item_id, owner_id],
        )?;
        Ok(changes > 0)
    }
}

impl ScheduleTx<'_> {
    pub fn insert_item(&self, item: &Item) -> Result<(), StorageError> {
        insert_item(self.conn, item)
    }

    pub fn create_review_dates(&self, rows: &[ReviewDate]) -> Result<usize, StorageError> {
        create_review_dates(self.conn, rows)
    }

    pub fn review_dates_for_item(
        &self,
        item_id: &str,
        owner_id: &str,
    ) -> Result<Vec<ReviewDate>, StorageError> {
        review_dates_for_item(self.conn, item_id, owner_id)
    }

    pub fn update_scheduled_dates(
        &self,
        shifts: &[ScheduleShift],
        owner_id: &str,
    ) -> Result<(), StorageError> {
        update_scheduled_dates(self.conn, shifts, owner_id)
    }
}

/// Builds the persistent rows for a freshly planned schedule. Both date
/// columns start at the planned value; category/box are denormalized from
/// the item so the overdue scan never needs a join.
fn planned_rows(item: &Item, pattern: &Pattern) -> Result<Vec<ReviewDate>, StorageError> {
    let planned = plan_review_dates(&pattern.steps, item.learned_date)?;
    Ok(planned
        .into_iter()
        .map(|review| ReviewDate {
            review_date_id: new_id(),
            owner_id: item.owner_id.clone(),
            category_id: item.category_id.clone(),
            box_id: item.box_id.clone(),
            item_id: item.item_id.clone(),
            step_number: review.step_number,
            initial_scheduled_date: review.scheduled_date,
            scheduled_date: review.scheduled_date,
            is_completed: false,
        })
        .collect())
}

fn insert_pattern(conn: &Connection, pattern: &Pattern) -> Result<(), StorageError> {
    conn.execute(
        "
        INSERT INTO patterns (pattern_id, owner_id, name, target_weight, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5)
        ",
        params![
            pattern.pattern_id,
            pattern.owner_id,
            pattern.name,
            pattern.target_weight.as_str(),
            pattern.created_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

fn insert_pattern_step(conn: &Connection, step: &PatternStep) -> Result<(), StorageError> {
    conn.execute(
        "
        INSERT INTO pattern_steps (step_id, pattern_id, step_number, interval_days)
        VALUES (?1, ?2, ?3, ?4)
        ",
        params![
            step.step_id,
            step.pattern_id,
            i64::from(step.step_number),
            step.interval_days,
        ],
    )?;
    Ok(())
}

fn load_pattern(
    conn: &Connection,
    pattern_id: &str,
    owner_id: &str,
) -> Result<Option<Pattern>, StorageError> {
    let header = conn
        .query_row(
            "
            SELECT pattern_id, owner_id, name, target_weight, created_at
            FROM patterns
            WHERE pattern_id = ?1 AND owner_id = ?2
            ",
            params![pattern_id, owner_id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            },
        )
        .optional()?;

    let Some((pattern_id, owner_id, name, weight_raw, created_raw)) = header else {
        return Ok(None);
    };

    let target_weight = TargetWeight::parse(&weight_raw)
        .ok_or_else(|| StorageError::Codec(format!("invalid target weight: {weight_raw}")))?;
    let created_at = parse_timestamp(created_raw)?;

    let mut statement = conn.prepare(
        "
        SELECT step_id, pattern_id, step_number, interval_days
        FROM pattern_steps
        WHERE pattern_id = ?1
        ORDER BY step_number ASC
        ",
    )?;
    let rows = statement.query_map([&pattern_id], |row| {
        Ok(PatternStep {
            step_id: row.get(0)?,
            pattern_id: row.get(1)?,
            step_number: row.get::<_, i64>(2)? as u32,
            interval_days: row.get(3)?,
        })
    })?;

    let mut steps = Vec::new();
    for row in rows {
        steps.push(row?);
    }

    Ok(Some(Pattern {
        pattern_id,
        owner_id,
        name,
        target_weight,
        steps,
        created_at,
    }))
}

fn insert_item(conn: &Connection, item: &Item) -> Result<(), StorageError> {
    conn.execute(
        "
        INSERT INTO items (
            item_id,
            owner_id,
            category_id,
            box_id,
            pattern_id,
            name,
            detail,
            learned_date,
            is_finished,
            created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
        ",
        params![
            item.item_id,
            item.owner_id,
            item.category_id,
            item.box_id,
            item.pattern_id,
            item.name,
            item.detail,
            date_to_sql(item.learned_date),
            item.is_finished as i64,
            item.created_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

fn load_item(
    conn: &Connection,
    item_id: &str,
    owner_id: &str,
) -> Result<Option<Item>, StorageError> {
    let item = conn
        .query_row(
            "
            SELECT item_id, owner_id, category_id, box_id, pattern_id,
                   name, detail, learned_date, is_finished, created_at
            FROM items
            WHERE item_id = ?1 AND owner_id = ?2
            ",
            params![item_id, owner_id],
            |row| {
                let learned_raw: String = row.get(7)?;
                let created_raw: String = row.get(9)?;
                Ok((
                    Item {
                        item_id: row.get(0)?,
                        owner_id: row.get(1)?,
                        category_id: row.get(2)?,
                        box_id: row.get(3)?,
                        pattern_id: row.get(4)?,
                        name: row.get(5)?,
                        detail: row.get(6)?,
                        learned_date: NaiveDate::default(),
                        is_finished: row.get::<_, i64>(8)? != 0,
                        created_at: DateTime::<Utc>::default(),
                    },
                    learned_raw,
                    created_raw,
                ))
            },
        )
        .optional()?;

    let Some((mut item, learned_raw, created_raw)) = item else {
        return Ok(None);
    };
    item.learned_date = parse_date(&learned_raw)?;
    item.created_at = parse_timestamp(created_raw)?;
    Ok(Some(item))
}

fn create_review_dates(conn: &Connection, rows: &[ReviewDate]) -> Result<usize, StorageError> {
    let mut statement = conn.prepare(
        "
        INSERT INTO review_dates (
            review_date_id,
            owner_id,
            category_id,
            box_id,
            item_id,
            step_number,
            initial_scheduled_date,
            scheduled_date,
            is_completed
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
        ",
    )?;

    for row in rows {
        statement.execute(params![
            row.review_date_id,
            row.owner_id,
            row.category_id,
            row.box_id,
            row.item_id,
            i64::from(row.step_number),
            date_to_sql(row.initial_scheduled_date),
            date_to_sql(row.scheduled_date),
            row.is_completed as i64,
        ])?;
    }

    Ok(rows.len())
}

fn review_dates_for_item(
    conn: &Connection,
    item_id: &str,
    owner_id: &str,
) -> Result<Vec<ReviewDate>, StorageError> {
    let mut statement = conn.prepare(
        "
        SELECT review_date_id, owner_id, category_id, box_id, item_id,
               step_number, initial_scheduled_date, scheduled_date, is_completed
        FROM review_dates
        WHERE item_id = ?1 AND owner_id = ?2
        ORDER BY step_number ASC
        ",
    )?;

    let rows = statement.query_map(params![item_id, owner_id], review_date_from_row)?;
    let mut review_dates = Vec::new();
    for row in rows {
        review_dates.push(row?);
    }
    Ok(review_dates)
}

fn update_scheduled_dates(
    conn: &Connection,
    shifts: &[ScheduleShift],
    owner_id: &str,
) -> Result<(), StorageError> {
    let mut statement = conn.prepare(
        "
        UPDATE review_dates
        SET scheduled_date = ?1
        WHERE review_date_id = ?2 AND owner_id = ?3 AND is_completed = 0
        ",
    )?;

    for shift in shifts {
        let changes = statement.execute(params![
            date_to_sql(shift.to),
            shift.review_date_id,
            owner_id,
        ])?;
        if changes == 0 {
            return Err(StorageError::RowNotFound(shift.review_date_id.clone()));
        }
    }

    Ok(())
}

fn find_overdue_uncompleted(
    conn: &Connection,
    as_of: NaiveDate,
) -> Result<OverdueByItem, StorageError> {
    let mut statement = conn.prepare(
        "
        SELECT review_date_id, owner_id, category_id, box_id, item_id,
               step_number, initial_scheduled_date, scheduled_date, is_completed
        FROM review_dates
        WHERE is_completed = 0 AND scheduled_date < ?1
        ORDER BY item_id ASC, step_number ASC
        ",
    )?;

    let rows = statement.query_map([date_to_sql(as_of)], review_date_from_row)?;
    let mut grouped: OverdueByItem = BTreeMap::new();
    for row in rows {
        let row = row?;
        grouped.entry(row.item_id.clone()).or_default().push(row);
    }
    Ok(grouped)
}

fn set_completed(
    conn: &Connection,
    review_date_id: &str,
    owner_id: &str,
    completed: bool,
) -> Result<(), StorageError> {
    let changes = conn.execute(
        "
        UPDATE review_dates
        SET is_completed = ?1
        WHERE review_date_id = ?2 AND owner_id = ?3
        ",
        params![completed as i64, review_date_id, owner_id],
    )?;
    if changes == 0 {
        return Err(StorageError::RowNotFound(review_date_id.to_string()));
    }
    Ok(())
}

fn delete_uncompleted_rows(
    conn: &Connection,
    item_id: &str,
    owner_id: &str,
) -> Result<usize, StorageError> {
    Ok(conn.execute(
        "DELETE FROM review_dates WHERE item_id = ?1 AND owner_id = ?2 AND is_completed = 0",
        params![item_id, owner_id],
    )?)
}

fn completed_step_numbers(
    conn: &Connection,
    item_id: &str,
    owner_id: &str,
) -> Result<Vec<u32>, StorageError> {
    let mut statement = conn.prepare(
        "
        SELECT step_number
        FROM review_dates
        WHERE item_id = ?1 AND owner_id = ?2 AND is_completed = 1
        ",
    )?;
    let rows = statement.query_map(params![item_id, owner_id], |row| {
        Ok(row.get::<_, i64>(0)? as u32)
    })?;
    let mut steps = Vec::new();
    for row in rows {
        steps.push(row?);
    }
    Ok(steps)
}

fn review_date_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ReviewDate> {
    let initial_raw: String = row.get(6)?;
    let scheduled_raw: String = row.get(7)?;
    let initial_scheduled_date = parse_date(&initial_raw).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(
            6,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                err.to_string(),
            )),
        )
    })?;
    let scheduled_date = parse_date(&scheduled_raw).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(
            7,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                err.to_string(),
            )),
        )
    })?;

    Ok(ReviewDate {
        review_date_id: row.get(0)?,
        owner_id: row.get(1)?,
        category_id: row.get(2)?,
        box_id: row.get(3)?,
        item_id: row.get(4)?,
        step_number: row.get::<_, i64>(5)? as u32,
        initial_scheduled_date,
        scheduled_date,
        is_completed: row.get::<_, i64>(8)? != 0,
    })
}

fn date_to_sql(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

fn parse_date(value: &str) -> Result<NaiveDate, StorageError> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map_err(|err| StorageError::Date(err.to_string()))
}

fn parse_timestamp(value: String) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(&value)
        .map(|timestamp| timestamp.with_timezone(&Utc))
        .map_err(|err| StorageError::Date(err.to_string()))
}
