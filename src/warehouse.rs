use crate::flatten::CoinSnapshot;
use chrono::{NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use tracing::{debug, info};
use uuid::Uuid;

const DATE_FORMAT: &str = "%Y-%m-%d";

/// Returns true for identifiers that are safe to splice into SQL.
///
/// Relation names cannot be bound as parameters, so every name that reaches a
/// statement goes through this check first.
pub fn is_valid_identifier(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Joins a schema-like prefix and a name into one relation name.
///
/// SQLite has no schemas inside a single file, so `raw_coingecko` +
/// `coins_history` becomes `raw_coingecko__coins_history`.
pub fn qualified_name(schema: &str, name: &str) -> String {
    format!("{}__{}", schema, name)
}

fn checked(relation: &str) -> Result<&str, WarehouseError> {
    if is_valid_identifier(relation) {
        Ok(relation)
    } else {
        Err(WarehouseError::InvalidIdentifier(relation.to_string()))
    }
}

/// Outcome of appending one batch of snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadInfo {
    pub load_id: String,
    pub relation: String,
    pub target_date: NaiveDate,
    /// Rows written by this load
    pub inserted: usize,
    /// Rows whose `(id, report_date)` already existed
    pub skipped: usize,
}

/// Persisted state of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Running,
    Success,
    Failed,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Running => "running",
            RunState::Success => "success",
            RunState::Failed => "failed",
        }
    }

    fn parse(value: &str) -> Result<Self, WarehouseError> {
        match value {
            "running" => Ok(RunState::Running),
            "success" => Ok(RunState::Success),
            "failed" => Ok(RunState::Failed),
            other => Err(WarehouseError::Corrupt(format!("unknown run state '{}'", other))),
        }
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Result of trying to start a run for a logical date.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunClaim {
    /// The caller owns the run; `attempt` counts from 1
    Claimed { attempt: u32 },
    /// A successful run already exists for that date
    AlreadySucceeded,
}

/// Bookkeeping row for one logical date.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRecord {
    pub logical_date: NaiveDate,
    pub state: RunState,
    pub attempts: u32,
    pub message: Option<String>,
}

/// SQLite warehouse holding raw loads, transform outputs and run bookkeeping.
///
/// Automatically creates the bookkeeping schema on first use.
#[derive(Debug)]
pub struct Warehouse {
    conn: Connection,
}

impl Warehouse {
    /// Opens (or creates) a file-based warehouse.
    ///
    /// # Errors
    /// Returns an error if the database cannot be opened or the schema cannot be created.
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self, WarehouseError> {
        let conn = Connection::open(db_path)?;
        let warehouse = Warehouse { conn };
        warehouse.ensure_schema()?;
        Ok(warehouse)
    }

    /// Creates an in-memory warehouse. Useful for testing.
    pub fn open_in_memory() -> Result<Self, WarehouseError> {
        let conn = Connection::open_in_memory()?;
        let warehouse = Warehouse { conn };
        warehouse.ensure_schema()?;
        Ok(warehouse)
    }

    fn ensure_schema(&self) -> Result<(), WarehouseError> {
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS _loads (
                load_id TEXT PRIMARY KEY,
                relation TEXT NOT NULL,
                target_date TEXT NOT NULL,
                inserted INTEGER NOT NULL,
                skipped INTEGER NOT NULL,
                loaded_at TEXT NOT NULL
            )",
            [],
        )?;

        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS _pipeline_runs (
                logical_date TEXT PRIMARY KEY,
                state TEXT NOT NULL,
                attempts INTEGER NOT NULL,
                started_at TEXT NOT NULL,
                finished_at TEXT,
                message TEXT
            )",
            [],
        )?;

        Ok(())
    }

    /// Checks if a table or view exists.
    pub fn relation_exists(&self, relation: &str) -> Result<bool, WarehouseError> {
        let mut stmt = self.conn.prepare(
            "SELECT name FROM sqlite_master WHERE type IN ('table', 'view') AND name = ?1",
        )?;
        Ok(stmt.exists([relation])?)
    }

    /// Number of rows in a table or view.
    pub fn row_count(&self, relation: &str) -> Result<u64, WarehouseError> {
        let relation = checked(relation)?;
        let count: i64 = self.conn.query_row(
            &format!("SELECT COUNT(*) FROM \"{}\"", relation),
            [],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }

    /// Creates the raw snapshot table if needed.
    ///
    /// `(id, report_date)` is the primary key, which is what makes repeated
    /// loads of the same day idempotent.
    pub fn ensure_snapshot_table(&self, relation: &str) -> Result<(), WarehouseError> {
        let relation = checked(relation)?;
        self.conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS \"{rel}\" (
                id TEXT NOT NULL,
                symbol TEXT,
                name TEXT,
                image__thumb TEXT,
                image__small TEXT,
                market_data__current_price__usd REAL,
                market_data__market_cap__usd REAL,
                market_data__total_volume__usd REAL,
                community_data__reddit_average_posts_48h REAL,
                community_data__reddit_average_comments_48h REAL,
                community_data__reddit_accounts_active_48h REAL,
                report_date TEXT NOT NULL,
                _load_id TEXT NOT NULL,
                PRIMARY KEY (id, report_date)
            );
            CREATE INDEX IF NOT EXISTS \"idx_{rel}_report_date\" ON \"{rel}\"(report_date);",
            rel = relation
        ))?;
        Ok(())
    }

    /// Appends snapshots, skipping rows whose `(id, report_date)` is already stored.
    ///
    /// All rows and the `_loads` entry are written in one transaction.
    pub fn append_snapshots(
        &mut self,
        relation: &str,
        target_date: NaiveDate,
        rows: &[CoinSnapshot],
    ) -> Result<LoadInfo, WarehouseError> {
        self.ensure_snapshot_table(relation)?;
        let relation = checked(relation)?.to_string();
        let load_id = Uuid::new_v4().to_string();

        let tx = self.conn.transaction()?;
        let mut inserted = 0usize;
        {
            let mut stmt = tx.prepare(&format!(
                "INSERT OR IGNORE INTO \"{}\" (
                    id, symbol, name, image__thumb, image__small,
                    market_data__current_price__usd, market_data__market_cap__usd,
                    market_data__total_volume__usd,
                    community_data__reddit_average_posts_48h,
                    community_data__reddit_average_comments_48h,
                    community_data__reddit_accounts_active_48h,
                    report_date, _load_id
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                relation
            ))?;

            for row in rows {
                inserted += stmt.execute(params![
                    row.id,
                    row.symbol,
                    row.name,
                    row.image_thumb,
                    row.image_small,
                    row.current_price_usd,
                    row.market_cap_usd,
                    row.total_volume_usd,
                    row.reddit_average_posts_48h,
                    row.reddit_average_comments_48h,
                    row.reddit_accounts_active_48h,
                    row.report_date.format(DATE_FORMAT).to_string(),
                    load_id,
                ])?;
            }
        }

        let skipped = rows.len() - inserted;
        tx.execute(
            "INSERT INTO _loads (load_id, relation, target_date, inserted, skipped, loaded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                load_id,
                relation,
                target_date.format(DATE_FORMAT).to_string(),
                inserted as i64,
                skipped as i64,
                Utc::now().to_rfc3339(),
            ],
        )?;
        tx.commit()?;

        info!(
            relation = %relation,
            load_id = %load_id,
            inserted,
            skipped,
            "Warehouse: snapshots appended"
        );

        Ok(LoadInfo {
            load_id,
            relation,
            target_date,
            inserted,
            skipped,
        })
    }

    /// Takes ownership of the run for `logical_date`.
    ///
    /// A date that already succeeded is not run again unless `force` is set;
    /// a date still marked running is refused, which keeps at most one run
    /// per logical date. Failed runs are re-claimed with an incremented
    /// attempt counter.
    pub fn claim_run(&mut self, logical_date: NaiveDate, force: bool) -> Result<RunClaim, WarehouseError> {
        let key = logical_date.format(DATE_FORMAT).to_string();
        let now = Utc::now().to_rfc3339();
        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let existing: Option<(String, i64)> = tx
            .query_row(
                "SELECT state, attempts FROM _pipeline_runs WHERE logical_date = ?1",
                [&key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let attempt = match existing {
            None => {
                tx.execute(
                    "INSERT INTO _pipeline_runs (logical_date, state, attempts, started_at)
                     VALUES (?1, 'running', 1, ?2)",
                    params![key, now],
                )?;
                1
            }
            Some((state, attempts)) => {
                match RunState::parse(&state)? {
                    RunState::Success if !force => return Ok(RunClaim::AlreadySucceeded),
                    RunState::Running if !force => {
                        return Err(WarehouseError::RunInProgress(logical_date))
                    }
                    _ => {}
                }
                tx.execute(
                    "UPDATE _pipeline_runs
                     SET state = 'running', attempts = attempts + 1, started_at = ?2,
                         finished_at = NULL, message = NULL
                     WHERE logical_date = ?1",
                    params![key, now],
                )?;
                attempts.max(0) as u32 + 1
            }
        };
        tx.commit()?;

        debug!(logical_date = %logical_date, attempt, "Warehouse: run claimed");
        Ok(RunClaim::Claimed { attempt })
    }

    /// Records the final state of a claimed run.
    pub fn finish_run(
        &self,
        logical_date: NaiveDate,
        state: RunState,
        message: Option<&str>,
    ) -> Result<(), WarehouseError> {
        let updated = self.conn.execute(
            "UPDATE _pipeline_runs SET state = ?2, finished_at = ?3, message = ?4
             WHERE logical_date = ?1",
            params![
                logical_date.format(DATE_FORMAT).to_string(),
                state.as_str(),
                Utc::now().to_rfc3339(),
                message,
            ],
        )?;
        if updated == 0 {
            return Err(WarehouseError::Corrupt(format!(
                "no run claimed for {}",
                logical_date
            )));
        }
        Ok(())
    }

    /// Bookkeeping row for a logical date, if any.
    pub fn run_record(&self, logical_date: NaiveDate) -> Result<Option<RunRecord>, WarehouseError> {
        let row: Option<(String, i64, Option<String>)> = self
            .conn
            .query_row(
                "SELECT state, attempts, message FROM _pipeline_runs WHERE logical_date = ?1",
                [logical_date.format(DATE_FORMAT).to_string()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        row.map(|(state, attempts, message)| {
            Ok(RunRecord {
                logical_date,
                state: RunState::parse(&state)?,
                attempts: attempts.max(0) as u32,
                message,
            })
        })
        .transpose()
    }

    /// Logical dates with a successful run.
    pub fn completed_runs(&self) -> Result<BTreeSet<NaiveDate>, WarehouseError> {
        self.runs_in_state(RunState::Success)
    }

    /// Marks every run still recorded as running as failed and returns their dates.
    ///
    /// Only valid while no other process is executing runs against this
    /// warehouse, e.g. when a scheduler starts up after a crash.
    pub fn reclaim_interrupted_runs(&mut self) -> Result<BTreeSet<NaiveDate>, WarehouseError> {
        let interrupted = self.runs_in_state(RunState::Running)?;
        if interrupted.is_empty() {
            return Ok(interrupted);
        }
        self.conn.execute(
            "UPDATE _pipeline_runs SET state = 'failed', finished_at = ?1,
                 message = 'interrupted before completion'
             WHERE state = 'running'",
            [Utc::now().to_rfc3339()],
        )?;
        info!(runs = interrupted.len(), "Warehouse: interrupted runs marked failed");
        Ok(interrupted)
    }

    fn runs_in_state(&self, state: RunState) -> Result<BTreeSet<NaiveDate>, WarehouseError> {
        let mut stmt = self
            .conn
            .prepare("SELECT logical_date FROM _pipeline_runs WHERE state = ?1")?;
        let rows = stmt.query_map([state.as_str()], |row| row.get::<_, String>(0))?;

        let mut dates = BTreeSet::new();
        for row in rows {
            let text = row?;
            let date = NaiveDate::parse_from_str(&text, DATE_FORMAT)
                .map_err(|e| WarehouseError::Corrupt(format!("bad logical_date '{}': {}", text, e)))?;
            dates.insert(date);
        }
        Ok(dates)
    }

    /// Returns a reference to the underlying SQLite connection.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Mutable access for callers that need their own transactions.
    pub fn connection_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }
}

/// Errors raised by the warehouse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WarehouseError {
    /// SQLite reported an error
    Sql(String),
    /// A relation name is not a plain identifier
    InvalidIdentifier(String),
    /// Another run for the same logical date is still marked running
    RunInProgress(NaiveDate),
    /// Stored bookkeeping could not be interpreted
    Corrupt(String),
}

impl std::fmt::Display for WarehouseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WarehouseError::Sql(msg) => write!(f, "SQL error: {}", msg),
            WarehouseError::InvalidIdentifier(name) => write!(f, "Invalid identifier: {}", name),
            WarehouseError::RunInProgress(date) => {
                write!(f, "A run for logical date {} is already in progress", date)
            }
            WarehouseError::Corrupt(msg) => write!(f, "Corrupt bookkeeping: {}", msg),
        }
    }
}

impl std::error::Error for WarehouseError {}

impl From<rusqlite::Error> for WarehouseError {
    fn from(err: rusqlite::Error) -> Self {
        WarehouseError::Sql(err.to_string())
    }
}
