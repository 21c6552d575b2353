//! SQLite-backed step and run storage.

use crewtrace_core::{Run, SpanType, Status, Step, TokenUsage};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Deserialize;
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;

/// Errors from step store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("Lock error")]
    Lock,
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Filter and paging for run listings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RunQuery {
    pub status: Option<Status>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

const STEP_COLUMNS: &str = "id, run_id, agent_name, parent_ref, status, start_time, end_time, \
     duration_ms, prompt, output, error_message, input_tokens, output_tokens, total_tokens, \
     cost_usd, claimed_actions, actual_actions, span_type, metadata, hallucination_flags, \
     sequence, updated_at, created_at";

const RUN_COLUMNS: &str = "id, status, num_steps, num_success, num_failed, num_running, \
     duration, cost, total_tokens, integrity_score, created_at, revision";

/// SQLite-backed step storage. Steps and runs are never deleted.
pub struct StepStore {
    conn: Mutex<Connection>,
}

impl StepStore {
    /// Opens (or creates) the database at `path`.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Creates an in-memory store (for testing).
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Lock)?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS runs (
                id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                num_steps INTEGER NOT NULL,
                num_success INTEGER NOT NULL,
                num_failed INTEGER NOT NULL,
                num_running INTEGER NOT NULL,
                duration INTEGER NOT NULL,
                cost REAL NOT NULL,
                total_tokens INTEGER NOT NULL,
                integrity_score REAL NOT NULL,
                created_at INTEGER NOT NULL,
                revision INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS steps (
                id TEXT PRIMARY KEY,
                run_id TEXT NOT NULL,
                agent_name TEXT NOT NULL,
                parent_ref TEXT,
                status TEXT NOT NULL,
                start_time INTEGER,
                end_time INTEGER,
                duration_ms INTEGER NOT NULL,
                prompt TEXT NOT NULL,
                output TEXT NOT NULL,
                error_message TEXT,
                input_tokens INTEGER NOT NULL,
                output_tokens INTEGER NOT NULL,
                total_tokens INTEGER NOT NULL,
                cost_usd REAL NOT NULL,
                claimed_actions TEXT NOT NULL,
                actual_actions TEXT NOT NULL,
                span_type TEXT NOT NULL,
                metadata TEXT NOT NULL,
                hallucination_flags TEXT NOT NULL,
                sequence INTEGER,
                updated_at INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                FOREIGN KEY (run_id) REFERENCES runs(id)
            );

            CREATE INDEX IF NOT EXISTS idx_runs_created ON runs(created_at DESC);
            CREATE INDEX IF NOT EXISTS idx_steps_run ON steps(run_id);
            CREATE INDEX IF NOT EXISTS idx_steps_run_agent ON steps(run_id, agent_name);
            "#,
        )?;

        Ok(())
    }

    /// Retrieves a step by id.
    pub fn get_step(&self, id: &str) -> Result<Option<Step>, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Lock)?;
        let sql = format!("SELECT {STEP_COLUMNS} FROM steps WHERE id = ?1");
        let step = conn.query_row(&sql, params![id], step_from_row).optional()?;
        Ok(step)
    }

    /// Steps of a run with the given agent name, most recently started first.
    pub fn find_steps_by_name(&self, run_id: &str, agent_name: &str) -> Result<Vec<Step>, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Lock)?;
        let sql = format!(
            "SELECT {STEP_COLUMNS} FROM steps WHERE run_id = ?1 AND agent_name = ?2 \
             ORDER BY COALESCE(start_time, created_at) DESC, created_at DESC, id DESC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![run_id, agent_name], step_from_row)?;

        let mut steps = Vec::new();
        for row in rows {
            steps.push(row?);
        }
        Ok(steps)
    }

    /// All steps of a run ordered by effective start time, then id.
    pub fn list_steps(&self, run_id: &str) -> Result<Vec<Step>, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Lock)?;
        let sql = format!(
            "SELECT {STEP_COLUMNS} FROM steps WHERE run_id = ?1 \
             ORDER BY COALESCE(start_time, created_at), id"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![run_id], step_from_row)?;

        let mut steps = Vec::new();
        for row in rows {
            steps.push(row?);
        }
        Ok(steps)
    }

    /// Writes a step and its run aggregate in one transaction.
    pub fn save(&self, step: &Step, run: &Run) -> Result<(), StoreError> {
        let claimed = serde_json::to_string(&step.claimed_actions)?;
        let actual = serde_json::to_string(&step.actual_actions)?;
        let metadata = serde_json::to_string(&step.metadata)?;
        let flags = serde_json::to_string(&step.hallucination_flags)?;

        let mut conn = self.conn.lock().map_err(|_| StoreError::Lock)?;
        let tx = conn.transaction()?;
        write_run(&tx, run)?;
        tx.execute(
            r#"INSERT INTO steps
               (id, run_id, agent_name, parent_ref, status, start_time, end_time,
                duration_ms, prompt, output, error_message, input_tokens, output_tokens,
                total_tokens, cost_usd, claimed_actions, actual_actions, span_type,
                metadata, hallucination_flags, sequence, updated_at, created_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
                       ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23)
               ON CONFLICT(id) DO UPDATE SET
                agent_name = excluded.agent_name, parent_ref = excluded.parent_ref,
                status = excluded.status, start_time = excluded.start_time,
                end_time = excluded.end_time, duration_ms = excluded.duration_ms,
                prompt = excluded.prompt, output = excluded.output,
                error_message = excluded.error_message, input_tokens = excluded.input_tokens,
                output_tokens = excluded.output_tokens, total_tokens = excluded.total_tokens,
                cost_usd = excluded.cost_usd, claimed_actions = excluded.claimed_actions,
                actual_actions = excluded.actual_actions, span_type = excluded.span_type,
                metadata = excluded.metadata, hallucination_flags = excluded.hallucination_flags,
                sequence = excluded.sequence, updated_at = excluded.updated_at"#,
            params![
                step.id,
                step.run_id,
                step.agent_name,
                step.parent_ref,
                step.status.as_str(),
                step.start_time,
                step.end_time,
                capped(step.duration_ms),
                step.prompt,
                step.output,
                step.error_message,
                capped(step.tokens.input),
                capped(step.tokens.output),
                capped(step.tokens.total),
                step.cost_usd,
                claimed,
                actual,
                step.span_type.as_str(),
                metadata,
                flags,
                step.sequence,
                step.updated_at,
                step.created_at,
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Retrieves a run by id.
    pub fn get_run(&self, id: &str) -> Result<Option<Run>, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Lock)?;
        let sql = format!("SELECT {RUN_COLUMNS} FROM runs WHERE id = ?1");
        let run = conn.query_row(&sql, params![id], run_from_row).optional()?;
        Ok(run)
    }

    /// Inserts or replaces a run aggregate.
    pub fn upsert_run(&self, run: &Run) -> Result<(), StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Lock)?;
        write_run(&conn, run)?;
        Ok(())
    }

    /// Lists runs newest first with optional status filter and paging.
    pub fn list_runs(&self, query: &RunQuery) -> Result<Vec<Run>, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Lock)?;

        let mut sql = format!("SELECT {RUN_COLUMNS} FROM runs WHERE 1=1");
        let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(status) = query.status {
            sql.push_str(" AND status = ?");
            params_vec.push(Box::new(status.as_str().to_string()));
        }

        sql.push_str(" ORDER BY created_at DESC, id DESC");

        match (query.limit, query.offset) {
            (Some(limit), offset) => sql.push_str(&format!(" LIMIT {} OFFSET {}", limit, offset.unwrap_or(0))),
            (None, Some(offset)) => sql.push_str(&format!(" LIMIT -1 OFFSET {}", offset)),
            (None, None) => {}
        }

        let mut stmt = conn.prepare(&sql)?;
        let params_refs: Vec<&dyn rusqlite::ToSql> = params_vec.iter().map(|p| p.as_ref()).collect();
        let rows = stmt.query_map(params_refs.as_slice(), run_from_row)?;

        let mut runs = Vec::new();
        for row in rows {
            runs.push(row?);
        }
        Ok(runs)
    }
}

/// SQLite integers are signed 64-bit.
fn capped(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

fn write_run(conn: &Connection, run: &Run) -> Result<(), rusqlite::Error> {
    conn.execute(
        r#"INSERT INTO runs
           (id, status, num_steps, num_success, num_failed, num_running,
            duration, cost, total_tokens, integrity_score, created_at, revision)
           VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
           ON CONFLICT(id) DO UPDATE SET
            status = excluded.status, num_steps = excluded.num_steps,
            num_success = excluded.num_success, num_failed = excluded.num_failed,
            num_running = excluded.num_running, duration = excluded.duration,
            cost = excluded.cost, total_tokens = excluded.total_tokens,
            integrity_score = excluded.integrity_score, revision = excluded.revision"#,
        params![
            run.id,
            run.status.as_str(),
            run.num_steps,
            run.num_success,
            run.num_failed,
            run.num_running,
            capped(run.duration),
            run.cost,
            capped(run.total_tokens),
            run.integrity_score,
            run.created_at,
            run.revision,
        ],
    )?;
    Ok(())
}

fn conversion_error<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn json_column<T: serde::de::DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conversion_error(idx, e))
}

fn step_from_row(row: &Row<'_>) -> rusqlite::Result<Step> {
    let status: Status = row
        .get::<_, String>(4)?
        .parse()
        .map_err(|e| conversion_error(4, e))?;
    let span_type: SpanType = row
        .get::<_, String>(17)?
        .parse()
        .map_err(|e| conversion_error(17, e))?;

    Ok(Step {
        id: row.get(0)?,
        run_id: row.get(1)?,
        agent_name: row.get(2)?,
        parent_ref: row.get(3)?,
        status,
        start_time: row.get(5)?,
        end_time: row.get(6)?,
        duration_ms: row.get(7)?,
        prompt: row.get(8)?,
        output: row.get(9)?,
        error_message: row.get(10)?,
        tokens: TokenUsage {
            input: row.get(11)?,
            output: row.get(12)?,
            total: row.get(13)?,
        },
        cost_usd: row.get(14)?,
        claimed_actions: json_column(row, 15)?,
        actual_actions: json_column(row, 16)?,
        span_type,
        metadata: json_column(row, 18)?,
        hallucination_flags: json_column(row, 19)?,
        sequence: row.get(20)?,
        updated_at: row.get(21)?,
        created_at: row.get(22)?,
    })
}

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<Run> {
    let status: Status = row
        .get::<_, String>(1)?
        .parse()
        .map_err(|e| conversion_error(1, e))?;

    Ok(Run {
        id: row.get(0)?,
        status,
        num_steps: row.get(2)?,
        num_success: row.get(3)?,
        num_failed: row.get(4)?,
        num_running: row.get(5)?,
        duration: row.get(6)?,
        cost: row.get(7)?,
        total_tokens: row.get(8)?,
        integrity_score: row.get(9)?,
        created_at: row.get(10)?,
        revision: row.get(11)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn step(id: &str, run_id: &str, name: &str, start: i64) -> Step {
        let mut s = Step::new(id, run_id, name);
        s.start_time = Some(start);
        s.created_at = start;
        s
    }

    #[test]
    fn test_step_round_trip() {
        let store = StepStore::in_memory().unwrap();
        let mut s = step("s1", "run-1", "writer", 1_700_000_000_000);
        s.status = Status::Success;
        s.span_type = SpanType::LlmCall;
        s.tokens = TokenUsage::new(12, 30);
        s.cost_usd = 0.25;
        s.claimed_actions = vec!["search".into()];
        s.metadata.insert("model".into(), json!("gpt-4o"));
        s.error_message = Some("none".into());
        s.hallucination_flags = vec!["CLAIMED_WITHOUT_ACTION".into()];
        s.sequence = Some(4);
        s.updated_at = s.created_at + 5;

        store.save(&s, &Run::new("run-1", s.created_at)).unwrap();

        assert_eq!(store.get_step("s1").unwrap(), Some(s));
        assert!(store.get_step("missing").unwrap().is_none());
    }

    #[test]
    fn test_save_updates_existing_step() {
        let store = StepStore::in_memory().unwrap();
        let run = Run::new("run-1", 0);
        let mut s = step("s1", "run-1", "writer", 10);
        store.save(&s, &run).unwrap();

        s.status = Status::Error;
        s.output = "boom".into();
        store.save(&s, &run).unwrap();

        let stored = store.get_step("s1").unwrap().unwrap();
        assert_eq!(stored.status, Status::Error);
        assert_eq!(stored.output, "boom");
        assert_eq!(store.list_steps("run-1").unwrap().len(), 1);
    }

    #[test]
    fn test_find_by_name_latest_first() {
        let store = StepStore::in_memory().unwrap();
        let run = Run::new("run-1", 0);
        store.save(&step("a", "run-1", "writer", 10), &run).unwrap();
        store.save(&step("b", "run-1", "writer", 30), &run).unwrap();
        store.save(&step("c", "run-1", "editor", 20), &run).unwrap();
        store.save(&step("d", "run-2", "writer", 40), &Run::new("run-2", 0)).unwrap();

        let ids: Vec<_> = store
            .find_steps_by_name("run-1", "writer")
            .unwrap()
            .into_iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(ids, vec!["b", "a"]);

        let ordered: Vec<_> = store.list_steps("run-1").unwrap().into_iter().map(|s| s.id).collect();
        assert_eq!(ordered, vec!["a", "c", "b"]);
    }

    #[test]
    fn test_list_runs_filters_and_pages() {
        let store = StepStore::in_memory().unwrap();
        for (i, status) in [Status::Success, Status::Error, Status::Success].into_iter().enumerate() {
            let mut run = Run::new(format!("run-{i}"), i as i64);
            run.status = status;
            store.upsert_run(&run).unwrap();
        }

        let all = store.list_runs(&RunQuery::default()).unwrap();
        let ids: Vec<_> = all.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["run-2", "run-1", "run-0"]);

        let ok = store
            .list_runs(&RunQuery {
                status: Some(Status::Success),
                ..RunQuery::default()
            })
            .unwrap();
        assert_eq!(ok.len(), 2);

        let page = store
            .list_runs(&RunQuery {
                limit: Some(1),
                offset: Some(1),
                ..RunQuery::default()
            })
            .unwrap();
        assert_eq!(page[0].id, "run-1");
    }

    #[test]
    fn test_run_totals_beyond_sqlite_range_are_capped() {
        let store = StepStore::in_memory().unwrap();
        let mut s = step("s1", "run-1", "writer", 10);
        s.tokens = TokenUsage::new(u64::MAX / 2, u64::MAX / 2);
        let mut run = Run::new("run-1", 0);
        run.total_tokens = u64::MAX;
        run.integrity_score = 0.75;
        store.save(&s, &run).unwrap();

        assert_eq!(store.get_step("s1").unwrap().unwrap().tokens.total, i64::MAX as u64);
        let stored = store.get_run("run-1").unwrap().unwrap();
        assert_eq!(stored.total_tokens, i64::MAX as u64);
        assert_eq!(stored.integrity_score, 0.75);
    }
}
