use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use async_trait::async_trait;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use crate::collection::normalize_name;
use crate::error::{Error, Result};
use crate::history::{CollectionRunRecord, RunHistory, RunOutcome};
use crate::staging::{Chronology, NewStagingRow, StagingKey, StagingStore, StagingTemporalRecord, Watermark};
use crate::types::ids::{CycleId, RunId};
use crate::types::line::{LineValue, Quote};
use crate::types::timestamp::Timestamp;

const STAGING_COLUMNS: &str = "row_id, source, external_entity_id, market_type, side, price, line_value, \
     valid_from, collection_seq, is_current, raw_payload_ref, ingested_at";

const RUN_COLUMNS: &str = "run_id, cycle_id, source, started_at, finished_at, outcome, \
     records_collected, error_summary";

/// SQLite-backed staging table and run-history log.
///
/// One connection behind a mutex; every call runs on the blocking pool. The partial
/// unique index on `is_current = 1` makes a second current row per key impossible even
/// for writers outside this process.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::init_schema(&conn)?;
        tracing::info!(path = %path.display(), "Opened SQLite store");
        Ok(SqliteStore { conn: Arc::new(Mutex::new(conn)) })
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(SqliteStore { conn: Arc::new(Mutex::new(conn)) })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;

            -- Temporal line history (insert-only apart from the is_current flip)
            CREATE TABLE IF NOT EXISTS staging_lines (
                row_id INTEGER PRIMARY KEY AUTOINCREMENT,
                source TEXT NOT NULL,
                external_entity_id TEXT NOT NULL,
                market_type TEXT NOT NULL,
                side TEXT NOT NULL,
                price INTEGER,
                line_value INTEGER,
                valid_from INTEGER NOT NULL,
                collection_seq INTEGER NOT NULL,
                is_current INTEGER NOT NULL,
                raw_payload_ref TEXT,
                ingested_at INTEGER NOT NULL
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_staging_lines_current
                ON staging_lines(source, external_entity_id, market_type, side)
                WHERE is_current = 1;
            CREATE INDEX IF NOT EXISTS idx_staging_lines_key
                ON staging_lines(source, external_entity_id, market_type, side, valid_from);

            -- Furthest position seen per key, including re-collections that wrote no row
            CREATE TABLE IF NOT EXISTS staging_watermarks (
                source TEXT NOT NULL,
                external_entity_id TEXT NOT NULL,
                market_type TEXT NOT NULL,
                side TEXT NOT NULL,
                valid_from INTEGER NOT NULL,
                collection_seq INTEGER NOT NULL,
                price INTEGER,
                line_value INTEGER,
                raw_payload_ref TEXT,
                PRIMARY KEY (source, external_entity_id, market_type, side)
            );

            -- Append-only collection run log
            CREATE TABLE IF NOT EXISTS collection_runs (
                run_id TEXT PRIMARY KEY,
                cycle_id TEXT NOT NULL,
                source TEXT NOT NULL,
                started_at INTEGER NOT NULL,
                finished_at INTEGER NOT NULL,
                outcome TEXT NOT NULL,
                records_collected INTEGER NOT NULL,
                error_summary TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_collection_runs_finished
                ON collection_runs(source, finished_at);
            "#,
        )?;
        Ok(())
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().unwrap_or_else(PoisonError::into_inner);
            f(&mut conn)
        })
        .await
        .map_err(|e| Error::TaskFailed(format!("sqlite worker: {}", e)))?
    }
}

fn conversion_error(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, message.into())
}

fn staging_from_row(row: &Row<'_>) -> rusqlite::Result<StagingTemporalRecord> {
    Ok(StagingTemporalRecord {
        row_id: row.get::<_, i64>(0)? as u64,
        key: StagingKey {
            source: row.get(1)?,
            external_entity_id: row.get(2)?,
            market_type: row.get(3)?,
            side: row.get(4)?,
        },
        value: LineValue::new(
            row.get::<_, Option<i64>>(5)?.map(Quote::from_raw),
            row.get::<_, Option<i64>>(6)?.map(Quote::from_raw),
        ),
        valid_from: Timestamp::from_micros(row.get(7)?),
        collection_seq: row.get::<_, i64>(8)? as u64,
        is_current: row.get(9)?,
        raw_payload_ref: row.get(10)?,
        ingested_at: Timestamp::from_micros(row.get(11)?),
    })
}

fn watermark_from_row(row: &Row<'_>) -> rusqlite::Result<Watermark> {
    Ok(Watermark {
        position: Chronology {
            valid_from: Timestamp::from_micros(row.get(0)?),
            collection_seq: row.get::<_, i64>(1)? as u64,
            value: LineValue::new(
                row.get::<_, Option<i64>>(2)?.map(Quote::from_raw),
                row.get::<_, Option<i64>>(3)?.map(Quote::from_raw),
            ),
        },
        raw_payload_ref: row.get(4)?,
    })
}

fn select_watermark(conn: &Connection, key: &StagingKey) -> Result<Option<Watermark>> {
    let watermark = conn
        .query_row(
            "SELECT valid_from, collection_seq, price, line_value, raw_payload_ref FROM staging_watermarks
             WHERE source = ?1 AND external_entity_id = ?2 AND market_type = ?3 AND side = ?4",
            params![key.source, key.external_entity_id, key.market_type, key.side],
            watermark_from_row,
        )
        .optional()?;
    Ok(watermark)
}

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<CollectionRunRecord> {
    let run_id: String = row.get(0)?;
    let cycle_id: String = row.get(1)?;
    let outcome: String = row.get(5)?;
    Ok(CollectionRunRecord {
        run_id: RunId::from_string(&run_id).map_err(|e| conversion_error(0, e.to_string()))?,
        cycle_id: CycleId::from_string(&cycle_id).map_err(|e| conversion_error(1, e.to_string()))?,
        source: row.get(2)?,
        started_at: Timestamp::from_micros(row.get(3)?),
        finished_at: Timestamp::from_micros(row.get(4)?),
        outcome: RunOutcome::parse(&outcome)
            .ok_or_else(|| conversion_error(5, format!("unknown outcome {}", outcome)))?,
        records_collected: row.get::<_, i64>(6)? as u64,
        error_summary: row.get(7)?,
    })
}

fn insert_staging(conn: &Connection, row: &NewStagingRow) -> Result<StagingTemporalRecord> {
    let ingested_at = Timestamp::now();
    conn.execute(
        "INSERT INTO staging_lines (
            source, external_entity_id, market_type, side, price, line_value,
            valid_from, collection_seq, is_current, raw_payload_ref, ingested_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            &row.key.source,
            &row.key.external_entity_id,
            &row.key.market_type,
            &row.key.side,
            row.value.price.map(|q| q.raw_value()),
            row.value.line.map(|q| q.raw_value()),
            row.valid_from.as_micros(),
            row.collection_seq as i64,
            row.is_current,
            &row.raw_payload_ref,
            ingested_at.as_micros(),
        ],
    )?;
    Ok(StagingTemporalRecord {
        row_id: conn.last_insert_rowid() as u64,
        key: row.key.clone(),
        value: row.value,
        valid_from: row.valid_from,
        collection_seq: row.collection_seq,
        is_current: row.is_current,
        raw_payload_ref: row.raw_payload_ref.clone(),
        ingested_at,
    })
}

#[async_trait]
impl StagingStore for SqliteStore {
    async fn current(&self, key: &StagingKey) -> Result<Option<StagingTemporalRecord>> {
        let key = key.clone();
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {} FROM staging_lines
                 WHERE source = ?1 AND external_entity_id = ?2 AND market_type = ?3 AND side = ?4
                   AND is_current = 1",
                STAGING_COLUMNS
            );
            let record = conn
                .query_row(&sql, params![key.source, key.external_entity_id, key.market_type, key.side], staging_from_row)
                .optional()?;
            Ok(record)
        })
        .await
    }

    async fn history(&self, key: &StagingKey) -> Result<Vec<StagingTemporalRecord>> {
        let key = key.clone();
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {} FROM staging_lines
                 WHERE source = ?1 AND external_entity_id = ?2 AND market_type = ?3 AND side = ?4",
                STAGING_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt
                .query_map(params![key.source, key.external_entity_id, key.market_type, key.side], staging_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.sort_by_key(|r| r.chronology());
            Ok(rows)
        })
        .await
    }

    async fn insert(&self, row: NewStagingRow) -> Result<StagingTemporalRecord> {
        self.with_conn(move |conn| insert_staging(conn, &row)).await
    }

    async fn supersede(&self, current_row_id: u64, row: NewStagingRow) -> Result<StagingTemporalRecord> {
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let flipped = tx.execute(
                "UPDATE staging_lines SET is_current = 0
                 WHERE row_id = ?1 AND is_current = 1
                   AND source = ?2 AND external_entity_id = ?3 AND market_type = ?4 AND side = ?5",
                params![
                    current_row_id as i64,
                    &row.key.source,
                    &row.key.external_entity_id,
                    &row.key.market_type,
                    &row.key.side,
                ],
            )?;
            if flipped != 1 {
                // Dropping the transaction rolls back
                return Err(Error::StaleCurrentRow { row_id: current_row_id });
            }
            let record = insert_staging(&tx, &NewStagingRow { is_current: true, ..row })?;
            tx.commit()?;
            Ok(record)
        })
        .await
    }

    async fn current_rows(&self, source: &str) -> Result<Vec<StagingTemporalRecord>> {
        let source = normalize_name(source);
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {} FROM staging_lines WHERE source = ?1 AND is_current = 1 ORDER BY row_id",
                STAGING_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params![source], staging_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }

    async fn dead_row_estimate(&self, source: &str) -> Result<u64> {
        let source = normalize_name(source);
        self.with_conn(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM staging_lines s
                 WHERE s.source = ?1 AND NOT EXISTS (
                     SELECT 1 FROM staging_lines c
                     WHERE c.is_current = 1 AND c.source = s.source
                       AND c.external_entity_id = s.external_entity_id
                       AND c.market_type = s.market_type AND c.side = s.side
                 )",
                params![source],
                |row| row.get(0),
            )?;
            Ok(count as u64)
        })
        .await
    }

    async fn watermark(&self, key: &StagingKey) -> Result<Option<Watermark>> {
        let key = key.clone();
        self.with_conn(move |conn| select_watermark(conn, &key)).await
    }

    async fn advance_watermark(&self, key: &StagingKey, watermark: Watermark) -> Result<()> {
        let key = key.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            if select_watermark(&tx, &key)?.is_some_and(|stored| stored.position >= watermark.position) {
                return Ok(());
            }
            let position = watermark.position;
            tx.execute(
                "INSERT INTO staging_watermarks (
                    source, external_entity_id, market_type, side,
                    valid_from, collection_seq, price, line_value, raw_payload_ref
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                ON CONFLICT (source, external_entity_id, market_type, side) DO UPDATE SET
                    valid_from = excluded.valid_from,
                    collection_seq = excluded.collection_seq,
                    price = excluded.price,
                    line_value = excluded.line_value,
                    raw_payload_ref = excluded.raw_payload_ref",
                params![
                    &key.source,
                    &key.external_entity_id,
                    &key.market_type,
                    &key.side,
                    position.valid_from.as_micros(),
                    position.collection_seq as i64,
                    position.value.price.map(|q| q.raw_value()),
                    position.value.line.map(|q| q.raw_value()),
                    &watermark.raw_payload_ref,
                ],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl RunHistory for SqliteStore {
    async fn append(&self, record: CollectionRunRecord) -> Result<()> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO collection_runs (
                    run_id, cycle_id, source, started_at, finished_at, outcome,
                    records_collected, error_summary
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    record.run_id.to_string(),
                    record.cycle_id.to_string(),
                    &record.source,
                    record.started_at.as_micros(),
                    record.finished_at.as_micros(),
                    record.outcome.as_str(),
                    record.records_collected as i64,
                    &record.error_summary,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn query(&self, source: &str, from: Timestamp, to: Timestamp) -> Result<Vec<CollectionRunRecord>> {
        let source = normalize_name(source);
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {} FROM collection_runs
                 WHERE source = ?1 AND finished_at >= ?2 AND finished_at <= ?3
                 ORDER BY finished_at, started_at",
                RUN_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let runs = stmt
                .query_map(params![source, from.as_micros(), to.as_micros()], run_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(runs)
        })
        .await
    }

    async fn last_success(&self, source: &str) -> Result<Option<CollectionRunRecord>> {
        let source = normalize_name(source);
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {} FROM collection_runs
                 WHERE source = ?1 AND outcome = ?2
                 ORDER BY finished_at DESC LIMIT 1",
                RUN_COLUMNS
            );
            let run = conn
                .query_row(&sql, params![source, RunOutcome::Success.as_str()], run_from_row)
                .optional()?;
            Ok(run)
        })
        .await
    }
}
