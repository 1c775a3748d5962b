//! CPE mapping storage using SQLite
//!
//! This module is the single source of truth for "already known" versus
//! "must query": every resolution outcome is persisted here, including
//! confirmed absence, so repeated lookups never re-pay the external cost.

use crate::config::MappingConfig;
use anyhow::Result;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

/// How a mapping was produced. Closed set: the orchestrator's transitions
/// and confidence scoring depend on exhaustive handling of all five.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMethod {
    Exact,
    Backoff,
    Llm,
    Manual,
    NotFound,
}

impl MatchMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchMethod::Exact => "exact",
            MatchMethod::Backoff => "backoff",
            MatchMethod::Llm => "llm",
            MatchMethod::Manual => "manual",
            MatchMethod::NotFound => "not_found",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "exact" => Some(MatchMethod::Exact),
            "backoff" => Some(MatchMethod::Backoff),
            "llm" => Some(MatchMethod::Llm),
            "manual" => Some(MatchMethod::Manual),
            "not_found" => Some(MatchMethod::NotFound),
            _ => None,
        }
    }
}

impl ToSql for MatchMethod {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for MatchMethod {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let text = value.as_str()?;
        MatchMethod::parse(text).ok_or(FromSqlError::InvalidType)
    }
}

/// One durable resolution record, keyed by the exact original string as
/// submitted. A NULL `cpe` together with `match_method = not_found` is an
/// authoritative statement that no match exists.
#[derive(Debug, Clone, Serialize)]
pub struct CpeMapping {
    pub id: i64,
    pub original_name: String,
    pub normalized_name: Option<String>,
    pub matched_name: Option<String>,
    pub publisher: Option<String>,
    pub version: Option<String>,
    pub cpe: Option<String>,
    pub vendor: Option<String>,
    pub product: Option<String>,
    pub match_method: MatchMethod,
    pub confidence_score: f64,
    pub date_added: i64,
    pub last_verified: i64,
    pub times_queried: i64,
    pub notes: Option<String>,
}

/// Fields the resolver persists after a pipeline run.
#[derive(Debug, Clone)]
pub struct NewMapping {
    pub original_name: String,
    pub normalized_name: String,
    pub matched_name: Option<String>,
    pub publisher: Option<String>,
    pub version: Option<String>,
    pub cpe: Option<String>,
    pub vendor: Option<String>,
    pub product: Option<String>,
    pub match_method: MatchMethod,
    pub confidence_score: f64,
    pub notes: Option<String>,
}

/// A manual correction entered by an operator.
#[derive(Debug, Clone)]
pub struct ManualEntry {
    pub original_name: String,
    pub normalized_name: String,
    pub publisher: Option<String>,
    pub version: Option<String>,
    pub cpe: String,
    pub vendor: Option<String>,
    pub product: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ManualAction {
    Created,
    Updated,
}

pub struct MappingStore {
    conn: Connection,
    config: MappingConfig,
}

impl MappingStore {
    pub fn new(config: MappingConfig) -> Result<Self> {
        let conn = if config.database_path == Path::new(":memory:") {
            Connection::open_in_memory()?
        } else {
            if let Some(parent) = config.database_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            Connection::open(&config.database_path)?
        };

        let store = Self { conn, config };
        store.initialize_schema()?;

        info!("Initialized mapping store at {:?}", store.config.database_path);
        Ok(store)
    }

    fn initialize_schema(&self) -> Result<()> {
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS cpe_mappings (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                original_name TEXT NOT NULL UNIQUE,
                normalized_name TEXT,
                matched_name TEXT,
                publisher TEXT,
                version TEXT,
                cpe TEXT,
                vendor TEXT,
                product TEXT,
                match_method TEXT NOT NULL,
                confidence_score REAL NOT NULL,
                date_added INTEGER NOT NULL,
                last_verified INTEGER NOT NULL,
                times_queried INTEGER NOT NULL DEFAULT 1,
                notes TEXT
            )",
            [],
        )?;

        self.conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_original_name
             ON cpe_mappings(original_name)",
            [],
        )?;

        self.conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_match_method
             ON cpe_mappings(match_method)",
            [],
        )?;

        debug!("Database schema initialized");
        Ok(())
    }

    /// Look up a record and count the access. The increment is a single
    /// UPDATE statement so concurrent hits on the same key never lose a
    /// count. Returns the record as it stands after the bump.
    pub fn touch(&mut self, original_name: &str) -> Result<Option<CpeMapping>> {
        let updated = self.conn.execute(
            "UPDATE cpe_mappings
             SET times_queried = times_queried + 1, last_verified = ?1
             WHERE original_name = ?2",
            params![now_secs(), original_name],
        )?;

        if updated == 0 {
            debug!("Cache miss for '{}'", original_name);
            return Ok(None);
        }

        let mapping = self.get(original_name)?;
        if let Some(ref m) = mapping {
            debug!(
                "Cache hit for '{}' ({}; queried {} times)",
                original_name,
                m.match_method.as_str(),
                m.times_queried
            );
        }
        Ok(mapping)
    }

    /// Plain point lookup without counting the access.
    pub fn get(&self, original_name: &str) -> Result<Option<CpeMapping>> {
        let mapping = self
            .conn
            .query_row(
                &format!("SELECT {MAPPING_COLUMNS} FROM cpe_mappings WHERE original_name = ?1"),
                params![original_name],
                map_row,
            )
            .optional()?;

        Ok(mapping)
    }

    /// Persist a resolution outcome. Upserts on `original_name` so two
    /// concurrent resolutions of the same new string settle on one record,
    /// but never overwrites a manual entry and never resets `date_added`.
    pub fn record_resolution(&mut self, mapping: &NewMapping) -> Result<()> {
        let now = now_secs();

        self.conn.execute(
            "INSERT INTO cpe_mappings
             (original_name, normalized_name, matched_name, publisher, version,
              cpe, vendor, product, match_method, confidence_score,
              date_added, last_verified, times_queried, notes)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11, 1, ?12)
             ON CONFLICT(original_name) DO UPDATE SET
                 normalized_name = excluded.normalized_name,
                 matched_name = excluded.matched_name,
                 publisher = excluded.publisher,
                 version = excluded.version,
                 cpe = excluded.cpe,
                 vendor = excluded.vendor,
                 product = excluded.product,
                 match_method = excluded.match_method,
                 confidence_score = excluded.confidence_score,
                 last_verified = excluded.last_verified,
                 notes = excluded.notes
             WHERE cpe_mappings.match_method <> 'manual'",
            params![
                mapping.original_name,
                mapping.normalized_name,
                mapping.matched_name,
                mapping.publisher,
                mapping.version,
                mapping.cpe,
                mapping.vendor,
                mapping.product,
                mapping.match_method,
                mapping.confidence_score,
                now,
                mapping.notes,
            ],
        )?;

        debug!(
            "Recorded resolution for '{}': {} (confidence {:.2})",
            mapping.original_name,
            mapping.match_method.as_str(),
            mapping.confidence_score
        );
        Ok(())
    }

    /// Insert or overwrite a mapping with an operator-supplied CPE. Manual
    /// entries take precedence over any prior automated record and are never
    /// re-queried by the pipeline.
    pub fn upsert_manual(&mut self, entry: &ManualEntry) -> Result<ManualAction> {
        let now = now_secs();

        let existing: Option<i64> = self
            .conn
            .query_row(
                "SELECT id FROM cpe_mappings WHERE original_name = ?1",
                params![entry.original_name],
                |row| row.get(0),
            )
            .optional()?;

        let action = if existing.is_some() {
            self.conn.execute(
                "UPDATE cpe_mappings
                 SET cpe = ?1, vendor = ?2, product = ?3,
                     match_method = 'manual', confidence_score = 1.0,
                     last_verified = ?4, notes = ?5, publisher = ?6, version = ?7
                 WHERE original_name = ?8",
                params![
                    entry.cpe,
                    entry.vendor,
                    entry.product,
                    now,
                    entry.notes,
                    entry.publisher,
                    entry.version,
                    entry.original_name,
                ],
            )?;
            ManualAction::Updated
        } else {
            self.conn.execute(
                "INSERT INTO cpe_mappings
                 (original_name, normalized_name, matched_name, publisher, version,
                  cpe, vendor, product, match_method, confidence_score,
                  date_added, last_verified, times_queried, notes)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'manual', 1.0, ?9, ?9, 1, ?10)",
                params![
                    entry.original_name,
                    entry.normalized_name,
                    entry.original_name,
                    entry.publisher,
                    entry.version,
                    entry.cpe,
                    entry.vendor,
                    entry.product,
                    now,
                    entry.notes,
                ],
            )?;
            ManualAction::Created
        };

        info!(
            "Manual mapping {} for '{}': {}",
            match action {
                ManualAction::Created => "created",
                ManualAction::Updated => "updated",
            },
            entry.original_name,
            entry.cpe
        );
        Ok(action)
    }

    /// Substring search across original names and CPEs, most-queried first.
    pub fn search(&self, query: &str) -> Result<Vec<CpeMapping>> {
        let pattern = format!("%{}%", query);

        let mut stmt = self.conn.prepare(&format!(
            "SELECT {MAPPING_COLUMNS} FROM cpe_mappings
             WHERE original_name LIKE ?1 OR cpe LIKE ?1
             ORDER BY times_queried DESC
             LIMIT 50"
        ))?;

        let rows = stmt.query_map(params![pattern], map_row)?;
        let mut mappings = Vec::new();
        for row in rows {
            mappings.push(row?);
        }

        debug!("Search '{}' matched {} mappings", query, mappings.len());
        Ok(mappings)
    }

    pub fn statistics(&self) -> Result<MappingStatistics> {
        let total_mappings: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM cpe_mappings", [], |row| row.get(0))?;

        let found: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM cpe_mappings WHERE cpe IS NOT NULL",
            [],
            |row| row.get(0),
        )?;

        let mut by_method = HashMap::new();
        let mut stmt = self
            .conn
            .prepare("SELECT match_method, COUNT(*) FROM cpe_mappings GROUP BY match_method")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (method, count) = row?;
            by_method.insert(method, count as usize);
        }

        let mut stmt = self.conn.prepare(
            "SELECT original_name, cpe, times_queried FROM cpe_mappings
             WHERE cpe IS NOT NULL
             ORDER BY times_queried DESC
             LIMIT 10",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(MostQueried {
                original_name: row.get(0)?,
                cpe: row.get(1)?,
                times_queried: row.get(2)?,
            })
        })?;
        let mut most_queried = Vec::new();
        for row in rows {
            most_queried.push(row?);
        }

        let total = total_mappings as usize;
        let found = found as usize;
        let success_rate = if total > 0 {
            (found as f64 / total as f64) * 100.0
        } else {
            0.0
        };

        Ok(MappingStatistics {
            total_mappings: total,
            found,
            not_found: total - found,
            success_rate,
            by_method,
            most_queried,
        })
    }
}

#[derive(Debug, Serialize)]
pub struct MappingStatistics {
    pub total_mappings: usize,
    pub found: usize,
    pub not_found: usize,
    pub success_rate: f64,
    pub by_method: HashMap<String, usize>,
    pub most_queried: Vec<MostQueried>,
}

#[derive(Debug, Serialize)]
pub struct MostQueried {
    pub original_name: String,
    pub cpe: Option<String>,
    pub times_queried: i64,
}

const MAPPING_COLUMNS: &str = "id, original_name, normalized_name, matched_name, publisher, \
     version, cpe, vendor, product, match_method, confidence_score, \
     date_added, last_verified, times_queried, notes";

fn map_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CpeMapping> {
    Ok(CpeMapping {
        id: row.get(0)?,
        original_name: row.get(1)?,
        normalized_name: row.get(2)?,
        matched_name: row.get(3)?,
        publisher: row.get(4)?,
        version: row.get(5)?,
        cpe: row.get(6)?,
        vendor: row.get(7)?,
        product: row.get(8)?,
        match_method: row.get(9)?,
        confidence_score: row.get(10)?,
        date_added: row.get(11)?,
        last_verified: row.get(12)?,
        times_queried: row.get(13)?,
        notes: row.get(14)?,
    })
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
