pub mod annotate;
pub mod dice;
pub mod sanitize;

pub use annotate::{annotate, glossary_from_value, reading_time};
pub use dice::{DiceError, DicePool};

use anyhow::Context;
use chronicle_protocol::GlossaryTerm;
use rusqlite::{Connection, OpenFlags, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

static ID_COUNTER: AtomicU64 = AtomicU64::new(1);

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
        .try_into()
        .unwrap_or(i64::MAX)
}

fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_default()
}

fn new_id(prefix: &str) -> String {
    let c = ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}-{}-{c}", now_ms())
}

/// Handle to the chronicle database. Cheap to clone; every call opens its own connection.
#[derive(Debug, Clone)]
pub struct Engine {
    db_path: PathBuf,
}

impl Engine {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
        }
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn open(&self) -> anyhow::Result<Connection> {
        let path = self.db_path.clone();
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("create db dir: {}", dir.display()))?;
        }

        let conn = Connection::open_with_flags(
            &path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_context(|| format!("open sqlite db: {}", path.display()))?;

        // Durable + fast defaults.
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        migrate(&conn)?;
        Ok(conn)
    }

    pub fn list_glossary(&self) -> anyhow::Result<Vec<StoredTerm>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT id, term, definition, image, created_at, updated_at, rev
             FROM glossary ORDER BY term COLLATE NOCASE, id",
        )?;
        let rows = stmt.query_map([], StoredTerm::from_row)?;
        Ok(rows.filter_map(Result::ok).collect())
    }

    /// Glossary entries in the shape the annotation pipeline consumes.
    pub fn glossary(&self) -> anyhow::Result<Vec<GlossaryTerm>> {
        Ok(self
            .list_glossary()?
            .into_iter()
            .map(StoredTerm::into_term)
            .collect())
    }

    /// Insert a term, or replace the definition of an existing one (matched case-insensitively).
    pub fn upsert_term(
        &self,
        term: &str,
        definition: &str,
        image: Option<&str>,
    ) -> anyhow::Result<StoredTerm> {
        let term = term.trim();
        anyhow::ensure!(!term.is_empty(), "glossary term must not be blank");
        let image = image.map(str::trim).filter(|s| !s.is_empty());

        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        let ts = now_rfc3339();
        let existing: Option<String> = tx
            .query_row(
                "SELECT id FROM glossary WHERE term = ?1 COLLATE NOCASE",
                [term],
                |row| row.get(0),
            )
            .optional()?;

        let id = match existing {
            Some(id) => {
                tx.execute(
                    "UPDATE glossary SET term = ?2, definition = ?3, image = ?4, updated_at = ?5, rev = rev + 1
                     WHERE id = ?1",
                    (&id, term, definition, image, &ts),
                )?;
                id
            }
            None => {
                let id = new_id("term");
                tx.execute(
                    "INSERT INTO glossary (id, term, definition, image, created_at, updated_at, rev)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?5, 1)",
                    (&id, term, definition, image, &ts),
                )?;
                id
            }
        };
        append_event_tx(
            &tx,
            "glossary.upserted",
            Some(&id),
            serde_json::json!({ "id": id, "term": term }),
        )?;
        let stored = tx.query_row(
            "SELECT id, term, definition, image, created_at, updated_at, rev FROM glossary WHERE id = ?1",
            [&id],
            StoredTerm::from_row,
        )?;
        tx.commit()?;
        tracing::info!(id = %stored.id, term = %stored.term, rev = stored.rev, "glossary term saved");
        Ok(stored)
    }

    pub fn delete_term(&self, id: &str) -> anyhow::Result<bool> {
        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        let n = tx.execute("DELETE FROM glossary WHERE id = ?1", [id])?;
        if n > 0 {
            append_event_tx(
                &tx,
                "glossary.deleted",
                Some(id),
                serde_json::json!({ "id": id }),
            )?;
        }
        tx.commit()?;
        Ok(n > 0)
    }

    pub fn get_rev(&self) -> anyhow::Result<i64> {
        let conn = self.open()?;
        let rev: Option<i64> =
            conn.query_row("SELECT MAX(seq) FROM event_log", [], |row| row.get(0))?;
        Ok(rev.unwrap_or(0))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredTerm {
    pub id: String,
    pub term: String,
    pub definition: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub rev: i64,
}

impl StoredTerm {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            term: row.get(1)?,
            definition: row.get(2)?,
            image: row.get(3)?,
            created_at: row.get(4)?,
            updated_at: row.get(5)?,
            rev: row.get(6)?,
        })
    }

    pub fn into_term(self) -> GlossaryTerm {
        GlossaryTerm {
            term: self.term,
            definition: self.definition,
            image: self.image,
        }
    }
}

fn migrate(conn: &Connection) -> anyhow::Result<()> {
    let v: i64 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;

    if v < 1 {
        conn.execute_batch(
            r#"
-- Monotonic revision source for UI sync.
CREATE TABLE IF NOT EXISTS event_log (
  seq INTEGER PRIMARY KEY AUTOINCREMENT,
  ts_ms INTEGER NOT NULL,
  kind TEXT NOT NULL,
  entity_id TEXT,
  payload_json TEXT NOT NULL DEFAULT '{}'
);

CREATE INDEX IF NOT EXISTS idx_event_log_ts ON event_log(ts_ms);
CREATE INDEX IF NOT EXISTS idx_event_log_kind ON event_log(kind);

CREATE TABLE IF NOT EXISTS glossary (
  id TEXT PRIMARY KEY,
  term TEXT NOT NULL,
  definition TEXT NOT NULL DEFAULT '',
  image TEXT,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  rev INTEGER NOT NULL DEFAULT 0
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_glossary_term ON glossary(term COLLATE NOCASE);
"#,
        )?;

        conn.pragma_update(None, "user_version", 1_i64)?;
    }

    Ok(())
}

fn append_event_tx(
    tx: &rusqlite::Transaction<'_>,
    kind: &str,
    entity_id: Option<&str>,
    payload: serde_json::Value,
) -> anyhow::Result<i64> {
    let ts = now_ms();
    let payload_json = payload.to_string();
    tx.execute(
        "INSERT INTO event_log (ts_ms, kind, entity_id, payload_json) VALUES (?1, ?2, ?3, ?4)",
        (ts, kind, entity_id, payload_json),
    )?;
    Ok(tx.last_insert_rowid())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_engine() -> Engine {
        let p = std::env::temp_dir().join(format!(
            "chronicle-engine-test-{}.db",
            OffsetDateTime::now_utc().unix_timestamp_nanos()
        ));
        Engine::new(p)
    }

    #[test]
    fn upsert_inserts_then_updates_case_insensitively() {
        let engine = temp_engine();
        let a = engine.upsert_term("Elysium", "Neutral ground.", None).unwrap();
        assert_eq!(a.rev, 1);

        let b = engine
            .upsert_term("  elysium ", "Sacred ground.", Some("https://x/e.png"))
            .unwrap();
        assert_eq!(b.id, a.id);
        assert_eq!(b.term, "elysium");
        assert_eq!(b.definition, "Sacred ground.");
        assert_eq!(b.image.as_deref(), Some("https://x/e.png"));
        assert_eq!(b.rev, 2);

        assert_eq!(engine.list_glossary().unwrap().len(), 1);
        assert_eq!(engine.get_rev().unwrap(), 2);
    }

    #[test]
    fn reopening_keeps_schema_and_data() {
        let engine = temp_engine();
        engine.upsert_term("Elysium", "Neutral ground.", None).unwrap();

        let conn = engine.open().unwrap();
        let version: i64 = conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .unwrap();
        assert_eq!(version, 1);
        let rev: i64 = conn
            .query_row("SELECT rev FROM glossary", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rev, 1);
        drop(conn);

        let _ = engine.open().unwrap();
        assert_eq!(engine.list_glossary().unwrap().len(), 1);
    }

    #[test]
    fn blank_terms_are_rejected() {
        let engine = temp_engine();
        assert!(engine.upsert_term("   ", "x", None).is_err());
        assert_eq!(engine.get_rev().unwrap(), 0);
    }

    #[test]
    fn delete_logs_only_real_deletes() {
        let engine = temp_engine();
        let t = engine.upsert_term("Gehenna", "The end.", Some("")).unwrap();
        assert!(t.image.is_none());
        assert!(engine.delete_term(&t.id).unwrap());
        assert!(!engine.delete_term(&t.id).unwrap());
        assert!(engine.list_glossary().unwrap().is_empty());
        assert_eq!(engine.get_rev().unwrap(), 2);
    }

    #[test]
    fn glossary_feeds_annotation() {
        let engine = temp_engine();
        engine.upsert_term("Blood", "Vitae.", None).unwrap();
        engine.upsert_term("Blood Hunter", "Hunts Kindred.", None).unwrap();

        let glossary = engine.glossary().unwrap();
        assert_eq!(glossary[0].term, "Blood");
        let out = annotate(
            Some("A Blood Hunter spilled blood."),
            &glossary,
            chronicle_protocol::Variant::Chronicle,
        );
        assert!(out.content.contains("Hunts Kindred."));
        assert!(out.content.contains("Vitae."));
    }
}
