//! Timeline store: recorded events, per-target pointers, and the active target

use chrono::Utc;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::database::{Database, DatabaseError};
use super::models::{EventKind, SessionPointer, TimelineEvent};
use crate::scope::ScopeDiff;

const EVENT_COLUMNS: &str = "file, sequence_id, kind, target_name, unit, return_value, frame_id, \
     function, line_number, source_text, global_diff, local_diff, traceback, error";

/// Data access object for the timeline tables.
///
/// Writes are keyed by `(file, sequence_id)`; writing the same key twice
/// replaces the row, which is how a rewound branch overwrites the old one.
#[derive(Debug, Clone)]
pub struct TimelineStore {
    db: Database,
}

impl TimelineStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// (Re)create a target row, dropping any timeline recorded for it
    pub fn register_target(&self, file: &str) -> Result<(), DatabaseError> {
        self.db.with_connection(|conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM timeline WHERE file = ?1", params![file])?;
            tx.execute(
                "INSERT INTO targets (file, cursor_sequence_id, cursor_line, uploaded_at)
                 VALUES (?1, NULL, NULL, ?2)
                 ON CONFLICT(file) DO UPDATE SET
                    cursor_sequence_id = NULL,
                    cursor_line = NULL,
                    uploaded_at = excluded.uploaded_at",
                params![file, Utc::now().to_rfc3339()],
            )?;
            tx.commit()?;
            Ok(())
        })
    }

    /// Create a target row if it does not exist yet, leaving existing state alone
    pub fn ensure_target(&self, file: &str) -> Result<(), DatabaseError> {
        self.db.with_connection(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO targets (file, cursor_sequence_id, cursor_line, uploaded_at)
                 VALUES (?1, NULL, NULL, ?2)",
                params![file, Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
    }

    /// Point the singleton active-target row at `file`
    pub fn set_active_target(&self, file: &str) -> Result<(), DatabaseError> {
        self.db.with_connection(|conn| {
            conn.execute(
                "INSERT INTO active (singleton_id, file) VALUES (1, ?1)
                 ON CONFLICT(singleton_id) DO UPDATE SET file = excluded.file",
                params![file],
            )?;
            Ok(())
        })
    }

    /// Get the active target, or `NotFound` when none is set
    pub fn get_active_target(&self) -> Result<String, DatabaseError> {
        self.db.with_connection(|conn| {
            conn.query_row("SELECT file FROM active WHERE singleton_id = 1", [], |row| {
                row.get::<_, Option<String>>(0)
            })
            .optional()?
            .flatten()
            .ok_or_else(|| DatabaseError::NotFound("no pointer to a file".into()))
        })
    }

    /// Get the session pointer of a target, or `NotFound` when the target is unknown
    pub fn get_pointer(&self, file: &str) -> Result<SessionPointer, DatabaseError> {
        self.db.with_connection(|conn| read_pointer(conn, file))
    }

    /// Move a target's cursor
    pub fn set_pointer(
        &self,
        file: &str,
        sequence_id: Option<i64>,
        line_number: Option<u32>,
    ) -> Result<(), DatabaseError> {
        self.db
            .with_connection(|conn| write_pointer(conn, file, sequence_id, line_number))
    }

    /// Signal "no active rewindable session" for a target
    pub fn clear_pointer(&self, file: &str) -> Result<(), DatabaseError> {
        self.set_pointer(file, None, None)
    }

    /// Write one event, replacing any row already stored under its id
    pub fn append_or_replace(&self, event: &TimelineEvent) -> Result<(), DatabaseError> {
        self.db.with_connection(|conn| write_event(conn, event))
    }

    /// Write one event and advance the target's cursor to it atomically
    pub fn record(&self, event: &TimelineEvent) -> Result<(), DatabaseError> {
        self.db.with_connection(|conn| {
            let tx = conn.transaction()?;
            write_event(&tx, event)?;
            write_pointer(
                &tx,
                &event.target_file,
                Some(event.sequence_id),
                Some(event.line_number),
            )?;
            tx.commit()?;
            Ok(())
        })
    }

    /// Every event with an id at or below `upper_bound`, ascending
    pub fn range(&self, file: &str, upper_bound: i64) -> Result<Vec<TimelineEvent>, DatabaseError> {
        self.db.with_connection(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {EVENT_COLUMNS} FROM timeline
                 WHERE file = ?1 AND sequence_id <= ?2
                 ORDER BY sequence_id ASC"
            ))?;
            let events = stmt
                .query_map(params![file, upper_bound], row_to_event)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(events)
        })
    }

    /// The target's pointer and the timeline up to it.
    ///
    /// Rows past the cursor belong to a branch that was rewound away and are
    /// hidden until they are regenerated.
    pub fn timeline(
        &self,
        file: &str,
    ) -> Result<(SessionPointer, Vec<TimelineEvent>), DatabaseError> {
        let pointer = self.get_pointer(file)?;
        let events = match pointer.last_sequence_id {
            Some(id) => {
                let events = self.range(file, id)?;
                if events.is_empty() {
                    return Err(DatabaseError::NotFound(format!(
                        "no timeline for timeline id {id}"
                    )));
                }
                events
            }
            None => Vec::new(),
        };
        Ok((pointer, events))
    }

    /// A single event by id
    pub fn event(&self, file: &str, sequence_id: i64) -> Result<Option<TimelineEvent>, DatabaseError> {
        self.db.with_connection(|conn| {
            let event = conn
                .query_row(
                    &format!(
                        "SELECT {EVENT_COLUMNS} FROM timeline WHERE file = ?1 AND sequence_id = ?2"
                    ),
                    params![file, sequence_id],
                    row_to_event,
                )
                .optional()?;
            Ok(event)
        })
    }

    /// Every stored row for a target regardless of the cursor, ascending
    pub fn all_events(&self, file: &str) -> Result<Vec<TimelineEvent>, DatabaseError> {
        self.range(file, i64::MAX)
    }
}

fn read_pointer(conn: &Connection, file: &str) -> Result<SessionPointer, DatabaseError> {
    conn.query_row(
        "SELECT cursor_sequence_id, cursor_line FROM targets WHERE file = ?1",
        params![file],
        |row| {
            Ok(SessionPointer::new(
                row.get::<_, Option<i64>>(0)?,
                row.get::<_, Option<u32>>(1)?,
            ))
        },
    )
    .optional()?
    .ok_or_else(|| DatabaseError::NotFound("no last IDs for this file".into()))
}

fn write_pointer(
    conn: &Connection,
    file: &str,
    sequence_id: Option<i64>,
    line_number: Option<u32>,
) -> Result<(), DatabaseError> {
    let updated = conn.execute(
        "UPDATE targets SET cursor_sequence_id = ?2, cursor_line = ?3 WHERE file = ?1",
        params![file, sequence_id, line_number],
    )?;
    if updated == 0 {
        return Err(DatabaseError::NotFound(format!("unknown target {file}")));
    }
    Ok(())
}

fn write_event(conn: &Connection, event: &TimelineEvent) -> Result<(), DatabaseError> {
    let (return_value, error, traceback) = match &event.kind {
        EventKind::Return { return_value } => (Some(serde_json::to_string(return_value)?), None, None),
        EventKind::Exception { error, traceback } => (None, Some(error.as_str()), Some(traceback.as_str())),
        EventKind::Call | EventKind::Line => (None, None, None),
    };

    conn.execute(
        &format!(
            "INSERT OR REPLACE INTO timeline ({EVENT_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"
        ),
        params![
            event.target_file,
            event.sequence_id,
            event.kind.as_str(),
            event.target_name,
            event.unit,
            return_value,
            event.frame_id as i64,
            event.function,
            event.line_number,
            event.source_text,
            serde_json::to_string(&event.global_diff)?,
            serde_json::to_string(&event.local_diff)?,
            traceback,
            error,
        ],
    )?;
    Ok(())
}

fn json_column<T: serde::de::DeserializeOwned>(row: &Row, idx: usize) -> rusqlite::Result<T> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

/// Convert a database row to a TimelineEvent
fn row_to_event(row: &Row) -> rusqlite::Result<TimelineEvent> {
    let kind_raw: String = row.get(2)?;
    let kind = match kind_raw.as_str() {
        "call" => EventKind::Call,
        "line" => EventKind::Line,
        "return" => EventKind::Return {
            return_value: match row.get::<_, Option<String>>(5)? {
                Some(_) => json_column(row, 5)?,
                None => serde_json::Value::Null,
            },
        },
        "exception" => EventKind::Exception {
            error: row.get::<_, Option<String>>(13)?.unwrap_or_default(),
            traceback: row.get::<_, Option<String>>(12)?.unwrap_or_default(),
        },
        other => {
            return Err(rusqlite::Error::FromSqlConversionFailure(
                2,
                Type::Text,
                format!("unknown event kind {other:?}").into(),
            ))
        }
    };

    Ok(TimelineEvent {
        target_file: row.get(0)?,
        sequence_id: row.get(1)?,
        kind,
        target_name: row.get(3)?,
        unit: row.get(4)?,
        frame_id: row.get::<_, i64>(6)? as u64,
        function: row.get(7)?,
        line_number: row.get(8)?,
        source_text: row.get(9)?,
        global_diff: json_column::<ScopeDiff>(row, 10)?,
        local_diff: json_column::<ScopeDiff>(row, 11)?,
    })
}
