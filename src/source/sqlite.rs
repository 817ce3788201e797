//! SQLite message source with a rowid cursor
//!
//! Reads the `messages` table in pages of `page_size` rows, so the table is
//! never loaded at once. Both extractor layouts are accepted: the reader
//! selects only the columns the table has. Poll messages are rebuilt from
//! the `polls` / `poll_options` tables when they exist, otherwise from a JSON
//! `content` column.

use rusqlite::types::ValueRef;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use serde_json::{Map, Value};
use std::collections::{HashSet, VecDeque};
use std::path::Path;

use super::{MessageSource, RecordStream, SourceError};
use crate::record::{Content, Poll, PollOption, Record};

/// Columns mapped onto a record; any subset may exist
const KNOWN_COLUMNS: [&str; 12] = [
    "id",
    "date",
    "sender_id",
    "message_type",
    "content",
    "extra_data",
    "reply_to_msg_id",
    "topic_id",
    "topic_title",
    "source_name",
    "source_group_id",
    "source_saved_file",
];

pub struct SqliteMessageSource {
    conn: Connection,
    name: String,
    page_size: usize,
    has_polls: bool,
    columns: Vec<&'static str>,
    page_query: String,
}

impl SqliteMessageSource {
    /// Open the database read-only
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self, SourceError> {
        let db_path = db_path.as_ref();
        let conn = Connection::open_with_flags(db_path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;

        // Fails with "no such table" when there is nothing to read
        conn.prepare("SELECT rowid FROM messages LIMIT 0")?;

        let present = {
            let mut stmt = conn.prepare("SELECT name FROM pragma_table_info('messages')")?;
            let names = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<Result<HashSet<_>, _>>()?;
            names
        };
        let columns: Vec<&'static str> = KNOWN_COLUMNS
            .iter()
            .copied()
            .filter(|column| present.contains(*column))
            .collect();

        let poll_tables: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master
             WHERE type = 'table' AND name IN ('polls', 'poll_options')",
            [],
            |row| row.get(0),
        )?;

        let page_query = format!(
            "SELECT rowid{} FROM messages WHERE rowid > ?1 ORDER BY rowid ASC LIMIT ?2",
            columns.iter().map(|c| format!(", {}", c)).collect::<String>()
        );

        log::info!(
            "📥 SQLite source opened: {} ({} mapped columns)",
            db_path.display(),
            columns.len()
        );

        Ok(Self {
            conn,
            name: db_path.display().to_string(),
            page_size: 1000,
            has_polls: poll_tables == 2,
            columns,
            page_query,
        })
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    fn fetch_page(
        &self,
        after_rowid: i64,
    ) -> Result<Vec<(i64, Result<Record, SourceError>)>, SourceError> {
        let mut stmt = self.conn.prepare_cached(&self.page_query)?;
        let rows = stmt.query_map(params![after_rowid, self.page_size as i64], |row| {
            let rowid: i64 = row.get(0)?;
            Ok((rowid, self.map_row(row)?))
        })?;

        let mut page = Vec::with_capacity(self.page_size);
        for row in rows {
            let (rowid, mapped) = row?;
            let record = match mapped {
                Ok((message_type, mut record)) => {
                    if message_type.as_deref() == Some("poll") {
                        self.rebuild_poll(&mut record)?;
                    }
                    Ok(record)
                }
                Err(reason) => Err(SourceError::Malformed {
                    origin: self.name.clone(),
                    line: usize::try_from(rowid).unwrap_or_default(),
                    reason,
                }),
            };
            page.push((rowid, record));
        }

        Ok(page)
    }

    fn column(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| *c == name).map(|idx| idx + 1)
    }

    fn value<'r>(&self, row: &'r Row<'_>, name: &str) -> rusqlite::Result<ValueRef<'r>> {
        match self.column(name) {
            Some(idx) => row.get_ref(idx),
            None => Ok(ValueRef::Null),
        }
    }

    /// Map one row; `Err` carries the reason the row cannot become a record
    fn map_row(
        &self,
        row: &Row<'_>,
    ) -> rusqlite::Result<Result<(Option<String>, Record), String>> {
        let id = match integer_value(self.value(row, "id")?, "id") {
            Ok(Some(id)) => id,
            Ok(None) => return Ok(Err("id is NULL".to_string())),
            Err(reason) => return Ok(Err(reason)),
        };

        let date = match self.value(row, "date")? {
            ValueRef::Null => None,
            ValueRef::Text(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
            other => return Ok(Err(format!("date is {}, expected text", other.data_type()))),
        };

        let mut numbers = [None; 3];
        for (slot, name) in numbers
            .iter_mut()
            .zip(["reply_to_msg_id", "topic_id", "source_group_id"])
        {
            match integer_value(self.value(row, name)?, name) {
                Ok(value) => *slot = value,
                Err(reason) => return Ok(Err(reason)),
            }
        }
        let [reply_to_id, topic_id, group_id] = numbers;

        let message_type = text_value(self.value(row, "message_type")?);

        let mut extra = Map::new();
        if let Some(kind) = &message_type {
            extra.insert("message_type".to_string(), Value::from(kind.clone()));
        }
        if let Some(raw) = text_value(self.value(row, "extra_data")?) {
            if !raw.is_empty() {
                let value = serde_json::from_str(&raw).unwrap_or(Value::String(raw));
                extra.insert("extra_data".to_string(), value);
            }
        }
        if let Some(file) = text_value(self.value(row, "source_saved_file")?) {
            extra.insert("source_saved_file".to_string(), Value::from(file));
        }

        let record = Record {
            id,
            group_id: group_id.unwrap_or_default(),
            topic_id,
            date,
            sender_id: text_value(self.value(row, "sender_id")?),
            content: Content::Text(text_value(self.value(row, "content")?).unwrap_or_default()),
            reply_to_id,
            topic_title: text_value(self.value(row, "topic_title")?),
            source_name: text_value(self.value(row, "source_name")?),
            normalized_values: Vec::new(),
            extra,
        };

        Ok(Ok((message_type, record)))
    }

    fn rebuild_poll(&self, record: &mut Record) -> Result<(), SourceError> {
        if self.has_polls {
            if let Some(poll) = self.load_poll(record.id)? {
                record.content = Content::Poll(poll);
                return Ok(());
            }
        }

        // Newer extractor databases store the poll as JSON in `content`
        let parsed = record
            .content
            .as_text()
            .and_then(|raw| serde_json::from_str::<Poll>(raw).ok());
        if let Some(poll) = parsed {
            record.content = Content::Poll(poll);
        }
        Ok(())
    }

    fn load_poll(&self, message_id: i64) -> Result<Option<Poll>, SourceError> {
        let header = self
            .conn
            .query_row(
                "SELECT question, total_voters FROM polls WHERE message_id = ?1",
                [message_id],
                |row| {
                    Ok((
                        row.get::<_, Option<String>>(0)?,
                        row.get::<_, Option<i64>>(1)?,
                    ))
                },
            )
            .optional()?;

        let Some((question, total_voters)) = header else {
            return Ok(None);
        };

        let mut stmt = self
            .conn
            .prepare_cached("SELECT text, voters FROM poll_options WHERE poll_id = ?1 ORDER BY id")?;
        let options = stmt
            .query_map([message_id], |row| {
                Ok(PollOption {
                    text: row.get::<_, Option<String>>(0)?.unwrap_or_default(),
                    voters: row.get::<_, Option<i64>>(1)?.unwrap_or_default(),
                    extra: Map::new(),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Some(Poll {
            question: question.unwrap_or_default(),
            options,
            total_voters: total_voters.unwrap_or_default(),
            extra: Map::new(),
        }))
    }
}

impl MessageSource for SqliteMessageSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn records(&mut self) -> Result<RecordStream<'_>, SourceError> {
        Ok(Box::new(PagedRecords {
            source: self,
            last_rowid: 0,
            page: VecDeque::new(),
            exhausted: false,
        }))
    }
}

struct PagedRecords<'a> {
    source: &'a SqliteMessageSource,
    last_rowid: i64,
    page: VecDeque<Result<Record, SourceError>>,
    exhausted: bool,
}

impl Iterator for PagedRecords<'_> {
    type Item = Result<Record, SourceError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(item) = self.page.pop_front() {
                return Some(item);
            }
            if self.exhausted {
                return None;
            }

            match self.source.fetch_page(self.last_rowid) {
                Ok(rows) => {
                    if rows.len() < self.source.page_size {
                        self.exhausted = true;
                    }
                    if let Some((rowid, _)) = rows.last() {
                        self.last_rowid = *rowid;
                    }
                    log::debug!("Fetched {} messages up to rowid {}", rows.len(), self.last_rowid);
                    self.page.extend(rows.into_iter().map(|(_, record)| record));
                }
                Err(e) => {
                    self.exhausted = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

/// Integer column; numeric text is accepted, anything else is a bad row
fn integer_value(value: ValueRef<'_>, column: &str) -> Result<Option<i64>, String> {
    match value {
        ValueRef::Null => Ok(None),
        ValueRef::Integer(i) => Ok(Some(i)),
        ValueRef::Text(bytes) => std::str::from_utf8(bytes)
            .ok()
            .and_then(|raw| raw.trim().parse().ok())
            .map(Some)
            .ok_or_else(|| format!("{} is not an integer", column)),
        other => Err(format!("{} is {}, expected integer", column, other.data_type())),
    }
}

fn text_value(value: ValueRef<'_>) -> Option<String> {
    match value {
        ValueRef::Null => None,
        ValueRef::Integer(i) => Some(i.to_string()),
        ValueRef::Real(f) => Some(f.to_string()),
        ValueRef::Text(bytes) | ValueRef::Blob(bytes) => {
            Some(String::from_utf8_lossy(bytes).into_owned())
        }
    }
}
