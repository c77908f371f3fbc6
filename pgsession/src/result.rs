//! Query results.
use std::str::Utf8Error;

use bytes::Bytes;

use crate::postgres::{Oid, PgFormat};

/// Outcome of a single command as reported by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecStatus {
    /// The query string was empty.
    EmptyQuery,
    /// Command finished without returning rows.
    CommandOk,
    /// Command returned rows, possibly zero.
    TuplesOk,
    /// Server started sending `COPY` data.
    CopyOut,
    /// Server is waiting for `COPY` data.
    CopyIn,
    /// The server response was not understood.
    BadResponse,
    /// A notice or warning.
    NonfatalError,
    /// The command failed.
    FatalError,
}

impl ExecStatus {
    /// Returns `true` if a result with this status must not be handed to the caller.
    pub fn is_error(&self) -> bool {
        matches!(self, Self::FatalError | Self::BadResponse)
    }
}

/// Description of a result column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub type_oid: Oid,
    pub format: PgFormat,
}

/// Unvalidated result, straight from the driver.
///
/// The session only hands these out through [`Session::get_result`][crate::Session::get_result],
/// everything else is validated into a [`QueryResult`] first.
#[derive(Debug, Clone)]
pub struct RawResult {
    pub status: ExecStatus,
    pub columns: Vec<Column>,
    pub rows: Vec<Vec<Option<Bytes>>>,
    pub command_tag: String,
    /// Rendered diagnostic, empty unless the command failed.
    pub error_message: String,
    pub sqlstate: Option<String>,
}

impl RawResult {
    pub fn new(status: ExecStatus) -> RawResult {
        Self {
            status,
            columns: vec![],
            rows: vec![],
            command_tag: String::new(),
            error_message: String::new(),
            sqlstate: None,
        }
    }

    /// Failed result carrying a diagnostic.
    pub fn error(message: impl Into<String>, sqlstate: Option<String>) -> RawResult {
        Self {
            error_message: message.into(),
            sqlstate,
            ..Self::new(ExecStatus::FatalError)
        }
    }

    /// Command complete result with given tag.
    pub fn command(tag: impl Into<String>) -> RawResult {
        Self {
            command_tag: tag.into(),
            ..Self::new(ExecStatus::CommandOk)
        }
    }
}

/// A validated result, tied to the query that produced it.
#[derive(Debug, Clone)]
pub struct QueryResult {
    raw: RawResult,
    query: String,
}

impl QueryResult {
    pub(crate) fn new(raw: RawResult, query: impl Into<String>) -> QueryResult {
        Self { raw, query: query.into() }
    }

    pub fn status(&self) -> ExecStatus {
        self.raw.status
    }

    /// The query text, or a bracketed pseudo query such as `[END COPY]`.
    pub fn query(&self) -> &str {
        &self.query
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.raw.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.raw.rows.is_empty()
    }

    pub fn columns(&self) -> &[Column] {
        &self.raw.columns
    }

    /// Position of the column named `name`.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.raw.columns.iter().position(|e| e.name == name)
    }

    /// Raw cell value, `None` for NULL or out of range.
    pub fn value(&self, row: usize, col: usize) -> Option<&[u8]> {
        self.raw.rows.get(row)?.get(col)?.as_deref()
    }

    /// Cell value as text, `Ok(None)` for NULL or out of range.
    pub fn text(&self, row: usize, col: usize) -> Result<Option<&str>, Utf8Error> {
        self.value(row, col).map(str::from_utf8).transpose()
    }

    pub fn is_null(&self, row: usize, col: usize) -> bool {
        matches!(self.raw.rows.get(row).and_then(|e| e.get(col)), Some(None))
    }

    pub fn command_tag(&self) -> &str {
        &self.raw.command_tag
    }

    /// Number of rows affected, parsed from the command tag.
    pub fn rows_affected(&self) -> u64 {
        let mut whs = self.raw.command_tag.split_whitespace();
        let Some(tag) = whs.next() else {
            return 0;
        };
        let Some(rows) = whs.next() else {
            return 0;
        };
        match tag {
            "INSERT" => whs.next().unwrap_or_default(),
            "SELECT" | "UPDATE" | "DELETE" | "MERGE" | "FETCH" | "MOVE" | "COPY" => rows,
            _ => return 0,
        }
        .parse()
        .unwrap_or_default()
    }

    pub fn into_raw(self) -> RawResult {
        self.raw
    }
}
