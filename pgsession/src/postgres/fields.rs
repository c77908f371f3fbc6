//! Decoded error and notice fields.
//!
//! <https://www.postgresql.org/docs/current/protocol-error-fields.html>
use std::fmt::{self, Write};

use bytes::Bytes;

use super::ProtocolError;
use crate::ext::BytesExt;

/// How much of an error or notice is rendered into its text form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorVerbosity {
    /// Severity and primary message only.
    Terse,
    /// Adds detail, hint and context lines.
    #[default]
    Default,
    /// Adds the `SQLSTATE` code and source location.
    Verbose,
}

/// Fields of an `ErrorResponse` or `NoticeResponse`.
#[derive(Debug, Default, Clone)]
pub struct DatabaseError {
    pub severity: String,
    pub code: String,
    pub message: String,
    pub detail: Option<String>,
    pub hint: Option<String>,
    pub context: Option<String>,
    pub file: Option<String>,
    pub line: Option<String>,
    pub routine: Option<String>,
}

impl DatabaseError {
    /// Decode message body, unrecognized fields are skipped.
    pub fn decode(mut body: Bytes) -> Result<Self, ProtocolError> {
        let mut me = DatabaseError::default();
        loop {
            let code = body.try_u8()?;
            if code == b'\0' {
                break;
            }
            let value = body.get_nul_string()?;
            match code {
                // `S` is localized, `V` never is, prefer the later
                b'S' if me.severity.is_empty() => me.severity = value,
                b'V' => me.severity = value,
                b'C' => me.code = value,
                b'M' => me.message = value,
                b'D' => me.detail = Some(value),
                b'H' => me.hint = Some(value),
                b'W' => me.context = Some(value),
                b'F' => me.file = Some(value),
                b'L' => me.line = Some(value),
                b'R' => me.routine = Some(value),
                _ => {}
            }
        }
        Ok(me)
    }

    /// Render the newline terminated text form.
    pub fn format(&self, verbosity: ErrorVerbosity) -> String {
        let mut out = String::with_capacity(self.message.len() + 16);
        // writing into a String never fails
        let _ = self.write_to(&mut out, verbosity);
        out
    }

    fn write_to(&self, f: &mut String, verbosity: ErrorVerbosity) -> fmt::Result {
        write!(f, "{}:  ", self.severity)?;
        if verbosity == ErrorVerbosity::Verbose && !self.code.is_empty() {
            write!(f, "{}: ", self.code)?;
        }
        writeln!(f, "{}", self.message)?;

        if verbosity == ErrorVerbosity::Terse {
            return Ok(());
        }

        if let Some(detail) = &self.detail {
            writeln!(f, "DETAIL:  {detail}")?;
        }
        if let Some(hint) = &self.hint {
            writeln!(f, "HINT:  {hint}")?;
        }
        if let Some(context) = &self.context {
            writeln!(f, "CONTEXT:  {context}")?;
        }

        if verbosity == ErrorVerbosity::Verbose {
            match (&self.routine, &self.file, &self.line) {
                (Some(routine), Some(file), Some(line)) => writeln!(f, "LOCATION:  {routine}, {file}:{line}")?,
                (None, Some(file), Some(line)) => writeln!(f, "LOCATION:  {file}:{line}")?,
                _ => {}
            }
        }

        Ok(())
    }
}

impl fmt::Display for DatabaseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.severity, self.message)
    }
}
