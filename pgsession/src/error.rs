//! `pgsession` error types.
use std::{backtrace::Backtrace, borrow::Cow, fmt, io, str::Utf8Error};

use crate::{config::ParseError, postgres::ProtocolError, wire::UnsupportedAuth};

/// A specialized [`Result`] type for `pgsession` operation.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// All possible error from `pgsession` library.
pub struct Error {
    context: String,
    backtrace: Backtrace,
    kind: ErrorKind,
}

impl Error {
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }

    /// Returns `true` if the connection this error came from can no longer be used.
    ///
    /// This is the case for [`ErrorKind::BrokenConnection`] and for raw io failure.
    pub fn is_broken_connection(&self) -> bool {
        matches!(self.kind, ErrorKind::BrokenConnection(_) | ErrorKind::Io(_))
    }

    /// Prefix the error message with `context`.
    pub fn context(mut self, context: impl Into<String>) -> Self {
        self.context = context.into();
        self
    }

    pub(crate) fn broken(msg: impl Into<Cow<'static, str>>) -> Error {
        ErrorKind::BrokenConnection(msg.into()).into()
    }

    pub(crate) fn sql(message: impl Into<String>, query: impl Into<String>) -> Error {
        ErrorKind::Sql(SqlError {
            message: message.into(),
            query: query.into(),
            sqlstate: None,
        })
        .into()
    }

    pub(crate) fn failure(msg: impl Into<String>) -> Error {
        ErrorKind::Failure(msg.into()).into()
    }

    pub(crate) fn feature_not_supported(msg: &'static str) -> Error {
        ErrorKind::FeatureNotSupported(msg.into()).into()
    }

    pub(crate) fn argument(msg: impl Into<String>) -> Error {
        ErrorKind::Argument(msg.into()).into()
    }

    pub(crate) fn usage(msg: impl Into<String>) -> Error {
        ErrorKind::Usage(msg.into()).into()
    }

    pub(crate) fn internal(msg: impl Into<Cow<'static, str>>) -> Error {
        ErrorKind::Internal(msg.into()).into()
    }
}

/// All possible error kind from `pgsession` library.
pub enum ErrorKind {
    /// The connection is absent, unhealthy, or failed at the io level.
    ///
    /// Always terminal for the current handle, never retried.
    BrokenConnection(Cow<'static, str>),
    /// The server rejected or failed a command.
    ///
    /// The session stays usable after this error.
    Sql(SqlError),
    /// The driver failed an operation without a server diagnostic.
    Failure(String),
    /// Server or protocol version is below the supported minimum.
    FeatureNotSupported(Cow<'static, str>),
    /// Caller supplied an invalid argument.
    Argument(String),
    /// Caller violated an usage contract, such as opening two transactions at once.
    Usage(String),
    /// The driver returned a value that should be impossible.
    Internal(Cow<'static, str>),
    Config(ParseError),
    Protocol(ProtocolError),
    Io(io::Error),
    UnsupportedAuth(UnsupportedAuth),
    Utf8(Utf8Error),
}

/// A command failed on the server.
pub struct SqlError {
    message: String,
    query: String,
    sqlstate: Option<String>,
}

impl SqlError {
    pub(crate) fn new(message: String, query: String, sqlstate: Option<String>) -> Self {
        Self { message, query, sqlstate }
    }

    /// Diagnostic text as reported by the driver.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// The query that failed.
    pub fn query(&self) -> &str {
        &self.query
    }

    /// Five character `SQLSTATE` code, when the server reported one.
    pub fn sqlstate(&self) -> Option<&str> {
        self.sqlstate.as_deref()
    }
}

impl std::error::Error for SqlError { }

impl fmt::Display for SqlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message.trim_end())
    }
}

impl fmt::Debug for SqlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqlError")
            .field("message", &self.message)
            .field("query", &self.query)
            .field("sqlstate", &self.sqlstate)
            .finish()
    }
}

macro_rules! from {
    (<$ty:ty>$pat:pat => $body:expr) => {
        impl From<$ty> for Error {
            fn from($pat: $ty) -> Self {
                let backtrace = std::backtrace::Backtrace::capture();
                Self { context: String::new(), backtrace, kind: $body }
            }
        }
    };
}

from!(<ErrorKind>e => e);
from!(<SqlError>e => ErrorKind::Sql(e));
from!(<ParseError>e => ErrorKind::Config(e));
from!(<ProtocolError>e => ErrorKind::Protocol(e));
from!(<std::io::Error>e => ErrorKind::Io(e));
from!(<UnsupportedAuth>e => ErrorKind::UnsupportedAuth(e));
from!(<Utf8Error>e => ErrorKind::Utf8(e));

impl std::error::Error for Error { }

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.context.is_empty() {
            write!(f, "{}: ", self.context)?;
        }

        fmt::Display::fmt(&self.kind, f)?;

        if let std::backtrace::BacktraceStatus::Captured = self.backtrace.status() {
            let mut backtrace = self.backtrace.to_string();
            write!(f, "\n\n")?;
            writeln!(f, "Stack backtrace:")?;
            backtrace.truncate(backtrace.trim_end().len());
            write!(f, "{}", backtrace)?;
        }

        Ok(())
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

impl std::error::Error for ErrorKind { }

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BrokenConnection(e) => write!(f, "broken connection: {e}"),
            Self::Sql(e) => e.fmt(f),
            Self::Failure(e) => f.write_str(e.trim_end()),
            Self::FeatureNotSupported(e) => write!(f, "feature not supported: {e}"),
            Self::Argument(e) => write!(f, "invalid argument: {e}"),
            Self::Usage(e) => write!(f, "usage error: {e}"),
            Self::Internal(e) => write!(f, "internal error: {e}"),
            Self::Config(e) => e.fmt(f),
            Self::Protocol(e) => e.fmt(f),
            Self::Io(e) => e.fmt(f),
            Self::UnsupportedAuth(e) => e.fmt(f),
            Self::Utf8(e) => e.fmt(f),
        }
    }
}

impl fmt::Debug for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}
