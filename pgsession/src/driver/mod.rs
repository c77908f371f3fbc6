//! The contract between a [`Session`][crate::Session] and the protocol handle beneath it.
//!
//! A [`Driver`] owns the socket and speaks the wire protocol. A [`ConnectionPolicy`]
//! decides when a driver is created and torn down. The session only ever talks to
//! these traits, [`PgConn`][crate::wire::PgConn] is the implementation shipped with
//! this crate.
use std::{cell::RefCell, io, os::fd::RawFd, rc::Rc};

use bytes::{Buf, Bytes};

use crate::{
    ext::BindParams,
    postgres::PgFormat,
    result::RawResult,
};

#[cfg(test)]
pub(crate) mod mock;

pub use crate::postgres::ErrorVerbosity;

/// Callback receiving every notice the server sends, as formatted text.
pub type NoticeProcessor = Box<dyn FnMut(&str)>;

/// Destination for protocol traffic tracing.
pub type TraceSink = Rc<RefCell<dyn io::Write>>;

/// Health of a protocol handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnStatus {
    Ok,
    Bad,
}

/// An asynchronous notification received from the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notify {
    pub channel: String,
    pub payload: String,
    /// Process ID of the notifying backend.
    pub backend_pid: u32,
}

/// Outcome of reading one `COPY` row.
#[derive(Debug)]
pub enum CopyRead {
    /// One row of data, including its line terminator.
    Row(Bytes),
    /// The copy is complete, the final result can be fetched.
    Done,
    /// No data available yet, only possible in nonblocking mode.
    Pending,
    /// The read failed, see [`Driver::error_message`].
    Failed,
}

/// Outcome of sending `COPY` data or the end of copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyPut {
    Sent,
    /// Nothing was sent, only possible in nonblocking mode.
    Pending,
    /// The send failed, see [`Driver::error_message`].
    Failed,
}

/// Low level protocol handle.
///
/// Methods mirror the primitive operations of a postgres client library.
/// Failures are reported in band (a missing result, a `false` return, a `Failed` variant)
/// with the text available from [`error_message`][Driver::error_message].
pub trait Driver {
    /// Handle able to cancel the running command from another thread.
    type Cancel: CancelHandle + Send + 'static;

    fn status(&self) -> ConnStatus;

    /// Raw socket descriptor, `None` when there is no socket.
    fn socket(&self) -> Option<RawFd>;

    fn backend_pid(&self) -> u32;

    fn host(&self) -> &str;

    fn port(&self) -> u16;

    fn dbname(&self) -> &str;

    fn user(&self) -> &str;

    /// Frontend/backend protocol major version, 0 when the connection is bad.
    fn protocol_version(&self) -> i32;

    /// Server version in the `MMmmpp` numeric form, e.g. `160002` for 16.2.
    fn server_version(&self) -> i32;

    /// Text of the most recent failure.
    fn error_message(&self) -> &str;

    /// Install or clear the notice callback.
    fn set_notice_processor(&mut self, processor: Option<NoticeProcessor>);

    /// Start or stop protocol tracing.
    fn trace(&mut self, sink: Option<TraceSink>);

    fn set_verbosity(&mut self, verbosity: ErrorVerbosity);

    /// Run `sql` and wait for its last result.
    fn exec(&mut self, sql: &str) -> Option<RawResult>;

    /// Run `sql` with out of band parameters.
    fn exec_params(&mut self, sql: &str, params: &Params) -> Option<RawResult>;

    /// Create a prepared statement, an empty name selects the unnamed statement.
    fn prepare(&mut self, name: &str, sql: &str) -> Option<RawResult>;

    fn exec_prepared(&mut self, name: &str, params: &Params) -> Option<RawResult>;

    /// Send `sql` without waiting for the results.
    fn send_query(&mut self, sql: &str) -> bool;

    /// Next result of the running command, `None` once every result has been returned.
    fn get_result(&mut self) -> Option<RawResult>;

    /// Read whatever input is available without blocking.
    fn consume_input(&mut self) -> bool;

    /// Returns `true` if [`get_result`][Driver::get_result] would block.
    fn is_busy(&self) -> bool;

    /// Next queued notification.
    fn notifies(&mut self) -> Option<Notify>;

    fn get_copy_data(&mut self) -> CopyRead;

    fn put_copy_data(&mut self, data: &[u8]) -> CopyPut;

    /// Finish a `COPY FROM STDIN`, or abort it when `error` is given.
    fn put_copy_end(&mut self, error: Option<&str>) -> CopyPut;

    /// Escape `text` for a string literal, appending to `out`. Returns `false` on invalid input.
    fn escape_string(&mut self, out: &mut String, text: &str) -> bool;

    /// Escape binary data for a `bytea` literal.
    fn escape_bytea(&mut self, data: &[u8]) -> Option<String>;

    /// Quote an identifier.
    fn escape_identifier(&mut self, ident: &str) -> Option<String>;

    fn cancel_handle(&self) -> Option<Self::Cancel>;
}

/// Request cancellation of the command running on a connection.
pub trait CancelHandle {
    /// Dispatch the cancel request.
    ///
    /// Success only means the request was delivered, the command may still complete.
    fn cancel(&self) -> crate::Result<()>;
}

/// Decides when a [`Driver`] is opened and closed.
///
/// Each method consumes the current handle and returns the new one.
pub trait ConnectionPolicy {
    type Handle: Driver;

    /// Begin connecting, called once on session construction.
    fn do_startconnect(&mut self, orig: Option<Self::Handle>) -> Option<Self::Handle>;

    /// Complete connecting, called on activation.
    fn do_completeconnect(&mut self, orig: Option<Self::Handle>) -> Option<Self::Handle>;

    /// Release the handle.
    fn do_disconnect(&mut self, orig: Option<Self::Handle>) -> Option<Self::Handle> {
        drop(orig);
        None
    }

    /// Returns `true` if the session should activate right after construction.
    fn is_ready(&self, h: Option<&Self::Handle>) -> bool;
}

/// A single statement parameter.
///
/// NULL is distinct from an empty value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Param {
    value: Option<Bytes>,
    format: PgFormat,
}

impl Param {
    pub fn text(value: impl Into<String>) -> Param {
        Self { value: Some(Bytes::from(value.into())), format: PgFormat::Text }
    }

    pub fn binary(value: impl Into<Bytes>) -> Param {
        Self { value: Some(value.into()), format: PgFormat::Binary }
    }

    pub fn null() -> Param {
        Self { value: None, format: PgFormat::Text }
    }

    pub fn value(&self) -> Option<&[u8]> {
        self.value.as_deref()
    }

    pub fn is_null(&self) -> bool {
        self.value.is_none()
    }

    pub fn format(&self) -> PgFormat {
        self.format
    }

    /// Length of the value, -1 for NULL.
    pub fn size(&self) -> i32 {
        match &self.value {
            Some(value) => value.len().try_into().unwrap_or(i32::MAX),
            None => -1,
        }
    }

    pub(crate) fn bind_buf(&self) -> ParamBuf {
        ParamBuf { value: self.value.clone(), size: self.size() }
    }
}

impl From<&str> for Param {
    fn from(value: &str) -> Self {
        Param::text(value)
    }
}

impl From<String> for Param {
    fn from(value: String) -> Self {
        Param::text(value)
    }
}

impl From<&[u8]> for Param {
    fn from(value: &[u8]) -> Self {
        Param::binary(Bytes::copy_from_slice(value))
    }
}

impl From<Vec<u8>> for Param {
    fn from(value: Vec<u8>) -> Self {
        Param::binary(value)
    }
}

impl From<Bytes> for Param {
    fn from(value: Bytes) -> Self {
        Param::binary(value)
    }
}

macro_rules! param_int {
    ($($ty:ty),*) => {$(
        impl From<$ty> for Param {
            fn from(value: $ty) -> Self {
                Param::text(itoa::Buffer::new().format(value))
            }
        }
    )*};
}

param_int!(i16, i32, i64, u16, u32, u64);

impl From<bool> for Param {
    fn from(value: bool) -> Self {
        Param::text(if value { "t" } else { "f" })
    }
}

impl<T: Into<Param>> From<Option<T>> for Param {
    fn from(value: Option<T>) -> Self {
        value.map_or_else(Param::null, Into::into)
    }
}

/// Positional statement parameters, `$1` is the first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Params {
    params: Vec<Param>,
}

impl Params {
    pub fn new() -> Params {
        Self::default()
    }

    pub fn push(&mut self, param: impl Into<Param>) -> &mut Self {
        self.params.push(param.into());
        self
    }

    pub fn push_text(&mut self, value: impl Into<String>) -> &mut Self {
        self.push(Param::text(value))
    }

    pub fn push_binary(&mut self, value: impl Into<Bytes>) -> &mut Self {
        self.push(Param::binary(value))
    }

    pub fn push_null(&mut self) -> &mut Self {
        self.push(Param::null())
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<&Param> {
        self.params.get(idx)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Param> {
        self.params.iter()
    }

    /// Total encoded size of every value including its length prefix.
    pub(crate) fn encoded_len(&self) -> usize {
        self.params.iter().map(|e| 4 + e.value.as_ref().map_or(0, Bytes::len)).sum()
    }
}

impl<T: Into<Param>> FromIterator<T> for Params {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self { params: iter.into_iter().map(Into::into).collect() }
    }
}

impl<'a> IntoIterator for &'a Params {
    type Item = &'a Param;
    type IntoIter = std::slice::Iter<'a, Param>;

    fn into_iter(self) -> Self::IntoIter {
        self.params.iter()
    }
}

/// Build [`Params`] from a list of values.
///
/// ```
/// let params = pgsession::params!["alice", 42, None::<&str>];
/// assert_eq!(params.len(), 3);
/// ```
#[macro_export]
macro_rules! params {
    ($($value:expr),* $(,)?) => {{
        #[allow(unused_mut)]
        let mut params = $crate::Params::new();
        $(params.push($value);)*
        params
    }};
}

/// A parameter value as written into a `Bind` message.
pub(crate) struct ParamBuf {
    value: Option<Bytes>,
    size: i32,
}

impl Buf for ParamBuf {
    fn remaining(&self) -> usize {
        self.value.as_ref().map_or(0, Bytes::len)
    }

    fn chunk(&self) -> &[u8] {
        self.value.as_deref().unwrap_or_default()
    }

    fn advance(&mut self, cnt: usize) {
        if let Some(value) = &mut self.value {
            value.advance(cnt);
        }
    }
}

impl BindParams for ParamBuf {
    fn size(&self) -> i32 {
        self.size
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn null_is_not_empty() {
        let params = crate::params!["", None::<&str>, 7i32, b"\x00\x01".as_slice()];
        assert_eq!(params.len(), 4);
        assert_eq!(params.get(0).unwrap().size(), 0);
        assert!(!params.get(0).unwrap().is_null());
        assert_eq!(params.get(1).unwrap().size(), -1);
        assert!(params.get(1).unwrap().is_null());
        assert_eq!(params.get(2).unwrap().value(), Some(&b"7"[..]));
        assert_eq!(params.get(3).unwrap().format(), PgFormat::Binary);
        assert_eq!(params.encoded_len(), 4 + 4 + 4 + 1 + 4 + 2);
    }
}
