//! Escaping and quoting through the connection.
//!
//! String escaping depends on server settings, so every function here requires a connection.
use super::Session;
use crate::{
    Error, Result,
    driver::{ConnectionPolicy, Driver},
    escape,
};

impl<P: ConnectionPolicy> Session<P> {
    /// Escape `text` for use inside a string literal, without the quotes.
    pub fn esc(&mut self, text: &str) -> Result<String> {
        let Some(conn) = self.conn.as_mut() else {
            return Err(Error::broken("Can't escape string: connection is not active."));
        };

        let mut out = String::with_capacity(2 * text.len() + 1);
        if !conn.escape_string(&mut out, text) {
            return Err(Error::argument(conn.error_message().trim_end()));
        }
        Ok(out)
    }

    /// Quote `text` as a string literal.
    pub fn quote(&mut self, text: &str) -> Result<String> {
        Ok(format!("'{}'", self.esc(text)?))
    }

    /// Escape binary data for use inside a `bytea` literal, without the quotes.
    pub fn esc_raw(&mut self, data: &[u8]) -> Result<String> {
        let Some(conn) = self.conn.as_mut() else {
            return Err(Error::broken("Can't escape raw data: connection is not active."));
        };

        conn.escape_bytea(data)
            .ok_or_else(|| Error::failure(conn.error_message()))
    }

    /// Quote binary data as a `bytea` literal.
    pub fn quote_raw(&mut self, data: &[u8]) -> Result<String> {
        Ok(format!("'{}'::bytea", self.esc_raw(data)?))
    }

    /// Decode the text form of a `bytea` value.
    pub fn unesc_raw(&self, text: &str) -> Result<Vec<u8>> {
        if self.conn.is_none() {
            return Err(Error::broken("Can't unescape raw data: connection is not active."));
        }
        escape::unescape_bytea(text).ok_or_else(|| Error::argument("malformed bytea text"))
    }

    /// Quote `ident` as an identifier.
    pub fn quote_name(&mut self, ident: &str) -> Result<String> {
        let Some(conn) = self.conn.as_mut() else {
            return Err(Error::broken("Can't escape identifier: connection is not active."));
        };

        conn.escape_identifier(ident)
            .ok_or_else(|| Error::failure(conn.error_message()))
    }

    /// Escape `text` for a `LIKE` pattern, prefixing `%` and `_` with `escape_char`.
    pub fn esc_like(&self, text: &str, escape_char: char) -> Result<String> {
        if self.conn.is_none() {
            return Err(Error::broken("Can't escape LIKE pattern: connection is not active."));
        }
        Ok(escape::escape_like(text, escape_char))
    }
}
