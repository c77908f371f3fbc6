//! Query execution.
use super::Session;
use crate::{
    Error, Result,
    common::span,
    driver::{CancelHandle, ConnectionPolicy, Driver, Params},
    error::SqlError,
    result::{QueryResult, RawResult},
};

impl<P: ConnectionPolicy> Session<P> {
    /// Turn what the driver returned into a usable result.
    ///
    /// A result is only usable from an open session, and when it is present and not an error.
    pub(crate) fn check_result(&self, raw: Option<RawResult>, query: &str) -> Result<QueryResult> {
        if !self.is_open() {
            return Err(Error::broken("Connection to database failed."));
        }

        let Some(raw) = raw else {
            return Err(Error::failure(self.err_msg()));
        };

        if raw.status.is_error() {
            let RawResult { error_message, sqlstate, .. } = raw;
            return Err(SqlError::new(error_message, query.to_owned(), sqlstate).into());
        }

        Ok(QueryResult::new(raw, query))
    }

    fn conn_for_exec(&mut self) -> Result<&mut P::Handle> {
        self.conn
            .as_mut()
            .ok_or_else(|| Error::broken("Could not execute query: connection is inactive."))
    }

    /// Execute without delivering notifications afterwards.
    pub(super) fn exec_unchecked(&mut self, sql: &str) -> Result<QueryResult> {
        let raw = self.conn_for_exec()?.exec(sql);
        self.check_result(raw, sql)
    }

    /// Execute `sql` and wait for its result.
    ///
    /// Queued notifications are delivered before returning.
    pub fn exec(&mut self, sql: &str) -> Result<QueryResult> {
        span!("exec");
        let result = self.exec_unchecked(sql)?;
        self.get_notifs()?;
        Ok(result)
    }

    /// Execute `sql` with out of band parameters.
    ///
    /// ```no_run
    /// # fn main() -> pgsession::Result<()> {
    /// let mut session = pgsession::Session::connect_env()?;
    /// let result = session.exec_params("SELECT $1::int + 1", &pgsession::params![41])?;
    /// assert_eq!(result.text(0, 0)?, Some("42"));
    /// # Ok(())
    /// # }
    /// ```
    pub fn exec_params(&mut self, sql: &str, params: &Params) -> Result<QueryResult> {
        span!("exec_params", params = params.len());
        let raw = self.conn_for_exec()?.exec_params(sql, params);
        let result = self.check_result(raw, sql)?;
        self.get_notifs()?;
        Ok(result)
    }

    /// Execute the prepared statement `name`.
    pub fn exec_prepared(&mut self, name: &str, params: &Params) -> Result<QueryResult> {
        span!("exec_prepared", statement = name);
        let raw = self.conn_for_exec()?.exec_prepared(name, params);
        let result = self.check_result(raw, name)?;
        self.get_notifs()?;
        Ok(result)
    }

    /// Create the server side prepared statement `name`.
    pub fn prepare(&mut self, name: &str, sql: &str) -> Result<()> {
        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| Error::broken("Could not prepare statement: connection is inactive."))?;
        let raw = conn.prepare(name, sql);
        self.check_result(raw, &format!("[PREPARE {name}]"))?;
        Ok(())
    }

    /// Create the unnamed prepared statement.
    pub fn prepare_unnamed(&mut self, sql: &str) -> Result<()> {
        self.prepare("", sql)
    }

    /// Drop the prepared statement `name`.
    pub fn unprepare(&mut self, name: &str) -> Result<()> {
        let query = format!("DEALLOCATE {}", self.quote_name(name)?);
        self.exec(&query)?;
        Ok(())
    }

    /// Send `sql` without waiting, fetch its results with [`get_result`][Session::get_result].
    pub fn start_exec(&mut self, sql: &str) -> Result<()> {
        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| Error::broken("Can't execute query: connection is inactive."))?;
        if !conn.send_query(sql) {
            return Err(Error::sql(conn.error_message().trim_end(), sql));
        }
        self.pending_query = Some(sql.to_owned());
        Ok(())
    }

    /// Next raw result of a command started with [`start_exec`][Session::start_exec].
    pub fn get_result(&mut self) -> Result<Option<RawResult>> {
        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| Error::broken("Connection to database failed."))?;
        Ok(conn.get_result())
    }

    /// Next validated result of a command started with [`start_exec`][Session::start_exec].
    pub fn get_result_checked(&mut self) -> Result<Option<QueryResult>> {
        let Some(raw) = self.get_result()? else {
            self.pending_query = None;
            return Ok(None);
        };
        let query = self.pending_query.clone().unwrap_or_default();
        self.check_result(Some(raw), &query).map(Some)
    }

    /// Returns `true` if fetching the next result would block.
    pub fn is_busy(&self) -> bool {
        self.conn.as_ref().is_some_and(Driver::is_busy)
    }

    /// Ask the server to cancel the running command.
    ///
    /// Success only means the request was delivered.
    pub fn cancel_query(&self) -> Result<()> {
        let Some(handle) = self.cancel_handle() else {
            return Ok(());
        };
        handle
            .cancel()
            .map_err(|err| SqlError::new(err.kind().to_string(), String::new(), None).into())
    }

    /// Owned handle able to cancel commands from another thread.
    pub fn cancel_handle(&self) -> Option<<P::Handle as Driver>::Cancel> {
        self.conn.as_ref().and_then(Driver::cancel_handle)
    }
}
