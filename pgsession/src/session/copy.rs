//! Bulk `COPY` transfer.
use std::borrow::Cow;

use super::Session;
use crate::{
    Error, Result,
    driver::{ConnectionPolicy, CopyPut, CopyRead, Driver},
};

const END_COPY: &str = "[END COPY]";

impl<P: ConnectionPolicy> Session<P> {
    /// Read one row of a running `COPY TO STDOUT` into `out`.
    ///
    /// `out` is cleared first and receives the row as sent, including its line terminator.
    /// Returns `false` once the copy is complete, after validating its final result.
    pub fn read_copy_line(&mut self, out: &mut Vec<u8>) -> Result<bool> {
        if !self.is_open() {
            return Err(Error::internal("reading copy data without connection"));
        }
        out.clear();

        let Some(conn) = self.conn.as_mut() else {
            return Err(Error::internal("reading copy data without connection"));
        };

        match conn.get_copy_data() {
            CopyRead::Row(data) => {
                out.extend_from_slice(&data);
                Ok(true)
            }
            CopyRead::Done => {
                while let Some(raw) = self.conn.as_mut().and_then(Driver::get_result) {
                    self.check_result(Some(raw), END_COPY)?;
                }
                Ok(false)
            }
            CopyRead::Failed => Err(Error::sql(
                format!("Reading of table data failed: {}", conn.error_message().trim_end()),
                END_COPY,
            )),
            CopyRead::Pending => Err(Error::internal("table read inexplicably went asynchronous")),
        }
    }

    /// Send one row of a running `COPY FROM STDIN`.
    ///
    /// A newline is appended unless `line` already ends in one. When the row can not be
    /// sent, the copy is aborted before the error is returned.
    pub fn write_copy_line(&mut self, line: impl AsRef<[u8]>) -> Result<()> {
        if !self.is_open() {
            return Err(Error::internal("writing copy data without connection"));
        }
        let Some(conn) = self.conn.as_mut() else {
            return Err(Error::internal("writing copy data without connection"));
        };

        let line = line.as_ref();
        let line: Cow<[u8]> = match line.ends_with(b"\n") {
            true => Cow::Borrowed(line),
            false => {
                let mut owned = Vec::with_capacity(line.len() + 1);
                owned.extend_from_slice(line);
                owned.push(b'\n');
                Cow::Owned(owned)
            }
        };

        if conn.put_copy_data(&line) == CopyPut::Sent {
            return Ok(());
        }

        let msg = format!("Error writing to table: {}", conn.error_message().trim_end());
        // the abort is answered with an error result, keep the handle out of copy state
        if conn.put_copy_end(Some(&msg)) == CopyPut::Sent {
            super::drain_results(conn);
        }
        Err(Error::sql(msg, "[COPY]"))
    }

    /// Finish a `COPY FROM STDIN` and validate its result.
    pub fn end_copy_write(&mut self) -> Result<()> {
        let Some(conn) = self.conn.as_mut() else {
            return Err(Error::internal("ending copy without connection"));
        };

        match conn.put_copy_end(None) {
            CopyPut::Sent => {
                let raw = conn.get_result();
                self.check_result(raw, END_COPY)?;
                Ok(())
            }
            CopyPut::Failed => Err(Error::sql(
                format!("Write to table failed: {}", conn.error_message().trim_end()),
                END_COPY,
            )),
            CopyPut::Pending => Err(Error::internal("table write is inexplicably asynchronous")),
        }
    }
}
