use std::io::Read;

use super::stream::PgStream;
use crate::{Result, common::verbose, config::Config, driver::CancelHandle, postgres::frontend};

/// Cancel request for the command running on a [`PgConn`][super::PgConn].
///
/// Owns everything it needs, so it can be moved to another thread.
#[derive(Debug, Clone)]
pub struct PgCancel {
    config: Config,
    process_id: u32,
    secret_key: u32,
}

impl PgCancel {
    pub(crate) fn new(config: Config, process_id: u32, secret_key: u32) -> PgCancel {
        Self { config, process_id, secret_key }
    }
}

impl CancelHandle for PgCancel {
    fn cancel(&self) -> Result<()> {
        verbose!(process_id = self.process_id, "cancel request");
        let mut stream = PgStream::connect(&self.config)?;
        stream.send_cancel(frontend::CancelRequest {
            process_id: self.process_id,
            secret_key: self.secret_key,
        });
        stream.flush()?;

        // the server closes the connection once the request is processed
        let mut buf = [0u8; 64];
        while stream.socket_mut().read(&mut buf)? > 0 { }
        Ok(())
    }
}
