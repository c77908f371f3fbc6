//! Connection policies.
use crate::{config::Config, driver::ConnectionPolicy, wire::PgConn};

/// Connect on construction.
#[derive(Debug, Clone)]
pub struct ConnectDirect {
    config: Config,
}

impl ConnectDirect {
    pub fn new(config: Config) -> ConnectDirect {
        Self { config }
    }
}

impl ConnectionPolicy for ConnectDirect {
    type Handle = PgConn;

    fn do_startconnect(&mut self, orig: Option<PgConn>) -> Option<PgConn> {
        orig.or_else(|| Some(PgConn::connect(&self.config)))
    }

    fn do_completeconnect(&mut self, orig: Option<PgConn>) -> Option<PgConn> {
        orig
    }

    fn is_ready(&self, h: Option<&PgConn>) -> bool {
        h.is_some()
    }
}

/// Defer connecting until the session is first activated.
#[derive(Debug, Clone)]
pub struct ConnectLazy {
    config: Config,
}

impl ConnectLazy {
    pub fn new(config: Config) -> ConnectLazy {
        Self { config }
    }
}

impl ConnectionPolicy for ConnectLazy {
    type Handle = PgConn;

    fn do_startconnect(&mut self, orig: Option<PgConn>) -> Option<PgConn> {
        orig
    }

    fn do_completeconnect(&mut self, orig: Option<PgConn>) -> Option<PgConn> {
        orig.or_else(|| Some(PgConn::connect(&self.config)))
    }

    fn is_ready(&self, _: Option<&PgConn>) -> bool {
        false
    }
}

impl From<Config> for ConnectDirect {
    fn from(config: Config) -> Self {
        Self::new(config)
    }
}

impl From<Config> for ConnectLazy {
    fn from(config: Config) -> Self {
        Self::new(config)
    }
}
