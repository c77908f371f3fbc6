//! Startup phase.
//!
//! <https://www.postgresql.org/docs/17/protocol-flow.html#PROTOCOL-FLOW-START-UP>
use std::{
    collections::HashMap,
    fmt,
    io::{Read, Write},
};

use super::stream::PgStream;
use crate::{
    Error, Result,
    common::log_warn,
    config::Config,
    postgres::{BackendMessage, DatabaseError, ErrorVerbosity, ProtocolError, backend, frontend},
};

/// Startup phase successful response.
pub(crate) struct StartupResponse {
    pub backend_key_data: Option<backend::BackendKeyData>,
    pub param_status: HashMap<String, String>,
}

/// Perform the startup handshake on a freshly opened stream.
pub(crate) fn startup<S: Read + Write>(config: &Config, stream: &mut PgStream<S>) -> Result<StartupResponse> {
    stream.send_startup(frontend::Startup {
        user: &config.user,
        database: Some(&config.dbname),
        application_name: config.application_name.as_deref(),
    });
    stream.flush()?;

    loop {
        use backend::Authentication::*;
        match stream.recv()? {
            BackendMessage::Authentication(Ok) => break,
            BackendMessage::Authentication(CleartextPassword) => {
                stream.send(frontend::PasswordMessage { password: &config.pass });
                stream.flush()?;
            },
            BackendMessage::Authentication(method) => Err(UnsupportedAuth { method: method.method_name() })?,
            BackendMessage::ErrorResponse(err) => return Err(server_error(err.body)?),
            BackendMessage::NegotiateProtocolVersion(_) => { },
            f => Err(ProtocolError::unexpected_phase(f.msgtype(), "authentication"))?,
        }
    }

    let mut param_status = HashMap::new();
    let mut backend_key_data = None;

    loop {
        use BackendMessage::*;
        match stream.recv()? {
            ReadyForQuery(_) => break,
            BackendKeyData(key_data) => backend_key_data = Some(key_data),
            ParameterStatus(param) => {
                param_status.insert(param.name, param.value);
            },
            NoticeResponse(notice) => {
                let _notice = DatabaseError::decode(notice.body)?;
                log_warn!("{}", _notice.format(ErrorVerbosity::Default).trim_end());
            },
            ErrorResponse(err) => return Err(server_error(err.body)?),
            NegotiateProtocolVersion(_) => { },
            f => Err(ProtocolError::unexpected_phase(f.msgtype(), "startup phase"))?,
        }
    }

    Ok(StartupResponse { backend_key_data, param_status })
}

fn server_error(body: bytes::Bytes) -> Result<Error> {
    let err = DatabaseError::decode(body)?;
    Ok(Error::failure(err.format(ErrorVerbosity::Default)))
}

/// The server asked for an authentication method this crate does not implement.
pub struct UnsupportedAuth {
    method: &'static str,
}

impl UnsupportedAuth {
    /// Name of the requested method.
    pub fn method(&self) -> &str {
        self.method
    }
}

impl std::error::Error for UnsupportedAuth { }

impl fmt::Display for UnsupportedAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unsupported authentication method: {}", self.method)
    }
}

impl fmt::Debug for UnsupportedAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}
