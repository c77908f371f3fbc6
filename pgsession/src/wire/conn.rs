use std::{
    collections::{HashMap, VecDeque},
    os::fd::RawFd,
};

use super::{
    PgCancel,
    startup::{self, StartupResponse},
    stream::{PgStream, Socket, Transport},
};
use crate::{
    Result,
    common::{log_warn, span, verbose},
    config::Config,
    driver::{
        ConnStatus, CopyPut, CopyRead, Driver, ErrorVerbosity, NoticeProcessor, Notify, Params,
        Param, TraceSink,
    },
    escape,
    ext::UsizeExt,
    postgres::{BackendMessage, DatabaseError, PgFormat, ProtocolError, frontend},
    result::{Column, ExecStatus, RawResult},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Busy,
    CopyIn,
    CopyOut,
}

/// Blocking postgres connection implementing [`Driver`].
///
/// A failed connection attempt still produces a `PgConn`, in [`ConnStatus::Bad`]
/// with the reason in [`error_message`][Driver::error_message].
pub struct PgConn<S: Transport = Socket> {
    stream: Option<PgStream<S>>,
    config: Config,
    phase: Phase,
    error_message: String,
    params: HashMap<String, String>,
    key_data: Option<(u32, u32)>,
    server_version: i32,
    notifies: VecDeque<Notify>,
    notice_processor: Option<NoticeProcessor>,
    verbosity: ErrorVerbosity,
    /// Result being assembled from row messages.
    current: Option<RawResult>,
    /// Result to hand out before reading further.
    stashed: Option<RawResult>,
    prepare_only: bool,
}

impl PgConn {
    /// Connect and authenticate.
    pub fn connect(config: &Config) -> PgConn {
        span!("connect", host = %config.host, port = config.port);
        match PgStream::connect(config) {
            Ok(stream) => PgConn::startup(config.clone(), stream),
            Err(err) => PgConn::failed(config.clone(), format!("could not connect to server: {err}\n")),
        }
    }
}

impl<S: Transport> PgConn<S> {
    /// Run the startup handshake over an already opened stream.
    pub(crate) fn startup(config: Config, mut stream: PgStream<S>) -> PgConn<S> {
        match startup::startup(&config, &mut stream) {
            Ok(StartupResponse { backend_key_data, param_status }) => {
                let server_version = param_status
                    .get("server_version")
                    .map_or(0, |e| parse_server_version(e));
                verbose!(server_version, "connected");
                PgConn {
                    stream: Some(stream),
                    config,
                    phase: Phase::Idle,
                    error_message: String::new(),
                    params: param_status,
                    key_data: backend_key_data.map(|e| (e.process_id, e.secret_key)),
                    server_version,
                    notifies: VecDeque::new(),
                    notice_processor: None,
                    verbosity: ErrorVerbosity::Default,
                    current: None,
                    stashed: None,
                    prepare_only: false,
                }
            },
            Err(err) => {
                let mut message = err.kind().to_string();
                if !message.ends_with('\n') {
                    message.push('\n');
                }
                PgConn::failed(config, message)
            },
        }
    }

    fn failed(config: Config, error_message: String) -> PgConn<S> {
        PgConn {
            stream: None,
            config,
            phase: Phase::Idle,
            error_message,
            params: HashMap::new(),
            key_data: None,
            server_version: 0,
            notifies: VecDeque::new(),
            notice_processor: None,
            verbosity: ErrorVerbosity::Default,
            current: None,
            stashed: None,
            prepare_only: false,
        }
    }

    /// Value of a server reported run-time parameter.
    pub fn parameter_status(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    fn standard_conforming_strings(&self) -> bool {
        self.parameter_status("standard_conforming_strings") != Some("off")
    }

    /// Drop the socket and remember why, the handle stays [`ConnStatus::Bad`] from now on.
    fn fail(&mut self, err: crate::Error) -> RawResult {
        log_warn!("connection lost: {err}");
        let mut message = err.kind().to_string();
        message.push('\n');
        self.stream = None;
        self.phase = Phase::Idle;
        self.current = None;
        self.stashed = None;
        self.error_message = message.clone();
        RawResult::error(message, None)
    }

    /// Check that a new command can be sent.
    fn begin(&mut self) -> bool {
        if self.stream.is_none() {
            self.error_message = "no connection to the server\n".into();
            return false;
        }
        if self.phase != Phase::Idle {
            self.error_message = "another command is already in progress\n".into();
            return false;
        }
        self.error_message.clear();
        if let Err(err) = self.drain_async() {
            self.fail(err);
            return false;
        }
        true
    }

    /// Discard results nobody fetched, then check that a new command can be sent.
    fn exec_start(&mut self) -> bool {
        while self.phase == Phase::Busy || self.stashed.is_some() {
            if self.get_result().is_none() {
                break;
            }
        }
        self.begin()
    }

    fn send_simple(&mut self, sql: &str) -> bool {
        let Some(stream) = self.stream.as_mut() else {
            return false;
        };
        stream.send(frontend::Query { sql });
        self.flush_busy()
    }

    fn flush_busy(&mut self) -> bool {
        let Some(stream) = self.stream.as_mut() else {
            return false;
        };
        if let Err(err) = stream.flush() {
            self.fail(err.into());
            return false;
        }
        self.phase = Phase::Busy;
        true
    }

    fn notice(&mut self, body: bytes::Bytes) -> Result<()> {
        let text = DatabaseError::decode(body)?.format(self.verbosity);
        match self.notice_processor.as_mut() {
            Some(processor) => processor(&text),
            None => {
                log_warn!("{}", text.trim_end());
            },
        }
        Ok(())
    }

    /// Consume notices, notifications and parameter reports, any other message is returned.
    fn handle_async(&mut self, message: BackendMessage) -> Result<Option<BackendMessage>> {
        match message {
            BackendMessage::NoticeResponse(notice) => self.notice(notice.body)?,
            BackendMessage::NotificationResponse(n) => self.notifies.push_back(Notify {
                channel: n.channel,
                payload: n.payload,
                backend_pid: n.process_id,
            }),
            BackendMessage::ParameterStatus(param) => {
                self.params.insert(param.name, param.value);
            },
            message => return Ok(Some(message)),
        }
        Ok(None)
    }

    /// Receive the next message that is not asynchronous.
    fn recv_message(&mut self) -> Result<BackendMessage> {
        loop {
            let Some(stream) = self.stream.as_mut() else {
                return Err(crate::Error::broken("no connection to the server"));
            };
            let message = stream.recv()?;
            if let Some(message) = self.handle_async(message)? {
                return Ok(message);
            }
        }
    }

    /// Process asynchronous messages already buffered while idle, never blocks.
    fn drain_async(&mut self) -> Result<()> {
        loop {
            let Some(stream) = self.stream.as_mut() else {
                return Ok(());
            };
            let Some(message) = stream.try_recv::<BackendMessage>()? else {
                return Ok(());
            };
            match self.handle_async(message)? {
                None | Some(BackendMessage::ReadyForQuery(_)) => { },
                Some(f) => Err(ProtocolError::unexpected_phase(f.msgtype(), "idle"))?,
            }
        }
    }

    fn next_result(&mut self) -> Result<Option<RawResult>> {
        use BackendMessage::*;
        loop {
            match self.recv_message()? {
                RowDescription(desc) => {
                    let mut result = RawResult::new(ExecStatus::TuplesOk);
                    result.columns = desc
                        .fields
                        .into_iter()
                        .map(|e| Column { name: e.name, type_oid: e.type_oid, format: e.format })
                        .collect();
                    self.current = Some(result);
                },
                DataRow(row) => {
                    self.current
                        .get_or_insert_with(|| RawResult::new(ExecStatus::TuplesOk))
                        .rows
                        .push(row.values);
                },
                CommandComplete(cmd) => {
                    let mut result = self.current.take().unwrap_or_else(|| RawResult::new(ExecStatus::CommandOk));
                    result.command_tag = cmd.tag;
                    return Ok(Some(result));
                },
                EmptyQueryResponse(_) => return Ok(Some(RawResult::new(ExecStatus::EmptyQuery))),
                ErrorResponse(err) => {
                    self.current = None;
                    let err = DatabaseError::decode(err.body)?;
                    let message = err.format(self.verbosity);
                    self.error_message.clone_from(&message);
                    return Ok(Some(RawResult::error(message, Some(err.code))));
                },
                CopyInResponse(_) => {
                    self.phase = Phase::CopyIn;
                    return Ok(Some(RawResult::new(ExecStatus::CopyIn)));
                },
                CopyOutResponse(_) => {
                    self.phase = Phase::CopyOut;
                    return Ok(Some(RawResult::new(ExecStatus::CopyOut)));
                },
                ParseComplete(_) if self.prepare_only => return Ok(Some(RawResult::new(ExecStatus::CommandOk))),
                ParseComplete(_) | BindComplete(_) | CloseComplete(_) | NoData(_)
                    | ParameterDescription(_) | PortalSuspended(_) => { },
                ReadyForQuery(_) => {
                    self.phase = Phase::Idle;
                    self.prepare_only = false;
                    return Ok(None);
                },
                f => Err(ProtocolError::unexpected_phase(f.msgtype(), "query"))?,
            }
        }
    }

    /// Collect every result of the running command, keeping the last one.
    ///
    /// An error result is kept over later successful ones, `COPY` results stop collection.
    fn last_result(&mut self) -> Option<RawResult> {
        let mut last: Option<RawResult> = None;
        while let Some(result) = self.get_result() {
            let stop = matches!(result.status, ExecStatus::CopyIn | ExecStatus::CopyOut);
            if !last.as_ref().is_some_and(|e| e.status.is_error()) || stop {
                last = Some(result);
            }
            if stop || self.stream.is_none() {
                break;
            }
        }
        last
    }

    fn send_extended(&mut self, stmt_name: &str, sql: Option<&str>, params: &Params) -> bool {
        if params.len() > u16::MAX as usize {
            self.error_message = format!("number of parameters must be at most {}\n", u16::MAX);
            return false;
        }
        let Some(stream) = self.stream.as_mut() else {
            return false;
        };
        if let Some(sql) = sql {
            stream.send(frontend::Parse { prepare_name: stmt_name, sql, oids_len: 0, oids: [] });
        }
        stream.send(frontend::Bind {
            portal_name: "",
            stmt_name,
            param_formats_len: params.len().to_u16(),
            param_formats: params.iter().map(Param::format),
            params_len: params.len().to_u16(),
            params_size_hint: params.encoded_len().to_u32(),
            params: params.iter().map(Param::bind_buf),
            result_format: PgFormat::Text,
        });
        stream.send(frontend::Describe { kind: b'P', name: "" });
        stream.send(frontend::Execute { portal_name: "", max_row: 0 });
        stream.send(frontend::Sync);
        self.flush_busy()
    }
}

impl<S: Transport> Driver for PgConn<S> {
    type Cancel = PgCancel;

    fn status(&self) -> ConnStatus {
        match self.stream {
            Some(_) => ConnStatus::Ok,
            None => ConnStatus::Bad,
        }
    }

    fn socket(&self) -> Option<RawFd> {
        self.stream.as_ref().map(|e| e.socket().as_raw_fd())
    }

    fn backend_pid(&self) -> u32 {
        self.key_data.map_or(0, |e| e.0)
    }

    fn host(&self) -> &str {
        self.config.socket.as_deref().unwrap_or(&self.config.host)
    }

    fn port(&self) -> u16 {
        self.config.port
    }

    fn dbname(&self) -> &str {
        &self.config.dbname
    }

    fn user(&self) -> &str {
        &self.config.user
    }

    fn protocol_version(&self) -> i32 {
        match self.stream {
            Some(_) => 3,
            None => 0,
        }
    }

    fn server_version(&self) -> i32 {
        self.server_version
    }

    fn error_message(&self) -> &str {
        &self.error_message
    }

    fn set_notice_processor(&mut self, processor: Option<NoticeProcessor>) {
        self.notice_processor = processor;
    }

    fn trace(&mut self, sink: Option<TraceSink>) {
        if let Some(stream) = self.stream.as_mut() {
            stream.set_trace(sink);
        }
    }

    fn set_verbosity(&mut self, verbosity: ErrorVerbosity) {
        self.verbosity = verbosity;
    }

    fn exec(&mut self, sql: &str) -> Option<RawResult> {
        span!("exec", sql);
        if !self.exec_start() || !self.send_simple(sql) {
            return None;
        }
        self.last_result()
    }

    fn exec_params(&mut self, sql: &str, params: &Params) -> Option<RawResult> {
        span!("exec_params", sql, params = params.len());
        if !self.exec_start() || !self.send_extended("", Some(sql), params) {
            return None;
        }
        self.last_result()
    }

    fn prepare(&mut self, name: &str, sql: &str) -> Option<RawResult> {
        span!("prepare", statement = name, sql);
        if !self.exec_start() {
            return None;
        }
        let Some(stream) = self.stream.as_mut() else {
            return None;
        };
        stream.send(frontend::Parse { prepare_name: name, sql, oids_len: 0, oids: [] });
        stream.send(frontend::Sync);
        if !self.flush_busy() {
            return None;
        }
        self.prepare_only = true;
        self.last_result()
    }

    fn exec_prepared(&mut self, name: &str, params: &Params) -> Option<RawResult> {
        span!("exec_prepared", statement = name, params = params.len());
        if !self.exec_start() || !self.send_extended(name, None, params) {
            return None;
        }
        self.last_result()
    }

    fn send_query(&mut self, sql: &str) -> bool {
        self.begin() && self.send_simple(sql)
    }

    fn get_result(&mut self) -> Option<RawResult> {
        if let Some(stashed) = self.stashed.take() {
            return Some(stashed);
        }
        match self.phase {
            Phase::Idle => None,
            Phase::CopyIn => Some(RawResult::new(ExecStatus::CopyIn)),
            Phase::CopyOut => Some(RawResult::new(ExecStatus::CopyOut)),
            Phase::Busy => match self.next_result() {
                Ok(result) => result,
                Err(err) => Some(self.fail(err)),
            },
        }
    }

    fn consume_input(&mut self) -> bool {
        let Some(stream) = self.stream.as_mut() else {
            self.error_message = "no connection to the server\n".into();
            return false;
        };
        if let Err(err) = stream.fill_nonblocking() {
            self.fail(err);
            return false;
        }
        if self.phase == Phase::Idle {
            if let Err(err) = self.drain_async() {
                self.fail(err);
                return false;
            }
        }
        true
    }

    fn is_busy(&self) -> bool {
        self.phase == Phase::Busy
            && self.stashed.is_none()
            && !self.stream.as_ref().is_some_and(PgStream::has_message)
    }

    fn notifies(&mut self) -> Option<Notify> {
        self.notifies.pop_front()
    }

    fn get_copy_data(&mut self) -> CopyRead {
        if self.phase != Phase::CopyOut {
            self.error_message = "no COPY in progress\n".into();
            return CopyRead::Failed;
        }
        loop {
            match self.recv_message() {
                Ok(BackendMessage::CopyData(data)) => return CopyRead::Row(data.data),
                Ok(BackendMessage::CopyDone(_)) => {
                    self.phase = Phase::Busy;
                    return CopyRead::Done;
                },
                Ok(BackendMessage::ErrorResponse(err)) => {
                    // the failure is reported by the following get_result
                    self.phase = Phase::Busy;
                    match DatabaseError::decode(err.body) {
                        Ok(err) => {
                            let message = err.format(self.verbosity);
                            self.error_message.clone_from(&message);
                            self.stashed = Some(RawResult::error(message, Some(err.code)));
                        },
                        Err(err) => {
                            self.fail(err.into());
                            return CopyRead::Failed;
                        },
                    }
                    return CopyRead::Done;
                },
                Ok(f) => {
                    self.fail(ProtocolError::unexpected_phase(f.msgtype(), "copy out").into());
                    return CopyRead::Failed;
                },
                Err(err) => {
                    self.fail(err);
                    return CopyRead::Failed;
                },
            }
        }
    }

    fn put_copy_data(&mut self, data: &[u8]) -> CopyPut {
        if self.phase != Phase::CopyIn {
            self.error_message = "no COPY in progress\n".into();
            return CopyPut::Failed;
        }
        let Some(stream) = self.stream.as_mut() else {
            return CopyPut::Failed;
        };
        stream.send(frontend::CopyData { data });
        match stream.flush() {
            Ok(()) => CopyPut::Sent,
            Err(err) => {
                self.fail(err.into());
                CopyPut::Failed
            },
        }
    }

    fn put_copy_end(&mut self, error: Option<&str>) -> CopyPut {
        if self.phase != Phase::CopyIn {
            self.error_message = "no COPY in progress\n".into();
            return CopyPut::Failed;
        }
        let Some(stream) = self.stream.as_mut() else {
            return CopyPut::Failed;
        };
        match error {
            Some(message) => stream.send(frontend::CopyFail { message }),
            None => stream.send(frontend::CopyDone),
        }
        match self.flush_busy() {
            true => CopyPut::Sent,
            false => CopyPut::Failed,
        }
    }

    fn escape_string(&mut self, out: &mut String, text: &str) -> bool {
        let ok = escape::escape_string(out, text, self.standard_conforming_strings());
        if !ok {
            self.error_message = "string contains a zero byte\n".into();
        }
        ok
    }

    fn escape_bytea(&mut self, data: &[u8]) -> Option<String> {
        Some(escape::escape_bytea(data, self.standard_conforming_strings()))
    }

    fn escape_identifier(&mut self, ident: &str) -> Option<String> {
        let quoted = escape::escape_identifier(ident);
        if quoted.is_none() {
            self.error_message = "identifier contains a zero byte\n".into();
        }
        quoted
    }

    fn cancel_handle(&self) -> Option<PgCancel> {
        self.stream.as_ref()?;
        let (process_id, secret_key) = self.key_data?;
        Some(PgCancel::new(self.config.clone(), process_id, secret_key))
    }
}

impl<S: Transport> Drop for PgConn<S> {
    fn drop(&mut self) {
        if let Some(stream) = self.stream.as_mut() {
            stream.send(frontend::Terminate);
            // the socket is closed right after, nothing to report to
            let _ = stream.flush();
        }
    }
}

/// Convert a `server_version` report into its numeric form.
///
/// Since 10 the form is `major * 10000 + minor`, before that `major * 10000 + minor * 100 + patch`.
pub(crate) fn parse_server_version(version: &str) -> i32 {
    let numeric = version
        .split(|e: char| !e.is_ascii_digit() && e != '.')
        .next()
        .unwrap_or_default();
    let mut parts = numeric.split('.').map(|e| e.parse::<i32>().ok());
    let major = match parts.next().flatten() {
        Some(major) => major,
        None => return 0,
    };
    let minor = parts.next().flatten().unwrap_or(0);
    let patch = parts.next().flatten().unwrap_or(0);
    if major >= 10 {
        major * 10000 + minor
    } else {
        major * 10000 + minor * 100 + patch
    }
}

#[cfg(test)]
mod test {
    use std::{
        cell::{Cell, RefCell},
        collections::VecDeque,
        io::{self, Read, Write},
        os::fd::AsRawFd,
        rc::Rc,
    };

    use super::*;
    use crate::params;

    /// In memory socket playing the server.
    ///
    /// Each scripted reply is released once the frontend sent a message the server
    /// answers: the startup packet, `Query`, `Sync`, `CopyDone` or `CopyFail`.
    struct Pipe {
        input: VecDeque<u8>,
        replies: VecDeque<Vec<u8>>,
        output: Rc<RefCell<Vec<u8>>>,
        scanned: usize,
        started: bool,
        nonblocking: Cell<bool>,
    }

    impl Pipe {
        fn release(&mut self) {
            let output = self.output.borrow();
            loop {
                let rest = &output[self.scanned..];
                // the startup packet has no type byte
                let (msgtype, header) = match self.started {
                    false => (None, 0),
                    true => (rest.first().copied(), 1),
                };
                let Some(len) = rest.get(header..header + 4) else {
                    break;
                };
                let len = u32::from_be_bytes([len[0], len[1], len[2], len[3]]) as usize;
                if rest.len() < header + len {
                    break;
                }
                self.scanned += header + len;
                self.started = true;
                if matches!(msgtype, None | Some(b'Q' | b'S' | b'c' | b'f')) {
                    if let Some(reply) = self.replies.pop_front() {
                        self.input.extend(reply);
                    }
                }
            }
        }
    }

    impl Read for Pipe {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.input.is_empty() && self.nonblocking.get() {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            self.input.read(buf)
        }
    }

    impl Write for Pipe {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.output.borrow_mut().extend_from_slice(buf);
            self.release();
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl AsRawFd for Pipe {
        fn as_raw_fd(&self) -> RawFd {
            -1
        }
    }

    impl Transport for Pipe {
        fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
            self.nonblocking.set(nonblocking);
            Ok(())
        }
    }

    fn msg(msgtype: u8, body: &[u8]) -> Vec<u8> {
        let mut out = vec![msgtype];
        out.extend_from_slice(&(body.len() as u32 + 4).to_be_bytes());
        out.extend_from_slice(body);
        out
    }

    fn handshake() -> Vec<u8> {
        [
            msg(b'R', &0u32.to_be_bytes()),
            msg(b'S', b"server_version\x0016.2\0"),
            msg(b'S', b"standard_conforming_strings\0on\0"),
            msg(b'K', b"\0\0\0\x07\0\0\0\x09"),
            msg(b'Z', b"I"),
        ]
        .concat()
    }

    /// Connect over a [`Pipe`], each element of `replies` answers one request.
    fn conn(replies: &[Vec<u8>]) -> (PgConn<Pipe>, Rc<RefCell<Vec<u8>>>) {
        let mut script = VecDeque::from([handshake()]);
        script.extend(replies.iter().cloned());
        let output = Rc::new(RefCell::new(vec![]));
        let pipe = Pipe {
            input: VecDeque::new(),
            replies: script,
            output: output.clone(),
            scanned: 0,
            started: false,
            nonblocking: Cell::new(false),
        };
        let config = Config::parse("postgres://app:pw@localhost:5432/main").unwrap();
        (PgConn::startup(config, PgStream::new(pipe)), output)
    }

    #[test]
    fn connected_metadata() {
        let (conn, _) = conn(&[]);
        assert_eq!(conn.status(), ConnStatus::Ok);
        assert_eq!(conn.server_version(), 160002);
        assert_eq!(conn.protocol_version(), 3);
        assert_eq!(conn.backend_pid(), 7);
        assert_eq!(conn.dbname(), "main");
    }

    #[test]
    fn simple_query_rows() {
        let (mut conn, output) = conn(&[[
            msg(b'T', b"\0\x01n\0\0\0\0\0\0\0\0\0\0\x17\0\x04\xff\xff\xff\xff\0\0"),
            msg(b'D', b"\0\x01\0\0\0\x0242"),
            msg(b'C', b"SELECT 1\0"),
            msg(b'Z', b"I"),
        ].concat()]);
        let result = conn.exec("SELECT 42 AS n").unwrap();
        assert_eq!(result.status, ExecStatus::TuplesOk);
        assert_eq!(result.columns[0].name, "n");
        assert_eq!(result.columns[0].type_oid, 23);
        assert_eq!(result.rows[0][0].as_deref(), Some(&b"42"[..]));
        assert_eq!(result.command_tag, "SELECT 1");
        assert_eq!(frames(&output.borrow())[0].0, b'Q');
        assert!(conn.get_result().is_none());
    }

    #[test]
    fn error_kept_over_later_results() {
        let (mut conn, _) = conn(&[[
            msg(b'E', b"SERROR\0C42601\0Msyntax error\0\0"),
            msg(b'Z', b"I"),
        ].concat()]);
        let result = conn.exec("SELEC").unwrap();
        assert_eq!(result.status, ExecStatus::FatalError);
        assert_eq!(result.sqlstate.as_deref(), Some("42601"));
        assert_eq!(result.error_message, "ERROR:  syntax error\n");
        assert_eq!(conn.error_message(), "ERROR:  syntax error\n");
        assert_eq!(conn.status(), ConnStatus::Ok);
    }

    #[test]
    fn async_messages_intercepted() {
        let (mut conn, _) = conn(&[[
            msg(b'N', b"SNOTICE\0Mhello\0\0"),
            msg(b'A', b"\0\0\0\x09chan\0payload\0"),
            msg(b'C', b"LISTEN\0"),
            msg(b'Z', b"I"),
        ].concat()]);
        let seen = Rc::new(RefCell::new(vec![]));
        let sink = seen.clone();
        conn.set_notice_processor(Some(Box::new(move |e: &str| sink.borrow_mut().push(e.to_owned()))));

        let result = conn.exec("LISTEN chan").unwrap();
        assert_eq!(result.status, ExecStatus::CommandOk);
        assert_eq!(*seen.borrow(), vec!["NOTICE:  hello\n".to_owned()]);
        let notify = conn.notifies().unwrap();
        assert_eq!(notify.channel, "chan");
        assert_eq!(notify.payload, "payload");
        assert_eq!(notify.backend_pid, 9);
        assert!(conn.notifies().is_none());
    }

    #[test]
    fn extended_query_params() {
        let (mut conn, output) = conn(&[[
            msg(b'1', b""),
            msg(b'2', b""),
            msg(b'n', b""),
            msg(b'C', b"INSERT 0 1\0"),
            msg(b'Z', b"I"),
        ].concat()]);
        let result = conn.exec_params("INSERT INTO t VALUES ($1, $2)", &params!["a", None::<&str>]).unwrap();
        assert_eq!(result.command_tag, "INSERT 0 1");

        let output = output.borrow();
        let types: Vec<u8> = frames(&output).into_iter().map(|e| e.0).collect();
        assert_eq!(types, b"PBDES");
    }

    #[test]
    fn prepare_only_parse() {
        let (mut conn, _) = conn(&[[msg(b'1', b""), msg(b'Z', b"I")].concat()]);
        let result = conn.prepare("stmt", "SELECT $1").unwrap();
        assert_eq!(result.status, ExecStatus::CommandOk);
        assert!(conn.get_result().is_none());
    }

    #[test]
    fn copy_out() {
        let (mut conn, _) = conn(&[[
            msg(b'H', b"\0\0\x01\0\0"),
            msg(b'd', b"1\tone\n"),
            msg(b'c', b""),
            msg(b'C', b"COPY 1\0"),
            msg(b'Z', b"I"),
        ].concat()]);
        assert_eq!(conn.exec("COPY t TO STDOUT").unwrap().status, ExecStatus::CopyOut);
        let CopyRead::Row(row) = conn.get_copy_data() else { panic!("expected row") };
        assert_eq!(&row[..], b"1\tone\n");
        assert!(matches!(conn.get_copy_data(), CopyRead::Done));
        assert_eq!(conn.get_result().unwrap().command_tag, "COPY 1");
        assert!(conn.get_result().is_none());
    }

    #[test]
    fn copy_in() {
        let (mut conn, output) = conn(&[
            msg(b'G', b"\0\0\x01\0\0"),
            [msg(b'C', b"COPY 1\0"), msg(b'Z', b"I")].concat(),
        ]);
        assert_eq!(conn.exec("COPY t FROM STDIN").unwrap().status, ExecStatus::CopyIn);
        assert_eq!(conn.put_copy_data(b"1\n"), CopyPut::Sent);
        assert_eq!(conn.put_copy_end(None), CopyPut::Sent);
        assert_eq!(conn.get_result().unwrap().command_tag, "COPY 1");

        let output = output.borrow();
        let types: Vec<u8> = frames(&output).into_iter().map(|e| e.0).collect();
        assert!(types.ends_with(b"Qdc"));
    }

    #[test]
    fn unfetched_results_discarded() {
        let (mut conn, _) = conn(&[
            [msg(b'C', b"SELECT 1\0"), msg(b'Z', b"I")].concat(),
            [msg(b'C', b"SELECT 2\0"), msg(b'Z', b"I")].concat(),
        ]);
        assert!(conn.send_query("SELECT 1"));
        assert!(!conn.send_query("SELECT 1"));
        assert_eq!(conn.exec("SELECT 2").unwrap().command_tag, "SELECT 2");
        assert!(conn.get_result().is_none());
    }

    #[test]
    fn copy_end_outside_copy_in() {
        let (mut conn, _) = conn(&[[
            msg(b'H', b"\0\0\x01\0\0"),
            msg(b'c', b""),
            msg(b'C', b"COPY 0\0"),
            msg(b'Z', b"I"),
        ].concat()]);
        assert_eq!(conn.exec("COPY t TO STDOUT").unwrap().status, ExecStatus::CopyOut);
        assert_eq!(conn.put_copy_data(b"x\n"), CopyPut::Failed);
        assert_eq!(conn.put_copy_end(Some("abort")), CopyPut::Failed);
        // the handle stays in copy out until the rows are read
        assert_eq!(conn.get_result().unwrap().status, ExecStatus::CopyOut);
        assert!(matches!(conn.get_copy_data(), CopyRead::Done));
        assert_eq!(conn.get_result().unwrap().command_tag, "COPY 0");
    }

    #[test]
    fn lost_connection() {
        let (mut conn, _) = conn(&[msg(b'T', b"\0\0")]);
        let result = conn.exec("SELECT").unwrap();
        assert_eq!(result.status, ExecStatus::FatalError);
        assert_eq!(conn.status(), ConnStatus::Bad);
        assert_eq!(conn.protocol_version(), 0);
        assert!(conn.socket().is_none());
        assert!(!conn.error_message().is_empty());
        assert!(conn.exec("SELECT 1").is_none());
    }

    #[test]
    fn escaping_follows_server_setting() {
        let (mut conn, _) = conn(&[]);
        let mut out = String::new();
        assert!(conn.escape_string(&mut out, "a'b\\"));
        assert_eq!(out, "a''b\\");
        assert_eq!(conn.escape_bytea(b"\x01").unwrap(), "\\x01");
        assert!(conn.escape_identifier("a\0").is_none());
        assert!(!conn.error_message().is_empty());
    }

    #[test]
    fn server_versions() {
        assert_eq!(parse_server_version("16.2"), 160002);
        assert_eq!(parse_server_version("9.6.24"), 90624);
        assert_eq!(parse_server_version("17beta1"), 170000);
        assert_eq!(parse_server_version("16.2 (Debian 16.2-1)"), 160002);
        assert_eq!(parse_server_version("garbage"), 0);
    }

    /// Split frontend output into `(msgtype, body)` frames, skipping the startup message.
    fn frames(mut output: &[u8]) -> Vec<(u8, Vec<u8>)> {
        let startup_len = u32::from_be_bytes([output[0], output[1], output[2], output[3]]) as usize;
        output = &output[startup_len..];
        let mut frames = vec![];
        while output.len() >= 5 {
            let len = u32::from_be_bytes([output[1], output[2], output[3], output[4]]) as usize;
            frames.push((output[0], output[5..1 + len].to_vec()));
            output = &output[1 + len..];
        }
        frames
    }
}
