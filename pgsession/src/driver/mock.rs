//! Scripted driver used by the session tests.
use std::{
    cell::RefCell,
    collections::VecDeque,
    os::fd::RawFd,
    rc::Rc,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use super::*;
use crate::{escape, result::ExecStatus};

/// Everything the mock saw and everything it will answer.
pub(crate) struct MockState {
    /// Every command sent, in order.
    pub commands: Vec<String>,
    /// Parameters of every parameterized execution, in order.
    pub params: Vec<Params>,
    /// Answers for synchronous execution, `CommandOk` once exhausted.
    pub results: VecDeque<Option<RawResult>>,
    /// Answers for [`Driver::get_result`] after `send_query`.
    pub pending: VecDeque<RawResult>,
    /// Notices emitted on the next synchronous execution.
    pub notices: VecDeque<String>,
    /// Notifications moved into the queue by `consume_input`.
    pub incoming: VecDeque<Notify>,
    pub queue: VecDeque<Notify>,
    pub copy_out: VecDeque<CopyRead>,
    /// Copy state the handle is stuck in, reported by every [`Driver::get_result`] once
    /// `pending` is empty.
    pub copy_phase: Option<ExecStatus>,
    pub copy_in: Vec<Vec<u8>>,
    pub copy_end: Vec<Option<String>>,
    pub put_result: CopyPut,
    pub status: ConnStatus,
    pub server_version: i32,
    pub protocol_version: i32,
    pub error_message: String,
    pub consume_ok: bool,
    pub send_ok: bool,
    pub processor: Option<NoticeProcessor>,
    pub tracing: bool,
    pub verbosity: ErrorVerbosity,
    pub connects: usize,
    pub disconnects: usize,
    pub cancels: Arc<AtomicUsize>,
    pub cancel_ok: bool,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            commands: vec![],
            params: vec![],
            results: VecDeque::new(),
            pending: VecDeque::new(),
            notices: VecDeque::new(),
            incoming: VecDeque::new(),
            queue: VecDeque::new(),
            copy_out: VecDeque::new(),
            copy_phase: None,
            copy_in: vec![],
            copy_end: vec![],
            put_result: CopyPut::Sent,
            status: ConnStatus::Ok,
            server_version: 160_002,
            protocol_version: 3,
            error_message: String::new(),
            consume_ok: true,
            send_ok: true,
            processor: None,
            tracing: false,
            verbosity: ErrorVerbosity::Default,
            connects: 0,
            disconnects: 0,
            cancels: Arc::new(AtomicUsize::new(0)),
            cancel_ok: true,
        }
    }
}

pub(crate) type SharedState = Rc<RefCell<MockState>>;

pub(crate) struct MockDriver {
    state: SharedState,
}

impl MockDriver {
    /// Call the armed processor with the state unborrowed.
    fn emit_notices(&self) {
        let notices: Vec<String> = self.state.borrow_mut().notices.drain(..).collect();
        if notices.is_empty() {
            return;
        }
        let processor = self.state.borrow_mut().processor.take();
        if let Some(mut processor) = processor {
            for notice in &notices {
                processor(notice);
            }
            let mut state = self.state.borrow_mut();
            if state.processor.is_none() {
                state.processor = Some(processor);
            }
        }
    }

    fn run(&mut self, command: String) -> Option<RawResult> {
        self.state.borrow_mut().commands.push(command);
        self.emit_notices();
        let mut state = self.state.borrow_mut();
        match state.results.pop_front() {
            Some(result) => result,
            None => Some(RawResult::new(ExecStatus::CommandOk)),
        }
    }
}

pub(crate) struct MockCancel {
    count: Arc<AtomicUsize>,
    ok: bool,
}

impl CancelHandle for MockCancel {
    fn cancel(&self) -> crate::Result<()> {
        if !self.ok {
            return Err(crate::Error::failure("could not send cancel request"));
        }
        self.count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl Driver for MockDriver {
    type Cancel = MockCancel;

    fn status(&self) -> ConnStatus {
        self.state.borrow().status
    }

    fn socket(&self) -> Option<RawFd> {
        match self.state.borrow().status {
            ConnStatus::Ok => Some(0),
            ConnStatus::Bad => None,
        }
    }

    fn backend_pid(&self) -> u32 {
        4242
    }

    fn host(&self) -> &str {
        "mockhost"
    }

    fn port(&self) -> u16 {
        5432
    }

    fn dbname(&self) -> &str {
        "mockdb"
    }

    fn user(&self) -> &str {
        "mockuser"
    }

    fn protocol_version(&self) -> i32 {
        self.state.borrow().protocol_version
    }

    fn server_version(&self) -> i32 {
        self.state.borrow().server_version
    }

    fn error_message(&self) -> &str {
        // text lives behind the RefCell, a set error is reported with fixed text
        if self.state.borrow().error_message.is_empty() { "" } else { "mock failure\n" }
    }

    fn set_notice_processor(&mut self, processor: Option<NoticeProcessor>) {
        self.state.borrow_mut().processor = processor;
    }

    fn trace(&mut self, sink: Option<TraceSink>) {
        self.state.borrow_mut().tracing = sink.is_some();
    }

    fn set_verbosity(&mut self, verbosity: ErrorVerbosity) {
        self.state.borrow_mut().verbosity = verbosity;
    }

    fn exec(&mut self, sql: &str) -> Option<RawResult> {
        self.run(sql.to_owned())
    }

    fn exec_params(&mut self, sql: &str, params: &Params) -> Option<RawResult> {
        self.state.borrow_mut().params.push(params.clone());
        self.run(sql.to_owned())
    }

    fn prepare(&mut self, name: &str, sql: &str) -> Option<RawResult> {
        self.run(format!("PREPARE {name}: {sql}"))
    }

    fn exec_prepared(&mut self, name: &str, params: &Params) -> Option<RawResult> {
        self.state.borrow_mut().params.push(params.clone());
        self.run(format!("EXECUTE {name}"))
    }

    fn send_query(&mut self, sql: &str) -> bool {
        let mut state = self.state.borrow_mut();
        state.commands.push(sql.to_owned());
        state.send_ok
    }

    fn get_result(&mut self) -> Option<RawResult> {
        let mut state = self.state.borrow_mut();
        match state.pending.pop_front() {
            Some(result) => Some(result),
            None => state.copy_phase.map(RawResult::new),
        }
    }

    fn consume_input(&mut self) -> bool {
        let mut state = self.state.borrow_mut();
        let incoming: Vec<Notify> = state.incoming.drain(..).collect();
        state.queue.extend(incoming);
        state.consume_ok
    }

    fn is_busy(&self) -> bool {
        !self.state.borrow().pending.is_empty()
    }

    fn notifies(&mut self) -> Option<Notify> {
        self.state.borrow_mut().queue.pop_front()
    }

    fn get_copy_data(&mut self) -> CopyRead {
        self.state.borrow_mut().copy_out.pop_front().unwrap_or(CopyRead::Done)
    }

    fn put_copy_data(&mut self, data: &[u8]) -> CopyPut {
        let mut state = self.state.borrow_mut();
        if state.copy_phase == Some(ExecStatus::CopyOut) {
            return CopyPut::Failed;
        }
        if state.put_result == CopyPut::Sent {
            state.copy_in.push(data.to_vec());
        }
        state.put_result
    }

    fn put_copy_end(&mut self, error: Option<&str>) -> CopyPut {
        let mut state = self.state.borrow_mut();
        if state.copy_phase == Some(ExecStatus::CopyOut) {
            return CopyPut::Failed;
        }
        state.copy_end.push(error.map(str::to_owned));
        if error.is_some() { CopyPut::Sent } else { state.put_result }
    }

    fn escape_string(&mut self, out: &mut String, text: &str) -> bool {
        let ok = escape::escape_string(out, text, true);
        if !ok {
            self.state.borrow_mut().error_message = "string contains nul".into();
        }
        ok
    }

    fn escape_bytea(&mut self, data: &[u8]) -> Option<String> {
        Some(escape::escape_bytea(data, true))
    }

    fn escape_identifier(&mut self, ident: &str) -> Option<String> {
        let quoted = escape::escape_identifier(ident);
        if quoted.is_none() {
            self.state.borrow_mut().error_message = "identifier contains nul".into();
        }
        quoted
    }

    fn cancel_handle(&self) -> Option<Self::Cancel> {
        let state = self.state.borrow();
        Some(MockCancel { count: state.cancels.clone(), ok: state.cancel_ok })
    }
}

/// Policy handing out [`MockDriver`]s over one shared state.
pub(crate) struct MockPolicy {
    state: SharedState,
    lazy: bool,
}

impl MockPolicy {
    pub(crate) fn new(state: SharedState) -> MockPolicy {
        Self { state, lazy: false }
    }

    pub(crate) fn lazy(state: SharedState) -> MockPolicy {
        Self { state, lazy: true }
    }

    fn connect(&self) -> MockDriver {
        self.state.borrow_mut().connects += 1;
        MockDriver { state: self.state.clone() }
    }
}

impl ConnectionPolicy for MockPolicy {
    type Handle = MockDriver;

    fn do_startconnect(&mut self, orig: Option<MockDriver>) -> Option<MockDriver> {
        match (orig, self.lazy) {
            (Some(orig), _) => Some(orig),
            (None, true) => None,
            (None, false) => Some(self.connect()),
        }
    }

    fn do_completeconnect(&mut self, orig: Option<MockDriver>) -> Option<MockDriver> {
        orig.or_else(|| Some(self.connect()))
    }

    fn do_disconnect(&mut self, orig: Option<MockDriver>) -> Option<MockDriver> {
        if orig.is_some() {
            self.state.borrow_mut().disconnects += 1;
        }
        None
    }

    fn is_ready(&self, h: Option<&MockDriver>) -> bool {
        !self.lazy && h.is_some()
    }
}
