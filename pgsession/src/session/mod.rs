//! The connection object.
//!
//! A [`Session`] owns at most one protocol handle and drives its lifecycle:
//!
//! ```text
//! Unconnected ──activate()──▶ Activating ──▶ Open ──close()──▶ Closed
//! ```
//!
//! Only an open session runs queries, delivers notifications or transfers `COPY` data.
//! Once activation was attempted, a lost connection is terminal, the session never reconnects.
use std::{
    collections::BTreeMap,
    os::fd::RawFd,
    panic::{self, AssertUnwindSafe},
    rc::{Rc, Weak},
};

use crate::{
    Error, Result,
    common::{log_warn, span, verbose},
    config::Config,
    driver::{ConnStatus, ConnectionPolicy, Driver, ErrorVerbosity, TraceSink},
    policy::{ConnectDirect, ConnectLazy},
    result::ExecStatus,
};

mod notice;
mod notify;
mod exec;
mod copy;
mod escape;
mod guest;

pub use notice::ErrorHandler;
pub use notify::{FnReceiver, NotificationReceiver, ReceiveError};
pub use guest::TransactionGuest;

use notice::HandlerChain;

/// Discard pending results until the command finished.
///
/// A `COPY` result is reported for as long as the handle stays in copy state, so it ends
/// the drain as well.
fn drain_results<D: Driver>(conn: &mut D) {
    while let Some(result) = conn.get_result() {
        if matches!(result.status, ExecStatus::CopyIn | ExecStatus::CopyOut) {
            break;
        }
    }
}

/// Observable lifecycle state of a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Activation was never attempted.
    Unconnected,
    /// Activation is running.
    Activating,
    /// Activated and healthy.
    Open,
    /// Closed, or the connection was lost after activation.
    Closed,
}

/// A database session over a [`ConnectionPolicy`].
///
/// The session is single threaded. The only cross thread operation is
/// cancelling a running command with [`cancel_handle`][Session::cancel_handle].
pub struct Session<P: ConnectionPolicy = ConnectDirect> {
    policy: P,
    conn: Option<P::Handle>,
    completed: bool,
    activating: bool,
    closed: bool,
    server_version: i32,
    trace: Option<TraceSink>,
    verbosity: ErrorVerbosity,
    unique_id: u64,
    handlers: Rc<HandlerChain>,
    receivers: BTreeMap<String, Vec<Weak<dyn NotificationReceiver>>>,
    trans: Option<Weak<dyn TransactionGuest>>,
    pending_query: Option<String>,
}

impl Session {
    /// Connect to the database at `url` and activate.
    pub fn connect(url: &str) -> Result<Session> {
        Session::new(ConnectDirect::new(Config::parse(url)?))
    }

    /// Connect using [`Config::from_env`] and activate.
    pub fn connect_env() -> Result<Session> {
        Session::new(ConnectDirect::new(Config::from_env()))
    }

    pub fn connect_with(config: Config) -> Result<Session> {
        Session::new(ConnectDirect::new(config))
    }
}

impl Session<ConnectLazy> {
    /// Create a session that connects on first [`activate`][Session::activate].
    pub fn lazy(config: Config) -> Result<Session<ConnectLazy>> {
        Session::new(ConnectLazy::new(config))
    }
}

impl<P: ConnectionPolicy> Session<P> {
    /// Start connecting through `policy`, activating right away if the policy is ready.
    pub fn new(mut policy: P) -> Result<Session<P>> {
        let conn = policy.do_startconnect(None);
        let mut me = Session {
            policy,
            conn,
            completed: false,
            activating: false,
            closed: false,
            server_version: 0,
            trace: None,
            verbosity: ErrorVerbosity::Default,
            unique_id: 0,
            handlers: Rc::default(),
            receivers: BTreeMap::new(),
            trans: None,
            pending_query: None,
        };
        if me.policy.is_ready(me.conn.as_ref()) {
            me.activate()?;
        }
        Ok(me)
    }

    /// Returns `true` if the session was activated and its connection is healthy.
    pub fn is_open(&self) -> bool {
        self.completed
            && self.conn.as_ref().is_some_and(|e| e.status() == ConnStatus::Ok)
    }

    pub fn state(&self) -> SessionState {
        if self.closed {
            SessionState::Closed
        } else if self.activating {
            SessionState::Activating
        } else if !self.completed {
            SessionState::Unconnected
        } else if self.is_open() {
            SessionState::Open
        } else {
            SessionState::Closed
        }
    }

    /// Complete the connection and set up session state.
    ///
    /// Calling this on an open session does nothing. After [`close`][Session::close], a failed
    /// activation or a lost connection it fails with a broken connection error, no reconnect
    /// is attempted.
    pub fn activate(&mut self) -> Result<()> {
        if self.closed {
            return Err(Error::broken("Session is closed."));
        }
        if self.completed {
            return match self.is_open() {
                true => Ok(()),
                false => Err(Error::broken("Broken connection.")),
            };
        }

        span!("activate");
        self.completed = true;
        self.activating = true;
        let result = self.try_activate();
        self.activating = false;

        if let Err(err) = result {
            verbose!(%err, "activation failed");
            self.disconnect();
            return Err(err);
        }

        verbose!("activated");
        Ok(())
    }

    fn try_activate(&mut self) -> Result<()> {
        let conn = self.conn.take();
        self.conn = self.policy.do_completeconnect(conn);
        if !self.is_open() {
            return Err(Error::broken(self.err_msg().trim_end().to_owned()));
        }
        self.set_up_state()
    }

    /// Restore the logical state a fresh connection lacks.
    fn set_up_state(&mut self) -> Result<()> {
        self.read_capabilities()?;

        self.clear_notice_processor();
        if !self.handlers.is_empty() {
            self.set_notice_processor();
        }
        self.internal_set_trace();
        let verbosity = self.verbosity;
        if let Some(conn) = self.conn.as_mut() {
            conn.set_verbosity(verbosity);
        }

        if !self.receivers.is_empty() {
            let channels: Vec<String> = self.receivers.keys().cloned().collect();
            let mut query = String::new();
            for channel in &channels {
                query.push_str("LISTEN ");
                query.push_str(&self.quote_name(channel)?);
                query.push_str("; ");
            }

            if let Some(conn) = self.conn.as_mut() {
                // replies are only drained, a failure shows in the health check below
                if conn.send_query(&query) {
                    drain_results(conn);
                }
            }
        }

        if !self.is_open() {
            return Err(Error::broken("Could not connect."));
        }
        Ok(())
    }

    fn read_capabilities(&mut self) -> Result<()> {
        let Some(conn) = self.conn.as_ref() else {
            return Err(Error::broken("No connection."));
        };

        self.server_version = conn.server_version();
        if self.server_version <= 90000 {
            return Err(Error::feature_not_supported("Unsupported server version; 9.0 is the minimum."));
        }

        match conn.protocol_version() {
            0 => Err(Error::broken("No connection.")),
            v if v < 3 => Err(Error::feature_not_supported(
                "Unsupported frontend/backend protocol version; 3.0 is the minimum.",
            )),
            _ => Ok(()),
        }
    }

    /// Release the connection through the policy, never fails.
    pub fn disconnect(&mut self) {
        let conn = self.conn.take();
        self.conn = self.policy.do_disconnect(conn);
    }

    /// Drop the connection as if it was lost, without closing the session.
    pub fn simulate_failure(&mut self) {
        if self.conn.is_some() {
            self.disconnect();
        }
    }

    /// Tear down the session, never fails and may be called more than once.
    ///
    /// A still registered transaction and any outstanding receiver are reported as notices,
    /// then every error handler is unregistered, newest first, and the connection released.
    pub fn close(&mut self) {
        span!("close");
        let result = panic::catch_unwind(AssertUnwindSafe(|| self.close_inner()));
        if result.is_err() {
            log_warn!("panic while closing session");
            if self.conn.is_some() {
                let _ = panic::catch_unwind(AssertUnwindSafe(|| self.disconnect()));
            }
        }
        self.closed = true;
    }

    fn close_inner(&mut self) {
        if let Some(trans) = self.transaction() {
            self.process_notice(&format!(
                "Closing connection while {} is still open.",
                trans.description(),
            ));
        }

        if !self.receivers.is_empty() {
            self.process_notice("Closing connection with outstanding receivers.");
            self.receivers.clear();
        }

        let old_handlers = self.handlers.take();
        for handler in old_handlers.iter().rev().filter_map(Weak::upgrade) {
            handler.unregistered();
        }

        self.disconnect();
    }

    /// Process ID of the backend, 0 without a connection.
    pub fn backendpid(&self) -> u32 {
        self.conn.as_ref().map_or(0, Driver::backend_pid)
    }

    /// Raw socket of the connection.
    pub fn sock(&self) -> Option<RawFd> {
        self.conn.as_ref().and_then(Driver::socket)
    }

    /// Server version read at activation, in `MMmmpp` numeric form.
    pub fn server_version(&self) -> i32 {
        self.server_version
    }

    pub fn protocol_version(&self) -> i32 {
        self.conn.as_ref().map_or(0, Driver::protocol_version)
    }

    pub fn dbname(&self) -> Result<&str> {
        match &self.conn {
            Some(conn) => Ok(conn.dbname()),
            None => Err(Error::broken("Can't get database name: connection is inactive.")),
        }
    }

    pub fn username(&self) -> Result<&str> {
        match &self.conn {
            Some(conn) => Ok(conn.user()),
            None => Err(Error::broken("Can't get user name: connection is inactive.")),
        }
    }

    pub fn hostname(&self) -> Result<&str> {
        match &self.conn {
            Some(conn) => Ok(conn.host()),
            None => Err(Error::broken("Can't get server name: connection is inactive.")),
        }
    }

    pub fn port(&self) -> Result<u16> {
        match &self.conn {
            Some(conn) => Ok(conn.port()),
            None => Err(Error::broken("Can't get database port: connection is inactive.")),
        }
    }

    /// Most recent error text reported by the connection.
    pub fn err_msg(&self) -> &str {
        match &self.conn {
            Some(conn) => conn.error_message(),
            None => "No connection to database",
        }
    }

    /// Trace protocol traffic into `sink`, or stop tracing with `None`.
    ///
    /// The sink survives activation.
    pub fn trace(&mut self, sink: Option<TraceSink>) {
        self.trace = sink;
        self.internal_set_trace();
    }

    fn internal_set_trace(&mut self) {
        let trace = self.trace.clone();
        if let Some(conn) = self.conn.as_mut() {
            conn.trace(trace);
        }
    }

    /// Set how much detail error and notice text carries.
    pub fn set_verbosity(&mut self, verbosity: ErrorVerbosity) {
        self.verbosity = verbosity;
        if let Some(conn) = self.conn.as_mut() {
            conn.set_verbosity(verbosity);
        }
    }

    pub fn verbosity(&self) -> ErrorVerbosity {
        self.verbosity
    }

    /// Make `base` unique within this session.
    ///
    /// Returns `x<N>` for an empty base and `<base>_<N>` otherwise, where N starts at 1
    /// and increases on every call.
    pub fn adorn_name(&mut self, base: &str) -> String {
        self.unique_id += 1;
        let mut id = itoa::Buffer::new();
        let id = id.format(self.unique_id);
        match base {
            "" => format!("x{id}"),
            base => format!("{base}_{id}"),
        }
    }

    /// Wait until the socket is readable.
    pub fn wait_read(&self) -> Result<()> {
        crate::wait::wait_read(self.sock(), None)
    }

    /// Wait until the socket is readable or `timeout` elapsed.
    pub fn wait_read_timeout(&self, timeout: std::time::Duration) -> Result<()> {
        crate::wait::wait_read(self.sock(), Some(timeout))
    }
}

impl<P: ConnectionPolicy> Drop for Session<P> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
pub(crate) mod test {
    use std::{cell::RefCell, rc::Rc};

    use super::*;
    use crate::{
        driver::mock::{MockPolicy, MockState, SharedState},
        error::ErrorKind,
    };

    /// Error handler recording everything it sees.
    pub(crate) struct Recorder {
        pub seen: RefCell<Vec<String>>,
        pub unregistered: RefCell<usize>,
        consume: bool,
    }

    impl Recorder {
        pub fn new(consume: bool) -> Rc<Recorder> {
            Rc::new(Recorder { seen: RefCell::default(), unregistered: RefCell::default(), consume })
        }

        pub fn seen(&self) -> Vec<String> {
            self.seen.borrow().clone()
        }
    }

    impl ErrorHandler for Recorder {
        fn handle(&self, msg: &str) -> bool {
            self.seen.borrow_mut().push(msg.to_owned());
            self.consume
        }

        fn unregistered(&self) {
            *self.unregistered.borrow_mut() += 1;
        }
    }

    pub(crate) fn state() -> SharedState {
        Rc::new(RefCell::new(MockState::default()))
    }

    /// An activated session over a fresh mock.
    pub(crate) fn open() -> (Session<MockPolicy>, SharedState) {
        let state = state();
        let session = Session::new(MockPolicy::new(state.clone())).unwrap();
        (session, state)
    }

    #[test]
    fn direct_policy_activates() {
        let (session, state) = open();
        assert!(session.is_open());
        assert_eq!(session.state(), SessionState::Open);
        assert_eq!(session.server_version(), 160_002);
        assert_eq!(state.borrow().connects, 1);
        assert_eq!(session.dbname().unwrap(), "mockdb");
        assert_eq!(session.backendpid(), 4242);
    }

    #[test]
    fn lazy_policy_defers() {
        let state = state();
        let mut session = Session::new(MockPolicy::lazy(state.clone())).unwrap();
        assert_eq!(session.state(), SessionState::Unconnected);
        assert_eq!(state.borrow().connects, 0);
        assert!(session.dbname().unwrap_err().is_broken_connection());

        session.activate().unwrap();
        assert!(session.is_open());
        assert_eq!(state.borrow().connects, 1);
    }

    #[test]
    fn activate_is_idempotent() {
        let (mut session, state) = open();
        session.activate().unwrap();
        session.activate().unwrap();
        assert_eq!(state.borrow().connects, 1);
    }

    #[test]
    fn activate_fails_fast_after_failure() {
        let (mut session, state) = open();
        session.simulate_failure();
        assert!(!session.is_open());
        assert_eq!(session.state(), SessionState::Closed);

        let err = session.activate().unwrap_err();
        assert!(err.is_broken_connection());
        session.activate().unwrap_err();
        assert_eq!(state.borrow().connects, 1);
        assert!(session.exec("SELECT 1").unwrap_err().is_broken_connection());
    }

    #[test]
    fn unhealthy_handle_is_broken() {
        let state = state();
        state.borrow_mut().status = ConnStatus::Bad;
        state.borrow_mut().error_message = "refused".into();
        let err = Session::new(MockPolicy::new(state.clone())).err().unwrap();
        assert!(matches!(err.kind(), ErrorKind::BrokenConnection(msg) if msg == "mock failure"));
        assert_eq!(state.borrow().disconnects, 1);
    }

    #[test]
    fn old_server_not_supported() {
        let state = state();
        state.borrow_mut().server_version = 90000;
        let err = Session::new(MockPolicy::new(state.clone())).err().unwrap();
        assert!(matches!(err.kind(), ErrorKind::FeatureNotSupported(_)));
        assert_eq!(state.borrow().disconnects, 1);
    }

    #[test]
    fn old_protocol_not_supported() {
        let state = state();
        state.borrow_mut().protocol_version = 2;
        let err = Session::new(MockPolicy::new(state.clone())).err().unwrap();
        assert!(matches!(err.kind(), ErrorKind::FeatureNotSupported(_)));

        let state = super::test::state();
        state.borrow_mut().protocol_version = 0;
        let err = Session::new(MockPolicy::new(state)).err().unwrap();
        assert!(err.is_broken_connection());
    }

    #[test]
    fn close_never_fails() {
        let (mut session, state) = open();
        session.close();
        session.close();
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(state.borrow().disconnects, 1);
        assert!(session.exec("SELECT 1").is_err());
    }

    #[test]
    fn close_is_terminal() {
        let state = state();
        let mut session = Session::new(MockPolicy::lazy(state.clone())).unwrap();
        session.close();

        assert!(session.activate().unwrap_err().is_broken_connection());
        assert_eq!(state.borrow().connects, 0);
        assert_eq!(session.state(), SessionState::Closed);

        let (mut session, state) = open();
        session.close();
        assert!(session.activate().unwrap_err().is_broken_connection());
        assert_eq!(state.borrow().connects, 1);
    }

    #[test]
    fn close_unregisters_handlers_newest_first() {
        let order = Rc::new(RefCell::new(vec![]));

        struct Named(&'static str, Rc<RefCell<Vec<&'static str>>>);
        impl ErrorHandler for Named {
            fn handle(&self, _: &str) -> bool {
                false
            }
            fn unregistered(&self) {
                self.1.borrow_mut().push(self.0);
            }
        }

        let (mut session, _state) = open();
        let first = Rc::new(Named("first", order.clone()));
        let second = Rc::new(Named("second", order.clone()));
        session.register_errorhandler(&first);
        session.register_errorhandler(&second);
        session.close();

        assert_eq!(*order.borrow(), ["second", "first"]);
        assert!(session.errorhandlers().is_empty());
    }

    #[test]
    fn close_reports_outstanding_collaborators() {
        let (mut session, _state) = open();
        let recorder = Recorder::new(false);
        session.register_errorhandler(&recorder);
        let receiver = Rc::new(FnReceiver::new("alerts", |_: &str, _: u32| Ok(())));
        session.add_receiver(&receiver).unwrap();

        session.close();
        assert_eq!(recorder.seen(), ["Closing connection with outstanding receivers.\n"]);
        assert_eq!(*recorder.unregistered.borrow(), 1);
    }

    #[test]
    fn reactivation_replays_listen_once_per_channel() {
        let state = state();
        let mut session = Session::new(MockPolicy::lazy(state.clone())).unwrap();
        let a1 = Rc::new(FnReceiver::new("b", |_: &str, _: u32| Ok(())));
        let a2 = Rc::new(FnReceiver::new("b", |_: &str, _: u32| Ok(())));
        let b = Rc::new(FnReceiver::new("a", |_: &str, _: u32| Ok(())));
        session.add_receiver(&a1).unwrap();
        session.add_receiver(&a2).unwrap();
        session.add_receiver(&b).unwrap();
        assert!(state.borrow().commands.is_empty());

        session.activate().unwrap();
        assert_eq!(state.borrow().commands, ["LISTEN \"a\"; LISTEN \"b\"; "]);
    }

    #[test]
    fn listen_replay_stops_at_copy_state() {
        let state = state();
        let mut session = Session::new(MockPolicy::lazy(state.clone())).unwrap();
        let receiver = Rc::new(FnReceiver::new("jobs", |_: &str, _: u32| Ok(())));
        session.add_receiver(&receiver).unwrap();
        state.borrow_mut().copy_phase = Some(ExecStatus::CopyOut);

        session.activate().unwrap();
        assert_eq!(state.borrow().commands, ["LISTEN \"jobs\"; "]);
    }

    #[test]
    fn adorn_name_per_session() {
        let (mut one, _) = open();
        let (mut two, _) = open();
        assert_eq!(one.adorn_name(""), "x1");
        assert_eq!(one.adorn_name("cursor"), "cursor_2");
        assert_eq!(two.adorn_name("cursor"), "cursor_1");
        assert_eq!(one.adorn_name(""), "x3");
    }

    #[test]
    fn trace_and_verbosity_survive_activation() {
        let state = state();
        let mut session = Session::new(MockPolicy::lazy(state.clone())).unwrap();
        let sink: TraceSink = Rc::new(RefCell::new(Vec::<u8>::new()));
        session.trace(Some(sink));
        session.set_verbosity(ErrorVerbosity::Verbose);
        session.activate().unwrap();
        assert!(state.borrow().tracing);
        assert_eq!(state.borrow().verbosity, ErrorVerbosity::Verbose);

        session.trace(None);
        assert!(!state.borrow().tracing);
    }
}
