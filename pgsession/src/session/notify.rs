//! Notification receivers and delivery.
use std::{
    fmt::Write,
    panic::{self, AssertUnwindSafe},
    ptr,
    rc::{Rc, Weak},
    time::Duration,
};

use super::Session;
use crate::{
    Error, Result,
    common::verbose,
    driver::{ConnectionPolicy, Driver},
    wait,
};

/// Error a receiver may return, reported as a notice.
pub type ReceiveError = Box<dyn std::error::Error>;

/// Listener for asynchronous notifications on one channel.
pub trait NotificationReceiver {
    /// Channel to listen on, must not be empty.
    fn channel(&self) -> &str;

    /// Called for each notification on [`channel`][NotificationReceiver::channel].
    fn receive(&self, payload: &str, backend_pid: u32) -> Result<(), ReceiveError>;
}

/// [`NotificationReceiver`] calling a closure.
pub struct FnReceiver<F> {
    channel: String,
    f: F,
}

impl<F> FnReceiver<F>
where
    F: Fn(&str, u32) -> Result<(), ReceiveError>,
{
    pub fn new(channel: impl Into<String>, f: F) -> FnReceiver<F> {
        Self { channel: channel.into(), f }
    }
}

impl<F> NotificationReceiver for FnReceiver<F>
where
    F: Fn(&str, u32) -> Result<(), ReceiveError>,
{
    fn channel(&self) -> &str {
        &self.channel
    }

    fn receive(&self, payload: &str, backend_pid: u32) -> Result<(), ReceiveError> {
        (self.f)(payload, backend_pid)
    }
}

impl<P: ConnectionPolicy> Session<P> {
    /// Register `receiver`, listening on its channel if it is the first one for it.
    ///
    /// The session keeps a weak reference, the caller owns the receiver and should
    /// remove it before dropping it.
    pub fn add_receiver<R: NotificationReceiver + 'static>(&mut self, receiver: &Rc<R>) -> Result<()> {
        let channel = receiver.channel().to_owned();
        if channel.is_empty() {
            return Err(Error::argument("Null receiver registered"));
        }

        let weak: Weak<dyn NotificationReceiver> = Rc::downgrade(receiver) as Weak<R>;
        if let Some(list) = self.receivers.get_mut(&channel) {
            list.push(weak);
            return Ok(());
        }

        if self.is_open() {
            let query = format!("LISTEN {}", self.quote_name(&channel)?);
            match self.exec_unchecked(&query) {
                Ok(_) => { }
                // replayed on the next activation
                Err(err) if err.is_broken_connection() => { }
                Err(err) => return Err(err),
            }
        }

        self.receivers.insert(channel, vec![weak]);
        Ok(())
    }

    /// Unregister `receiver`, never fails.
    ///
    /// Removing the last receiver of a channel stops listening on it.
    /// Failures are reported as notices.
    pub fn remove_receiver<R: NotificationReceiver + 'static>(&mut self, receiver: &Rc<R>) {
        let channel = receiver.channel().to_owned();
        let target = Rc::as_ptr(receiver) as *const ();

        let found = self.receivers.get_mut(&channel).and_then(|list| {
            let idx = list.iter().position(|e| ptr::addr_eq(e.as_ptr(), target))?;
            list.remove(idx);
            Some(list.is_empty())
        });

        let gone = match found {
            Some(gone) => gone,
            None => {
                self.process_notice(&format!("Attempt to remove unknown receiver '{channel}'"));
                return;
            }
        };

        if gone {
            self.receivers.remove(&channel);
            if self.conn.is_some() {
                let unlisten = self
                    .quote_name(&channel)
                    .and_then(|quoted| self.exec_unchecked(&format!("UNLISTEN {quoted}")));
                if let Err(err) = unlisten {
                    self.process_notice(&err.kind().to_string());
                }
            }
        }
    }

    /// Deliver queued notifications, returning how many were processed.
    ///
    /// Nothing is delivered while a transaction is registered, notifications stay queued
    /// until it ends.
    pub fn get_notifs(&mut self) -> Result<usize> {
        if !self.is_open() {
            return Ok(0);
        }

        if let Some(conn) = self.conn.as_mut() {
            if !conn.consume_input() {
                return Err(Error::broken("Connection to database failed."));
            }
        }

        if self.transaction().is_some() {
            return Ok(0);
        }

        let mut notifs = 0;
        while let Some(notify) = self.conn.as_mut().and_then(Driver::notifies) {
            notifs += 1;
            verbose!(channel = %notify.channel, "notification");

            let receivers: Vec<Rc<dyn NotificationReceiver>> = match self.receivers.get(&notify.channel) {
                Some(list) => list.iter().filter_map(Weak::upgrade).collect(),
                None => continue,
            };

            for receiver in receivers {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                    receiver.receive(&notify.payload, notify.backend_pid)
                }));
                match outcome {
                    Ok(Ok(())) => { }
                    Ok(Err(err)) => self.receiver_failed(&notify.channel, &err),
                    Err(panic) => {
                        let reason = panic
                            .downcast_ref::<&str>()
                            .copied()
                            .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
                            .unwrap_or("panic");
                        self.receiver_failed(&notify.channel, &reason);
                    }
                }
            }
        }

        Ok(notifs)
    }

    fn receiver_failed(&self, channel: &str, err: &dyn std::fmt::Display) {
        let mut msg = String::new();
        if msg.try_reserve(channel.len() + 64).is_err() {
            return self.process_notice("Exception in notification receiver, and also ran out of memory\n");
        }
        match writeln!(msg, "Exception in notification receiver '{channel}': {err}") {
            Ok(()) => self.process_notice(&msg),
            Err(_) => self.process_notice("Exception in notification receiver (compounded by other error)\n"),
        }
    }

    /// Deliver notifications, waiting for one if none is queued.
    ///
    /// Waits at most once, the returned count may be 0.
    pub fn await_notification(&mut self) -> Result<usize> {
        self.await_notification_inner(None)
    }

    /// Like [`await_notification`][Session::await_notification], giving up after `timeout`.
    pub fn await_notification_timeout(&mut self, timeout: Duration) -> Result<usize> {
        self.await_notification_inner(Some(timeout))
    }

    fn await_notification_inner(&mut self, timeout: Option<Duration>) -> Result<usize> {
        if self.conn.is_none() {
            return Err(Error::broken("Can't wait for notifications: connection is not active."));
        }

        let notifs = self.get_notifs()?;
        if notifs != 0 {
            return Ok(notifs);
        }

        wait::wait_read(self.sock(), timeout)?;
        self.get_notifs()
    }
}

#[cfg(test)]
mod test {
    use std::cell::RefCell;

    use super::*;
    use crate::{
        driver::Notify,
        error::ErrorKind,
        result::RawResult,
        session::test::{Recorder, open, state},
        driver::mock::MockPolicy,
    };

    type Log = Rc<RefCell<Vec<String>>>;

    fn logging(channel: &str, tag: &'static str, log: &Log) -> Rc<FnReceiver<impl Fn(&str, u32) -> Result<(), ReceiveError> + use<>>> {
        let log = log.clone();
        Rc::new(FnReceiver::new(channel, move |payload: &str, pid: u32| {
            log.borrow_mut().push(format!("{tag}:{payload}:{pid}"));
            Ok(())
        }))
    }

    fn notify(channel: &str, payload: &str) -> Notify {
        Notify { channel: channel.into(), payload: payload.into(), backend_pid: 7 }
    }

    #[test]
    fn listen_follows_receiver_set() {
        let (mut session, state) = open();
        let log = Log::default();
        let a = logging("jobs", "a", &log);
        let b = logging("jobs", "b", &log);

        session.add_receiver(&a).unwrap();
        session.add_receiver(&b).unwrap();
        assert_eq!(state.borrow().commands, ["LISTEN \"jobs\""]);

        session.remove_receiver(&a);
        assert_eq!(state.borrow().commands.len(), 1);
        session.remove_receiver(&b);
        assert_eq!(state.borrow().commands, ["LISTEN \"jobs\"", "UNLISTEN \"jobs\""]);
    }

    #[test]
    fn empty_channel_is_rejected() {
        let (mut session, _state) = open();
        let log = Log::default();
        let err = session.add_receiver(&logging("", "x", &log)).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Argument(_)));
    }

    #[test]
    fn listen_failure_propagates() {
        let (mut session, state) = open();
        state
            .borrow_mut()
            .results
            .push_back(Some(RawResult::error("ERROR:  permission denied", Some("42501".into()))));
        let log = Log::default();
        let err = session.add_receiver(&logging("jobs", "a", &log)).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Sql(e) if e.sqlstate() == Some("42501")));
    }

    #[test]
    fn unknown_removal_is_harmless() {
        let (mut session, state) = open();
        let recorder = Recorder::new(true);
        session.register_errorhandler(&recorder);
        let log = Log::default();

        session.remove_receiver(&logging("ghost", "x", &log));
        assert_eq!(recorder.seen(), ["Attempt to remove unknown receiver 'ghost'\n"]);
        assert!(state.borrow().commands.is_empty());
    }

    #[test]
    fn delivery_in_registration_order() {
        let (mut session, state) = open();
        let log = Log::default();
        let a = logging("jobs", "a", &log);
        let b = logging("jobs", "b", &log);
        let other = logging("other", "o", &log);
        session.add_receiver(&a).unwrap();
        session.add_receiver(&b).unwrap();
        session.add_receiver(&other).unwrap();

        state.borrow_mut().incoming.extend([notify("jobs", "1"), notify("nobody", "x"), notify("other", "2")]);
        assert_eq!(session.get_notifs().unwrap(), 3);
        assert_eq!(*log.borrow(), ["a:1:7", "b:1:7", "o:2:7"]);
    }

    #[test]
    fn transaction_defers_delivery() {
        struct Tx;
        impl crate::TransactionGuest for Tx {
            fn description(&self) -> String {
                "transaction".into()
            }
        }

        let (mut session, state) = open();
        let log = Log::default();
        let a = logging("jobs", "a", &log);
        session.add_receiver(&a).unwrap();
        let tx = Rc::new(Tx);
        session.register_transaction(&tx).unwrap();

        state.borrow_mut().incoming.push_back(notify("jobs", "1"));
        assert_eq!(session.get_notifs().unwrap(), 0);
        assert!(log.borrow().is_empty());

        session.unregister_transaction(&tx);
        assert_eq!(session.get_notifs().unwrap(), 1);
        assert_eq!(*log.borrow(), ["a:1:7"]);
    }

    #[test]
    fn receiver_failure_becomes_notice() {
        let (mut session, state) = open();
        let recorder = Recorder::new(true);
        session.register_errorhandler(&recorder);
        let log = Log::default();
        let failing = Rc::new(FnReceiver::new("jobs", |_: &str, _: u32| Err("bad payload".into())));
        let panicking = Rc::new(FnReceiver::new("jobs", |_: &str, _: u32| -> Result<(), ReceiveError> {
            panic!("receiver bug")
        }));
        let after = logging("jobs", "after", &log);
        session.add_receiver(&failing).unwrap();
        session.add_receiver(&panicking).unwrap();
        session.add_receiver(&after).unwrap();

        state.borrow_mut().incoming.push_back(notify("jobs", "1"));
        assert_eq!(session.get_notifs().unwrap(), 1);
        assert_eq!(recorder.seen(), [
            "Exception in notification receiver 'jobs': bad payload\n",
            "Exception in notification receiver 'jobs': receiver bug\n",
        ]);
        assert_eq!(*log.borrow(), ["after:1:7"]);
    }

    #[test]
    fn lost_input_is_broken() {
        let (mut session, state) = open();
        state.borrow_mut().consume_ok = false;
        assert!(session.get_notifs().unwrap_err().is_broken_connection());
    }

    #[test]
    fn closed_session_has_nothing() {
        let state = state();
        let mut session = Session::new(MockPolicy::lazy(state.clone())).unwrap();
        state.borrow_mut().incoming.push_back(notify("jobs", "1"));
        assert_eq!(session.get_notifs().unwrap(), 0);
        assert!(session.await_notification().unwrap_err().is_broken_connection());
    }

    #[test]
    fn await_returns_queued() {
        let (mut session, state) = open();
        let log = Log::default();
        let a = logging("jobs", "a", &log);
        session.add_receiver(&a).unwrap();
        state.borrow_mut().incoming.push_back(notify("jobs", "1"));
        assert_eq!(session.await_notification().unwrap(), 1);
        assert_eq!(*log.borrow(), ["a:1:7"]);
    }
}
