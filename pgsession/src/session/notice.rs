//! Notice and error handler chain.
use std::{
    cell::RefCell,
    panic::{self, AssertUnwindSafe},
    ptr,
    rc::{Rc, Weak},
};

use super::Session;
use crate::{
    common::log_warn,
    driver::{ConnectionPolicy, Driver},
};

/// Receiver of server notices and session diagnostics.
///
/// Every message handed to a handler ends in exactly one newline.
pub trait ErrorHandler {
    /// Handle `msg`, returning `true` stops older handlers from seeing it.
    fn handle(&self, msg: &str) -> bool;

    /// The session this handler was registered with is closing.
    fn unregistered(&self) { }
}

impl<F: Fn(&str) -> bool> ErrorHandler for F {
    fn handle(&self, msg: &str) -> bool {
        self(msg)
    }
}

/// Size of one chunk when a notice has to be delivered in pieces.
const CHUNK: usize = 1000;

/// Terminates every chunk except the last.
const TRUNCATED: &[u8] = b"[...]\n";

/// Registered handlers, oldest first.
#[derive(Default)]
pub(crate) struct HandlerChain {
    handlers: RefCell<Vec<Weak<dyn ErrorHandler>>>,
}

impl HandlerChain {
    pub(crate) fn is_empty(&self) -> bool {
        self.handlers.borrow().is_empty()
    }

    fn push(&self, handler: Weak<dyn ErrorHandler>) {
        self.handlers.borrow_mut().push(handler);
    }

    /// Remove the entry pointing at `target`, returns `false` if there is none.
    fn remove(&self, target: *const ()) -> bool {
        let mut handlers = self.handlers.borrow_mut();
        match handlers.iter().position(|e| ptr::addr_eq(e.as_ptr(), target)) {
            Some(idx) => {
                handlers.remove(idx);
                true
            }
            None => false,
        }
    }

    /// Empty the chain, returning what it held.
    pub(crate) fn take(&self) -> Vec<Weak<dyn ErrorHandler>> {
        std::mem::take(&mut *self.handlers.borrow_mut())
    }

    /// Live handlers, oldest first.
    fn live(&self) -> Vec<Rc<dyn ErrorHandler>> {
        self.handlers.borrow().iter().filter_map(Weak::upgrade).collect()
    }

    /// Normalize `msg` and dispatch it, never fails.
    pub(crate) fn process_notice(&self, msg: &str) {
        let body = msg.trim_end_matches('\n');
        if body.is_empty() {
            return;
        }

        if body.len() + 1 == msg.len() {
            return self.dispatch(msg);
        }

        let mut owned = String::new();
        match owned.try_reserve_exact(body.len() + 1) {
            Ok(()) => {
                owned.push_str(body);
                owned.push('\n');
                self.dispatch(&owned);
            }
            Err(_) => self.process_notice_chunked(body),
        }
    }

    /// Deliver `body` in pieces using only a stack buffer.
    pub(crate) fn process_notice_chunked(&self, body: &str) {
        let mut buf = [0u8; CHUNK + TRUNCATED.len()];
        let mut rest = body;

        while rest.len() > CHUNK {
            let mut end = CHUNK;
            while !rest.is_char_boundary(end) {
                end -= 1;
            }
            let (head, tail) = rest.split_at(end);
            buf[..end].copy_from_slice(head.as_bytes());
            buf[end..end + TRUNCATED.len()].copy_from_slice(TRUNCATED);
            self.dispatch(std::str::from_utf8(&buf[..end + TRUNCATED.len()]).unwrap_or_default());
            rest = tail;
        }

        buf[..rest.len()].copy_from_slice(rest.as_bytes());
        buf[rest.len()] = b'\n';
        self.dispatch(std::str::from_utf8(&buf[..rest.len() + 1]).unwrap_or_default());
    }

    /// Newest first, stopping at the first handler that consumes the message.
    fn dispatch(&self, msg: &str) {
        let handlers = self.live();
        for handler in handlers.iter().rev() {
            match panic::catch_unwind(AssertUnwindSafe(|| handler.handle(msg))) {
                Ok(true) => break,
                Ok(false) => { }
                Err(_) => {
                    log_warn!("error handler panicked, notice dropped");
                    break;
                }
            }
        }
    }
}

impl<P: ConnectionPolicy> Session<P> {
    /// Add `handler` to the chain, it sees messages before every older handler.
    ///
    /// The session keeps a weak reference, the caller owns the handler and should
    /// unregister it before dropping it.
    pub fn register_errorhandler<H: ErrorHandler + 'static>(&mut self, handler: &Rc<H>) {
        let weak: Weak<dyn ErrorHandler> = Rc::downgrade(handler) as Weak<H>;
        let first = self.handlers.is_empty();
        self.handlers.push(weak);
        if first {
            self.set_notice_processor();
        }
    }

    /// Remove `handler` from the chain, unknown handlers are ignored.
    pub fn unregister_errorhandler<H: ErrorHandler + 'static>(&mut self, handler: &Rc<H>) {
        let target = Rc::as_ptr(handler) as *const ();
        if self.handlers.remove(target) && self.handlers.is_empty() {
            self.clear_notice_processor();
        }
    }

    /// Live handlers in registration order.
    pub fn errorhandlers(&self) -> Vec<Rc<dyn ErrorHandler>> {
        self.handlers.live()
    }

    /// Pass `msg` through the handler chain.
    ///
    /// Empty messages are dropped and a missing trailing newline is added.
    pub fn process_notice(&self, msg: &str) {
        self.handlers.process_notice(msg);
    }

    pub(super) fn set_notice_processor(&mut self) {
        let chain = Rc::downgrade(&self.handlers);
        if let Some(conn) = self.conn.as_mut() {
            conn.set_notice_processor(Some(Box::new(move |msg: &str| {
                if let Some(chain) = chain.upgrade() {
                    chain.process_notice(msg);
                }
            })));
        }
    }

    /// Install an inert callback, notices are discarded.
    pub(super) fn clear_notice_processor(&mut self) {
        if let Some(conn) = self.conn.as_mut() {
            conn.set_notice_processor(Some(Box::new(|_: &str| { })));
        }
    }
}
