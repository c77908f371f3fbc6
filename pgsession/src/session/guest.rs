//! The transaction slot and session variables.
use std::{
    ptr,
    rc::{Rc, Weak},
};

use super::Session;
use crate::{
    Error, Result,
    driver::ConnectionPolicy,
};

/// A transaction running on a [`Session`].
///
/// At most one is registered at a time. While it is, notifications stay queued and
/// variable access goes through it.
pub trait TransactionGuest {
    /// Human readable name used in diagnostics, e.g. `transaction 'audit'`.
    fn description(&self) -> String;

    /// `var` is about to be set to `value` within this transaction.
    fn set_variable(&self, var: &str, value: &str) {
        let _ = (var, value);
    }

    /// Value of `var` as known to this transaction, `None` asks the server.
    fn get_variable(&self, var: &str) -> Option<String> {
        let _ = var;
        None
    }
}

impl<P: ConnectionPolicy> Session<P> {
    /// The registered transaction, if it is still alive.
    pub(super) fn transaction(&self) -> Option<Rc<dyn TransactionGuest>> {
        self.trans.as_ref().and_then(Weak::upgrade)
    }

    /// Make `guest` the session's transaction.
    ///
    /// Fails with a usage error while another transaction is registered.
    pub fn register_transaction<T: TransactionGuest + 'static>(&mut self, guest: &Rc<T>) -> Result<()> {
        if let Some(current) = self.transaction() {
            return Err(Error::usage(format!(
                "Started {} while {} still active.",
                guest.description(),
                current.description(),
            )));
        }
        let weak: Weak<dyn TransactionGuest> = Rc::downgrade(guest) as Weak<T>;
        self.trans = Some(weak);
        Ok(())
    }

    /// Clear the transaction slot, never fails.
    ///
    /// A mismatch with the registered transaction is reported as a notice.
    pub fn unregister_transaction<T: TransactionGuest + 'static>(&mut self, guest: &Rc<T>) {
        let target = Rc::as_ptr(guest) as *const ();
        let current = self.trans.as_ref().filter(|e| e.strong_count() != 0);
        match current {
            Some(current) if ptr::addr_eq(current.as_ptr(), target) => self.trans = None,
            Some(current) => {
                let expected = current.upgrade().map(|e| e.description()).unwrap_or_default();
                self.process_notice(&format!(
                    "Closing {}; expected to close {}",
                    guest.description(),
                    expected,
                ));
            }
            None => {
                self.trans = None;
                self.process_notice(&format!("Closing {} which wasn't open", guest.description()));
            }
        }
    }

    /// Set a session variable.
    ///
    /// Without a transaction this is a silent no-op on a session that is not open.
    pub fn set_variable(&mut self, var: &str, value: &str) -> Result<()> {
        match self.transaction() {
            Some(trans) => {
                trans.set_variable(var, value);
                self.raw_set_var(var, value)
            }
            None if self.is_open() => self.raw_set_var(var, value),
            None => Ok(()),
        }
    }

    /// Read a session variable.
    pub fn get_variable(&mut self, var: &str) -> Result<String> {
        if let Some(value) = self.transaction().and_then(|e| e.get_variable(var)) {
            return Ok(value);
        }
        self.raw_get_var(var)
    }

    fn raw_set_var(&mut self, var: &str, value: &str) -> Result<()> {
        self.exec(&format!("SET {var}={value}"))?;
        Ok(())
    }

    fn raw_get_var(&mut self, var: &str) -> Result<String> {
        let result = self.exec(&format!("SHOW {var}"))?;
        match result.text(0, 0)? {
            Some(value) => Ok(value.to_owned()),
            None => Err(Error::failure(format!("SHOW {var} returned no value"))),
        }
    }
}
