//! Blocking wire protocol driver.
//!
//! [`PgConn`] speaks the postgres frontend/backend protocol over a tcp or unix socket
//! and implements [`Driver`][crate::driver::Driver] for the session.
//!
//! Only cleartext password and trust authentication are supported, and there is no TLS.
mod stream;
mod startup;
mod conn;
mod cancel;

pub use stream::{Socket, Transport};
pub use startup::UnsupportedAuth;
pub use conn::PgConn;
pub use cancel::PgCancel;
