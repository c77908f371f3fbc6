//! Postgres Frontend and Backend Protocol
//!
//! Only the subset of the protocol a blocking session needs is covered here:
//! startup with cleartext or trust authentication, the simple and extended query cycle,
//! `COPY` in both directions, asynchronous notices and notifications, and cancel requests.
//!
//! ## Messaging Overview
//!
//! All communication is through a stream of messages. The first byte of a message identifies the message type,
//! and the next four bytes specify the length of the rest of the message (this length count includes itself,
//! but not the message-type byte). The remaining contents of the message are determined by the message type.
//!
//! ```text
//! ┏━━━━┳━━━━━━━━━━━━━━━━━━━┳━━━━━━┓
//! ┃ Ty ┃       Length      ┃ Body ┃
//! ┣━━━━╋━━━━━━━━━━━━━━━━━━━╋━━━━━━┫
//! ┃ u8 ┃        u32        ┃ [u8] ┃
//! ┗━━━━┻━━━━━━━━━━━━━━━━━━━┻━━━━━━┛
//! ```
//!
//! For historical reasons, the very first message sent by the client (the startup message)
//! has no initial message-type byte. The same holds for the cancel request, which is sent
//! on a fresh connection instead of a startup message.
//!
//! <https://www.postgresql.org/docs/17/protocol-overview.html>

mod pg_format;
mod fields;

pub mod frontend;
pub mod backend;

mod error;

/// Postgres object identifier.
pub type Oid = u32;

pub use pg_format::PgFormat;
pub use fields::{DatabaseError, ErrorVerbosity};

pub use frontend::FrontendProtocol;
pub use backend::{BackendMessage, BackendProtocol, ErrorResponse, NoticeResponse};
pub use error::ProtocolError;
