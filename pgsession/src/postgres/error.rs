//! Protocol error
use std::fmt;

use super::BackendMessage;

/// An error when translating buffer from postgres
pub enum ProtocolError {
    Unexpected {
        expect: Option<u8>,
        found: u8,
        phase: Option<&'static str>,
    },
    UnknownAuth {
        auth: u32,
    },
    Malformed {
        what: &'static str,
    },
}

impl std::error::Error for ProtocolError { }

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            ProtocolError::Unexpected { expect, found, phase } => {
                let found = BackendMessage::message_name(found);
                match expect {
                    Some(m) => {
                        write!(
                            f,
                            "Expected message `{}` found `{found}`",
                            BackendMessage::message_name(m),
                        )?
                    },
                    None => write!(f, "Unexpected message `{found}`")?,
                }
                if let Some(phase) = phase {
                    write!(f, " in `{phase}`")?
                }
                Ok(())
            },
            ProtocolError::UnknownAuth { auth } => write!(f, "Unknown authentication request `{auth}`"),
            ProtocolError::Malformed { what } => write!(f, "Malformed message, failed to read {what}"),
        }
    }
}

impl fmt::Debug for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl ProtocolError {
    pub(crate) fn unknown(found: u8) -> ProtocolError {
        Self::Unexpected {
            expect: None,
            found,
            phase: None,
        }
    }

    pub(crate) fn unexpected(expect: u8, found: u8) -> ProtocolError {
        Self::Unexpected {
            expect: Some(expect),
            found,
            phase: None,
        }
    }

    pub(crate) fn unexpected_phase(found: u8, phase: &'static str) -> ProtocolError {
        Self::Unexpected {
            expect: None,
            found,
            phase: Some(phase),
        }
    }

    pub(crate) fn unknown_auth(auth: u32) -> ProtocolError {
        Self::UnknownAuth { auth }
    }

    pub(crate) fn malformed(what: &'static str) -> ProtocolError {
        Self::Malformed { what }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn message_names() {
        assert_eq!(
            ProtocolError::unexpected(b'Z', b'D').to_string(),
            "Expected message `ReadyForQuery` found `DataRow`",
        );
        assert_eq!(
            ProtocolError::unexpected_phase(b'A', "startup").to_string(),
            "Unexpected message `NotificationResponse` in `startup`",
        );
        assert_eq!(ProtocolError::unknown_auth(10).to_string(), "Unknown authentication request `10`");
    }
}
