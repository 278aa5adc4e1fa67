//! Protocol error
use std::{fmt, str::Utf8Error};
use bytes::TryGetError;

use super::BackendMessage;

/// An error when translating buffer from postgres.
///
/// Protocol error is always fatal, the connection is closed because the
/// position in the byte stream can no longer be trusted.
#[derive(Clone)]
pub enum ProtocolError {
    Unexpected {
        expect: Option<u8>,
        found: u8,
        phase: Option<&'static str>,
    },
    UnknownAuth {
        auth: u32,
    },
    /// Message body is shorter than its content.
    Truncated,
    /// Declared message length is invalid.
    Length {
        msgtype: u8,
        len: u32,
    },
    Utf8(Utf8Error),
    TransactionStatus(u8),
    /// `DataRow` column count differ from its `RowDescription`.
    ColumnCount {
        expect: usize,
        found: u16,
    },
    /// Message that requires a `RowDescription` arrived without one.
    MissingDescription,
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
            ProtocolError::Truncated => f.write_str("Message body truncated"),
            ProtocolError::Length { msgtype, len } => write!(
                f,
                "Invalid length `{len}` for message `{}`",
                BackendMessage::message_name(msgtype),
            ),
            ProtocolError::Utf8(ref e) => write!(f, "Invalid string in message: {e}"),
            ProtocolError::TransactionStatus(s) => write!(f, "Unknown transaction status `{}`", s as char),
            ProtocolError::ColumnCount { expect, found } => {
                write!(f, "DataRow has {found} columns while RowDescription has {expect}")
            },
            ProtocolError::MissingDescription => f.write_str("DataRow received without RowDescription"),
        }
    }
}

impl fmt::Debug for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl From<TryGetError> for ProtocolError {
    fn from(_: TryGetError) -> Self {
        Self::Truncated
    }
}

impl From<Utf8Error> for ProtocolError {
    fn from(value: Utf8Error) -> Self {
        Self::Utf8(value)
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

    pub(crate) fn truncated() -> ProtocolError {
        Self::Truncated
    }
}
