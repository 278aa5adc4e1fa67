//! `pgpipe` error types.
use std::{
    backtrace::{Backtrace, BacktraceStatus},
    fmt, io,
    str::Utf8Error,
    sync::Arc,
};

use crate::{
    common::unit_error,
    connection::{ParseError, State},
    postgres::{DatabaseError, Oid, ProtocolError, TransactionStatus},
    row::DecodeError,
};

/// A specialized [`Result`] type for `pgpipe` operation.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// All possible error from `pgpipe` library.
///
/// A single failure can be reported to many waiters, e.g. all queued commands
/// when connection is lost, use [`Error::replicate`] to obtain a copy.
pub struct Error {
    context: String,
    backtrace: Arc<Backtrace>,
    kind: ErrorKind,
    status: Option<TransactionStatus>,
}

impl Error {
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }

    /// Returns the database error if the server reported one.
    pub fn as_database(&self) -> Option<&DatabaseError> {
        match &self.kind {
            ErrorKind::Database(e) => Some(e),
            _ => None,
        }
    }

    /// Returns `true` if the error is caused by the connection being closed.
    pub fn is_closed(&self) -> bool {
        matches!(self.kind, ErrorKind::Closed(_))
    }

    /// Returns `true` if the error leaves the connection unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::Protocol(_) | ErrorKind::Io(_) | ErrorKind::UnsupportedAuth(_) | ErrorKind::Closed(_)
        )
    }

    /// Transaction status reported right after the failed command, [`None`]
    /// if the command never reached `ReadyForQuery`.
    pub fn transaction_status(&self) -> Option<TransactionStatus> {
        self.status
    }

    pub(crate) fn with_status(mut self, status: TransactionStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Add context message.
    pub fn context(mut self, context: impl Into<String>) -> Self {
        self.context = context.into();
        self
    }

    /// Create a copy of this error, sharing the backtrace.
    pub fn replicate(&self) -> Error {
        Self {
            context: self.context.clone(),
            backtrace: self.backtrace.clone(),
            kind: self.kind.replicate(),
            status: self.status,
        }
    }
}

/// All possible error kind from `pgpipe` library.
pub enum ErrorKind {
    Config(ParseError),
    Protocol(ProtocolError),
    Io(io::Error),
    Database(DatabaseError),
    Utf8(Utf8Error),
    EmptyQuery(EmptyQueryError),
    UnsupportedAuth(UnsupportedAuth),
    Decode(DecodeError),
    Closed(ClosedError),
    Usage(UsageError),
    TransactionRolledBack(TransactionRolledBack),
}

impl ErrorKind {
    fn replicate(&self) -> ErrorKind {
        match self {
            Self::Config(e) => Self::Config(e.clone()),
            Self::Protocol(e) => Self::Protocol(e.clone()),
            Self::Io(e) => Self::Io(io::Error::new(e.kind(), e.to_string())),
            Self::Database(e) => Self::Database(e.clone()),
            Self::Utf8(e) => Self::Utf8(*e),
            Self::EmptyQuery(e) => Self::EmptyQuery(e.clone()),
            Self::UnsupportedAuth(e) => Self::UnsupportedAuth(e.clone()),
            Self::Decode(e) => Self::Decode(e.clone()),
            Self::Closed(e) => Self::Closed(e.clone()),
            Self::Usage(e) => Self::Usage(e.clone()),
            Self::TransactionRolledBack(e) => Self::TransactionRolledBack(e.clone()),
        }
    }
}

macro_rules! from {
    (<$ty:ty>$pat:pat => $body:expr) => {
        impl From<$ty> for Error {
            fn from($pat: $ty) -> Self {
                let backtrace = Arc::new(Backtrace::capture());
                Self { context: String::new(), backtrace, kind: $body, status: None }
            }
        }
    };
}

from!(<ErrorKind>e => e);
from!(<ParseError>e => ErrorKind::Config(e));
from!(<ProtocolError>e => ErrorKind::Protocol(e));
from!(<io::Error>e => ErrorKind::Io(e));
from!(<DatabaseError>e => ErrorKind::Database(e));
from!(<Utf8Error>e => ErrorKind::Utf8(e));
from!(<EmptyQueryError>e => ErrorKind::EmptyQuery(e));
from!(<UnsupportedAuth>e => ErrorKind::UnsupportedAuth(e));
from!(<DecodeError>e => ErrorKind::Decode(e));
from!(<ClosedError>e => ErrorKind::Closed(e));
from!(<UsageError>e => ErrorKind::Usage(e));
from!(<TransactionRolledBack>e => ErrorKind::TransactionRolledBack(e));

unit_error! {
    /// Query string contains no statement.
    pub struct EmptyQueryError("query string is empty");
}

unit_error! {
    /// Connection closed before the command completed.
    pub struct ClosedError("connection closed");
}

unit_error! {
    /// Commit is requested but the server rolled back the transaction.
    pub struct TransactionRolledBack("transaction rolled back");
}

/// Server requested an authentication method that is not supported.
#[derive(Clone, PartialEq, Eq)]
pub struct UnsupportedAuth {
    pub(crate) method: &'static str,
}

impl UnsupportedAuth {
    pub fn method(&self) -> &'static str {
        self.method
    }
}

impl std::error::Error for UnsupportedAuth { }

impl fmt::Display for UnsupportedAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unsupported authentication method: {}", self.method)
    }
}

impl fmt::Debug for UnsupportedAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

/// Invalid use of the client api.
#[derive(Clone, PartialEq, Eq)]
pub enum UsageError {
    /// Command scheduled while connection is not connected.
    ConnectionNotOpen(State),
    /// Transaction started while another transaction is active.
    TransactionActive,
    /// Prepared statement used after it is closed.
    StatementClosed,
    /// Mismatch parameter count for prepared statement.
    ParamCount { expected: usize, found: usize },
    /// Mismatch parameter type for prepared statement.
    ParamType { index: usize, expected: Oid, found: Oid },
    /// Cursor read after all rows are consumed or cursor is closed.
    CursorExhausted,
    /// Blocking wait called from within the connection driver.
    BlockingInDriver,
}

impl std::error::Error for UsageError { }

impl fmt::Display for UsageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionNotOpen(state) => write!(f, "connection is not open ({state:?})"),
            Self::TransactionActive => f.write_str("a transaction is already active"),
            Self::StatementClosed => f.write_str("prepared statement is closed"),
            Self::ParamCount { expected, found } => {
                write!(f, "expected {expected} parameters, found {found}")
            }
            Self::ParamType { index, expected, found } => write!(
                f,
                "parameter ${} expected type oid {expected}, found {found}",
                index + 1
            ),
            Self::CursorExhausted => f.write_str("cursor has no more rows"),
            Self::BlockingInDriver => f.write_str("blocking wait inside connection driver"),
        }
    }
}

impl fmt::Debug for UsageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

impl std::error::Error for Error { }

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.context.is_empty() {
            write!(f, "{}: ", self.context)?;
        }

        fmt::Display::fmt(&self.kind, f)?;

        if let BacktraceStatus::Captured = self.backtrace.status() {
            let mut backtrace = self.backtrace.to_string();
            write!(f, "\n\n")?;
            writeln!(f, "Stack backtrace:")?;
            backtrace.truncate(backtrace.trim_end().len());
            write!(f, "{}", backtrace)?;
        }

        Ok(())
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

impl std::error::Error for ErrorKind { }

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(e) => e.fmt(f),
            Self::Protocol(e) => e.fmt(f),
            Self::Io(e) => e.fmt(f),
            Self::Database(e) => e.fmt(f),
            Self::UnsupportedAuth(e) => e.fmt(f),
            Self::EmptyQuery(e) => e.fmt(f),
            Self::Decode(e) => e.fmt(f),
            Self::Utf8(e) => e.fmt(f),
            Self::Closed(e) => e.fmt(f),
            Self::Usage(e) => e.fmt(f),
            Self::TransactionRolledBack(e) => e.fmt(f),
        }
    }
}

impl fmt::Debug for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}
