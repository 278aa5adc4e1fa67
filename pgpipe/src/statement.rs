//! Prepared statement.
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use crate::{
    Connection, Result,
    collector::{self, Collector},
    common::ByteStr,
    connection::{
        Pending,
        command::{Close, Command, ExtendedBatch, ExtendedQuery, Results},
        holder::Shared,
        pending::Reply,
    },
    cursor::{Cursor, RowStream},
    encode::{Encoded, IntoParams},
    error::UsageError,
    postgres::Oid,
    result::{QueryResult, ResultSet},
    row::{Row, RowDescription},
};

/// Statement or portal name, a prefix followed by zero padded sequence.
#[derive(Clone, PartialEq, Eq)]
pub struct Id([u8; 11]);

impl Id {
    fn unnamed() -> Self {
        Self([b'?'; 11])
    }

    fn next(prefix: u8, shared: &Shared) -> Self {
        let id = shared.next_id();
        let mut buf = [b'0'; 11];
        buf[0] = prefix;
        let len = buf.len();

        let mut b = itoa::Buffer::new();
        let id = b.format(id);
        let i = id.as_bytes();
        buf[len - i.len()..].copy_from_slice(i);

        Self(buf)
    }

    pub fn as_str(&self) -> &str {
        if self.is_unnamed() {
            return "";
        }
        // SAFETY: string only construction and is immutable
        unsafe { std::str::from_utf8_unchecked(&self.0[..]) }
    }

    pub fn is_unnamed(&self) -> bool {
        self.0[0] == b'?'
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::fmt::Debug for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_tuple("Id").field(&self.as_str()).finish()
    }
}

macro_rules! delegate {
    ($name:ident, $prefix:literal) => {
        #[derive(Clone, PartialEq, Eq)]
        pub struct $name(Id);

        impl $name {
            pub(crate) fn unnamed() -> Self {
                Self(Id::unnamed())
            }

            /// Next name in the connection sequence.
            pub(crate) fn next(shared: &Shared) -> Self {
                Self(Id::next($prefix, shared))
            }
        }

        impl std::ops::Deref for $name {
            type Target = Id;

            fn deref(&self) -> &Self::Target {
                &self.0
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.debug_tuple(stringify!($name)).field(&self.as_str()).finish()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

delegate!(StatementName, b's');
delegate!(PortalName, b'p');

/// Server side description of a prepared statement.
#[derive(Debug)]
pub(crate) struct StatementInfo {
    pub(crate) name: StatementName,
    pub(crate) sql: ByteStr,
    /// Parameter types reported by `ParameterDescription`.
    pub(crate) params: Vec<Oid>,
    /// Result columns in binary format, [`None`] for `NoData`.
    pub(crate) columns: Option<RowDescription>,
    /// Owned by the statement cache.
    pub(crate) cached: bool,
}

/// Caller waiting for a statement to be prepared.
pub(crate) struct Waiter {
    conn: Connection,
    reply: Reply<PreparedStatement>,
}

impl Waiter {
    pub(crate) fn new(conn: Connection, reply: Reply<PreparedStatement>) -> Waiter {
        Self { conn, reply }
    }

    pub(crate) fn resolve(self, result: Result<Arc<StatementInfo>>) {
        let conn = self.conn;
        self.reply.send(result.map(|info|PreparedStatement::new(conn, info)));
    }
}

const TEXT_OIDS: &[Oid] = &[25, 1043, 1042, 19, 705];

fn is_compatible(expected: Oid, found: Oid) -> bool {
    expected == 0
        || found == 0
        || expected == found
        || (TEXT_OIDS.contains(&expected) && TEXT_OIDS.contains(&found))
}

/// A statement prepared on the connection.
///
/// Execution uses binary format for both parameters and results.
pub struct PreparedStatement {
    conn: Connection,
    info: Arc<StatementInfo>,
    closed: AtomicBool,
}

impl PreparedStatement {
    pub(crate) fn new(conn: Connection, info: Arc<StatementInfo>) -> PreparedStatement {
        Self { conn, info, closed: AtomicBool::new(false) }
    }

    /// Returns the statement name.
    pub fn name(&self) -> &str {
        self.info.name.as_str()
    }

    /// Returns the sql text.
    pub fn sql(&self) -> &str {
        &self.info.sql
    }

    /// Returns the parameter types.
    pub fn params(&self) -> &[Oid] {
        &self.info.params
    }

    /// Returns the result columns, [`None`] if statement does not return rows.
    pub fn columns(&self) -> Option<&RowDescription> {
        self.info.columns.as_ref()
    }

    /// Returns `true` if this handle is closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn info(&self) -> &Arc<StatementInfo> {
        &self.info
    }

    /// Check parameters before anything is sent.
    pub(crate) fn validate(&self, params: &[Encoded]) -> Result<(), UsageError> {
        if self.is_closed() {
            return Err(UsageError::StatementClosed);
        }
        if params.len() != self.info.params.len() {
            return Err(UsageError::ParamCount { expected: self.info.params.len(), found: params.len() });
        }
        for (index, (&expected, param)) in self.info.params.iter().zip(params).enumerate() {
            if !is_compatible(expected, param.oid()) {
                return Err(UsageError::ParamType { index, expected, found: param.oid() });
            }
        }
        Ok(())
    }

    /// Execute statement and collect all rows.
    pub fn execute(&self, params: impl IntoParams) -> Pending<QueryResult<Vec<Row>>> {
        self.execute_with(params, collector::rows())
    }

    /// Execute statement and collect rows with `collector`.
    pub fn execute_with<C: Collector>(&self, params: impl IntoParams, collector: C) -> Pending<QueryResult<C::Output>> {
        let params = params.into_params();
        if let Err(err) = self.validate(&params) {
            return Pending::ready(Err(err.into()));
        }
        let (reply, pending) = Pending::channel();
        self.conn.schedule(Command::ExtendedQuery(ExtendedQuery::new(
            self.info.clone(),
            Some(params),
            PortalName::unnamed(),
            0,
            Results::boxed(collector, reply),
        )));
        pending
    }

    /// Execute statement once for each parameter list, in a single round trip.
    pub fn batch<I>(&self, batch: I) -> Pending<ResultSet<Vec<Row>>>
    where
        I: IntoIterator,
        I::Item: IntoParams,
    {
        self.batch_with(batch, collector::rows())
    }

    /// Execute statement once for each parameter list, collect rows with `collector`.
    ///
    /// Failure of any execution fails the whole batch.
    pub fn batch_with<I, C>(&self, batch: I, collector: C) -> Pending<ResultSet<C::Output>>
    where
        I: IntoIterator,
        I::Item: IntoParams,
        C: Collector,
    {
        let batch = batch.into_iter().map(IntoParams::into_params).collect::<Vec<_>>();
        if let Err(err) = batch.iter().try_for_each(|params|self.validate(params)) {
            return Pending::ready(Err(err.into()));
        }
        let (reply, pending) = Pending::channel();
        self.conn.schedule(Command::ExtendedBatch(ExtendedBatch::new(
            self.info.clone(),
            batch,
            Results::boxed(collector, reply),
        )));
        pending
    }

    /// Bind parameters to a cursor.
    pub fn cursor(&self, params: impl IntoParams) -> Result<Cursor> {
        let params = params.into_params();
        self.validate(&params)?;
        Ok(Cursor::new(self.conn.clone(), self.info.clone(), params))
    }

    /// Stream rows, fetching `fetch` rows at a time.
    pub fn stream(&self, fetch: u32, params: impl IntoParams) -> Result<RowStream> {
        Ok(RowStream::new(self.cursor(params)?, fetch))
    }

    /// Close the statement.
    ///
    /// Closing a cached statement only closes this handle, the server
    /// statement stays owned by the statement cache.
    pub fn close(&self) -> Pending<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Pending::ready(Err(UsageError::StatementClosed.into()));
        }
        if self.info.cached {
            return Pending::ready(Ok(()));
        }
        let (reply, pending) = Pending::channel();
        self.conn.schedule(Command::CloseStatement(Close::new(self.info.name.clone(), Some(reply))));
        pending
    }
}

impl std::fmt::Debug for PreparedStatement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreparedStatement")
            .field("name", &self.info.name)
            .field("sql", &self.info.sql)
            .field("params", &self.info.params)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{ErrorKind, encode::Encode, testing};

    fn statement(params: Vec<Oid>, cached: bool) -> PreparedStatement {
        let info = StatementInfo {
            name: StatementName::next(&Shared::new()),
            sql: "SELECT $1".into(),
            params,
            columns: None,
            cached,
        };
        PreparedStatement::new(testing::detached(), Arc::new(info))
    }

    #[test]
    fn name_sequence() {
        let shared = Shared::new();
        assert_eq!(StatementName::next(&shared).as_str(), "s0000000000");
        assert_eq!(PortalName::next(&shared).as_str(), "p0000000001");
        assert_eq!(StatementName::unnamed().as_str(), "");
    }

    #[test]
    fn validate_params() {
        let stmt = statement(vec![23, 25], false);
        assert!(stmt.validate(&(1i32, "a").into_params()).is_ok());
        assert!(stmt.validate(&(1i32, Encoded::null(0)).into_params()).is_ok());
        assert_eq!(
            stmt.validate(&(1i32,).into_params()),
            Err(UsageError::ParamCount { expected: 2, found: 1 }),
        );
        assert_eq!(
            stmt.validate(&(1i64, "a").into_params()),
            Err(UsageError::ParamType { index: 0, expected: 23, found: 20 }),
        );
        assert!(stmt.validate(&vec![1i32.encode(), String::from("a").encode()]).is_ok());
    }

    #[tokio::test]
    async fn close_twice_is_usage_error() {
        let stmt = statement(vec![], true);
        stmt.close().await.unwrap();
        let err = stmt.close().await.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Usage(UsageError::StatementClosed)));

        let err = stmt.execute(()).await.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Usage(UsageError::StatementClosed)));
    }
}
