//! Commands and their protocol event handling.
//!
//! A command is a unit of work that knows how to write its frontend messages,
//! and how to react to each backend message it can legally receive. Backend
//! messages are dispatched to the command at the head of the in-flight queue,
//! and `ReadyForQuery` is the single point where a command is resolved.
use std::sync::Arc;
use bytes::BytesMut;

use super::{holder::Shared, pending::Reply, startup::Init};
use crate::{
    Error, Result,
    collector::Collector,
    common::{ByteStr, verbose},
    encode::Encoded,
    error::EmptyQueryError,
    ext::UsizeExt,
    postgres::{
        BackendMessage, Oid, PgFormat, ProtocolError, TransactionStatus,
        backend::DataRow,
        frontend,
    },
    result::{FromResultSet, QueryResult, ResultSet},
    row::{DecodeError, Row, RowDescription},
    statement::{PortalName, StatementInfo, StatementName, Waiter},
};

/// Driver resources available to a command while handling a message.
pub(crate) struct Context<'a> {
    pub(crate) buf: &'a mut BytesMut,
    pub(crate) shared: &'a Shared,
}

/// Unit of work scheduled on a connection.
pub(crate) enum Command {
    Init(Init),
    SimpleQuery(SimpleQuery),
    Prepare(Prepare),
    ExtendedQuery(ExtendedQuery),
    ExtendedBatch(ExtendedBatch),
    ClosePortal(Close<PortalName>),
    CloseStatement(Close<StatementName>),
    /// Written directly, never waits for a response.
    Disconnect,
}

/// Outcome of a prepare owned by the statement cache.
pub(crate) struct Prepared {
    pub(crate) sql: ByteStr,
    pub(crate) result: Result<Arc<StatementInfo>>,
}

impl Command {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Self::Init(_) => "Init",
            Self::SimpleQuery(_) => "SimpleQuery",
            Self::Prepare(_) => "Prepare",
            Self::ExtendedQuery(_) => "ExtendedQuery",
            Self::ExtendedBatch(_) => "ExtendedBatch",
            Self::ClosePortal(_) => "ClosePortal",
            Self::CloseStatement(_) => "CloseStatement",
            Self::Disconnect => "Disconnect",
        }
    }

    /// Write frontend messages of this command.
    pub(crate) fn encode(&mut self, buf: &mut BytesMut) {
        match self {
            Self::Init(init) => init.encode(buf),
            Self::SimpleQuery(query) => frontend::write(frontend::Query { sql: &query.sql }, buf),
            Self::Prepare(prepare) => prepare.encode(buf),
            Self::ExtendedQuery(query) => query.encode(buf),
            Self::ExtendedBatch(batch) => batch.encode(buf),
            Self::ClosePortal(close) => close.encode(b'P', buf),
            Self::CloseStatement(close) => close.encode(b'S', buf),
            Self::Disconnect => frontend::write(frontend::Terminate, buf),
        }
    }

    /// Handle a non terminal message, returned error is fatal to the connection.
    pub(crate) fn handle(&mut self, msg: BackendMessage, cx: &mut Context) -> Result<()> {
        match self {
            Self::Init(init) => init.handle(msg, cx),
            Self::SimpleQuery(query) => query.handle(msg),
            Self::Prepare(prepare) => prepare.handle(msg),
            Self::ExtendedQuery(query) => query.exec.handle(msg, "ExtendedQuery"),
            Self::ExtendedBatch(batch) => batch.exec.handle(msg, "ExtendedBatch"),
            Self::ClosePortal(close) => close.handle(msg, "ClosePortal"),
            Self::CloseStatement(close) => close.handle(msg, "CloseStatement"),
            Self::Disconnect => Err(unexpected(&msg, "Disconnect")),
        }
    }

    /// Resolve the command on `ReadyForQuery`, results and errors are tagged
    /// with its transaction `status`.
    pub(crate) fn complete(self, status: TransactionStatus) -> Option<Prepared> {
        verbose!("{} completed, status {status:?}", self.name());
        match self {
            Self::Init(init) => init.complete(),
            Self::SimpleQuery(query) => query.sink.complete(outcome(query.error, status)),
            Self::Prepare(prepare) => return prepare.complete(status),
            Self::ExtendedQuery(query) => query.exec.complete(status),
            Self::ExtendedBatch(batch) => batch.exec.complete(status),
            Self::ClosePortal(close) => close.complete(status),
            Self::CloseStatement(close) => close.complete(status),
            Self::Disconnect => { }
        }
        None
    }

    /// Resolve the command with failure.
    pub(crate) fn fail(self, err: Error) -> Option<Prepared> {
        verbose!("{} failed: {err}", self.name());
        match self {
            Self::Init(init) => init.fail(err),
            Self::SimpleQuery(query) => query.sink.complete(Err(err)),
            Self::Prepare(prepare) => return prepare.fail(err),
            Self::ExtendedQuery(query) => query.exec.sink.complete(Err(err)),
            Self::ExtendedBatch(batch) => batch.exec.sink.complete(Err(err)),
            Self::ClosePortal(close) => close.fail(err),
            Self::CloseStatement(close) => close.fail(err),
            Self::Disconnect => { }
        }
        None
    }
}

fn unexpected(msg: &BackendMessage, phase: &'static str) -> Error {
    ProtocolError::unexpected_phase(msg.msgtype(), phase).into()
}

/// Terminal outcome of a command answered by `ReadyForQuery`.
fn outcome(error: Option<Error>, status: TransactionStatus) -> Result<TransactionStatus> {
    match error {
        Some(err) => Err(err.with_status(status)),
        None => Ok(status),
    }
}

/// Keep the first error of a command.
fn first_error(slot: &mut Option<Error>, err: impl Into<Error>) {
    if slot.is_none() {
        *slot = Some(err.into());
    }
}

// ===== Result sink =====

/// Type erased row collector with its completion reply.
pub(crate) trait ResultSink: Send {
    fn row(&mut self, row: Row) -> Result<(), DecodeError>;

    fn end(&mut self, columns: Option<RowDescription>, tag: ByteStr, rows_affected: u64, suspended: bool);

    /// `Ok` carries the transaction status of the completed command.
    fn complete(self: Box<Self>, result: Result<TransactionStatus>);
}

pub(crate) struct Results<C: Collector, O> {
    collector: C,
    acc: Option<C::Acc>,
    results: Vec<QueryResult<C::Output>>,
    reply: Reply<O>,
}

impl<C: Collector, O> Results<C, O> {
    pub(crate) fn boxed(collector: C, reply: Reply<O>) -> Box<dyn ResultSink>
    where
        O: FromResultSet<C::Output>,
    {
        Box::new(Results { collector, acc: None, results: Vec::with_capacity(1), reply })
    }
}

impl<C, O> ResultSink for Results<C, O>
where
    C: Collector,
    O: FromResultSet<C::Output>,
{
    fn row(&mut self, row: Row) -> Result<(), DecodeError> {
        let acc = self.acc.get_or_insert_with(|| self.collector.init());
        self.collector.collect(acc, row)
    }

    fn end(&mut self, columns: Option<RowDescription>, tag: ByteStr, rows_affected: u64, suspended: bool) {
        let acc = self.acc.take().unwrap_or_else(|| self.collector.init());
        self.results.push(QueryResult {
            rows: self.collector.finish(acc),
            rows_affected,
            columns,
            tag,
            suspended,
            transaction_status: TransactionStatus::default(),
        });
    }

    fn complete(self: Box<Self>, result: Result<TransactionStatus>) {
        let Results { mut results, reply, .. } = *self;
        match result {
            Ok(transaction_status) => {
                for result in &mut results {
                    result.transaction_status = transaction_status;
                }
                reply.send(O::from_set(ResultSet { results, transaction_status }))
            }
            Err(err) => reply.send(Err(err)),
        }
    }
}

/// Sink for commands scheduled internally whose result nobody waits.
pub(crate) struct Discard;

impl ResultSink for Discard {
    fn row(&mut self, _: Row) -> Result<(), DecodeError> {
        Ok(())
    }

    fn end(&mut self, _: Option<RowDescription>, _: ByteStr, _: u64, _: bool) { }

    fn complete(self: Box<Self>, _result: Result<TransactionStatus>) {
        #[cfg(feature = "log")]
        if let Err(err) = _result {
            log::warn!("background command failed: {err}");
        }
    }
}

// ===== SimpleQuery =====

/// Simple query protocol, `sql` may contain multiple statements.
pub(crate) struct SimpleQuery {
    sql: ByteStr,
    columns: Option<RowDescription>,
    sink: Box<dyn ResultSink>,
    error: Option<Error>,
}

impl SimpleQuery {
    pub(crate) fn new(sql: ByteStr, sink: Box<dyn ResultSink>) -> SimpleQuery {
        Self { sql, columns: None, sink, error: None }
    }

    fn handle(&mut self, msg: BackendMessage) -> Result<()> {
        match msg {
            BackendMessage::RowDescription(desc) => self.columns = Some(desc.description),
            BackendMessage::DataRow(row) => {
                let Some(columns) = &self.columns else {
                    return Err(ProtocolError::MissingDescription.into());
                };
                let row = Row::new(columns, row)?;
                if self.error.is_none() {
                    if let Err(err) = self.sink.row(row) {
                        first_error(&mut self.error, err);
                    }
                }
            }
            BackendMessage::CommandComplete(complete) => {
                let rows_affected = complete.rows_affected();
                self.sink.end(self.columns.take(), complete.tag, rows_affected, false);
            }
            BackendMessage::EmptyQueryResponse(_) => first_error(&mut self.error, EmptyQueryError),
            BackendMessage::ErrorResponse(err) => first_error(&mut self.error, err.error),
            msg => return Err(unexpected(&msg, "SimpleQuery")),
        }
        Ok(())
    }
}

// ===== Prepare =====

/// Who receives the prepared statement.
pub(crate) enum PrepareReply {
    Waiter(Waiter),
    /// Resolve the statement cache entry, which holds the waiters.
    Cache,
}

/// Parse and describe a named statement.
pub(crate) struct Prepare {
    pub(crate) sql: ByteStr,
    pub(crate) name: StatementName,
    types: Vec<Oid>,
    params: Option<Vec<Oid>>,
    columns: Option<Option<RowDescription>>,
    error: Option<Error>,
    pub(crate) reply: PrepareReply,
}

impl Prepare {
    pub(crate) fn new(sql: ByteStr, types: Vec<Oid>, waiter: Waiter) -> Prepare {
        Self {
            sql,
            name: StatementName::unnamed(),
            types,
            params: None,
            columns: None,
            error: None,
            reply: PrepareReply::Waiter(waiter),
        }
    }

    fn encode(&self, buf: &mut BytesMut) {
        frontend::write(frontend::Parse {
            prepare_name: self.name.as_str(),
            sql: &self.sql,
            oids_len: self.types.len().to_u16(),
            oids: self.types.iter().copied(),
        }, buf);
        frontend::write(frontend::Describe { kind: b'S', name: self.name.as_str() }, buf);
        frontend::write(frontend::Sync, buf);
    }

    fn handle(&mut self, msg: BackendMessage) -> Result<()> {
        match msg {
            BackendMessage::ParseComplete(_) => { }
            BackendMessage::ParameterDescription(desc) => self.params = Some(desc.oids),
            BackendMessage::RowDescription(desc) => {
                self.columns = Some(Some(desc.description.with_format(PgFormat::Binary)));
            }
            BackendMessage::NoData(_) => self.columns = Some(None),
            BackendMessage::ErrorResponse(err) => first_error(&mut self.error, err.error),
            msg => return Err(unexpected(&msg, "Prepare")),
        }
        Ok(())
    }

    /// The statement outlives the transaction, only failure is tagged with `status`.
    fn complete(mut self, status: TransactionStatus) -> Option<Prepared> {
        let result = match (self.error.take(), self.params.take(), self.columns.take()) {
            (Some(err), _, _) => Err(err.with_status(status)),
            (None, Some(params), Some(columns)) => Ok(Arc::new(StatementInfo {
                name: self.name.clone(),
                sql: self.sql.clone(),
                params,
                columns,
                cached: matches!(self.reply, PrepareReply::Cache),
            })),
            (None, _, _) => Err(ProtocolError::MissingDescription.into()),
        };
        self.resolve(result)
    }

    fn fail(self, err: Error) -> Option<Prepared> {
        self.resolve(Err(err))
    }

    fn resolve(self, result: Result<Arc<StatementInfo>>) -> Option<Prepared> {
        match self.reply {
            PrepareReply::Waiter(waiter) => {
                waiter.resolve(result);
                None
            }
            PrepareReply::Cache => Some(Prepared { sql: self.sql, result }),
        }
    }
}

// ===== Extended =====

/// Row handling shared by extended query and batch.
struct Execution {
    stmt: Arc<StatementInfo>,
    sink: Box<dyn ResultSink>,
    rows: u64,
    error: Option<Error>,
}

impl Execution {
    fn new(stmt: Arc<StatementInfo>, sink: Box<dyn ResultSink>) -> Execution {
        Self { stmt, sink, rows: 0, error: None }
    }

    fn handle(&mut self, msg: BackendMessage, phase: &'static str) -> Result<()> {
        match msg {
            BackendMessage::BindComplete(_) => { }
            BackendMessage::RowDescription(_) | BackendMessage::NoData(_) => { }
            BackendMessage::DataRow(row) => self.row(row)?,
            BackendMessage::CommandComplete(complete) => {
                let rows_affected = complete.rows_affected();
                self.rows = 0;
                self.sink.end(self.stmt.columns.clone(), complete.tag, rows_affected, false);
            }
            BackendMessage::PortalSuspended(_) => {
                let rows = std::mem::take(&mut self.rows);
                self.sink.end(self.stmt.columns.clone(), ByteStr::default(), rows, true);
            }
            BackendMessage::EmptyQueryResponse(_) => first_error(&mut self.error, EmptyQueryError),
            BackendMessage::ErrorResponse(err) => first_error(&mut self.error, err.error),
            msg => return Err(unexpected(&msg, phase)),
        }
        Ok(())
    }

    fn row(&mut self, row: DataRow) -> Result<()> {
        let Some(columns) = &self.stmt.columns else {
            return Err(ProtocolError::MissingDescription.into());
        };
        let row = Row::new(columns, row)?;
        self.rows += 1;
        if self.error.is_none() {
            if let Err(err) = self.sink.row(row) {
                first_error(&mut self.error, err);
            }
        }
        Ok(())
    }

    fn complete(self, status: TransactionStatus) {
        self.sink.complete(outcome(self.error, status));
    }
}

fn write_bind(stmt: &StatementInfo, portal: &str, params: Vec<Encoded>, buf: &mut BytesMut) {
    frontend::write(frontend::Bind {
        portal_name: portal,
        stmt_name: stmt.name.as_str(),
        param_formats_len: 1,
        param_formats: [PgFormat::Binary],
        params_len: params.len().to_u16(),
        params_size_hint: params.iter().map(Encoded::bind_size).sum(),
        params: params.into_iter(),
        result_formats_len: 1,
        result_formats: [PgFormat::Binary],
    }, buf);
}

/// Execute a prepared statement, optionally binding a portal first.
///
/// A `fetch` of zero fetch all rows. Without `bind`, the existing portal
/// is resumed.
pub(crate) struct ExtendedQuery {
    exec: Execution,
    bind: Option<Vec<Encoded>>,
    portal: PortalName,
    fetch: u32,
}

impl ExtendedQuery {
    pub(crate) fn new(
        stmt: Arc<StatementInfo>,
        bind: Option<Vec<Encoded>>,
        portal: PortalName,
        fetch: u32,
        sink: Box<dyn ResultSink>,
    ) -> ExtendedQuery {
        Self { exec: Execution::new(stmt, sink), bind, portal, fetch }
    }

    fn encode(&mut self, buf: &mut BytesMut) {
        if let Some(params) = self.bind.take() {
            write_bind(&self.exec.stmt, self.portal.as_str(), params, buf);
        }
        frontend::write(frontend::Execute { portal_name: self.portal.as_str(), max_row: self.fetch }, buf);
        frontend::write(frontend::Sync, buf);
    }
}

/// Execute a prepared statement once per parameter list, with a single `Sync`.
pub(crate) struct ExtendedBatch {
    exec: Execution,
    batch: Vec<Vec<Encoded>>,
}

impl ExtendedBatch {
    pub(crate) fn new(stmt: Arc<StatementInfo>, batch: Vec<Vec<Encoded>>, sink: Box<dyn ResultSink>) -> ExtendedBatch {
        Self { exec: Execution::new(stmt, sink), batch }
    }

    fn encode(&mut self, buf: &mut BytesMut) {
        for params in std::mem::take(&mut self.batch) {
            write_bind(&self.exec.stmt, "", params, buf);
            frontend::write(frontend::Execute { portal_name: "", max_row: 0 }, buf);
        }
        frontend::write(frontend::Sync, buf);
    }
}

// ===== Close =====

/// Close a portal or a statement.
pub(crate) struct Close<N> {
    name: N,
    reply: Option<Reply<()>>,
    error: Option<Error>,
}

impl<N: std::ops::Deref<Target = crate::statement::Id>> Close<N> {
    /// Without `reply`, failure is only logged.
    pub(crate) fn new(name: N, reply: Option<Reply<()>>) -> Close<N> {
        Self { name, reply, error: None }
    }

    fn encode(&self, variant: u8, buf: &mut BytesMut) {
        frontend::write(frontend::Close { variant, name: self.name.as_str() }, buf);
        frontend::write(frontend::Sync, buf);
    }

    fn handle(&mut self, msg: BackendMessage, phase: &'static str) -> Result<()> {
        match msg {
            BackendMessage::CloseComplete(_) => { }
            BackendMessage::ErrorResponse(err) => first_error(&mut self.error, err.error),
            msg => return Err(unexpected(&msg, phase)),
        }
        Ok(())
    }

    fn complete(mut self, status: TransactionStatus) {
        let result = outcome(self.error.take(), status).map(|_| ());
        self.resolve(result);
    }

    fn fail(self, err: Error) {
        self.resolve(Err(err));
    }

    fn resolve(self, result: Result<()>) {
        match self.reply {
            Some(reply) => reply.send(result),
            None => {
                #[cfg(feature = "log")]
                if let Err(err) = result {
                    log::warn!("failed to close {}: {err}", self.name.as_str());
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use bytes::Bytes;

    use super::*;
    use crate::{collector, connection::Pending, testing::msg};

    fn decode(frame: Vec<u8>) -> BackendMessage {
        let mut buf = BytesMut::from(&frame[..]);
        crate::postgres::codec::decode(&mut buf).unwrap().unwrap()
    }

    fn cx_handle(cmd: &mut Command, frame: Vec<u8>) -> Result<()> {
        let shared = Shared::new();
        let mut buf = BytesMut::new();
        cmd.handle(decode(frame), &mut Context { buf: &mut buf, shared: &shared })
    }

    #[tokio::test]
    async fn simple_query_collects_every_statement() {
        let (reply, pending) = Pending::<ResultSet<Vec<Row>>>::channel();
        let mut cmd = Command::SimpleQuery(SimpleQuery::new(
            "SELECT 1; UPDATE t SET a = 1".into(),
            Results::boxed(collector::rows(), reply),
        ));

        cx_handle(&mut cmd, msg::row_description(&[("a", 23)])).unwrap();
        cx_handle(&mut cmd, msg::data_row(&[Some(b"1")])).unwrap();
        cx_handle(&mut cmd, msg::command_complete("SELECT 1")).unwrap();
        cx_handle(&mut cmd, msg::command_complete("UPDATE 3")).unwrap();
        assert!(cmd.complete(TransactionStatus::Idle).is_none());

        let set = pending.await.unwrap();
        assert_eq!(set.len(), 2);
        assert_eq!(set.results()[0].rows().len(), 1);
        assert_eq!(set.results()[0].tag(), "SELECT 1");
        assert_eq!(set.results()[1].rows_affected(), 3);
        assert!(set.results()[1].columns().is_none());
        assert_eq!(set.rows_affected(), 4);
    }

    #[tokio::test]
    async fn first_error_wins() {
        let (reply, pending) = Pending::<ResultSet<()>>::channel();
        let mut cmd = Command::SimpleQuery(SimpleQuery::new(
            "x".into(),
            Results::boxed(collector::discard(), reply),
        ));

        cx_handle(&mut cmd, msg::error("42601", "first")).unwrap();
        cx_handle(&mut cmd, msg::error("42P01", "second")).unwrap();
        cmd.complete(TransactionStatus::Idle);

        let err = pending.await.unwrap_err();
        assert_eq!(err.as_database().unwrap().code(), "42601");
    }

    #[tokio::test]
    async fn empty_query() {
        let (reply, pending) = Pending::<ResultSet<()>>::channel();
        let mut cmd = Command::SimpleQuery(SimpleQuery::new(
            "".into(),
            Results::boxed(collector::discard(), reply),
        ));
        cx_handle(&mut cmd, msg::empty_query()).unwrap();
        cmd.complete(TransactionStatus::Idle);
        assert!(matches!(pending.await.unwrap_err().kind(), crate::ErrorKind::EmptyQuery(_)));
    }

    #[test]
    fn unexpected_message_is_fatal() {
        let (reply, _pending) = Pending::<ResultSet<()>>::channel();
        let mut cmd = Command::SimpleQuery(SimpleQuery::new(
            "x".into(),
            Results::boxed(collector::discard(), reply),
        ));
        let err = cx_handle(&mut cmd, msg::parse_complete()).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn data_row_without_description_is_fatal() {
        let (reply, _pending) = Pending::<ResultSet<Vec<Row>>>::channel();
        let mut cmd = Command::SimpleQuery(SimpleQuery::new(
            "x".into(),
            Results::boxed(collector::rows(), reply),
        ));
        let row = msg::data_row(&[Some(b"1")]);
        assert!(cx_handle(&mut cmd, row).unwrap_err().is_fatal());
    }

    #[test]
    fn extended_frames() {
        let stmt = Arc::new(StatementInfo {
            name: StatementName::unnamed(),
            sql: "SELECT $1".into(),
            params: vec![23],
            columns: None,
            cached: false,
        });
        let (reply, _pending) = Pending::<QueryResult<()>>::channel();
        let mut cmd = Command::ExtendedQuery(ExtendedQuery::new(
            stmt,
            Some(vec![Encoded::new(Bytes::from_static(&[0, 0, 0, 7]), 23)]),
            PortalName::unnamed(),
            0,
            Results::boxed(collector::discard(), reply),
        ));

        let mut buf = BytesMut::new();
        cmd.encode(&mut buf);
        let tags = crate::testing::frame_tags(&buf);
        assert_eq!(tags, b"BES");
    }
}
