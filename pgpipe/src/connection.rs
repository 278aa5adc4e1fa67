//! Postgres connection.
//!
//! A [`Connection`] is a cheap handle to a driver task that owns the socket.
//! Every operation is scheduled onto the driver and returns immediately, so
//! commands from any number of handles are pipelined on a single socket.
use std::{pin::Pin, sync::Arc};
use tokio::sync::mpsc::{self, UnboundedSender};

use crate::{
    Result,
    collector::{self, Collector},
    common::{ByteStr, verbose},
    encode::IntoParams,
    error::Error,
    net::{Socket, Stream},
    postgres::{TransactionStatus, backend::BackendKeyData},
    result::{QueryResult, ResultSet},
    row::Row,
    statement::{PreparedStatement, Waiter},
    transaction::Transaction,
};

mod cache;
mod config;
mod driver;
mod startup;
mod tls;

pub(crate) mod command;
pub(crate) mod holder;
pub(crate) mod pending;

pub use config::{Config, DEFAULT_PIPELINING_LIMIT, ParseError, SslMode};
pub use holder::{Notification, State};
pub use pending::Pending;
pub use tls::{TlsConnector, UpgradeFuture};

use command::{Close, Command, Prepare, Results, SimpleQuery};
use driver::{Driver, Request};
use holder::Shared;
use startup::Init;

pub(crate) type ConnectFuture = Pin<Box<dyn Future<Output = Result<Connection>> + Send + 'static>>;

/// Opens connections for long lived owners, [`Pool`][crate::Pool] and
/// [`Subscriber`][crate::Subscriber].
pub(crate) type Connector = Arc<dyn Fn(&Config) -> ConnectFuture + Send + Sync>;

pub(crate) fn connector() -> Connector {
    Arc::new(|config: &Config| -> ConnectFuture {
        Box::pin(Connection::connect_with(config.clone()))
    })
}

/// Handle to a postgres connection.
///
/// Cloning is cheap, every clone schedules onto the same connection. The
/// connection is closed when [`close`][Connection::close] is called or all
/// handles are dropped.
#[derive(Clone)]
pub struct Connection {
    send: UnboundedSender<Request>,
    shared: Arc<Shared>,
}

impl Connection {
    /// Connect with url.
    pub async fn connect(url: &str) -> Result<Connection> {
        Self::connect_with(Config::parse(url)?).await
    }

    /// Connect using environment variable.
    ///
    /// See [`Config::from_env`] for more details.
    pub async fn connect_env() -> Result<Connection> {
        Self::connect_with(Config::from_env()).await
    }

    /// Connect with config.
    pub async fn connect_with(config: Config) -> Result<Connection> {
        let socket = match &config.socket {
            Some(path) => Socket::connect_socket(path).await?,
            None => Socket::connect_tcp(&config.host, config.port).await?,
        };
        let socket = tls::negotiate(socket, &config).await?;
        Self::start(socket, &config).await
    }

    /// Connect over an already established transport.
    ///
    /// SSL negotiation is still performed according to [`Config::ssl`].
    pub async fn connect_stream<S: Stream>(stream: S, config: Config) -> Result<Connection> {
        let socket = tls::negotiate(Socket::from_stream(stream), &config).await?;
        Self::start(socket, &config).await
    }

    async fn start(socket: Socket, config: &Config) -> Result<Connection> {
        let (send, recv) = mpsc::unbounded_channel();
        let shared = Shared::new();
        let (reply, init) = Pending::channel();

        let driver = Driver::new(socket, recv, shared.clone(), config, Command::Init(Init::new(config, reply)));
        tokio::spawn(driver);

        let conn = Connection { send, shared };
        init.await?;
        verbose!("connection ready");
        Ok(conn)
    }

    /// Connection that is closed since creation, used where a handle is
    /// required but nothing may be sent.
    #[cfg(test)]
    pub(crate) fn detached() -> Connection {
        let (send, _) = mpsc::unbounded_channel();
        let shared = Shared::new();
        shared.advance(State::Closed);
        Connection { send, shared }
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    pub(crate) fn schedule(&self, cmd: Command) {
        if let Err(err) = self.send.send(Request::Schedule(cmd)) {
            err.0.reject(State::Closed);
        }
    }

    /// Run `sql` with the simple query protocol.
    ///
    /// `sql` may contain multiple statements, each one produces a
    /// [`QueryResult`]. Values are returned in text format.
    pub fn query(&self, sql: impl Into<ByteStr>) -> Pending<ResultSet<Vec<Row>>> {
        self.query_with(sql, collector::rows())
    }

    /// Run `sql` with the simple query protocol, collecting rows with `collector`.
    pub fn query_with<C: Collector>(&self, sql: impl Into<ByteStr>, collector: C) -> Pending<ResultSet<C::Output>> {
        let (reply, pending) = Pending::channel();
        self.schedule(Command::SimpleQuery(SimpleQuery::new(
            sql.into(),
            Results::boxed(collector, reply),
        )));
        pending
    }

    /// Prepare a named statement.
    ///
    /// When statement cache is enabled, statement with the same sql is
    /// prepared once per connection, and concurrent callers share the result.
    pub fn prepare(&self, sql: impl Into<ByteStr>) -> Pending<PreparedStatement> {
        let (reply, pending) = Pending::channel();
        let waiter = Waiter::new(self.clone(), reply);
        self.schedule(Command::Prepare(Prepare::new(sql.into(), vec![], waiter)));
        pending
    }

    /// Prepare, or reuse cached, statement and execute it once.
    pub async fn prepared_query(&self, sql: impl Into<ByteStr>, params: impl IntoParams) -> Result<QueryResult<Vec<Row>>> {
        self.prepared_query_with(sql, params, collector::rows()).await
    }

    /// Prepare, or reuse cached, statement and execute it once, collecting
    /// rows with `collector`.
    pub async fn prepared_query_with<C: Collector>(
        &self,
        sql: impl Into<ByteStr>,
        params: impl IntoParams,
        collector: C,
    ) -> Result<QueryResult<C::Output>> {
        let stmt = self.prepare(sql).await?;
        let result = stmt.execute_with(params, collector);
        self.release(&stmt);
        result.await
    }

    /// Prepare, or reuse cached, statement and execute it once for each
    /// parameter list in a single round trip.
    pub async fn prepared_batch<I>(&self, sql: impl Into<ByteStr>, batch: I) -> Result<ResultSet<Vec<Row>>>
    where
        I: IntoIterator,
        I::Item: IntoParams,
    {
        let stmt = self.prepare(sql).await?;
        let result = stmt.batch(batch);
        self.release(&stmt);
        result.await
    }

    /// Close a one shot statement after the execution that is already scheduled.
    fn release(&self, stmt: &PreparedStatement) {
        let info = stmt.info();
        if !info.cached {
            self.schedule(Command::CloseStatement(Close::new(info.name.clone(), None)));
        }
    }

    /// Begin a transaction.
    ///
    /// Only one transaction can be active per connection, the connection is
    /// shared by every handle.
    pub async fn begin(&self) -> Result<Transaction> {
        Transaction::begin(self.clone(), false).await
    }

    /// Begin a transaction, the connection is closed when the transaction ends.
    pub async fn begin_with(&self, close_on_end: bool) -> Result<Transaction> {
        Transaction::begin(self.clone(), close_on_end).await
    }

    /// Gracefully close the connection.
    ///
    /// Commands that are already scheduled are completed first, an active
    /// transaction is rolled back. Calling it more than once has no effect.
    pub fn close(&self) {
        // driver gone means already closed
        let _ = self.send.send(Request::Close);
    }

    /// Resolves when the connection is closed.
    pub async fn closed(&self) {
        loop {
            let notified = self.shared.closed().notified();
            if self.shared.state() == State::Closed {
                return;
            }
            notified.await;
        }
    }

    /// Returns the connection state.
    pub fn state(&self) -> State {
        self.shared.state()
    }

    /// Returns `true` if connection is closed.
    pub fn is_closed(&self) -> bool {
        self.state() == State::Closed
    }

    /// Transaction status reported by the last `ReadyForQuery`.
    pub fn transaction_status(&self) -> TransactionStatus {
        self.shared.tx_status()
    }

    /// Returns server parameter reported by `ParameterStatus`, e.g. `server_version`.
    pub fn parameter(&self, name: &str) -> Option<String> {
        self.shared.parameter(name).map(|value|value.as_str().to_owned())
    }

    /// Process id and secret key required for cancellation.
    pub fn backend_key(&self) -> Option<BackendKeyData> {
        self.shared.backend_key()
    }

    /// Register a callback for notifications from `LISTEN`ed channels.
    ///
    /// Callback is called inside the connection driver, blocking on
    /// the connection in it fails with [`UsageError::BlockingInDriver`].
    ///
    /// [`UsageError::BlockingInDriver`]: crate::UsageError::BlockingInDriver
    pub fn on_notification<F>(&self, f: F)
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        self.shared.add_notification_handler(Arc::new(f));
    }

    /// Register a callback for the error that closes the connection.
    ///
    /// Called at most once.
    pub fn on_exception<F>(&self, f: F)
    where
        F: Fn(&Error) + Send + Sync + 'static,
    {
        self.shared.add_exception_handler(Arc::new(f));
    }

    /// Register a callback for connection close.
    ///
    /// Called at most once, immediately if connection is already closed.
    pub fn on_close<F>(&self, f: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.shared.add_close_handler(Arc::new(f));
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state())
            .field("transaction_status", &self.transaction_status())
            .finish()
    }
}
