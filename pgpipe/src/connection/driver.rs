//! The connection state machine.
//!
//! [`Driver`] is a future spawned per connection, it is the only owner of the
//! socket, the pending and in-flight queues, and the statement cache. Handles
//! marshal their requests through an unbounded channel.
//!
//! - requests are appended to `pending` in the order they are received
//! - a pending command is promoted to `inflight`, and written, while
//!   `inflight` is shorter than the pipelining limit
//! - every backend message is dispatched to the head of `inflight`, which is
//!   popped only on `ReadyForQuery`
//! - on transport close or fatal error, every queued command is failed
use std::{
    collections::VecDeque,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};
use bytes::BytesMut;
use tokio::{io::AsyncWrite, sync::mpsc::UnboundedReceiver};

use super::{
    Config, State,
    cache::{Lookup, StatementCache},
    command::{self, Command, Discard, PrepareReply, SimpleQuery},
    holder::{Notification, Shared},
    pending::enter_driver,
};
use crate::{
    Error, Result,
    common::{error, span, trace, verbose, warning},
    error::{ClosedError, UsageError},
    io::{poll_read, poll_write_all},
    net::Socket,
    postgres::{BackendMessage, ProtocolError, codec},
    statement::StatementName,
};

const READ_BUFFER: usize = 8 * 1024;

/// Message from connection handles to the driver.
pub(crate) enum Request {
    Schedule(Command),
    Close,
}

impl Request {
    /// Fail a request that never reached the driver.
    pub(crate) fn reject(self, state: State) {
        if let Request::Schedule(cmd) = self {
            cmd.fail(UsageError::ConnectionNotOpen(state).into());
        }
    }
}

pub(crate) struct Driver {
    socket: Socket,
    recv: UnboundedReceiver<Request>,
    recv_closed: bool,
    shared: Arc<Shared>,
    read_buf: BytesMut,
    write_buf: BytesMut,
    need_flush: bool,
    /// Terminate is written, shutdown the socket after flush.
    terminating: bool,
    shutdown: bool,
    pending: VecDeque<Command>,
    inflight: VecDeque<Command>,
    limit: usize,
    cache: Option<StatementCache>,
}

impl Driver {
    /// `init` is the first command of the connection.
    pub(crate) fn new(
        socket: Socket,
        recv: UnboundedReceiver<Request>,
        shared: Arc<Shared>,
        config: &Config,
        init: Command,
    ) -> Driver {
        let mut me = Self {
            socket,
            recv,
            recv_closed: false,
            shared,
            read_buf: BytesMut::with_capacity(READ_BUFFER),
            write_buf: BytesMut::with_capacity(1024),
            need_flush: false,
            terminating: false,
            shutdown: false,
            pending: VecDeque::new(),
            inflight: VecDeque::new(),
            limit: config.pipelining_limit.max(1),
            cache: config.cache_prepared_statements.then(StatementCache::default),
        };
        me.pending.push_back(init);
        me.check_pending();
        me
    }

    fn state(&self) -> State {
        self.shared.state()
    }

    /// Queue a command, or fail it if connection is not open.
    fn schedule(&mut self, mut cmd: Command) {
        let state = self.state();
        if state != State::Connected {
            cmd.fail(UsageError::ConnectionNotOpen(state).into());
            return;
        }

        if let Command::Prepare(prepare) = &mut cmd {
            prepare.name = StatementName::next(&self.shared);

            if let Some(cache) = &mut self.cache {
                let PrepareReply::Waiter(waiter) = std::mem::replace(&mut prepare.reply, PrepareReply::Cache) else {
                    unreachable!("prepare is scheduled with a waiter")
                };
                if let Lookup::Joined = cache.lookup(&prepare.sql, waiter) {
                    return;
                }
            }
        }

        verbose!("schedule {}", cmd.name());
        self.pending.push_back(cmd);
        self.check_pending();
    }

    /// Start closing, only the first call while connected has effect.
    fn close(&mut self) {
        if !self.shared.advance(State::Closing) {
            return;
        }
        verbose!("state: Closing");
        if self.shared.is_tx_active() {
            let rollback = SimpleQuery::new("ROLLBACK".into(), Box::new(Discard));
            self.pending.push_back(Command::SimpleQuery(rollback));
        }
        self.pending.push_back(Command::Disconnect);
        self.check_pending();
    }

    /// Promote pending commands while the pipelining window has room.
    fn check_pending(&mut self) {
        while self.inflight.len() < self.limit && !self.terminating {
            let Some(mut cmd) = self.pending.pop_front() else {
                break;
            };
            cmd.encode(&mut self.write_buf);
            self.need_flush = true;
            match cmd {
                Command::Disconnect => {
                    verbose!("promote Disconnect");
                    self.terminating = true;
                }
                cmd => {
                    verbose!("promote {}, inflight {}", cmd.name(), self.inflight.len() + 1);
                    self.inflight.push_back(cmd);
                }
            }
        }
    }

    fn dispatch(&mut self, msg: BackendMessage) -> Result<()> {
        match msg {
            BackendMessage::NotificationResponse(notification) => {
                self.shared.notify(Notification::from(notification));
            }
            BackendMessage::NoticeResponse(_notice) => {
                warning!("{}", _notice.notice);
            }
            BackendMessage::ParameterStatus(param) => {
                self.shared.set_parameter(param.name, param.value);
            }
            BackendMessage::ReadyForQuery(ready) => {
                let Some(cmd) = self.inflight.pop_front() else {
                    return Err(ProtocolError::unexpected_phase(b'Z', "Idle").into());
                };
                self.shared.set_tx_status(ready.status);
                self.resolve(cmd.complete(ready.status));
                self.check_pending();
            }
            msg => {
                let Some(cmd) = self.inflight.front_mut() else {
                    return Err(ProtocolError::unexpected_phase(msg.msgtype(), "Idle").into());
                };
                let mut cx = command::Context { buf: &mut self.write_buf, shared: &self.shared };
                cmd.handle(msg, &mut cx)?;
                if !self.write_buf.is_empty() {
                    self.need_flush = true;
                }
            }
        }
        Ok(())
    }

    fn resolve(&mut self, prepared: Option<command::Prepared>) {
        if let (Some(prepared), Some(cache)) = (prepared, &mut self.cache) {
            cache.resolve(prepared);
        }
    }

    /// Transport closed or fatal error, runs once.
    fn handle_close(&mut self, err: Option<Error>) {
        if !self.shared.advance(State::Closed) {
            return;
        }

        match &err {
            Some(err) => {
                error!("connection closed: {err}");
                self.shared.report_exception(err);
            }
            None => {
                trace!("connection closed");
            }
        }
        verbose!("state: Closed");

        let make_err = || match &err {
            Some(err) => err.replicate(),
            None => ClosedError.into(),
        };

        let pending = std::mem::take(&mut self.pending);
        let inflight = std::mem::take(&mut self.inflight);
        for cmd in pending.into_iter().chain(inflight) {
            let prepared = cmd.fail(make_err());
            self.resolve(prepared);
        }

        if let Some(cache) = &mut self.cache {
            cache.clear();
        }
        self.shared.end_transaction();

        self.recv.close();
        while let Ok(req) = self.recv.try_recv() {
            req.reject(State::Closed);
        }

        self.shared.report_closed();
    }

    /// Write and flush buffered frames, returns `true` if any progress is made.
    fn poll_write(&mut self, cx: &mut Context) -> Result<bool> {
        let mut progress = false;

        if !self.write_buf.is_empty() {
            match poll_write_all(&mut self.socket, &mut self.write_buf, cx) {
                Poll::Ready(result) => {
                    result?;
                    progress = true;
                }
                Poll::Pending => return Ok(progress),
            }
        }

        if self.need_flush {
            match Pin::new(&mut self.socket).poll_flush(cx) {
                Poll::Ready(result) => {
                    result?;
                    self.need_flush = false;
                }
                Poll::Pending => return Ok(progress),
            }
        }

        if self.terminating && !self.shutdown {
            match Pin::new(&mut self.socket).poll_shutdown(cx) {
                Poll::Ready(Ok(())) => {
                    self.shutdown = true;
                    progress = true;
                }
                // peer may have closed first
                Poll::Ready(Err(_)) => self.shutdown = true,
                Poll::Pending => { }
            }
        }

        Ok(progress)
    }

    /// Returns `Ready(None)` on end of stream.
    fn poll_read(&mut self, cx: &mut Context) -> Poll<Result<Option<()>>> {
        self.read_buf.reserve(READ_BUFFER);
        match poll_read(&mut self.socket, &mut self.read_buf, cx) {
            Poll::Ready(Ok(0)) => return Poll::Ready(Ok(None)),
            Poll::Ready(Ok(_)) => { }
            Poll::Ready(Err(err)) => return Poll::Ready(Err(err.into())),
            Poll::Pending => return Poll::Pending,
        }

        while let Some(msg) = codec::decode(&mut self.read_buf)? {
            self.dispatch(msg)?;
        }

        Poll::Ready(Ok(Some(())))
    }

    fn poll_driver(&mut self, cx: &mut Context) -> Poll<()> {
        loop {
            let mut progress = false;

            while !self.recv_closed {
                match self.recv.poll_recv(cx) {
                    Poll::Ready(Some(Request::Schedule(cmd))) => self.schedule(cmd),
                    Poll::Ready(Some(Request::Close)) => self.close(),
                    Poll::Ready(None) => {
                        // all handles are dropped
                        self.recv_closed = true;
                        self.close();
                    }
                    Poll::Pending => break,
                }
                progress = true;
            }

            match self.poll_write(cx) {
                Ok(written) => progress |= written,
                Err(err) => {
                    self.handle_close(Some(err));
                    return Poll::Ready(());
                }
            }

            match self.poll_read(cx) {
                Poll::Ready(Ok(Some(()))) => progress = true,
                Poll::Ready(Ok(None)) => {
                    let err = match self.state() {
                        State::Connected if !self.inflight.is_empty() || !self.pending.is_empty() => {
                            Some(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into())
                        }
                        _ => None,
                    };
                    self.handle_close(err);
                    return Poll::Ready(());
                }
                Poll::Ready(Err(err)) => {
                    self.handle_close(Some(err));
                    return Poll::Ready(());
                }
                Poll::Pending => { }
            }

            if !progress {
                return Poll::Pending;
            }
        }
    }
}

impl Future for Driver {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let _guard = enter_driver();
        span!("driver");
        if self.state() == State::Closed {
            return Poll::Ready(());
        }
        self.poll_driver(cx)
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        // runtime shutdown drops the driver without completion
        self.handle_close(None);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        ErrorKind, collector,
        postgres::TransactionStatus,
        testing::{self, msg},
    };

    fn config(limit: usize, cache: bool) -> Config {
        let mut config = testing::config();
        config.set_pipelining_limit(limit).set_cache_prepared_statements(cache);
        config
    }

    #[tokio::test]
    async fn pipelining_limit_is_respected() {
        let (conn, mut backend) = testing::connect(config(2, false)).await;

        let q1 = conn.query("SELECT 1");
        let q2 = conn.query("SELECT 2");
        let q3 = conn.query("SELECT 3");

        assert_eq!(backend.expect(b'Q').await, &b"SELECT 1\0"[..]);
        assert_eq!(backend.expect(b'Q').await, &b"SELECT 2\0"[..]);
        backend.assert_idle().await;

        backend.send(&[msg::command_complete("SELECT 0"), msg::ready(b'I')]).await;
        assert_eq!(backend.expect(b'Q').await, &b"SELECT 3\0"[..]);

        backend.send(&[msg::command_complete("SELECT 0"), msg::ready(b'I')]).await;
        backend.send(&[msg::command_complete("SELECT 0"), msg::ready(b'I')]).await;

        for q in [q1, q2, q3] {
            assert_eq!(q.await.unwrap().len(), 1);
        }
    }

    #[tokio::test]
    async fn completions_are_fifo() {
        let (conn, mut backend) = testing::connect(config(8, false)).await;

        let queries = (0..5).map(|i|conn.query(format!("SELECT {i}"))).collect::<Vec<_>>();
        for _ in 0..5 {
            backend.expect(b'Q').await;
        }
        for i in 0..5 {
            backend.send(&[msg::command_complete(&format!("SELECT {i}")), msg::ready(b'I')]).await;
        }
        for (i, q) in queries.into_iter().enumerate() {
            let set = q.await.unwrap();
            assert_eq!(set.rows_affected(), i as u64);
        }
    }

    #[tokio::test]
    async fn concurrent_prepare_sends_one_parse() {
        let (conn, mut backend) = testing::connect(config(8, true)).await;

        let c1 = conn.clone();
        let c2 = conn.clone();
        let p1 = tokio::spawn(async move { c1.prepare("SELECT $1::int4").await });
        let p2 = tokio::spawn(async move { c2.prepare("SELECT $1::int4").await });

        let parse = backend.expect(b'P').await;
        backend.expect(b'D').await;
        backend.expect(b'S').await;
        backend.send(&[
            msg::parse_complete(),
            msg::parameter_description(&[23]),
            msg::row_description(&[("int4", 23)]),
            msg::ready(b'I'),
        ]).await;

        let s1 = p1.await.unwrap().unwrap();
        let s2 = p2.await.unwrap().unwrap();
        assert_eq!(s1.name(), s2.name());
        assert!(parse.starts_with(s1.name().as_bytes()));
        assert_eq!(s1.params(), &[23]);

        let s3 = conn.prepare("SELECT $1::int4").await.unwrap();
        assert_eq!(s3.name(), s1.name());
        backend.assert_idle().await;
    }

    #[tokio::test]
    async fn cached_statements_are_never_closed() {
        let (conn, mut backend) = testing::connect(config(8, true)).await;

        let mut statements = vec![];
        for i in 0..300 {
            let prepare = conn.prepare(format!("SELECT {i}"));
            backend.expect(b'P').await;
            backend.expect(b'D').await;
            backend.expect(b'S').await;
            backend.send(&[
                msg::parse_complete(),
                msg::parameter_description(&[]),
                msg::no_data(),
                msg::ready(b'I'),
            ]).await;
            statements.push(prepare.await.unwrap());
        }

        let execute = statements[0].execute(());
        let bind = backend.expect(b'B').await;
        assert!(bind[1..].starts_with(statements[0].name().as_bytes()));
        backend.expect(b'E').await;
        backend.expect(b'S').await;
        backend.assert_idle().await;
        backend.send(&[msg::bind_complete(), msg::command_complete("SELECT 0"), msg::ready(b'I')]).await;
        execute.await.unwrap();
    }

    #[tokio::test]
    async fn results_keep_their_own_transaction_status() {
        let (conn, mut backend) = testing::connect(config(8, false)).await;

        let begin = conn.query("BEGIN");
        let select = conn.query("SELECT x");
        backend.expect(b'Q').await;
        backend.expect(b'Q').await;
        backend.send(&[msg::command_complete("BEGIN"), msg::ready(b'T')]).await;
        backend.send(&[msg::error("42703", "column x does not exist"), msg::ready(b'E')]).await;

        let err = select.await.unwrap_err();
        assert_eq!(err.transaction_status(), Some(TransactionStatus::Failed));

        let begin = begin.await.unwrap();
        assert_eq!(begin.transaction_status(), TransactionStatus::InTransaction);
        assert_eq!(begin.results()[0].transaction_status(), TransactionStatus::InTransaction);
        assert_eq!(conn.transaction_status(), TransactionStatus::Failed);
    }

    #[tokio::test]
    async fn closed_failure_has_no_transaction_status() {
        let (conn, backend) = testing::connect(config(8, false)).await;

        let q = conn.query("SELECT 1");
        drop(backend);
        let err = q.await.unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(err.transaction_status(), None);
    }

    #[tokio::test]
    async fn failure_resolves_every_command_once() {
        let (conn, mut backend) = testing::connect(config(4, false)).await;

        let queries = (0..1000).map(|_|conn.query_with("SELECT 1", collector::discard())).collect::<Vec<_>>();

        for _ in 0..10 {
            backend.expect(b'Q').await;
            backend.send(&[msg::command_complete("SELECT 1"), msg::ready(b'I')]).await;
        }
        drop(backend);

        let mut ok = 0;
        let mut closed = 0;
        for q in queries {
            match q.await {
                Ok(_) => ok += 1,
                Err(err) => {
                    assert!(err.is_fatal());
                    closed += 1;
                }
            }
        }
        assert_eq!(ok, 10);
        assert_eq!(closed, 990);
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn failed_prepare_sends_no_bind() {
        let (conn, mut backend) = testing::connect(config(8, false)).await;

        let batch = {
            let conn = conn.clone();
            tokio::spawn(async move {
                conn.prepared_batch("SELEC $1", [(1i32,), (2i32,)]).await
            })
        };

        backend.expect(b'P').await;
        backend.expect(b'D').await;
        backend.expect(b'S').await;
        backend.send(&[msg::error("42601", "syntax error"), msg::ready(b'I')]).await;

        let err = batch.await.unwrap().unwrap_err();
        assert_eq!(err.as_database().unwrap().code(), "42601");
        backend.assert_idle().await;
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (conn, mut backend) = testing::connect(config(8, false)).await;

        conn.close();
        conn.close();
        backend.expect(b'X').await;
        backend.assert_idle().await;

        let err = conn.query("SELECT 1").await.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Usage(UsageError::ConnectionNotOpen(_))));

        drop(backend);
        conn.closed().await;
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn notification_is_out_of_band() {
        let (conn, mut backend) = testing::connect(config(8, false)).await;

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        conn.on_notification(move |n| { let _ = tx.send((n.channel().to_owned(), n.payload().to_owned())); });

        let q = conn.query("SELECT 1");
        backend.expect(b'Q').await;
        backend.send(&[
            msg::notification(7, "jobs", "hello"),
            msg::command_complete("SELECT 0"),
            msg::ready(b'I'),
        ]).await;

        q.await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), ("jobs".to_owned(), "hello".to_owned()));
    }

    #[tokio::test]
    async fn protocol_error_is_fatal() {
        let (conn, mut backend) = testing::connect(config(8, false)).await;

        let exceptions = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let e = exceptions.clone();
        conn.on_exception(move |_| { e.fetch_add(1, std::sync::atomic::Ordering::SeqCst); });

        let q = conn.query("SELECT 1");
        backend.expect(b'Q').await;
        backend.send(&[msg::parse_complete()]).await;

        let err = q.await.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Protocol(_)));
        conn.closed().await;
        assert_eq!(exceptions.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn database_error_keeps_connection() {
        let (conn, mut backend) = testing::connect(config(8, false)).await;

        let q1 = conn.query("SELECT x");
        let q2 = conn.query("SELECT 1");
        backend.expect(b'Q').await;
        backend.expect(b'Q').await;
        backend.send(&[msg::error("42703", "column x does not exist"), msg::ready(b'I')]).await;
        backend.send(&[msg::command_complete("SELECT 0"), msg::ready(b'I')]).await;

        assert_eq!(q1.await.unwrap_err().as_database().unwrap().code(), "42703");
        q2.await.unwrap();
        assert!(!conn.is_closed());
    }
}
