//! Incremental fetching of a prepared statement result.
use std::{
    collections::VecDeque,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll, Waker, ready},
};
use futures_core::Stream;
use parking_lot::Mutex;

use crate::{
    Connection, Result,
    collector::{self, Collector},
    connection::{
        Pending,
        command::{Close, Command, ExtendedQuery, Results},
    },
    encode::Encoded,
    error::UsageError,
    result::QueryResult,
    row::Row,
    statement::{PortalName, StatementInfo},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CursorState {
    /// Portal is not bound yet.
    Fresh,
    /// Portal is suspended with more rows.
    Open,
    /// All rows are fetched, or fetch failed.
    Done,
    Closed,
}

/// A named portal, fetching a limited number of rows per read.
///
/// Portal lives until the end of the transaction, outside of an explicit
/// transaction the portal is destroyed by the first read, so cursor should
/// be used inside [`Transaction`][crate::Transaction].
///
/// # Example
///
/// ```no_run
/// # async fn test(conn: pgpipe::Connection) -> pgpipe::Result<()> {
/// let tx = conn.begin().await?;
/// let stmt = tx.prepare("SELECT id FROM post").await?;
/// let mut cursor = stmt.cursor(())?;
///
/// while cursor.has_more() {
///     let result = cursor.read(100).await?;
///     println!("fetched {} rows", result.rows().len());
/// }
///
/// cursor.close().await?;
/// tx.commit().await?;
/// # Ok(())
/// # }
/// ```
pub struct Cursor {
    conn: Connection,
    stmt: Arc<StatementInfo>,
    portal: PortalName,
    params: Option<Vec<Encoded>>,
    state: CursorState,
}

impl Cursor {
    /// `params` must be already validated.
    pub(crate) fn new(conn: Connection, stmt: Arc<StatementInfo>, params: Vec<Encoded>) -> Cursor {
        let portal = PortalName::next(conn.shared());
        Self { conn, stmt, portal, params: Some(params), state: CursorState::Fresh }
    }

    /// Returns the portal name.
    pub fn name(&self) -> &str {
        self.portal.as_str()
    }

    /// Returns `true` if next read may return more rows.
    pub fn has_more(&self) -> bool {
        matches!(self.state, CursorState::Fresh | CursorState::Open)
    }

    /// Fetch at most `fetch` rows, zero means all remaining rows.
    pub async fn read(&mut self, fetch: u32) -> Result<QueryResult<Vec<Row>>> {
        self.read_with(fetch, collector::rows()).await
    }

    /// Fetch at most `fetch` rows, collecting rows with `collector`.
    ///
    /// The returned result is [suspended][QueryResult::is_suspended] when the
    /// portal has more rows.
    pub async fn read_with<C: Collector>(&mut self, fetch: u32, collector: C) -> Result<QueryResult<C::Output>> {
        let result = self.start_read(fetch, collector)?.await;
        self.finish_read(&result);
        result
    }

    /// First read binds the portal, following reads only execute it.
    pub(crate) fn start_read<C: Collector>(
        &mut self,
        fetch: u32,
        collector: C,
    ) -> Result<Pending<QueryResult<C::Output>>, UsageError> {
        let bind = match self.state {
            CursorState::Fresh => self.params.take(),
            CursorState::Open => None,
            CursorState::Done | CursorState::Closed => return Err(UsageError::CursorExhausted),
        };
        self.state = CursorState::Open;

        let (reply, pending) = Pending::channel();
        self.conn.schedule(Command::ExtendedQuery(ExtendedQuery::new(
            self.stmt.clone(),
            bind,
            self.portal.clone(),
            fetch,
            Results::boxed(collector, reply),
        )));
        Ok(pending)
    }

    pub(crate) fn finish_read<T>(&mut self, result: &Result<QueryResult<T>>) {
        if self.state != CursorState::Open {
            return;
        }
        self.state = match result {
            Ok(result) if result.is_suspended() => CursorState::Open,
            _ => CursorState::Done,
        };
    }

    /// Close the portal.
    ///
    /// Portal that is still open is closed on the server, reading a closed
    /// cursor fails with [`UsageError::CursorExhausted`].
    pub async fn close(&mut self) -> Result<()> {
        let state = std::mem::replace(&mut self.state, CursorState::Closed);
        if state != CursorState::Open {
            return Ok(());
        }
        let (reply, pending) = Pending::channel();
        self.conn.schedule(Command::ClosePortal(Close::new(self.portal.clone(), Some(reply))));
        pending.await
    }
}

impl Drop for Cursor {
    fn drop(&mut self) {
        if self.state == CursorState::Open {
            self.conn.schedule(Command::ClosePortal(Close::new(self.portal.clone(), None)));
        }
    }
}

impl std::fmt::Debug for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cursor")
            .field("portal", &self.portal)
            .field("statement", &self.stmt.name)
            .field("state", &self.state)
            .finish()
    }
}

// ===== StreamControl =====

#[derive(Default)]
struct Control {
    paused: bool,
    waker: Option<Waker>,
}

/// Pause and resume a stream from outside of its consumer.
#[derive(Clone, Default)]
pub struct StreamControl {
    inner: Arc<Mutex<Control>>,
}

impl StreamControl {
    /// Stop delivering items until [`resume`][StreamControl::resume] is called.
    pub fn pause(&self) {
        self.inner.lock().paused = true;
    }

    pub fn resume(&self) {
        let waker = {
            let mut control = self.inner.lock();
            control.paused = false;
            control.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    pub fn is_paused(&self) -> bool {
        self.inner.lock().paused
    }

    /// Returns `Pending` while paused, the task is woken on resume.
    pub(crate) fn poll_resumed(&self, cx: &mut Context) -> Poll<()> {
        let mut control = self.inner.lock();
        if control.paused {
            control.waker = Some(cx.waker().clone());
            return Poll::Pending;
        }
        Poll::Ready(())
    }
}

impl std::fmt::Debug for StreamControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamControl").field("paused", &self.is_paused()).finish()
    }
}

// ===== RowStream =====

/// A [`Stream`] of rows, fetched from a [`Cursor`] in chunks.
///
/// Rows are delivered in order, each exactly once. While paused, no row is
/// delivered and no fetch is scheduled.
pub struct RowStream {
    cursor: Cursor,
    fetch: u32,
    buffer: VecDeque<Row>,
    inflight: Option<Pending<QueryResult<Vec<Row>>>>,
    control: StreamControl,
}

impl RowStream {
    pub(crate) fn new(cursor: Cursor, fetch: u32) -> RowStream {
        Self {
            cursor,
            fetch,
            buffer: VecDeque::new(),
            inflight: None,
            control: StreamControl::default(),
        }
    }

    pub fn pause(&self) {
        self.control.pause();
    }

    pub fn resume(&self) {
        self.control.resume();
    }

    /// Returns a handle to pause the stream while it is being consumed.
    pub fn control(&self) -> StreamControl {
        self.control.clone()
    }

    /// Close the underlying cursor, buffered rows are discarded.
    pub async fn close(mut self) -> Result<()> {
        if let Some(pending) = self.inflight.take() {
            let result = pending.await;
            self.cursor.finish_read(&result);
        }
        self.cursor.close().await
    }
}

impl Stream for RowStream {
    type Item = Result<Row>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let me = self.get_mut();
        ready!(me.control.poll_resumed(cx));

        loop {
            if let Some(row) = me.buffer.pop_front() {
                return Poll::Ready(Some(Ok(row)));
            }

            if let Some(pending) = &mut me.inflight {
                let result = ready!(Pin::new(pending).poll(cx));
                me.inflight = None;
                me.cursor.finish_read(&result);
                match result {
                    Ok(result) => me.buffer.extend(result.into_rows()),
                    Err(err) => return Poll::Ready(Some(Err(err))),
                }
                continue;
            }

            if !me.cursor.has_more() {
                return Poll::Ready(None);
            }

            match me.cursor.start_read(me.fetch, collector::rows()) {
                Ok(pending) => me.inflight = Some(pending),
                Err(err) => return Poll::Ready(Some(Err(err.into()))),
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.buffer.len(), None)
    }
}

impl std::fmt::Debug for RowStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RowStream")
            .field("cursor", &self.cursor)
            .field("fetch", &self.fetch)
            .field("buffered", &self.buffer.len())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        ErrorKind, PreparedStatement,
        testing::{self, Backend, msg, next},
    };

    async fn prepare(conn: &Connection, backend: &mut Backend) -> PreparedStatement {
        let stmt = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.prepare("SELECT id FROM post").await })
        };
        backend.expect(b'P').await;
        backend.expect(b'D').await;
        backend.expect(b'S').await;
        backend.send(&[
            msg::parse_complete(),
            msg::parameter_description(&[]),
            msg::row_description(&[("id", 23)]),
            msg::ready(b'T'),
        ]).await;
        stmt.await.unwrap().unwrap()
    }

    fn int4(value: i32) -> Vec<u8> {
        msg::data_row(&[Some(value.to_be_bytes())])
    }

    #[tokio::test]
    async fn cursor_binds_once() {
        let (conn, mut backend) = testing::connect(testing::config()).await;
        let stmt = prepare(&conn, &mut backend).await;
        let mut cursor = stmt.cursor(()).unwrap();

        let read = tokio::spawn(async move {
            let first = cursor.read(2).await.unwrap();
            assert!(first.is_suspended());
            assert_eq!(first.rows().len(), 2);
            assert!(cursor.has_more());

            let second = cursor.read(2).await.unwrap();
            assert!(!second.is_suspended());
            assert_eq!(second.rows().len(), 1);
            assert!(!cursor.has_more());

            let err = cursor.read(2).await.unwrap_err();
            assert!(matches!(err.kind(), ErrorKind::Usage(UsageError::CursorExhausted)));
            cursor.close().await.unwrap();
        });

        let bind = backend.expect(b'B').await;
        assert!(bind.starts_with(b"p"));
        assert_eq!(backend.expect(b'E').await[..11], bind[..11]);
        backend.expect(b'S').await;
        backend.send(&[msg::bind_complete(), int4(1), int4(2), msg::portal_suspended(), msg::ready(b'T')]).await;

        backend.expect(b'E').await;
        backend.expect(b'S').await;
        backend.send(&[int4(3), msg::command_complete("SELECT 1"), msg::ready(b'T')]).await;

        read.await.unwrap();
        backend.assert_idle().await;
    }

    #[tokio::test]
    async fn close_open_portal() {
        let (conn, mut backend) = testing::connect(testing::config()).await;
        let stmt = prepare(&conn, &mut backend).await;
        let mut cursor = stmt.cursor(()).unwrap();

        let read = tokio::spawn(async move {
            cursor.read(1).await.unwrap();
            cursor.close().await.unwrap();
            cursor
        });

        backend.expect(b'B').await;
        backend.expect(b'E').await;
        backend.expect(b'S').await;
        backend.send(&[msg::bind_complete(), int4(1), msg::portal_suspended(), msg::ready(b'T')]).await;

        let close = backend.expect(b'C').await;
        assert_eq!(close[0], b'P');
        backend.expect(b'S').await;
        backend.send(&[msg::close_complete(), msg::ready(b'T')]).await;

        let mut cursor = read.await.unwrap();
        let err = cursor.read(1).await.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Usage(UsageError::CursorExhausted)));
    }

    #[tokio::test]
    async fn stream_fetches_in_chunks() {
        let (conn, mut backend) = testing::connect(testing::config()).await;
        let stmt = prepare(&conn, &mut backend).await;
        let mut stream = stmt.stream(2, ()).unwrap();

        let consume = tokio::spawn(async move {
            let mut ids = vec![];
            while let Some(row) = next(&mut stream).await {
                ids.push(row.unwrap().try_get::<_, i32>(0).unwrap());
            }
            ids
        });

        backend.expect(b'B').await;
        backend.expect(b'E').await;
        backend.expect(b'S').await;
        backend.send(&[msg::bind_complete(), int4(1), int4(2), msg::portal_suspended(), msg::ready(b'T')]).await;
        backend.expect(b'E').await;
        backend.expect(b'S').await;
        backend.send(&[int4(3), msg::command_complete("SELECT 1"), msg::ready(b'T')]).await;

        assert_eq!(consume.await.unwrap(), [1, 2, 3]);
        backend.assert_idle().await;
    }

    #[tokio::test]
    async fn paused_stream_does_not_fetch() {
        let (conn, mut backend) = testing::connect(testing::config()).await;
        let stmt = prepare(&conn, &mut backend).await;
        let mut stream = stmt.stream(1, ()).unwrap();
        let control = stream.control();

        control.pause();
        let consume = tokio::spawn(async move { next(&mut stream).await.map(|row|row.unwrap().len()) });
        backend.assert_idle().await;

        control.resume();
        backend.expect(b'B').await;
        backend.expect(b'E').await;
        backend.expect(b'S').await;
        backend.send(&[msg::bind_complete(), int4(1), msg::portal_suspended(), msg::ready(b'T')]).await;

        assert_eq!(consume.await.unwrap(), Some(1));
    }
}
