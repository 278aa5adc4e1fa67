//! Database connection pooling.
use std::{
    pin::Pin,
    task::{Context, Poll, ready},
};

use crate::{Connection, Result};

mod config;
mod worker;

pub use config::PoolConfig;

/// Database connection pool.
///
/// A connection is handed out exclusively until the [`PoolConnection`] is
/// dropped, closed connections are discarded on release.
#[derive(Clone, Debug)]
pub struct Pool {
    handle: worker::WorkerHandle,
}

impl Pool {
    /// Create [`Pool`] and try to create one connection.
    pub async fn connect(url: &str) -> Result<Self> {
        PoolConfig::from_env().connect(url).await
    }

    /// Create [`Pool`] without trying to create connection.
    pub fn connect_lazy(url: &str) -> Result<Self> {
        PoolConfig::from_env().connect_lazy(url)
    }

    /// Create [`Pool`] and try to create one connection.
    ///
    /// See [`Config::from_env`][1] for more details on env.
    ///
    /// [1]: crate::Config::from_env
    pub async fn connect_env() -> Result<Pool> {
        Self::connect_with(PoolConfig::from_env()).await
    }

    /// Create [`Pool`] and try to create one connection.
    pub async fn connect_with(config: PoolConfig) -> Result<Self> {
        let pool = Self::connect_lazy_with(config);
        pool.acquire().await?;
        Ok(pool)
    }

    /// Create [`Pool`] without trying to create connection.
    pub fn connect_lazy_with(config: PoolConfig) -> Self {
        let (handle,worker) = worker::WorkerHandle::new(config);
        tokio::spawn(worker);
        Self { handle }
    }

    /// Check out an idle connection, or open a new one if the pool is not full.
    pub fn acquire(&self) -> PoolConnect {
        PoolConnect { pool: Some(self.clone()) }
    }
}

/// Future returned from [`Pool::acquire`].
#[must_use = "futures do nothing unless polled"]
#[derive(Debug)]
pub struct PoolConnect {
    pool: Option<Pool>,
}

impl Future for PoolConnect {
    type Output = Result<PoolConnection>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let pool = self.pool.as_mut().expect("`PoolConnect` polled after completion");
        let conn = ready!(pool.handle.poll_acquire(cx)?);
        let pool = self.pool.take().expect("`PoolConnect` polled after completion");
        Poll::Ready(Ok(PoolConnection { conn, pool }))
    }
}

/// Instance of [`Pool`] with the checked out connection.
#[derive(Debug)]
pub struct PoolConnection {
    pool: Pool,
    conn: Connection,
}

impl PoolConnection {
    /// Returns the [`Pool`] handle.
    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Returns the underlying [`Connection`].
    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl std::ops::Deref for PoolConnection {
    type Target = Connection;

    fn deref(&self) -> &Self::Target {
        &self.conn
    }
}

impl Drop for PoolConnection {
    fn drop(&mut self) {
        self.pool.handle.release(self.conn.clone());
    }
}

#[cfg(test)]
mod test {
    use std::{
        sync::{Arc, atomic::{AtomicUsize, Ordering}},
        time::Duration,
    };

    use super::*;
    use crate::{
        Config, testing,
        connection::{ConnectFuture, Connector},
    };

    /// Connector to in-memory backends that accept every startup.
    fn pool(max: usize) -> (Pool, Arc<AtomicUsize>) {
        let opened = Arc::new(AtomicUsize::new(0));
        let count = opened.clone();
        let connect: Connector = Arc::new(move |config: &Config| -> ConnectFuture {
            count.fetch_add(1, Ordering::SeqCst);
            let config = config.clone();
            Box::pin(async move {
                let (client, server) = tokio::io::duplex(testing::DUPLEX_SIZE);
                tokio::spawn(async move {
                    let mut backend = testing::Backend::new(server);
                    backend.accept().await;
                    while backend.recv().await.is_some() { }
                });
                Connection::connect_stream(client, config).await
            })
        });
        let config = PoolConfig::new(testing::config()).max_connection(max).connector(connect);
        (Pool::connect_lazy_with(config), opened)
    }

    #[tokio::test]
    async fn released_connection_is_reused() {
        let (pool, opened) = pool(2);

        let conn = pool.acquire().await.unwrap();
        drop(conn);

        let conn = pool.acquire().await.unwrap();
        assert!(!conn.is_closed());
        assert_eq!(opened.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn waits_for_release_when_full() {
        let (pool, opened) = pool(1);

        let first = pool.acquire().await.unwrap();
        let mut second = tokio::spawn(pool.acquire());

        assert!(tokio::time::timeout(Duration::from_millis(50), &mut second).await.is_err());
        drop(first);

        second.await.unwrap().unwrap();
        assert_eq!(opened.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn closed_connection_is_discarded() {
        let (pool, opened) = pool(1);

        let conn = pool.acquire().await.unwrap();
        conn.close();
        conn.closed().await;
        drop(conn);

        let conn = pool.acquire().await.unwrap();
        assert!(!conn.is_closed());
        assert_eq!(opened.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn concurrent_acquire_opens_up_to_max() {
        let (pool, opened) = pool(3);

        let conns = acquire_many(&pool, 3).await;
        assert_eq!(opened.load(Ordering::SeqCst), 3);
        assert_eq!(conns.len(), 3);
    }

    async fn acquire_many(pool: &Pool, n: usize) -> Vec<PoolConnection> {
        let handles = (0..n).map(|_|tokio::spawn(pool.acquire())).collect::<Vec<_>>();
        let mut conns = vec![];
        for handle in handles {
            conns.push(handle.await.unwrap().unwrap());
        }
        conns
    }
}
