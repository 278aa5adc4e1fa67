//! Publish/subscribe over `LISTEN` and `NOTIFY`.
//!
//! A [`Subscriber`] owns a dedicated connection, each [`Channel`] is a
//! stream of payloads sent to one channel name. The connection listens to
//! a name as long as at least one [`Channel`] of that name is alive.
use std::{
    collections::HashMap,
    pin::Pin,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, Ordering},
    },
    task::{Context, Poll},
    time::Duration,
};
use futures_core::Stream;
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::{
    Config, Connection, Result,
    collector,
    common::{trace, warning},
    connection::{self, Connector, Notification},
    error::ClosedError,
};

type ReconnectPolicy = Box<dyn Fn(u32) -> Option<Duration> + Send + Sync>;

struct Listener {
    id: u64,
    send: UnboundedSender<String>,
    paused: Arc<AtomicBool>,
}

#[derive(Default)]
struct Registry {
    /// [`None`] while reconnecting.
    conn: Option<Connection>,
    channels: HashMap<String, Vec<Listener>>,
    next_id: u64,
    closed: bool,
}

struct Inner {
    config: Config,
    connect: Connector,
    reconnect: ReconnectPolicy,
    registry: Mutex<Registry>,
}

/// Quote `name` as sql identifier.
fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

impl Inner {
    /// Connect, install dispatcher, and listen to every live channel.
    async fn open(self: &Arc<Self>) -> Result<Connection> {
        let conn = (self.connect)(&self.config).await?;

        let weak = Arc::downgrade(self);
        conn.on_notification(move |notification| {
            if let Some(inner) = weak.upgrade() {
                inner.dispatch(notification);
            }
        });

        let sql = {
            let mut registry = self.registry.lock();
            if registry.closed {
                conn.close();
                return Err(ClosedError.into());
            }
            registry.conn = Some(conn.clone());
            registry
                .channels
                .keys()
                .map(|name|format!("LISTEN {};", quote_ident(name)))
                .collect::<String>()
        };

        if !sql.is_empty() {
            if let Err(err) = conn.query_with(sql, collector::discard()).await {
                conn.close();
                return Err(err);
            }
        }

        Ok(conn)
    }

    /// Called inside the connection driver.
    fn dispatch(&self, notification: &Notification) {
        let registry = self.registry.lock();
        let Some(listeners) = registry.channels.get(notification.channel()) else {
            return;
        };
        for listener in listeners {
            if !listener.paused.load(Ordering::Acquire) {
                let _ = listener.send.send(notification.payload().to_owned());
            }
        }
    }

    async fn reconnect(self: &Arc<Self>) -> Option<Connection> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let delay = (self.reconnect)(attempt)?;
            tokio::time::sleep(delay).await;

            if self.registry.lock().closed {
                return None;
            }

            match self.open().await {
                Ok(conn) => {
                    trace!("subscriber reconnected after {attempt} attempt");
                    return Some(conn);
                }
                Err(_err) => {
                    warning!("subscriber reconnect attempt {attempt} failed: {_err}");
                }
            }
        }
    }

    /// End every channel and close the connection.
    fn shutdown(&self) {
        let conn = {
            let mut registry = self.registry.lock();
            registry.closed = true;
            registry.channels.clear();
            registry.conn.take()
        };
        if let Some(conn) = conn {
            conn.close();
        }
    }
}

/// Reconnect the subscriber as long as the policy allows.
async fn supervise(inner: Weak<Inner>, mut conn: Connection) {
    loop {
        conn.closed().await;

        let Some(inner) = inner.upgrade() else {
            return;
        };
        {
            let mut registry = inner.registry.lock();
            if registry.closed {
                return;
            }
            registry.conn = None;
        }
        warning!("subscriber connection closed");

        match inner.reconnect().await {
            Some(new) => conn = new,
            None => {
                inner.shutdown();
                return;
            }
        }
    }
}

/// Dedicated connection that listens to notification channels.
///
/// # Example
///
/// ```no_run
/// # async fn test() -> pgpipe::Result<()> {
/// use std::time::Duration;
///
/// let config = pgpipe::Config::from_env();
/// let subscriber = pgpipe::Subscriber::connect_with(config, |attempt| {
///     (attempt < 5).then(|| Duration::from_secs(attempt.into()))
/// }).await?;
///
/// let jobs = subscriber.channel("jobs").await?;
/// # Ok(())
/// # }
/// ```
pub struct Subscriber {
    inner: Arc<Inner>,
}

impl Subscriber {
    /// Connect a subscriber that never reconnects.
    pub async fn connect(config: Config) -> Result<Subscriber> {
        Self::connect_with(config, |_|None).await
    }

    /// Connect a subscriber with reconnect policy.
    ///
    /// When connection is lost, `reconnect` is called with the attempt
    /// number starting from 1, and returns the delay before next attempt,
    /// or [`None`] to give up and end every channel.
    pub async fn connect_with<F>(config: Config, reconnect: F) -> Result<Subscriber>
    where
        F: Fn(u32) -> Option<Duration> + Send + Sync + 'static,
    {
        Self::start(config, connection::connector(), Box::new(reconnect)).await
    }

    async fn start(config: Config, connect: Connector, reconnect: ReconnectPolicy) -> Result<Subscriber> {
        let inner = Arc::new(Inner {
            config,
            connect,
            reconnect,
            registry: Mutex::default(),
        });
        let conn = inner.open().await?;
        tokio::spawn(supervise(Arc::downgrade(&inner), conn));
        Ok(Subscriber { inner })
    }

    /// Subscribe to channel `name`.
    ///
    /// Only the first channel of a name sends `LISTEN`. While reconnecting,
    /// listening is deferred until the connection is restored.
    pub async fn channel(&self, name: impl Into<String>) -> Result<Channel> {
        let name = name.into();
        let (send, recv) = mpsc::unbounded_channel();
        let paused = Arc::new(AtomicBool::new(false));

        let (id, listen) = {
            let mut registry = self.inner.registry.lock();
            if registry.closed {
                return Err(ClosedError.into());
            }
            let id = registry.next_id;
            registry.next_id += 1;

            let conn = registry.conn.clone();
            let listeners = registry.channels.entry(name.clone()).or_default();
            let first = listeners.is_empty();
            listeners.push(Listener { id, send, paused: paused.clone() });
            (id, conn.filter(|_|first))
        };

        // dropped on error, which unlistens
        let channel = Channel { inner: self.inner.clone(), name, id, recv, paused };

        if let Some(conn) = listen {
            let sql = format!("LISTEN {}", quote_ident(&channel.name));
            conn.query_with(sql, collector::discard()).await?;
        }

        Ok(channel)
    }

    /// Returns `true` if subscriber is closed or has given up reconnecting.
    pub fn is_closed(&self) -> bool {
        self.inner.registry.lock().closed
    }

    /// Close the connection and end every channel.
    pub fn close(&self) {
        self.inner.shutdown();
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.inner.shutdown();
    }
}

impl std::fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registry = self.inner.registry.lock();
        f.debug_struct("Subscriber")
            .field("channels", &registry.channels.keys().collect::<Vec<_>>())
            .field("closed", &registry.closed)
            .finish()
    }
}

/// A [`Stream`] of notification payloads of a single channel name.
///
/// Stream ends when the [`Subscriber`] is closed or gives up reconnecting.
pub struct Channel {
    inner: Arc<Inner>,
    name: String,
    id: u64,
    recv: UnboundedReceiver<String>,
    paused: Arc<AtomicBool>,
}

impl Channel {
    /// Returns the channel name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Drop notifications until [`resume`][Channel::resume] is called.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::Release);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }
}

impl Stream for Channel {
    type Item = String;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.recv.poll_recv(cx)
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        let unlisten = {
            let mut registry = self.inner.registry.lock();
            let Some(listeners) = registry.channels.get_mut(&self.name) else {
                return;
            };
            listeners.retain(|listener|listener.id != self.id);
            if !listeners.is_empty() {
                return;
            }
            registry.channels.remove(&self.name);
            registry.conn.clone()
        };

        if let Some(conn) = unlisten {
            let sql = format!("UNLISTEN {}", quote_ident(&self.name));
            // completion is not awaited
            drop(conn.query_with(sql, collector::discard()));
        }
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.name)
            .field("paused", &self.is_paused())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        connection::ConnectFuture,
        testing::{self, Backend, msg, next},
    };

    /// Every connection attempt hands its backend to the test.
    fn connector() -> (Connector, UnboundedReceiver<Backend>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connect: Connector = Arc::new(move |config: &Config| -> ConnectFuture {
            let (client, server) = tokio::io::duplex(testing::DUPLEX_SIZE);
            let _ = tx.send(Backend::new(server));
            Box::pin(Connection::connect_stream(client, config.clone()))
        });
        (connect, rx)
    }

    async fn subscriber(reconnect: ReconnectPolicy) -> (Subscriber, Backend, UnboundedReceiver<Backend>) {
        let (connect, mut backends) = connector();
        let start = tokio::spawn(Subscriber::start(testing::config(), connect, reconnect));
        let mut backend = backends.recv().await.unwrap();
        backend.accept().await;
        (start.await.unwrap().unwrap(), backend, backends)
    }

    async fn listen(subscriber: &Subscriber, backend: &mut Backend, name: &str) -> Channel {
        let (channel, ()) = tokio::join!(subscriber.channel(name), async {
            assert_eq!(backend.expect(b'Q').await, format!("LISTEN \"{name}\"\0").as_bytes());
            backend.send(&[msg::command_complete("LISTEN"), msg::ready(b'I')]).await;
        });
        channel.unwrap()
    }

    #[tokio::test]
    async fn listen_once_per_name() {
        let (sub, mut backend, _) = subscriber(Box::new(|_|None)).await;

        let mut first = listen(&sub, &mut backend, "jobs").await;
        let mut second = sub.channel("jobs").await.unwrap();
        backend.assert_idle().await;

        backend.send(&[msg::notification(1, "jobs", "hello"), msg::notification(1, "other", "x")]).await;
        assert_eq!(next(&mut first).await.as_deref(), Some("hello"));
        assert_eq!(next(&mut second).await.as_deref(), Some("hello"));

        drop(first);
        backend.assert_idle().await;
        drop(second);
        assert_eq!(backend.expect(b'Q').await, b"UNLISTEN \"jobs\"\0");
    }

    #[tokio::test]
    async fn paused_channel_drops_notifications() {
        let (sub, mut backend, _) = subscriber(Box::new(|_|None)).await;
        let mut channel = listen(&sub, &mut backend, "jobs").await;

        channel.pause();
        backend.send(&[msg::notification(1, "jobs", "dropped")]).await;
        backend.assert_idle().await;
        channel.resume();
        backend.send(&[msg::notification(1, "jobs", "kept")]).await;

        assert_eq!(next(&mut channel).await.as_deref(), Some("kept"));
    }

    #[tokio::test]
    async fn reconnect_listens_every_channel() {
        let policy: ReconnectPolicy = Box::new(|attempt|(attempt <= 3).then_some(Duration::from_millis(1)));
        let (sub, mut backend, mut backends) = subscriber(policy).await;
        let mut a = listen(&sub, &mut backend, "a").await;
        let _b = listen(&sub, &mut backend, "b").await;

        drop(backend);

        let mut backend = backends.recv().await.unwrap();
        backend.accept().await;
        let sql = backend.expect(b'Q').await;
        let sql = std::str::from_utf8(&sql).unwrap();
        assert!(sql.contains("LISTEN \"a\";"));
        assert!(sql.contains("LISTEN \"b\";"));
        backend.send(&[
            msg::command_complete("LISTEN"),
            msg::command_complete("LISTEN"),
            msg::ready(b'I'),
        ]).await;

        backend.send(&[msg::notification(2, "a", "back")]).await;
        assert_eq!(next(&mut a).await.as_deref(), Some("back"));
        assert!(!sub.is_closed());
    }

    #[tokio::test]
    async fn giving_up_ends_channels() {
        let (sub, mut backend, _) = subscriber(Box::new(|_|None)).await;
        let mut channel = listen(&sub, &mut backend, "jobs").await;

        drop(backend);
        assert_eq!(next(&mut channel).await, None);
        assert!(sub.is_closed());
        assert!(sub.channel("jobs").await.is_err());
    }

    #[tokio::test]
    async fn close_ends_channels() {
        let (sub, mut backend, _) = subscriber(Box::new(|_|None)).await;
        let mut channel = listen(&sub, &mut backend, "jobs").await;

        sub.close();
        backend.expect(b'X').await;
        assert_eq!(next(&mut channel).await, None);
    }

    #[test]
    fn quote() {
        assert_eq!(quote_ident("jobs"), "\"jobs\"");
        assert_eq!(quote_ident("a\"b"), "\"a\"\"b\"");
    }
}
