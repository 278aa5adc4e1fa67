use std::{
    collections::VecDeque,
    pin::Pin,
    task::{Context, Poll, ready},
    time::Duration,
};
use tokio::{
    sync::{
        mpsc::{self, UnboundedReceiver, UnboundedSender},
        oneshot,
    },
    time::{Instant, Sleep, sleep},
};

use super::PoolConfig;
use crate::{
    Connection, Result,
    common::{error, trace},
    connection::ConnectFuture,
    error::ClosedError,
};

const PRUNE_INTERVAL: Duration = Duration::from_secs(30);

pub struct WorkerHandle {
    send: UnboundedSender<WorkerMessage>,
    state: State,
}

enum State {
    Idle,
    Recv(AcquireRecv),
}

impl WorkerHandle {
    pub fn new(config: PoolConfig) -> (Self, WorkerFuture) {
        let (send, recv) = mpsc::unbounded_channel();
        (
            Self { send, state: State::Idle },
            WorkerFuture {
                config,
                actives: 0,
                conns: VecDeque::new(),
                sleep: Box::pin(sleep(PRUNE_INTERVAL)),
                recv,
                queue: VecDeque::with_capacity(1),
                connecting: None,
            },
        )
    }

    pub fn poll_acquire(&mut self, cx: &mut Context) -> Poll<Result<Connection>> {
        loop {
            match &mut self.state {
                State::Idle => {
                    let (tx,rx) = oneshot::channel();
                    if self.send.send(WorkerMessage::Acquire(tx)).is_err() {
                        return Poll::Ready(Err(ClosedError.into()));
                    }
                    self.state = State::Recv(rx);
                }
                State::Recv(recv) => {
                    let result = ready!(Pin::new(recv).poll(cx));
                    self.state = State::Idle;
                    return Poll::Ready(result.unwrap_or_else(|_|Err(ClosedError.into())));
                }
            }
        }
    }

    pub fn release(&self, conn: Connection) {
        // worker gone, connection is dropped
        let _ = self.send.send(WorkerMessage::Release(conn));
    }
}

impl Clone for WorkerHandle {
    fn clone(&self) -> Self {
        Self {
            send: self.send.clone(),
            state: State::Idle,
        }
    }
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("WorkerHandle")
    }
}

type AcquireSend = oneshot::Sender<Result<Connection>>;
type AcquireRecv = oneshot::Receiver<Result<Connection>>;

enum WorkerMessage {
    Acquire(AcquireSend),
    Release(Connection),
}

pub struct WorkerFuture {
    config: PoolConfig,

    /// Opened connections that are not yet closed, idle or checked out.
    actives: usize,
    /// - new conn is pushed front
    /// - acquire conn is poped front
    /// - released conn is pushed front
    ///
    /// front queue is the most recently used connection
    conns: VecDeque<Connection>,
    queue: VecDeque<AcquireSend>,

    sleep: Pin<Box<Sleep>>,
    recv: UnboundedReceiver<WorkerMessage>,

    connecting: Option<ConnectFuture>,
}

/// Handle connection that is not yet in idle queue.
fn new_connection(mut conn: Connection, queue: &mut VecDeque<AcquireSend>, conns: &mut VecDeque<Connection>) {
    while let Some(send) = queue.pop_front() {
        if let Err(Ok(_conn)) = send.send(Ok(conn)) {
            conn = _conn;
            continue;
        }

        return;
    }

    conns.push_front(conn);
}

/// Pop the most recent idle connection, discarding closed ones.
fn pop_open(conns: &mut VecDeque<Connection>, actives: &mut usize) -> Option<Connection> {
    while let Some(conn) = conns.pop_front() {
        if !conn.is_closed() {
            return Some(conn);
        }
        *actives = actives.saturating_sub(1);
    }
    None
}

impl Future for WorkerFuture {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        let WorkerFuture {
            config, actives, conns, sleep,
            recv, queue, connecting,
        } = self.as_mut().get_mut();

        macro_rules! tracew {
            ($prefix:literal) => {
                trace!(
                    "{:10}: Active={actives}, Idle={}, Queued={}, Connecting={}",
                    $prefix,
                    conns.len(),
                    queue.len(),
                    connecting.is_some() as u8,
                );
            };
        }

        // NOTE:
        // 1. Collect all request upfront
        // 2. Try to fulfill queue, starting a connection if allowed
        // 3. Poll connection future, which may fulfill the queue again

        while let Poll::Ready(msg) = recv.poll_recv(cx) {
            let Some(msg) = msg else {
                // all Pools handle are dropped
                return Poll::Ready(())
            };

            match msg {
                WorkerMessage::Acquire(send) => {
                    queue.push_back(send);
                    tracew!("Acquire");
                }
                WorkerMessage::Release(conn) => {
                    if conn.is_closed() {
                        *actives = actives.saturating_sub(1);
                        tracew!("Discarded");
                    } else {
                        new_connection(conn, queue, conns);
                        tracew!("Released");
                    }
                }
            }
        }

        loop {
            while let Some(send) = queue.pop_front() {
                if send.is_closed() {
                    continue;
                }
                match pop_open(conns, actives) {
                    Some(conn) => {
                        if let Err(Ok(conn)) = send.send(Ok(conn)) {
                            conns.push_front(conn);
                        }
                    }
                    None => {
                        queue.push_front(send);
                        if connecting.is_none() && *actives < config.max_conn {
                            *connecting = Some((config.connect)(&config.conn));
                        }
                        break;
                    }
                }
            }

            let Some(Poll::Ready(result)) = connecting.as_mut().map(|e|e.as_mut().poll(cx)) else {
                break;
            };
            connecting.take();

            match result {
                Ok(conn) => {
                    *actives += 1;
                    new_connection(conn, queue, conns);
                    tracew!("New");
                }
                Err(_err) => {
                    error!("failed to connect: {_err}");

                    if let Some(send) = queue.pop_front() {
                        let _ = send.send(Err(_err));
                    }
                }
            }
        }

        if sleep.as_mut().poll(cx).is_ready() {
            let idle = conns.len();
            conns.retain(|conn|!conn.is_closed());
            *actives = actives.saturating_sub(idle - conns.len());

            sleep.as_mut().reset(Instant::now() + PRUNE_INTERVAL);
            // register the new deadline
            let _ = sleep.as_mut().poll(cx);

            tracew!("Pruned");
        }

        Poll::Pending
    }
}
