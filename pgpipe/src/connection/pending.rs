//! Completion channel between the driver and callers.
use std::{
    cell::Cell,
    pin::Pin,
    task::{Context, Poll, ready},
};
use tokio::sync::oneshot;

use crate::{
    Result,
    error::{ClosedError, UsageError},
};

thread_local! {
    static IN_DRIVER: Cell<bool> = const { Cell::new(false) };
}

/// Mark current thread as running the connection driver until dropped.
pub(crate) struct DriverGuard {
    prev: bool,
}

pub(crate) fn enter_driver() -> DriverGuard {
    DriverGuard { prev: IN_DRIVER.replace(true) }
}

impl Drop for DriverGuard {
    fn drop(&mut self) {
        IN_DRIVER.set(self.prev);
    }
}

fn in_driver() -> bool {
    IN_DRIVER.get()
}

/// Sending half of a [`Pending`], a reply can only be sent once.
pub(crate) struct Reply<T> {
    send: oneshot::Sender<Result<T>>,
}

impl<T> Reply<T> {
    pub(crate) fn send(self, result: Result<T>) {
        // caller may have dropped the `Pending`
        let _ = self.send.send(result);
    }
}

/// A future that resolves when the driver completes a command.
///
/// Every scheduled command resolves exactly once, either with its result or
/// with the error that closed the connection.
#[must_use = "futures do nothing unless polled"]
pub struct Pending<T> {
    inner: Inner<T>,
}

enum Inner<T> {
    Wait(oneshot::Receiver<Result<T>>),
    Ready(Option<Result<T>>),
}

impl<T> Pending<T> {
    pub(crate) fn channel() -> (Reply<T>, Pending<T>) {
        let (send, recv) = oneshot::channel();
        (Reply { send }, Pending { inner: Inner::Wait(recv) })
    }

    pub(crate) fn ready(result: Result<T>) -> Pending<T> {
        Pending { inner: Inner::Ready(Some(result)) }
    }

    /// Block current thread until completion.
    ///
    /// This is intended for synchronous callers. Waiting inside the
    /// connection driver, e.g. in a connection callback, or inside an async
    /// runtime would deadlock, in which case it fails immediately with
    /// [`UsageError::BlockingInDriver`].
    pub fn wait(self) -> Result<T> {
        if in_driver() || tokio::runtime::Handle::try_current().is_ok() {
            return Err(UsageError::BlockingInDriver.into());
        }
        match self.inner {
            Inner::Wait(recv) => recv.blocking_recv().unwrap_or_else(|_|Err(ClosedError.into())),
            Inner::Ready(result) => result.unwrap_or_else(||Err(ClosedError.into())),
        }
    }
}

impl<T> Unpin for Pending<T> { }

impl<T> Future for Pending<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.inner {
            Inner::Wait(recv) => {
                let result = ready!(Pin::new(recv).poll(cx));
                Poll::Ready(result.unwrap_or_else(|_|Err(ClosedError.into())))
            }
            Inner::Ready(result) => Poll::Ready(result.take().expect("`Pending` polled after completion")),
        }
    }
}

impl<T> std::fmt::Debug for Pending<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Pending")
    }
}
