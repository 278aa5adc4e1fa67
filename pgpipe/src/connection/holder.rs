//! State shared between connection handles and the driver, and owner callbacks.
use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU8, AtomicU32, Ordering},
    },
};
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::{
    Error,
    common::ByteStr,
    postgres::{TransactionStatus, backend::{BackendKeyData, NotificationResponse}},
};

/// Connection lifecycle state.
///
/// State only moves forward, `Connected` to `Closing` to `Closed`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum State {
    Connected,
    Closing,
    Closed,
}

impl State {
    fn from_u8(value: u8) -> State {
        match value {
            0 => State::Connected,
            1 => State::Closing,
            _ => State::Closed,
        }
    }
}

/// Asynchronous notification received from `LISTEN`ed channel.
#[derive(Clone, Debug)]
pub struct Notification {
    process_id: u32,
    channel: ByteStr,
    payload: ByteStr,
}

impl Notification {
    /// Process id of the notifying backend.
    pub fn process_id(&self) -> u32 {
        self.process_id
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn payload(&self) -> &str {
        &self.payload
    }
}

impl From<NotificationResponse> for Notification {
    fn from(value: NotificationResponse) -> Self {
        Self {
            process_id: value.process_id,
            channel: value.channel,
            payload: value.payload,
        }
    }
}

pub(crate) type NotificationHandler = Arc<dyn Fn(&Notification) + Send + Sync>;
pub(crate) type ExceptionHandler = Arc<dyn Fn(&Error) + Send + Sync>;
pub(crate) type CloseHandler = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Holder {
    on_notification: Vec<NotificationHandler>,
    on_exception: Vec<ExceptionHandler>,
    on_close: Vec<CloseHandler>,
    params: HashMap<ByteStr, ByteStr>,
    key: Option<BackendKeyData>,
    exception_reported: bool,
    close_reported: bool,
}

pub(crate) struct Shared {
    state: AtomicU8,
    tx_status: AtomicU8,
    tx_active: AtomicBool,
    seq: AtomicU32,
    holder: Mutex<Holder>,
    closed: Notify,
}

impl Shared {
    pub(crate) fn new() -> Arc<Shared> {
        Arc::new(Shared {
            state: AtomicU8::new(State::Connected as u8),
            tx_status: AtomicU8::new(TransactionStatus::Idle.as_u8()),
            tx_active: AtomicBool::new(false),
            seq: AtomicU32::new(0),
            holder: Mutex::default(),
            closed: Notify::new(),
        })
    }

    pub(crate) fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Move state forward, returns `false` if state is already at or past `state`.
    pub(crate) fn advance(&self, state: State) -> bool {
        let prev = self.state.fetch_max(state as u8, Ordering::AcqRel);
        prev < state as u8
    }

    pub(crate) fn closed(&self) -> &Notify {
        &self.closed
    }

    pub(crate) fn tx_status(&self) -> TransactionStatus {
        TransactionStatus::from_u8(self.tx_status.load(Ordering::Acquire)).unwrap_or_default()
    }

    pub(crate) fn set_tx_status(&self, status: TransactionStatus) {
        self.tx_status.store(status.as_u8(), Ordering::Release);
    }

    /// Mark transaction active, returns `false` if one is already active.
    pub(crate) fn try_begin(&self) -> bool {
        !self.tx_active.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn end_transaction(&self) {
        self.tx_active.store(false, Ordering::Release);
    }

    pub(crate) fn is_tx_active(&self) -> bool {
        self.tx_active.load(Ordering::Acquire)
    }

    pub(crate) fn next_id(&self) -> u32 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn parameter(&self, name: &str) -> Option<ByteStr> {
        self.holder.lock().params.get(name).cloned()
    }

    pub(crate) fn set_parameter(&self, name: ByteStr, value: ByteStr) {
        self.holder.lock().params.insert(name, value);
    }

    pub(crate) fn backend_key(&self) -> Option<BackendKeyData> {
        self.holder.lock().key
    }

    pub(crate) fn set_backend_key(&self, key: BackendKeyData) {
        self.holder.lock().key = Some(key);
    }

    pub(crate) fn add_notification_handler(&self, f: NotificationHandler) {
        self.holder.lock().on_notification.push(f);
    }

    pub(crate) fn add_exception_handler(&self, f: ExceptionHandler) {
        self.holder.lock().on_exception.push(f);
    }

    /// Register close handler, invoked immediately if connection is already closed.
    pub(crate) fn add_close_handler(&self, f: CloseHandler) {
        let mut holder = self.holder.lock();
        if holder.close_reported {
            drop(holder);
            f();
            return;
        }
        holder.on_close.push(f);
    }

    /// Handlers are invoked outside the lock.
    pub(crate) fn notify(&self, notification: Notification) {
        let handlers = self.holder.lock().on_notification.clone();
        for f in handlers {
            f(&notification);
        }
    }

    /// Report fatal error to owner, at most once.
    pub(crate) fn report_exception(&self, err: &Error) {
        let handlers = {
            let mut holder = self.holder.lock();
            if std::mem::replace(&mut holder.exception_reported, true) {
                return;
            }
            holder.on_exception.clone()
        };
        for f in handlers {
            f(err);
        }
    }

    /// Report connection closed to owner, at most once.
    pub(crate) fn report_closed(&self) {
        let handlers = {
            let mut holder = self.holder.lock();
            if std::mem::replace(&mut holder.close_reported, true) {
                return;
            }
            holder.on_notification.clear();
            holder.on_exception.clear();
            std::mem::take(&mut holder.on_close)
        };
        for f in handlers {
            f();
        }
        self.closed.notify_waiters();
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[test]
    fn state_only_moves_forward() {
        let shared = Shared::new();
        assert!(shared.advance(State::Closing));
        assert!(!shared.advance(State::Connected));
        assert_eq!(shared.state(), State::Closing);
        assert!(shared.advance(State::Closed));
        assert!(!shared.advance(State::Closed));
        assert_eq!(shared.state(), State::Closed);
    }

    #[test]
    fn closed_reported_once() {
        let shared = Shared::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        shared.add_close_handler(Arc::new(move || { c.fetch_add(1, Ordering::SeqCst); }));
        shared.report_closed();
        shared.report_closed();
        assert_eq!(count.load(Ordering::SeqCst), 1);

        let c = count.clone();
        shared.add_close_handler(Arc::new(move || { c.fetch_add(1, Ordering::SeqCst); }));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn single_transaction() {
        let shared = Shared::new();
        assert!(shared.try_begin());
        assert!(!shared.try_begin());
        shared.end_transaction();
        assert!(shared.try_begin());
    }
}
