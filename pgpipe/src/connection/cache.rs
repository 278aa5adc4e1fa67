//! Prepared statement cache with single-flight preparation.
//!
//! The first caller of a sql text becomes the leader and its `Prepare` command
//! is scheduled, following callers for the same text are queued as waiters of
//! the entry and no other `Parse` is sent. All waiters observe the same outcome.
use std::{collections::HashMap, sync::Arc};

use super::command::Prepared;
use crate::{
    common::{ByteStr, verbose},
    statement::{StatementInfo, Waiter},
};

enum Entry {
    Pending(Vec<Waiter>),
    Resolved(Arc<StatementInfo>),
}

pub(crate) enum Lookup {
    /// Caller is resolved or queued behind the leader.
    Joined,
    /// Caller must prepare the statement.
    Leader,
}

/// Resolved statements live as long as the connection.
#[derive(Default)]
pub(crate) struct StatementCache {
    entries: HashMap<ByteStr, Entry>,
}

impl StatementCache {
    pub(crate) fn lookup(&mut self, sql: &ByteStr, waiter: Waiter) -> Lookup {
        match self.entries.get_mut(sql.as_str()) {
            Some(Entry::Resolved(info)) => {
                verbose!("statement cache hit: {}", info.name);
                waiter.resolve(Ok(info.clone()));
                Lookup::Joined
            }
            Some(Entry::Pending(waiters)) => {
                waiters.push(waiter);
                Lookup::Joined
            }
            None => {
                self.entries.insert(sql.clone(), Entry::Pending(vec![waiter]));
                Lookup::Leader
            }
        }
    }

    /// Resolve the entry of the leader, failure removes the entry.
    pub(crate) fn resolve(&mut self, prepared: Prepared) {
        let Prepared { sql, result } = prepared;
        let Some(entry) = self.entries.remove(sql.as_str()) else {
            return;
        };
        let waiters = match entry {
            Entry::Pending(waiters) => waiters,
            entry => {
                self.entries.insert(sql, entry);
                return;
            }
        };
        match result {
            Ok(info) => {
                for waiter in waiters {
                    waiter.resolve(Ok(info.clone()));
                }
                self.entries.insert(sql, Entry::Resolved(info));
            }
            Err(err) => {
                for waiter in waiters {
                    waiter.resolve(Err(err.replicate()));
                }
            }
        }
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        PreparedStatement, testing,
        connection::{Pending, holder::Shared},
        statement::StatementName,
    };

    fn info(name: StatementName) -> Arc<StatementInfo> {
        Arc::new(StatementInfo {
            name,
            sql: ByteStr::from_static("SELECT 1"),
            params: vec![],
            columns: None,
            cached: true,
        })
    }

    fn waiter() -> (Waiter, Pending<PreparedStatement>) {
        let (reply, pending) = Pending::channel();
        (Waiter::new(testing::detached(), reply), pending)
    }

    #[tokio::test]
    async fn single_flight() {
        let shared = Shared::new();
        let mut cache = StatementCache::default();
        let sql = ByteStr::from_static("SELECT 1");
        let name = StatementName::next(&shared);

        let (w1, p1) = waiter();
        let (w2, p2) = waiter();
        assert!(matches!(cache.lookup(&sql, w1), Lookup::Leader));
        assert!(matches!(cache.lookup(&sql, w2), Lookup::Joined));

        cache.resolve(Prepared { sql: sql.clone(), result: Ok(info(name.clone())) });
        assert_eq!(p1.await.unwrap().name(), name.as_str());
        assert_eq!(p2.await.unwrap().name(), name.as_str());

        let (w3, p3) = waiter();
        assert!(matches!(cache.lookup(&sql, w3), Lookup::Joined));
        assert_eq!(p3.await.unwrap().name(), name.as_str());
    }

    #[tokio::test]
    async fn failure_is_shared_then_retried() {
        let mut cache = StatementCache::default();
        let sql = ByteStr::from_static("SELEC 1");

        let (w1, p1) = waiter();
        let (w2, p2) = waiter();
        cache.lookup(&sql, w1);
        cache.lookup(&sql, w2);

        let err = testing::database_error("42601", "syntax error");
        cache.resolve(Prepared { sql: sql.clone(), result: Err(err.into()) });
        assert_eq!(p1.await.unwrap_err().as_database().unwrap().code(), "42601");
        assert_eq!(p2.await.unwrap_err().as_database().unwrap().code(), "42601");
        assert_eq!(cache.len(), 0);

        let (w3, _p3) = waiter();
        assert!(matches!(cache.lookup(&sql, w3), Lookup::Leader));
    }
}
