//! The [`Transaction`] type.
use crate::{
    Connection, Result,
    collector,
    connection::command::{Command, Discard, SimpleQuery},
    error::{TransactionRolledBack, UsageError},
    postgres::TransactionStatus,
};

/// An RAII implementation of transaction scope.
///
/// To begin a transaction, use [`Connection::begin`].
///
/// To commit transaction, use [`Transaction::commit`].
///
/// If not commited, when this structure is dropped, transaction will be rolled back.
///
/// Connection is shared by every handle, so only one transaction can be
/// active per connection, and commands scheduled through any handle while
/// the transaction is active are part of it.
///
/// # Example
///
/// ```no_run
/// # async fn test(conn: pgpipe::Connection) -> pgpipe::Result<()> {
/// let tx = conn.begin().await?;
///
/// tx.query("insert into post(name) values('foo')").await?;
///
/// tx.commit().await?;
/// # Ok(())
/// # }
/// ```
pub struct Transaction {
    conn: Connection,
    close_on_end: bool,
    ended: bool,
}

impl Transaction {
    pub(crate) async fn begin(conn: Connection, close_on_end: bool) -> Result<Transaction> {
        if !conn.shared().try_begin() {
            return Err(UsageError::TransactionActive.into());
        }

        // dropped while `BEGIN` is in flight rolls back
        let mut tx = Transaction { conn, close_on_end, ended: false };

        if let Err(err) = tx.conn.query_with("BEGIN", collector::discard()).await {
            tx.end();
            return Err(err);
        }

        Ok(tx)
    }

    /// Returns the underlying [`Connection`].
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Transaction status reported by the last `ReadyForQuery`.
    pub fn status(&self) -> TransactionStatus {
        self.conn.transaction_status()
    }

    /// Commit transaction.
    ///
    /// If transaction block is failed, server rolls back instead, and this
    /// returns [`ErrorKind::TransactionRolledBack`][crate::ErrorKind::TransactionRolledBack].
    pub async fn commit(mut self) -> Result<()> {
        let result = self.conn.query_with("COMMIT", collector::discard()).await;
        self.end();
        let set = result?;
        if set.last().is_some_and(|result|result.tag() == "ROLLBACK") {
            return Err(TransactionRolledBack.into());
        }
        Ok(())
    }

    /// Rollback transaction.
    pub async fn rollback(mut self) -> Result<()> {
        let result = self.conn.query_with("ROLLBACK", collector::discard()).await;
        self.end();
        result.map(drop)
    }

    fn end(&mut self) {
        self.ended = true;
        self.conn.shared().end_transaction();
        if self.close_on_end {
            self.conn.close();
        }
    }
}

impl std::ops::Deref for Transaction {
    type Target = Connection;

    fn deref(&self) -> &Self::Target {
        &self.conn
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.ended {
            let rollback = SimpleQuery::new("ROLLBACK".into(), Box::new(Discard));
            self.conn.schedule(Command::SimpleQuery(rollback));
            self.end();
        }
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("status", &self.status())
            .field("close_on_end", &self.close_on_end)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        ErrorKind,
        testing::{self, Backend, msg},
    };

    async fn begin(conn: &Connection, backend: &mut Backend, close_on_end: bool) -> Transaction {
        let tx = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.begin_with(close_on_end).await })
        };
        assert_eq!(backend.expect(b'Q').await, b"BEGIN\0");
        backend.send(&[msg::command_complete("BEGIN"), msg::ready(b'T')]).await;
        tx.await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn commit() {
        let (conn, mut backend) = testing::connect(testing::config()).await;
        let tx = begin(&conn, &mut backend, false).await;
        assert_eq!(tx.status(), TransactionStatus::InTransaction);

        let commit = tokio::spawn(tx.commit());
        assert_eq!(backend.expect(b'Q').await, b"COMMIT\0");
        backend.send(&[msg::command_complete("COMMIT"), msg::ready(b'I')]).await;
        commit.await.unwrap().unwrap();

        assert_eq!(conn.transaction_status(), TransactionStatus::Idle);
        assert!(!conn.shared().is_tx_active());
    }

    #[tokio::test]
    async fn commit_failed_block() {
        let (conn, mut backend) = testing::connect(testing::config()).await;
        let tx = begin(&conn, &mut backend, false).await;

        let commit = tokio::spawn(tx.commit());
        backend.expect(b'Q').await;
        backend.send(&[msg::command_complete("ROLLBACK"), msg::ready(b'I')]).await;

        let err = commit.await.unwrap().unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::TransactionRolledBack(_)));
    }

    #[tokio::test]
    async fn drop_rolls_back() {
        let (conn, mut backend) = testing::connect(testing::config()).await;
        let tx = begin(&conn, &mut backend, false).await;
        drop(tx);

        assert_eq!(backend.expect(b'Q').await, b"ROLLBACK\0");
        backend.send(&[msg::command_complete("ROLLBACK"), msg::ready(b'I')]).await;

        // a new transaction is queued after the rollback
        begin(&conn, &mut backend, false).await;
    }

    #[tokio::test]
    async fn one_transaction_per_connection() {
        let (conn, mut backend) = testing::connect(testing::config()).await;
        let _tx = begin(&conn, &mut backend, false).await;

        let err = conn.begin().await.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Usage(UsageError::TransactionActive)));
        backend.assert_idle().await;
    }

    #[tokio::test]
    async fn failed_begin_releases_transaction() {
        let (conn, mut backend) = testing::connect(testing::config()).await;
        let tx = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.begin().await })
        };
        backend.expect(b'Q').await;
        backend.send(&[msg::error("25001", "already in transaction"), msg::ready(b'I')]).await;
        assert!(tx.await.unwrap().is_err());
        assert!(!conn.shared().is_tx_active());
    }

    #[tokio::test]
    async fn close_on_end() {
        let (conn, mut backend) = testing::connect(testing::config()).await;
        let tx = begin(&conn, &mut backend, true).await;

        let rollback = tokio::spawn(tx.rollback());
        assert_eq!(backend.expect(b'Q').await, b"ROLLBACK\0");
        backend.send(&[msg::command_complete("ROLLBACK"), msg::ready(b'I')]).await;
        rollback.await.unwrap().unwrap();

        backend.expect(b'X').await;
        drop(backend);
        conn.closed().await;
    }
}
