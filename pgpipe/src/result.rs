//! Query results.
use crate::{
    Result,
    common::ByteStr,
    postgres::ProtocolError,
    row::RowDescription,
};

pub use crate::postgres::TransactionStatus;

/// Result of a single executed statement.
#[derive(Debug)]
pub struct QueryResult<T> {
    pub(crate) rows: T,
    pub(crate) rows_affected: u64,
    pub(crate) columns: Option<RowDescription>,
    pub(crate) tag: ByteStr,
    pub(crate) suspended: bool,
    pub(crate) transaction_status: TransactionStatus,
}

impl<T> QueryResult<T> {
    /// Returns the collected rows.
    pub fn rows(&self) -> &T {
        &self.rows
    }

    /// Consume self into the collected rows.
    pub fn into_rows(self) -> T {
        self.rows
    }

    /// Number of rows affected, or returned, by the statement.
    pub fn rows_affected(&self) -> u64 {
        self.rows_affected
    }

    /// Columns of the result, [`None`] if statement does not return rows.
    pub fn columns(&self) -> Option<&RowDescription> {
        self.columns.as_ref()
    }

    /// The command tag, e.g. `INSERT 0 1`.
    ///
    /// Empty for empty query and suspended portal.
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Returns `true` if the portal is suspended with more rows available.
    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    /// Transaction status reported right after this command completed.
    ///
    /// Unlike [`Connection::transaction_status`][1], this is not affected by
    /// commands pipelined after it.
    ///
    /// [1]: crate::Connection::transaction_status
    pub fn transaction_status(&self) -> TransactionStatus {
        self.transaction_status
    }
}

/// Results of every statement in a query string, or every execution in a batch.
#[derive(Debug)]
pub struct ResultSet<T> {
    pub(crate) results: Vec<QueryResult<T>>,
    pub(crate) transaction_status: TransactionStatus,
}

impl<T> ResultSet<T> {
    /// Number of results.
    pub fn len(&self) -> usize {
        self.results.len()
    }

    /// Returns `true` if there is no result.
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Returns all results.
    pub fn results(&self) -> &[QueryResult<T>] {
        &self.results
    }

    /// Returns the last result.
    pub fn last(&self) -> Option<&QueryResult<T>> {
        self.results.last()
    }

    /// Transaction status reported right after this command completed.
    pub fn transaction_status(&self) -> TransactionStatus {
        self.transaction_status
    }

    /// Total rows affected of all results.
    pub fn rows_affected(&self) -> u64 {
        self.results.iter().map(QueryResult::rows_affected).sum()
    }
}

impl<T> IntoIterator for ResultSet<T> {
    type Item = QueryResult<T>;

    type IntoIter = std::vec::IntoIter<QueryResult<T>>;

    fn into_iter(self) -> Self::IntoIter {
        self.results.into_iter()
    }
}

/// Completion payload built from accumulated results.
pub(crate) trait FromResultSet<T>: Sized + Send + 'static {
    fn from_set(set: ResultSet<T>) -> Result<Self>;
}

impl<T: Send + 'static> FromResultSet<T> for ResultSet<T> {
    fn from_set(set: ResultSet<T>) -> Result<Self> {
        Ok(set)
    }
}

impl<T: Send + 'static> FromResultSet<T> for QueryResult<T> {
    fn from_set(mut set: ResultSet<T>) -> Result<Self> {
        match set.results.pop() {
            Some(result) => Ok(result),
            None => Err(ProtocolError::unexpected_phase(b'Z', "Execute").into()),
        }
    }
}
