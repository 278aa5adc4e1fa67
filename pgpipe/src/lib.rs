//! Pipelined Postgres Driver
//!
//! A [`Connection`] is a cheap handle to a background driver task that owns
//! the socket. Commands from every handle are written as soon as they are
//! issued, up to the pipelining limit, and results are delivered in issue
//! order.
//!
//! # Examples
//!
//! Single connection:
//!
//! ```no_run
//! use pgpipe::Connection;
//!
//! # async fn app() -> pgpipe::Result<()> {
//! let conn = Connection::connect_env().await?;
//!
//! // both queries are in flight at once
//! let a = conn.prepared_query("SELECT $1::int4", (420,));
//! let b = conn.query("SELECT 'foo'");
//! let (a, b) = tokio::join!(a, b);
//!
//! let id: i32 = a?.rows()[0].try_get(0)?;
//! assert_eq!(id, 420);
//! assert_eq!(b?.len(), 1);
//! # Ok(())
//! # }
//! ```
//!
//! Database Pooling:
//!
//! ```no_run
//! use pgpipe::Pool;
//!
//! # async fn app() -> pgpipe::Result<()> {
//! let pool = Pool::connect_env().await?;
//!
//! let mut handles = vec![];
//!
//! for i in 0..14i32 {
//!     let pool = pool.clone();
//!     let t = tokio::spawn(async move {
//!         let conn = pool.acquire().await?;
//!         conn.prepared_query("INSERT INTO foo(id) VALUES($1)", (i,)).await
//!     });
//!     handles.push(t);
//! }
//!
//! for h in handles {
//!     h.await.unwrap()?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod common;
mod io;
mod net;
mod ext;

// Protocol
pub mod postgres;

// Encoding
pub mod encode;
pub mod row;

// Component
pub mod collector;
pub mod result;
mod statement;
mod cursor;

// Operation
pub mod transaction;
pub mod pubsub;

// Connection
pub mod connection;
pub mod pool;

mod error;

#[cfg(test)]
mod testing;


pub use encode::{Encode, IntoParams};
pub use row::{Row, FromRow, Decode, DecodeError};
pub use collector::Collector;
pub use result::{QueryResult, ResultSet};

pub use statement::PreparedStatement;
pub use cursor::{Cursor, RowStream, StreamControl};
pub use transaction::Transaction;
pub use pubsub::{Subscriber, Channel};

pub use connection::{Connection, Config, SslMode, Notification, State, Pending};
pub use pool::{Pool, PoolConfig, PoolConnection};
pub use error::{
    Error, ErrorKind, Result,
    UsageError, UnsupportedAuth, EmptyQueryError, ClosedError, TransactionRolledBack,
};
