//! Row collector abstraction.
//!
//! A [`Collector`] is a reduction over the rows of a single result, it is
//! supplied per query call and runs on the connection driver as each `DataRow`
//! arrives, so rows never need to be buffered before reduction.
use std::marker::PhantomData;

use crate::row::{DecodeError, FromRow, Row};

/// A reduction of rows into an accumulated result.
pub trait Collector: Send + 'static {
    /// Intermediate accumulation state.
    type Acc: Send + 'static;
    /// Final result.
    type Output: Send + 'static;

    /// Create an empty accumulation, called once per result.
    fn init(&self) -> Self::Acc;

    /// Fold a row into accumulation.
    fn collect(&self, acc: &mut Self::Acc, row: Row) -> Result<(), DecodeError>;

    /// Convert accumulation into final result.
    fn finish(&self, acc: Self::Acc) -> Self::Output;
}

/// Collect raw [`Row`]s, see [`rows`].
#[derive(Debug, Clone, Copy, Default)]
pub struct Rows;

/// Collect raw rows.
pub fn rows() -> Rows {
    Rows
}

impl Collector for Rows {
    type Acc = Vec<Row>;
    type Output = Vec<Row>;

    fn init(&self) -> Self::Acc {
        Vec::new()
    }

    fn collect(&self, acc: &mut Self::Acc, row: Row) -> Result<(), DecodeError> {
        acc.push(row);
        Ok(())
    }

    fn finish(&self, acc: Self::Acc) -> Self::Output {
        acc
    }
}

/// Decode every row with [`FromRow`], see [`decode`].
pub struct Decoded<T> {
    _p: PhantomData<fn() -> T>,
}

/// Decode every row into `T`.
pub fn decode<T: FromRow + Send + 'static>() -> Decoded<T> {
    Decoded { _p: PhantomData }
}

impl<T: FromRow + Send + 'static> Collector for Decoded<T> {
    type Acc = Vec<T>;
    type Output = Vec<T>;

    fn init(&self) -> Self::Acc {
        Vec::new()
    }

    fn collect(&self, acc: &mut Self::Acc, row: Row) -> Result<(), DecodeError> {
        acc.push(T::from_row(row)?);
        Ok(())
    }

    fn finish(&self, acc: Self::Acc) -> Self::Output {
        acc
    }
}

/// Fold rows with a closure, see [`fold`].
pub struct Fold<A, F> {
    init: A,
    f: F,
}

/// Fold rows into `init` with `f`.
pub fn fold<A, F>(init: A, f: F) -> Fold<A, F>
where
    A: Clone + Send + 'static,
    F: Fn(&mut A, Row) -> Result<(), DecodeError> + Send + 'static,
{
    Fold { init, f }
}

impl<A, F> Collector for Fold<A, F>
where
    A: Clone + Send + 'static,
    F: Fn(&mut A, Row) -> Result<(), DecodeError> + Send + 'static,
{
    type Acc = A;
    type Output = A;

    fn init(&self) -> Self::Acc {
        self.init.clone()
    }

    fn collect(&self, acc: &mut Self::Acc, row: Row) -> Result<(), DecodeError> {
        (self.f)(acc, row)
    }

    fn finish(&self, acc: Self::Acc) -> Self::Output {
        acc
    }
}

/// Discard all rows, see [`discard`].
#[derive(Debug, Clone, Copy, Default)]
pub struct Discard;

/// Ignore all rows, only rows affected are reported.
pub fn discard() -> Discard {
    Discard
}

impl Collector for Discard {
    type Acc = ();
    type Output = ();

    fn init(&self) { }

    fn collect(&self, _: &mut (), _: Row) -> Result<(), DecodeError> {
        Ok(())
    }

    fn finish(&self, _: ()) { }
}
