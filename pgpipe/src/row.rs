//! Postgres row operation.
//!
//! - [`RowDescription`]
//! - [`Row`]
//! - [`Column`]
//! - [`FromRow`]
//! - [`Decode`]
//!
//! - [`Index`]
//! - [`DecodeError`]
use bytes::{Buf, Bytes};
use std::{borrow::Cow, fmt, str::Utf8Error, string::FromUtf8Error, sync::Arc};

use crate::{
    common::ByteStr,
    ext::{BytesExt, FmtExt},
    postgres::{Oid, PgFormat, PgType, ProtocolError, backend::DataRow},
};

/// Description of a single result column.
///
/// <https://www.postgresql.org/docs/current/protocol-message-formats.html#PROTOCOL-MESSAGE-FORMATS-ROWDESCRIPTION>
#[derive(Debug, Clone)]
pub struct ColumnDescriptor {
    name: ByteStr,
    table_oid: Oid,
    attribute: i16,
    type_oid: Oid,
    type_size: i16,
    type_modifier: i32,
    format: PgFormat,
}

impl ColumnDescriptor {
    /// The field name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The object ID of the table if the field can be identified as a column of a specific table, otherwise zero.
    pub fn table_oid(&self) -> Oid {
        self.table_oid
    }

    /// The attribute number of the column, otherwise zero.
    pub fn attribute(&self) -> i16 {
        self.attribute
    }

    /// The object ID of the field's data type.
    pub fn type_oid(&self) -> Oid {
        self.type_oid
    }

    /// The data type size, negative values denote variable-width types.
    pub fn type_size(&self) -> i16 {
        self.type_size
    }

    /// The type modifier, the meaning is type-specific.
    pub fn type_modifier(&self) -> i32 {
        self.type_modifier
    }

    /// The format of the values in this column.
    pub fn format(&self) -> PgFormat {
        self.format
    }
}

/// Ordered column descriptors of a query result.
///
/// Decoded once per executed statement, and shared by every [`Row`] of that result.
#[derive(Clone)]
pub struct RowDescription {
    columns: Arc<[ColumnDescriptor]>,
}

impl RowDescription {
    /// `RowDescription` message body
    pub(crate) fn decode(mut body: Bytes) -> Result<Self, ProtocolError> {
        let len = body.try_get_u16()?;
        let mut columns = Vec::with_capacity(len as usize);
        for _ in 0..len {
            let name = body.get_nul_bytestr()?;
            let table_oid = body.try_get_u32()?;
            let attribute = body.try_get_i16()?;
            let type_oid = body.try_get_u32()?;
            let type_size = body.try_get_i16()?;
            let type_modifier = body.try_get_i32()?;
            // unknown format code is treated as binary, no other format exists
            let format = PgFormat::from_code(body.try_get_u16()?).unwrap_or(PgFormat::Binary);
            columns.push(ColumnDescriptor {
                name, table_oid, attribute, type_oid, type_size, type_modifier, format,
            });
        }
        Ok(Self { columns: columns.into() })
    }

    /// Statement description always reports text format, while portal
    /// is bound with explicit result format.
    pub(crate) fn with_format(&self, format: PgFormat) -> Self {
        let columns = self
            .columns
            .iter()
            .map(|col| ColumnDescriptor { format, ..col.clone() })
            .collect();
        Self { columns }
    }

    /// Returns the number of columns.
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Returns `true` if result contains no columns.
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Returns all column descriptors.
    pub fn columns(&self) -> &[ColumnDescriptor] {
        &self.columns
    }

    /// Returns the index of the first column with given name.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|col| col.name == name)
    }
}

impl fmt::Debug for RowDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.columns.iter().map(|c| c.name.as_str())).finish()
    }
}

/// Postgres row.
pub struct Row {
    desc: RowDescription,
    values: Vec<Option<Bytes>>,
}

impl Row {
    /// Split `DataRow` values using the live `RowDescription`.
    pub(crate) fn new(desc: &RowDescription, row: DataRow) -> Result<Self, ProtocolError> {
        if row.column_len as usize != desc.len() {
            return Err(ProtocolError::ColumnCount { expect: desc.len(), found: row.column_len });
        }

        let mut body = row.body;
        let mut values = Vec::with_capacity(desc.len());
        for _ in 0..row.column_len {
            let len = body.try_get_i32()?;
            let value = match len {
                -1 => None,
                len if len < 0 => return Err(ProtocolError::truncated()),
                len => Some(body.try_split_to(len as usize)?),
            };
            values.push(value);
        }

        Ok(Self { desc: desc.clone(), values })
    }

    /// Returns `true` if row contains no columns.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Returns the number of fields/column.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns the row description.
    pub fn description(&self) -> &RowDescription {
        &self.desc
    }

    /// Get column by index or name.
    pub fn column<I: Index>(&self, idx: I) -> Result<Column, DecodeError> {
        let nth = idx.position(&self.desc)?;
        Ok(Column {
            desc: self.desc.columns[nth].clone(),
            value: self.values[nth].clone(),
        })
    }

    /// Try get and decode column.
    pub fn try_get<I: Index, R: Decode>(&self, idx: I) -> Result<R, DecodeError> {
        R::decode(self.column(idx)?)
    }

    /// Try decode type using [`FromRow`] implementation.
    pub fn decode<D: FromRow>(self) -> Result<D, DecodeError> {
        D::from_row(self)
    }
}

impl IntoIterator for Row {
    type Item = Column;

    type IntoIter = IntoIter;

    fn into_iter(self) -> Self::IntoIter {
        IntoIter {
            desc: self.desc,
            values: self.values.into_iter(),
            iter_n: 0,
        }
    }
}

/// [`IntoIterator`] implementation from [`Row`].
pub struct IntoIter {
    desc: RowDescription,
    values: std::vec::IntoIter<Option<Bytes>>,
    iter_n: usize,
}

impl Iterator for IntoIter {
    type Item = Column;

    fn next(&mut self) -> Option<Self::Item> {
        let value = self.values.next()?;
        let desc = self.desc.columns[self.iter_n].clone();
        self.iter_n += 1;
        Some(Column { desc, value })
    }
}

impl fmt::Debug for Row {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut dbg = f.debug_map();
        for (col, value) in self.desc.columns.iter().zip(&self.values) {
            dbg.key(&col.name);
            match value {
                None => dbg.value(&format_args!("NULL")),
                Some(v) => dbg.value(&v.lossy()),
            };
        }
        dbg.finish()
    }
}

/// Postgres column.
#[derive(Debug, Clone)]
pub struct Column {
    desc: ColumnDescriptor,
    value: Option<Bytes>,
}

impl Column {
    /// Returns column [`Oid`].
    pub fn oid(&self) -> Oid {
        self.desc.type_oid
    }

    /// Returns column name.
    pub fn name(&self) -> &str {
        &self.desc.name
    }

    /// Returns value format.
    pub fn format(&self) -> PgFormat {
        self.desc.format
    }

    /// Return `true` if value is NULL.
    pub const fn is_null(&self) -> bool {
        self.value.is_none()
    }

    /// Extract the inner bytes as slice.
    ///
    /// Returns [`None`] if value is `NULL`.
    pub fn as_slice(&self) -> Option<&[u8]> {
        self.value.as_deref()
    }

    /// Consume self into the inner [`Bytes`].
    ///
    /// Returns [`None`] if value is `NULL`.
    pub fn into_value(self) -> Option<Bytes> {
        self.value
    }

    /// Try consume self into the inner [`Bytes`].
    ///
    /// Return [`DecodeError::Null`] if value is `NULL`.
    pub fn try_into_value(self) -> Result<Bytes, DecodeError> {
        self.value.ok_or(DecodeError::Null)
    }

    /// Try decode type using [`Decode`] implementation.
    pub fn decode<D: Decode>(self) -> Result<D, DecodeError> {
        D::decode(self)
    }

    fn expect_oid(&self, oids: &[Oid]) -> Result<(), DecodeError> {
        match oids.contains(&self.oid()) {
            true => Ok(()),
            false => Err(DecodeError::OidMissmatch { expect: oids[0], found: self.oid() }),
        }
    }

    fn text(self) -> Result<ByteStr, DecodeError> {
        Ok(ByteStr::from_utf8(self.try_into_value()?)?)
    }
}

// ===== Traits =====

/// Type that can be constructed from a row.
pub trait FromRow: Sized {
    /// Construct self from row.
    fn from_row(row: Row) -> Result<Self, DecodeError>;
}

impl FromRow for Row {
    fn from_row(row: Row) -> Result<Self, DecodeError> {
        Ok(row)
    }
}

impl FromRow for () {
    fn from_row(_: Row) -> Result<Self, DecodeError> {
        Ok(())
    }
}

macro_rules! from_row_tuple {
    ($($t:ident $i:literal),*) => {
        impl<$($t),*> FromRow for ($($t),*,)
        where
            $($t: Decode),*
        {
            fn from_row(row: Row) -> Result<Self, DecodeError> {
                Ok((
                    $(row.try_get($i)?),*,
                ))
            }
        }
    };
}

from_row_tuple!(T0 0);
from_row_tuple!(T0 0, T1 1);
from_row_tuple!(T0 0, T1 1, T2 2);
from_row_tuple!(T0 0, T1 1, T2 2, T3 3);
from_row_tuple!(T0 0, T1 1, T2 2, T3 3, T4 4);
from_row_tuple!(T0 0, T1 1, T2 2, T3 3, T4 4, T5 5);

/// A type that can be constructed from [`Column`].
///
/// Implementation must handle both [`PgFormat`], simple query returns text values
/// while extended query returns binary values.
pub trait Decode: Sized {
    /// Try decode self from column.
    fn decode(column: Column) -> Result<Self, DecodeError>;
}

impl Decode for Column {
    fn decode(column: Column) -> Result<Self, DecodeError> {
        Ok(column)
    }
}

impl<T: Decode> Decode for Option<T> {
    fn decode(column: Column) -> Result<Self, DecodeError> {
        match column.is_null() {
            true => Ok(None),
            false => column.decode().map(Some),
        }
    }
}

impl Decode for () {
    fn decode(_: Column) -> Result<Self, DecodeError> {
        Ok(())
    }
}

macro_rules! decode_number {
    ($($ty:ty),*) => {$(
        impl Decode for $ty {
            fn decode(col: Column) -> Result<Self, DecodeError> {
                col.expect_oid(&[Self::OID])?;
                match col.format() {
                    PgFormat::Binary => {
                        let value = col.try_into_value()?;
                        let Ok(be) = <[u8; size_of::<$ty>()]>::try_from(&value[..]) else {
                            return Err(DecodeError::Length { expect: size_of::<$ty>(), found: value.len() });
                        };
                        Ok(<$ty>::from_be_bytes(be))
                    },
                    PgFormat::Text => col
                        .text()?
                        .parse()
                        .map_err(|_| DecodeError::Parse(stringify!($ty).into())),
                }
            }
        }
    )*};
}

decode_number!(i16, i32, i64, f32, f64);

impl Decode for bool {
    fn decode(col: Column) -> Result<Self, DecodeError> {
        col.expect_oid(&[Self::OID])?;
        match col.format() {
            PgFormat::Binary => match &col.try_into_value()?[..] {
                [b] => Ok(*b != 0),
                value => Err(DecodeError::Length { expect: 1, found: value.len() }),
            },
            PgFormat::Text => match &col.try_into_value()?[..] {
                b"t" => Ok(true),
                b"f" => Ok(false),
                _ => Err(DecodeError::Parse("bool".into())),
            },
        }
    }
}

/// text, varchar, bpchar, name, unknown
const TEXT_OIDS: &[Oid] = &[25, 1043, 1042, 19, 705];

impl Decode for ByteStr {
    fn decode(col: Column) -> Result<Self, DecodeError> {
        // every type have text representation
        if let PgFormat::Binary = col.format() {
            col.expect_oid(TEXT_OIDS)?;
        }
        col.text()
    }
}

impl Decode for String {
    fn decode(col: Column) -> Result<Self, DecodeError> {
        ByteStr::decode(col).map(|s| String::from(s.as_str()))
    }
}

impl Decode for Bytes {
    fn decode(col: Column) -> Result<Self, DecodeError> {
        col.expect_oid(&[Self::OID])?;
        match col.format() {
            PgFormat::Binary => col.try_into_value(),
            PgFormat::Text => decode_bytea_hex(&col.try_into_value()?).map(Bytes::from),
        }
    }
}

impl Decode for Vec<u8> {
    fn decode(col: Column) -> Result<Self, DecodeError> {
        Bytes::decode(col).map(Vec::from)
    }
}

/// Text `bytea` output in hex format, `\x` followed by two hex digit per byte.
fn decode_bytea_hex(text: &[u8]) -> Result<Vec<u8>, DecodeError> {
    let Some(hex) = text.strip_prefix(b"\\x") else {
        return Err(DecodeError::Parse("bytea".into()));
    };
    if hex.len() % 2 != 0 {
        return Err(DecodeError::Parse("bytea".into()));
    }
    fn digit(b: u8) -> Result<u8, DecodeError> {
        match b {
            b'0'..=b'9' => Ok(b - b'0'),
            b'a'..=b'f' => Ok(b - b'a' + 10),
            b'A'..=b'F' => Ok(b - b'A' + 10),
            _ => Err(DecodeError::Parse("bytea".into())),
        }
    }
    hex.chunks_exact(2)
        .map(|pair| -> Result<u8, DecodeError> { Ok(digit(pair[0])? << 4 | digit(pair[1])?) })
        .collect()
}

/// Type that can be used for indexing column.
pub trait Index: Sized + sealed::Sealed {
    /// Returns the nth column.
    fn position(self, desc: &RowDescription) -> Result<usize, DecodeError>;
}

impl Index for usize {
    fn position(self, desc: &RowDescription) -> Result<usize, DecodeError> {
        match self < desc.len() {
            true => Ok(self),
            false => Err(DecodeError::IndexOutOfBounds(self)),
        }
    }
}

impl Index for &str {
    fn position(self, desc: &RowDescription) -> Result<usize, DecodeError> {
        desc.position(self).ok_or_else(|| DecodeError::ColumnNotFound(String::from(self).into()))
    }
}

mod sealed {
    pub trait Sealed { }
    impl Sealed for usize { }
    impl Sealed for &str { }
}

macro_rules! from {
    (<$ty:ty>$pat:pat => $body:expr) => {
        impl From<$ty> for DecodeError {
            fn from($pat: $ty) -> Self {
                $body
            }
        }
    };
}

/// An error when decoding row value.
#[derive(Clone)]
pub enum DecodeError {
    /// Postgres return non utf8 string.
    Utf8(Utf8Error),
    /// Column requested not found.
    ColumnNotFound(Cow<'static,str>),
    /// Index requested is out of bounds.
    IndexOutOfBounds(usize),
    /// Oid requested missmatch.
    OidMissmatch {
        expect: Oid,
        found: Oid,
    },
    /// Binary value length missmatch.
    Length {
        expect: usize,
        found: usize,
    },
    /// Text value cannot be parsed as requested type.
    Parse(Cow<'static,str>),
    /// Row is null.
    Null,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("failed to decode value, ")?;
        match self {
            Self::Utf8(e) => write!(f, "{e}"),
            Self::ColumnNotFound(name) => write!(f, "column not found: {name:?}"),
            Self::IndexOutOfBounds(u) => write!(f, "index out of bounds: {u:?}"),
            Self::OidMissmatch { expect, found } => write!(f, "data type missmatch, expected oid {expect} found {found}"),
            Self::Length { expect, found } => write!(f, "expected {expect} bytes found {found}"),
            Self::Parse(ty) => write!(f, "invalid text representation of {ty}"),
            Self::Null => write!(f, "unexpected NULL value"),
        }
    }
}

from!(<Utf8Error>e => Self::Utf8(e));
from!(<FromUtf8Error>e => Self::Utf8(e.utf8_error()));

impl std::error::Error for DecodeError { }

impl fmt::Debug for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}
