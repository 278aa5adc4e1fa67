//! Parameter encoding.
//!
//! Parameters are always sent in [`Binary`][crate::postgres::PgFormat::Binary] format.
use bytes::{Buf, Bytes};

use crate::{
    common::ByteStr,
    ext::BindParams,
    postgres::{Oid, PgType},
};

/// Value that can be encoded to be bound to sql parameter.
pub trait Encode {
    fn encode(self) -> Encoded;
}

/// Postgres encoded value.
#[derive(Debug, Clone)]
pub struct Encoded {
    value: Bytes,
    is_null: bool,
    oid: Oid,
}

impl Encoded {
    /// Create encoded value with given binary representation.
    pub fn new(value: impl Into<Bytes>, oid: Oid) -> Self {
        Self { value: value.into(), oid, is_null: false }
    }

    /// Create a `NULL` value.
    pub fn null(oid: Oid) -> Self {
        Self { value: Bytes::new(), oid, is_null: true }
    }

    /// Returns the value [`Oid`], zero means unspecified.
    pub fn oid(&self) -> Oid {
        self.oid
    }

    /// Returns `true` if value is `NULL`.
    pub fn is_null(&self) -> bool {
        self.is_null
    }

    /// Size of the value as written in `Bind` message, including the length prefix.
    pub(crate) fn bind_size(&self) -> u32 {
        4 + self.value.len() as u32
    }
}

impl Buf for Encoded {
    fn remaining(&self) -> usize {
        self.value.remaining()
    }

    fn chunk(&self) -> &[u8] {
        self.value.chunk()
    }

    fn advance(&mut self, cnt: usize) {
        self.value.advance(cnt);
    }
}

impl BindParams for Encoded {
    fn size(&self) -> i32 {
        match self.is_null {
            true => -1,
            false => self.remaining() as i32,
        }
    }
}

impl Encode for Encoded {
    fn encode(self) -> Encoded {
        self
    }
}

impl<T: Encode + PgType> Encode for Option<T> {
    fn encode(self) -> Encoded {
        match self {
            Some(value) => value.encode(),
            None => Encoded::null(T::OID),
        }
    }
}

macro_rules! encode_be {
    ($($ty:ty),*) => {$(
        impl Encode for $ty {
            fn encode(self) -> Encoded {
                Encoded::new(Bytes::copy_from_slice(&self.to_be_bytes()), <$ty>::OID)
            }
        }
    )*};
}

encode_be!(i16, i32, i64, f32, f64);

impl Encode for bool {
    fn encode(self) -> Encoded {
        Encoded::new(Bytes::from_static(if self { &[1] } else { &[0] }), Self::OID)
    }
}

impl Encode for &str {
    fn encode(self) -> Encoded {
        Encoded::new(Bytes::copy_from_slice(self.as_bytes()), <str>::OID)
    }
}

impl Encode for String {
    fn encode(self) -> Encoded {
        Encoded::new(self.into_bytes(), Self::OID)
    }
}

impl Encode for &String {
    fn encode(self) -> Encoded {
        self.as_str().encode()
    }
}

impl Encode for ByteStr {
    fn encode(self) -> Encoded {
        Encoded::new(self.into_bytes(), Self::OID)
    }
}

impl Encode for &[u8] {
    fn encode(self) -> Encoded {
        Encoded::new(Bytes::copy_from_slice(self), <[u8]>::OID)
    }
}

impl Encode for Vec<u8> {
    fn encode(self) -> Encoded {
        Encoded::new(self, Self::OID)
    }
}

impl Encode for Bytes {
    fn encode(self) -> Encoded {
        Encoded::new(self, Self::OID)
    }
}

/// A set of parameters for a single execution.
pub trait IntoParams {
    fn into_params(self) -> Vec<Encoded>;
}

impl IntoParams for () {
    fn into_params(self) -> Vec<Encoded> {
        Vec::new()
    }
}

impl IntoParams for Vec<Encoded> {
    fn into_params(self) -> Vec<Encoded> {
        self
    }
}

impl<const N: usize> IntoParams for [Encoded; N] {
    fn into_params(self) -> Vec<Encoded> {
        self.into()
    }
}

macro_rules! into_params_tuple {
    ($($t:ident $i:tt),*) => {
        impl<$($t),*> IntoParams for ($($t),*,)
        where
            $($t: Encode),*
        {
            fn into_params(self) -> Vec<Encoded> {
                vec![$(self.$i.encode()),*]
            }
        }
    };
}

into_params_tuple!(T0 0);
into_params_tuple!(T0 0, T1 1);
into_params_tuple!(T0 0, T1 1, T2 2);
into_params_tuple!(T0 0, T1 1, T2 2, T3 3);
into_params_tuple!(T0 0, T1 1, T2 2, T3 3, T4 4);
into_params_tuple!(T0 0, T1 1, T2 2, T3 3, T4 4, T5 5);
into_params_tuple!(T0 0, T1 1, T2 2, T3 3, T4 4, T5 5, T6 6);
into_params_tuple!(T0 0, T1 1, T2 2, T3 3, T4 4, T5 5, T6 6, T7 7);

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn tuple_params() {
        let params = (1i32, "foo", None::<i64>).into_params();
        assert_eq!(params.len(), 3);
        assert_eq!(params[0].oid(), 23);
        assert_eq!(params[0].chunk(), &[0, 0, 0, 1]);
        assert_eq!(params[1].oid(), 25);
        assert_eq!(params[1].size(), 3);
        assert!(params[2].is_null());
        assert_eq!(params[2].size(), -1);
        assert_eq!(params[2].oid(), 20);
    }
}
