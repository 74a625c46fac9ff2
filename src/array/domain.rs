//! Non-empty domains of fragments and arrays.

use serde::{Deserialize, Serialize};

use crate::array::schema::Datatype;
use crate::error::StorageError;

/// A non-empty domain: one `[low, high]` bound per dimension, tagged by the
/// coordinate datatype.
///
/// The tag is matched once at an operation's entry point; everything inside
/// a variant is plain typed data.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NonEmptyDomain {
    /// `int8` bounds.
    Int8(Vec<[i8; 2]>),
    /// `uint8` bounds.
    UInt8(Vec<[u8; 2]>),
    /// `int16` bounds.
    Int16(Vec<[i16; 2]>),
    /// `uint16` bounds.
    UInt16(Vec<[u16; 2]>),
    /// `int32` bounds.
    Int32(Vec<[i32; 2]>),
    /// `uint32` bounds.
    UInt32(Vec<[u32; 2]>),
    /// `int64` bounds.
    Int64(Vec<[i64; 2]>),
    /// `uint64` bounds.
    UInt64(Vec<[u64; 2]>),
    /// `float32` bounds.
    Float32(Vec<[f32; 2]>),
    /// `float64` bounds.
    Float64(Vec<[f64; 2]>),
}

macro_rules! domain_each {
    ($self:expr, |$bounds:ident| $body:expr) => {
        match $self {
            NonEmptyDomain::Int8($bounds) => $body,
            NonEmptyDomain::UInt8($bounds) => $body,
            NonEmptyDomain::Int16($bounds) => $body,
            NonEmptyDomain::UInt16($bounds) => $body,
            NonEmptyDomain::Int32($bounds) => $body,
            NonEmptyDomain::UInt32($bounds) => $body,
            NonEmptyDomain::Int64($bounds) => $body,
            NonEmptyDomain::UInt64($bounds) => $body,
            NonEmptyDomain::Float32($bounds) => $body,
            NonEmptyDomain::Float64($bounds) => $body,
        }
    };
}

macro_rules! domain_pair {
    ($a:expr, $b:expr, |$lhs:ident, $rhs:ident| $body:expr, $mismatch:expr) => {
        match ($a, $b) {
            (NonEmptyDomain::Int8($lhs), NonEmptyDomain::Int8($rhs)) => $body,
            (NonEmptyDomain::UInt8($lhs), NonEmptyDomain::UInt8($rhs)) => $body,
            (NonEmptyDomain::Int16($lhs), NonEmptyDomain::Int16($rhs)) => $body,
            (NonEmptyDomain::UInt16($lhs), NonEmptyDomain::UInt16($rhs)) => $body,
            (NonEmptyDomain::Int32($lhs), NonEmptyDomain::Int32($rhs)) => $body,
            (NonEmptyDomain::UInt32($lhs), NonEmptyDomain::UInt32($rhs)) => $body,
            (NonEmptyDomain::Int64($lhs), NonEmptyDomain::Int64($rhs)) => $body,
            (NonEmptyDomain::UInt64($lhs), NonEmptyDomain::UInt64($rhs)) => $body,
            (NonEmptyDomain::Float32($lhs), NonEmptyDomain::Float32($rhs)) => $body,
            (NonEmptyDomain::Float64($lhs), NonEmptyDomain::Float64($rhs)) => $body,
            _ => $mismatch,
        }
    };
}

fn expand_bounds<T: PartialOrd + Copy>(into: &mut [[T; 2]], from: &[[T; 2]]) {
    for (dst, src) in into.iter_mut().zip(from) {
        if src[0] < dst[0] {
            dst[0] = src[0];
        }
        if src[1] > dst[1] {
            dst[1] = src[1];
        }
    }
}

impl NonEmptyDomain {
    /// The coordinate datatype this domain is tagged with.
    #[must_use]
    pub fn datatype(&self) -> Datatype {
        match self {
            Self::Int8(_) => Datatype::Int8,
            Self::UInt8(_) => Datatype::UInt8,
            Self::Int16(_) => Datatype::Int16,
            Self::UInt16(_) => Datatype::UInt16,
            Self::Int32(_) => Datatype::Int32,
            Self::UInt32(_) => Datatype::UInt32,
            Self::Int64(_) => Datatype::Int64,
            Self::UInt64(_) => Datatype::UInt64,
            Self::Float32(_) => Datatype::Float32,
            Self::Float64(_) => Datatype::Float64,
        }
    }

    /// The number of dimensions.
    #[must_use]
    pub fn dim_num(&self) -> usize {
        domain_each!(self, |bounds| bounds.len())
    }

    /// Expand these bounds to also cover `other` (minimum bounding
    /// hyper-rectangle union).
    ///
    /// # Errors
    /// Returns [`StorageError::Internal`] if the two domains disagree on
    /// datatype or dimensionality; the coordinator only unions domains of
    /// fragments belonging to one schema.
    pub fn expand(&mut self, other: &Self) -> Result<(), StorageError> {
        if self.dim_num() != other.dim_num() {
            return Err(StorageError::Internal(
                "non-empty domain dimensionality mismatch".to_string(),
            ));
        }
        domain_pair!(
            self,
            other,
            |lhs, rhs| {
                expand_bounds(lhs, rhs);
                Ok(())
            },
            Err(StorageError::Internal(
                "non-empty domain datatype mismatch".to_string()
            ))
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expand_unions_bounds() {
        let mut a = NonEmptyDomain::Int64(vec![[0, 10], [5, 6]]);
        let b = NonEmptyDomain::Int64(vec![[-3, 4], [6, 9]]);
        a.expand(&b).unwrap();
        assert_eq!(a, NonEmptyDomain::Int64(vec![[-3, 10], [5, 9]]));
    }

    #[test]
    fn expand_rejects_mismatches() {
        let mut a = NonEmptyDomain::Int64(vec![[0, 1]]);
        assert!(a.expand(&NonEmptyDomain::Float64(vec![[0.0, 1.0]])).is_err());
        assert!(a.expand(&NonEmptyDomain::Int64(vec![[0, 1], [0, 1]])).is_err());
    }

    #[test]
    fn expand_float_bounds() {
        let mut a = NonEmptyDomain::Float64(vec![[0.5, 1.5]]);
        a.expand(&NonEmptyDomain::Float64(vec![[0.25, 1.0]])).unwrap();
        assert_eq!(a, NonEmptyDomain::Float64(vec![[0.25, 1.5]]));
    }
}
