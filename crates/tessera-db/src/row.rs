//! Row mapping seam.
//!
//! Query operations are generic over [`FromRow`]. The crate maps single
//! scalar columns and small tuples itself; application types implement the
//! trait with `row.try_get(..)` calls.

use postgres::Row;

/// Converts one result row into a value.
pub trait FromRow: Sized {
    /// Maps `row`, failing when a column is missing or has the wrong type.
    fn from_row(row: Row) -> Result<Self, postgres::Error>;
}

impl FromRow for Row {
    fn from_row(row: Row) -> Result<Self, postgres::Error> {
        Ok(row)
    }
}

macro_rules! scalar_from_row {
    ($($ty:ty),+ $(,)?) => {
        $(
            impl FromRow for $ty {
                fn from_row(row: Row) -> Result<Self, postgres::Error> {
                    row.try_get(0)
                }
            }

            impl FromRow for Option<$ty> {
                fn from_row(row: Row) -> Result<Self, postgres::Error> {
                    row.try_get(0)
                }
            }
        )+
    };
}

scalar_from_row!(bool, i8, i16, i32, i64, u32, f32, f64, String, Vec<u8>);

macro_rules! tuple_from_row {
    ($(($($name:ident : $index:tt),+)),+ $(,)?) => {
        $(
            impl<$($name),+> FromRow for ($($name,)+)
            where
                $($name: for<'a> postgres::types::FromSql<'a>),+
            {
                fn from_row(row: Row) -> Result<Self, postgres::Error> {
                    Ok(($(row.try_get::<_, $name>($index)?,)+))
                }
            }
        )+
    };
}

tuple_from_row!(
    (A: 0, B: 1),
    (A: 0, B: 1, C: 2),
    (A: 0, B: 1, C: 2, D: 3),
);
