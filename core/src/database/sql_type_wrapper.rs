use std::borrow::Cow;

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};
use rust_decimal::{prelude::ToPrimitive, Decimal};
use tiberius::{numeric::Numeric, ColumnData, FromSql, IntoSql, ToSql};
use uuid::Uuid;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum SqlValueError {
    #[error("Can not convert a {from} value into {to}")]
    IncompatibleType { from: &'static str, to: &'static str },

    #[error("Value {value} is out of range for {to}")]
    OutOfRange { value: String, to: &'static str },

    #[error("Value is NULL but {0} can not hold NULL")]
    UnexpectedNull(&'static str),

    #[error("Record has no field named '{0}'")]
    UnknownField(String),

    #[error("Unsupported column data: {0}")]
    Unsupported(String),
}

/// A single database bindable value.
///
/// Records hand their fields over as `SqlValue`s, the loader coerces them into the staging
/// column types and the connection binds them as parameters or streams them through bulk copy.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Bool(bool),
    U8(u8),
    I16(i16),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    Decimal(Decimal),
    String(String),
    Bytes(Vec<u8>),
    Uuid(Uuid),
    Date(NaiveDate),
    Time(NaiveTime),
    DateTime(NaiveDateTime),
    DateTimeOffset(DateTime<FixedOffset>),
}

impl SqlValue {
    pub fn raw_name(&self) -> &'static str {
        match self {
            SqlValue::Null => "Null",
            SqlValue::Bool(_) => "Bool",
            SqlValue::U8(_) => "U8",
            SqlValue::I16(_) => "I16",
            SqlValue::I32(_) => "I32",
            SqlValue::I64(_) => "I64",
            SqlValue::F32(_) => "F32",
            SqlValue::F64(_) => "F64",
            SqlValue::Decimal(_) => "Decimal",
            SqlValue::String(_) => "String",
            SqlValue::Bytes(_) => "Bytes",
            SqlValue::Uuid(_) => "Uuid",
            SqlValue::Date(_) => "Date",
            SqlValue::Time(_) => "Time",
            SqlValue::DateTime(_) => "DateTime",
            SqlValue::DateTimeOffset(_) => "DateTimeOffset",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    /// Integer view of the value, `None` when it is not a whole number.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::Bool(v) => Some(i64::from(*v)),
            SqlValue::U8(v) => Some(i64::from(*v)),
            SqlValue::I16(v) => Some(i64::from(*v)),
            SqlValue::I32(v) => Some(i64::from(*v)),
            SqlValue::I64(v) => Some(*v),
            SqlValue::Decimal(v) if v.fract().is_zero() => v.to_i64(),
            SqlValue::F64(v) if v.fract() == 0.0 => Some(*v as i64),
            SqlValue::F32(v) if v.fract() == 0.0 => Some(*v as i64),
            SqlValue::String(v) => v.trim().parse::<i64>().ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            SqlValue::U8(v) => Some(f64::from(*v)),
            SqlValue::I16(v) => Some(f64::from(*v)),
            SqlValue::I32(v) => Some(f64::from(*v)),
            SqlValue::I64(v) => Some(*v as f64),
            SqlValue::F32(v) => Some(f64::from(*v)),
            SqlValue::F64(v) => Some(*v),
            SqlValue::Decimal(v) => v.to_f64(),
            SqlValue::String(v) => v.trim().parse::<f64>().ok(),
            _ => None,
        }
    }

    pub fn as_decimal(&self) -> Option<Decimal> {
        match self {
            SqlValue::U8(v) => Some(Decimal::from(*v)),
            SqlValue::I16(v) => Some(Decimal::from(*v)),
            SqlValue::I32(v) => Some(Decimal::from(*v)),
            SqlValue::I64(v) => Some(Decimal::from(*v)),
            SqlValue::F32(v) => Decimal::try_from(*v).ok(),
            SqlValue::F64(v) => Decimal::try_from(*v).ok(),
            SqlValue::Decimal(v) => Some(*v),
            SqlValue::String(v) => v.trim().parse::<Decimal>().ok(),
            _ => None,
        }
    }

    /// Owned tiberius column data. `NULL` is sent as a typed NULL of `null_as`, the server
    /// (and the bulk load encoder) need to know which type the missing value has.
    pub fn to_column_data(&self, null_as: NullKind) -> ColumnData<'static> {
        match self {
            SqlValue::Null => null_as.column_data(),
            SqlValue::Bool(v) => ColumnData::Bit(Some(*v)),
            SqlValue::U8(v) => ColumnData::U8(Some(*v)),
            SqlValue::I16(v) => ColumnData::I16(Some(*v)),
            SqlValue::I32(v) => ColumnData::I32(Some(*v)),
            SqlValue::I64(v) => ColumnData::I64(Some(*v)),
            SqlValue::F32(v) => ColumnData::F32(Some(*v)),
            SqlValue::F64(v) => ColumnData::F64(Some(*v)),
            SqlValue::Decimal(v) => {
                ColumnData::Numeric(Some(Numeric::new_with_scale(v.mantissa(), v.scale() as u8)))
            }
            SqlValue::String(v) => ColumnData::String(Some(Cow::Owned(v.clone()))),
            SqlValue::Bytes(v) => ColumnData::Binary(Some(Cow::Owned(v.clone()))),
            SqlValue::Uuid(v) => ColumnData::Guid(Some(*v)),
            SqlValue::Date(v) => (*v).into_sql(),
            SqlValue::Time(v) => (*v).into_sql(),
            SqlValue::DateTime(v) => (*v).into_sql(),
            SqlValue::DateTimeOffset(v) => (*v).into_sql(),
        }
    }

    /// Reads a value back out of a result row cell.
    pub fn from_column_data(data: &ColumnData<'static>) -> Result<Self, SqlValueError> {
        let value = match data {
            ColumnData::U8(v) => v.map(SqlValue::U8),
            ColumnData::I16(v) => v.map(SqlValue::I16),
            ColumnData::I32(v) => v.map(SqlValue::I32),
            ColumnData::I64(v) => v.map(SqlValue::I64),
            ColumnData::F32(v) => v.map(SqlValue::F32),
            ColumnData::F64(v) => v.map(SqlValue::F64),
            ColumnData::Bit(v) => v.map(SqlValue::Bool),
            ColumnData::String(v) => v.as_ref().map(|s| SqlValue::String(s.to_string())),
            ColumnData::Guid(v) => v.map(SqlValue::Uuid),
            ColumnData::Binary(v) => v.as_ref().map(|b| SqlValue::Bytes(b.to_vec())),
            ColumnData::Numeric(_) => read_with::<Decimal>(data)?.map(SqlValue::Decimal),
            ColumnData::DateTime(_) | ColumnData::SmallDateTime(_) | ColumnData::DateTime2(_) => {
                read_with::<NaiveDateTime>(data)?.map(SqlValue::DateTime)
            }
            ColumnData::Date(_) => read_with::<NaiveDate>(data)?.map(SqlValue::Date),
            ColumnData::Time(_) => read_with::<NaiveTime>(data)?.map(SqlValue::Time),
            ColumnData::DateTimeOffset(_) => {
                read_with::<DateTime<FixedOffset>>(data)?.map(SqlValue::DateTimeOffset)
            }
            ColumnData::Xml(_) => return Err(SqlValueError::Unsupported("xml".to_string())),
        };

        Ok(value.unwrap_or(SqlValue::Null))
    }
}

fn read_with<'a, T: FromSql<'a>>(
    data: &'a ColumnData<'static>,
) -> Result<Option<T>, SqlValueError> {
    T::from_sql(data).map_err(|e| SqlValueError::Unsupported(e.to_string()))
}

impl ToSql for SqlValue {
    fn to_sql(&self) -> ColumnData<'_> {
        self.to_column_data(NullKind::String)
    }
}

/// Which typed NULL to emit for a missing value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NullKind {
    Bool,
    U8,
    I16,
    I32,
    I64,
    F32,
    F64,
    Decimal,
    String,
    Bytes,
    Uuid,
    Date,
    Time,
    DateTime,
    DateTimeOffset,
}

impl NullKind {
    pub fn column_data(self) -> ColumnData<'static> {
        match self {
            NullKind::Bool => ColumnData::Bit(None),
            NullKind::U8 => ColumnData::U8(None),
            NullKind::I16 => ColumnData::I16(None),
            NullKind::I32 => ColumnData::I32(None),
            NullKind::I64 => ColumnData::I64(None),
            NullKind::F32 => ColumnData::F32(None),
            NullKind::F64 => ColumnData::F64(None),
            NullKind::Decimal => ColumnData::Numeric(None),
            NullKind::String => ColumnData::String(None),
            NullKind::Bytes => ColumnData::Binary(None),
            NullKind::Uuid => ColumnData::Guid(None),
            NullKind::Date => ColumnData::Date(None),
            NullKind::Time => ColumnData::Time(None),
            NullKind::DateTime => ColumnData::DateTime2(None),
            NullKind::DateTimeOffset => ColumnData::DateTimeOffset(None),
        }
    }
}

macro_rules! impl_from_for_sql_value {
    ($($ty:ty => $variant:ident),+ $(,)?) => {
        $(
            impl From<$ty> for SqlValue {
                fn from(value: $ty) -> Self {
                    SqlValue::$variant(value)
                }
            }
        )+
    };
}

impl_from_for_sql_value!(
    bool => Bool,
    u8 => U8,
    i16 => I16,
    i32 => I32,
    i64 => I64,
    f32 => F32,
    f64 => F64,
    Decimal => Decimal,
    String => String,
    Vec<u8> => Bytes,
    Uuid => Uuid,
    NaiveDate => Date,
    NaiveTime => Time,
    NaiveDateTime => DateTime,
    DateTime<FixedOffset> => DateTimeOffset,
);

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        SqlValue::String(value.to_string())
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(SqlValue::Null)
    }
}

/// Conversion used when a value read back from the server is written onto a record field.
pub trait FromSqlValue: Sized {
    fn from_sql_value(value: SqlValue) -> Result<Self, SqlValueError>;
}

macro_rules! impl_from_sql_value_integer {
    ($($ty:ty),+ $(,)?) => {
        $(
            impl FromSqlValue for $ty {
                fn from_sql_value(value: SqlValue) -> Result<Self, SqlValueError> {
                    if value.is_null() {
                        return Err(SqlValueError::UnexpectedNull(stringify!($ty)));
                    }
                    let wide = value.as_i64().ok_or(SqlValueError::IncompatibleType {
                        from: value.raw_name(),
                        to: stringify!($ty),
                    })?;
                    <$ty>::try_from(wide).map_err(|_| SqlValueError::OutOfRange {
                        value: wide.to_string(),
                        to: stringify!($ty),
                    })
                }
            }
        )+
    };
}

impl_from_sql_value_integer!(u8, i16, i32, i64, u16, u32, u64);

impl FromSqlValue for f64 {
    fn from_sql_value(value: SqlValue) -> Result<Self, SqlValueError> {
        match value {
            SqlValue::Null => Err(SqlValueError::UnexpectedNull("f64")),
            other => other
                .as_f64()
                .ok_or(SqlValueError::IncompatibleType { from: other.raw_name(), to: "f64" }),
        }
    }
}

impl FromSqlValue for f32 {
    fn from_sql_value(value: SqlValue) -> Result<Self, SqlValueError> {
        f64::from_sql_value(value).map(|v| v as f32)
    }
}

impl FromSqlValue for Decimal {
    fn from_sql_value(value: SqlValue) -> Result<Self, SqlValueError> {
        match value {
            SqlValue::Null => Err(SqlValueError::UnexpectedNull("Decimal")),
            other => other
                .as_decimal()
                .ok_or(SqlValueError::IncompatibleType { from: other.raw_name(), to: "Decimal" }),
        }
    }
}

impl FromSqlValue for bool {
    fn from_sql_value(value: SqlValue) -> Result<Self, SqlValueError> {
        match value {
            SqlValue::Bool(v) => Ok(v),
            SqlValue::Null => Err(SqlValueError::UnexpectedNull("bool")),
            other => match other.as_i64() {
                Some(0) => Ok(false),
                Some(1) => Ok(true),
                _ => Err(SqlValueError::IncompatibleType { from: other.raw_name(), to: "bool" }),
            },
        }
    }
}

impl FromSqlValue for String {
    fn from_sql_value(value: SqlValue) -> Result<Self, SqlValueError> {
        match value {
            SqlValue::String(v) => Ok(v),
            SqlValue::Null => Err(SqlValueError::UnexpectedNull("String")),
            SqlValue::Uuid(v) => Ok(v.to_string()),
            other => {
                Err(SqlValueError::IncompatibleType { from: other.raw_name(), to: "String" })
            }
        }
    }
}

macro_rules! impl_from_sql_value_exact {
    ($($ty:ty => $variant:ident),+ $(,)?) => {
        $(
            impl FromSqlValue for $ty {
                fn from_sql_value(value: SqlValue) -> Result<Self, SqlValueError> {
                    match value {
                        SqlValue::$variant(v) => Ok(v),
                        SqlValue::Null => Err(SqlValueError::UnexpectedNull(stringify!($ty))),
                        other => Err(SqlValueError::IncompatibleType {
                            from: other.raw_name(),
                            to: stringify!($ty),
                        }),
                    }
                }
            }
        )+
    };
}

impl_from_sql_value_exact!(
    Vec<u8> => Bytes,
    Uuid => Uuid,
    NaiveDate => Date,
    NaiveTime => Time,
    NaiveDateTime => DateTime,
    DateTime<FixedOffset> => DateTimeOffset,
);

impl<T: FromSqlValue> FromSqlValue for Option<T> {
    fn from_sql_value(value: SqlValue) -> Result<Self, SqlValueError> {
        match value {
            SqlValue::Null => Ok(None),
            other => T::from_sql_value(other).map(Some),
        }
    }
}

impl FromSqlValue for SqlValue {
    fn from_sql_value(value: SqlValue) -> Result<Self, SqlValueError> {
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_values_widen_into_record_fields() {
        assert_eq!(i64::from_sql_value(SqlValue::I32(101)).unwrap(), 101);
        assert_eq!(i32::from_sql_value(SqlValue::I64(102)).unwrap(), 102);
        assert_eq!(i32::from_sql_value(SqlValue::Decimal(Decimal::from(7))).unwrap(), 7);
        assert_eq!(u8::from_sql_value(SqlValue::I16(3)).unwrap(), 3);
    }

    #[test]
    fn test_narrowing_out_of_range_is_rejected() {
        let err = i16::from_sql_value(SqlValue::I64(70_000)).unwrap_err();
        assert_eq!(err, SqlValueError::OutOfRange { value: "70000".to_string(), to: "i16" });
    }

    #[test]
    fn test_null_only_fits_options() {
        assert_eq!(Option::<i32>::from_sql_value(SqlValue::Null).unwrap(), None);
        assert_eq!(Option::<i32>::from_sql_value(SqlValue::I32(4)).unwrap(), Some(4));
        assert_eq!(
            i32::from_sql_value(SqlValue::Null).unwrap_err(),
            SqlValueError::UnexpectedNull("i32")
        );
    }

    #[test]
    fn test_incompatible_types() {
        let err = Uuid::from_sql_value(SqlValue::I32(1)).unwrap_err();
        assert_eq!(err, SqlValueError::IncompatibleType { from: "I32", to: "Uuid" });
        assert!(bool::from_sql_value(SqlValue::I32(2)).is_err());
        assert!(bool::from_sql_value(SqlValue::U8(1)).unwrap());
    }

    #[test]
    fn test_decimal_column_data_keeps_scale_and_sign() {
        let value: Decimal = "-1234.5600".parse().unwrap();

        match SqlValue::Decimal(value).to_column_data(NullKind::Decimal) {
            ColumnData::Numeric(Some(numeric)) => {
                assert_eq!(numeric.value(), -12_345_600);
                assert_eq!(numeric.scale(), 4);
            }
            other => panic!("expected numeric column data, got {:?}", other),
        }

        let data = SqlValue::Decimal(value).to_column_data(NullKind::Decimal);
        assert_eq!(SqlValue::from_column_data(&data).unwrap(), SqlValue::Decimal(value));
    }

    #[test]
    fn test_from_option() {
        assert_eq!(SqlValue::from(None::<i32>), SqlValue::Null);
        assert_eq!(SqlValue::from(Some("a")), SqlValue::String("a".to_string()));
    }

    #[test]
    fn test_typed_nulls() {
        assert!(matches!(SqlValue::Null.to_column_data(NullKind::I32), ColumnData::I32(None)));
        assert!(matches!(
            SqlValue::Null.to_column_data(NullKind::Decimal),
            ColumnData::Numeric(None)
        ));
        assert!(matches!(SqlValue::I64(5).to_column_data(NullKind::I32), ColumnData::I64(Some(5))));
    }

    #[test]
    fn test_column_data_round_trip_through_reader() {
        let data = ColumnData::String(Some(Cow::Owned("Ada".to_string())));
        assert_eq!(SqlValue::from_column_data(&data).unwrap(), SqlValue::String("Ada".to_string()));
        assert_eq!(SqlValue::from_column_data(&ColumnData::I32(None)).unwrap(), SqlValue::Null);
    }
}
