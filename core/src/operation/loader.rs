//! Turns records into staging rows and decides how they reach the server.

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::{
    database::{
        connection::QueryParam,
        data_table::{DataColumn, DataTable},
        mssql::{
            query_builder::{build_column_list, quote_identifier},
            ColumnSchema,
        },
        sql_type_wrapper::{NullKind, SqlValue, SqlValueError},
    },
    operation::{
        error::BulkOperationError,
        staging::{StagingTable, ROW_ORDINAL_COLUMN},
    },
    record::Record,
};

/// Rows per `INSERT ... VALUES` statement the server accepts.
const MAX_ROWS_PER_INSERT: usize = 1000;

/// The server accepts 2100 parameters per request, a few are kept for the RPC itself.
const MAX_PARAMETERS_PER_INSERT: usize = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStrategy {
    MultiRowInsert,
    BulkCopy,
}

impl LoadStrategy {
    pub fn select(rows: usize, bulk_copy_threshold: usize) -> Self {
        if rows <= bulk_copy_threshold {
            LoadStrategy::MultiRowInsert
        } else {
            LoadStrategy::BulkCopy
        }
    }
}

/// One parameterised multi-row insert into the staging table.
#[derive(Debug, Clone, PartialEq)]
pub struct InsertStatement {
    pub sql: String,
    pub params: Vec<QueryParam>,
    pub rows: usize,
}

fn incompatible(value: &SqlValue, to: &'static str) -> SqlValueError {
    SqlValueError::IncompatibleType { from: value.raw_name(), to }
}

fn integer<T: TryFrom<i64>>(value: &SqlValue, to: &'static str) -> Result<T, SqlValueError> {
    let wide = value.as_i64().ok_or_else(|| incompatible(value, to))?;
    T::try_from(wide).map_err(|_| SqlValueError::OutOfRange { value: wide.to_string(), to })
}

fn check_length(
    length: usize,
    column: &ColumnSchema,
    to: &'static str,
) -> Result<(), SqlValueError> {
    match column.max_length {
        Some(max) if max > 0 && length > max as usize => Err(SqlValueError::OutOfRange {
            value: format!("length {}", length),
            to,
        }),
        _ => Ok(()),
    }
}

/// Length of `text` in the units the server limits the column by: UTF-16 code units for the
/// n-types, bytes for `char`/`varchar` under a UTF-8 collation. Single byte code pages store one
/// byte per character.
fn text_length(text: &str, column: &ColumnSchema) -> usize {
    match column.data_type.as_str() {
        "nchar" | "nvarchar" | "ntext" | "xml" => text.encode_utf16().count(),
        _ if column
            .collation
            .as_deref()
            .is_some_and(|collation| collation.to_ascii_uppercase().ends_with("_UTF8")) =>
        {
            text.len()
        }
        _ => text.chars().count(),
    }
}

fn decimal(value: &SqlValue, column: &ColumnSchema) -> Result<SqlValue, SqlValueError> {
    let mut decimal = value.as_decimal().ok_or_else(|| incompatible(value, "decimal"))?;
    let scale = column.staging_scale().unwrap_or(0);
    let precision = column.staging_precision().unwrap_or(18);

    decimal = decimal.round_dp(scale);
    decimal.rescale(scale);

    let integer_digits = precision.saturating_sub(scale);
    if integer_digits < 28 {
        let limit = Decimal::from_i128_with_scale(10_i128.pow(integer_digits), 0);
        if decimal.trunc().abs() >= limit {
            return Err(SqlValueError::OutOfRange { value: decimal.to_string(), to: "decimal" });
        }
    }

    Ok(SqlValue::Decimal(decimal))
}

fn text(value: &SqlValue) -> Option<String> {
    match value {
        SqlValue::String(v) => Some(v.clone()),
        SqlValue::Bool(v) => Some(if *v { "1" } else { "0" }.to_string()),
        SqlValue::U8(v) => Some(v.to_string()),
        SqlValue::I16(v) => Some(v.to_string()),
        SqlValue::I32(v) => Some(v.to_string()),
        SqlValue::I64(v) => Some(v.to_string()),
        SqlValue::F32(v) => Some(v.to_string()),
        SqlValue::F64(v) => Some(v.to_string()),
        SqlValue::Decimal(v) => Some(v.to_string()),
        SqlValue::Uuid(v) => Some(v.to_string()),
        SqlValue::Date(v) => Some(v.format("%Y-%m-%d").to_string()),
        SqlValue::Time(v) => Some(v.format("%H:%M:%S%.f").to_string()),
        SqlValue::DateTime(v) => Some(v.format("%Y-%m-%dT%H:%M:%S%.f").to_string()),
        SqlValue::DateTimeOffset(v) => Some(v.to_rfc3339()),
        SqlValue::Null | SqlValue::Bytes(_) => None,
    }
}

fn parse_datetime(value: &str) -> Option<NaiveDateTime> {
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(value.trim(), format).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d")
                .ok()
                .map(|date| date.and_time(NaiveTime::MIN))
        })
}

/// Converts a record value into the exact representation the staging column is declared with.
///
/// The bulk load encoder does not convert between types, so an `i32` field bound for a `bigint`
/// column has to be widened here. Strings are checked against the declared length.
pub fn coerce(value: SqlValue, column: &ColumnSchema) -> Result<SqlValue, SqlValueError> {
    if value.is_null() {
        return Ok(SqlValue::Null);
    }

    let coerced = match column.data_type.as_str() {
        "bit" => match &value {
            SqlValue::Bool(v) => SqlValue::Bool(*v),
            SqlValue::String(v) => match v.trim().to_ascii_lowercase().as_str() {
                "true" | "1" => SqlValue::Bool(true),
                "false" | "0" => SqlValue::Bool(false),
                _ => return Err(incompatible(&value, "bit")),
            },
            other => match other.as_i64() {
                Some(0) => SqlValue::Bool(false),
                Some(1) => SqlValue::Bool(true),
                _ => return Err(incompatible(&value, "bit")),
            },
        },
        "tinyint" => SqlValue::U8(integer(&value, "tinyint")?),
        "smallint" => SqlValue::I16(integer(&value, "smallint")?),
        "int" => SqlValue::I32(integer(&value, "int")?),
        "bigint" => SqlValue::I64(integer(&value, "bigint")?),
        "real" => SqlValue::F32(value.as_f64().ok_or_else(|| incompatible(&value, "real"))? as f32),
        "float" => SqlValue::F64(value.as_f64().ok_or_else(|| incompatible(&value, "float"))?),
        "decimal" | "numeric" | "money" | "smallmoney" => decimal(&value, column)?,
        "char" | "varchar" | "nchar" | "nvarchar" | "text" | "ntext" | "xml" => {
            let text = text(&value).ok_or_else(|| incompatible(&value, "string"))?;
            check_length(text_length(&text, column), column, "string")?;
            SqlValue::String(text)
        }
        "binary" | "varbinary" | "image" | "timestamp" | "rowversion" => match value {
            SqlValue::Bytes(bytes) => {
                check_length(bytes.len(), column, "binary")?;
                SqlValue::Bytes(bytes)
            }
            other => return Err(incompatible(&other, "binary")),
        },
        "uniqueidentifier" => match &value {
            SqlValue::Uuid(v) => SqlValue::Uuid(*v),
            SqlValue::String(v) => SqlValue::Uuid(
                Uuid::parse_str(v.trim()).map_err(|_| incompatible(&value, "uniqueidentifier"))?,
            ),
            _ => return Err(incompatible(&value, "uniqueidentifier")),
        },
        "date" => match &value {
            SqlValue::Date(v) => SqlValue::Date(*v),
            SqlValue::DateTime(v) => SqlValue::Date(v.date()),
            SqlValue::DateTimeOffset(v) => SqlValue::Date(v.naive_local().date()),
            SqlValue::String(v) => SqlValue::Date(
                NaiveDate::parse_from_str(v.trim(), "%Y-%m-%d")
                    .map_err(|_| incompatible(&value, "date"))?,
            ),
            _ => return Err(incompatible(&value, "date")),
        },
        "time" => match &value {
            SqlValue::Time(v) => SqlValue::Time(*v),
            SqlValue::DateTime(v) => SqlValue::Time(v.time()),
            SqlValue::String(v) => SqlValue::Time(
                NaiveTime::parse_from_str(v.trim(), "%H:%M:%S%.f")
                    .map_err(|_| incompatible(&value, "time"))?,
            ),
            _ => return Err(incompatible(&value, "time")),
        },
        "datetime" | "datetime2" | "smalldatetime" => match &value {
            SqlValue::DateTime(v) => SqlValue::DateTime(*v),
            SqlValue::Date(v) => SqlValue::DateTime(v.and_time(NaiveTime::MIN)),
            SqlValue::DateTimeOffset(v) => SqlValue::DateTime(v.naive_local()),
            SqlValue::String(v) => SqlValue::DateTime(
                parse_datetime(v).ok_or_else(|| incompatible(&value, "datetime"))?,
            ),
            _ => return Err(incompatible(&value, "datetime")),
        },
        "datetimeoffset" => match &value {
            SqlValue::DateTimeOffset(v) => SqlValue::DateTimeOffset(*v),
            SqlValue::DateTime(v) => SqlValue::DateTimeOffset(
                DateTime::<Utc>::from_naive_utc_and_offset(*v, Utc).fixed_offset(),
            ),
            SqlValue::String(v) => SqlValue::DateTimeOffset(
                DateTime::<FixedOffset>::parse_from_rfc3339(v.trim())
                    .map_err(|_| incompatible(&value, "datetimeoffset"))?,
            ),
            _ => return Err(incompatible(&value, "datetimeoffset")),
        },
        // Types without a dedicated representation are passed through for the server to convert.
        _ => value,
    };

    Ok(coerced)
}

impl DataTable {
    /// Extracts and coerces every record into a staging row, the row ordinal last.
    ///
    /// Fails on the first value that can not be converted, before anything is sent.
    pub fn from_records<R: Record>(
        records: &[R],
        staging: &StagingTable,
    ) -> Result<DataTable, BulkOperationError> {
        let mut columns: Vec<DataColumn> = staging
            .columns
            .iter()
            .map(|column| DataColumn {
                name: column.name.clone(),
                null_kind: column.schema.null_kind(),
            })
            .collect();
        columns.push(DataColumn { name: ROW_ORDINAL_COLUMN.to_string(), null_kind: NullKind::I32 });

        let mut table = DataTable::new(columns);

        for (row, record) in records.iter().enumerate() {
            let mut values = Vec::with_capacity(staging.columns.len() + 1);

            for column in &staging.columns {
                let conversion_error = |reason: String| BulkOperationError::DataConversion {
                    row,
                    column: column.name.clone(),
                    reason,
                };

                let value = record.field(&column.source).ok_or_else(|| {
                    conversion_error(SqlValueError::UnknownField(column.source.clone()).to_string())
                })?;
                let value =
                    coerce(value, &column.schema).map_err(|e| conversion_error(e.to_string()))?;

                values.push(value);
            }

            let ordinal = i32::try_from(row).map_err(|_| BulkOperationError::DataConversion {
                row,
                column: ROW_ORDINAL_COLUMN.to_string(),
                reason: "collection is too large".to_string(),
            })?;
            values.push(SqlValue::I32(ordinal));

            table.push_row(values);
        }

        Ok(table)
    }
}

/// Splits the rows into multi-row inserts that stay within the server's row and parameter
/// limits. Parameters are `@r{row}c{column}`, numbered per statement.
pub fn build_insert_statements(table_name: &str, data: &DataTable) -> Vec<InsertStatement> {
    if data.is_empty() || data.columns.is_empty() {
        return Vec::new();
    }

    let column_count = data.columns.len();
    let rows_per_statement =
        (MAX_PARAMETERS_PER_INSERT / column_count).clamp(1, MAX_ROWS_PER_INSERT);
    let column_list = build_column_list(&data.column_names());

    data.rows
        .chunks(rows_per_statement)
        .map(|chunk| {
            let mut params = Vec::with_capacity(chunk.len() * column_count);
            let tuples: Vec<String> = chunk
                .iter()
                .enumerate()
                .map(|(row, values)| {
                    let placeholders: Vec<String> = values
                        .iter()
                        .zip(&data.columns)
                        .enumerate()
                        .map(|(col, (value, column))| {
                            let param = QueryParam::typed(
                                format!("r{}c{}", row, col),
                                value.clone(),
                                column.null_kind,
                            );
                            let placeholder = param.placeholder();
                            params.push(param);
                            placeholder
                        })
                        .collect();
                    format!("({})", placeholders.join(", "))
                })
                .collect();

            InsertStatement {
                sql: format!(
                    "INSERT INTO {} ({}) VALUES {};",
                    table_name,
                    column_list,
                    tuples.join(", ")
                ),
                params,
                rows: chunk.len(),
            }
        })
        .collect()
}

/// Columns a row of `data` carries, quoted. Only used for logging.
pub fn describe_columns(data: &DataTable) -> String {
    data.columns.iter().map(|c| quote_identifier(&c.name)).collect::<Vec<_>>().join(", ")
}
