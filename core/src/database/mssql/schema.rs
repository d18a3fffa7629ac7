//! Live schema probe for the merge target.
//!
//! Staging column types, collations and the NULL-safe join all derive from what the server
//! reports here, so the probe runs once per commit and is never cached.

use tracing::debug;

use crate::database::{
    connection::{ConnectionError, DbRow, QueryParam, SqlConnection},
    mssql::query_builder::format_table_name,
    sql_type_wrapper::{NullKind, SqlValue},
};

#[derive(thiserror::Error, Debug)]
pub enum SchemaError {
    #[error("Table {schema}.{table} does not exist or its metadata is not visible to this login")]
    TableNotFound { schema: String, table: String },

    #[error("Column '{column}' does not exist on table {table}")]
    ColumnNotFound { table: String, column: String },

    #[error("Failed to query table metadata: {0}")]
    MetadataQuery(#[from] ConnectionError),
}

/// Information about a column in the database.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnSchema {
    pub name: String,
    /// Lower cased base type name, e.g. `nvarchar`.
    pub data_type: String,
    /// Character / byte length, `-1` for `max`.
    pub max_length: Option<i64>,
    pub precision: Option<i64>,
    pub scale: Option<i64>,
    pub datetime_precision: Option<i64>,
    pub nullable: bool,
    pub ordinal: i64,
    pub collation: Option<String>,
    pub is_identity: bool,
}

impl ColumnSchema {
    /// Creates a nullable column of a bare type, mostly useful for tests and hand built schemas.
    pub fn new(name: &str, data_type: &str) -> Self {
        Self {
            name: name.to_string(),
            data_type: data_type.to_ascii_lowercase(),
            max_length: None,
            precision: None,
            scale: None,
            datetime_precision: None,
            nullable: true,
            ordinal: 0,
            collation: None,
            is_identity: false,
        }
    }

    pub fn with_length(mut self, max_length: i64) -> Self {
        self.max_length = Some(max_length);
        self
    }

    pub fn with_precision(mut self, precision: i64, scale: i64) -> Self {
        self.precision = Some(precision);
        self.scale = Some(scale);
        self
    }

    pub fn with_collation(mut self, collation: &str) -> Self {
        self.collation = Some(collation.to_string());
        self
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn identity(mut self) -> Self {
        self.is_identity = true;
        self.nullable = false;
        self
    }

    pub fn is_character(&self) -> bool {
        matches!(
            self.data_type.as_str(),
            "char" | "varchar" | "nchar" | "nvarchar" | "text" | "ntext"
        )
    }

    fn length_suffix(&self) -> String {
        match self.max_length {
            Some(-1) => "(max)".to_string(),
            Some(length) => format!("({})", length),
            None => String::new(),
        }
    }

    /// The full type as declared on the target, e.g. `nvarchar(50)` or `decimal(18,2)`.
    pub fn sql_type(&self) -> String {
        match self.data_type.as_str() {
            "char" | "varchar" | "nchar" | "nvarchar" | "binary" | "varbinary" => {
                format!("{}{}", self.data_type, self.length_suffix())
            }
            "decimal" | "numeric" => format!(
                "{}({},{})",
                self.data_type,
                self.precision.unwrap_or(18),
                self.scale.unwrap_or(0)
            ),
            "datetime2" | "time" | "datetimeoffset" => match self.datetime_precision {
                Some(precision) => format!("{}({})", self.data_type, precision),
                None => self.data_type.clone(),
            },
            "float" => match self.precision {
                Some(precision) => format!("float({})", precision),
                None => "float".to_string(),
            },
            _ => self.data_type.clone(),
        }
    }

    /// Type used for the staging copy of this column.
    ///
    /// Legacy types the bulk load protocol can not stream are replaced by their lossless modern
    /// equivalents; the MERGE converts them back implicitly on write.
    pub fn staging_sql_type(&self) -> String {
        match self.data_type.as_str() {
            "datetime" => "datetime2(3)".to_string(),
            "smalldatetime" => "datetime2(0)".to_string(),
            "money" => "decimal(19,4)".to_string(),
            "smallmoney" => "decimal(10,4)".to_string(),
            "text" => "varchar(max)".to_string(),
            "ntext" | "xml" => "nvarchar(max)".to_string(),
            "image" => "varbinary(max)".to_string(),
            "timestamp" | "rowversion" => "binary(8)".to_string(),
            _ => self.sql_type(),
        }
    }

    /// Decimal scale the staging column stores, after legacy type replacement.
    pub fn staging_scale(&self) -> Option<u32> {
        match self.data_type.as_str() {
            "money" | "smallmoney" => Some(4),
            "decimal" | "numeric" => Some(self.scale.unwrap_or(0) as u32),
            _ => None,
        }
    }

    pub fn staging_precision(&self) -> Option<u32> {
        match self.data_type.as_str() {
            "money" => Some(19),
            "smallmoney" => Some(10),
            "decimal" | "numeric" => Some(self.precision.unwrap_or(18) as u32),
            _ => None,
        }
    }

    pub fn null_kind(&self) -> NullKind {
        match self.data_type.as_str() {
            "bit" => NullKind::Bool,
            "tinyint" => NullKind::U8,
            "smallint" => NullKind::I16,
            "int" => NullKind::I32,
            "bigint" => NullKind::I64,
            "real" => NullKind::F32,
            "float" => NullKind::F64,
            "decimal" | "numeric" | "money" | "smallmoney" => NullKind::Decimal,
            "binary" | "varbinary" | "image" | "timestamp" | "rowversion" => NullKind::Bytes,
            "uniqueidentifier" => NullKind::Uuid,
            "date" => NullKind::Date,
            "time" => NullKind::Time,
            "datetime" | "datetime2" | "smalldatetime" => NullKind::DateTime,
            "datetimeoffset" => NullKind::DateTimeOffset,
            _ => NullKind::String,
        }
    }
}

/// Ordered column metadata of one table, fixed for the duration of a commit.
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaDescriptor {
    pub schema: String,
    pub table: String,
    pub columns: Vec<ColumnSchema>,
}

impl SchemaDescriptor {
    pub fn full_name(&self) -> String {
        format_table_name(&self.schema, &self.table)
    }

    /// Column lookup, case insensitive like the server's default collation.
    pub fn column(&self, name: &str) -> Option<&ColumnSchema> {
        self.columns.iter().find(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn require_column(&self, name: &str) -> Result<&ColumnSchema, SchemaError> {
        self.column(name).ok_or_else(|| SchemaError::ColumnNotFound {
            table: self.full_name(),
            column: name.to_string(),
        })
    }

    pub fn identity_column(&self) -> Option<&ColumnSchema> {
        self.columns.iter().find(|c| c.is_identity)
    }
}

const COLUMNS_QUERY: &str = r#"
    SELECT
        c.COLUMN_NAME,
        c.DATA_TYPE,
        c.CHARACTER_MAXIMUM_LENGTH,
        c.NUMERIC_PRECISION,
        c.NUMERIC_SCALE,
        c.DATETIME_PRECISION,
        c.IS_NULLABLE,
        c.ORDINAL_POSITION,
        c.COLLATION_NAME,
        COLUMNPROPERTY(
            OBJECT_ID(QUOTENAME(c.TABLE_SCHEMA) + '.' + QUOTENAME(c.TABLE_NAME)),
            c.COLUMN_NAME,
            'IsIdentity'
        ) AS IS_IDENTITY
    FROM INFORMATION_SCHEMA.COLUMNS c
    WHERE c.TABLE_SCHEMA = @SchemaName AND c.TABLE_NAME = @TableName
    ORDER BY c.ORDINAL_POSITION
"#;

fn column_from_row(row: &DbRow) -> ColumnSchema {
    ColumnSchema {
        name: row.get_string(0).unwrap_or_default(),
        data_type: row.get_string(1).unwrap_or_default().to_ascii_lowercase(),
        max_length: row.get_i64(2),
        precision: row.get_i64(3),
        scale: row.get_i64(4),
        datetime_precision: row.get_i64(5),
        nullable: row.get_string(6).map(|v| v.eq_ignore_ascii_case("YES")).unwrap_or(true),
        ordinal: row.get_i64(7).unwrap_or_default(),
        collation: row.get_string(8),
        is_identity: row.get_i64(9) == Some(1),
    }
}

/// Queries the existing columns for a table.
pub async fn probe_schema(
    connection: &dyn SqlConnection,
    schema_name: &str,
    table_name: &str,
) -> Result<SchemaDescriptor, SchemaError> {
    let params = [
        QueryParam::new("SchemaName", SqlValue::from(schema_name)),
        QueryParam::new("TableName", SqlValue::from(table_name)),
    ];

    let rows = connection.query(COLUMNS_QUERY, &params).await?;

    if rows.is_empty() {
        return Err(SchemaError::TableNotFound {
            schema: schema_name.to_string(),
            table: table_name.to_string(),
        });
    }

    let columns: Vec<ColumnSchema> = rows.iter().map(column_from_row).collect();

    debug!("Probed {} columns for {}.{}", columns.len(), schema_name, table_name);

    Ok(SchemaDescriptor {
        schema: schema_name.to_string(),
        table: table_name.to_string(),
        columns,
    })
}
