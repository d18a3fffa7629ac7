use async_trait::async_trait;
use tiberius::{ColumnData, ToSql};

use crate::database::{
    data_table::{BulkCopySettings, DataTable},
    sql_type_wrapper::{NullKind, SqlValue, SqlValueError},
};

/// A named statement parameter, referenced in SQL text as `@name`.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryParam {
    pub name: String,
    pub value: SqlValue,
    /// Declared type of the parameter when `value` is NULL.
    pub null_kind: NullKind,
}

impl QueryParam {
    pub fn new(name: impl Into<String>, value: impl Into<SqlValue>) -> Self {
        Self::typed(name, value, NullKind::String)
    }

    /// A parameter whose NULL is sent as the given type. Needed when the server can not
    /// implicitly convert an `nvarchar` NULL into the column, e.g. for `varbinary`.
    pub fn typed(name: impl Into<String>, value: impl Into<SqlValue>, null_kind: NullKind) -> Self {
        let name = name.into();
        let name = name.trim_start_matches('@').to_string();
        Self { name, value: value.into(), null_kind }
    }

    /// The parameter as it appears in SQL text.
    pub fn placeholder(&self) -> String {
        format!("@{}", self.name)
    }
}

impl ToSql for QueryParam {
    fn to_sql(&self) -> ColumnData<'_> {
        self.value.to_column_data(self.null_kind)
    }
}

/// One result row, values in select-list order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DbRow {
    pub values: Vec<SqlValue>,
}

impl DbRow {
    pub fn new(values: Vec<SqlValue>) -> Self {
        Self { values }
    }

    pub fn get(&self, index: usize) -> &SqlValue {
        self.values.get(index).unwrap_or(&SqlValue::Null)
    }

    pub fn get_string(&self, index: usize) -> Option<String> {
        match self.get(index) {
            SqlValue::String(value) => Some(value.clone()),
            _ => None,
        }
    }

    pub fn get_i64(&self, index: usize) -> Option<i64> {
        self.get(index).as_i64()
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConnectionError {
    #[error("Server error {code}: {message}")]
    Server { code: u32, message: String },

    #[error("The connection is not open")]
    Closed,

    #[error("Driver error: {0}")]
    Driver(String),

    #[error("Could not read a result value: {0}")]
    Value(#[from] SqlValueError),
}

/// Everything a bulk operation needs from the database: statement execution, row queries,
/// bulk transfer and the ambient transaction.
///
/// A commit issues every statement through one `SqlConnection`, strictly in order. Staging tables
/// are session scoped, so two commits must not share a connection at the same time.
#[async_trait]
pub trait SqlConnection: Send + Sync {
    fn is_open(&self) -> bool;

    /// Runs an unparameterised batch directly in the session scope. Temp tables created this way
    /// outlive the batch, unlike ones created by a parameterised `execute`.
    async fn batch_execute(&self, sql: &str) -> Result<(), ConnectionError>;

    /// Executes a parameterised statement batch and returns the total affected row count.
    async fn execute(&self, sql: &str, params: &[QueryParam]) -> Result<u64, ConnectionError>;

    async fn query(&self, sql: &str, params: &[QueryParam]) -> Result<Vec<DbRow>, ConnectionError>;

    /// Copies every row of `data` into `table`. All or nothing.
    async fn bulk_copy(
        &self,
        table: &str,
        data: &DataTable,
        settings: &BulkCopySettings,
    ) -> Result<u64, ConnectionError>;

    async fn begin_transaction(&self) -> Result<(), ConnectionError>;

    async fn commit_transaction(&self) -> Result<(), ConnectionError>;

    async fn rollback_transaction(&self) -> Result<(), ConnectionError>;
}
