use std::sync::{
    atomic::{AtomicBool, Ordering},
    Mutex,
};

use async_trait::async_trait;

use crate::database::{
    connection::{ConnectionError, DbRow, QueryParam, SqlConnection},
    data_table::{BulkCopySettings, DataTable},
    sql_type_wrapper::SqlValue,
};

#[derive(Debug, Clone, PartialEq)]
pub enum SpyCall {
    Batch(String),
    Execute { sql: String, params: Vec<QueryParam> },
    Query { sql: String, params: Vec<QueryParam> },
    BulkCopy { table: String, rows: usize },
    Begin,
    Commit,
    Rollback,
}

/// Records every call and answers from canned rows.
pub struct SpyConnection {
    open: AtomicBool,
    pub schema_rows: Vec<DbRow>,
    pub output_rows: Vec<DbRow>,
    pub merge_affected: u64,
    /// Statements containing the text fail with the server error code.
    pub fail_when: Option<(&'static str, u32)>,
    /// COMMIT fails with the server error code.
    pub fail_commit: Option<u32>,
    calls: Mutex<Vec<SpyCall>>,
}

impl SpyConnection {
    pub fn new(schema_rows: Vec<DbRow>) -> Self {
        Self {
            open: AtomicBool::new(true),
            schema_rows,
            output_rows: Vec::new(),
            merge_affected: 0,
            fail_when: None,
            fail_commit: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<SpyCall> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: SpyCall) {
        self.calls.lock().unwrap().push(call);
    }

    fn check(&self, sql: &str) -> Result<(), ConnectionError> {
        match self.fail_when {
            Some((pattern, code)) if sql.contains(pattern) => {
                Err(ConnectionError::Server { code, message: format!("'{}' failed", pattern) })
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl SqlConnection for SpyConnection {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn batch_execute(&self, sql: &str) -> Result<(), ConnectionError> {
        self.record(SpyCall::Batch(sql.to_string()));
        self.check(sql)
    }

    async fn execute(&self, sql: &str, params: &[QueryParam]) -> Result<u64, ConnectionError> {
        self.record(SpyCall::Execute { sql: sql.to_string(), params: params.to_vec() });
        self.check(sql)?;
        Ok(0)
    }

    async fn query(&self, sql: &str, params: &[QueryParam]) -> Result<Vec<DbRow>, ConnectionError> {
        self.record(SpyCall::Query { sql: sql.to_string(), params: params.to_vec() });
        self.check(sql)?;

        if sql.contains("MERGE") {
            Ok(vec![DbRow::new(vec![SqlValue::I32(self.merge_affected as i32)])])
        } else if sql.contains("INFORMATION_SCHEMA") {
            Ok(self.schema_rows.clone())
        } else {
            Ok(self.output_rows.clone())
        }
    }

    async fn bulk_copy(
        &self,
        table: &str,
        data: &DataTable,
        _settings: &BulkCopySettings,
    ) -> Result<u64, ConnectionError> {
        self.record(SpyCall::BulkCopy { table: table.to_string(), rows: data.len() });
        Ok(data.len() as u64)
    }

    async fn begin_transaction(&self) -> Result<(), ConnectionError> {
        self.record(SpyCall::Begin);
        Ok(())
    }

    async fn commit_transaction(&self) -> Result<(), ConnectionError> {
        self.record(SpyCall::Commit);
        match self.fail_commit {
            Some(code) => {
                Err(ConnectionError::Server { code, message: "COMMIT failed".to_string() })
            }
            None => Ok(()),
        }
    }

    async fn rollback_transaction(&self) -> Result<(), ConnectionError> {
        self.record(SpyCall::Rollback);
        Ok(())
    }
}

fn schema_row(
    name: &str,
    data_type: &str,
    max_length: Option<i32>,
    nullable: bool,
    ordinal: i32,
    identity: bool,
) -> DbRow {
    let collation = max_length.map(|_| SqlValue::from("SQL_Latin1_General_CP1_CI_AS"));

    DbRow::new(vec![
        SqlValue::from(name),
        SqlValue::from(data_type),
        max_length.map(SqlValue::I32).unwrap_or(SqlValue::Null),
        SqlValue::Null,
        SqlValue::Null,
        SqlValue::Null,
        SqlValue::from(if nullable { "YES" } else { "NO" }),
        SqlValue::I32(ordinal),
        collation.unwrap_or(SqlValue::Null),
        SqlValue::I32(identity as i32),
    ])
}

/// `dbo.Person (Id int identity, Name nvarchar(50), Age int NULL)`
pub fn person_schema_rows() -> Vec<DbRow> {
    vec![
        schema_row("Id", "int", None, false, 1, true),
        schema_row("Name", "nvarchar", Some(50), false, 2, false),
        schema_row("Age", "int", None, true, 3, false),
    ]
}

/// One captured `#BulkMergeOutput` row.
pub fn output_row(ordinal: Option<i32>, identity: i32, action: &str) -> DbRow {
    DbRow::new(vec![
        ordinal.map(SqlValue::I32).unwrap_or(SqlValue::Null),
        SqlValue::I32(identity),
        SqlValue::from(action),
    ])
}
