use serde::{Deserialize, Serialize};

use crate::database::sql_type_wrapper::{NullKind, SqlValue};

/// A column of an in-memory table. `null_kind` decides the typed NULL sent for missing values.
#[derive(Debug, Clone, PartialEq)]
pub struct DataColumn {
    pub name: String,
    pub null_kind: NullKind,
}

/// Rows ready to be loaded into the staging table, values already coerced to column types.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DataTable {
    pub columns: Vec<DataColumn>,
    pub rows: Vec<Vec<SqlValue>>,
}

impl DataTable {
    pub fn new(columns: Vec<DataColumn>) -> Self {
        Self { columns, rows: Vec::new() }
    }

    pub fn push_row(&mut self, row: Vec<SqlValue>) {
        debug_assert_eq!(row.len(), self.columns.len());
        self.rows.push(row);
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

fn default_bulk_copy_timeout_secs() -> u64 {
    600
}

/// Options handed to the bulk transfer capability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BulkCopySettings {
    /// Preserve explicitly supplied identity values. Also brackets the MERGE with
    /// `SET IDENTITY_INSERT` when the identity column is an input.
    pub keep_identity: bool,

    pub check_constraints: bool,

    pub table_lock: bool,

    /// Rows per internal batch, `0` sends everything in one batch.
    pub batch_size: usize,

    #[serde(default = "default_bulk_copy_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for BulkCopySettings {
    fn default() -> Self {
        Self {
            keep_identity: false,
            check_constraints: false,
            table_lock: false,
            batch_size: 0,
            timeout_secs: default_bulk_copy_timeout_secs(),
        }
    }
}
