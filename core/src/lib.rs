//! Staged bulk insert, update and delete for SQL Server.
//!
//! Records are loaded into a session scoped staging table and applied to the target with a
//! single `MERGE`, inside one transaction. Generated identities can be read back onto the
//! records.

mod database;
pub use database::{
    connection::{ConnectionError, DbRow, QueryParam, SqlConnection},
    data_table::{BulkCopySettings, DataColumn, DataTable},
    mssql::{
        bind_named_params, connection_string, probe_schema, ColumnSchema, MssqlClient,
        MssqlConnectionError, SchemaDescriptor, SchemaError,
    },
    sql_type_wrapper::{FromSqlValue, NullKind, SqlValue, SqlValueError},
};

mod logger;
pub use logger::{setup_debug_logger, setup_info_logger, setup_logger};

pub mod operation;
pub use operation::{
    source, target, BulkOperation, BulkOperationError, ColumnDirection, ComparisonOperator,
    MergeOperation, MergeSettings, OperationKind, Predicate, SettingsError, TableStage,
};

mod record;
pub use record::Record;

// export 3rd party dependencies
pub use async_trait::async_trait;
pub use tiberius::Config as MssqlConfig;
pub use tracing::{error as bulkmerge_error, info as bulkmerge_info};
