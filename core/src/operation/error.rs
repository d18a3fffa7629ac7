use std::time::Duration;

use crate::database::{connection::ConnectionError, mssql::SchemaError};

/// Server errors that mean the identity column is declared wrongly for the operation:
/// explicit identity without `IDENTITY_INSERT` (544, 8101), updating an identity (8102),
/// `IDENTITY_INSERT` already on for another table (8107) or on a table without one (8106).
const IDENTITY_ERROR_CODES: &[u32] = &[544, 8101, 8102, 8106, 8107];

#[derive(thiserror::Error, Debug)]
pub enum BulkOperationError {
    #[error("Invalid bulk operation configuration: {0}")]
    Configuration(String),

    #[error("{0}")]
    Schema(#[from] SchemaError),

    #[error("Could not convert row {row} column '{column}': {reason}")]
    DataConversion { row: usize, column: String, reason: String },

    #[error("Server error {code}: {message}")]
    ServerExecution { code: u32, message: String },

    #[error("Identity column is not configured correctly: {0}")]
    IdentityConfiguration(String),

    #[error("Could not reconcile output rows: {0}")]
    Reconciliation(String),

    #[error("Statement did not complete within {0:?}")]
    Timeout(Duration),

    #[error("The connection is not open")]
    ConnectionClosed,

    #[error("Driver error: {0}")]
    Driver(String),
}

impl From<ConnectionError> for BulkOperationError {
    fn from(error: ConnectionError) -> Self {
        match error {
            ConnectionError::Server { code, message } if IDENTITY_ERROR_CODES.contains(&code) => {
                BulkOperationError::IdentityConfiguration(message)
            }
            ConnectionError::Server { code, message } => {
                BulkOperationError::ServerExecution { code, message }
            }
            ConnectionError::Closed => BulkOperationError::ConnectionClosed,
            ConnectionError::Driver(message) => BulkOperationError::Driver(message),
            ConnectionError::Value(e) => BulkOperationError::Driver(e.to_string()),
        }
    }
}
