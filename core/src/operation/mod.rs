mod builder;
pub mod columns;
pub mod command;
pub mod config;
mod error;
pub mod loader;
mod pipeline;
pub mod predicate;
pub mod reconcile;
mod settings;
pub mod staging;

pub use builder::{
    BulkOperation, Delete, DeletesFromTarget, Insert, InsertOrUpdate, MatchesTarget,
    MergeOperation, OperationStage, TableStage, Update, UpdatesTarget, WritesIdentity,
};
pub use columns::ColumnDirection;
pub use config::OperationKind;
pub use error::BulkOperationError;
pub use predicate::{source, target, ComparisonOperator, Predicate};
pub use settings::{MergeSettings, SettingsError};
