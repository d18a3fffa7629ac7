pub mod client;
pub mod query_builder;
pub mod schema;

pub use client::{bind_named_params, connection_string, MssqlClient, MssqlConnectionError};
pub use schema::{probe_schema, ColumnSchema, SchemaDescriptor, SchemaError};
