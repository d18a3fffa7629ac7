//! DDL for the session scoped tables one commit works through.

use crate::{
    database::mssql::{
        query_builder::{quote_identifier, SOURCE_ALIAS},
        ColumnSchema, SchemaDescriptor, SchemaError,
    },
    operation::columns::{ColumnSet, IdentityColumn},
};

pub const STAGING_TABLE: &str = "#BulkMergeStaging";

pub const OUTPUT_TABLE: &str = "#BulkMergeOutput";

/// Position of the row in the caller's collection, carried through staging into the output.
pub const ROW_ORDINAL_COLUMN: &str = "BulkMergeRowOrdinal";

pub const ACTION_COLUMN: &str = "MergeAction";

/// A data column of the staging table.
#[derive(Debug, Clone, PartialEq)]
pub struct StagingColumn {
    /// Record field the values come from.
    pub source: String,
    /// Column name in both staging and target.
    pub name: String,
    /// Target column metadata.
    pub schema: ColumnSchema,
}

impl StagingColumn {
    /// Whether joins on this column need a NULL-safe comparison.
    pub fn nullable(&self) -> bool {
        self.schema.nullable
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StagingTable {
    pub name: &'static str,
    pub ddl: String,
    pub columns: Vec<StagingColumn>,
}

impl StagingTable {
    pub fn column(&self, name: &str) -> Option<&StagingColumn> {
        self.columns.iter().find(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// `(column, target nullability)` for every data column, in staging order.
    pub fn nullability(&self) -> Vec<(&str, bool)> {
        self.columns.iter().map(|c| (c.name.as_str(), c.nullable())).collect()
    }
}

fn column_definition(column: &ColumnSchema) -> String {
    let collation = match &column.collation {
        Some(collation) if column.is_character() => format!(" COLLATE {}", collation),
        _ => String::new(),
    };

    // Nullable regardless of the target, NOT NULL violations surface from the MERGE itself.
    format!("{} {}{} NULL", quote_identifier(&column.name), column.staging_sql_type(), collation)
}

/// Creates the staging table: every selected column under its destination name, typed like the
/// target, followed by the row ordinal.
pub fn build_create_staging(
    columns: &ColumnSet,
    schema: &SchemaDescriptor,
) -> Result<StagingTable, SchemaError> {
    let staging_columns = columns
        .pairs()
        .into_iter()
        .map(|(source, destination)| {
            let target = schema.require_column(destination)?;
            Ok(StagingColumn {
                source: source.to_string(),
                name: target.name.clone(),
                schema: target.clone(),
            })
        })
        .collect::<Result<Vec<_>, SchemaError>>()?;

    let mut definitions: Vec<String> =
        staging_columns.iter().map(|column| column_definition(&column.schema)).collect();
    definitions.push(format!("{} int NOT NULL", quote_identifier(ROW_ORDINAL_COLUMN)));

    let ddl = format!("CREATE TABLE {} ({});", STAGING_TABLE, definitions.join(", "));

    Ok(StagingTable { name: STAGING_TABLE, ddl, columns: staging_columns })
}

/// Creates the output capture table, `None` unless the identity is read back.
pub fn build_create_output_capture(
    identity: &IdentityColumn,
    columns: &ColumnSet,
    schema: &SchemaDescriptor,
) -> Result<Option<String>, SchemaError> {
    if !identity.direction.is_output() {
        return Ok(None);
    }

    let destination = columns.destination(&identity.name).unwrap_or(&identity.name);
    let column = schema.require_column(destination)?;

    Ok(Some(format!(
        "CREATE TABLE {} ({} int NULL, {} {} NULL, {} nvarchar(10) NOT NULL);",
        OUTPUT_TABLE,
        quote_identifier(ROW_ORDINAL_COLUMN),
        quote_identifier(&column.name),
        column.staging_sql_type(),
        quote_identifier(ACTION_COLUMN)
    )))
}

pub fn build_drop(table: &str) -> String {
    format!("DROP TABLE {};", table)
}

/// `SET IDENTITY_INSERT target ON|OFF;`
pub fn build_identity_insert(schema: &SchemaDescriptor, enabled: bool) -> String {
    format!("SET IDENTITY_INSERT {} {};", schema.full_name(), if enabled { "ON" } else { "OFF" })
}

/// The column list read back from the output table.
pub fn build_select_output(identity_column: &str) -> String {
    format!(
        "SELECT {}, {}, {} FROM {}",
        quote_identifier(ROW_ORDINAL_COLUMN),
        quote_identifier(identity_column),
        quote_identifier(ACTION_COLUMN),
        OUTPUT_TABLE
    )
}

/// `OUTPUT Source.[ordinal], inserted.[id], $action INTO #BulkMergeOutput (...)`
pub fn build_output_clause(identity_column: &str) -> String {
    format!(
        "OUTPUT {}.{}, inserted.{}, $action INTO {} ({}, {}, {})",
        SOURCE_ALIAS,
        quote_identifier(ROW_ORDINAL_COLUMN),
        quote_identifier(identity_column),
        OUTPUT_TABLE,
        quote_identifier(ROW_ORDINAL_COLUMN),
        quote_identifier(identity_column),
        quote_identifier(ACTION_COLUMN)
    )
}
