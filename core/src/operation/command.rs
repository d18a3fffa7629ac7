//! Synthesis of the MERGE batch.

use tracing::debug;

use crate::{
    database::{
        connection::QueryParam,
        mssql::{
            query_builder::{
                build_column_list, build_match_condition, build_prefixed_column_list,
                build_set_clause, is_valid_collation_name, normalize_table_hint, SOURCE_ALIAS,
            },
            SchemaDescriptor,
        },
    },
    operation::{
        config::{MergeConfig, OperationKind},
        error::BulkOperationError,
        predicate::conjunction,
        staging::{
            build_drop, build_identity_insert, build_output_clause, StagingColumn, StagingTable,
        },
    },
};

/// Holds the MERGE's own `@@ROWCOUNT`. The batch selects it last, trigger DML and
/// `SET NOCOUNT ON` leave it untouched.
pub const AFFECTED_VARIABLE: &str = "@BulkMergeAffected";

/// The MERGE statement batch of one commit.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeCommand {
    pub sql: String,
    pub params: Vec<QueryParam>,
    /// The batch brackets the MERGE with `SET IDENTITY_INSERT`.
    pub identity_insert: bool,
    /// Identity column captured into the output table.
    pub output_identity: Option<String>,
}

fn is_row_version(column: &StagingColumn) -> bool {
    matches!(column.schema.data_type.as_str(), "timestamp" | "rowversion")
}

fn configuration(message: String) -> BulkOperationError {
    BulkOperationError::Configuration(message)
}

fn destination<'a>(config: &'a MergeConfig, name: &str) -> Result<&'a str, BulkOperationError> {
    config.columns.destination(name).ok_or_else(|| {
        configuration(format!("Column '{}' is not part of the operation's columns", name))
    })
}

fn build_join(config: &MergeConfig, staging: &StagingTable) -> Result<String, BulkOperationError> {
    if config.kind == OperationKind::Insert {
        return Ok("1 = 0".to_string());
    }

    let conditions = config
        .match_key
        .iter()
        .map(|match_column| {
            let name = destination(config, &match_column.name)?;
            let column = staging.column(name).ok_or_else(|| {
                configuration(format!("Match column '{}' is not staged", match_column.name))
            })?;

            if let Some(collation) = &match_column.collation {
                if !is_valid_collation_name(collation) {
                    return Err(configuration(format!("'{}' is not a valid collation", collation)));
                }
            }

            Ok(build_match_condition(
                &column.name,
                column.nullable(),
                match_column.collation.as_deref(),
            ))
        })
        .collect::<Result<Vec<_>, BulkOperationError>>()?;

    Ok(conditions.join(" AND "))
}

/// Builds the MERGE batch for a validated configuration, the staging table it reads and the
/// probed target schema.
///
/// Nothing is sent here; every configuration problem surfaces before any SQL exists.
pub fn build_merge_command(
    config: &MergeConfig,
    schema: &SchemaDescriptor,
    staging: &StagingTable,
) -> Result<MergeCommand, BulkOperationError> {
    config.validate()?;

    let hint = normalize_table_hint(&config.settings.table_hint).ok_or_else(|| {
        configuration(format!("'{}' is not a supported table hint", config.settings.table_hint))
    })?;
    let target = schema.full_name();

    let identity = match &config.identity {
        Some(identity) => {
            let name = destination(config, &identity.name)?;
            let column = staging.column(name).ok_or_else(|| {
                configuration(format!("Identity column '{}' is not staged", identity.name))
            })?;
            Some((identity.direction, column))
        }
        None => None,
    };

    let identity_input = matches!(identity, Some((direction, _)) if direction.is_input());
    let identity_insert = identity_input && config.settings.bulk_copy.keep_identity;

    if let Some((_, column)) = identity {
        if identity_insert && !column.schema.is_identity {
            return Err(BulkOperationError::IdentityConfiguration(format!(
                "Column '{}' is not an identity column of {}",
                column.name, target
            )));
        }
    }

    let is_identity = |column: &StagingColumn| {
        column.schema.is_identity
            || matches!(identity, Some((_, identity)) if identity.name == column.name)
    };

    let insert_columns: Vec<&str> = staging
        .columns
        .iter()
        .filter(|column| !is_row_version(column))
        .filter(|column| identity_input || !is_identity(column))
        .map(|column| column.name.as_str())
        .collect();

    let match_columns = config
        .match_key
        .iter()
        .map(|m| destination(config, &m.name))
        .collect::<Result<Vec<_>, _>>()?;
    let excluded_columns = config
        .excluded
        .iter()
        .map(|name| destination(config, name))
        .collect::<Result<Vec<_>, _>>()?;

    let assignments: Vec<String> = staging
        .columns
        .iter()
        .filter(|column| !is_row_version(column) && !is_identity(column))
        .filter(|column| !excluded_columns.iter().any(|c| c.eq_ignore_ascii_case(&column.name)))
        .filter(|column| !match_columns.iter().any(|c| c.eq_ignore_ascii_case(&column.name)))
        .map(|column| build_set_clause(&column.name))
        .collect();

    let updates = matches!(config.kind, OperationKind::Update | OperationKind::InsertOrUpdate) &&
        !config.exclude_all &&
        !assignments.is_empty();

    if config.kind == OperationKind::Update && !updates {
        return Err(configuration(
            "Every column is excluded from the update, there is nothing to update".to_string(),
        ));
    }

    let mut params = Vec::new();
    let mut sql = format!("DECLARE {} int;\n", AFFECTED_VARIABLE);

    if identity_insert {
        sql.push_str(&build_identity_insert(schema, true));
        sql.push('\n');
    }

    sql.push_str(&format!("MERGE INTO {} WITH ({}) AS Target\n", target, hint));
    sql.push_str(&format!("USING {} AS {}\n", staging.name, SOURCE_ALIAS));
    sql.push_str(&format!("ON {}\n", build_join(config, staging)?));

    if updates {
        sql.push_str("WHEN MATCHED");
        if let Some((conditions, condition_params)) = conjunction(&config.update_conditions) {
            sql.push_str(&format!(" AND {}", conditions));
            params.extend(condition_params);
        }
        sql.push_str(&format!(" THEN UPDATE SET {}\n", assignments.join(", ")));
    }

    if config.kind == OperationKind::Delete {
        sql.push_str("WHEN MATCHED");
        if let Some((conditions, condition_params)) = conjunction(&config.delete_conditions) {
            sql.push_str(&format!(" AND {}", conditions));
            params.extend(condition_params);
        }
        sql.push_str(" THEN DELETE\n");
    }

    if matches!(config.kind, OperationKind::Insert | OperationKind::InsertOrUpdate) {
        if insert_columns.is_empty() {
            sql.push_str("WHEN NOT MATCHED BY TARGET THEN INSERT DEFAULT VALUES\n");
        } else {
            sql.push_str(&format!(
                "WHEN NOT MATCHED BY TARGET THEN INSERT ({}) VALUES ({})\n",
                build_column_list(&insert_columns),
                build_prefixed_column_list(SOURCE_ALIAS, &insert_columns)
            ));
        }
    }

    if config.kind == OperationKind::InsertOrUpdate && config.delete_when_not_matched {
        sql.push_str("WHEN NOT MATCHED BY SOURCE");
        if let Some((conditions, condition_params)) = conjunction(&config.delete_conditions) {
            sql.push_str(&format!(" AND {}", conditions));
            params.extend(condition_params);
        }
        sql.push_str(" THEN DELETE\n");
    }

    let output_identity = match identity {
        Some((direction, column))
            if direction.is_output() && config.kind != OperationKind::Delete =>
        {
            sql.push_str(&build_output_clause(&column.name));
            sql.push('\n');
            Some(column.name.clone())
        }
        _ => None,
    };

    // MERGE must be terminated
    sql.push_str(";\n");
    sql.push_str(&format!("SET {} = @@ROWCOUNT;\n", AFFECTED_VARIABLE));

    if identity_insert {
        sql.push_str(&build_identity_insert(schema, false));
        sql.push('\n');
    }

    sql.push_str(&build_drop(staging.name));
    sql.push_str(&format!("\nSELECT {} AS [AffectedRows];", AFFECTED_VARIABLE));

    debug!("{} merge statement for {}:\n{}", config.kind, target, sql);

    Ok(MergeCommand { sql, params, identity_insert, output_identity })
}
