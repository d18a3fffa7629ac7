//! The commit sequence shared by every operation kind.

use std::{future::Future, time::Duration};

use tokio::time::timeout;
use tracing::{debug, error, info};

use crate::{
    database::{
        connection::SqlConnection,
        data_table::DataTable,
        mssql::{probe_schema, SchemaDescriptor},
    },
    operation::{
        command::{build_merge_command, MergeCommand},
        config::MergeConfig,
        error::BulkOperationError,
        loader::{build_insert_statements, describe_columns, LoadStrategy},
        reconcile::{reconcile, IdentityWriteBack},
        staging::{
            build_create_output_capture, build_create_staging, build_drop, build_identity_insert,
            build_select_output, StagingTable, OUTPUT_TABLE,
        },
    },
    record::Record,
};

/// Runs one step under the configured per-statement timeout.
async fn timed<T, E, F>(limit: Option<Duration>, step: F) -> Result<T, BulkOperationError>
where
    F: Future<Output = Result<T, E>>,
    E: Into<BulkOperationError>,
{
    match limit {
        Some(limit) => match timeout(limit, step).await {
            Ok(result) => result.map_err(Into::into),
            Err(_) => Err(BulkOperationError::Timeout(limit)),
        },
        None => step.await.map_err(Into::into),
    }
}

/// Everything derived before the transaction starts. Building it sends nothing but the schema
/// probe, so configuration and conversion problems never leave work behind on the server.
struct CommitPlan {
    schema: SchemaDescriptor,
    staging: StagingTable,
    output_ddl: Option<String>,
    command: MergeCommand,
    data: DataTable,
    strategy: LoadStrategy,
}

async fn plan<R: Record>(
    config: &MergeConfig,
    connection: &dyn SqlConnection,
    records: &[R],
) -> Result<CommitPlan, BulkOperationError> {
    let limit = config.settings.command_timeout();
    let schema = timed(limit, probe_schema(connection, &config.schema, &config.table)).await?;

    let staging = build_create_staging(&config.columns, &schema)?;
    let command = build_merge_command(config, &schema, &staging)?;

    let output_ddl = match (&config.identity, &command.output_identity) {
        (Some(identity), Some(_)) => {
            build_create_output_capture(identity, &config.columns, &schema)?
        }
        _ => None,
    };

    let data = DataTable::from_records(records, &staging)?;
    let strategy = LoadStrategy::select(data.len(), config.settings.bulk_copy_threshold);

    Ok(CommitPlan { schema, staging, output_ddl, command, data, strategy })
}

/// Runs the MERGE batch and reads back the row count the batch selects last.
async fn run_merge(
    connection: &dyn SqlConnection,
    command: &MergeCommand,
    limit: Option<Duration>,
) -> Result<u64, BulkOperationError> {
    let rows = timed(limit, connection.query(&command.sql, &command.params)).await?;

    rows.first()
        .and_then(|row| row.get_i64(0))
        .and_then(|affected| u64::try_from(affected).ok())
        .ok_or_else(|| {
            BulkOperationError::Reconciliation(
                "The merge batch did not report its affected row count".to_string(),
            )
        })
}

async fn run_steps<R: Record>(
    config: &MergeConfig,
    connection: &dyn SqlConnection,
    plan: &CommitPlan,
    records: &[R],
    merge_started: &mut bool,
) -> Result<(u64, Option<IdentityWriteBack>), BulkOperationError> {
    let limit = config.settings.command_timeout();

    timed(limit, connection.batch_execute(&plan.staging.ddl)).await?;
    if let Some(ddl) = &plan.output_ddl {
        timed(limit, connection.batch_execute(ddl)).await?;
    }

    let loaded = match plan.strategy {
        LoadStrategy::MultiRowInsert => {
            let mut loaded = 0;
            for statement in build_insert_statements(plan.staging.name, &plan.data) {
                loaded +=
                    timed(limit, connection.execute(&statement.sql, &statement.params)).await?;
            }
            loaded
        }
        LoadStrategy::BulkCopy => {
            timed(
                config.settings.bulk_copy_timeout(),
                connection.bulk_copy(plan.staging.name, &plan.data, &config.settings.bulk_copy),
            )
            .await?
        }
    };

    debug!(
        "Loaded {} rows ({}) into {} using {:?}",
        loaded,
        describe_columns(&plan.data),
        plan.staging.name,
        plan.strategy
    );

    *merge_started = true;
    let affected = run_merge(connection, &plan.command, limit).await?;

    let write_back = match (&plan.command.output_identity, &config.identity) {
        (Some(identity_column), Some(identity)) => {
            let rows =
                timed(limit, connection.query(&build_select_output(identity_column), &[])).await?;
            let identity_field =
                config.columns.canonical(&identity.name).unwrap_or(&identity.name);

            let write_back = reconcile(records, rows, affected, identity_field)?;

            timed(limit, connection.batch_execute(&build_drop(OUTPUT_TABLE))).await?;
            Some(write_back)
        }
        _ => None,
    };

    Ok((affected, write_back))
}

/// Undoes a failed commit. Failures here are logged, the original error is what the caller sees.
async fn abort(
    config: &MergeConfig,
    connection: &dyn SqlConnection,
    plan: &CommitPlan,
    merge_started: bool,
) {
    let limit = config.settings.command_timeout();

    if merge_started && plan.command.identity_insert {
        let sql = build_identity_insert(&plan.schema, false);
        if let Err(e) = timed(limit, connection.batch_execute(&sql)).await {
            error!("Could not switch IDENTITY_INSERT off for {}: {}", plan.schema.full_name(), e);
        }
    }

    // Rolling back also drops the temp tables created inside the transaction
    let rollback: Result<(), BulkOperationError> =
        timed(limit, connection.rollback_transaction()).await;
    if let Err(e) = rollback {
        error!("Could not roll back {} on {}: {}", config.kind, plan.schema.full_name(), e);
    }
}

/// Commits `records` according to `config`, returning the number of rows the MERGE affected.
pub async fn execute<R: Record>(
    config: &MergeConfig,
    connection: &dyn SqlConnection,
    records: &mut [R],
) -> Result<u64, BulkOperationError> {
    config.validate()?;

    if records.is_empty() {
        debug!("{} on {} has no records, nothing to commit", config.kind, config.table);
        return Ok(0);
    }

    if !connection.is_open() {
        return Err(BulkOperationError::ConnectionClosed);
    }

    let plan = plan(config, connection, records).await?;
    let limit = config.settings.command_timeout();

    timed(limit, connection.begin_transaction()).await?;

    let mut merge_started = false;
    let result = run_steps(config, connection, &plan, records, &mut merge_started).await;

    let result = match result {
        Ok(outcome) => timed(limit, connection.commit_transaction()).await.map(|()| outcome),
        Err(e) => Err(e),
    };

    match result {
        Ok((affected, write_back)) => {
            // Identities only reach the records once they are durable
            if let Some(write_back) = write_back {
                write_back.apply(records)?;
            }

            info!(
                "{} - {} records committed to {}, {} rows affected",
                config.kind,
                records.len(),
                plan.schema.full_name(),
                affected
            );
            Ok(affected)
        }
        Err(e) => {
            error!("{} on {} failed: {}", config.kind, plan.schema.full_name(), e);
            if merge_started {
                error!("Failing statement:\n{}", plan.command.sql);
            }
            abort(config, connection, &plan, merge_started).await;
            Err(e)
        }
    }
}
