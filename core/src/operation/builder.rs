use std::{marker::PhantomData, time::Duration};

use tokio::runtime::Runtime;

use crate::{
    database::{
        connection::SqlConnection, data_table::BulkCopySettings,
        mssql::query_builder::is_valid_collation_name,
    },
    operation::{
        columns::{ColumnDirection, IdentityColumn, MatchColumn},
        config::{MergeConfig, OperationKind},
        error::BulkOperationError,
        pipeline,
        predicate::{Predicate, PredicateKind},
        settings::MergeSettings,
    },
    record::Record,
};

/// Only inserts, the target is never joined.
pub struct Insert;
/// Only updates matched rows.
pub struct Update;
/// Only deletes matched rows.
pub struct Delete;
/// Updates matched rows, inserts the rest and optionally deletes unmatched target rows.
pub struct InsertOrUpdate;

pub trait OperationStage {
    const KIND: OperationKind;
}

/// Stages that join the staged rows to the target.
pub trait MatchesTarget: OperationStage {}

/// Stages with a `WHEN MATCHED THEN UPDATE` branch.
pub trait UpdatesTarget: MatchesTarget {}

/// Stages that take delete conditions.
pub trait DeletesFromTarget: MatchesTarget {}

/// Stages that can send or capture identity values.
pub trait WritesIdentity: OperationStage {}

impl OperationStage for Insert {
    const KIND: OperationKind = OperationKind::Insert;
}

impl OperationStage for Update {
    const KIND: OperationKind = OperationKind::Update;
}

impl OperationStage for Delete {
    const KIND: OperationKind = OperationKind::Delete;
}

impl OperationStage for InsertOrUpdate {
    const KIND: OperationKind = OperationKind::InsertOrUpdate;
}

impl MatchesTarget for Update {}
impl MatchesTarget for Delete {}
impl MatchesTarget for InsertOrUpdate {}

impl UpdatesTarget for Update {}
impl UpdatesTarget for InsertOrUpdate {}

impl DeletesFromTarget for Delete {}
impl DeletesFromTarget for InsertOrUpdate {}

impl WritesIdentity for Insert {}
impl WritesIdentity for Update {}
impl WritesIdentity for InsertOrUpdate {}

/// Entry point of the fluent configuration.
///
/// ```ignore
/// let affected = BulkOperation::<Person>::setup()
///     .with_table("Person")
///     .add_all_columns()
///     .bulk_insert_or_update()
///     .match_target_on("Id")
///     .set_identity_column("Id", ColumnDirection::Output)
///     .commit(&client, &mut people)
///     .await?;
/// ```
pub struct BulkOperation<R> {
    settings: MergeSettings,
    _record: PhantomData<fn() -> R>,
}

impl<R: Record> BulkOperation<R> {
    pub fn setup() -> Self {
        Self { settings: MergeSettings::default(), _record: PhantomData }
    }

    pub fn with_settings(mut self, settings: MergeSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_table(self, table: &str) -> TableStage<R> {
        TableStage { config: MergeConfig::new(table, self.settings), _record: PhantomData }
    }
}

/// Table and column selection, shared by every operation kind.
pub struct TableStage<R> {
    config: MergeConfig,
    _record: PhantomData<fn() -> R>,
}

impl<R: Record> TableStage<R> {
    pub fn with_schema(mut self, schema: &str) -> Self {
        self.config.schema = schema.to_string();
        self
    }

    /// Selects every field of the record, in declaration order.
    pub fn add_all_columns(mut self) -> Self {
        for field in R::field_names() {
            self.config.columns.add(field);
        }
        self
    }

    pub fn add_column(mut self, column: &str) -> Self {
        if R::has_field(column) {
            self.config.columns.add(column);
        } else {
            self.config.record_error(format!("'{}' is not a field of the record", column));
        }
        self
    }

    pub fn remove_column(mut self, column: &str) -> Self {
        if !self.config.columns.remove(column) {
            self.config.record_error(format!("Can not remove '{}', it is not selected", column));
        }
        self
    }

    /// Writes the field `source` into the differently named target column `destination`.
    pub fn custom_column_mapping(mut self, source: &str, destination: &str) -> Self {
        if !R::has_field(source) {
            self.config
                .record_error(format!("Can not map '{}', it is not a field of the record", source));
        } else if destination.trim().is_empty() {
            self.config.record_error(format!("Mapping for '{}' has no destination column", source));
        } else {
            self.config.columns.map(source, destination);
        }
        self
    }

    pub fn with_bulk_copy_settings(mut self, settings: BulkCopySettings) -> Self {
        self.config.settings.bulk_copy = settings;
        self
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.config.settings.command_timeout_secs = timeout.as_secs();
        self
    }

    pub fn with_bulk_copy_threshold(mut self, threshold: usize) -> Self {
        self.config.settings.bulk_copy_threshold = threshold;
        self
    }

    pub fn bulk_insert(self) -> MergeOperation<R, Insert> {
        MergeOperation::new(self.config)
    }

    pub fn bulk_update(self) -> MergeOperation<R, Update> {
        MergeOperation::new(self.config)
    }

    pub fn bulk_delete(self) -> MergeOperation<R, Delete> {
        MergeOperation::new(self.config)
    }

    pub fn bulk_insert_or_update(self) -> MergeOperation<R, InsertOrUpdate> {
        MergeOperation::new(self.config)
    }
}

/// A configured operation of kind `S`. Committing does not consume it, the same configuration
/// can be committed again with other records.
pub struct MergeOperation<R, S> {
    config: MergeConfig,
    _marker: PhantomData<fn() -> (R, S)>,
}

impl<R: Record, S: OperationStage> MergeOperation<R, S> {
    fn new(mut config: MergeConfig) -> Self {
        config.kind = S::KIND;
        Self { config, _marker: PhantomData }
    }

    fn require_selected(&mut self, column: &str, usage: &str) -> bool {
        if self.config.columns.contains(column) {
            true
        } else {
            self.config.record_error(format!(
                "'{}' is used {} but is not one of the selected columns",
                column, usage
            ));
            false
        }
    }

    fn add_condition(&mut self, kind: PredicateKind, predicate: Predicate) {
        let compiled = self.config.predicates.compile(kind, &predicate, &self.config.columns);
        match compiled {
            Ok(condition) => match kind {
                PredicateKind::Update => self.config.update_conditions.push(condition),
                PredicateKind::Delete => self.config.delete_conditions.push(condition),
            },
            Err(e) => self.config.record_error(e.to_string()),
        }
    }

    pub fn with_table_hint(mut self, hint: &str) -> Self {
        self.config.settings.table_hint = hint.to_string();
        self
    }

    /// Reports every configuration mistake made so far without touching the server.
    pub fn validate(&self) -> Result<(), BulkOperationError> {
        self.config.validate()
    }

    pub fn config(&self) -> &MergeConfig {
        &self.config
    }

    /// Runs the operation for `records` inside one transaction and returns the number of rows
    /// the `MERGE` affected. Captured identities are written back onto `records`.
    pub async fn commit(
        &self,
        connection: &dyn SqlConnection,
        records: &mut [R],
    ) -> Result<u64, BulkOperationError> {
        pipeline::execute(&self.config, connection, records).await
    }

    /// Blocking form of [`MergeOperation::commit`]. The connection must belong to `runtime`.
    pub fn commit_blocking(
        &self,
        runtime: &Runtime,
        connection: &dyn SqlConnection,
        records: &mut [R],
    ) -> Result<u64, BulkOperationError> {
        runtime.block_on(self.commit(connection, records))
    }
}

impl<R: Record, S: MatchesTarget> MergeOperation<R, S> {
    pub fn match_target_on(mut self, column: &str) -> Self {
        self.add_match_column(column, None);
        self
    }

    pub fn match_target_on_with_collation(mut self, column: &str, collation: &str) -> Self {
        if is_valid_collation_name(collation) {
            self.add_match_column(column, Some(collation.to_string()));
        } else {
            self.config.record_error(format!("'{}' is not a valid collation name", collation));
        }
        self
    }

    fn add_match_column(&mut self, column: &str, collation: Option<String>) {
        if !self.require_selected(column, "to match the target") {
            return;
        }

        if self.config.match_key.iter().any(|m| m.name.eq_ignore_ascii_case(column)) {
            self.config.record_error(format!("'{}' is already part of the match key", column));
            return;
        }

        self.config.match_key.push(MatchColumn { name: column.to_string(), collation });
    }
}

impl<R: Record, S: UpdatesTarget> MergeOperation<R, S> {
    /// Only updates matched rows for which `predicate` holds. Repeated calls are ANDed.
    pub fn update_when(mut self, predicate: Predicate) -> Self {
        if self.config.exclude_all {
            self.config.record_error(
                "Update conditions can not be combined with excluding every column from the update",
            );
            return self;
        }
        self.add_condition(PredicateKind::Update, predicate);
        self
    }

    pub fn exclude_column_from_update(mut self, column: &str) -> Self {
        if self.require_selected(column, "in an update exclusion") {
            self.config.excluded.push(column.to_string());
        }
        self
    }

    /// Drops the update branch. For an insert or update this leaves an insert of missing rows.
    pub fn exclude_all_columns_from_update(mut self) -> Self {
        if self.config.exclude_all {
            self.config.record_error("Every column is already excluded from the update");
        } else if !self.config.update_conditions.is_empty() {
            self.config.record_error(
                "Can not exclude every column from the update after adding update conditions",
            );
        } else {
            self.config.exclude_all = true;
        }
        self
    }
}

impl<R: Record, S: DeletesFromTarget> MergeOperation<R, S> {
    /// Restricts which rows are deleted. Repeated calls are ANDed.
    pub fn delete_when(mut self, predicate: Predicate) -> Self {
        self.add_condition(PredicateKind::Delete, predicate);
        self
    }
}

impl<R: Record> MergeOperation<R, InsertOrUpdate> {
    /// Deletes target rows that no staged row matched, narrowed by any `delete_when` conditions.
    pub fn delete_when_not_matched(mut self, enabled: bool) -> Self {
        self.config.delete_when_not_matched = enabled;
        self
    }
}

impl<R: Record, S: WritesIdentity> MergeOperation<R, S> {
    pub fn set_identity_column(mut self, column: &str, direction: ColumnDirection) -> Self {
        if self.config.identity.is_some() {
            self.config.record_error("An identity column was already set");
            return self;
        }

        if self.require_selected(column, "as the identity column") {
            self.config.identity = Some(IdentityColumn { name: column.to_string(), direction });
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        database::testing::{output_row, person_schema_rows, SpyCall, SpyConnection},
        operation::predicate::{source, target},
    };

    #[derive(Debug, Clone, PartialEq)]
    struct Person {
        id: i32,
        name: String,
        age: Option<i32>,
    }

    crate::impl_record!(Person { id => "Id", name => "Name", age => "Age" });

    fn people() -> Vec<Person> {
        vec![
            Person { id: 0, name: "Ada".to_string(), age: Some(36) },
            Person { id: 0, name: "Grace".to_string(), age: None },
            Person { id: 1, name: "Alan".to_string(), age: Some(41) },
        ]
    }

    fn upsert() -> MergeOperation<Person, InsertOrUpdate> {
        BulkOperation::<Person>::setup()
            .with_table("Person")
            .add_all_columns()
            .bulk_insert_or_update()
            .match_target_on("Id")
            .set_identity_column("Id", ColumnDirection::Output)
    }

    fn spy_with_output() -> SpyConnection {
        let mut spy = SpyConnection::new(person_schema_rows());
        spy.output_rows = vec![
            output_row(Some(2), 1, "UPDATE"),
            output_row(Some(1), 102, "INSERT"),
            output_row(Some(0), 101, "INSERT"),
        ];
        spy.merge_affected = 3;
        spy
    }

    #[tokio::test]
    async fn test_configuration_errors_send_nothing() {
        let spy = SpyConnection::new(person_schema_rows());
        let mut records = people();

        let operation =
            BulkOperation::<Person>::setup().with_table("Person").add_all_columns().bulk_update();

        let result = operation.commit(&spy, &mut records).await;

        assert!(matches!(result, Err(BulkOperationError::Configuration(_))));
        assert!(spy.calls().is_empty());
    }

    #[tokio::test]
    async fn test_update_with_nothing_to_assign_sends_nothing() {
        let spy = SpyConnection::new(person_schema_rows());
        let mut records = people();

        let exclude_all = BulkOperation::<Person>::setup()
            .with_table("Person")
            .add_all_columns()
            .bulk_update()
            .match_target_on("Id")
            .exclude_all_columns_from_update();
        let result = exclude_all.commit(&spy, &mut records).await;
        assert!(matches!(result, Err(BulkOperationError::Configuration(_))));

        let every_column = BulkOperation::<Person>::setup()
            .with_table("Person")
            .add_all_columns()
            .bulk_update()
            .match_target_on("Id")
            .exclude_column_from_update("Name")
            .exclude_column_from_update("Age");
        let result = every_column.commit(&spy, &mut records).await;
        assert!(matches!(result, Err(BulkOperationError::Configuration(_))));

        assert!(spy.calls().is_empty());
    }

    #[tokio::test]
    async fn test_delete_condition_without_unmatched_deletes_sends_nothing() {
        let spy = spy_with_output();
        let mut records = people();

        let result = upsert().delete_when(target("Age").is_null()).commit(&spy, &mut records).await;

        assert!(matches!(result, Err(BulkOperationError::Configuration(_))));
        assert!(spy.calls().is_empty());
        assert_eq!(records, people());
    }

    #[tokio::test]
    async fn test_failed_commit_leaves_records_untouched() {
        let mut spy = spy_with_output();
        spy.fail_commit = Some(3902);
        let mut records = people();

        let result = upsert().commit(&spy, &mut records).await;

        assert!(matches!(result, Err(BulkOperationError::ServerExecution { code: 3902, .. })));
        assert_eq!(records, people());

        let calls = spy.calls();
        let tail = &calls[calls.len() - 2..];
        assert_eq!(tail, &[SpyCall::Commit, SpyCall::Rollback]);
    }

    #[tokio::test]
    async fn test_insert_or_update_writes_identities_back() {
        let spy = spy_with_output();
        let mut records = people();

        let affected = upsert().commit(&spy, &mut records).await.unwrap();

        assert_eq!(affected, 3);
        assert_eq!(records.iter().map(|p| p.id).collect::<Vec<_>>(), vec![101, 102, 1]);
        assert_eq!(records[1].name, "Grace");
    }

    #[tokio::test]
    async fn test_commit_call_sequence() {
        let spy = spy_with_output();
        let mut records = people();

        upsert().commit(&spy, &mut records).await.unwrap();

        let calls = spy.calls();
        assert_eq!(calls.len(), 9, "{:#?}", calls);
        assert!(
            matches!(&calls[0], SpyCall::Query { sql, .. } if sql.contains("INFORMATION_SCHEMA"))
        );
        assert_eq!(calls[1], SpyCall::Begin);
        assert!(matches!(
            &calls[2],
            SpyCall::Batch(sql) if sql.starts_with("CREATE TABLE #BulkMergeStaging")
        ));
        assert!(matches!(
            &calls[3],
            SpyCall::Batch(sql) if sql.starts_with("CREATE TABLE #BulkMergeOutput")
        ));
        match &calls[4] {
            SpyCall::Execute { sql, params } => {
                assert!(sql.starts_with("INSERT INTO #BulkMergeStaging"));
                assert_eq!(params.len(), 12);
            }
            other => panic!("unexpected call {:?}", other),
        }
        match &calls[5] {
            SpyCall::Query { sql, .. } => {
                assert!(sql.contains("MERGE INTO [dbo].[Person] WITH (HOLDLOCK) AS Target"));
                assert!(sql.contains("$action INTO #BulkMergeOutput"));
                assert!(sql.contains("SET @BulkMergeAffected = @@ROWCOUNT;"));
                assert!(sql.ends_with("SELECT @BulkMergeAffected AS [AffectedRows];"));
            }
            other => panic!("unexpected call {:?}", other),
        }
        assert!(
            matches!(&calls[6], SpyCall::Query { sql, .. } if sql.contains("FROM #BulkMergeOutput"))
        );
        assert_eq!(calls[7], SpyCall::Batch("DROP TABLE #BulkMergeOutput;".to_string()));
        assert_eq!(calls[8], SpyCall::Commit);
    }

    #[tokio::test]
    async fn test_threshold_zero_uses_bulk_copy() {
        let mut spy = SpyConnection::new(person_schema_rows());
        spy.merge_affected = 3;
        let mut records = people();

        let operation = BulkOperation::<Person>::setup()
            .with_table("Person")
            .add_all_columns()
            .with_bulk_copy_threshold(0)
            .bulk_insert_or_update()
            .match_target_on("Id");

        operation.commit(&spy, &mut records).await.unwrap();

        let calls = spy.calls();
        let bulk_copy = SpyCall::BulkCopy { table: "#BulkMergeStaging".to_string(), rows: 3 };
        assert!(calls.contains(&bulk_copy));
        assert!(!calls.iter().any(
            |call| matches!(call, SpyCall::Execute { sql, .. } if sql.starts_with("INSERT INTO"))
        ));
    }

    #[tokio::test]
    async fn test_identity_failure_rolls_back_and_switches_identity_insert_off() {
        let mut spy = SpyConnection::new(person_schema_rows());
        spy.fail_when = Some(("MERGE", 544));
        let mut records = people();

        let operation = BulkOperation::<Person>::setup()
            .with_table("Person")
            .add_all_columns()
            .with_bulk_copy_settings(BulkCopySettings { keep_identity: true, ..Default::default() })
            .bulk_insert_or_update()
            .match_target_on("Id")
            .set_identity_column("Id", ColumnDirection::Input);

        let result = operation.commit(&spy, &mut records).await;
        assert!(matches!(result, Err(BulkOperationError::IdentityConfiguration(_))));

        let calls = spy.calls();
        let tail = &calls[calls.len() - 2..];
        assert_eq!(tail[0], SpyCall::Batch("SET IDENTITY_INSERT [dbo].[Person] OFF;".to_string()));
        assert_eq!(tail[1], SpyCall::Rollback);
        assert!(!calls.contains(&SpyCall::Commit));
        assert_eq!(records, people());
    }

    #[tokio::test]
    async fn test_staging_failure_rolls_back_without_identity_insert() {
        let mut spy = SpyConnection::new(person_schema_rows());
        spy.fail_when = Some(("CREATE TABLE #BulkMergeStaging", 2714));
        let mut records = people();

        let result = upsert().commit(&spy, &mut records).await;
        assert!(matches!(result, Err(BulkOperationError::ServerExecution { code: 2714, .. })));

        let calls = spy.calls();
        assert_eq!(calls.last(), Some(&SpyCall::Rollback));
        assert!(!calls
            .iter()
            .any(|call| matches!(call, SpyCall::Batch(sql) if sql.contains("IDENTITY_INSERT"))));
    }

    #[tokio::test]
    async fn test_empty_records_do_not_touch_the_server() {
        let spy = SpyConnection::new(person_schema_rows());
        let mut records: Vec<Person> = Vec::new();

        assert_eq!(upsert().commit(&spy, &mut records).await.unwrap(), 0);
        assert!(spy.calls().is_empty());
    }

    #[tokio::test]
    async fn test_closed_connection() {
        let spy = SpyConnection::new(person_schema_rows());
        spy.close();
        let mut records = people();

        let result = upsert().commit(&spy, &mut records).await;

        assert!(matches!(result, Err(BulkOperationError::ConnectionClosed)));
        assert!(spy.calls().is_empty());
    }

    #[tokio::test]
    async fn test_conversion_error_is_raised_before_the_transaction() {
        let spy = spy_with_output();
        let mut records = people();
        records[1].name = "x".repeat(51);

        match upsert().commit(&spy, &mut records).await {
            Err(BulkOperationError::DataConversion { row, column, .. }) => {
                assert_eq!(row, 1);
                assert_eq!(column, "Name");
            }
            other => panic!("unexpected result {:?}", other),
        }

        let calls = spy.calls();
        assert_eq!(calls.len(), 1);
        assert!(!calls.contains(&SpyCall::Begin));
    }

    #[tokio::test]
    async fn test_missing_table() {
        let spy = SpyConnection::new(Vec::new());
        let mut records = people();

        let result = upsert().commit(&spy, &mut records).await;

        assert!(matches!(result, Err(BulkOperationError::Schema(_))));
        assert!(!spy.calls().contains(&SpyCall::Begin));
    }

    #[test]
    fn test_commit_blocking() {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        let spy = spy_with_output();
        let mut records = people();

        let affected = upsert().commit_blocking(&runtime, &spy, &mut records).unwrap();

        assert_eq!(affected, 3);
        assert_eq!(records[0].id, 101);
    }

    #[test]
    fn test_exclude_all_rules() {
        let twice = upsert().exclude_all_columns_from_update().exclude_all_columns_from_update();
        assert!(twice.validate().is_err());

        let after_condition = upsert()
            .update_when(source("Age").greater_than(18))
            .exclude_all_columns_from_update();
        assert!(after_condition.validate().is_err());

        let before_condition = upsert()
            .exclude_all_columns_from_update()
            .update_when(source("Age").greater_than(18));
        assert!(before_condition.validate().is_err());

        assert!(upsert().exclude_all_columns_from_update().validate().is_ok());
    }

    #[test]
    fn test_unknown_columns_are_reported() {
        let operation = BulkOperation::<Person>::setup()
            .with_table("Person")
            .add_column("Id")
            .add_column("Email")
            .bulk_insert_or_update()
            .match_target_on("Name")
            .exclude_column_from_update("Age");

        match operation.validate() {
            Err(BulkOperationError::Configuration(message)) => {
                assert!(message.contains("'Email' is not a field of the record"));
                assert!(message.contains("'Name' is used to match the target"));
                assert!(message.contains("'Age' is used in an update exclusion"));
            }
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn test_conditions_are_numbered_in_call_order() {
        let operation = upsert()
            .update_when(source("Age").greater_than(18))
            .delete_when(target("Age").is_null())
            .delete_when_not_matched(true)
            .update_when(target("Name").not_equals_column(source("Name")));

        let config = operation.config();
        assert_eq!(config.update_conditions.len(), 2);
        assert_eq!(config.update_conditions[0].params[0].name, "UpdateCondition0_0");
        assert_eq!(config.update_conditions[1].sort_order, 2);
        assert_eq!(config.delete_conditions[0].sort_order, 1);
        assert_eq!(config.predicates.next_sort_order(), 3);
        assert!(operation.validate().is_ok());
    }

    #[test]
    fn test_invalid_collation_and_duplicate_match_column() {
        let operation = upsert()
            .match_target_on("Id")
            .match_target_on_with_collation("Name", "Latin1; DROP TABLE Person");

        assert!(operation.validate().is_err());
        assert_eq!(operation.config().match_key.len(), 1);
    }
}
