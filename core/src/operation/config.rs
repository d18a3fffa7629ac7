use std::fmt;

use crate::{
    database::mssql::query_builder::normalize_table_hint,
    operation::{
        columns::{ColumnSet, IdentityColumn, MatchColumn},
        error::BulkOperationError,
        predicate::{PredicateBuilder, PredicateCondition},
        settings::MergeSettings,
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Insert,
    Update,
    Delete,
    InsertOrUpdate,
}

impl OperationKind {
    pub fn needs_match_key(self) -> bool {
        !matches!(self, OperationKind::Insert)
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationKind::Insert => "BulkInsert",
            OperationKind::Update => "BulkUpdate",
            OperationKind::Delete => "BulkDelete",
            OperationKind::InsertOrUpdate => "BulkInsertOrUpdate",
        };
        write!(f, "{}", name)
    }
}

/// Everything the builder collected. Immutable once a commit starts.
#[derive(Debug)]
pub struct MergeConfig {
    pub kind: OperationKind,
    pub schema: String,
    pub table: String,
    pub columns: ColumnSet,
    pub match_key: Vec<MatchColumn>,
    pub update_conditions: Vec<PredicateCondition>,
    pub delete_conditions: Vec<PredicateCondition>,
    /// Source names removed from the update assignments.
    pub excluded: Vec<String>,
    pub exclude_all: bool,
    pub identity: Option<IdentityColumn>,
    pub delete_when_not_matched: bool,
    pub settings: MergeSettings,
    pub predicates: PredicateBuilder,
    /// Configuration mistakes, reported together by `validate`.
    pub errors: Vec<String>,
}

impl MergeConfig {
    pub fn new(table: &str, settings: MergeSettings) -> Self {
        Self {
            kind: OperationKind::InsertOrUpdate,
            schema: "dbo".to_string(),
            table: table.to_string(),
            columns: ColumnSet::new(),
            match_key: Vec::new(),
            update_conditions: Vec::new(),
            delete_conditions: Vec::new(),
            excluded: Vec::new(),
            exclude_all: false,
            identity: None,
            delete_when_not_matched: false,
            settings,
            predicates: PredicateBuilder::new(),
            errors: Vec::new(),
        }
    }

    pub fn record_error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    /// Whether a selected column is left for `WHEN MATCHED THEN UPDATE` to assign. Identity
    /// columns the server reports are only known once the schema is probed.
    fn has_assignable_column(&self) -> bool {
        let fixed: Vec<&str> = self
            .excluded
            .iter()
            .map(String::as_str)
            .chain(self.match_key.iter().map(|m| m.name.as_str()))
            .chain(self.identity.iter().map(|i| i.name.as_str()))
            .collect();

        self.columns
            .columns()
            .iter()
            .any(|column| !fixed.iter().any(|name| name.eq_ignore_ascii_case(column)))
    }

    /// Checks everything that can be checked without the server.
    pub fn validate(&self) -> Result<(), BulkOperationError> {
        let mut errors = self.errors.clone();

        if self.table.trim().is_empty() {
            errors.push("No table name was given".to_string());
        }

        if self.columns.is_empty() {
            errors.push("No columns were selected".to_string());
        }

        if self.kind.needs_match_key() && self.match_key.is_empty() {
            errors.push(format!("{} needs at least one column to match the target on", self.kind));
        }

        if self.kind == OperationKind::Update && !self.columns.is_empty() {
            if self.exclude_all {
                errors.push(format!(
                    "{} excludes every column from the update, there is nothing to update",
                    self.kind
                ));
            } else if !self.has_assignable_column() {
                errors.push(
                    "Every column is excluded from the update, there is nothing to update"
                        .to_string(),
                );
            }
        }

        if self.kind == OperationKind::InsertOrUpdate && !self.delete_conditions.is_empty() {
            if !self.delete_when_not_matched {
                errors.push(
                    "Delete conditions were given but deleting unmatched rows is not enabled"
                        .to_string(),
                );
            }
            if self.delete_conditions.iter().any(|c| c.references_source) {
                errors.push(
                    "Delete conditions for unmatched rows can only reference target columns"
                        .to_string(),
                );
            }
        }

        if normalize_table_hint(&self.settings.table_hint).is_none() {
            errors.push(format!("'{}' is not a supported table hint", self.settings.table_hint));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(BulkOperationError::Configuration(errors.join("; ")))
        }
    }
}
