//! Boolean conditions restricting the update and delete branches of a merge.
//!
//! A [`Predicate`] is a small expression tree over column references. It is compiled once, when
//! registered, into a parameterised T-SQL fragment: literal values never reach the SQL text, they
//! become `@{Kind}Condition{sort}_{n}` parameters.

use std::ops::Not;

use crate::{
    database::{
        connection::QueryParam,
        mssql::query_builder::{build_conjunction, quote_identifier, SOURCE_ALIAS, TARGET_ALIAS},
        sql_type_wrapper::SqlValue,
    },
    operation::{columns::ColumnSet, error::BulkOperationError},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredicateKind {
    Update,
    Delete,
}

impl PredicateKind {
    fn parameter_prefix(self) -> &'static str {
        match self {
            PredicateKind::Update => "UpdateCondition",
            PredicateKind::Delete => "DeleteCondition",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComparisonOperator {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl ComparisonOperator {
    pub fn as_sql(self) -> &'static str {
        match self {
            ComparisonOperator::Eq => "=",
            ComparisonOperator::Ne => "<>",
            ComparisonOperator::Gt => ">",
            ComparisonOperator::Gte => ">=",
            ComparisonOperator::Lt => "<",
            ComparisonOperator::Lte => "<=",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOperator {
    And,
    Or,
}

/// Which side of the merge a column reference reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnSource {
    /// The row currently stored in the target table.
    Target,
    /// The incoming row from the record collection.
    Source,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnRef {
    pub name: String,
    pub source: ColumnSource,
}

/// Column of the existing target row.
pub fn target(name: &str) -> ColumnRef {
    ColumnRef { name: name.to_string(), source: ColumnSource::Target }
}

/// Column of the incoming source row.
pub fn source(name: &str) -> ColumnRef {
    ColumnRef { name: name.to_string(), source: ColumnSource::Source }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Column(ColumnRef),
    Value(SqlValue),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub left: ColumnRef,
    pub operator: ComparisonOperator,
    pub right: Operand,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Condition(Condition),
    IsNull(ColumnRef),
    IsNotNull(ColumnRef),
    Logical { left: Box<Predicate>, operator: LogicalOperator, right: Box<Predicate> },
    Not(Box<Predicate>),
}

impl ColumnRef {
    pub fn compare(self, operator: ComparisonOperator, right: Operand) -> Predicate {
        Predicate::Condition(Condition { left: self, operator, right })
    }

    pub fn equals(self, value: impl Into<SqlValue>) -> Predicate {
        self.compare(ComparisonOperator::Eq, Operand::Value(value.into()))
    }

    pub fn not_equals(self, value: impl Into<SqlValue>) -> Predicate {
        self.compare(ComparisonOperator::Ne, Operand::Value(value.into()))
    }

    pub fn greater_than(self, value: impl Into<SqlValue>) -> Predicate {
        self.compare(ComparisonOperator::Gt, Operand::Value(value.into()))
    }

    pub fn greater_or_equal(self, value: impl Into<SqlValue>) -> Predicate {
        self.compare(ComparisonOperator::Gte, Operand::Value(value.into()))
    }

    pub fn less_than(self, value: impl Into<SqlValue>) -> Predicate {
        self.compare(ComparisonOperator::Lt, Operand::Value(value.into()))
    }

    pub fn less_or_equal(self, value: impl Into<SqlValue>) -> Predicate {
        self.compare(ComparisonOperator::Lte, Operand::Value(value.into()))
    }

    /// Compares against another column, e.g.
    /// `target("Version").less_than_column(source("Version"))`.
    pub fn compare_column(self, operator: ComparisonOperator, other: ColumnRef) -> Predicate {
        self.compare(operator, Operand::Column(other))
    }

    pub fn less_than_column(self, other: ColumnRef) -> Predicate {
        self.compare_column(ComparisonOperator::Lt, other)
    }

    pub fn not_equals_column(self, other: ColumnRef) -> Predicate {
        self.compare_column(ComparisonOperator::Ne, other)
    }

    pub fn is_null(self) -> Predicate {
        Predicate::IsNull(self)
    }

    pub fn is_not_null(self) -> Predicate {
        Predicate::IsNotNull(self)
    }
}

impl Predicate {
    pub fn and(self, other: Predicate) -> Predicate {
        Predicate::Logical {
            left: Box::new(self),
            operator: LogicalOperator::And,
            right: Box::new(other),
        }
    }

    pub fn or(self, other: Predicate) -> Predicate {
        Predicate::Logical {
            left: Box::new(self),
            operator: LogicalOperator::Or,
            right: Box::new(other),
        }
    }

    fn references_source(&self) -> bool {
        match self {
            Predicate::Condition(cond) => {
                cond.left.source == ColumnSource::Source
                    || matches!(&cond.right, Operand::Column(c) if c.source == ColumnSource::Source)
            }
            Predicate::IsNull(column) | Predicate::IsNotNull(column) => {
                column.source == ColumnSource::Source
            }
            Predicate::Logical { left, right, .. } => {
                left.references_source() || right.references_source()
            }
            Predicate::Not(inner) => inner.references_source(),
        }
    }
}

impl Not for Predicate {
    type Output = Predicate;

    fn not(self) -> Predicate {
        Predicate::Not(Box::new(self))
    }
}

/// A compiled predicate, ready to be ANDed with others of the same kind.
#[derive(Debug, Clone, PartialEq)]
pub struct PredicateCondition {
    pub kind: PredicateKind,
    pub sql: String,
    pub params: Vec<QueryParam>,
    pub sort_order: u32,
    /// Set when the fragment reads the incoming row, which does not exist in the
    /// `NOT MATCHED BY SOURCE` branch.
    pub references_source: bool,
}

/// Compiles predicates, numbering them with a strictly increasing sort counter.
#[derive(Debug, Default)]
pub struct PredicateBuilder {
    next_sort_order: u32,
}

struct CompileContext<'a> {
    columns: &'a ColumnSet,
    prefix: String,
    params: Vec<QueryParam>,
}

impl CompileContext<'_> {
    fn column_sql(&self, column: &ColumnRef) -> Result<String, BulkOperationError> {
        let destination = self.columns.destination(&column.name).ok_or_else(|| {
            BulkOperationError::Configuration(format!(
                "Column '{}' is used in a condition but is not part of the operation's columns",
                column.name
            ))
        })?;

        let alias = match column.source {
            ColumnSource::Target => TARGET_ALIAS,
            ColumnSource::Source => SOURCE_ALIAS,
        };

        Ok(format!("{}.{}", alias, quote_identifier(destination)))
    }

    fn bind(&mut self, value: &SqlValue) -> String {
        let name = format!("{}_{}", self.prefix, self.params.len());
        let param = QueryParam::new(name, value.clone());
        let placeholder = param.placeholder();
        self.params.push(param);
        placeholder
    }

    fn compile(&mut self, predicate: &Predicate) -> Result<String, BulkOperationError> {
        match predicate {
            Predicate::Condition(cond) => {
                let left_sql = self.column_sql(&cond.left)?;
                match (&cond.right, cond.operator) {
                    (Operand::Value(SqlValue::Null), ComparisonOperator::Eq) => {
                        Ok(format!("{} IS NULL", left_sql))
                    }
                    (Operand::Value(SqlValue::Null), ComparisonOperator::Ne) => {
                        Ok(format!("{} IS NOT NULL", left_sql))
                    }
                    (Operand::Value(SqlValue::Null), operator) => {
                        Err(BulkOperationError::Configuration(format!(
                            "NULL can only be compared with = or <>, not {}",
                            operator.as_sql()
                        )))
                    }
                    (Operand::Value(value), operator) => {
                        let placeholder = self.bind(value);
                        Ok(format!("{} {} {}", left_sql, operator.as_sql(), placeholder))
                    }
                    (Operand::Column(column), operator) => {
                        let right_sql = self.column_sql(column)?;
                        Ok(format!("{} {} {}", left_sql, operator.as_sql(), right_sql))
                    }
                }
            }
            Predicate::IsNull(column) => Ok(format!("{} IS NULL", self.column_sql(column)?)),
            Predicate::IsNotNull(column) => {
                Ok(format!("{} IS NOT NULL", self.column_sql(column)?))
            }
            Predicate::Logical { left, operator, right } => {
                let left_sql = self.compile(left)?;
                let right_sql = self.compile(right)?;
                let op_sql = match operator {
                    LogicalOperator::And => "AND",
                    LogicalOperator::Or => "OR",
                };
                Ok(format!("({} {} {})", left_sql, op_sql, right_sql))
            }
            Predicate::Not(inner) => Ok(format!("NOT ({})", self.compile(inner)?)),
        }
    }
}

impl PredicateBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sort order the next compiled predicate will get.
    pub fn next_sort_order(&self) -> u32 {
        self.next_sort_order
    }

    /// Compiles `predicate`, resolving column names through `columns` so the fragment refers to
    /// destination columns. The counter only advances on success.
    pub fn compile(
        &mut self,
        kind: PredicateKind,
        predicate: &Predicate,
        columns: &ColumnSet,
    ) -> Result<PredicateCondition, BulkOperationError> {
        let sort_order = self.next_sort_order;
        let mut context = CompileContext {
            columns,
            prefix: format!("{}{}", kind.parameter_prefix(), sort_order),
            params: Vec::new(),
        };

        let sql = context.compile(predicate)?;
        self.next_sort_order += 1;

        Ok(PredicateCondition {
            kind,
            sql,
            params: context.params,
            sort_order,
            references_source: predicate.references_source(),
        })
    }
}

/// ANDs conditions in ascending sort order. `None` when there is nothing to filter on.
pub fn conjunction(conditions: &[PredicateCondition]) -> Option<(String, Vec<QueryParam>)> {
    if conditions.is_empty() {
        return None;
    }

    let mut ordered: Vec<&PredicateCondition> = conditions.iter().collect();
    ordered.sort_by_key(|condition| condition.sort_order);

    let fragments: Vec<&str> = ordered.iter().map(|condition| condition.sql.as_str()).collect();
    let params = ordered.iter().flat_map(|condition| condition.params.iter().cloned()).collect();

    Some((build_conjunction(&fragments), params))
}
