//! Shared T-SQL fragment building used by the staging DDL and the MERGE statement.

/// Alias of the target table inside the MERGE statement.
pub const TARGET_ALIAS: &str = "Target";

/// Alias of the staging table inside the MERGE statement.
pub const SOURCE_ALIAS: &str = "Source";

/// Table hints accepted after `MERGE INTO target WITH (...)`.
pub const TABLE_HINTS: &[&str] = &[
    "HOLDLOCK",
    "SERIALIZABLE",
    "UPDLOCK",
    "ROWLOCK",
    "PAGLOCK",
    "TABLOCK",
    "TABLOCKX",
    "XLOCK",
    "REPEATABLEREAD",
    "READCOMMITTED",
    "READCOMMITTEDLOCK",
    "NOWAIT",
    "READPAST",
    "FORCESEEK",
    "FORCESCAN",
];

/// Brackets an identifier, doubling any closing bracket inside it.
#[inline]
pub fn quote_identifier(name: &str) -> String {
    format!("[{}]", name.replace(']', "]]"))
}

/// Formats `schema.table`. Temp tables (`#name`) are session scoped and never get a schema.
pub fn format_table_name(schema: &str, table: &str) -> String {
    if table.starts_with('#') {
        return table.to_string();
    }

    format!("{}.{}", quote_identifier(schema), quote_identifier(table))
}

/// `[a], [b], [c]`
pub fn build_column_list(columns: &[&str]) -> String {
    columns.iter().map(|col| quote_identifier(col)).collect::<Vec<_>>().join(", ")
}

/// `Source.[a], Source.[b]`
pub fn build_prefixed_column_list(prefix: &str, columns: &[&str]) -> String {
    columns
        .iter()
        .map(|col| format!("{}.{}", prefix, quote_identifier(col)))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Equality between the target and staging copy of one match column.
///
/// Nullable columns get a NULL-safe comparison so NULL on both sides counts as a match.
/// `collation` is applied to the equality when given.
pub fn build_match_condition(column: &str, nullable: bool, collation: Option<&str>) -> String {
    let target_col = format!("{}.{}", TARGET_ALIAS, quote_identifier(column));
    let source_col = format!("{}.{}", SOURCE_ALIAS, quote_identifier(column));

    let equality = match collation {
        Some(collation) => format!("{} = {} COLLATE {}", target_col, source_col, collation),
        None => format!("{} = {}", target_col, source_col),
    };

    if nullable {
        format!("({} OR ({} IS NULL AND {} IS NULL))", equality, target_col, source_col)
    } else {
        equality
    }
}

/// `Target.[a] = Source.[a]`
pub fn build_set_clause(column: &str) -> String {
    let column = quote_identifier(column);
    format!("{}.{} = {}.{}", TARGET_ALIAS, column, SOURCE_ALIAS, column)
}

/// Joins conditions with `AND`, each one parenthesised. Empty input yields an empty string.
pub fn build_conjunction(conditions: &[&str]) -> String {
    conditions.iter().map(|c| format!("({})", c)).collect::<Vec<_>>().join(" AND ")
}

/// Collation names are spliced into SQL text, so only plain identifiers are allowed.
pub fn is_valid_collation_name(collation: &str) -> bool {
    !collation.is_empty() && collation.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

pub fn normalize_table_hint(hint: &str) -> Option<&'static str> {
    let hint = hint.trim();
    TABLE_HINTS.iter().find(|known| known.eq_ignore_ascii_case(hint)).copied()
}
