use std::{collections::HashSet, str::FromStr};

use tracing::debug;

use crate::{
    database::{connection::DbRow, sql_type_wrapper::SqlValue},
    operation::error::BulkOperationError,
    record::Record,
};

/// `$action` of a captured output row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeAction {
    Insert,
    Update,
    Delete,
}

impl FromStr for MergeAction {
    type Err = BulkOperationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_uppercase().as_str() {
            "INSERT" => Ok(MergeAction::Insert),
            "UPDATE" => Ok(MergeAction::Update),
            "DELETE" => Ok(MergeAction::Delete),
            other => Err(BulkOperationError::Reconciliation(format!(
                "Unknown merge action '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutputRow {
    pub ordinal: Option<usize>,
    pub identity: SqlValue,
    pub action: MergeAction,
}

impl OutputRow {
    fn from_row(row: DbRow) -> Result<Self, BulkOperationError> {
        let ordinal = match row.get(0) {
            SqlValue::Null => None,
            value => {
                let ordinal = value.as_i64().and_then(|v| usize::try_from(v).ok()).ok_or_else(|| {
                    BulkOperationError::Reconciliation(format!("Invalid row ordinal {:?}", value))
                })?;
                Some(ordinal)
            }
        };

        let action = match row.get(2) {
            SqlValue::String(action) => action.parse()?,
            other => {
                return Err(BulkOperationError::Reconciliation(format!(
                    "Invalid merge action {:?}",
                    other
                )))
            }
        };

        let identity = row.values.into_iter().nth(1).unwrap_or(SqlValue::Null);

        Ok(OutputRow { ordinal, identity, action })
    }
}

/// Captured identities, checked against the records but not yet written onto them.
#[derive(Debug, Clone, PartialEq)]
pub struct IdentityWriteBack {
    field: String,
    identities: Vec<(usize, SqlValue)>,
}

impl IdentityWriteBack {
    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    /// Writes every identity onto its record. Each value already passed `Record::check_field`.
    pub fn apply<R: Record>(self, records: &mut [R]) -> Result<usize, BulkOperationError> {
        let written = self.identities.len();

        for (ordinal, identity) in self.identities {
            let record = records.get_mut(ordinal).ok_or_else(|| {
                BulkOperationError::Reconciliation(format!(
                    "Row ordinal {} is outside of the records",
                    ordinal
                ))
            })?;
            record.set_field(&self.field, identity).map_err(|e| {
                BulkOperationError::Reconciliation(format!(
                    "Could not write '{}' of record {}: {}",
                    self.field, ordinal, e
                ))
            })?;
        }

        debug!("Wrote {} captured identities back onto the records", written);

        Ok(written)
    }
}

/// Matches captured output rows to the records they were generated for.
///
/// Every row the MERGE touched must have been captured exactly once and every identity must fit
/// its record field; anything else means the output can not be trusted. The records are left
/// untouched, the returned write-back is applied once the transaction has committed.
pub fn reconcile<R: Record>(
    records: &[R],
    rows: Vec<DbRow>,
    affected: u64,
    identity_field: &str,
) -> Result<IdentityWriteBack, BulkOperationError> {
    if rows.len() as u64 != affected {
        return Err(BulkOperationError::Reconciliation(format!(
            "Captured {} output rows but the merge affected {} rows",
            rows.len(),
            affected
        )));
    }

    let rows = rows.into_iter().map(OutputRow::from_row).collect::<Result<Vec<_>, _>>()?;

    let mut seen = HashSet::with_capacity(rows.len());
    let mut identities = Vec::with_capacity(rows.len());
    for row in rows {
        if row.action == MergeAction::Delete {
            continue;
        }

        let ordinal = row.ordinal.ok_or_else(|| {
            BulkOperationError::Reconciliation("Captured row has no row ordinal".to_string())
        })?;

        let record = records.get(ordinal).ok_or_else(|| {
            BulkOperationError::Reconciliation(format!(
                "Row ordinal {} is outside of the {} records",
                ordinal,
                records.len()
            ))
        })?;

        if !seen.insert(ordinal) {
            return Err(BulkOperationError::Reconciliation(format!(
                "Row ordinal {} was captured more than once",
                ordinal
            )));
        }

        record.check_field(identity_field, &row.identity).map_err(|e| {
            BulkOperationError::Reconciliation(format!(
                "Could not write '{}' of record {}: {}",
                identity_field, ordinal, e
            ))
        })?;

        identities.push((ordinal, row.identity));
    }

    Ok(IdentityWriteBack { field: identity_field.to_string(), identities })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Person {
        id: i64,
        name: String,
    }

    crate::impl_record!(Person { id => "Id", name => "Name" });

    fn people() -> Vec<Person> {
        vec![
            Person { id: 0, name: "A".to_string() },
            Person { id: 0, name: "B".to_string() },
            Person { id: 1, name: "C".to_string() },
        ]
    }

    fn output(ordinal: Option<i32>, identity: i32, action: &str) -> DbRow {
        DbRow::new(vec![
            ordinal.map(SqlValue::I32).unwrap_or(SqlValue::Null),
            SqlValue::I32(identity),
            SqlValue::from(action),
        ])
    }

    #[test]
    fn test_identities_are_written_back_by_ordinal() {
        let mut records = people();
        let rows = vec![
            output(Some(2), 1, "UPDATE"),
            output(Some(1), 102, "INSERT"),
            output(Some(0), 101, "INSERT"),
        ];

        let write_back = reconcile(&records, rows, 3, "Id").unwrap();
        assert_eq!(records.iter().map(|p| p.id).collect::<Vec<_>>(), vec![0, 0, 1]);

        assert_eq!(write_back.apply(&mut records).unwrap(), 3);
        assert_eq!(records.iter().map(|p| p.id).collect::<Vec<_>>(), vec![101, 102, 1]);
    }

    #[test]
    fn test_deleted_rows_are_counted_but_not_written() {
        let mut records = people();
        let rows = vec![output(Some(0), 101, "INSERT"), output(None, 7, "DELETE")];

        let write_back = reconcile(&records, rows, 2, "Id").unwrap();
        assert_eq!(write_back.apply(&mut records).unwrap(), 1);
        assert_eq!(records[0].id, 101);
    }

    #[test]
    fn test_count_mismatch() {
        let records = people();
        let rows = vec![output(Some(0), 101, "INSERT")];

        assert!(matches!(
            reconcile(&records, rows, 2, "Id"),
            Err(BulkOperationError::Reconciliation(_))
        ));
        assert_eq!(records[0].id, 0);
    }

    #[test]
    fn test_duplicate_or_out_of_range_ordinals() {
        let records = people();
        let duplicate = vec![output(Some(0), 101, "INSERT"), output(Some(0), 102, "INSERT")];
        assert!(reconcile(&records, duplicate, 2, "Id").is_err());

        let out_of_range = vec![output(Some(3), 101, "INSERT")];
        assert!(reconcile(&records, out_of_range, 1, "Id").is_err());

        assert!(records.iter().all(|p| p.id <= 1));
    }

    #[test]
    fn test_identity_that_does_not_fit_rejects_the_whole_output() {
        let records = people();
        let rows = vec![
            output(Some(0), 101, "INSERT"),
            DbRow::new(vec![SqlValue::I32(1), SqlValue::Null, SqlValue::from("INSERT")]),
        ];

        assert!(matches!(
            reconcile(&records, rows, 2, "Id"),
            Err(BulkOperationError::Reconciliation(_))
        ));
        assert_eq!(records, people());
    }
}
