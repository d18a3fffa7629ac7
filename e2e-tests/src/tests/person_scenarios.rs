use anyhow::{anyhow, ensure, Result};
use bulkmerge::{source, target, BulkOperation, BulkOperationError, ColumnDirection};
use std::future::Future;
use std::pin::Pin;
use tracing::info;

use crate::test_suite::{Person, TestContext};
use crate::tests::registry::{TestDefinition, TestModule};

pub struct PersonScenarioTests;

impl TestModule for PersonScenarioTests {
    fn get_tests() -> Vec<TestDefinition> {
        vec![
            TestDefinition::new(
                "test_upsert_identity_output",
                "Insert or update writes generated identities back onto new records",
                upsert_identity_output_test,
            ),
            TestDefinition::new(
                "test_exclude_column_from_update",
                "Excluded columns keep their target value on update",
                exclude_column_from_update_test,
            ),
            TestDefinition::new(
                "test_delete_when_not_matched",
                "Target rows missing from the records are deleted",
                delete_when_not_matched_test,
            ),
            TestDefinition::new(
                "test_update_when",
                "Update conditions restrict which matched rows are updated",
                update_when_test,
            ),
            TestDefinition::new(
                "test_configuration_error",
                "Configuration errors leave the target untouched",
                configuration_error_test,
            )
            .with_timeout(30),
        ]
    }
}

fn upsert_identity_output_test(
    context: &mut TestContext,
) -> Pin<Box<dyn Future<Output = Result<()>> + '_>> {
    Box::pin(async move {
        // Identities continue after the highest explicit value
        let table = context.create_person_table(1).await?;
        context.seed(&table, &[Person::existing(100, "Alan", Some(40))]).await?;

        let mut people = vec![
            Person::new("Ada", Some(36)),
            Person::new("Grace", None),
            Person::existing(100, "Alan", Some(41)),
        ];

        let affected = BulkOperation::<Person>::setup()
            .with_table(&table)
            .with_schema(&context.schema)
            .add_all_columns()
            .bulk_insert_or_update()
            .match_target_on("Id")
            .set_identity_column("Id", ColumnDirection::Output)
            .commit(&context.client, &mut people)
            .await?;

        ensure!(affected == 3, "expected 3 affected rows, got {}", affected);

        let mut new_ids = vec![people[0].id, people[1].id];
        new_ids.sort();
        ensure!(new_ids == vec![101, 102], "unexpected identities {:?}", new_ids);
        ensure!(people[2].id == 100, "updated record changed its id to {}", people[2].id);

        let stored = context.fetch_people(&table).await?;
        ensure!(stored.len() == 3, "expected 3 rows, found {}", stored.len());
        ensure!(stored[0] == Person::existing(100, "Alan", Some(41)), "Alan was not updated");

        info!("✓ identities written back: {:?}", people.iter().map(|p| p.id).collect::<Vec<_>>());
        Ok(())
    })
}

fn exclude_column_from_update_test(
    context: &mut TestContext,
) -> Pin<Box<dyn Future<Output = Result<()>> + '_>> {
    Box::pin(async move {
        let table = context.create_person_table(1).await?;
        context.seed(&table, &[Person::existing(1, "Alan", Some(40))]).await?;

        let mut people = vec![Person::existing(1, "Alan Turing", Some(99))];

        BulkOperation::<Person>::setup()
            .with_table(&table)
            .with_schema(&context.schema)
            .add_all_columns()
            .bulk_insert_or_update()
            .match_target_on("Id")
            .exclude_column_from_update("Age")
            .commit(&context.client, &mut people)
            .await?;

        let stored = context.fetch_people(&table).await?;
        ensure!(
            stored == vec![Person::existing(1, "Alan Turing", Some(40))],
            "unexpected rows {:?}",
            stored
        );
        Ok(())
    })
}

fn delete_when_not_matched_test(
    context: &mut TestContext,
) -> Pin<Box<dyn Future<Output = Result<()>> + '_>> {
    Box::pin(async move {
        let table = context.create_person_table(10).await?;
        context
            .seed(
                &table,
                &[
                    Person::existing(1, "Alan", Some(40)),
                    Person::existing(2, "Ada", Some(36)),
                    Person::existing(3, "Grace", None),
                ],
            )
            .await?;

        let mut people =
            vec![Person::existing(1, "Alan", Some(41)), Person::existing(2, "Ada", Some(37))];

        let affected = BulkOperation::<Person>::setup()
            .with_table(&table)
            .with_schema(&context.schema)
            .add_all_columns()
            .bulk_insert_or_update()
            .match_target_on("Id")
            .delete_when_not_matched(true)
            .commit(&context.client, &mut people)
            .await?;

        ensure!(affected == 3, "expected 2 updates and 1 delete, got {} rows", affected);

        let stored = context.fetch_people(&table).await?;
        ensure!(stored == people, "unexpected rows {:?}", stored);
        Ok(())
    })
}

fn update_when_test(context: &mut TestContext) -> Pin<Box<dyn Future<Output = Result<()>> + '_>> {
    Box::pin(async move {
        let table = context.create_person_table(1).await?;
        context
            .seed(
                &table,
                &[Person::existing(1, "Alan", Some(40)), Person::existing(2, "Ada", Some(36))],
            )
            .await?;

        // Ages only ever go up
        let mut people =
            vec![Person::existing(1, "Alan", Some(41)), Person::existing(2, "Ada", Some(20))];

        let affected = BulkOperation::<Person>::setup()
            .with_table(&table)
            .with_schema(&context.schema)
            .add_all_columns()
            .bulk_update()
            .match_target_on("Id")
            .update_when(target("Age").less_than_column(source("Age")))
            .commit(&context.client, &mut people)
            .await?;

        ensure!(affected == 1, "expected 1 updated row, got {}", affected);

        let stored = context.fetch_people(&table).await?;
        ensure!(
            stored[0].age == Some(41) && stored[1].age == Some(36),
            "unexpected rows {:?}",
            stored
        );
        Ok(())
    })
}

fn configuration_error_test(
    context: &mut TestContext,
) -> Pin<Box<dyn Future<Output = Result<()>> + '_>> {
    Box::pin(async move {
        let table = context.create_person_table(1).await?;
        let mut people = vec![Person::new("Ada", Some(36))];

        let result = BulkOperation::<Person>::setup()
            .with_table(&table)
            .with_schema(&context.schema)
            .add_all_columns()
            .bulk_insert_or_update()
            .exclude_all_columns_from_update()
            .exclude_all_columns_from_update()
            .commit(&context.client, &mut people)
            .await;

        match result {
            Err(BulkOperationError::Configuration(message)) => info!("✓ rejected: {}", message),
            other => return Err(anyhow!("expected a configuration error, got {:?}", other)),
        }

        ensure!(context.fetch_people(&table).await?.is_empty(), "rows were written");
        Ok(())
    })
}
