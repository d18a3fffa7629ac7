use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Context, Result};
use bulkmerge::{connection_string, impl_record, MssqlClient, SqlConnection};
use tracing::info;

use crate::tests::test_runner::SkipTest;

static TABLE_COUNTER: AtomicUsize = AtomicUsize::new(0);

#[derive(Debug, Clone, PartialEq)]
pub struct Person {
    pub id: i32,
    pub name: String,
    pub age: Option<i32>,
}

impl_record!(Person { id => "Id", name => "Name", age => "Age" });

impl Person {
    /// A person the server has not seen yet.
    pub fn new(name: &str, age: Option<i32>) -> Self {
        Self { id: 0, name: name.to_string(), age }
    }

    pub fn existing(id: i32, name: &str, age: Option<i32>) -> Self {
        Self { id, name: name.to_string(), age }
    }
}

fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Shared context for all tests: one open connection plus the tables the test created.
pub struct TestContext {
    pub client: MssqlClient,
    pub schema: String,
    tables: Vec<String>,
}

impl TestContext {
    pub async fn new(schema: &str) -> Result<Self> {
        if connection_string().is_err() {
            return Err(SkipTest("DATABASE_URL is not set".to_string()).into());
        }

        let client = MssqlClient::new().await.context("Could not connect to SQL Server")?;

        Ok(Self { client, schema: schema.to_string(), tables: Vec::new() })
    }

    pub fn full_name(&self, table: &str) -> String {
        format!("[{}].[{}]", self.schema, table)
    }

    /// Creates an empty `Person` table with a unique name, identities starting at `identity_seed`.
    pub async fn create_person_table(&mut self, identity_seed: i32) -> Result<String> {
        let table = format!(
            "Person_{}_{}",
            std::process::id(),
            TABLE_COUNTER.fetch_add(1, Ordering::SeqCst)
        );

        let ddl = format!(
            "CREATE TABLE {} (\
                [Id] int IDENTITY({}, 1) NOT NULL PRIMARY KEY, \
                [Name] nvarchar(50) COLLATE SQL_Latin1_General_CP1_CI_AS NOT NULL, \
                [Age] int NULL\
            );",
            self.full_name(&table),
            identity_seed
        );

        self.client.batch_execute(&ddl).await.context("Could not create the Person table")?;
        self.tables.push(table.clone());

        info!("Created {}", self.full_name(&table));
        Ok(table)
    }

    /// Inserts rows with explicit ids.
    pub async fn seed(&self, table: &str, people: &[Person]) -> Result<()> {
        let full_name = self.full_name(table);
        let values: Vec<String> = people
            .iter()
            .map(|p| {
                let age = p.age.map(|a| a.to_string()).unwrap_or_else(|| "NULL".to_string());
                format!("({}, {}, {})", p.id, quote(&p.name), age)
            })
            .collect();

        let sql = format!(
            "SET IDENTITY_INSERT {0} ON; \
             INSERT INTO {0} ([Id], [Name], [Age]) VALUES {1}; \
             SET IDENTITY_INSERT {0} OFF;",
            full_name,
            values.join(", ")
        );

        self.client.batch_execute(&sql).await.context("Could not seed the Person table")?;
        Ok(())
    }

    /// Every row of the table, ordered by id.
    pub async fn fetch_people(&self, table: &str) -> Result<Vec<Person>> {
        let sql =
            format!("SELECT [Id], [Name], [Age] FROM {} ORDER BY [Id]", self.full_name(table));
        let rows = self.client.query(&sql, &[]).await?;

        rows.iter()
            .map(|row| {
                let id = row.get_i64(0).context("Id is missing")?;
                Ok(Person {
                    id: i32::try_from(id)?,
                    name: row.get_string(1).context("Name is missing")?,
                    age: row.get_i64(2).map(i32::try_from).transpose()?,
                })
            })
            .collect()
    }

    pub async fn cleanup(&mut self) -> Result<()> {
        for table in std::mem::take(&mut self.tables) {
            let sql = format!("DROP TABLE IF EXISTS {};", self.full_name(&table));
            self.client.batch_execute(&sql).await?;
        }
        Ok(())
    }
}
