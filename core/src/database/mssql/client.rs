use std::{
    collections::HashMap,
    env,
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use dotenv::dotenv;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use tiberius::{error::Error as TdsError, Client, Config, ToSql, TokenRow};
use tokio::{net::TcpStream, sync::Mutex, time::timeout};
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::{debug, error, warn};

use crate::database::{
    connection::{ConnectionError, DbRow, QueryParam, SqlConnection},
    data_table::{BulkCopySettings, DataTable},
    sql_type_wrapper::SqlValue,
};

pub fn connection_string() -> Result<String, env::VarError> {
    dotenv().ok();
    let connection = env::var("DATABASE_URL")?;
    Ok(connection)
}

#[derive(thiserror::Error, Debug)]
pub enum MssqlConnectionError {
    #[error("The database connection string is wrong please check your environment: {0}")]
    DatabaseConnectionConfigWrong(#[from] env::VarError),

    #[error("Could not parse connection string make sure it is an ADO.NET connection string: {0}")]
    CouldNotParseConnectionString(String),

    #[error("Can not connect to the database, check the connection string: {0}")]
    CanNotConnectToDatabase(String),

    #[error("Timed out connecting to the database")]
    ConnectTimeout,
}

type TdsClient = Client<Compat<TcpStream>>;

/// Matches string literals, bracketed identifiers and `@variables`, in that priority, so that
/// parameter names are only rewritten where they really are parameters.
static PARAMETER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"'(?:[^']|'')*'|\[(?:[^\]]|\]\])*\]|@@?[A-Za-z_][A-Za-z0-9_]*").unwrap()
});

/// Rewrites `@Name` parameters into the positional `@P1..@Pn` names the TDS driver binds,
/// returning the parameters in positional order. A name used twice binds once.
pub fn bind_named_params<'a>(sql: &str, params: &'a [QueryParam]) -> (String, Vec<&'a QueryParam>) {
    let by_name: HashMap<&str, &QueryParam> =
        params.iter().map(|param| (param.name.as_str(), param)).collect();
    let mut positions: HashMap<&str, usize> = HashMap::new();
    let mut ordered: Vec<&QueryParam> = Vec::new();

    let rewritten = PARAMETER_RE.replace_all(sql, |caps: &Captures| {
        let token = &caps[0];
        let name = match token.strip_prefix('@') {
            Some(name) if !name.starts_with('@') => name,
            _ => return token.to_string(),
        };

        match by_name.get_key_value(name) {
            Some((key, param)) => {
                let position = *positions.entry(key).or_insert_with(|| {
                    ordered.push(param);
                    ordered.len()
                });
                format!("@P{}", position)
            }
            None => token.to_string(),
        }
    });

    if ordered.len() < params.len() {
        debug!("{} parameters are not referenced by the statement", params.len() - ordered.len());
    }

    (rewritten.into_owned(), ordered)
}

fn map_tds_error(e: TdsError) -> ConnectionError {
    match e {
        TdsError::Server(token) => {
            ConnectionError::Server { code: token.code(), message: token.message().to_string() }
        }
        other => ConnectionError::Driver(other.to_string()),
    }
}

async fn open_client(config: Config) -> Result<TdsClient, TdsError> {
    let tcp = TcpStream::connect(config.get_addr()).await?;
    tcp.set_nodelay(true)?;

    match Client::connect(config.clone(), tcp.compat_write()).await {
        Ok(client) => Ok(client),
        // Azure SQL redirects to the node actually serving the database
        Err(TdsError::Routing { host, port }) => {
            let mut config = config;
            config.host(&host);
            config.port(port);

            let tcp = TcpStream::connect(config.get_addr()).await?;
            tcp.set_nodelay(true)?;
            Client::connect(config, tcp.compat_write()).await
        }
        Err(e) => Err(e),
    }
}

/// A single SQL Server connection.
///
/// Bulk operations need one session for their whole lifetime (temp tables and the transaction
/// live on it), so this deliberately wraps one connection instead of a pool.
pub struct MssqlClient {
    client: Mutex<TdsClient>,
    open: AtomicBool,
}

impl MssqlClient {
    /// Connects using the `DATABASE_URL` environment variable.
    pub async fn new() -> Result<Self, MssqlConnectionError> {
        let connection_str = connection_string()?;
        let config = Config::from_ado_string(&connection_str)
            .map_err(|e| MssqlConnectionError::CouldNotParseConnectionString(e.to_string()))?;

        Self::connect(config).await
    }

    pub async fn connect(config: Config) -> Result<Self, MssqlConnectionError> {
        let mut client = match timeout(Duration::from_millis(5000), open_client(config)).await {
            Ok(Ok(client)) => client,
            Ok(Err(e)) => {
                error!("Error connecting to database: {}", e);
                return Err(MssqlConnectionError::CanNotConnectToDatabase(e.to_string()));
            }
            Err(_) => {
                error!("Timeout connecting to database");
                return Err(MssqlConnectionError::ConnectTimeout);
            }
        };

        // Perform a simple query to check the connection
        let check = match client.simple_query("SELECT 1").await {
            Ok(stream) => stream.into_row().await.map(|_| ()),
            Err(e) => Err(e),
        };
        if let Err(e) = check {
            return Err(MssqlConnectionError::CanNotConnectToDatabase(e.to_string()));
        }

        Ok(MssqlClient { client: Mutex::new(client), open: AtomicBool::new(true) })
    }

    pub async fn close(self) -> Result<(), ConnectionError> {
        self.open.store(false, Ordering::SeqCst);
        self.client.into_inner().close().await.map_err(map_tds_error)
    }

    fn track(&self, e: TdsError) -> ConnectionError {
        if matches!(e, TdsError::Io { .. }) {
            self.open.store(false, Ordering::SeqCst);
        }
        map_tds_error(e)
    }
}

#[async_trait]
impl SqlConnection for MssqlClient {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn batch_execute(&self, sql: &str) -> Result<(), ConnectionError> {
        let mut client = self.client.lock().await;
        let stream = client.simple_query(sql).await.map_err(|e| self.track(e))?;
        stream.into_results().await.map_err(|e| self.track(e))?;
        Ok(())
    }

    async fn execute(&self, sql: &str, params: &[QueryParam]) -> Result<u64, ConnectionError> {
        let (sql, ordered) = bind_named_params(sql, params);
        let bound: Vec<&dyn ToSql> = ordered.iter().map(|p| *p as &dyn ToSql).collect();

        let mut client = self.client.lock().await;
        let result = client.execute(sql, &bound).await.map_err(|e| self.track(e))?;
        Ok(result.total())
    }

    async fn query(&self, sql: &str, params: &[QueryParam]) -> Result<Vec<DbRow>, ConnectionError> {
        let (sql, ordered) = bind_named_params(sql, params);
        let bound: Vec<&dyn ToSql> = ordered.iter().map(|p| *p as &dyn ToSql).collect();

        let mut client = self.client.lock().await;
        let stream = client.query(sql, &bound).await.map_err(|e| self.track(e))?;
        let rows = stream.into_first_result().await.map_err(|e| self.track(e))?;

        rows.into_iter()
            .map(|row| {
                let values = row
                    .into_iter()
                    .map(|data| SqlValue::from_column_data(&data))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(DbRow::new(values))
            })
            .collect()
    }

    async fn bulk_copy(
        &self,
        table: &str,
        data: &DataTable,
        settings: &BulkCopySettings,
    ) -> Result<u64, ConnectionError> {
        if data.is_empty() {
            return Ok(0);
        }

        if settings.table_lock || settings.check_constraints {
            warn!("table_lock and check_constraints are not sent by the TDS bulk load, ignoring");
        }

        let batch_size = if settings.batch_size == 0 { data.len() } else { settings.batch_size };
        let mut client = self.client.lock().await;
        let mut total = 0;

        for chunk in data.rows.chunks(batch_size) {
            let mut request = client.bulk_insert(table).await.map_err(map_tds_error)?;

            for row in chunk {
                let mut token_row = TokenRow::new();
                for (value, column) in row.iter().zip(&data.columns) {
                    token_row.push(value.to_column_data(column.null_kind));
                }
                request.send(token_row).await.map_err(map_tds_error)?;
            }

            let result = request.finalize().await.map_err(map_tds_error)?;
            total += result.total();
        }

        debug!("Bulk copied {} rows into {}", total, table);

        Ok(total)
    }

    async fn begin_transaction(&self) -> Result<(), ConnectionError> {
        self.batch_execute("BEGIN TRANSACTION").await
    }

    async fn commit_transaction(&self) -> Result<(), ConnectionError> {
        self.batch_execute("COMMIT TRANSACTION").await
    }

    async fn rollback_transaction(&self) -> Result<(), ConnectionError> {
        self.batch_execute("IF @@TRANCOUNT > 0 ROLLBACK TRANSACTION").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_named_params_in_order_of_use() {
        let params = vec![
            QueryParam::new("Second", 2),
            QueryParam::new("First", 1),
        ];

        let (sql, ordered) =
            bind_named_params("SELECT * FROM t WHERE a = @First AND b = @Second", &params);

        assert_eq!(sql, "SELECT * FROM t WHERE a = @P1 AND b = @P2");
        assert_eq!(ordered[0].value, SqlValue::I32(1));
        assert_eq!(ordered[1].value, SqlValue::I32(2));
    }

    #[test]
    fn test_bind_named_params_reuses_position() {
        let params = vec![QueryParam::new("v", "x")];
        let (sql, ordered) = bind_named_params("@v = @v", &params);

        assert_eq!(sql, "@P1 = @P1");
        assert_eq!(ordered.len(), 1);
    }

    #[test]
    fn test_bind_named_params_skips_literals_identifiers_and_globals() {
        let params = vec![QueryParam::new("Age", 3)];
        let (sql, ordered) = bind_named_params(
            "SELECT '@Age', [@Age], @@ROWCOUNT, @Unknown FROM t WHERE [Age] > @Age",
            &params,
        );

        assert_eq!(sql, "SELECT '@Age', [@Age], @@ROWCOUNT, @Unknown FROM t WHERE [Age] > @P1");
        assert_eq!(ordered.len(), 1);
    }

    #[test]
    fn test_bind_named_params_does_not_match_prefixes() {
        let params = vec![QueryParam::new("v1", 1), QueryParam::new("v10", 10)];
        let (sql, ordered) = bind_named_params("(@v10, @v1)", &params);

        assert_eq!(sql, "(@P1, @P2)");
        assert_eq!(ordered[0].value, SqlValue::I32(10));
    }
}
