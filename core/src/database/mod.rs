pub mod connection;
pub mod data_table;
pub mod mssql;
pub mod sql_type_wrapper;

#[cfg(test)]
pub(crate) mod testing;
