//! SQLite backend driver on top of `rusqlite`.
//!
//! `:memory:` databases are private to each connection, which makes
//! connection reuse directly observable.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard},
};

use rusqlite::{
    params_from_iter,
    types::{Value as SqlValue, ValueRef},
};

use crate::{
    driver::{
        self, Connection, Context, Driver, DriverError, DuplicateDriver, QueryResult, Rows,
        Statement, Transaction,
    },
    value::Value,
};

pub const DRIVER_NAME: &str = "sqlite";

#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteDriver;

impl SqliteDriver {
    /// Registers the driver as `sqlite`.
    pub fn register() -> Result<(), DuplicateDriver> {
        driver::register_driver(DRIVER_NAME, Arc::new(Self))
    }
}

impl Driver for SqliteDriver {
    fn open(&self, dsn: &str) -> Result<Box<dyn Connection>, DriverError> {
        let conn = rusqlite::Connection::open(dsn).map_err(sqlite_error)?;
        tracing::trace!(dsn, "opened sqlite connection");
        Ok(Box::new(SqliteConnection {
            conn: Arc::new(Mutex::new(conn)),
        }))
    }
}

fn sqlite_error(err: rusqlite::Error) -> DriverError {
    DriverError::Message(format!("sqlite: {err}"))
}

type Shared = Arc<Mutex<rusqlite::Connection>>;

fn lock(conn: &Shared) -> MutexGuard<'_, rusqlite::Connection> {
    conn.lock().unwrap_or_else(|err| err.into_inner())
}

pub struct SqliteConnection {
    conn: Shared,
}

impl Connection for SqliteConnection {
    fn prepare(&mut self, query: &str) -> Result<Box<dyn Statement>, DriverError> {
        let num_input = {
            let conn = lock(&self.conn);
            let stmt = conn.prepare(query).map_err(sqlite_error)?;
            stmt.parameter_count()
        };
        Ok(Box::new(SqliteStatement {
            conn: Arc::clone(&self.conn),
            query: query.to_owned(),
            num_input: i64::try_from(num_input).unwrap_or(-1),
        }))
    }

    fn begin(&mut self) -> Result<Box<dyn Transaction>, DriverError> {
        lock(&self.conn)
            .execute_batch("BEGIN")
            .map_err(sqlite_error)?;
        Ok(Box::new(SqliteTransaction {
            conn: Arc::clone(&self.conn),
        }))
    }

    fn exec_context(
        &mut self,
        ctx: &Context,
        query: &str,
        args: &[Value],
    ) -> Result<Box<dyn QueryResult>, DriverError> {
        ctx.check()?;
        execute(&self.conn, query, args)
    }

    fn query_context(
        &mut self,
        ctx: &Context,
        query: &str,
        args: &[Value],
    ) -> Result<Box<dyn Rows>, DriverError> {
        ctx.check()?;
        select(&self.conn, query, args)
    }

    /// Refuses reuse while a transaction is still open on the connection.
    fn reset_session(&mut self, ctx: &Context) -> Result<(), DriverError> {
        ctx.check()?;
        if lock(&self.conn).is_autocommit() {
            Ok(())
        } else {
            Err(DriverError::BadConnection)
        }
    }

    fn close(&mut self) -> Result<(), DriverError> {
        Ok(())
    }
}

fn to_sql(value: &Value) -> Result<SqlValue, DriverError> {
    Ok(match value {
        Value::Nil => SqlValue::Null,
        Value::String(text) => SqlValue::Text(text.clone()),
        Value::Int(number) | Value::Int64(number) => SqlValue::Integer(*number),
        Value::Float64(number) => SqlValue::Real(*number),
        Value::Bool(flag) => SqlValue::Integer(i64::from(*flag)),
        Value::ByteList(bytes) => SqlValue::Blob(bytes.clone()),
        Value::Timestamp(timestamp) => SqlValue::Text(timestamp.to_rfc3339()),
        other => {
            return Err(DriverError::message(format!(
                "sqlite: unsupported argument type {}",
                other.kind_name()
            )));
        }
    })
}

fn from_sql(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Nil,
        ValueRef::Integer(number) => Value::Int64(number),
        ValueRef::Real(number) => Value::Float64(number),
        ValueRef::Text(text) => Value::String(String::from_utf8_lossy(text).into_owned()),
        ValueRef::Blob(bytes) => Value::ByteList(bytes.to_vec()),
    }
}

fn bind(args: &[Value]) -> Result<Vec<SqlValue>, DriverError> {
    args.iter().map(to_sql).collect()
}

fn execute(conn: &Shared, query: &str, args: &[Value]) -> Result<Box<dyn QueryResult>, DriverError> {
    let params = bind(args)?;
    let conn = lock(conn);
    let mut stmt = conn.prepare(query).map_err(sqlite_error)?;
    let rows_affected = stmt.execute(params_from_iter(params)).map_err(sqlite_error)?;
    Ok(Box::new(SqliteResult {
        last_insert_id: conn.last_insert_rowid(),
        rows_affected: i64::try_from(rows_affected).unwrap_or(i64::MAX),
    }))
}

/// Runs the query to completion; the connection lock is not held while the
/// caller iterates.
fn select(conn: &Shared, query: &str, args: &[Value]) -> Result<Box<dyn Rows>, DriverError> {
    let params = bind(args)?;
    let conn = lock(conn);
    let mut stmt = conn.prepare(query).map_err(sqlite_error)?;
    let columns: Vec<String> = stmt
        .column_names()
        .into_iter()
        .map(str::to_owned)
        .collect();
    let width = columns.len();

    let mut rows = stmt.query(params_from_iter(params)).map_err(sqlite_error)?;
    let mut buffered = VecDeque::new();
    while let Some(row) = rows.next().map_err(sqlite_error)? {
        let mut values = Vec::with_capacity(width);
        for index in 0..width {
            values.push(from_sql(row.get_ref(index).map_err(sqlite_error)?));
        }
        buffered.push_back(values);
    }

    Ok(Box::new(SqliteRows {
        columns,
        rows: buffered,
    }))
}

pub struct SqliteStatement {
    conn: Shared,
    query: String,
    num_input: i64,
}

impl Statement for SqliteStatement {
    fn num_input(&self) -> i64 {
        self.num_input
    }

    fn exec(&mut self, args: &[Value]) -> Result<Box<dyn QueryResult>, DriverError> {
        execute(&self.conn, &self.query, args)
    }

    fn query(&mut self, args: &[Value]) -> Result<Box<dyn Rows>, DriverError> {
        select(&self.conn, &self.query, args)
    }

    fn close(&mut self) -> Result<(), DriverError> {
        Ok(())
    }
}

pub struct SqliteRows {
    columns: Vec<String>,
    rows: VecDeque<Vec<Value>>,
}

impl Rows for SqliteRows {
    fn columns(&mut self) -> Vec<String> {
        self.columns.clone()
    }

    fn next(&mut self, dest: &mut [Value]) -> Result<(), DriverError> {
        let row = self.rows.pop_front().ok_or(DriverError::Eof)?;
        for (slot, value) in dest.iter_mut().zip(row) {
            *slot = value;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), DriverError> {
        self.rows.clear();
        Ok(())
    }
}

pub struct SqliteResult {
    last_insert_id: i64,
    rows_affected: i64,
}

impl QueryResult for SqliteResult {
    fn last_insert_id(&self) -> Result<i64, DriverError> {
        Ok(self.last_insert_id)
    }

    fn rows_affected(&self) -> Result<i64, DriverError> {
        Ok(self.rows_affected)
    }
}

pub struct SqliteTransaction {
    conn: Shared,
}

impl Transaction for SqliteTransaction {
    fn commit(&mut self) -> Result<(), DriverError> {
        lock(&self.conn)
            .execute_batch("COMMIT")
            .map_err(sqlite_error)
    }

    fn rollback(&mut self) -> Result<(), DriverError> {
        lock(&self.conn)
            .execute_batch("ROLLBACK")
            .map_err(sqlite_error)
    }
}
