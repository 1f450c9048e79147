//! A small connection-pooling client over the driver surface, behaving the
//! way application code sees a database handle.

use std::{
    fmt,
    marker::PhantomData,
    sync::{Arc, Mutex},
};

use crate::{
    driver::{self, Connection, Context, Driver, DriverError, QueryResult, Statement, Transaction},
    value::Value,
};

pub const DEFAULT_MAX_IDLE: usize = 2;

pub struct Database {
    driver_name: String,
    driver: Arc<dyn Driver>,
    dsn: String,
    idle: Mutex<Vec<Box<dyn Connection>>>,
    max_idle: usize,
}

impl Database {
    /// Looks up `driver_name`; no connection is made until the first call.
    pub fn open(driver_name: &str, dsn: &str) -> Result<Self, DriverError> {
        let driver = driver::lookup_driver(driver_name).ok_or_else(|| {
            DriverError::message(format!(
                "sql: unknown driver \"{driver_name}\" (forgotten register?)"
            ))
        })?;
        Ok(Self {
            driver_name: driver_name.to_owned(),
            driver,
            dsn: dsn.to_owned(),
            idle: Mutex::new(Vec::new()),
            max_idle: DEFAULT_MAX_IDLE,
        })
    }

    pub fn with_max_idle(mut self, max_idle: usize) -> Self {
        self.max_idle = max_idle;
        self
    }

    pub fn driver_name(&self) -> &str {
        &self.driver_name
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().unwrap_or_else(|err| err.into_inner()).len()
    }

    fn acquire(&self, ctx: &Context) -> Result<Box<dyn Connection>, DriverError> {
        loop {
            let conn = self.idle.lock().unwrap_or_else(|err| err.into_inner()).pop();
            let Some(mut conn) = conn else {
                break;
            };
            match conn.reset_session(ctx) {
                Ok(()) => return Ok(conn),
                Err(err) => {
                    tracing::trace!(driver = %self.driver_name, error = %err, "discarding idle connection");
                    close_quietly(conn);
                }
            }
        }
        ctx.check()?;
        self.driver.open(&self.dsn)
    }

    fn release(&self, conn: Box<dyn Connection>, err: Option<&DriverError>) {
        if matches!(err, Some(DriverError::BadConnection)) {
            close_quietly(conn);
            return;
        }
        let mut idle = self.idle.lock().unwrap_or_else(|err| err.into_inner());
        if idle.len() < self.max_idle {
            idle.push(conn);
        } else {
            drop(idle);
            close_quietly(conn);
        }
    }

    pub fn query(&self, query: &str, args: &[Value]) -> Result<Rows<'_>, DriverError> {
        self.query_context(&Context::background(), query, args)
    }

    pub fn query_context(
        &self,
        ctx: &Context,
        query: &str,
        args: &[Value],
    ) -> Result<Rows<'_>, DriverError> {
        let mut conn = self.acquire(ctx)?;
        match query_on(conn.as_mut(), ctx, query, args) {
            Ok((stmt, rows)) => Ok(Rows::new(Some((self, conn)), stmt, rows)),
            Err(err) => {
                self.release(conn, Some(&err));
                Err(err)
            }
        }
    }

    /// Runs `query` and reads the first row.
    pub fn query_row(&self, query: &str, args: &[Value]) -> Result<Option<Vec<Value>>, DriverError> {
        let mut rows = self.query(query, args)?;
        let row = if rows.next()? {
            Some(rows.values().to_vec())
        } else {
            None
        };
        rows.close()?;
        Ok(row)
    }

    pub fn exec(&self, query: &str, args: &[Value]) -> Result<ExecResult, DriverError> {
        self.exec_context(&Context::background(), query, args)
    }

    pub fn exec_context(
        &self,
        ctx: &Context,
        query: &str,
        args: &[Value],
    ) -> Result<ExecResult, DriverError> {
        let mut conn = self.acquire(ctx)?;
        let result = exec_on(conn.as_mut(), ctx, query, args);
        self.release(conn, result.as_ref().err());
        result
    }

    pub fn begin(&self) -> Result<Tx<'_>, DriverError> {
        self.begin_context(&Context::background())
    }

    pub fn begin_context(&self, ctx: &Context) -> Result<Tx<'_>, DriverError> {
        let mut conn = self.acquire(ctx)?;
        match conn.begin_context(ctx) {
            Ok(tx) => Ok(Tx {
                db: self,
                ctx: ctx.clone(),
                conn: Some(conn),
                tx: Some(tx),
            }),
            Err(err) => {
                self.release(conn, Some(&err));
                Err(err)
            }
        }
    }

    /// Closes every idle connection. Connections still in use are closed
    /// when they are released.
    pub fn close(&self) -> Result<(), DriverError> {
        let idle: Vec<_> = self
            .idle
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .drain(..)
            .collect();
        let mut first_err = None;
        for mut conn in idle {
            if let Err(err) = conn.close() {
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            tracing::warn!(driver = %self.driver_name, error = %err, "closing idle connections failed");
        }
    }
}

fn close_quietly(mut conn: Box<dyn Connection>) {
    if let Err(err) = conn.close() {
        tracing::debug!(error = %err, "closing connection failed");
    }
}

fn check_arg_count(stmt: &dyn Statement, args: &[Value]) -> Result<(), DriverError> {
    let want = stmt.num_input();
    if want >= 0 && want as usize != args.len() {
        return Err(DriverError::message(format!(
            "sql: expected {want} arguments, got {}",
            args.len()
        )));
    }
    Ok(())
}

/// Direct query when the connection supports it, prepared statement
/// otherwise.
fn query_on(
    conn: &mut dyn Connection,
    ctx: &Context,
    query: &str,
    args: &[Value],
) -> Result<(Option<Box<dyn Statement>>, Box<dyn driver::Rows>), DriverError> {
    match conn.query_context(ctx, query, args) {
        Ok(rows) => return Ok((None, rows)),
        Err(DriverError::Skip) => {}
        Err(err) => return Err(err),
    }

    let mut stmt = conn.prepare_context(ctx, query)?;
    let rows = check_arg_count(stmt.as_ref(), args).and_then(|()| stmt.query_context(ctx, args));
    match rows {
        Ok(rows) => Ok((Some(stmt), rows)),
        Err(err) => {
            let _ = stmt.close();
            Err(err)
        }
    }
}

fn exec_on(
    conn: &mut dyn Connection,
    ctx: &Context,
    query: &str,
    args: &[Value],
) -> Result<ExecResult, DriverError> {
    match conn.exec_context(ctx, query, args) {
        Ok(result) => return Ok(ExecResult { inner: result }),
        Err(DriverError::Skip) => {}
        Err(err) => return Err(err),
    }

    let mut stmt = conn.prepare_context(ctx, query)?;
    let result = check_arg_count(stmt.as_ref(), args).and_then(|()| stmt.exec_context(ctx, args));
    let closed = stmt.close();
    let inner = result?;
    closed?;
    Ok(ExecResult { inner })
}

pub struct ExecResult {
    inner: Box<dyn QueryResult>,
}

impl ExecResult {
    pub fn last_insert_id(&self) -> Result<i64, DriverError> {
        self.inner.last_insert_id()
    }

    pub fn rows_affected(&self) -> Result<i64, DriverError> {
        self.inner.rows_affected()
    }
}

impl fmt::Debug for ExecResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecResult")
            .field("last_insert_id", &self.inner.last_insert_id().ok())
            .field("rows_affected", &self.inner.rows_affected().ok())
            .finish()
    }
}

/// Result set cursor.
///
/// Column names are fetched once, before the first row. The connection goes
/// back to the pool when the rows are exhausted, closed or dropped.
pub struct Rows<'a> {
    owner: Option<(&'a Database, Box<dyn Connection>)>,
    stmt: Option<Box<dyn Statement>>,
    rows: Option<Box<dyn driver::Rows>>,
    columns: Option<Vec<String>>,
    current: Vec<Value>,
    _borrow: PhantomData<&'a mut ()>,
}

impl<'a> Rows<'a> {
    fn new(
        owner: Option<(&'a Database, Box<dyn Connection>)>,
        stmt: Option<Box<dyn Statement>>,
        rows: Box<dyn driver::Rows>,
    ) -> Self {
        Self {
            owner,
            stmt,
            rows: Some(rows),
            columns: None,
            current: Vec::new(),
            _borrow: PhantomData,
        }
    }

    pub fn columns(&mut self) -> &[String] {
        if self.columns.is_none() {
            let columns = self
                .rows
                .as_deref_mut()
                .map(|rows| rows.columns())
                .unwrap_or_default();
            self.columns = Some(columns);
        }
        self.columns.as_deref().unwrap_or_default()
    }

    /// Advances to the next row. Returns `false` once the rows are
    /// exhausted, after which the cursor is closed.
    pub fn next(&mut self) -> Result<bool, DriverError> {
        if self.rows.is_none() {
            return Ok(false);
        }
        let width = self.columns().len();
        let mut row = vec![Value::Nil; width];
        let Some(rows) = self.rows.as_deref_mut() else {
            return Ok(false);
        };
        match rows.next(&mut row) {
            Ok(()) => {
                self.current = row;
                Ok(true)
            }
            Err(DriverError::Eof) => {
                self.current.clear();
                self.finish(None)?;
                Ok(false)
            }
            Err(err) => {
                self.current.clear();
                // The fetch error is what the caller needs to see.
                let _ = self.finish(Some(&err));
                Err(err)
            }
        }
    }

    /// Values of the current row.
    pub fn values(&self) -> &[Value] {
        &self.current
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.current.get(index)
    }

    pub fn close(mut self) -> Result<(), DriverError> {
        self.finish(None)
    }

    fn finish(&mut self, err: Option<&DriverError>) -> Result<(), DriverError> {
        let mut result = Ok(());
        if let Some(mut rows) = self.rows.take() {
            result = rows.close();
        }
        if let Some(mut stmt) = self.stmt.take() {
            let closed = stmt.close();
            result = result.and(closed);
        }
        if let Some((db, conn)) = self.owner.take() {
            db.release(conn, err);
        }
        result
    }
}

impl Drop for Rows<'_> {
    fn drop(&mut self) {
        let _ = self.finish(None);
    }
}

/// A transaction pinned to one connection. Dropping it without committing
/// rolls it back.
pub struct Tx<'db> {
    db: &'db Database,
    ctx: Context,
    conn: Option<Box<dyn Connection>>,
    tx: Option<Box<dyn Transaction>>,
}

impl Tx<'_> {
    fn conn(&mut self) -> Result<&mut (dyn Connection + 'static), DriverError> {
        self.conn
            .as_deref_mut()
            .ok_or_else(|| DriverError::message("sql: transaction has already been committed or rolled back"))
    }

    pub fn query(&mut self, query: &str, args: &[Value]) -> Result<Rows<'_>, DriverError> {
        let ctx = self.ctx.clone();
        let (stmt, rows) = query_on(self.conn()?, &ctx, query, args)?;
        Ok(Rows::new(None, stmt, rows))
    }

    pub fn exec(&mut self, query: &str, args: &[Value]) -> Result<ExecResult, DriverError> {
        let ctx = self.ctx.clone();
        exec_on(self.conn()?, &ctx, query, args)
    }

    pub fn commit(mut self) -> Result<(), DriverError> {
        self.finish(true)
    }

    pub fn rollback(mut self) -> Result<(), DriverError> {
        self.finish(false)
    }

    fn finish(&mut self, commit: bool) -> Result<(), DriverError> {
        let Some(mut tx) = self.tx.take() else {
            return Ok(());
        };
        let result = if commit { tx.commit() } else { tx.rollback() };
        if let Some(conn) = self.conn.take() {
            self.db.release(conn, result.as_ref().err());
        }
        result
    }
}

impl Drop for Tx<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.finish(false) {
            tracing::debug!(error = %err, "rolling back dropped transaction failed");
        }
    }
}
