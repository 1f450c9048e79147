//! Driver-surface wrappers that record calls to a backend or replay them.
//!
//! Each wrapper holds its backend object only when it was created in
//! recording mode; playback wrappers never touch a backend.

use std::sync::{Arc, Mutex, MutexGuard};

use crate::{
    driver::{
        Connection, Context, Driver, DriverError, QueryResult, Rows, Statement, Transaction,
        error_value, lookup_driver,
    },
    mode::Mode,
    record::{CallKind, Record},
    session::{self, SessionError},
    value::Value,
};

/// The proxy registered as `sqlreplay_<backend>`.
///
/// Callers above the proxy are told every connection is unusable for their
/// own pooling (see [`ProxyConnection::reset_session`]), so they close it
/// instead. The proxy keeps the most recently closed connection in a single
/// slot and hands it back on the next open for the same data source, within
/// the same session only.
pub struct ProxyDriver {
    backend_name: String,
    slot: Arc<Mutex<PoolSlot>>,
}

#[derive(Default)]
struct PoolSlot {
    pooled: Option<ConnectionState>,
    // Bumped whenever a session starts or ends; connections tagged with an
    // older value are never pooled.
    session_id: u64,
}

struct ConnectionState {
    backend: Option<Box<dyn Connection>>,
    dsn: String,
    session_id: u64,
}

impl ProxyDriver {
    pub fn new(backend_name: impl Into<String>) -> Self {
        Self {
            backend_name: backend_name.into(),
            slot: Arc::default(),
        }
    }

    pub fn backend_name(&self) -> &str {
        &self.backend_name
    }

    fn slot(&self) -> MutexGuard<'_, PoolSlot> {
        lock_slot(&self.slot)
    }

    fn try_reuse_connection(&self, dsn: &str) -> Option<ConnectionState> {
        let mut slot = self.slot();
        if slot.pooled.as_ref().is_some_and(|pooled| pooled.dsn == dsn) {
            tracing::debug!(driver = %self.backend_name, "reusing pooled connection");
            return slot.pooled.take();
        }
        None
    }

    /// Closes any pooled connection and starts a new pooling generation.
    pub fn clear_pooled_connection(&self) {
        let pooled = {
            let mut slot = self.slot();
            slot.session_id += 1;
            slot.pooled.take()
        };
        if let Some(mut backend) = pooled.and_then(|state| state.backend) {
            if let Err(err) = backend.close() {
                tracing::warn!(driver = %self.backend_name, error = %err, "closing pooled connection failed");
            }
        }
    }

    fn connection(&self, state: ConnectionState) -> Box<dyn Connection> {
        Box::new(ProxyConnection {
            slot: Arc::clone(&self.slot),
            backend_name: self.backend_name.clone(),
            state: Some(state),
        })
    }
}

fn lock_slot(slot: &Mutex<PoolSlot>) -> MutexGuard<'_, PoolSlot> {
    slot.lock().unwrap_or_else(|err| err.into_inner())
}

impl Driver for ProxyDriver {
    fn open(&self, dsn: &str) -> Result<Box<dyn Connection>, DriverError> {
        let mode = session::active_mode()?;

        if let Some(state) = self.try_reuse_connection(dsn) {
            return Ok(self.connection(state));
        }
        let session_id = self.slot().session_id;

        match mode {
            Mode::Recording => {
                let backend = lookup_driver(&self.backend_name).ok_or_else(|| {
                    session::report_error(SessionError::UnknownDriver(self.backend_name.clone()))
                })?;
                let result = backend.open(dsn);
                session::append_record(Record::new(CallKind::DriverOpen, vec![error_value(&result)]))?;
                Ok(self.connection(ConnectionState {
                    backend: Some(result?),
                    dsn: dsn.to_owned(),
                    session_id,
                }))
            }
            Mode::Playback => {
                let record = session::verify_record(CallKind::DriverOpen)?;
                recorded_error(&record, 0)?;
                Ok(self.connection(ConnectionState {
                    backend: None,
                    dsn: dsn.to_owned(),
                    session_id,
                }))
            }
        }
    }
}

/// Fails with the error stored at `index`, if there is one.
fn recorded_error(record: &Record, index: usize) -> Result<(), DriverError> {
    let recorded = record.error_at(index).map_err(|err| {
        DriverError::Session(session::report_error(SessionError::CorruptRecord(err)))
    })?;
    match recorded {
        Some(recorded) => Err(DriverError::from_recorded(recorded)),
        None => Ok(()),
    }
}

fn corrupt(err: crate::record::ArgumentShapeError) -> DriverError {
    DriverError::Session(session::report_error(SessionError::CorruptRecord(err)))
}

/// Backend object for a wrapper created in recording mode.
///
/// A wrapper whose backend is missing was created during playback and cannot
/// serve a recording session.
fn backend<T: ?Sized>(backend: &mut Option<Box<T>>) -> Result<&mut T, DriverError> {
    backend.as_deref_mut().ok_or(DriverError::BadConnection)
}

pub struct ProxyConnection {
    slot: Arc<Mutex<PoolSlot>>,
    backend_name: String,
    state: Option<ConnectionState>,
}

impl ProxyConnection {
    fn state(&mut self) -> Result<&mut ConnectionState, DriverError> {
        self.state
            .as_mut()
            .ok_or_else(|| DriverError::message("sql: connection is already closed"))
    }

    /// Keeps the connection for reuse if the slot is free, it belongs to the
    /// current session and its backend passes a health check.
    fn try_pool(&self, mut state: ConnectionState) -> Result<(), ConnectionState> {
        let mut slot = lock_slot(&self.slot);
        if slot.pooled.is_some() || slot.session_id != state.session_id {
            return Err(state);
        }
        if let Some(backend) = state.backend.as_deref_mut() {
            if backend.reset_session(&Context::background()).is_err() {
                return Err(state);
            }
        }
        tracing::debug!(driver = %self.backend_name, "pooled connection");
        slot.pooled = Some(state);
        Ok(())
    }
}

impl Connection for ProxyConnection {
    fn prepare(&mut self, query: &str) -> Result<Box<dyn Statement>, DriverError> {
        self.prepare_context(&Context::background(), query)
    }

    fn prepare_context(
        &mut self,
        ctx: &Context,
        query: &str,
    ) -> Result<Box<dyn Statement>, DriverError> {
        match session::active_mode()? {
            Mode::Recording => {
                let result = backend(&mut self.state()?.backend)?.prepare_context(ctx, query);
                session::append_record(Record::new(
                    CallKind::ConnPrepare,
                    vec![Value::from(query), error_value(&result)],
                ))?;
                Ok(Box::new(ProxyStatement {
                    backend: Some(result?),
                }))
            }
            Mode::Playback => {
                self.state()?;
                let record = session::verify_record_with_query(CallKind::ConnPrepare, query)?;
                recorded_error(&record, 1)?;
                Ok(Box::new(ProxyStatement { backend: None }))
            }
        }
    }

    fn begin(&mut self) -> Result<Box<dyn Transaction>, DriverError> {
        self.begin_context(&Context::background())
    }

    fn begin_context(&mut self, ctx: &Context) -> Result<Box<dyn Transaction>, DriverError> {
        match session::active_mode()? {
            Mode::Recording => {
                let result = backend(&mut self.state()?.backend)?.begin_context(ctx);
                session::append_record(Record::new(CallKind::ConnBegin, vec![error_value(&result)]))?;
                Ok(Box::new(ProxyTransaction {
                    backend: Some(result?),
                }))
            }
            Mode::Playback => {
                self.state()?;
                let record = session::verify_record(CallKind::ConnBegin)?;
                recorded_error(&record, 0)?;
                Ok(Box::new(ProxyTransaction { backend: None }))
            }
        }
    }

    fn exec_context(
        &mut self,
        ctx: &Context,
        query: &str,
        args: &[Value],
    ) -> Result<Box<dyn QueryResult>, DriverError> {
        match session::active_mode()? {
            Mode::Recording => {
                let result = backend(&mut self.state()?.backend)?.exec_context(ctx, query, args);
                session::append_record(Record::new(
                    CallKind::ConnExec,
                    vec![Value::from(query), error_value(&result)],
                ))?;
                Ok(Box::new(ProxyResult {
                    backend: Some(result?),
                }))
            }
            Mode::Playback => {
                self.state()?;
                let record = session::verify_record_with_query(CallKind::ConnExec, query)?;
                recorded_error(&record, 1)?;
                Ok(Box::new(ProxyResult { backend: None }))
            }
        }
    }

    fn query_context(
        &mut self,
        ctx: &Context,
        query: &str,
        args: &[Value],
    ) -> Result<Box<dyn Rows>, DriverError> {
        match session::active_mode()? {
            Mode::Recording => {
                let result = backend(&mut self.state()?.backend)?.query_context(ctx, query, args);
                session::append_record(Record::new(
                    CallKind::ConnQuery,
                    vec![Value::from(query), error_value(&result)],
                ))?;
                Ok(Box::new(ProxyRows {
                    backend: Some(result?),
                }))
            }
            Mode::Playback => {
                self.state()?;
                let record = session::verify_record_with_query(CallKind::ConnQuery, query)?;
                recorded_error(&record, 1)?;
                Ok(Box::new(ProxyRows { backend: None }))
            }
        }
    }

    /// Always refuses reuse so the caller closes the connection and the
    /// proxy decides about pooling.
    fn reset_session(&mut self, _ctx: &Context) -> Result<(), DriverError> {
        Err(DriverError::BadConnection)
    }

    fn close(&mut self) -> Result<(), DriverError> {
        let Some(state) = self.state.take() else {
            return Ok(());
        };
        match self.try_pool(state) {
            Ok(()) => Ok(()),
            Err(state) => match state.backend {
                Some(mut backend) => backend.close(),
                None => Ok(()),
            },
        }
    }
}

pub struct ProxyStatement {
    backend: Option<Box<dyn Statement>>,
}

impl Statement for ProxyStatement {
    fn num_input(&self) -> i64 {
        let mode = match session::active_mode() {
            Ok(mode) => mode,
            Err(_) => return -1,
        };
        match (mode, self.backend.as_deref()) {
            (Mode::Recording, Some(backend)) => {
                let num_input = backend.num_input();
                // A failed append is kept as the session's first error.
                let _ = session::append_record(Record::new(
                    CallKind::StmtNumInput,
                    vec![Value::Int(num_input)],
                ));
                num_input
            }
            (Mode::Recording, None) => -1,
            (Mode::Playback, _) => session::verify_record(CallKind::StmtNumInput)
                .ok()
                .and_then(|record| record.int_at(0).map_err(corrupt).ok())
                .unwrap_or(-1),
        }
    }

    fn exec(&mut self, args: &[Value]) -> Result<Box<dyn QueryResult>, DriverError> {
        self.exec_context(&Context::background(), args)
    }

    fn exec_context(
        &mut self,
        ctx: &Context,
        args: &[Value],
    ) -> Result<Box<dyn QueryResult>, DriverError> {
        match session::active_mode()? {
            Mode::Recording => {
                let result = backend(&mut self.backend)?.exec_context(ctx, args);
                session::append_record(Record::new(CallKind::StmtExec, vec![error_value(&result)]))?;
                Ok(Box::new(ProxyResult {
                    backend: Some(result?),
                }))
            }
            Mode::Playback => {
                let record = session::verify_record(CallKind::StmtExec)?;
                recorded_error(&record, 0)?;
                Ok(Box::new(ProxyResult { backend: None }))
            }
        }
    }

    fn query(&mut self, args: &[Value]) -> Result<Box<dyn Rows>, DriverError> {
        self.query_context(&Context::background(), args)
    }

    fn query_context(&mut self, ctx: &Context, args: &[Value]) -> Result<Box<dyn Rows>, DriverError> {
        match session::active_mode()? {
            Mode::Recording => {
                let result = backend(&mut self.backend)?.query_context(ctx, args);
                session::append_record(Record::new(CallKind::StmtQuery, vec![error_value(&result)]))?;
                Ok(Box::new(ProxyRows {
                    backend: Some(result?),
                }))
            }
            Mode::Playback => {
                let record = session::verify_record(CallKind::StmtQuery)?;
                recorded_error(&record, 0)?;
                Ok(Box::new(ProxyRows { backend: None }))
            }
        }
    }

    fn close(&mut self) -> Result<(), DriverError> {
        match self.backend.take() {
            Some(mut backend) => backend.close(),
            None => Ok(()),
        }
    }
}

pub struct ProxyRows {
    backend: Option<Box<dyn Rows>>,
}

impl Rows for ProxyRows {
    fn columns(&mut self) -> Vec<String> {
        let Ok(mode) = session::active_mode() else {
            return Vec::new();
        };
        match (mode, self.backend.as_deref_mut()) {
            (Mode::Recording, Some(backend)) => {
                let columns = backend.columns();
                // A failed append is kept as the session's first error.
                let _ = session::append_record(Record::new(
                    CallKind::RowsColumns,
                    vec![Value::StringList(columns.clone())],
                ));
                columns
            }
            (Mode::Recording, None) => Vec::new(),
            (Mode::Playback, _) => session::verify_record(CallKind::RowsColumns)
                .ok()
                .and_then(|record| record.string_list_at(0).map(<[String]>::to_vec).map_err(corrupt).ok())
                .unwrap_or_default(),
        }
    }

    fn next(&mut self, dest: &mut [Value]) -> Result<(), DriverError> {
        match session::active_mode()? {
            Mode::Recording => {
                let result = backend(&mut self.backend)?.next(dest);
                let row = match &result {
                    Ok(()) => dest.iter().map(Value::deep_copy).collect(),
                    Err(_) => Vec::new(),
                };
                session::append_record(Record::new(
                    CallKind::RowsNext,
                    vec![Value::ValueList(row), error_value(&result)],
                ))?;
                result
            }
            Mode::Playback => {
                let record = session::verify_record(CallKind::RowsNext)?;
                recorded_error(&record, 1)?;
                let row = record.value_list_at(0).map_err(corrupt)?;
                for (slot, value) in dest.iter_mut().zip(row) {
                    *slot = value.clone();
                }
                Ok(())
            }
        }
    }

    fn close(&mut self) -> Result<(), DriverError> {
        match self.backend.take() {
            Some(mut backend) => backend.close(),
            None => Ok(()),
        }
    }
}

pub struct ProxyResult {
    backend: Option<Box<dyn QueryResult>>,
}

impl ProxyResult {
    fn recorded_int64(&self, kind: CallKind) -> Result<i64, DriverError> {
        match session::active_mode()? {
            Mode::Recording => {
                let backend = self.backend.as_deref().ok_or(DriverError::BadConnection)?;
                let result = match kind {
                    CallKind::ResultLastInsertId => backend.last_insert_id(),
                    _ => backend.rows_affected(),
                };
                session::append_record(Record::new(
                    kind,
                    vec![
                        Value::Int64(*result.as_ref().unwrap_or(&0)),
                        error_value(&result),
                    ],
                ))?;
                result
            }
            Mode::Playback => {
                let record = session::verify_record(kind)?;
                recorded_error(&record, 1)?;
                record.int64_at(0).map_err(corrupt)
            }
        }
    }
}

impl QueryResult for ProxyResult {
    fn last_insert_id(&self) -> Result<i64, DriverError> {
        self.recorded_int64(CallKind::ResultLastInsertId)
    }

    fn rows_affected(&self) -> Result<i64, DriverError> {
        self.recorded_int64(CallKind::ResultRowsAffected)
    }
}

pub struct ProxyTransaction {
    backend: Option<Box<dyn Transaction>>,
}

impl ProxyTransaction {
    fn finish(&mut self, kind: CallKind) -> Result<(), DriverError> {
        match session::active_mode()? {
            Mode::Recording => {
                let backend = backend(&mut self.backend)?;
                let result = match kind {
                    CallKind::TxCommit => backend.commit(),
                    _ => backend.rollback(),
                };
                session::append_record(Record::new(kind, vec![error_value(&result)]))?;
                result
            }
            Mode::Playback => {
                let record = session::verify_record(kind)?;
                recorded_error(&record, 0)
            }
        }
    }
}

impl Transaction for ProxyTransaction {
    fn commit(&mut self) -> Result<(), DriverError> {
        self.finish(CallKind::TxCommit)
    }

    fn rollback(&mut self) -> Result<(), DriverError> {
        self.finish(CallKind::TxRollback)
    }
}
