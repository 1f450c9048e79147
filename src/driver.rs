//! The SQL driver surface: what a backend implements and what the proxy both
//! implements and wraps.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc, OnceLock, RwLock,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use crate::{
    record::RecordedError,
    session::SessionError,
    value::{ErrorValue, Extension, Value},
};

const BAD_CONNECTION_MESSAGE: &str = "driver: bad connection";
const SKIP_MESSAGE: &str = "driver: skip fast-path; continue as if unimplemented";
const CANCELED_MESSAGE: &str = "context canceled";
const DEADLINE_EXCEEDED_MESSAGE: &str = "context deadline exceeded";

#[derive(Debug, Clone, PartialEq)]
pub enum DriverError {
    /// Row iteration is exhausted.
    Eof,
    /// The connection must not be reused; callers close it and retry on a
    /// fresh one.
    BadConnection,
    /// The optional fast path is not implemented; callers fall back to
    /// prepare-then-execute.
    Skip,
    Canceled,
    DeadlineExceeded,
    Message(String),
    /// A structured backend error carried as a registered extension value.
    Database(Extension),
    /// The active session rejected the call.
    Session(SessionError),
}

impl DriverError {
    pub fn message(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }

    /// Value stored in a record's error slot.
    pub fn to_value(&self) -> Value {
        match self {
            Self::Eof => Value::eof(),
            Self::BadConnection => Value::error(BAD_CONNECTION_MESSAGE),
            Self::Skip => Value::error(SKIP_MESSAGE),
            Self::Canceled => Value::error(CANCELED_MESSAGE),
            Self::DeadlineExceeded => Value::error(DEADLINE_EXCEEDED_MESSAGE),
            Self::Message(message) => Value::error(message.clone()),
            Self::Database(extension) => Value::Extension(extension.clone()),
            Self::Session(err) => Value::error(err.to_string()),
        }
    }

    pub fn from_recorded(recorded: RecordedError) -> Self {
        match recorded {
            RecordedError::Error(ErrorValue::Eof) => Self::Eof,
            RecordedError::Error(ErrorValue::Message(message)) => match message.as_str() {
                BAD_CONNECTION_MESSAGE => Self::BadConnection,
                SKIP_MESSAGE => Self::Skip,
                CANCELED_MESSAGE => Self::Canceled,
                DEADLINE_EXCEEDED_MESSAGE => Self::DeadlineExceeded,
                _ => Self::Message(message),
            },
            RecordedError::Extension(extension) => Self::Database(extension),
        }
    }
}

/// Error slot for a call outcome: nil on success.
pub fn error_value<T>(result: &Result<T, DriverError>) -> Value {
    match result {
        Ok(_) => Value::Nil,
        Err(err) => err.to_value(),
    }
}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Eof => f.write_str("EOF"),
            Self::BadConnection => f.write_str(BAD_CONNECTION_MESSAGE),
            Self::Skip => f.write_str(SKIP_MESSAGE),
            Self::Canceled => f.write_str(CANCELED_MESSAGE),
            Self::DeadlineExceeded => f.write_str(DEADLINE_EXCEEDED_MESSAGE),
            Self::Message(message) => f.write_str(message),
            Self::Database(extension) => write!(f, "{extension}"),
            Self::Session(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for DriverError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Session(err) => Some(err),
            _ => None,
        }
    }
}

impl From<SessionError> for DriverError {
    fn from(err: SessionError) -> Self {
        Self::Session(err)
    }
}

/// Deadline and cancellation carried into context-aware calls.
#[derive(Debug, Clone, Default)]
pub struct Context {
    deadline: Option<Instant>,
    canceled: Arc<AtomicBool>,
}

impl Context {
    pub fn background() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            deadline: Some(deadline),
            canceled: Arc::default(),
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Cancels this context and every clone of it.
    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::SeqCst);
    }

    pub fn check(&self) -> Result<(), DriverError> {
        if self.canceled.load(Ordering::SeqCst) {
            return Err(DriverError::Canceled);
        }
        if self.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            return Err(DriverError::DeadlineExceeded);
        }
        Ok(())
    }
}

pub trait Driver: Send + Sync {
    fn open(&self, dsn: &str) -> Result<Box<dyn Connection>, DriverError>;
}

/// A single database session.
///
/// The context-aware variants default to checking the context and calling
/// the plain variant. `exec_context` and `query_context` are an optional fast
/// path and return [`DriverError::Skip`] unless overridden.
pub trait Connection: Send {
    fn prepare(&mut self, query: &str) -> Result<Box<dyn Statement>, DriverError>;

    fn prepare_context(
        &mut self,
        ctx: &Context,
        query: &str,
    ) -> Result<Box<dyn Statement>, DriverError> {
        ctx.check()?;
        self.prepare(query)
    }

    fn begin(&mut self) -> Result<Box<dyn Transaction>, DriverError>;

    fn begin_context(&mut self, ctx: &Context) -> Result<Box<dyn Transaction>, DriverError> {
        ctx.check()?;
        self.begin()
    }

    fn exec_context(
        &mut self,
        _ctx: &Context,
        _query: &str,
        _args: &[Value],
    ) -> Result<Box<dyn QueryResult>, DriverError> {
        Err(DriverError::Skip)
    }

    fn query_context(
        &mut self,
        _ctx: &Context,
        _query: &str,
        _args: &[Value],
    ) -> Result<Box<dyn Rows>, DriverError> {
        Err(DriverError::Skip)
    }

    /// Health check before the connection is reused.
    fn reset_session(&mut self, _ctx: &Context) -> Result<(), DriverError> {
        Ok(())
    }

    fn close(&mut self) -> Result<(), DriverError>;
}

pub trait Statement: Send {
    /// Number of placeholders, or -1 when the driver cannot tell.
    fn num_input(&self) -> i64;

    fn exec(&mut self, args: &[Value]) -> Result<Box<dyn QueryResult>, DriverError>;

    fn exec_context(
        &mut self,
        ctx: &Context,
        args: &[Value],
    ) -> Result<Box<dyn QueryResult>, DriverError> {
        ctx.check()?;
        self.exec(args)
    }

    fn query(&mut self, args: &[Value]) -> Result<Box<dyn Rows>, DriverError>;

    fn query_context(&mut self, ctx: &Context, args: &[Value]) -> Result<Box<dyn Rows>, DriverError> {
        ctx.check()?;
        self.query(args)
    }

    fn close(&mut self) -> Result<(), DriverError>;
}

pub trait Rows: Send {
    fn columns(&mut self) -> Vec<String>;

    /// Fills `dest` with the next row, or fails with [`DriverError::Eof`] when
    /// there are no more rows.
    fn next(&mut self, dest: &mut [Value]) -> Result<(), DriverError>;

    fn close(&mut self) -> Result<(), DriverError>;
}

pub trait QueryResult: Send {
    fn last_insert_id(&self) -> Result<i64, DriverError>;
    fn rows_affected(&self) -> Result<i64, DriverError>;
}

pub trait Transaction: Send {
    fn commit(&mut self) -> Result<(), DriverError>;
    fn rollback(&mut self) -> Result<(), DriverError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateDriver(pub String);

impl fmt::Display for DuplicateDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sql: register called twice for driver {}", self.0)
    }
}

impl std::error::Error for DuplicateDriver {}

fn drivers() -> &'static RwLock<HashMap<String, Arc<dyn Driver>>> {
    static DRIVERS: OnceLock<RwLock<HashMap<String, Arc<dyn Driver>>>> = OnceLock::new();
    DRIVERS.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Makes `driver` available under `name` for the rest of the process.
pub fn register_driver(name: &str, driver: Arc<dyn Driver>) -> Result<(), DuplicateDriver> {
    let mut drivers = drivers().write().unwrap_or_else(|err| err.into_inner());
    if drivers.contains_key(name) {
        return Err(DuplicateDriver(name.to_owned()));
    }
    drivers.insert(name.to_owned(), driver);
    tracing::debug!(driver = name, "registered sql driver");
    Ok(())
}

pub fn lookup_driver(name: &str) -> Option<Arc<dyn Driver>> {
    drivers()
        .read()
        .unwrap_or_else(|err| err.into_inner())
        .get(name)
        .cloned()
}

pub fn driver_names() -> Vec<String> {
    let mut names: Vec<String> = drivers()
        .read()
        .unwrap_or_else(|err| err.into_inner())
        .keys()
        .cloned()
        .collect();
    names.sort();
    names
}
