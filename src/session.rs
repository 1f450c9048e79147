//! The process-wide recording session and its lifecycle.
//!
//! At most one session is open at a time. Every proxied call made while it
//! is open either appends a record (recording) or consumes the next one
//! (playback).

use std::{
    collections::HashMap,
    fmt,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard, OnceLock, RwLock},
};

use crate::{
    driver,
    mode::{self, Mode, RECORD_ENV},
    proxy::ProxyDriver,
    record::{ArgumentShapeError, CallKind, Record, Recording},
    store::{FileSource, RecordingStore, Source, StoreError},
};

pub const DRIVER_PREFIX: &str = "sqlreplay_";
pub const DEFAULT_RECORDING_PATH: &str = "testdata/sqlreplay.txt";

#[derive(Debug, Clone, PartialEq)]
pub enum SessionError {
    NotRegistered,
    AlreadyRegistered(String),
    AlreadyOpen,
    NotOpen,
    UnknownDriver(String),
    RecordingNotFound(String),
    TooManyCalls(CallKind),
    UnexpectedCall {
        expected: CallKind,
        recorded: CallKind,
    },
    MismatchedArgument {
        kind: CallKind,
        recorded: String,
        actual: String,
    },
    CorruptRecord(ArgumentShapeError),
    InvalidRecordingName(String),
    Store(StoreError),
}

impl SessionError {
    /// Whether the recording no longer matches what the code under test does.
    pub fn needs_rerecording(&self) -> bool {
        matches!(
            self,
            Self::TooManyCalls(_)
                | Self::UnexpectedCall { .. }
                | Self::MismatchedArgument { .. }
                | Self::CorruptRecord(_)
        )
    }
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotRegistered => f.write_str(
                "no driver is registered with sqlreplay; call sqlreplay::register before opening a session",
            ),
            Self::AlreadyRegistered(name) => {
                write!(f, "driver `{name}` is already registered with sqlreplay")
            }
            Self::AlreadyOpen => f.write_str(
                "a sqlreplay session is already open; close it before opening another",
            ),
            Self::NotOpen => f.write_str("no sqlreplay session is open"),
            Self::UnknownDriver(name) => write!(f, "sql: unknown driver \"{name}\""),
            Self::RecordingNotFound(name) => {
                write!(f, "no recording exists with this name: {name}")?;
                write_hint(f)
            }
            Self::TooManyCalls(kind) => {
                write!(f, "too many calls to {kind}")?;
                write_hint(f)
            }
            Self::UnexpectedCall { expected, .. } => {
                write!(f, "unexpected call to {expected}")?;
                write_hint(f)
            }
            Self::MismatchedArgument {
                kind,
                recorded,
                actual,
            } => {
                write!(
                    f,
                    "mismatched argument to {kind}, expected {recorded}, got {actual}"
                )?;
                write_hint(f)
            }
            Self::CorruptRecord(err) => {
                write!(f, "corrupt record: {err}")?;
                write_hint(f)
            }
            Self::InvalidRecordingName(reason) => f.write_str(reason),
            Self::Store(err) => write!(f, "{err}"),
        }
    }
}

fn write_hint(f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
        f,
        "\n\nDo you need to regenerate the recording with {RECORD_ENV}=1?"
    )
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::CorruptRecord(err) => Some(err),
            Self::Store(err) => Some(err),
            _ => None,
        }
    }
}

impl From<StoreError> for SessionError {
    fn from(err: StoreError) -> Self {
        Self::Store(err)
    }
}

impl From<ArgumentShapeError> for SessionError {
    fn from(err: ArgumentShapeError) -> Self {
        Self::CorruptRecord(err)
    }
}

pub fn validate_recording_name(name: &str) -> Result<(), SessionError> {
    if name.trim().is_empty() {
        return Err(SessionError::InvalidRecordingName(
            "recording name cannot be empty".to_owned(),
        ));
    }
    if name != name.trim() {
        return Err(SessionError::InvalidRecordingName(
            "recording name cannot have leading or trailing whitespace".to_owned(),
        ));
    }

    Ok(())
}

type SessionInit = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Runtime {
    // Keyed by backend driver name.
    drivers: HashMap<String, Arc<ProxyDriver>>,
    session_init: Option<SessionInit>,
    session: Option<Session>,
    next_session_id: u64,
}

struct Session {
    id: u64,
    mode: Mode,
    recording: Recording,
    index: usize,
    store: RecordingStore,
    recording_name: String,
    first_error: Option<SessionError>,
}

impl Session {
    fn verify(&mut self, kind: CallKind) -> Result<Arc<Record>, SessionError> {
        let record = self
            .recording
            .get(self.index)
            .cloned()
            .ok_or(SessionError::TooManyCalls(kind))?;
        if record.kind != kind {
            return Err(SessionError::UnexpectedCall {
                expected: kind,
                recorded: record.kind,
            });
        }
        self.index += 1;
        tracing::trace!(kind = %kind, index = self.index, "replayed record");
        Ok(record)
    }
}

fn runtime() -> MutexGuard<'static, Runtime> {
    static RUNTIME: OnceLock<Mutex<Runtime>> = OnceLock::new();
    RUNTIME
        .get_or_init(|| Mutex::new(Runtime::default()))
        .lock()
        .unwrap_or_else(|err| err.into_inner())
}

fn default_path_slot() -> &'static RwLock<PathBuf> {
    static DEFAULT_PATH: OnceLock<RwLock<PathBuf>> = OnceLock::new();
    DEFAULT_PATH.get_or_init(|| RwLock::new(PathBuf::from(DEFAULT_RECORDING_PATH)))
}

/// Store path used by [`open`].
pub fn default_recording_path() -> PathBuf {
    default_path_slot()
        .read()
        .unwrap_or_else(|err| err.into_inner())
        .clone()
}

pub fn set_default_recording_path(path: impl Into<PathBuf>) {
    *default_path_slot()
        .write()
        .unwrap_or_else(|err| err.into_inner()) = path.into();
}

/// Registers a proxy for the backend driver `driver_name` under
/// `sqlreplay_<driver_name>`.
///
/// The backend itself is only looked up when a connection is opened in
/// recording mode, so playback works without it.
pub fn register(driver_name: &str) -> Result<(), SessionError> {
    let mut runtime = runtime();
    if runtime.drivers.contains_key(driver_name) {
        return Err(SessionError::AlreadyRegistered(driver_name.to_owned()));
    }

    let proxy = Arc::new(ProxyDriver::new(driver_name));
    let proxy_name = format!("{DRIVER_PREFIX}{driver_name}");
    driver::register_driver(&proxy_name, proxy.clone())
        .map_err(|_| SessionError::AlreadyRegistered(driver_name.to_owned()))?;
    runtime.drivers.insert(driver_name.to_owned(), proxy);
    tracing::debug!(driver = driver_name, proxy = %proxy_name, "registered sqlreplay proxy");
    Ok(())
}

/// Callback run at the start of every recording session, typically to reset
/// the database to a known state.
pub fn set_session_init(init: impl Fn() + Send + Sync + 'static) {
    runtime().session_init = Some(Arc::new(init));
}

pub fn is_open() -> bool {
    runtime().session.is_some()
}

/// Mode of the open session, or the process mode when none is open.
pub fn is_recording() -> bool {
    let mode = runtime().session.as_ref().map(|session| session.mode);
    mode.unwrap_or_else(mode::process_mode) == Mode::Recording
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    recording_name: String,
    source: Arc<dyn Source>,
    mode: Option<Mode>,
    max_recording_size: Option<usize>,
}

impl SessionOptions {
    pub fn new(recording_name: impl Into<String>, source: Arc<dyn Source>) -> Self {
        Self {
            recording_name: recording_name.into(),
            source,
            mode: None,
            max_recording_size: None,
        }
    }

    /// Overrides the process mode for this session.
    pub fn mode(mut self, mode: Mode) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn max_recording_size(mut self, bytes: usize) -> Self {
        self.max_recording_size = Some(bytes);
        self
    }
}

/// Opens a session whose recording is named after the test, stored in the
/// default recording file.
pub fn open(test_name: &str) -> Result<SessionHandle, SessionError> {
    open_named(default_recording_path(), test_name)
}

pub fn open_named(
    path: impl AsRef<Path>,
    recording_name: &str,
) -> Result<SessionHandle, SessionError> {
    open_source(
        Arc::new(FileSource::new(path.as_ref())),
        recording_name,
    )
}

pub fn open_source(
    source: Arc<dyn Source>,
    recording_name: &str,
) -> Result<SessionHandle, SessionError> {
    open_with(SessionOptions::new(recording_name, source))
}

pub fn open_with(options: SessionOptions) -> Result<SessionHandle, SessionError> {
    validate_recording_name(&options.recording_name)?;

    let (session_init, drivers) = {
        let runtime = runtime();
        if runtime.drivers.is_empty() {
            return Err(SessionError::NotRegistered);
        }
        if runtime.session.is_some() {
            return Err(SessionError::AlreadyOpen);
        }
        (
            runtime.session_init.clone(),
            runtime.drivers.values().cloned().collect::<Vec<_>>(),
        )
    };

    let mode = options.mode.unwrap_or_else(mode::process_mode);
    let mut store = RecordingStore::new(options.source);
    if let Some(bytes) = options.max_recording_size {
        store = store.with_max_size(bytes);
    }

    let recording = match mode {
        Mode::Recording => {
            if let Some(init) = session_init {
                init();
            }
            Recording::new()
        }
        Mode::Playback => load_recording(&mut store, &options.recording_name)?,
    };

    for driver in &drivers {
        driver.clear_pooled_connection();
    }

    let mut runtime = runtime();
    if runtime.session.is_some() {
        return Err(SessionError::AlreadyOpen);
    }
    runtime.next_session_id += 1;
    let id = runtime.next_session_id;
    tracing::info!(
        session = id,
        mode = mode.as_str(),
        recording = %options.recording_name,
        source = %store.source().describe(),
        "opened sqlreplay session"
    );
    runtime.session = Some(Session {
        id,
        mode,
        recording,
        index: 0,
        store,
        recording_name: options.recording_name,
        first_error: None,
    });
    Ok(SessionHandle { id, closed: false })
}

fn load_recording(store: &mut RecordingStore, name: &str) -> Result<Recording, SessionError> {
    match store.parse() {
        Ok(()) => {}
        Err(err) if err.is_recoverable() => {
            tracing::warn!(
                source = %store.source().describe(),
                error = %err,
                "ignoring unreadable recording file"
            );
            return Err(SessionError::RecordingNotFound(name.to_owned()));
        }
        Err(err) => return Err(err.into()),
    }

    match store.recording(name) {
        Ok(Some(recording)) => Ok(recording),
        Ok(None) => Err(SessionError::RecordingNotFound(name.to_owned())),
        Err(err) if err.is_recoverable() => {
            tracing::warn!(recording = name, error = %err, "ignoring undecodable recording");
            Err(SessionError::RecordingNotFound(name.to_owned()))
        }
        Err(err) => Err(err.into()),
    }
}

/// Ends the session when closed or dropped.
///
/// Dropping an unclosed handle closes the session and panics with its error,
/// unless the thread is already panicking.
#[must_use = "dropping the handle closes the session immediately"]
#[derive(Debug)]
pub struct SessionHandle {
    id: u64,
    closed: bool,
}

impl SessionHandle {
    pub fn close(mut self) -> Result<(), SessionError> {
        self.closed = true;
        close_session(self.id)
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(err) = close_session(self.id) {
            if std::thread::panicking() {
                tracing::error!(error = %err, "sqlreplay session failed");
            } else {
                panic!("{err}");
            }
        }
    }
}

fn close_session(id: u64) -> Result<(), SessionError> {
    let (session, drivers) = {
        let mut runtime = runtime();
        if runtime.session.as_ref().is_none_or(|session| session.id != id) {
            return Err(SessionError::NotOpen);
        }
        let session = runtime.session.take();
        let drivers: Vec<_> = runtime.drivers.values().cloned().collect();
        (session, drivers)
    };
    let Some(mut session) = session else {
        return Err(SessionError::NotOpen);
    };

    let write_result = if session.mode == Mode::Recording && !session.recording.is_empty() {
        flush(&mut session)
    } else {
        Ok(())
    };

    for driver in &drivers {
        driver.clear_pooled_connection();
    }

    tracing::info!(
        session = session.id,
        mode = session.mode.as_str(),
        recording = %session.recording_name,
        records = session.recording.len(),
        "closed sqlreplay session"
    );

    if let Some(err) = session.first_error {
        return Err(err);
    }
    write_result
}

fn flush(session: &mut Session) -> Result<(), SessionError> {
    // A merge conflict or hand edit can leave the file unparsable; regenerate
    // it rather than fail.
    match session.store.parse() {
        Ok(()) => {}
        Err(err) if err.is_recoverable() => tracing::warn!(
            source = %session.store.source().describe(),
            error = %err,
            "discarding unreadable recording file"
        ),
        Err(err) => return Err(err.into()),
    }
    session
        .store
        .add_recording(session.recording_name.clone(), session.recording.clone());
    session.store.write()?;
    Ok(())
}

fn with_session<T>(
    f: impl FnOnce(&mut Session) -> Result<T, SessionError>,
) -> Result<T, SessionError> {
    let mut runtime = runtime();
    let session = runtime.session.as_mut().ok_or(SessionError::NotOpen)?;
    let result = f(session);
    if let Err(err) = &result {
        session.first_error.get_or_insert_with(|| err.clone());
    }
    result
}

pub(crate) fn active_mode() -> Result<Mode, SessionError> {
    runtime()
        .session
        .as_ref()
        .map(|session| session.mode)
        .ok_or(SessionError::NotOpen)
}

pub(crate) fn append_record(record: Record) -> Result<(), SessionError> {
    with_session(|session| {
        tracing::trace!(kind = %record.kind, index = session.recording.len(), "recorded call");
        session.recording.push(record);
        Ok(())
    })
}

pub(crate) fn verify_record(kind: CallKind) -> Result<Arc<Record>, SessionError> {
    with_session(|session| session.verify(kind))
}

/// Like [`verify_record`], additionally checking the query text stored in
/// the first argument.
pub(crate) fn verify_record_with_query(
    kind: CallKind,
    query: &str,
) -> Result<Arc<Record>, SessionError> {
    with_session(|session| {
        let record = session.verify(kind)?;
        let recorded = record.str_at(0)?;
        if recorded != query {
            return Err(SessionError::MismatchedArgument {
                kind,
                recorded: recorded.to_owned(),
                actual: query.to_owned(),
            });
        }
        Ok(record)
    })
}

/// Records a problem found outside of record verification so that it is
/// reported when the session closes.
pub(crate) fn report_error(err: SessionError) -> SessionError {
    if let Some(session) = runtime().session.as_mut() {
        session.first_error.get_or_insert_with(|| err.clone());
    }
    err
}
