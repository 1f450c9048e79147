use std::{
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc, Mutex, MutexGuard, Once,
        atomic::{AtomicUsize, Ordering},
    },
};

use sqlreplay::{
    Mode, SessionError, SessionHandle, SessionOptions,
    database::Database,
    driver::{
        self, Connection, Driver, DriverError, QueryResult, Rows, Statement, Transaction,
    },
    open_with,
    record::CallKind,
    sqlite::SqliteDriver,
    store::{MemorySource, RecordingStore},
    value::Value,
};

const SQLITE_BACKEND: &str = "counting_sqlite";
const SQLITE_PROXY: &str = "sqlreplay_counting_sqlite";
const ANDY_BACKEND: &str = "andy";
const ANDY_PROXY: &str = "sqlreplay_andy";
const ANDY_QUERY: &str = "SELECT name FROM customers WHERE id=$1";

static SQLITE_OPENS: AtomicUsize = AtomicUsize::new(0);
static ANDY_OPENS: AtomicUsize = AtomicUsize::new(0);

/// Sessions are process-wide, so tests in this binary take turns.
fn serial() -> MutexGuard<'static, ()> {
    static LOCK: Mutex<()> = Mutex::new(());
    LOCK.lock().unwrap_or_else(|err| err.into_inner())
}

fn setup() -> MutexGuard<'static, ()> {
    static SETUP: Once = Once::new();
    SETUP.call_once(|| {
        sqlreplay::logging::init_for_tests();
        // Sessions that do not pick a mode must not depend on the caller's
        // environment or test arguments.
        sqlreplay::mode::set_process_mode(Mode::Playback)
            .expect("nothing should have resolved the mode yet");
        driver::register_driver(SQLITE_BACKEND, Arc::new(CountingSqlite))
            .expect("sqlite backend should register");
        driver::register_driver(ANDY_BACKEND, Arc::new(AndyDriver))
            .expect("andy backend should register");
        sqlreplay::register(SQLITE_BACKEND).expect("sqlite proxy should register");
        sqlreplay::register(ANDY_BACKEND).expect("andy proxy should register");
    });
    serial()
}

fn session(source: &MemorySource, name: &str, mode: Mode) -> SessionHandle {
    open_with(SessionOptions::new(name, Arc::new(source.clone())).mode(mode))
        .expect("session should open")
}

/// SQLite backend that counts how often it is asked for a connection.
struct CountingSqlite;

impl Driver for CountingSqlite {
    fn open(&self, dsn: &str) -> Result<Box<dyn Connection>, DriverError> {
        SQLITE_OPENS.fetch_add(1, Ordering::SeqCst);
        SqliteDriver.open(dsn)
    }
}

/// Backend without the direct exec/query path: every query goes through a
/// prepared statement.
struct AndyDriver;

impl Driver for AndyDriver {
    fn open(&self, _dsn: &str) -> Result<Box<dyn Connection>, DriverError> {
        ANDY_OPENS.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(AndyConnection))
    }
}

struct AndyConnection;

impl Connection for AndyConnection {
    fn prepare(&mut self, query: &str) -> Result<Box<dyn Statement>, DriverError> {
        if query != ANDY_QUERY {
            return Err(DriverError::message(format!("andy: unknown query {query}")));
        }
        Ok(Box::new(AndyStatement))
    }

    fn begin(&mut self) -> Result<Box<dyn Transaction>, DriverError> {
        Err(DriverError::message("andy: transactions are not supported"))
    }

    fn close(&mut self) -> Result<(), DriverError> {
        Ok(())
    }
}

struct AndyStatement;

impl Statement for AndyStatement {
    fn num_input(&self) -> i64 {
        1
    }

    fn exec(&mut self, _args: &[Value]) -> Result<Box<dyn QueryResult>, DriverError> {
        Err(DriverError::message("andy: read only"))
    }

    fn query(&mut self, args: &[Value]) -> Result<Box<dyn Rows>, DriverError> {
        let names = if args.first() == Some(&Value::Int64(1)) {
            vec!["Andy".to_owned()]
        } else {
            Vec::new()
        };
        Ok(Box::new(AndyRows {
            names: names.into_iter(),
        }))
    }

    fn close(&mut self) -> Result<(), DriverError> {
        Ok(())
    }
}

struct AndyRows {
    names: std::vec::IntoIter<String>,
}

impl Rows for AndyRows {
    fn columns(&mut self) -> Vec<String> {
        vec!["name".to_owned()]
    }

    fn next(&mut self, dest: &mut [Value]) -> Result<(), DriverError> {
        let name = self.names.next().ok_or(DriverError::Eof)?;
        if let Some(slot) = dest.first_mut() {
            *slot = Value::String(name);
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), DriverError> {
        Ok(())
    }
}

fn inventory_workload(db: &Database) -> Result<Vec<Vec<Value>>, DriverError> {
    db.exec(
        "CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT NOT NULL)",
        &[],
    )?;
    let inserted = db.exec("INSERT INTO items (name) VALUES (?1)", &[Value::from("widget")])?;
    let mut out = vec![vec![
        Value::Int64(inserted.last_insert_id()?),
        Value::Int64(inserted.rows_affected()?),
    ]];

    let mut tx = db.begin()?;
    tx.exec("INSERT INTO items (name) VALUES (?1)", &[Value::from("gadget")])?;
    tx.rollback()?;

    let mut rows = db.query("SELECT id, name FROM items ORDER BY id", &[])?;
    out.push(rows.columns().iter().map(|name| Value::from(name.as_str())).collect());
    while rows.next()? {
        out.push(rows.values().to_vec());
    }
    Ok(out)
}

#[test]
fn playback_returns_recorded_results_without_touching_the_backend() {
    let _guard = setup();
    let source = MemorySource::new();

    let handle = session(&source, "TestInventory", Mode::Recording);
    let recorded = {
        let db = Database::open(SQLITE_PROXY, ":memory:").expect("proxy driver should exist");
        inventory_workload(&db).expect("workload should run against sqlite")
    };
    handle.close().expect("recording session should close");

    assert_eq!(
        recorded,
        vec![
            vec![Value::Int64(1), Value::Int64(1)],
            vec![Value::from("id"), Value::from("name")],
            vec![Value::Int64(1), Value::from("widget")],
        ]
    );
    assert!(
        source.contents_string().contains("\"TestInventory\"="),
        "recording file:\n{}",
        source.contents_string()
    );

    let opens_before = SQLITE_OPENS.load(Ordering::SeqCst);
    let handle = session(&source, "TestInventory", Mode::Playback);
    let replayed = {
        let db = Database::open(SQLITE_PROXY, ":memory:").expect("proxy driver should exist");
        inventory_workload(&db).expect("workload should replay")
    };
    handle.close().expect("playback session should close");

    assert_eq!(replayed, recorded);
    assert_eq!(SQLITE_OPENS.load(Ordering::SeqCst), opens_before);
}

#[test]
fn connections_are_reused_within_a_session_but_not_across_sessions() {
    let _guard = setup();
    let source = MemorySource::new();
    let db = Database::open(SQLITE_PROXY, ":memory:").expect("proxy driver should exist");

    let handle = session(&source, "TestCreateNotes", Mode::Recording);
    let opens_before = SQLITE_OPENS.load(Ordering::SeqCst);
    db.exec("CREATE TABLE notes (body TEXT)", &[])
        .expect("create should succeed");
    db.exec("INSERT INTO notes (body) VALUES ('hello')", &[])
        .expect("insert should see the table");
    let count = db
        .query_row("SELECT count(*) FROM notes", &[])
        .expect("count should succeed");
    assert_eq!(count, Some(vec![Value::Int64(1)]));
    assert_eq!(SQLITE_OPENS.load(Ordering::SeqCst), opens_before + 1);
    handle.close().expect("first session should close");

    // The idle connection from the first session must not leak its private
    // in-memory database into the second one.
    let handle = session(&source, "TestNotesMissing", Mode::Recording);
    let err = db
        .query_row("SELECT count(*) FROM notes", &[])
        .expect_err("a fresh connection has no notes table");
    assert!(err.to_string().contains("no such table"), "{err}");
    handle.close().expect("second session should close");

    let handle = session(&source, "TestNotesMissing", Mode::Playback);
    let replayed = db
        .query_row("SELECT count(*) FROM notes", &[])
        .expect_err("playback should reproduce the failure");
    assert_eq!(replayed, err);
    handle.close().expect("playback session should close");
}

#[test]
fn backend_without_direct_queries_falls_back_to_prepared_statements() {
    let _guard = setup();
    let source = MemorySource::new();

    let handle = session(&source, "TestAndy", Mode::Recording);
    let recorded = {
        let db = Database::open(ANDY_PROXY, "").expect("proxy driver should exist");
        db.query_row(ANDY_QUERY, &[Value::Int64(1)])
            .expect("query should succeed")
    };
    handle.close().expect("recording session should close");
    assert_eq!(recorded, Some(vec![Value::from("Andy")]));

    let mut store = RecordingStore::new(Arc::new(source.clone()));
    store.parse().expect("recording file should parse");
    let recording = store
        .recording("TestAndy")
        .expect("recording should decode")
        .expect("recording should exist");
    let kinds: Vec<_> = recording.iter().map(|record| record.kind).collect();
    assert_eq!(
        kinds,
        vec![
            CallKind::DriverOpen,
            CallKind::ConnQuery,
            CallKind::ConnPrepare,
            CallKind::StmtNumInput,
            CallKind::StmtQuery,
            CallKind::RowsColumns,
            CallKind::RowsNext,
        ]
    );
    let skipped = recording
        .get(1)
        .expect("direct query record")
        .error_at(1)
        .expect("error slot should be well formed")
        .expect("direct query should have failed");
    assert_eq!(DriverError::from_recorded(skipped), DriverError::Skip);
    assert!(
        source.contents_string().ends_with("\"TestAndy\"=1,2,3,4,5,6,7\n"),
        "recording file:\n{}",
        source.contents_string()
    );

    let opens_before = ANDY_OPENS.load(Ordering::SeqCst);
    let handle = session(&source, "TestAndy", Mode::Playback);
    let replayed = {
        let db = Database::open(ANDY_PROXY, "").expect("proxy driver should exist");
        db.query_row(ANDY_QUERY, &[Value::Int64(1)])
            .expect("query should replay")
    };
    handle.close().expect("playback session should close");
    assert_eq!(replayed, recorded);
    assert_eq!(ANDY_OPENS.load(Ordering::SeqCst), opens_before);
}

fn record_single_query(source: &MemorySource, name: &str) {
    let handle = session(source, name, Mode::Recording);
    {
        let db = Database::open(SQLITE_PROXY, ":memory:").expect("proxy driver should exist");
        db.query_row("SELECT 1", &[]).expect("query should succeed");
    }
    handle.close().expect("recording session should close");
}

fn limited_session(source: &MemorySource, name: &str, mode: Mode) -> SessionHandle {
    open_with(
        SessionOptions::new(name, Arc::new(source.clone()))
            .mode(mode)
            .max_recording_size(200),
    )
    .expect("session should open")
}

#[test]
fn long_recordings_under_the_size_limit_can_be_reopened() {
    let _guard = setup();
    let source = MemorySource::new();

    let handle = limited_session(&source, "sqlite/TestManyQueries", Mode::Recording);
    {
        let db = Database::open(SQLITE_PROXY, ":memory:").expect("proxy driver should exist");
        for _ in 0..40 {
            db.query_row("SELECT 1", &[]).expect("query should succeed");
        }
    }
    handle.close().expect("recording session should close");
    assert!(
        source.contents_string().lines().any(|line| line.len() > 200),
        "recording line should exceed the declaration limit"
    );

    let handle = limited_session(&source, "sqlite/TestOneQuery", Mode::Recording);
    {
        let db = Database::open(SQLITE_PROXY, ":memory:").expect("proxy driver should exist");
        db.query_row("SELECT 1", &[]).expect("query should succeed");
    }
    handle.close().expect("second recording should merge into the file");

    let handle = limited_session(&source, "sqlite/TestManyQueries", Mode::Playback);
    {
        let db = Database::open(SQLITE_PROXY, ":memory:").expect("proxy driver should exist");
        for _ in 0..40 {
            assert_eq!(
                db.query_row("SELECT 1", &[]).expect("query should replay"),
                Some(vec![Value::Int64(1)])
            );
        }
    }
    handle.close().expect("playback session should close");
}

fn session_error(err: DriverError) -> SessionError {
    match err {
        DriverError::Session(err) => err,
        other => panic!("expected a session error, got {other:?}"),
    }
}

#[test]
fn playback_rejects_a_different_query() {
    let _guard = setup();
    let source = MemorySource::new();
    record_single_query(&source, "TestSelectOne");

    let handle = session(&source, "TestSelectOne", Mode::Playback);
    let err = {
        let db = Database::open(SQLITE_PROXY, ":memory:").expect("proxy driver should exist");
        db.query_row("SELECT 2", &[]).expect_err("query text differs")
    };
    let err = session_error(err);
    assert!(
        matches!(
            &err,
            SessionError::MismatchedArgument { kind: CallKind::ConnQuery, recorded, actual }
                if recorded == "SELECT 1" && actual == "SELECT 2"
        ),
        "{err:?}"
    );
    assert!(err.to_string().contains("SQLREPLAY_RECORD=1"), "{err}");

    let close_err = handle.close().expect_err("close should report the mismatch");
    assert_eq!(close_err, err);
    assert!(close_err.needs_rerecording());
}

#[test]
fn playback_rejects_extra_and_unexpected_calls() {
    let _guard = setup();
    let source = MemorySource::new();
    record_single_query(&source, "TestSelectOnce");

    let handle = session(&source, "TestSelectOnce", Mode::Playback);
    {
        let db = Database::open(SQLITE_PROXY, ":memory:").expect("proxy driver should exist");
        db.query_row("SELECT 1", &[]).expect("recorded query should replay");
        let err = session_error(db.query_row("SELECT 1", &[]).expect_err("recording is exhausted"));
        assert_eq!(err, SessionError::TooManyCalls(CallKind::ConnQuery));
    }
    assert_eq!(
        handle.close(),
        Err(SessionError::TooManyCalls(CallKind::ConnQuery))
    );

    let handle = session(&source, "TestSelectOnce", Mode::Playback);
    {
        let db = Database::open(SQLITE_PROXY, ":memory:").expect("proxy driver should exist");
        let err = session_error(db.exec("SELECT 1", &[]).expect_err("exec was never recorded"));
        assert_eq!(
            err,
            SessionError::UnexpectedCall {
                expected: CallKind::ConnExec,
                recorded: CallKind::ConnQuery,
            }
        );
    }
    assert!(handle.close().is_err());
}

#[test]
fn playback_of_unknown_recording_fails_to_open() {
    let _guard = setup();
    let source = MemorySource::new();
    record_single_query(&source, "TestKnown");

    let err = open_with(SessionOptions::new("TestUnknown", Arc::new(source)).mode(Mode::Playback))
        .expect_err("recording does not exist");
    assert_eq!(err, SessionError::RecordingNotFound("TestUnknown".to_owned()));
    assert!(!sqlreplay::is_open());
}

#[test]
fn only_one_session_can_be_open() {
    let _guard = setup();
    let source = MemorySource::new();

    let handle = session(&source, "TestFirst", Mode::Recording);
    let err = open_with(SessionOptions::new("TestSecond", Arc::new(source.clone())))
        .expect_err("a session is already open");
    assert_eq!(err, SessionError::AlreadyOpen);
    assert!(sqlreplay::is_recording());
    handle.close().expect("empty session should close");

    // Nothing was recorded, so nothing is written.
    assert!(source.contents().is_empty());
}

#[test]
fn session_init_runs_only_when_recording() {
    static INIT_CALLS: AtomicUsize = AtomicUsize::new(0);
    let _guard = setup();
    sqlreplay::set_session_init(|| {
        INIT_CALLS.fetch_add(1, Ordering::SeqCst);
    });
    let source = MemorySource::new();

    record_single_query(&source, "TestInit");
    assert_eq!(INIT_CALLS.load(Ordering::SeqCst), 1);

    let handle = session(&source, "TestInit", Mode::Playback);
    {
        let db = Database::open(SQLITE_PROXY, ":memory:").expect("proxy driver should exist");
        db.query_row("SELECT 1", &[]).expect("query should replay");
    }
    handle.close().expect("playback session should close");
    assert_eq!(INIT_CALLS.load(Ordering::SeqCst), 1);

    sqlreplay::set_session_init(|| {});
}

#[test]
fn dropping_a_failed_session_panics() {
    let _guard = setup();
    let source = MemorySource::new();
    record_single_query(&source, "TestDropped");

    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        let _handle = session(&source, "TestDropped", Mode::Playback);
        let db = Database::open(SQLITE_PROXY, ":memory:").expect("proxy driver should exist");
        let _ = db.query_row("SELECT 42", &[]);
    }));
    let payload = result.expect_err("drop should panic with the session error");
    let message = payload
        .downcast_ref::<String>()
        .cloned()
        .unwrap_or_default();
    assert!(message.contains("mismatched argument to ConnQuery"), "{message}");
    assert!(!sqlreplay::is_open());
}

#[test]
fn sessions_without_a_mode_use_the_pinned_process_mode() {
    let _guard = setup();
    assert_eq!(sqlreplay::mode::process_mode(), Mode::Playback);
    assert_eq!(
        sqlreplay::mode::set_process_mode(Mode::Recording),
        Err(Mode::Playback)
    );

    let names = driver::driver_names();
    for name in [SQLITE_BACKEND, SQLITE_PROXY, ANDY_BACKEND, ANDY_PROXY] {
        assert!(names.iter().any(|registered| registered == name), "{names:?}");
    }

    let source = MemorySource::new();
    let err = open_with(SessionOptions::new("TestUnrecorded", Arc::new(source)))
        .expect_err("playback needs an existing recording");
    assert_eq!(err, SessionError::RecordingNotFound("TestUnrecorded".to_owned()));
    assert!(!sqlreplay::is_open());
}
