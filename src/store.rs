//! Recording store: the on-disk file that holds every recording for a test
//! package.
//!
//! ```text
//! 1=DriverOpen	1:nil
//! 2=ConnPrepare	2:"SELECT name FROM customers WHERE id=$1"	1:nil
//! 3=StmtNumInput	3:1
//! 4=StmtQuery	1:nil
//! 5=RowsColumns	9:["name"]
//! 6=RowsNext	11:[2:"Andy"]	1:nil
//! 7=RowsNext	11:[]	7:"EOF"
//!
//! "TestQuery"=1,2,3,4,5,6,7
//! ```
//!
//! The first section declares numbered records, the second maps quoted
//! recording names to the record numbers they replay, in order. Records are
//! shared between recordings whenever their declarations are identical.

use std::{
    collections::{HashMap, HashSet},
    fmt, fs, io,
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

use sha2::{Digest as _, Sha256};

use crate::{
    record::{CallKind, Record, Recording},
    value::{self, ValueError},
};

pub const DEFAULT_MAX_RECORDING_SIZE: usize = 1024 * 1024;

static MAX_RECORDING_SIZE: AtomicUsize = AtomicUsize::new(DEFAULT_MAX_RECORDING_SIZE);

/// Longest record declaration line, in bytes, that stores created from now on
/// will read or write.
pub fn max_recording_size() -> usize {
    MAX_RECORDING_SIZE.load(Ordering::Relaxed)
}

pub fn set_max_recording_size(bytes: usize) {
    MAX_RECORDING_SIZE.store(bytes, Ordering::Relaxed);
}

/// Where a store's bytes live.
pub trait Source: fmt::Debug + Send + Sync {
    /// Full contents; a source that does not exist yet reads as empty.
    fn read_all(&self) -> io::Result<Vec<u8>>;
    fn write_all(&self, contents: &[u8]) -> io::Result<()>;
    fn describe(&self) -> String;
}

#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Source for FileSource {
    fn read_all(&self) -> io::Result<Vec<u8>> {
        match fs::read(&self.path) {
            Ok(contents) => Ok(contents),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(err) => Err(err),
        }
    }

    fn write_all(&self, contents: &[u8]) -> io::Result<()> {
        if let Some(parent) = self.path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, contents)
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// Shared in-memory buffer. Clones see the same bytes.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_bytes(contents: impl Into<Vec<u8>>) -> Self {
        Self {
            buffer: Arc::new(Mutex::new(contents.into())),
        }
    }

    pub fn contents(&self) -> Vec<u8> {
        self.buffer
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .clone()
    }

    pub fn contents_string(&self) -> String {
        String::from_utf8_lossy(&self.contents()).into_owned()
    }
}

impl Source for MemorySource {
    fn read_all(&self) -> io::Result<Vec<u8>> {
        Ok(self.contents())
    }

    fn write_all(&self, contents: &[u8]) -> io::Result<()> {
        let mut buffer = self.buffer.lock().unwrap_or_else(|err| err.into_inner());
        buffer.clear();
        buffer.extend_from_slice(contents);
        Ok(())
    }

    fn describe(&self) -> String {
        "<memory>".to_owned()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StoreError {
    Io(String),
    TooLarge { limit: usize, reading: bool },
    Malformed { line: usize, reason: String },
    MissingRecord { recording: String, number: usize },
    UnknownCallKind(String),
    Value(ValueError),
}

impl StoreError {
    /// Whether a failed parse may be treated as an empty store.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Malformed { .. }
                | Self::MissingRecord { .. }
                | Self::UnknownCallKind(_)
                | Self::Value(_)
        )
    }

    fn malformed(line: usize, reason: impl Into<String>) -> Self {
        Self::Malformed {
            line,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(message) => f.write_str(message),
            Self::TooLarge { limit, reading } => write!(
                f,
                "recording exceeds the maximum recording size of {limit} bytes and cannot be {}",
                if *reading { "read" } else { "written" }
            ),
            Self::Malformed { line, reason } => {
                write!(f, "malformed recording file at line {line}: {reason}")
            }
            Self::MissingRecord { recording, number } => write!(
                f,
                "recording `{recording}` references record {number}, which does not exist"
            ),
            Self::UnknownCallKind(name) => write!(f, "record type `{name}` is not recognized"),
            Self::Value(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Value(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ValueError> for StoreError {
    fn from(err: ValueError) -> Self {
        Self::Value(err)
    }
}

/// In-memory view of one recording file.
///
/// Reads are lazy: record declarations stay as text until a recording that
/// uses them is requested, and untouched recordings are written back without
/// ever being decoded.
#[derive(Debug)]
pub struct RecordingStore {
    source: Arc<dyn Source>,
    max_size: usize,
    // Keyed by 0-based record number.
    record_decls: HashMap<usize, String>,
    // File order.
    recording_decls: Vec<(String, Vec<usize>)>,
    decoded: HashMap<usize, Arc<Record>>,
    added: Vec<(String, Recording)>,
    removed: HashSet<String>,
}

impl RecordingStore {
    pub fn new(source: Arc<dyn Source>) -> Self {
        Self {
            source,
            max_size: max_recording_size(),
            record_decls: HashMap::new(),
            recording_decls: Vec::new(),
            decoded: HashMap::new(),
            added: Vec::new(),
            removed: HashSet::new(),
        }
    }

    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self::new(Arc::new(FileSource::new(path)))
    }

    pub fn with_max_size(mut self, bytes: usize) -> Self {
        self.max_size = bytes;
        self
    }

    pub fn source(&self) -> &Arc<dyn Source> {
        &self.source
    }

    /// Loads the source, replacing whatever was parsed before. Added and
    /// removed recordings stay buffered.
    pub fn parse(&mut self) -> Result<(), StoreError> {
        let contents = self.source.read_all().map_err(|err| {
            StoreError::Io(format!(
                "read recording file {}: {err}",
                self.source.describe()
            ))
        })?;

        let mut record_decls = HashMap::new();
        let mut recording_decls: Vec<(String, Vec<usize>)> = Vec::new();

        for (index, raw_line) in contents.split(|byte| *byte == b'\n').enumerate() {
            let line_number = index + 1;
            let line = std::str::from_utf8(raw_line)
                .map_err(|_| StoreError::malformed(line_number, "line is not valid UTF-8"))?;
            let line = line.strip_suffix('\r').unwrap_or(line);
            if line.is_empty() {
                continue;
            }

            if line.starts_with('"') {
                let (name, numbers) = line
                    .rsplit_once('=')
                    .ok_or_else(|| StoreError::malformed(line_number, "expected equals"))?;
                let name = value::unquote(name)
                    .map_err(|reason| StoreError::malformed(line_number, reason))?;
                let numbers = parse_record_numbers(numbers)
                    .map_err(|reason| StoreError::malformed(line_number, reason))?;
                match recording_decls.iter_mut().find(|(existing, _)| *existing == name) {
                    Some((_, existing)) => *existing = numbers,
                    None => recording_decls.push((name, numbers)),
                }
            } else {
                let (number, decl) = line
                    .split_once('=')
                    .ok_or_else(|| StoreError::malformed(line_number, "expected equals"))?;
                let number = number
                    .parse::<usize>()
                    .ok()
                    .and_then(|number| number.checked_sub(1))
                    .ok_or_else(|| StoreError::malformed(line_number, "expected record number"))?;
                // Same measure as `DeclPool::add`; recording lines are not limited.
                if decl.len() > self.max_size {
                    return Err(StoreError::TooLarge {
                        limit: self.max_size,
                        reading: true,
                    });
                }
                record_decls.insert(number, decl.to_owned());
            }
        }

        for (name, numbers) in &recording_decls {
            if let Some(missing) = numbers.iter().find(|number| !record_decls.contains_key(number)) {
                return Err(StoreError::MissingRecord {
                    recording: name.clone(),
                    number: missing + 1,
                });
            }
        }

        tracing::trace!(
            source = %self.source.describe(),
            records = record_decls.len(),
            recordings = recording_decls.len(),
            "parsed recording file"
        );
        self.record_decls = record_decls;
        self.recording_decls = recording_decls;
        self.decoded.clear();
        Ok(())
    }

    /// Number of record declarations as last parsed or written.
    pub fn record_count(&self) -> usize {
        self.record_decls.len()
    }

    /// Recording names in file order, followed by newly added ones.
    pub fn recording_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .recording_decls
            .iter()
            .map(|(name, _)| name.clone())
            .filter(|name| !self.removed.contains(name))
            .collect();
        for (name, _) in &self.added {
            if !names.contains(name) {
                names.push(name.clone());
            }
        }
        names
    }

    /// Buffered additions win over what was parsed.
    pub fn recording(&mut self, name: &str) -> Result<Option<Recording>, StoreError> {
        if let Some((_, recording)) = self.added.iter().find(|(added, _)| added == name) {
            return Ok(Some(recording.clone()));
        }
        if self.removed.contains(name) {
            return Ok(None);
        }
        let Some(numbers) = self
            .recording_decls
            .iter()
            .find(|(existing, _)| existing == name)
            .map(|(_, numbers)| numbers.clone())
        else {
            return Ok(None);
        };

        let mut recording = Recording::new();
        for number in numbers {
            recording.push_shared(self.decoded_record(name, number)?);
        }
        Ok(Some(recording))
    }

    fn decoded_record(&mut self, recording: &str, number: usize) -> Result<Arc<Record>, StoreError> {
        if let Some(record) = self.decoded.get(&number) {
            return Ok(Arc::clone(record));
        }
        let decl = self
            .record_decls
            .get(&number)
            .ok_or_else(|| StoreError::MissingRecord {
                recording: recording.to_owned(),
                number: number + 1,
            })?;
        let record = Arc::new(parse_record_decl(decl)?);
        self.decoded.insert(number, Arc::clone(&record));
        Ok(record)
    }

    /// Buffers `recording` under `name`; it replaces any existing recording
    /// of that name on the next [`write`](Self::write).
    pub fn add_recording(&mut self, name: impl Into<String>, recording: Recording) {
        let name = name.into();
        self.removed.remove(&name);
        match self.added.iter_mut().find(|(added, _)| *added == name) {
            Some((_, existing)) => *existing = recording,
            None => self.added.push((name, recording)),
        }
    }

    /// Buffers the removal of `name`. Returns whether such a recording was
    /// known.
    pub fn remove_recording(&mut self, name: &str) -> bool {
        let before = self.added.len();
        self.added.retain(|(added, _)| added != name);
        let existed = self.added.len() != before
            || self.recording_decls.iter().any(|(existing, _)| existing == name);
        if existed {
            self.removed.insert(name.to_owned());
        }
        existed
    }

    /// Writes every surviving recording back to the source, sharing identical
    /// records and dropping records nothing references.
    pub fn write(&mut self) -> Result<(), StoreError> {
        let mut pool = DeclPool::new(self.max_size);
        let mut recordings: Vec<(String, Vec<usize>)> = Vec::new();

        for (name, numbers) in &self.recording_decls {
            if self.removed.contains(name) {
                continue;
            }
            let new_numbers = match self.added.iter().find(|(added, _)| added == name) {
                Some((_, recording)) => pool.add_recording(recording)?,
                None => numbers
                    .iter()
                    .map(|number| {
                        let decl = self.record_decls.get(number).ok_or_else(|| {
                            StoreError::MissingRecord {
                                recording: name.clone(),
                                number: number + 1,
                            }
                        })?;
                        pool.add(decl.clone())
                    })
                    .collect::<Result<Vec<_>, _>>()?,
            };
            recordings.push((name.clone(), new_numbers));
        }

        for (name, recording) in &self.added {
            if recordings.iter().any(|(existing, _)| existing == name) {
                continue;
            }
            let numbers = pool.add_recording(recording)?;
            recordings.push((name.clone(), numbers));
        }

        let contents = format_file(&pool.decls, &recordings);
        self.source.write_all(contents.as_bytes()).map_err(|err| {
            StoreError::Io(format!(
                "write recording file {}: {err}",
                self.source.describe()
            ))
        })?;
        tracing::debug!(
            source = %self.source.describe(),
            records = pool.decls.len(),
            recordings = recordings.len(),
            "wrote recording file"
        );

        self.record_decls = pool.decls.into_iter().enumerate().collect();
        self.recording_decls = recordings;
        self.decoded.clear();
        self.added.clear();
        self.removed.clear();
        Ok(())
    }
}

/// Deduplicated record declarations, numbered in first-use order.
struct DeclPool {
    max_size: usize,
    decls: Vec<String>,
    numbers: HashMap<[u8; 32], usize>,
}

impl DeclPool {
    fn new(max_size: usize) -> Self {
        Self {
            max_size,
            decls: Vec::new(),
            numbers: HashMap::new(),
        }
    }

    fn add(&mut self, decl: String) -> Result<usize, StoreError> {
        if decl.len() > self.max_size {
            return Err(StoreError::TooLarge {
                limit: self.max_size,
                reading: false,
            });
        }
        let key = content_hash(&decl);
        if let Some(number) = self.numbers.get(&key) {
            return Ok(*number);
        }
        let number = self.decls.len();
        self.numbers.insert(key, number);
        self.decls.push(decl);
        Ok(number)
    }

    fn add_recording(&mut self, recording: &Recording) -> Result<Vec<usize>, StoreError> {
        recording
            .iter()
            .map(|record| self.add(format_record_decl(record)?))
            .collect()
    }
}

fn content_hash(decl: &str) -> [u8; 32] {
    let digest = Sha256::digest(decl.as_bytes());
    let mut key = [0u8; 32];
    key.copy_from_slice(&digest);
    key
}

fn parse_record_numbers(text: &str) -> Result<Vec<usize>, String> {
    if text.is_empty() {
        return Ok(Vec::new());
    }
    text.split(',')
        .map(|number| {
            number
                .parse::<usize>()
                .ok()
                .and_then(|number| number.checked_sub(1))
                .ok_or_else(|| format!("invalid record number `{number}`"))
        })
        .collect()
}

/// `Kind<TAB>arg<TAB>arg...`
pub fn format_record_decl(record: &Record) -> Result<String, ValueError> {
    let mut decl = record.kind.as_str().to_owned();
    for arg in &record.args {
        decl.push('\t');
        decl.push_str(&value::encode(arg)?);
    }
    Ok(decl)
}

pub fn parse_record_decl(decl: &str) -> Result<Record, StoreError> {
    let mut fields = decl.split('\t');
    let kind = fields.next().unwrap_or_default();
    let kind = kind
        .parse::<CallKind>()
        .map_err(|err| StoreError::UnknownCallKind(err.0))?;
    let args = fields
        .map(value::decode)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Record::new(kind, args))
}

fn format_file(decls: &[String], recordings: &[(String, Vec<usize>)]) -> String {
    let mut out = String::new();
    for (index, decl) in decls.iter().enumerate() {
        out.push_str(&(index + 1).to_string());
        out.push('=');
        out.push_str(decl);
        out.push('\n');
    }
    out.push('\n');
    for (name, numbers) in recordings {
        out.push_str(&value::quote(name));
        out.push('=');
        let numbers: Vec<String> = numbers.iter().map(|number| (number + 1).to_string()).collect();
        out.push_str(&numbers.join(","));
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tempfile::tempdir;

    use super::{FileSource, MemorySource, RecordingStore, StoreError, format_record_decl};
    use crate::{
        record::{CallKind, Record, Recording},
        value::Value,
    };

    const ANDY_FILE: &str = "1=DriverOpen\t1:nil
2=ConnPrepare\t2:\"SELECT name FROM customers WHERE id=$1\"\t1:nil
3=StmtNumInput\t3:1
4=StmtQuery\t1:nil
5=RowsColumns\t9:[\"name\"]
6=RowsNext\t11:[2:\"Andy\"]\t1:nil
7=RowsNext\t11:[]\t7:\"EOF\"

\"TestQuery\"=1,2,3,4,5,6,7
";

    fn memory_store(contents: &str) -> (MemorySource, RecordingStore) {
        let source = MemorySource::from_bytes(contents);
        let store = RecordingStore::new(Arc::new(source.clone()));
        (source, store)
    }

    fn open_recording(query: &str) -> Recording {
        [
            Record::new(CallKind::DriverOpen, vec![Value::Nil]),
            Record::new(CallKind::ConnQuery, vec![Value::from(query), Value::Nil]),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn parses_recordings_and_shares_records() {
        let (_, mut store) = memory_store(ANDY_FILE);
        store.parse().expect("store should parse");

        let recording = store
            .recording("TestQuery")
            .expect("recording should decode")
            .expect("recording should exist");
        assert_eq!(recording.len(), 7);
        let kinds: Vec<_> = recording.iter().map(|record| record.kind).collect();
        assert_eq!(
            kinds,
            vec![
                CallKind::DriverOpen,
                CallKind::ConnPrepare,
                CallKind::StmtNumInput,
                CallKind::StmtQuery,
                CallKind::RowsColumns,
                CallKind::RowsNext,
                CallKind::RowsNext,
            ]
        );
        let last = recording.get(6).unwrap();
        assert_eq!(last.args, vec![Value::ValueList(Vec::new()), Value::eof()]);
        assert!(store.recording("TestMissing").unwrap().is_none());
    }

    #[test]
    fn write_then_parse_then_write_is_byte_identical() {
        let (source, mut store) = memory_store(ANDY_FILE);
        store.parse().unwrap();
        store.write().unwrap();
        assert_eq!(source.contents_string(), ANDY_FILE);

        let first = source.contents();
        let mut reparsed = RecordingStore::new(Arc::new(source.clone()));
        reparsed.parse().unwrap();
        reparsed.write().unwrap();
        assert_eq!(source.contents(), first);
    }

    #[test]
    fn identical_records_are_written_once() {
        let (source, mut store) = memory_store("");
        store.parse().unwrap();
        store.add_recording("TestA", open_recording("SELECT 1"));
        store.add_recording("TestB", open_recording("SELECT 1"));
        store.add_recording("TestC", open_recording("SELECT 2"));
        store.write().unwrap();

        assert_eq!(
            source.contents_string(),
            "1=DriverOpen\t1:nil
2=ConnQuery\t2:\"SELECT 1\"\t1:nil
3=ConnQuery\t2:\"SELECT 2\"\t1:nil

\"TestA\"=1,2
\"TestB\"=1,2
\"TestC\"=1,3
"
        );
    }

    #[test]
    fn overriding_keeps_position_and_drops_unreferenced_records() {
        let (source, mut store) = memory_store("");
        store.parse().unwrap();
        store.add_recording("TestA", open_recording("SELECT 1"));
        store.add_recording("TestB", open_recording("SELECT 2"));
        store.write().unwrap();

        let mut store = RecordingStore::new(Arc::new(source.clone()));
        store.parse().unwrap();
        store.add_recording("TestA", open_recording("SELECT 3"));
        store.write().unwrap();

        assert_eq!(
            source.contents_string(),
            "1=DriverOpen\t1:nil
2=ConnQuery\t2:\"SELECT 3\"\t1:nil
3=ConnQuery\t2:\"SELECT 2\"\t1:nil

\"TestA\"=1,2
\"TestB\"=1,3
"
        );
    }

    #[test]
    fn removing_a_recording_garbage_collects_its_records() {
        let (source, mut store) = memory_store("");
        store.parse().unwrap();
        store.add_recording("TestA", open_recording("SELECT 1"));
        store.add_recording("TestB", open_recording("SELECT 2"));
        store.write().unwrap();

        assert!(store.remove_recording("TestA"));
        assert!(!store.remove_recording("TestUnknown"));
        store.write().unwrap();
        assert_eq!(
            source.contents_string(),
            "1=DriverOpen\t1:nil
2=ConnQuery\t2:\"SELECT 2\"\t1:nil

\"TestB\"=1,2
"
        );
        assert_eq!(store.recording_names(), vec!["TestB".to_owned()]);
    }

    #[test]
    fn recording_names_can_hold_any_characters() {
        let (source, mut store) = memory_store("");
        store.parse().unwrap();
        let name = "pkg.Test/sub \"case\"=1";
        store.add_recording(name, open_recording("SELECT 1"));
        store.write().unwrap();

        let mut reparsed = RecordingStore::new(Arc::new(source));
        reparsed.parse().unwrap();
        assert_eq!(reparsed.recording_names(), vec![name.to_owned()]);
        assert_eq!(reparsed.recording(name).unwrap().unwrap().len(), 2);
    }

    #[test]
    fn oversized_lines_are_rejected_both_ways() {
        let (_, mut store) = memory_store(ANDY_FILE);
        let mut store_small = RecordingStore::new(Arc::clone(store.source())).with_max_size(30);
        let err = store_small.parse().unwrap_err();
        assert_eq!(
            err,
            StoreError::TooLarge {
                limit: 30,
                reading: true
            }
        );
        assert!(!err.is_recoverable());
        assert!(err.to_string().contains("cannot be read"), "{err}");

        store.parse().unwrap();
        let mut store = store.with_max_size(20);
        store.add_recording("TestLong", open_recording(&"x".repeat(64)));
        let err = store.write().unwrap_err();
        assert!(err.to_string().contains("cannot be written"), "{err}");
    }

    #[test]
    fn anything_written_at_the_size_limit_parses_back() {
        let mut recording = open_recording("SELECT 1");
        for _ in 0..40 {
            recording.push(Record::new(
                CallKind::ConnQuery,
                vec![Value::from("SELECT 1"), Value::Nil],
            ));
        }
        let limit = recording
            .iter()
            .map(|record| format_record_decl(record).unwrap().len())
            .max()
            .unwrap();

        let (source, store) = memory_store("");
        let mut store = store.with_max_size(limit);
        store.parse().unwrap();
        store.add_recording("TestLimit", recording);
        store.write().expect("declarations at the limit should be written");
        assert!(
            source.contents_string().lines().any(|line| line.len() > limit),
            "recording line should be longer than the limit"
        );

        let mut reparsed = RecordingStore::new(Arc::new(source.clone())).with_max_size(limit);
        reparsed.parse().expect("written file should parse back");
        assert_eq!(reparsed.recording("TestLimit").unwrap().unwrap().len(), 42);
        reparsed.add_recording("TestOther", open_recording("SELECT 2"));
        reparsed.write().expect("rewrite should succeed");
    }

    #[test]
    fn adding_an_unrelated_recording_only_appends() {
        let existing = "1=DriverOpen\t1:nil
2=ConnQuery\t2:\"SELECT 1\"\t1:nil
3=ConnQuery\t2:\"SELECT 2\"\t1:nil

\"TestA\"=1,2
\"TestB\"=1,3
";
        let (source, mut store) = memory_store(existing);
        store.parse().unwrap();
        let fresh: Recording = [
            Record::new(CallKind::ConnBegin, vec![Value::Nil]),
            Record::new(CallKind::ConnExec, vec![Value::from("DELETE FROM t"), Value::Nil]),
        ]
        .into_iter()
        .collect();
        store.add_recording("TestC", fresh);
        store.write().unwrap();

        let written = source.contents_string();
        let (old_decls, old_recordings) = existing.split_once("\n\n").unwrap();
        let (new_decls, new_recordings) = written.split_once("\n\n").unwrap();
        assert_eq!(
            new_decls,
            format!(
                "{old_decls}\n4=ConnBegin\t1:nil\n5=ConnExec\t2:\"DELETE FROM t\"\t1:nil"
            )
        );
        assert_eq!(new_recordings, format!("{old_recordings}\"TestC\"=4,5\n"));
    }

    #[test]
    fn malformed_input_is_recoverable() {
        let cases = [
            "1DriverOpen\t1:nil\n",
            "x=DriverOpen\t1:nil\n",
            "0=DriverOpen\t1:nil\n",
            "\"TestA\"=1\n",
            "1=DriverOpen\t1:nil\n\n\"TestA=1\n",
            "1=DriverOpen\t1:nil\n\n\"TestA\"=one\n",
        ];
        for case in cases {
            let (_, mut store) = memory_store(case);
            let err = store.parse().unwrap_err();
            assert!(err.is_recoverable(), "case {case:?}: {err}");
        }

        let (_, mut store) = memory_store("1=DriverOpened\t1:nil\n\n\"TestA\"=1\n");
        store.parse().unwrap();
        assert_eq!(
            store.recording("TestA").unwrap_err(),
            StoreError::UnknownCallKind("DriverOpened".to_owned())
        );
    }

    #[test]
    fn file_source_treats_missing_file_as_empty_and_creates_directories() {
        let temp_dir = tempdir().expect("tempdir should be created");
        let path = temp_dir.path().join("testdata").join("nested").join("recordings.txt");

        let mut store = RecordingStore::new(Arc::new(FileSource::new(&path)));
        store.parse().expect("missing file should parse as empty");
        assert!(store.recording_names().is_empty());

        store.add_recording("TestA", open_recording("SELECT 1"));
        store.write().expect("write should create parent directories");
        let written = std::fs::read_to_string(&path).expect("file should exist");
        assert!(written.ends_with("\"TestA\"=1,2\n"), "{written}");
    }
}
