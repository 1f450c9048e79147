use std::{fmt, str::FromStr, sync::Arc};

use crate::value::{ErrorValue, Value};

/// The driver operation a record was captured from.
///
/// The variant names are the on-disk names and must stay stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallKind {
    DriverOpen,
    ConnPrepare,
    ConnBegin,
    ConnExec,
    ConnQuery,
    StmtNumInput,
    StmtExec,
    StmtQuery,
    TxCommit,
    TxRollback,
    ResultLastInsertId,
    ResultRowsAffected,
    RowsColumns,
    RowsNext,
}

impl CallKind {
    pub const ALL: [CallKind; 14] = [
        Self::DriverOpen,
        Self::ConnPrepare,
        Self::ConnBegin,
        Self::ConnExec,
        Self::ConnQuery,
        Self::StmtNumInput,
        Self::StmtExec,
        Self::StmtQuery,
        Self::TxCommit,
        Self::TxRollback,
        Self::ResultLastInsertId,
        Self::ResultRowsAffected,
        Self::RowsColumns,
        Self::RowsNext,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::DriverOpen => "DriverOpen",
            Self::ConnPrepare => "ConnPrepare",
            Self::ConnBegin => "ConnBegin",
            Self::ConnExec => "ConnExec",
            Self::ConnQuery => "ConnQuery",
            Self::StmtNumInput => "StmtNumInput",
            Self::StmtExec => "StmtExec",
            Self::StmtQuery => "StmtQuery",
            Self::TxCommit => "TxCommit",
            Self::TxRollback => "TxRollback",
            Self::ResultLastInsertId => "ResultLastInsertId",
            Self::ResultRowsAffected => "ResultRowsAffected",
            Self::RowsColumns => "RowsColumns",
            Self::RowsNext => "RowsNext",
        }
    }
}

impl fmt::Display for CallKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownCallKind(pub String);

impl fmt::Display for UnknownCallKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown record type `{}`", self.0)
    }
}

impl std::error::Error for UnknownCallKind {}

impl FromStr for CallKind {
    type Err = UnknownCallKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| UnknownCallKind(s.to_owned()))
    }
}

/// One intercepted call: its kind plus the arguments and results needed to
/// replay it.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub kind: CallKind,
    pub args: Vec<Value>,
}

/// A stored argument did not have the shape its call kind requires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgumentShapeError {
    pub kind: CallKind,
    pub index: usize,
    pub expected: &'static str,
}

impl fmt::Display for ArgumentShapeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "argument {} of {} should be {}",
            self.index, self.kind, self.expected
        )
    }
}

impl std::error::Error for ArgumentShapeError {}

impl Record {
    pub fn new(kind: CallKind, args: Vec<Value>) -> Self {
        Self { kind, args }
    }

    fn arg(&self, index: usize, expected: &'static str) -> Result<&Value, ArgumentShapeError> {
        self.args.get(index).ok_or(ArgumentShapeError {
            kind: self.kind,
            index,
            expected,
        })
    }

    fn shape_error(&self, index: usize, expected: &'static str) -> ArgumentShapeError {
        ArgumentShapeError {
            kind: self.kind,
            index,
            expected,
        }
    }

    /// `None` for a nil slot, the stored error otherwise.
    pub fn error_at(&self, index: usize) -> Result<Option<RecordedError>, ArgumentShapeError> {
        match self.arg(index, "error")? {
            Value::Nil => Ok(None),
            Value::Error(error) => Ok(Some(RecordedError::Error(error.clone()))),
            Value::Extension(extension) => Ok(Some(RecordedError::Extension(extension.clone()))),
            _ => Err(self.shape_error(index, "error")),
        }
    }

    pub fn str_at(&self, index: usize) -> Result<&str, ArgumentShapeError> {
        self.arg(index, "string")?
            .as_str()
            .ok_or_else(|| self.shape_error(index, "string"))
    }

    pub fn int_at(&self, index: usize) -> Result<i64, ArgumentShapeError> {
        match self.arg(index, "int")? {
            Value::Int(value) => Ok(*value),
            _ => Err(self.shape_error(index, "int")),
        }
    }

    pub fn int64_at(&self, index: usize) -> Result<i64, ArgumentShapeError> {
        match self.arg(index, "int64")? {
            Value::Int64(value) => Ok(*value),
            _ => Err(self.shape_error(index, "int64")),
        }
    }

    pub fn string_list_at(&self, index: usize) -> Result<&[String], ArgumentShapeError> {
        self.arg(index, "string list")?
            .as_string_list()
            .ok_or_else(|| self.shape_error(index, "string list"))
    }

    pub fn value_list_at(&self, index: usize) -> Result<&[Value], ArgumentShapeError> {
        self.arg(index, "value list")?
            .as_value_list()
            .ok_or_else(|| self.shape_error(index, "value list"))
    }
}

/// An error slot read back from a record.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedError {
    Error(ErrorValue),
    Extension(crate::value::Extension),
}

/// An ordered call sequence. Records are shared with the store they were
/// loaded from.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Recording {
    records: Vec<Arc<Record>>,
}

impl Recording {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, record: Record) {
        self.records.push(Arc::new(record));
    }

    pub fn push_shared(&mut self, record: Arc<Record>) {
        self.records.push(record);
    }

    pub fn get(&self, index: usize) -> Option<&Arc<Record>> {
        self.records.get(index)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Record>> {
        self.records.iter()
    }
}

impl FromIterator<Record> for Recording {
    fn from_iter<I: IntoIterator<Item = Record>>(iter: I) -> Self {
        Self {
            records: iter.into_iter().map(Arc::new).collect(),
        }
    }
}
