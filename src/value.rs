//! Dynamically typed driver values and their line-safe text encoding.
//!
//! Every value is written as `<tag>:<payload>`. Payloads never contain a raw
//! newline or tab, and only contain brackets or commas inside quoted strings,
//! so records can be split on tabs and value lists on top-level commas.

use std::{
    any::{Any, TypeId},
    collections::HashMap,
    fmt::{self, Write as _},
    sync::{Arc, OnceLock, RwLock},
};

use base64::{Engine as _, engine::general_purpose::STANDARD_NO_PAD};
use chrono::{DateTime, FixedOffset, Timelike as _, Utc};

pub const NIL_TAG: u16 = 1;
pub const STRING_TAG: u16 = 2;
pub const INT_TAG: u16 = 3;
pub const INT64_TAG: u16 = 4;
pub const FLOAT64_TAG: u16 = 5;
pub const BOOL_TAG: u16 = 6;
pub const ERROR_TAG: u16 = 7;
pub const TIMESTAMP_TAG: u16 = 8;
pub const STRING_LIST_TAG: u16 = 9;
pub const BYTE_LIST_TAG: u16 = 10;
pub const VALUE_LIST_TAG: u16 = 11;

/// Extension tags start here; everything below is reserved for built-in kinds.
pub const FIRST_EXTENSION_TAG: u16 = 100;

const EOF_MESSAGE: &str = "EOF";

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Nil,
    String(String),
    Int(i64),
    Int64(i64),
    Float64(f64),
    Bool(bool),
    Error(ErrorValue),
    Timestamp(Timestamp),
    StringList(Vec<String>),
    ByteList(Vec<u8>),
    ValueList(Vec<Value>),
    Extension(Extension),
}

/// Error payload. `Eof` is the end-of-rows sentinel and is compared by
/// variant, never by message text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorValue {
    Eof,
    Message(String),
}

impl ErrorValue {
    pub fn message(&self) -> &str {
        match self {
            Self::Eof => EOF_MESSAGE,
            Self::Message(message) => message,
        }
    }
}

impl fmt::Display for ErrorValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

/// A point in time plus the zone flavour it was observed in.
///
/// The named UTC zone encodes with a `Z` suffix while a fixed zero offset
/// encodes as `+00:00`, so recordings stay byte-stable whichever form a
/// backend hands back.
#[derive(Debug, Clone, Copy)]
pub struct Timestamp {
    time: DateTime<FixedOffset>,
    utc: bool,
}

impl Timestamp {
    pub fn utc(time: DateTime<Utc>) -> Self {
        Self {
            time: time.fixed_offset(),
            utc: true,
        }
    }

    pub fn fixed(time: DateTime<FixedOffset>) -> Self {
        Self { time, utc: false }
    }

    pub fn time(&self) -> DateTime<FixedOffset> {
        self.time
    }

    pub fn is_utc(&self) -> bool {
        self.utc
    }

    pub fn parse_rfc3339(text: &str) -> Result<Self, chrono::ParseError> {
        let time = DateTime::parse_from_rfc3339(text)?;
        let utc = text.ends_with('Z') || text.ends_with('z');
        Ok(Self { time, utc })
    }

    /// RFC 3339 with nanoseconds, trailing fractional zeros removed.
    pub fn to_rfc3339(&self) -> String {
        let mut out = self.time.format("%Y-%m-%dT%H:%M:%S").to_string();
        let nanos = self.time.nanosecond() % 1_000_000_000;
        if nanos != 0 {
            let fraction = format!("{nanos:09}");
            out.push('.');
            out.push_str(fraction.trim_end_matches('0'));
        }
        if self.utc {
            out.push('Z');
        } else {
            out.push_str(&self.time.format("%:z").to_string());
        }
        out
    }
}

impl PartialEq for Timestamp {
    fn eq(&self, other: &Self) -> bool {
        self.utc == other.utc
            && self.time == other.time
            && self.time.offset() == other.time.offset()
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_rfc3339())
    }
}

/// Driver-specific value kinds plugged in through [`register_extension`].
///
/// Implemented for every comparable, printable, thread-safe type.
pub trait ExtensionValue: Any + fmt::Debug + fmt::Display + Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn dyn_eq(&self, other: &dyn ExtensionValue) -> bool;
    fn type_name(&self) -> &'static str;
}

impl<T> ExtensionValue for T
where
    T: Any + fmt::Debug + fmt::Display + PartialEq + Send + Sync,
{
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn dyn_eq(&self, other: &dyn ExtensionValue) -> bool {
        other
            .as_any()
            .downcast_ref::<T>()
            .is_some_and(|other| self == other)
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }
}

#[derive(Debug, Clone)]
pub struct Extension(Arc<dyn ExtensionValue>);

impl Extension {
    pub fn new<T: ExtensionValue>(value: T) -> Self {
        Self(Arc::new(value))
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.as_ref().as_any().downcast_ref::<T>()
    }

    pub fn value(&self) -> &dyn ExtensionValue {
        self.0.as_ref()
    }

    fn value_type_id(&self) -> TypeId {
        self.0.as_ref().as_any().type_id()
    }
}

impl PartialEq for Extension {
    fn eq(&self, other: &Self) -> bool {
        self.0.dyn_eq(other.0.as_ref())
    }
}

impl fmt::Display for Extension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self.0.as_ref(), f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueError {
    MissingColon(String),
    InvalidTag(String),
    UnknownTag(u16),
    Malformed { tag: u16, reason: String },
    UnregisteredExtension(&'static str),
    ReservedTag(u16),
    DuplicateTag(u16),
}

impl ValueError {
    pub fn malformed(tag: u16, reason: impl Into<String>) -> Self {
        Self::Malformed {
            tag,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for ValueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingColon(text) => write!(f, "expected colon in encoded value `{text}`"),
            Self::InvalidTag(tag) => write!(f, "invalid value type tag `{tag}`"),
            Self::UnknownTag(tag) => write!(f, "unsupported value type tag {tag}"),
            Self::Malformed { tag, reason } => {
                write!(f, "malformed value with type tag {tag}: {reason}")
            }
            Self::UnregisteredExtension(type_name) => {
                write!(f, "no encoder registered for value type {type_name}")
            }
            Self::ReservedTag(tag) => write!(
                f,
                "value type tag {tag} is reserved; extension tags start at {FIRST_EXTENSION_TAG}"
            ),
            Self::DuplicateTag(tag) => write!(f, "value type tag {tag} is already registered"),
        }
    }
}

impl std::error::Error for ValueError {}

type EncodeFn = Box<dyn Fn(&dyn ExtensionValue) -> Option<String> + Send + Sync>;
type DecodeFn = Box<dyn Fn(&str) -> Result<Extension, ValueError> + Send + Sync>;

#[derive(Default)]
struct Registry {
    encoders: HashMap<TypeId, (u16, EncodeFn)>,
    decoders: HashMap<u16, DecodeFn>,
}

fn registry() -> &'static RwLock<Registry> {
    static REGISTRY: OnceLock<RwLock<Registry>> = OnceLock::new();
    REGISTRY.get_or_init(|| RwLock::new(Registry::default()))
}

/// Registers an extension value kind under `tag`.
///
/// `encode` produces the payload only; the tag prefix is added by the codec.
/// Registrations live for the rest of the process.
pub fn register_extension<T>(
    tag: u16,
    encode: fn(&T) -> String,
    decode: fn(&str) -> Result<T, ValueError>,
) -> Result<(), ValueError>
where
    T: Any + fmt::Debug + fmt::Display + PartialEq + Send + Sync,
{
    if tag < FIRST_EXTENSION_TAG {
        return Err(ValueError::ReservedTag(tag));
    }

    let mut registry = registry().write().unwrap_or_else(|err| err.into_inner());
    if registry.decoders.contains_key(&tag) {
        return Err(ValueError::DuplicateTag(tag));
    }

    registry.encoders.insert(
        TypeId::of::<T>(),
        (
            tag,
            Box::new(move |value| value.as_any().downcast_ref::<T>().map(encode)),
        ),
    );
    registry
        .decoders
        .insert(tag, Box::new(move |payload| decode(payload).map(Extension::new)));
    tracing::debug!(tag, type_name = std::any::type_name::<T>(), "registered value extension");
    Ok(())
}

impl Value {
    pub fn tag(&self) -> Option<u16> {
        let tag = match self {
            Self::Nil => NIL_TAG,
            Self::String(_) => STRING_TAG,
            Self::Int(_) => INT_TAG,
            Self::Int64(_) => INT64_TAG,
            Self::Float64(_) => FLOAT64_TAG,
            Self::Bool(_) => BOOL_TAG,
            Self::Error(_) => ERROR_TAG,
            Self::Timestamp(_) => TIMESTAMP_TAG,
            Self::StringList(_) => STRING_LIST_TAG,
            Self::ByteList(_) => BYTE_LIST_TAG,
            Self::ValueList(_) => VALUE_LIST_TAG,
            Self::Extension(extension) => {
                let registry = registry().read().unwrap_or_else(|err| err.into_inner());
                return registry
                    .encoders
                    .get(&extension.value_type_id())
                    .map(|(tag, _)| *tag);
            }
        };
        Some(tag)
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Nil => "nil",
            Self::String(_) => "string",
            Self::Int(_) => "int",
            Self::Int64(_) => "int64",
            Self::Float64(_) => "float64",
            Self::Bool(_) => "bool",
            Self::Error(_) => "error",
            Self::Timestamp(_) => "timestamp",
            Self::StringList(_) => "string list",
            Self::ByteList(_) => "byte list",
            Self::ValueList(_) => "value list",
            Self::Extension(_) => "extension",
        }
    }

    pub fn eof() -> Self {
        Self::Error(ErrorValue::Eof)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error(ErrorValue::Message(message.into()))
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Self::Nil)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(value) => Some(value),
            _ => None,
        }
    }

    /// Integer payload of either integer kind.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(value) | Self::Int64(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float64(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::ByteList(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_string_list(&self) -> Option<&[String]> {
        match self {
            Self::StringList(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_value_list(&self) -> Option<&[Value]> {
        match self {
            Self::ValueList(value) => Some(value),
            _ => None,
        }
    }

    /// Snapshot that shares no buffers with `self`.
    ///
    /// Backends may reuse row storage between fetches, so recorded rows are
    /// always copied element by element. Extension values are immutable and
    /// are shared.
    pub fn deep_copy(&self) -> Self {
        match self {
            Self::StringList(values) => Self::StringList(values.to_vec()),
            Self::ByteList(bytes) => Self::ByteList(bytes.to_vec()),
            Self::ValueList(values) => Self::ValueList(values.iter().map(Self::deep_copy).collect()),
            other => other.clone(),
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Int64(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Float64(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Self {
        Self::ByteList(value)
    }
}

impl From<Vec<String>> for Value {
    fn from(value: Vec<String>) -> Self {
        Self::StringList(value)
    }
}

impl From<Vec<Value>> for Value {
    fn from(value: Vec<Value>) -> Self {
        Self::ValueList(value)
    }
}

impl From<Timestamp> for Value {
    fn from(value: Timestamp) -> Self {
        Self::Timestamp(value)
    }
}

impl From<ErrorValue> for Value {
    fn from(value: ErrorValue) -> Self {
        Self::Error(value)
    }
}

impl From<Extension> for Value {
    fn from(value: Extension) -> Self {
        Self::Extension(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Nil, Into::into)
    }
}

/// Encodes `value` as `<tag>:<payload>`.
pub fn encode(value: &Value) -> Result<String, ValueError> {
    let mut out = String::new();
    encode_into(&mut out, value)?;
    Ok(out)
}

fn encode_into(out: &mut String, value: &Value) -> Result<(), ValueError> {
    match value {
        Value::Nil => {
            let _ = write!(out, "{NIL_TAG}:nil");
        }
        Value::String(text) => {
            let _ = write!(out, "{STRING_TAG}:");
            quote_into(out, text);
        }
        Value::Int(number) => {
            let _ = write!(out, "{INT_TAG}:{number}");
        }
        Value::Int64(number) => {
            let _ = write!(out, "{INT64_TAG}:{number}");
        }
        Value::Float64(number) => {
            let _ = write!(out, "{FLOAT64_TAG}:{}", format_float(*number));
        }
        Value::Bool(flag) => {
            let _ = write!(out, "{BOOL_TAG}:{flag}");
        }
        Value::Error(error) => {
            let _ = write!(out, "{ERROR_TAG}:");
            quote_into(out, error.message());
        }
        Value::Timestamp(timestamp) => {
            let _ = write!(out, "{TIMESTAMP_TAG}:{}", timestamp.to_rfc3339());
        }
        Value::StringList(items) => {
            let _ = write!(out, "{STRING_LIST_TAG}:[");
            for (index, item) in items.iter().enumerate() {
                if index != 0 {
                    out.push(',');
                }
                quote_into(out, item);
            }
            out.push(']');
        }
        Value::ByteList(bytes) => {
            let _ = write!(out, "{BYTE_LIST_TAG}:{}", STANDARD_NO_PAD.encode(bytes));
        }
        Value::ValueList(items) => {
            let _ = write!(out, "{VALUE_LIST_TAG}:[");
            for (index, item) in items.iter().enumerate() {
                if index != 0 {
                    out.push(',');
                }
                encode_into(out, item)?;
            }
            out.push(']');
        }
        Value::Extension(extension) => {
            let registry = registry().read().unwrap_or_else(|err| err.into_inner());
            let (tag, encode) = registry
                .encoders
                .get(&extension.value_type_id())
                .ok_or_else(|| ValueError::UnregisteredExtension(extension.value().type_name()))?;
            let payload = encode(extension.value())
                .ok_or_else(|| ValueError::UnregisteredExtension(extension.value().type_name()))?;
            check_extension_payload(*tag, &payload)?;
            let _ = write!(out, "{tag}:{payload}");
        }
    }
    Ok(())
}

/// Rejects payloads that would split a record line or a list item.
fn check_extension_payload(tag: u16, payload: &str) -> Result<(), ValueError> {
    if payload.contains(['\t', '\n', '\r']) {
        return Err(ValueError::malformed(
            tag,
            "extension payload contains a tab or line break",
        ));
    }
    match split_list(&format!("[{tag}:{payload}]")) {
        Ok(items) if items.len() == 1 => Ok(()),
        _ => Err(ValueError::malformed(
            tag,
            format!("extension payload is not a single list item: {payload}"),
        )),
    }
}

/// Parses a value produced by [`encode`].
pub fn decode(text: &str) -> Result<Value, ValueError> {
    let (tag, payload) = text
        .split_once(':')
        .ok_or_else(|| ValueError::MissingColon(text.to_owned()))?;
    let tag: u16 = tag
        .parse()
        .map_err(|_| ValueError::InvalidTag(tag.to_owned()))?;

    match tag {
        NIL_TAG => match payload {
            "nil" => Ok(Value::Nil),
            _ => Err(ValueError::malformed(tag, "expected nil")),
        },
        STRING_TAG => unquote(payload)
            .map(Value::String)
            .map_err(|reason| ValueError::malformed(tag, reason)),
        INT_TAG => payload
            .parse()
            .map(Value::Int)
            .map_err(|err| ValueError::malformed(tag, format!("{err}"))),
        INT64_TAG => payload
            .parse()
            .map(Value::Int64)
            .map_err(|err| ValueError::malformed(tag, format!("{err}"))),
        FLOAT64_TAG => parse_float(payload)
            .map(Value::Float64)
            .ok_or_else(|| ValueError::malformed(tag, format!("invalid float `{payload}`"))),
        BOOL_TAG => match payload {
            "true" => Ok(Value::Bool(true)),
            "false" => Ok(Value::Bool(false)),
            _ => Err(ValueError::malformed(tag, "expected true or false")),
        },
        ERROR_TAG => {
            let message = unquote(payload).map_err(|reason| ValueError::malformed(tag, reason))?;
            if message == EOF_MESSAGE {
                return Ok(Value::eof());
            }
            Ok(Value::error(message))
        }
        TIMESTAMP_TAG => Timestamp::parse_rfc3339(payload)
            .map(Value::Timestamp)
            .map_err(|err| ValueError::malformed(tag, format!("{err}"))),
        STRING_LIST_TAG => {
            let items = split_list(payload).map_err(|reason| ValueError::malformed(tag, reason))?;
            items
                .into_iter()
                .map(|item| unquote(item).map_err(|reason| ValueError::malformed(tag, reason)))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::StringList)
        }
        BYTE_LIST_TAG => STANDARD_NO_PAD
            .decode(payload)
            .map(Value::ByteList)
            .map_err(|err| ValueError::malformed(tag, format!("{err}"))),
        VALUE_LIST_TAG => {
            let items = split_list(payload).map_err(|reason| ValueError::malformed(tag, reason))?;
            items
                .into_iter()
                .map(decode)
                .collect::<Result<Vec<_>, _>>()
                .map(Value::ValueList)
        }
        _ => {
            let registry = registry().read().unwrap_or_else(|err| err.into_inner());
            let decode = registry
                .decoders
                .get(&tag)
                .ok_or(ValueError::UnknownTag(tag))?;
            decode(payload).map(Value::Extension)
        }
    }
}

/// Go-compatible double-quoted string literal.
pub fn quote(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    quote_into(&mut out, text);
    out
}

fn quote_into(out: &mut String, text: &str) {
    out.push('"');
    for ch in text.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\u{07}' => out.push_str("\\a"),
            '\u{08}' => out.push_str("\\b"),
            '\u{0c}' => out.push_str("\\f"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\u{0b}' => out.push_str("\\v"),
            ch if is_printable(ch) => out.push(ch),
            ch if (ch as u32) < 0x80 => {
                let _ = write!(out, "\\x{:02x}", ch as u32);
            }
            ch if (ch as u32) < 0x10000 => {
                let _ = write!(out, "\\u{:04x}", ch as u32);
            }
            ch => {
                let _ = write!(out, "\\U{:08x}", ch as u32);
            }
        }
    }
    out.push('"');
}

fn is_printable(ch: char) -> bool {
    if ch == ' ' {
        return true;
    }
    !(ch.is_control()
        || ch.is_whitespace()
        || matches!(
            ch,
            '\u{00ad}' | '\u{200b}'..='\u{200f}' | '\u{2060}'..='\u{2064}' | '\u{feff}'
        ))
}

/// Inverse of [`quote`]. Accepts every escape Go's `strconv.Quote` emits.
pub fn unquote(text: &str) -> Result<String, String> {
    let inner = text
        .strip_prefix('"')
        .and_then(|rest| rest.strip_suffix('"'))
        .ok_or_else(|| format!("expected quoted string, got `{text}`"))?;

    let mut bytes = Vec::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(ch) = chars.next() {
        match ch {
            '"' => return Err("unescaped quote inside string".to_owned()),
            '\n' => return Err("raw newline inside string".to_owned()),
            '\\' => {
                let escape = chars
                    .next()
                    .ok_or_else(|| "dangling escape at end of string".to_owned())?;
                match escape {
                    'a' => bytes.push(0x07),
                    'b' => bytes.push(0x08),
                    'f' => bytes.push(0x0c),
                    'n' => bytes.push(b'\n'),
                    'r' => bytes.push(b'\r'),
                    't' => bytes.push(b'\t'),
                    'v' => bytes.push(0x0b),
                    '\\' => bytes.push(b'\\'),
                    '\'' => bytes.push(b'\''),
                    '"' => bytes.push(b'"'),
                    'x' => {
                        let code = take_hex(&mut chars, 2)?;
                        bytes.push(code as u8);
                    }
                    'u' | 'U' => {
                        let digits = if escape == 'u' { 4 } else { 8 };
                        let code = take_hex(&mut chars, digits)?;
                        let ch = char::from_u32(code)
                            .ok_or_else(|| format!("invalid unicode escape {code:#x}"))?;
                        let mut buf = [0u8; 4];
                        bytes.extend_from_slice(ch.encode_utf8(&mut buf).as_bytes());
                    }
                    '0'..='7' => {
                        let mut code = escape.to_digit(8).unwrap_or(0);
                        for _ in 0..2 {
                            let digit = chars
                                .next()
                                .and_then(|ch| ch.to_digit(8))
                                .ok_or_else(|| "invalid octal escape".to_owned())?;
                            code = code * 8 + digit;
                        }
                        let byte = u8::try_from(code)
                            .map_err(|_| format!("octal escape {code:o} out of range"))?;
                        bytes.push(byte);
                    }
                    other => return Err(format!("unknown escape `\\{other}`")),
                }
            }
            ch => {
                let mut buf = [0u8; 4];
                bytes.extend_from_slice(ch.encode_utf8(&mut buf).as_bytes());
            }
        }
    }

    String::from_utf8(bytes).map_err(|_| "string is not valid UTF-8".to_owned())
}

fn take_hex(chars: &mut std::str::Chars<'_>, digits: usize) -> Result<u32, String> {
    let mut code = 0u32;
    for _ in 0..digits {
        let digit = chars
            .next()
            .and_then(|ch| ch.to_digit(16))
            .ok_or_else(|| format!("expected {digits} hex digits in escape"))?;
        code = code * 16 + digit;
    }
    Ok(code)
}

/// Splits `[a,b,[c,d]]` into its top-level elements, ignoring brackets and
/// commas inside quoted strings.
fn split_list(text: &str) -> Result<Vec<&str>, String> {
    let inner = text
        .strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
        .ok_or_else(|| format!("invalid list format: {text}"))?;
    if inner.is_empty() {
        return Ok(Vec::new());
    }

    let mut items = Vec::new();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    let mut start = 0;
    for (index, byte) in inner.bytes().enumerate() {
        if in_string {
            match byte {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match byte {
            b'"' => in_string = true,
            b'[' => depth += 1,
            b']' => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| format!("mismatched brackets: {inner}"))?;
            }
            b',' if depth == 0 => {
                items.push(&inner[start..index]);
                start = index + 1;
            }
            _ => {}
        }
    }
    if depth != 0 || in_string {
        return Err(format!("mismatched brackets: {inner}"));
    }
    items.push(&inner[start..]);
    Ok(items)
}

/// Shortest round-trip form, switching to exponent notation the way Go's
/// `%g` verb does.
fn format_float(number: f64) -> String {
    if number.is_nan() {
        return "NaN".to_owned();
    }
    if number.is_infinite() {
        return if number > 0.0 { "+Inf" } else { "-Inf" }.to_owned();
    }
    if number == 0.0 {
        return if number.is_sign_negative() { "-0" } else { "0" }.to_owned();
    }

    let scientific = format!("{number:e}");
    let Some((mantissa, exponent)) = scientific.split_once('e') else {
        return format!("{number}");
    };
    let Ok(exponent) = exponent.parse::<i32>() else {
        return format!("{number}");
    };
    if exponent < -4 || exponent >= 6 {
        let sign = if exponent < 0 { '-' } else { '+' };
        format!("{mantissa}e{sign}{:02}", exponent.unsigned_abs())
    } else {
        format!("{number}")
    }
}

fn parse_float(text: &str) -> Option<f64> {
    match text {
        "+Inf" | "Inf" | "+inf" | "inf" => Some(f64::INFINITY),
        "-Inf" | "-inf" => Some(f64::NEG_INFINITY),
        "NaN" | "nan" => Some(f64::NAN),
        _ => text.parse().ok(),
    }
}
