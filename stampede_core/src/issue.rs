use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;

pub const ID: &str = "id";
pub const OID: &str = "_id";
pub const SUT: &str = "sut";
pub const FUZZER: &str = "fuzzer";
pub const SUBCONFIG: &str = "subconfig";
pub const TEST: &str = "test";
pub const REDUCED: &str = "reduced";
pub const REPORTED: &str = "reported";
pub const INVALID: &str = "invalid";
pub const FIRST_SEEN: &str = "first_seen";
pub const LAST_SEEN: &str = "last_seen";
pub const COUNT: &str = "count";
pub const EXIT_CODE: &str = "exit_code";
pub const STDOUT: &str = "stdout";
pub const STDERR: &str = "stderr";
pub const TIME: &str = "time";

/// A single field value of an [`Issue`].
///
/// Serialized untagged so that persisted issues read as plain JSON documents.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl Value {
    /// Textual view of the value; `None` for null.
    ///
    /// Bytes are decoded lossily, which is what every regex and join based
    /// consumer of issue fields expects.
    pub fn as_text(&self) -> Option<Cow<'_, str>> {
        match self {
            Value::Null => None,
            Value::Bool(b) => Some(Cow::Owned(b.to_string())),
            Value::Int(i) => Some(Cow::Owned(i.to_string())),
            Value::Float(f) => Some(Cow::Owned(f.to_string())),
            Value::Text(s) => Some(Cow::Borrowed(s)),
            Value::Bytes(b) => Some(String::from_utf8_lossy(b)),
        }
    }

    pub fn as_bytes(&self) -> Option<Cow<'_, [u8]>> {
        match self {
            Value::Bytes(b) => Some(Cow::Borrowed(b)),
            Value::Text(s) => Some(Cow::Borrowed(s.as_bytes())),
            Value::Null => None,
            other => other.as_text().map(|t| Cow::Owned(t.into_owned().into_bytes())),
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Float(f) => Some(*f as i64),
            Value::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Truthiness as used by filters that only care whether a field is set.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Text(s) => !s.is_empty(),
            Value::Bytes(b) => !b.is_empty(),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i64::from(i))
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(b)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.as_text() {
            Some(text) => f.write_str(&text),
            None => f.write_str("null"),
        }
    }
}

/// A finding reported by a SUT call: an open mapping from field name to value.
///
/// Fields that carry meaning across the system are named by the constants of
/// this module (`id`, `sut`, `fuzzer`, `test`, ...). Anything else is free-form
/// data attached by calls and decorators.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(transparent)]
pub struct Issue {
    fields: BTreeMap<String, Value>,
}

impl Issue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Text of a field, treating null and missing the same way.
    pub fn text(&self, key: &str) -> Option<Cow<'_, str>> {
        self.fields.get(key).and_then(Value::as_text)
    }

    pub fn insert(&mut self, key: &str, value: impl Into<Value>) -> Option<Value> {
        self.fields.insert(key.to_string(), value.into())
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.fields.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    /// True when the field is present and not null.
    pub fn has(&self, key: &str) -> bool {
        self.fields.get(key).is_some_and(|v| !v.is_null())
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn clear(&mut self) {
        self.fields.clear();
    }

    /// Copies every field of `other` into `self`, overwriting existing keys.
    pub fn extend(&mut self, other: &Issue) {
        for (k, v) in &other.fields {
            self.fields.insert(k.clone(), v.clone());
        }
    }

    pub fn id(&self) -> Option<Cow<'_, str>> {
        self.text(ID)
    }

    pub fn oid(&self) -> Option<Cow<'_, str>> {
        self.text(OID)
    }

    pub fn test(&self) -> Option<Cow<'_, [u8]>> {
        self.fields.get(TEST).and_then(Value::as_bytes)
    }

    pub fn sut(&self) -> Option<Cow<'_, str>> {
        self.text(SUT)
    }

    pub fn fuzzer(&self) -> Option<Cow<'_, str>> {
        self.text(FUZZER)
    }

    /// Fills in `id` from the test content when the call did not provide one.
    pub fn ensure_id(&mut self) {
        if self.id().is_none_or(|id| id.is_empty()) {
            let digest = test_digest(self.test().as_deref().unwrap_or_default());
            self.insert(ID, digest);
        }
    }

    /// Equality over the given fields only, used by repository filters.
    pub fn matches(&self, filter: &Issue) -> bool {
        filter
            .iter()
            .all(|(k, v)| self.get(k).unwrap_or(&Value::Null) == v)
    }
}

impl FromIterator<(String, Value)> for Issue {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        Self {
            fields: iter.into_iter().collect(),
        }
    }
}

/// MD5 hex digest of a test case, the fallback identity of an issue.
pub fn test_digest(test: &[u8]) -> String {
    format!("{:x}", md5::compute(test))
}

/// Result of a single SUT call.
///
/// `NonIssue` still carries data (exit code, streams, timing) for decorators
/// that want to inspect it, but it never counts as a finding.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Issue(Issue),
    NonIssue(Issue),
    Empty,
}

impl Outcome {
    pub fn is_issue(&self) -> bool {
        matches!(self, Outcome::Issue(_))
    }

    pub fn fields(&self) -> Option<&Issue> {
        match self {
            Outcome::Issue(i) | Outcome::NonIssue(i) => Some(i),
            Outcome::Empty => None,
        }
    }

    pub fn fields_mut(&mut self) -> Option<&mut Issue> {
        match self {
            Outcome::Issue(i) | Outcome::NonIssue(i) => Some(i),
            Outcome::Empty => None,
        }
    }

    pub fn into_issue(self) -> Option<Issue> {
        match self {
            Outcome::Issue(i) => Some(i),
            _ => None,
        }
    }

    /// Demotes an issue to a non-issue, keeping its data.
    pub fn demote(self) -> Outcome {
        match self {
            Outcome::Issue(i) => Outcome::NonIssue(i),
            other => other,
        }
    }

    pub fn from_fields(fields: Issue, is_issue: bool) -> Outcome {
        if is_issue {
            Outcome::Issue(fields)
        } else {
            Outcome::NonIssue(fields)
        }
    }
}
