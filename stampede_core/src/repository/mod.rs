//! Persistent store of issues, statistics and configuration fingerprints.
//!
//! The semantics live in [`RepositoryState`]; backends only decide where the
//! state is kept and how concurrent access is serialized.

use crate::issue::{self, Issue, Value};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering as AtomicOrdering};
use std::time::Duration;
use thiserror::Error;

pub mod file;
pub mod memory;

pub use file::JsonFileRepository;
pub use memory::MemoryRepository;

#[derive(Error, Debug)]
pub enum RepositoryError {
    #[error("Repository I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Corrupt repository file {path:?}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("Timed out after {0:?} waiting for the repository lock")]
    LockTimeout(Duration),
    #[error("Unsupported repository URI '{0}'")]
    Uri(String),
}

/// Fields kept by non-detailed issue queries.
pub const SUMMARY_FIELDS: &[&str] = &[
    issue::OID,
    issue::ID,
    issue::SUT,
    issue::FUZZER,
    issue::SUBCONFIG,
    issue::FIRST_SEEN,
    issue::LAST_SEEN,
    issue::COUNT,
    issue::REDUCED,
    issue::REPORTED,
    issue::INVALID,
];

static LAST_TIMESTAMP: AtomicI64 = AtomicI64::new(0);

/// Current UTC time as RFC 3339 with microseconds. Strictly increasing
/// within one process, so two updates never share a timestamp.
pub fn timestamp() -> String {
    let now = Utc::now().timestamp_micros();
    let mut previous = LAST_TIMESTAMP.load(AtomicOrdering::SeqCst);
    let micros = loop {
        let next = now.max(previous + 1);
        match LAST_TIMESTAMP.compare_exchange(previous, next, AtomicOrdering::SeqCst, AtomicOrdering::SeqCst) {
            Ok(_) => break next,
            Err(actual) => previous = actual,
        }
    };
    DateTime::<Utc>::from_timestamp_micros(micros)
        .unwrap_or_else(Utc::now)
        .to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// A fresh 24 hex digit object id: seconds since the epoch followed by
/// random bits.
pub fn object_id() -> String {
    let seconds = Utc::now().timestamp() as u32;
    let random: u64 = rand::random();
    format!("{seconds:08x}{random:016x}")
}

/// One `(sut, fuzzer, subconfig)` combination active in a session, with the
/// configuration projection its fingerprint was computed from.
#[derive(Debug, Clone, PartialEq)]
pub struct FuzzerConfig {
    pub sut: String,
    pub fuzzer: String,
    pub subconfig: String,
    pub projection: serde_json::Value,
}

/// Raw counters of one `(sut, fuzzer, subconfig)` combination.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct StatRecord {
    pub sut: String,
    pub fuzzer: String,
    #[serde(default)]
    pub subconfig: Option<String>,
    #[serde(default)]
    pub exec: u64,
    #[serde(default)]
    pub issues: u64,
    #[serde(default)]
    pub elapsed_time: f64,
    #[serde(default)]
    pub last_update: Option<String>,
}

/// A statistics row as returned by queries: counters plus the number of
/// distinct valid issues.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct StatRow {
    pub sut: String,
    pub fuzzer: String,
    pub subconfig: Option<String>,
    pub exec: u64,
    pub issues: u64,
    pub unique: u64,
    pub elapsed_time: f64,
}

impl StatRow {
    fn field(&self, name: &str) -> Value {
        match name {
            "sut" => Value::from(self.sut.as_str()),
            "fuzzer" => Value::from(self.fuzzer.as_str()),
            "subconfig" => self.subconfig.as_deref().map_or(Value::Null, Value::from),
            "exec" => Value::Int(self.exec as i64),
            "issues" => Value::Int(self.issues as i64),
            "unique" => Value::Int(self.unique as i64),
            "elapsed_time" => Value::Float(self.elapsed_time),
            _ => Value::Null,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sort {
    pub field: String,
    pub descending: bool,
}

impl Sort {
    pub fn ascending(field: &str) -> Self {
        Self {
            field: field.to_string(),
            descending: false,
        }
    }

    pub fn descending(field: &str) -> Self {
        Self {
            field: field.to_string(),
            descending: true,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct IssueQuery {
    /// Equality filter over issue fields.
    pub filter: Issue,
    pub skip: usize,
    pub limit: Option<usize>,
    pub sort: Option<Sort>,
    pub include_invalid: bool,
    /// Only issues first seen at or after this timestamp.
    pub session_start: Option<String>,
    pub detailed: bool,
}

impl IssueQuery {
    pub fn detailed() -> Self {
        Self {
            detailed: true,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct StatsQuery {
    /// Equality filter over `sut`, `fuzzer` and `subconfig`.
    pub filter: Issue,
    pub skip: usize,
    pub limit: Option<usize>,
    pub sort: Option<Sort>,
    /// Only statistics updated (and issues first seen) since this timestamp.
    pub session_start: Option<String>,
    /// A snapshot whose counters are subtracted from the result.
    pub session_baseline: Option<Vec<StatRow>>,
    /// Per-subconfig rows instead of one aggregate per `(sut, fuzzer)`.
    pub detailed: bool,
}

/// Orders values of mixed types: null first, numbers numerically, everything
/// else by its text.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Less,
        (_, Value::Null) => Ordering::Greater,
        _ => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) if !matches!(a, Value::Text(_)) && !matches!(b, Value::Text(_)) => {
                x.partial_cmp(&y).unwrap_or(Ordering::Equal)
            }
            _ => a.as_text().cmp(&b.as_text()),
        },
    }
}

fn page<T>(items: Vec<T>, skip: usize, limit: Option<usize>) -> Vec<T> {
    items
        .into_iter()
        .skip(skip)
        .take(limit.unwrap_or(usize::MAX))
        .collect()
}

/// Issues, statistics and configurations, with the semantics shared by all
/// backends.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct RepositoryState {
    #[serde(default)]
    pub issues: Vec<Issue>,
    #[serde(default)]
    pub stats: Vec<StatRecord>,
    #[serde(default)]
    pub configs: BTreeMap<String, serde_json::Value>,
}

impl RepositoryState {
    pub fn init(&mut self, fuzzers: &[FuzzerConfig]) {
        for config in fuzzers {
            self.stat_mut(&config.sut, &config.fuzzer, &config.subconfig);
            self.configs
                .entry(config.subconfig.clone())
                .or_insert_with(|| config.projection.clone());
        }
    }

    fn stat_mut(&mut self, sut: &str, fuzzer: &str, subconfig: &str) -> &mut StatRecord {
        let position = self.stats.iter().position(|s| {
            s.sut == sut && s.fuzzer == fuzzer && s.subconfig.as_deref() == Some(subconfig)
        });
        let index = match position {
            Some(index) => index,
            None => {
                self.stats.push(StatRecord {
                    sut: sut.to_string(),
                    fuzzer: fuzzer.to_string(),
                    subconfig: Some(subconfig.to_string()),
                    ..StatRecord::default()
                });
                self.stats.len() - 1
            }
        };
        &mut self.stats[index]
    }

    fn position_by_oid(&self, oid: &str) -> Option<usize> {
        self.issues
            .iter()
            .position(|i| i.oid().as_deref() == Some(oid))
    }

    /// Upserts `issue` over `(sut, id)` among valid issues.
    ///
    /// A new record gets an object id, `first_seen` and a count of one; a
    /// known one gets its `last_seen` bumped and its count incremented, but
    /// otherwise keeps its stored fields. Either way `issue` is refreshed
    /// from the stored record.
    ///
    /// # Returns
    ///
    /// `true` if the issue was inserted, `false` if an existing record was
    /// updated.
    pub fn add_issue(&mut self, issue: &mut Issue) -> bool {
        issue.ensure_id();
        let now = timestamp();
        let existing = self.issues.iter_mut().find(|stored| {
            !stored.has(issue::INVALID) && stored.sut() == issue.sut() && stored.id() == issue.id()
        });
        match existing {
            Some(stored) => {
                let count = stored.get(issue::COUNT).and_then(Value::as_i64).unwrap_or(0);
                stored.insert(issue::COUNT, count + 1);
                stored.insert(issue::LAST_SEEN, now);
                *issue = stored.clone();
                false
            }
            None => {
                let mut stored = issue.clone();
                stored.remove(issue::INVALID);
                stored.insert(issue::OID, object_id());
                stored.insert(issue::FIRST_SEEN, now.clone());
                stored.insert(issue::LAST_SEEN, now);
                stored.insert(issue::COUNT, 1);
                *issue = stored.clone();
                self.issues.push(stored);
                true
            }
        }
    }

    pub fn get_issues(&self, query: &IssueQuery) -> Vec<Issue> {
        let mut issues: Vec<Issue> = self
            .issues
            .iter()
            .filter(|i| query.include_invalid || !i.has(issue::INVALID))
            .filter(|i| i.matches(&query.filter))
            .filter(|i| match &query.session_start {
                Some(start) => i.text(issue::FIRST_SEEN).is_some_and(|seen| *seen >= **start),
                None => true,
            })
            .cloned()
            .collect();
        if let Some(sort) = &query.sort {
            issues.sort_by(|a, b| {
                let ordering = compare_values(
                    a.get(&sort.field).unwrap_or(&Value::Null),
                    b.get(&sort.field).unwrap_or(&Value::Null),
                );
                if sort.descending { ordering.reverse() } else { ordering }
            });
        }
        let mut issues = page(issues, query.skip, query.limit);
        if !query.detailed {
            for issue in &mut issues {
                *issue = issue
                    .iter()
                    .filter(|(key, _)| SUMMARY_FIELDS.contains(key))
                    .map(|(key, value)| (key.to_string(), value.clone()))
                    .collect();
            }
        }
        issues
    }

    pub fn find_issue_by_oid(&self, oid: &str) -> Option<Issue> {
        self.position_by_oid(oid).map(|i| self.issues[i].clone())
    }

    pub fn find_issues_by_suts(&self, suts: &[String]) -> Vec<Issue> {
        self.issues
            .iter()
            .filter(|i| i.sut().is_some_and(|sut| suts.iter().any(|s| *s == *sut)))
            .cloned()
            .collect()
    }

    /// Copies the fields of `patch` onto the record. Returns `false` if
    /// there is no such record.
    pub fn update_issue_by_oid(&mut self, oid: &str, patch: &Issue) -> bool {
        let Some(index) = self.position_by_oid(oid) else {
            return false;
        };
        let stored = &mut self.issues[index];
        for (key, value) in patch.iter() {
            if key != issue::OID {
                stored.insert(key, value.clone());
            }
        }
        true
    }

    /// Marks the record invalid. Returns `false` if it was already invalid
    /// (or missing), leaving the original timestamp untouched.
    pub fn invalidate_issue_by_oid(&mut self, oid: &str) -> bool {
        let Some(index) = self.position_by_oid(oid) else {
            return false;
        };
        let stored = &mut self.issues[index];
        if stored.has(issue::INVALID) {
            return false;
        }
        stored.insert(issue::INVALID, timestamp());
        true
    }

    pub fn remove_issue_by_oid(&mut self, oid: &str) -> bool {
        match self.position_by_oid(oid) {
            Some(index) => {
                self.issues.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn find_config_by_id(&self, subconfig: &str) -> Option<serde_json::Value> {
        self.configs.get(subconfig).cloned()
    }

    pub fn update_stat(&mut self, sut: &str, fuzzer: &str, subconfig: &str, exec: u64, issues: u64, elapsed: f64) {
        let stat = self.stat_mut(sut, fuzzer, subconfig);
        stat.exec += exec;
        stat.issues += issues;
        stat.elapsed_time += elapsed;
        stat.last_update = Some(timestamp());
    }

    fn unique(&self, sut: &str, fuzzer: &str, subconfig: Option<&str>, session_start: Option<&str>) -> u64 {
        self.issues
            .iter()
            .filter(|i| !i.has(issue::INVALID))
            .filter(|i| i.sut().as_deref() == Some(sut) && i.fuzzer().as_deref() == Some(fuzzer))
            .filter(|i| subconfig.is_none() || i.text(issue::SUBCONFIG).as_deref() == subconfig)
            .filter(|i| match session_start {
                Some(start) => i.text(issue::FIRST_SEEN).is_some_and(|seen| *seen >= *start),
                None => true,
            })
            .count() as u64
    }

    pub fn get_stats(&self, query: &StatsQuery) -> Vec<StatRow> {
        let session_start = query.session_start.as_deref();
        let mut rows: Vec<StatRow> = Vec::new();
        for stat in &self.stats {
            if let Some(start) = session_start
                && stat.last_update.as_deref().is_none_or(|updated| updated < start)
            {
                continue;
            }
            let subconfig = if query.detailed { stat.subconfig.clone() } else { None };
            let position = rows
                .iter()
                .position(|r| r.sut == stat.sut && r.fuzzer == stat.fuzzer && r.subconfig == subconfig);
            let row = match position {
                Some(index) => &mut rows[index],
                None => {
                    rows.push(StatRow {
                        sut: stat.sut.clone(),
                        fuzzer: stat.fuzzer.clone(),
                        subconfig,
                        ..StatRow::default()
                    });
                    let last = rows.len() - 1;
                    &mut rows[last]
                }
            };
            row.exec += stat.exec;
            row.issues += stat.issues;
            row.elapsed_time += stat.elapsed_time;
        }

        for row in &mut rows {
            row.unique = self.unique(&row.sut, &row.fuzzer, row.subconfig.as_deref(), session_start);
            if let Some(baseline) = &query.session_baseline
                && let Some(base) = baseline
                    .iter()
                    .find(|b| b.sut == row.sut && b.fuzzer == row.fuzzer && b.subconfig == row.subconfig)
            {
                row.exec = row.exec.saturating_sub(base.exec);
                row.issues = row.issues.saturating_sub(base.issues);
                row.unique = row.unique.saturating_sub(base.unique);
                row.elapsed_time = (row.elapsed_time - base.elapsed_time).max(0.0);
            }
        }

        rows.retain(|row| query.filter.iter().all(|(key, value)| row.field(key) == *value));
        if let Some(sort) = &query.sort {
            rows.sort_by(|a, b| {
                let ordering = compare_values(&a.field(&sort.field), &b.field(&sort.field));
                if sort.descending { ordering.reverse() } else { ordering }
            });
        }
        page(rows, query.skip, query.limit)
    }
}

/// The operations the controller and jobs need from the issue store.
pub trait Repository: Send + Sync {
    /// Registers the `(sut, fuzzer, subconfig)` combinations of a session:
    /// creates empty statistics and persists the configuration projections.
    fn init(&self, fuzzers: &[FuzzerConfig]) -> Result<(), RepositoryError>;

    /// Upserts an issue; see [`RepositoryState::add_issue`].
    fn add_issue(&self, issue: &mut Issue) -> Result<bool, RepositoryError>;

    fn get_issues(&self, query: &IssueQuery) -> Result<Vec<Issue>, RepositoryError>;

    fn find_issue_by_oid(&self, oid: &str) -> Result<Option<Issue>, RepositoryError>;

    fn find_issues_by_suts(&self, suts: &[String]) -> Result<Vec<Issue>, RepositoryError>;

    fn update_issue_by_oid(&self, oid: &str, patch: &Issue) -> Result<bool, RepositoryError>;

    fn invalidate_issue_by_oid(&self, oid: &str) -> Result<bool, RepositoryError>;

    fn remove_issue_by_oid(&self, oid: &str) -> Result<bool, RepositoryError>;

    fn find_config_by_id(&self, subconfig: &str) -> Result<Option<serde_json::Value>, RepositoryError>;

    fn get_stats(&self, query: &StatsQuery) -> Result<Vec<StatRow>, RepositoryError>;

    fn update_stat(
        &self,
        sut: &str,
        fuzzer: &str,
        subconfig: &str,
        exec: u64,
        issues: u64,
        elapsed: f64,
    ) -> Result<(), RepositoryError>;
}

/// Where a backend keeps its [`RepositoryState`].
pub trait StateStore: Send + Sync {
    fn read<R>(&self, f: impl FnOnce(&RepositoryState) -> R) -> Result<R, RepositoryError>;

    fn write<R>(&self, f: impl FnOnce(&mut RepositoryState) -> R) -> Result<R, RepositoryError>;
}

impl<S: StateStore> Repository for S {
    fn init(&self, fuzzers: &[FuzzerConfig]) -> Result<(), RepositoryError> {
        self.write(|state| state.init(fuzzers))
    }

    fn add_issue(&self, issue: &mut Issue) -> Result<bool, RepositoryError> {
        self.write(|state| state.add_issue(issue))
    }

    fn get_issues(&self, query: &IssueQuery) -> Result<Vec<Issue>, RepositoryError> {
        self.read(|state| state.get_issues(query))
    }

    fn find_issue_by_oid(&self, oid: &str) -> Result<Option<Issue>, RepositoryError> {
        self.read(|state| state.find_issue_by_oid(oid))
    }

    fn find_issues_by_suts(&self, suts: &[String]) -> Result<Vec<Issue>, RepositoryError> {
        self.read(|state| state.find_issues_by_suts(suts))
    }

    fn update_issue_by_oid(&self, oid: &str, patch: &Issue) -> Result<bool, RepositoryError> {
        self.write(|state| state.update_issue_by_oid(oid, patch))
    }

    fn invalidate_issue_by_oid(&self, oid: &str) -> Result<bool, RepositoryError> {
        self.write(|state| state.invalidate_issue_by_oid(oid))
    }

    fn remove_issue_by_oid(&self, oid: &str) -> Result<bool, RepositoryError> {
        self.write(|state| state.remove_issue_by_oid(oid))
    }

    fn find_config_by_id(&self, subconfig: &str) -> Result<Option<serde_json::Value>, RepositoryError> {
        self.read(|state| state.find_config_by_id(subconfig))
    }

    fn get_stats(&self, query: &StatsQuery) -> Result<Vec<StatRow>, RepositoryError> {
        self.read(|state| state.get_stats(query))
    }

    fn update_stat(
        &self,
        sut: &str,
        fuzzer: &str,
        subconfig: &str,
        exec: u64,
        issues: u64,
        elapsed: f64,
    ) -> Result<(), RepositoryError> {
        self.write(|state| state.update_stat(sut, fuzzer, subconfig, exec, issues, elapsed))
    }
}

/// Opens the store named by `uri`: `memory:` for an in-process store,
/// `file:<path>` or a bare path for a JSON file shared between processes.
pub fn open_repository(uri: &str, lock_timeout: Duration) -> Result<Arc<dyn Repository>, RepositoryError> {
    let uri = uri.trim();
    if uri == "memory:" {
        return Ok(Arc::new(MemoryRepository::new()));
    }
    let path = uri.strip_prefix("file:").unwrap_or(uri);
    if path.is_empty() || (path.contains("://") && !uri.starts_with("file:")) {
        return Err(RepositoryError::Uri(uri.to_string()));
    }
    Ok(Arc::new(JsonFileRepository::new(path, lock_timeout)))
}

/// True when `uri` names a store that lives only inside this process.
pub fn is_in_process(uri: &str) -> bool {
    uri.trim() == "memory:"
}
