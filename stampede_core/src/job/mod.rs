//! The units of work the controller schedules.
//!
//! A job is described by a serializable [`JobSpec`] and executed with a
//! [`JobContext`] in a worker. Running a job yields the issues it found for
//! the first time; the controller schedules follow-up work for those.

use crate::call::{Call, CallError};
use crate::config::{Config, ConfigError, FUZZ_PREFIX, Limit, SUT_PREFIX};
use crate::fuzzer::FuzzerError;
use crate::issue::{self, Issue, Value};
use crate::listener::{Event, EventSink};
use crate::process;
use crate::reduce::ReduceError;
use crate::registry::{BuildContext, Registry};
use crate::repository::{IssueQuery, Repository, RepositoryError};
use crate::update::UpdateError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

pub mod fuzz;
pub mod reduce;
pub mod update;
pub mod validate;

pub use fuzz::FuzzJob;
pub use reduce::ReduceJob;
pub use update::UpdateJob;
pub use validate::ValidateJob;

#[derive(Error, Debug)]
pub enum JobError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Call(#[from] CallError),
    #[error(transparent)]
    Fuzzer(#[from] FuzzerError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    Reduce(#[from] ReduceError),
    #[error(transparent)]
    Update(#[from] UpdateError),
    #[error("Job I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Issue cannot be replayed: {0}")]
    InvalidIssue(String),
    #[error("Job cancelled")]
    Cancelled,
}

/// Cooperative cancellation flag shared between a job and whoever runs it.
///
/// A process-wide interrupt (SIGINT) cancels every token.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst) || process::interrupted()
    }

    pub fn check(&self) -> Result<(), JobError> {
        if self.is_cancelled() {
            Err(JobError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// What a worker should run.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobSpec {
    Fuzz { fuzzer: String, subconfig: String },
    Validate { issue: Issue },
    Reduce { issue: Issue },
    Update { sut: String },
}

pub(crate) fn issue_sut(issue: &Issue) -> Result<String, ConfigError> {
    issue
        .sut()
        .map(|s| s.into_owned())
        .ok_or_else(|| ConfigError::MissingOption {
            section: "issue".to_string(),
            option: issue::SUT.to_string(),
        })
}

impl JobSpec {
    pub fn kind(&self) -> &'static str {
        match self {
            JobSpec::Fuzz { .. } => "fuzz",
            JobSpec::Validate { .. } => "validate",
            JobSpec::Reduce { .. } => "reduce",
            JobSpec::Update { .. } => "update",
        }
    }

    pub fn sut(&self, config: &Config) -> Result<String, ConfigError> {
        match self {
            JobSpec::Fuzz { fuzzer, .. } => config.require_str(&format!("{FUZZ_PREFIX}{fuzzer}"), "sut"),
            JobSpec::Validate { issue } | JobSpec::Reduce { issue } => issue_sut(issue),
            JobSpec::Update { sut } => Ok(sut.clone()),
        }
    }

    /// Load units the job occupies, clamped to `budget`.
    ///
    /// Fuzz jobs cost the SUT's `cost`; validation and reduction prefer
    /// `validate_cost` and `reduce_cost`; an update takes the whole budget
    /// unless `update_cost` says otherwise.
    pub fn cost(&self, config: &Config, budget: usize) -> Result<usize, ConfigError> {
        let section = format!("{SUT_PREFIX}{}", self.sut(config)?);
        let base = config.get_int(&section, "cost")?;
        let specific = match self {
            JobSpec::Fuzz { .. } => None,
            JobSpec::Validate { .. } => config.get_int(&section, "validate_cost")?,
            JobSpec::Reduce { .. } => config.get_int(&section, "reduce_cost")?,
            JobSpec::Update { .. } => Some(
                config
                    .get_int(&section, "update_cost")?
                    .unwrap_or(budget as i64),
            ),
        };
        let cost = specific.or(base).unwrap_or(1).max(0) as usize;
        Ok(cost.min(budget))
    }

    /// The event announcing this job to listeners.
    pub fn added_event(&self, job_id: u64, cost: usize, config: &Config) -> Event {
        let sut = self.sut(config).unwrap_or_default();
        match self {
            JobSpec::Fuzz { fuzzer, .. } => Event::FuzzJobAdded {
                job_id,
                cost,
                sut,
                fuzzer: fuzzer.clone(),
                batch: config
                    .get_limit(&format!("{FUZZ_PREFIX}{fuzzer}"), "batch")
                    .ok()
                    .flatten()
                    .and_then(|limit| match limit {
                        Limit::Finite(n) => Some(n),
                        Limit::Infinite => None,
                    }),
            },
            JobSpec::Validate { issue } => Event::ValidateJobAdded {
                job_id,
                cost,
                sut,
                fuzzer: issue.fuzzer().unwrap_or_default().into_owned(),
                issue_id: issue.id().unwrap_or_default().into_owned(),
            },
            JobSpec::Reduce { issue } => Event::ReduceJobAdded {
                job_id,
                cost,
                sut,
                fuzzer: issue.fuzzer().unwrap_or_default().into_owned(),
                issue_id: issue.id().unwrap_or_default().into_owned(),
                size: issue.test().map_or(0, |t| t.len()),
            },
            JobSpec::Update { .. } => Event::UpdateJobAdded { job_id, cost, sut },
        }
    }
}

/// Everything a running job needs from its environment.
#[derive(Clone)]
pub struct JobContext {
    pub job_id: u64,
    pub config: Arc<Config>,
    pub registry: Arc<Registry>,
    pub repository: Arc<dyn Repository>,
    pub events: Arc<dyn EventSink>,
    /// Scratch directory of this job.
    pub work_dir: PathBuf,
    pub cancel: CancelToken,
}

impl JobContext {
    pub fn emit(&self, event: Event) {
        self.events.emit(event);
    }

    pub fn warning(&self, message: impl Into<String>) {
        self.emit(Event::Warning {
            job_id: Some(self.job_id),
            message: message.into(),
        });
    }

    pub fn build_context(&self) -> BuildContext {
        BuildContext::new(&self.work_dir)
    }

    /// Attaches the job's identity to a freshly found `issue` and stores it.
    ///
    /// A first sighting is appended to `new_issues` and announced with
    /// `IssueAdded`; a repeated one only with `IssueUpdated`.
    pub fn add_issue(
        &self,
        sut: &str,
        fuzzer: &str,
        subconfig: Option<&str>,
        mut found: Issue,
        new_issues: &mut Vec<Issue>,
    ) -> Result<(), JobError> {
        found.insert(issue::SUT, sut);
        found.insert(issue::FUZZER, fuzzer);
        found.insert(issue::SUBCONFIG, subconfig.map_or(Value::Null, Value::from));
        found.insert(issue::REDUCED, Value::Null);
        found.insert(issue::REPORTED, false);
        found.remove(issue::INVALID);
        found.ensure_id();

        if self.repository.add_issue(&mut found)? {
            new_issues.push(found.clone());
            self.emit(Event::IssueAdded {
                job_id: self.job_id,
                issue: found,
            });
        } else {
            self.emit(Event::IssueUpdated {
                job_id: self.job_id,
                issue: found,
            });
        }
        Ok(())
    }

    /// The stored object id of `issue`, looked up by `(sut, id)` when the
    /// issue did not come from the repository.
    pub fn resolve_oid(&self, issue: &Issue) -> Result<Option<String>, JobError> {
        if let Some(oid) = issue.oid() {
            return Ok(Some(oid.into_owned()));
        }
        let (Some(sut), Some(id)) = (issue.sut(), issue.id()) else {
            return Ok(None);
        };
        let query = IssueQuery {
            filter: Issue::new().with(issue::SUT, &*sut).with(issue::ID, &*id),
            limit: Some(1),
            ..IssueQuery::default()
        };
        Ok(self
            .repository
            .get_issues(&query)?
            .into_iter()
            .next()
            .and_then(|stored| stored.oid().map(|o| o.into_owned())))
    }
}

/// Runs `f` inside the `enter`/`exit` scope of `call`; `exit` runs even if
/// `f` fails, and the first error wins.
pub fn with_call<R>(
    call: &mut dyn Call,
    f: impl FnOnce(&mut dyn Call) -> Result<R, JobError>,
) -> Result<R, JobError> {
    call.enter()?;
    let result = f(call);
    let exit = call.exit();
    let value = result?;
    exit?;
    Ok(value)
}

/// Runs the job described by `spec`.
pub fn run_job(spec: &JobSpec, ctx: &JobContext) -> Result<Vec<Issue>, JobError> {
    std::fs::create_dir_all(&ctx.work_dir)?;
    match spec {
        JobSpec::Fuzz { fuzzer, subconfig } => FuzzJob::new(&ctx.config, fuzzer, subconfig)?.run(ctx),
        JobSpec::Validate { issue } => ValidateJob::new(issue.clone()).run(ctx),
        JobSpec::Reduce { issue } => ReduceJob::new(&ctx.config, issue.clone())?.run(ctx),
        JobSpec::Update { sut } => UpdateJob::new(sut).run(ctx),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::listener::EventLog;
    use crate::repository::MemoryRepository;

    pub(crate) struct Fixture {
        pub ctx: JobContext,
        pub events: EventLog,
        pub repository: Arc<MemoryRepository>,
        pub _dir: tempfile::TempDir,
    }

    /// A job context over an in-memory repository that records events.
    pub(crate) fn fixture(config: &str) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let events = EventLog::new();
        let repository = Arc::new(MemoryRepository::new());
        let ctx = JobContext {
            job_id: 7,
            config: Arc::new(Config::from_toml_str(config).unwrap()),
            registry: Arc::new(Registry::with_builtins()),
            repository: repository.clone(),
            events: Arc::new(events.clone()),
            work_dir: dir.path().join("job"),
            cancel: CancelToken::new(),
        };
        Fixture {
            ctx,
            events,
            repository,
            _dir: dir,
        }
    }

    pub(crate) fn names(events: &[Event]) -> Vec<String> {
        events
            .iter()
            .map(|e| {
                serde_json::to_value(e).unwrap()["event"]
                    .as_str()
                    .unwrap()
                    .to_string()
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    const CONFIG: &str = r#"
[fuzzinator]
cost_budget = 4

[sut.x]
call = "SubprocessCall"
cost = 2
reduce_cost = 3

[fuzz.x-random]
sut = "x"
fuzzer = "RandomContent"
batch = 5
"#;

    #[test]
    fn test_costs_follow_the_sut_section() {
        let config = Config::from_toml_str(CONFIG).unwrap();
        let issue = Issue::new().with(issue::SUT, "x");
        let fuzz = JobSpec::Fuzz {
            fuzzer: "x-random".into(),
            subconfig: "abcdef012".into(),
        };
        assert_eq!(fuzz.cost(&config, 4).unwrap(), 2);
        assert_eq!(JobSpec::Validate { issue: issue.clone() }.cost(&config, 4).unwrap(), 2);
        assert_eq!(JobSpec::Reduce { issue }.cost(&config, 4).unwrap(), 3);
        let reduce = JobSpec::Reduce {
            issue: Issue::new().with(issue::SUT, "x"),
        };
        assert_eq!(reduce.cost(&config, 1).unwrap(), 1, "Clamped to the budget");
        assert_eq!(JobSpec::Update { sut: "x".into() }.cost(&config, 4).unwrap(), 4);
        assert_eq!(
            fuzz.added_event(1, 2, &config),
            Event::FuzzJobAdded {
                job_id: 1,
                cost: 2,
                sut: "x".into(),
                fuzzer: "x-random".into(),
                batch: Some(5)
            }
        );
    }

    #[test]
    fn test_job_spec_wire_format() {
        let spec = JobSpec::Update { sut: "x".into() };
        let json = serde_json::to_string(&spec).unwrap();
        assert_eq!(json, r#"{"kind":"update","sut":"x"}"#);
        assert_eq!(serde_json::from_str::<JobSpec>(&json).unwrap(), spec);
    }

    #[test]
    fn test_add_issue_sets_identity_and_notifies_once() {
        let fx = fixture(CONFIG);
        let mut new_issues = Vec::new();
        let found = Issue::new()
            .with(issue::TEST, b"trigger".to_vec())
            .with(issue::REPORTED, "http://tracker/1");
        fx.ctx
            .add_issue("x", "x-random", Some("abcdef012"), found.clone(), &mut new_issues)
            .unwrap();
        fx.ctx
            .add_issue("x", "x-random", Some("abcdef012"), found, &mut new_issues)
            .unwrap();

        assert_eq!(new_issues.len(), 1);
        let stored = &new_issues[0];
        assert_eq!(stored.id().as_deref(), Some(issue::test_digest(b"trigger").as_str()));
        assert_eq!(stored.get(issue::REPORTED), Some(&Value::Bool(false)));
        assert_eq!(stored.get(issue::REDUCED), Some(&Value::Null));
        assert_eq!(stored.text(issue::SUBCONFIG).as_deref(), Some("abcdef012"));
        assert_eq!(names(&fx.events.events()), vec!["issue_added", "issue_updated"]);
        let lookup = Issue::new()
            .with(issue::SUT, "x")
            .with(issue::ID, &*stored.id().unwrap());
        assert_eq!(
            fx.ctx.resolve_oid(&lookup).unwrap(),
            stored.oid().map(|o| o.into_owned())
        );
    }

    #[test]
    fn test_cancel_token() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(token.check().is_ok());
        clone.cancel();
        assert!(matches!(token.check(), Err(JobError::Cancelled)));
    }
}
