//! The scheduler of a fuzz session.
//!
//! The controller owns the job queue and the cost budget. It picks fuzz jobs
//! round-robin, starts jobs through a [`Launcher`] whenever their cost fits,
//! forwards worker events to the listeners, and turns newly found issues
//! into reduce or validate jobs.

use crate::config::{Config, ConfigError, FUZZ_PREFIX, LISTENERS_SECTION, Limit, SUT_PREFIX, SessionSettings};
use crate::issue::{self, Issue, Value};
use crate::job::JobSpec;
use crate::listener::{Event, EventSink, Listener, ListenerManager};
use crate::process;
use crate::registry::{BuildContext, Registry};
use crate::repository::{FuzzerConfig, Repository, RepositoryError, is_in_process, open_repository};
use crate::worker::{Delivery, Launcher, ThreadLauncher, WorkerHandle, WorkerMessage, WorkerRequest};
use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

const DEFAULT_POLL: Duration = Duration::from_secs(1);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum ControllerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error("Failed to start the worker of job {job_id}: {source}")]
    Launch {
        job_id: u64,
        #[source]
        source: std::io::Error,
    },
    #[error("Repository '{0}' lives in memory and cannot be shared with worker processes")]
    InProcessRepository(String),
    #[error("Controller I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A job to add, before the controller has assigned it an id.
#[derive(Debug, Clone, PartialEq)]
pub enum NewJob {
    Fuzz { fuzzer: String },
    Validate { issue: Issue },
    Reduce { issue: Issue },
    Update { sut: String },
}

/// A request to a running controller.
#[derive(Debug, Clone, PartialEq)]
pub enum Submission {
    /// Priority jobs go to the head of the queue and cost nothing.
    Add { job: NewJob, priority: bool },
    /// Validate every valid issue of one SUT, or of all of them.
    ValidateAll { sut: Option<String> },
    /// Reduce every valid, unreported, unreduced issue.
    ReduceAll { sut: Option<String> },
    Cancel { job_id: u64 },
    Stop,
}

type SharedQueue = Arc<Mutex<VecDeque<Submission>>>;

/// Submits work to a controller from any thread.
#[derive(Clone)]
pub struct ControllerHandle {
    queue: SharedQueue,
}

impl ControllerHandle {
    pub fn submit(&self, submission: Submission) {
        self.queue
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push_back(submission);
    }

    pub fn add_fuzz_job(&self, fuzzer: &str, priority: bool) {
        self.submit(Submission::Add {
            job: NewJob::Fuzz {
                fuzzer: fuzzer.to_string(),
            },
            priority,
        });
    }

    pub fn add_validate_job(&self, issue: Issue, priority: bool) {
        self.submit(Submission::Add {
            job: NewJob::Validate { issue },
            priority,
        });
    }

    pub fn add_reduce_job(&self, issue: Issue, priority: bool) {
        self.submit(Submission::Add {
            job: NewJob::Reduce { issue },
            priority,
        });
    }

    pub fn add_update_job(&self, sut: &str, priority: bool) {
        self.submit(Submission::Add {
            job: NewJob::Update { sut: sut.to_string() },
            priority,
        });
    }

    pub fn validate_all(&self, sut: Option<&str>) {
        self.submit(Submission::ValidateAll {
            sut: sut.map(str::to_string),
        });
    }

    pub fn reduce_all(&self, sut: Option<&str>) {
        self.submit(Submission::ReduceAll {
            sut: sut.map(str::to_string),
        });
    }

    pub fn cancel_job(&self, job_id: u64) {
        self.submit(Submission::Cancel { job_id });
    }

    pub fn stop(&self) {
        self.submit(Submission::Stop);
    }
}

struct QueuedJob {
    id: u64,
    spec: JobSpec,
    cost: usize,
}

struct RunningJob {
    spec: JobSpec,
    cost: usize,
    handle: Box<dyn WorkerHandle>,
}

/// Replaces `{uid}` with an identifier unique to this session.
fn expand_work_dir(template: &str) -> PathBuf {
    let uid = format!(
        "{}-{}",
        std::process::id(),
        chrono::Utc::now().format("%Y%m%d%H%M%S%f")
    );
    PathBuf::from(template.replace("{uid}", &uid))
}

pub struct Controller {
    config: Arc<Config>,
    config_toml: String,
    session: SessionSettings,
    capacity: usize,
    registry: Arc<Registry>,
    repository: Arc<dyn Repository>,
    listeners: Arc<ListenerManager>,
    launcher: Box<dyn Launcher>,
    work_root: PathBuf,
    fuzzers: Vec<String>,
    subconfigs: BTreeMap<String, String>,
    submissions: SharedQueue,
    job_queue: VecDeque<QueuedJob>,
    running: BTreeMap<u64, RunningJob>,
    load: usize,
    next_job_id: u64,
    fuzz_index: usize,
    cycle: u64,
    max_cycles: Option<u64>,
    poll: Duration,
    deliveries: Sender<Delivery>,
    inbox: Receiver<Delivery>,
    stopping: bool,
}

impl Controller {
    /// Prepares a session: opens the repository, registers the fuzz job
    /// configurations, and builds the listeners of `[listeners]`.
    ///
    /// Jobs run on threads until [`Controller::with_launcher`] says otherwise.
    pub fn new(config: Config, registry: Arc<Registry>) -> Result<Self, ControllerError> {
        let session = config.session()?;
        registry.check(&config)?;
        let capacity = session.cost_budget().max(1);
        let work_root = expand_work_dir(&session.work_dir);
        let repository = open_repository(
            &session.db_uri,
            Duration::from_millis(session.db_server_selection_timeout),
        )?;

        let fuzzers = config.fuzz_jobs();
        let mut subconfigs = BTreeMap::new();
        let mut fuzzer_configs = Vec::new();
        for fuzzer in &fuzzers {
            let section = format!("{FUZZ_PREFIX}{fuzzer}");
            let sut = config.require_str(&section, "sut")?;
            config.require_str(&section, "fuzzer")?;
            let (subconfig, projection) = config.fingerprint(fuzzer, &session.work_dir)?;
            subconfigs.insert(fuzzer.clone(), subconfig.clone());
            fuzzer_configs.push(FuzzerConfig {
                sut,
                fuzzer: fuzzer.clone(),
                subconfig,
                projection,
            });
        }
        repository.init(&fuzzer_configs)?;

        let listeners = Arc::new(ListenerManager::new());
        let build = BuildContext::new(&work_root);
        if let Some(section) = config.section(LISTENERS_SECTION) {
            for (option, value) in section {
                if value.is_str() {
                    listeners.add(registry.build_listener(&config, LISTENERS_SECTION, option, &build)?);
                }
            }
        }

        let launcher = Box::new(ThreadLauncher::new(registry.clone(), repository.clone()));
        let (deliveries, inbox) = mpsc::channel();
        Ok(Self {
            config_toml: config.to_toml_string(),
            config: Arc::new(config),
            session,
            capacity,
            registry,
            repository,
            listeners,
            launcher,
            work_root,
            fuzzers,
            subconfigs,
            submissions: SharedQueue::default(),
            job_queue: VecDeque::new(),
            running: BTreeMap::new(),
            load: 0,
            next_job_id: 1,
            fuzz_index: 0,
            cycle: 0,
            max_cycles: None,
            poll: DEFAULT_POLL,
            deliveries,
            inbox,
            stopping: false,
        })
    }

    /// Runs jobs through `launcher`. Worker processes cannot reach an
    /// in-memory repository, so that combination is refused.
    pub fn with_launcher(mut self, launcher: Box<dyn Launcher>) -> Result<Self, ControllerError> {
        if !launcher.in_process() && is_in_process(&self.session.db_uri) {
            return Err(ControllerError::InProcessRepository(self.session.db_uri.clone()));
        }
        self.launcher = launcher;
        Ok(self)
    }

    /// Stops scheduling fuzz jobs after `cycles` rounds over all of them.
    pub fn with_max_cycles(mut self, cycles: Option<u64>) -> Self {
        self.max_cycles = cycles;
        self
    }

    /// How long the loop sleeps when it has to wait.
    pub fn with_poll_interval(mut self, poll: Duration) -> Self {
        self.poll = poll;
        self
    }

    pub fn add_listener(&self, listener: Box<dyn Listener>) {
        self.listeners.add(listener);
    }

    pub fn handle(&self) -> ControllerHandle {
        ControllerHandle {
            queue: self.submissions.clone(),
        }
    }

    pub fn repository(&self) -> Arc<dyn Repository> {
        self.repository.clone()
    }

    pub fn work_root(&self) -> &Path {
        &self.work_root
    }

    /// Runs the session until the cycles are exhausted and all work is done,
    /// a stop is requested, or SIGINT arrives.
    ///
    /// Errors inside the loop are reported as warnings; the loop goes on.
    pub fn run(&mut self) -> Result<(), ControllerError> {
        std::fs::create_dir_all(&self.work_root)?;
        info!(
            work_dir = %self.work_root.display(),
            capacity = self.capacity,
            fuzz_jobs = self.fuzzers.len(),
            "session started"
        );
        loop {
            if process::interrupted() {
                info!("interrupted, shutting down");
                break;
            }
            match self.step() {
                Ok(true) => break,
                Ok(false) => {}
                Err(e) => {
                    error!(error = %e, "controller error");
                    self.listeners.emit(Event::Warning {
                        job_id: None,
                        message: e.to_string(),
                    });
                    self.receive(self.poll);
                }
            }
        }
        self.shutdown();
        Ok(())
    }

    /// One round of the main loop. Returns `true` when the session is over.
    fn step(&mut self) -> Result<bool, ControllerError> {
        self.receive(Duration::ZERO);
        self.drain_submissions()?;
        if self.stopping {
            return Ok(true);
        }

        if self.job_queue.is_empty() {
            self.schedule_fuzz_job()?;
        }

        match self.job_queue.front() {
            Some(head) if self.load + head.cost <= self.capacity => {
                if let Some(job) = self.job_queue.pop_front() {
                    self.start(job)?;
                }
                return Ok(false);
            }
            Some(_) => {}
            None => {
                let idle = self.running.is_empty() && self.submissions_pending() == 0;
                if idle && self.cycles_exhausted() {
                    return Ok(true);
                }
            }
        }
        self.receive(self.poll);
        Ok(false)
    }

    fn submissions_pending(&self) -> usize {
        self.submissions.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    /// True once no further fuzz job will be scheduled. Without a cycle
    /// limit the session runs until it is stopped.
    fn cycles_exhausted(&self) -> bool {
        self.max_cycles
            .is_some_and(|max| self.fuzzers.is_empty() || (self.cycle >= max && self.fuzz_index == 0))
    }

    fn drain_submissions(&mut self) -> Result<(), ControllerError> {
        let pending: Vec<Submission> = self
            .submissions
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .drain(..)
            .collect();
        for submission in pending {
            match submission {
                Submission::Add { job, priority } => self.add(job, priority)?,
                Submission::ValidateAll { sut } => self.validate_all(sut.as_deref())?,
                Submission::ReduceAll { sut } => self.reduce_all(sut.as_deref())?,
                Submission::Cancel { job_id } => self.cancel(job_id),
                Submission::Stop => self.stopping = true,
            }
        }
        Ok(())
    }

    fn add(&mut self, job: NewJob, priority: bool) -> Result<(), ControllerError> {
        let spec = match job {
            NewJob::Fuzz { fuzzer } => {
                let subconfig = self.subconfigs.get(&fuzzer).cloned().ok_or_else(|| ConfigError::MissingSection(format!("{FUZZ_PREFIX}{fuzzer}")))?;
                JobSpec::Fuzz { fuzzer, subconfig }
            }
            NewJob::Validate { issue } => JobSpec::Validate { issue },
            NewJob::Reduce { issue } => JobSpec::Reduce { issue },
            NewJob::Update { sut } => JobSpec::Update { sut },
        };
        self.enqueue(spec, priority)?;
        Ok(())
    }

    fn enqueue(&mut self, spec: JobSpec, priority: bool) -> Result<u64, ControllerError> {
        let cost = if priority {
            0
        } else {
            spec.cost(&self.config, self.capacity)?
        };
        let id = self.next_job_id;
        self.next_job_id += 1;
        debug!(job_id = id, kind = spec.kind(), cost, priority, "job queued");
        self.listeners.emit(spec.added_event(id, cost, &self.config));
        let job = QueuedJob { id, spec, cost };
        if priority {
            self.job_queue.push_front(job);
        } else {
            self.job_queue.push_back(job);
        }
        Ok(id)
    }

    /// Queues the next fuzz job in round-robin order, preceded by an update
    /// of its SUT if the SUT's update condition asks for one.
    fn schedule_fuzz_job(&mut self) -> Result<(), ControllerError> {
        for _ in 0..self.fuzzers.len() {
            if self.cycles_exhausted() {
                return Ok(());
            }
            let index = self.fuzz_index;
            if index == 0 {
                self.cycle += 1;
            }
            self.fuzz_index = (index + 1) % self.fuzzers.len();
            let fuzzer = self.fuzzers[index].clone();
            if !self.has_free_instance(&fuzzer)? {
                continue;
            }
            let sut = self.config.require_str(&format!("{FUZZ_PREFIX}{fuzzer}"), "sut")?;
            self.check_update(&sut)?;
            let subconfig = self.subconfigs.get(&fuzzer).cloned().unwrap_or_default();
            self.enqueue(JobSpec::Fuzz { fuzzer, subconfig }, false)?;
            return Ok(());
        }
        Ok(())
    }

    fn has_free_instance(&self, fuzzer: &str) -> Result<bool, ControllerError> {
        let instances = self
            .config
            .get_limit(&format!("{FUZZ_PREFIX}{fuzzer}"), "instances")?
            .unwrap_or(Limit::Infinite);
        let is_instance = |spec: &JobSpec| matches!(spec, JobSpec::Fuzz { fuzzer: f, .. } if f == fuzzer);
        let active = self.running.values().filter(|job| is_instance(&job.spec)).count()
            + self.job_queue.iter().filter(|job| is_instance(&job.spec)).count();
        Ok(instances.allows(active as u64))
    }

    fn check_update(&mut self, sut: &str) -> Result<(), ControllerError> {
        let section = format!("{SUT_PREFIX}{sut}");
        if !self.config.has_option(&section, "update") {
            return Ok(());
        }
        let build = BuildContext::new(&self.work_root);
        let Some(mut condition) = self
            .registry
            .build_update_condition(&self.config, &section, "update_condition", &build)?
        else {
            return Ok(());
        };
        let pending = self
            .running
            .values()
            .map(|job| &job.spec)
            .chain(self.job_queue.iter().map(|job| &job.spec))
            .any(|spec| matches!(spec, JobSpec::Update { sut: s } if s == sut));
        if pending {
            return Ok(());
        }
        match condition.should_update() {
            Ok(true) => {
                info!(%sut, "SUT needs an update");
                self.enqueue(JobSpec::Update { sut: sut.to_string() }, false)?;
            }
            Ok(false) => {}
            Err(e) => self.listeners.emit(Event::Warning {
                job_id: None,
                message: format!("Update condition of {sut} failed: {e}"),
            }),
        }
        Ok(())
    }

    fn start(&mut self, job: QueuedJob) -> Result<(), ControllerError> {
        let request = WorkerRequest {
            job_id: job.id,
            spec: job.spec.clone(),
            config: self.config_toml.clone(),
            db_uri: self.session.db_uri.clone(),
            db_timeout_ms: self.session.db_server_selection_timeout,
            work_dir: self.work_root.join(format!("job-{}", job.id)),
        };
        let handle = match self.launcher.launch(request, self.deliveries.clone()) {
            Ok(handle) => handle,
            Err(source) => {
                self.listeners.emit(Event::JobRemoved { job_id: job.id });
                return Err(ControllerError::Launch { job_id: job.id, source });
            }
        };
        debug!(job_id = job.id, kind = job.spec.kind(), cost = job.cost, "job started");
        self.load += job.cost;
        self.running.insert(
            job.id,
            RunningJob {
                spec: job.spec,
                cost: job.cost,
                handle,
            },
        );
        self.listeners.emit(Event::JobActivated { job_id: job.id });
        if job.cost > 0 {
            self.listeners.emit(Event::LoadUpdated { load: self.load });
        }
        Ok(())
    }

    fn cancel(&mut self, job_id: u64) {
        if let Some(job) = self.running.get_mut(&job_id) {
            info!(job_id, "cancelling running job");
            job.handle.kill();
        } else if let Some(position) = self.job_queue.iter().position(|job| job.id == job_id) {
            self.job_queue.remove(position);
            info!(job_id, "cancelled queued job");
            self.listeners.emit(Event::JobRemoved { job_id });
        } else {
            debug!(job_id, "cancel request for unknown job");
        }
    }

    /// Handles everything workers delivered, waiting up to `timeout` for the
    /// first delivery.
    fn receive(&mut self, timeout: Duration) {
        let first = if timeout.is_zero() {
            self.inbox.try_recv().ok()
        } else {
            self.inbox.recv_timeout(timeout).ok()
        };
        let Some(first) = first else {
            return;
        };
        self.deliver(first);
        while let Ok(next) = self.inbox.try_recv() {
            self.deliver(next);
        }
    }

    fn deliver(&mut self, delivery: Delivery) {
        match delivery {
            Delivery::Message {
                message: WorkerMessage::Event { event },
                ..
            } => self.listeners.emit(event),
            Delivery::Message {
                job_id,
                message: WorkerMessage::Finished { issues },
            } => {
                if let Err(e) = self.finished(job_id, issues) {
                    warn!(job_id, error = %e, "failed to schedule follow-up jobs");
                    self.listeners.emit(Event::Warning {
                        job_id: Some(job_id),
                        message: e.to_string(),
                    });
                }
            }
            Delivery::Message {
                job_id,
                message: WorkerMessage::Failed { message },
            } => debug!(job_id, "worker failed: {message}"),
            Delivery::Closed { job_id } => {
                if let Some(job) = self.running.remove(&job_id) {
                    self.load -= job.cost;
                    debug!(job_id, load = self.load, "job removed");
                    self.listeners.emit(Event::JobRemoved { job_id });
                    if job.cost > 0 {
                        self.listeners.emit(Event::LoadUpdated { load: self.load });
                    }
                }
            }
        }
    }

    fn finished(&mut self, job_id: u64, issues: Vec<Issue>) -> Result<(), ControllerError> {
        for found in issues {
            self.follow_up(found)?;
        }
        let updated = match self.running.get(&job_id).map(|job| &job.spec) {
            Some(JobSpec::Update { sut }) => Some(sut.clone()),
            _ => None,
        };
        if let Some(sut) = updated {
            let section = format!("{SUT_PREFIX}{sut}");
            let validate = self
                .config
                .get_bool(&section, "validate_after_update")?
                .unwrap_or(self.session.validate_after_update);
            if validate {
                self.validate_all(Some(&sut))?;
            }
        }
        Ok(())
    }

    /// Reduces a new issue if its SUT has a reducer, validates it otherwise.
    fn follow_up(&mut self, found: Issue) -> Result<(), ControllerError> {
        let sut = found.sut().unwrap_or_default().into_owned();
        if self.config.has_option(&format!("{SUT_PREFIX}{sut}"), "reduce") {
            self.enqueue(JobSpec::Reduce { issue: found }, false)?;
        } else {
            self.enqueue(JobSpec::Validate { issue: found }, false)?;
        }
        Ok(())
    }

    fn issues_of(&self, sut: Option<&str>) -> Result<Vec<Issue>, ControllerError> {
        let suts = match sut {
            Some(sut) => vec![sut.to_string()],
            None => self.config.suts(),
        };
        Ok(self
            .repository
            .find_issues_by_suts(&suts)?
            .into_iter()
            .filter(|found| !found.has(issue::INVALID))
            .collect())
    }

    fn validate_all(&mut self, sut: Option<&str>) -> Result<(), ControllerError> {
        for found in self.issues_of(sut)? {
            self.enqueue(JobSpec::Validate { issue: found }, false)?;
        }
        Ok(())
    }

    fn reduce_all(&mut self, sut: Option<&str>) -> Result<(), ControllerError> {
        for found in self.issues_of(sut)? {
            let reported = found.get(issue::REPORTED).is_some_and(Value::is_truthy);
            let section = format!("{SUT_PREFIX}{}", found.sut().unwrap_or_default());
            if reported || found.has(issue::REDUCED) || !self.config.has_option(&section, "reduce") {
                continue;
            }
            self.enqueue(JobSpec::Reduce { issue: found }, false)?;
        }
        Ok(())
    }

    /// Stops running workers if needed, waits for them to close, and removes
    /// the session's work directory.
    fn shutdown(&mut self) {
        let interrupted = process::interrupted();
        if interrupted || self.stopping {
            for job in self.running.values_mut() {
                job.handle.kill();
            }
        }
        if interrupted {
            process::kill_process_tree(std::process::id(), false);
        }
        let deadline = Instant::now() + SHUTDOWN_GRACE;
        while !self.running.is_empty() && Instant::now() < deadline {
            self.receive(self.poll);
        }
        if !self.running.is_empty() {
            warn!(jobs = self.running.len(), "workers did not finish in time");
        }
        if let Err(e) = std::fs::remove_dir_all(&self.work_root)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(path = %self.work_root.display(), error = %e, "failed to remove work directory");
        }
        info!("session finished");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::{Call, CallError, CallInput, FnCall};
    use crate::issue::Outcome;
    use crate::repository::IssueQuery;

    type Log = Arc<Mutex<Vec<String>>>;

    /// Records the notifications the tests look at.
    struct Recorder(Log);

    impl Recorder {
        fn push(&self, entry: String) {
            self.0.lock().unwrap().push(entry);
        }
    }

    impl Listener for Recorder {
        fn on_load_updated(&mut self, load: usize) -> anyhow::Result<()> {
            self.push(format!("load {load}"));
            Ok(())
        }

        fn on_fuzz_job_added(&mut self, job_id: u64, _: usize, sut: &str, _: &str, _: Option<u64>) -> anyhow::Result<()> {
            self.push(format!("fuzz {job_id} {sut}"));
            Ok(())
        }

        fn on_validate_job_added(&mut self, job_id: u64, _: usize, _: &str, _: &str, _: &str) -> anyhow::Result<()> {
            self.push(format!("validate {job_id}"));
            Ok(())
        }

        fn on_job_activated(&mut self, job_id: u64) -> anyhow::Result<()> {
            self.push(format!("activated {job_id}"));
            Ok(())
        }

        fn on_job_removed(&mut self, job_id: u64) -> anyhow::Result<()> {
            self.push(format!("removed {job_id}"));
            Ok(())
        }

        fn on_issue_added(&mut self, _: u64, _: &Issue) -> anyhow::Result<()> {
            self.push("issue added".to_string());
            Ok(())
        }

        fn on_issue_invalidated(&mut self, _: u64, issue: &Issue) -> anyhow::Result<()> {
            self.push(format!("invalidated {}", issue.id().unwrap_or_default()));
            Ok(())
        }
    }

    /// `Timed` sleeps `millis` per test and logs when it starts and ends;
    /// it fails on every test if `crash` is set.
    fn registry(log: &Log) -> Arc<Registry> {
        let mut registry = Registry::with_builtins();
        let log = log.clone();
        registry.register_call("Timed", move |options, _| {
            let name = options.get("name").and_then(|v| v.as_str()).unwrap_or("?").to_string();
            let millis = options.get("millis").and_then(|v| v.as_integer()).unwrap_or(0) as u64;
            let crash = options.get("crash").and_then(|v| v.as_bool()).unwrap_or(false);
            let log = log.clone();
            Ok(Box::new(FnCall(move |_: CallInput| -> Result<Outcome, CallError> {
                log.lock().unwrap().push(format!("start {name}"));
                std::thread::sleep(Duration::from_millis(millis));
                log.lock().unwrap().push(format!("end {name}"));
                Ok(if crash {
                    Outcome::Issue(Issue::new())
                } else {
                    Outcome::NonIssue(Issue::new())
                })
            })) as Box<dyn Call>)
        });
        Arc::new(registry)
    }

    fn controller(body: &str, log: &Log, events: &Log) -> (Controller, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = format!(
            "[fuzzinator]\nwork_dir = {:?}\ndb_uri = \"memory:\"\n{body}",
            dir.path().join("work-{uid}").display().to_string()
        );
        let controller = Controller::new(Config::from_toml_str(&config).unwrap(), registry(log))
            .unwrap()
            .with_poll_interval(Duration::from_millis(20));
        controller.add_listener(Box::new(Recorder(events.clone())));
        (controller, dir)
    }

    fn entries(log: &Log) -> Vec<String> {
        log.lock().unwrap().clone()
    }

    #[test]
    fn test_cost_budget_serializes_expensive_jobs() {
        let (log, events) = (Log::default(), Log::default());
        let body = r#"
cost_budget = 2

[sut.x]
call = "Timed"
cost = 2
["sut.x.call"]
name = "x"
millis = 100

[sut.y]
call = "Timed"
["sut.y.call"]
name = "y"
millis = 100

[fuzz.fx]
sut = "x"
fuzzer = "RandomContent"

[fuzz.fy]
sut = "y"
fuzzer = "RandomContent"
"#;
        let (controller, dir) = controller(body, &log, &events);
        let work_root = controller.work_root().to_path_buf();
        let mut controller = controller.with_max_cycles(Some(1));
        controller.run().unwrap();

        assert_eq!(entries(&log), vec!["start x", "end x", "start y", "end y"]);
        let events = entries(&events);
        assert!(events.contains(&"removed 1".to_string()) && events.contains(&"removed 2".to_string()));
        for load in events.iter().filter_map(|e| e.strip_prefix("load ")) {
            assert!(load.parse::<usize>().unwrap() <= 2, "Load stays within budget: {events:?}");
        }
        assert_eq!(events.last().map(String::as_str), Some("load 0"));
        assert!(!work_root.exists(), "Work directory is removed");
        drop(dir);
    }

    #[test]
    fn test_new_issue_is_validated() {
        let (log, events) = (Log::default(), Log::default());
        let body = r#"
[sut.x]
call = "Timed"
["sut.x.call"]
name = "x"
crash = true

[fuzz.fx]
sut = "x"
fuzzer = "RandomContent"
"#;
        let (controller, _dir) = controller(body, &log, &events);
        let repository = controller.repository();
        let mut controller = controller.with_max_cycles(Some(1));
        controller.run().unwrap();

        let events = entries(&events);
        let position = |entry: &str| events.iter().position(|e| e == entry);
        assert!(position("issue added") < position("validate 2"), "{events:?}");
        assert!(position("validate 2") < position("activated 2"));
        assert!(position("removed 1").is_some() && position("removed 2").is_some());
        let issues = repository.get_issues(&IssueQuery::detailed()).unwrap();
        assert_eq!(issues.len(), 1);
        assert!(!issues[0].has(issue::INVALID), "Validation reproduced the issue");
    }

    #[test]
    fn test_validate_all_invalidates_vanished_issues() {
        let (log, events) = (Log::default(), Log::default());
        let body = "[sut.x]\ncall = \"Timed\"\n";
        let (controller, _dir) = controller(body, &log, &events);
        let repository = controller.repository();
        let mut old = Issue::new()
            .with(issue::ID, "old")
            .with(issue::SUT, "x")
            .with(issue::TEST, b"t".to_vec());
        repository.add_issue(&mut old).unwrap();

        let handle = controller.handle();
        handle.validate_all(None);
        let mut controller = controller.with_max_cycles(Some(0));
        controller.run().unwrap();

        let events = entries(&events);
        assert_eq!(events.iter().filter(|e| *e == "invalidated old").count(), 1, "{events:?}");
        let stored = repository.find_issue_by_oid(&old.oid().unwrap()).unwrap().unwrap();
        assert!(stored.has(issue::INVALID));
    }

    #[test]
    fn test_cancel_running_job_frees_the_scheduler() {
        let (log, events) = (Log::default(), Log::default());
        let body = r#"
cost_budget = 1

[sut.x]
call = "Timed"
["sut.x.call"]
name = "x"
millis = 10

[fuzz.fx]
sut = "x"
fuzzer = "RandomContent"
batch = inf
"#;
        let (controller, _dir) = controller(body, &log, &events);
        let handle = controller.handle();
        let mut controller = controller;
        let session = std::thread::spawn(move || controller.run());

        let wait_for = |entry: &str| {
            let deadline = Instant::now() + Duration::from_secs(10);
            while !entries(&events).iter().any(|e| e == entry) {
                assert!(Instant::now() < deadline, "Timed out waiting for '{entry}'");
                std::thread::sleep(Duration::from_millis(10));
            }
        };
        wait_for("activated 1");
        let cancelled = Instant::now();
        handle.cancel_job(1);
        wait_for("removed 1");
        assert!(cancelled.elapsed() < Duration::from_secs(2));
        wait_for("activated 2");

        handle.stop();
        session.join().unwrap().unwrap();
        assert!(entries(&events).contains(&"removed 2".to_string()));
    }

    #[test]
    fn test_cancel_queued_job() {
        let (log, events) = (Log::default(), Log::default());
        let (mut controller, _dir) = controller("[sut.x]\ncall = \"Timed\"\n", &log, &events);
        let id = controller
            .enqueue(JobSpec::Update { sut: "x".into() }, false)
            .unwrap();
        controller.cancel(id);
        assert!(controller.job_queue.is_empty());
        assert!(entries(&events).contains(&format!("removed {id}")));
    }

    #[test]
    fn test_priority_jobs_jump_the_queue_for_free() {
        let (log, events) = (Log::default(), Log::default());
        let (mut controller, _dir) = controller("[sut.x]\ncall = \"Timed\"\ncost = 1\n", &log, &events);
        let issue = Issue::new().with(issue::SUT, "x").with(issue::ID, "a");
        controller.enqueue(JobSpec::Validate { issue: issue.clone() }, false).unwrap();
        let urgent = controller.enqueue(JobSpec::Validate { issue }, true).unwrap();
        let head = controller.job_queue.front().unwrap();
        assert_eq!((head.id, head.cost), (urgent, 0));
        assert_eq!(controller.job_queue.back().unwrap().cost, 1);
    }

    #[test]
    fn test_instances_cap() {
        let (log, events) = (Log::default(), Log::default());
        let body = "[sut.x]\ncall = \"Timed\"\n\n[fuzz.fx]\nsut = \"x\"\nfuzzer = \"RandomContent\"\ninstances = 1\n";
        let (mut controller, _dir) = controller(body, &log, &events);
        controller.schedule_fuzz_job().unwrap();
        controller.schedule_fuzz_job().unwrap();
        assert_eq!(controller.job_queue.len(), 1, "Second instance is not allowed");
    }

    #[test]
    fn test_memory_repository_needs_thread_workers() {
        let (log, events) = (Log::default(), Log::default());
        let (controller, _dir) = controller("[sut.x]\ncall = \"Timed\"\n", &log, &events);
        let launcher = crate::worker::ProcessLauncher::new("/bin/false", Vec::new());
        assert!(matches!(
            controller.with_launcher(Box::new(launcher)),
            Err(ControllerError::InProcessRepository(_))
        ));
    }
}
